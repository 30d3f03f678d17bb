//! Sleep-session segmentation
//!
//! Turns a combined-occupancy series into [`SleepRecord`]s: present runs are
//! merged across short absences and a session is kept only when it
//! accumulates enough time in bed.

use log::{debug, info};

use crate::config::SleepConfig;
use crate::types::{epoch_to_utc, Interval, OccupancySample, Side, SleepRecord};

/// Present and absent runs of an occupancy series
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceIntervals {
    pub present: Vec<Interval>,
    pub not_present: Vec<Interval>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Session {
    start: Interval,
    end: Interval,
    present_seconds: i64,
    exits: u32,
}

#[derive(Debug, Clone)]
pub struct SleepSessionBuilder {
    config: SleepConfig,
}

impl SleepSessionBuilder {
    pub fn new(config: SleepConfig) -> Self {
        Self { config }
    }

    /// Build sleep records for `side` from a series sorted by timestamp
    pub fn build(&self, side: Side, series: &[OccupancySample]) -> Vec<SleepRecord> {
        let intervals = self.presence_intervals(series);
        debug!(
            "{} side: {} present and {} absent intervals",
            side,
            intervals.present.len(),
            intervals.not_present.len()
        );

        let records: Vec<SleepRecord> = self
            .merge_sessions(&intervals.present)
            .into_iter()
            .map(|session| {
                let entered = session.start.start;
                let left = session.end.end;
                SleepRecord {
                    side,
                    entered_bed_at: entered,
                    left_bed_at: left,
                    sleep_period_seconds: session.present_seconds,
                    times_exited_bed: session.exits,
                    present_intervals: clip_intervals(&intervals.present, entered, left),
                    not_present_intervals: clip_intervals(&intervals.not_present, entered, left),
                }
            })
            .collect();

        for record in &records {
            info!(
                "{} side slept {} -> {} ({} s, {} exits)",
                side,
                record.entered_bed_at,
                record.left_bed_at,
                record.sleep_period_seconds,
                record.times_exited_bed
            );
        }
        records
    }

    /// Run-length encode the series. A run ends at the timestamp where the
    /// next run starts; the last run ends at the last sample.
    pub fn presence_intervals(&self, series: &[OccupancySample]) -> PresenceIntervals {
        let mut intervals = PresenceIntervals::default();
        let Some(first) = series.first() else {
            return intervals;
        };

        let mut run_start = first.ts;
        let mut run_present = first.occupied();
        for sample in &series[1..] {
            if sample.occupied() != run_present {
                self.close_run(&mut intervals, run_present, run_start, sample.ts);
                run_start = sample.ts;
                run_present = sample.occupied();
            }
        }
        let last_ts = series.last().map_or(run_start, |s| s.ts);
        self.close_run(&mut intervals, run_present, run_start, last_ts);

        intervals
    }

    fn close_run(&self, intervals: &mut PresenceIntervals, present: bool, start: i64, end: i64) {
        let interval = Interval {
            start: epoch_to_utc(start),
            end: epoch_to_utc(end),
        };
        if !present {
            intervals.not_present.push(interval);
        } else if end - start >= self.config.presence_duration_threshold_seconds {
            intervals.present.push(interval);
        }
    }

    fn merge_sessions(&self, present: &[Interval]) -> Vec<Session> {
        let mut sessions = Vec::new();
        let Some(&first) = present.first() else {
            return sessions;
        };

        let mut current = Session {
            start: first,
            end: first,
            present_seconds: first.duration_seconds(),
            exits: 0,
        };
        for &next in &present[1..] {
            let gap = (next.start - current.end.end).num_seconds();
            if gap <= self.config.max_gap_seconds {
                current.end = next;
                current.present_seconds += next.duration_seconds();
                current.exits += 1;
            } else {
                self.keep_if_long(&mut sessions, current);
                current = Session {
                    start: next,
                    end: next,
                    present_seconds: next.duration_seconds(),
                    exits: 0,
                };
            }
        }
        self.keep_if_long(&mut sessions, current);
        sessions
    }

    fn keep_if_long(&self, sessions: &mut Vec<Session>, session: Session) {
        if session.present_seconds > self.config.min_sleep_seconds {
            sessions.push(session);
        } else {
            debug!(
                "discarding {} s session starting {}",
                session.present_seconds, session.start.start
            );
        }
    }
}

/// Intervals overlapping `[start, end]`, clipped to it
fn clip_intervals(
    intervals: &[Interval],
    start: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
) -> Vec<Interval> {
    intervals
        .iter()
        .filter(|i| i.end > start && i.start < end)
        .map(|i| Interval {
            start: i.start.max(start),
            end: i.end.min(end),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HOUR: i64 = 3600;

    /// One sample per minute; each segment is (seconds, occupied)
    fn make_series(segments: &[(i64, bool)]) -> Vec<OccupancySample> {
        let mut series = Vec::new();
        let mut ts = 1_700_000_000;
        for &(seconds, occupied) in segments {
            let end = ts + seconds;
            while ts < end {
                series.push(OccupancySample {
                    ts,
                    occupancy: if occupied { 2 } else { 1 },
                });
                ts += 60;
            }
        }
        series.push(OccupancySample { ts, occupancy: 0 });
        series
    }

    fn make_builder() -> SleepSessionBuilder {
        SleepSessionBuilder::new(SleepConfig::default())
    }

    #[test]
    fn test_single_four_hour_session() {
        let series = make_series(&[(600, false), (4 * HOUR, true), (600, false)]);
        let records = make_builder().build(Side::Left, &series);

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.sleep_period_seconds, 14_400);
        assert_eq!(record.times_exited_bed, 0);
        assert_eq!(record.entered_bed_at, epoch_to_utc(1_700_000_600));
        assert_eq!(record.present_intervals.len(), 1);
        assert!(record.not_present_intervals.is_empty());
    }

    #[test]
    fn test_short_exit_is_merged() {
        let series = make_series(&[(2 * HOUR, true), (600, false), (2 * HOUR, true)]);
        let records = make_builder().build(Side::Right, &series);

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.side, Side::Right);
        assert_eq!(record.sleep_period_seconds, 14_400);
        assert_eq!(record.times_exited_bed, 1);
        assert_eq!(
            (record.left_bed_at - record.entered_bed_at).num_seconds(),
            4 * HOUR + 600
        );
        assert_eq!(record.present_intervals.len(), 2);
        assert_eq!(record.not_present_intervals.len(), 1);
        assert_eq!(record.not_present_intervals[0].duration_seconds(), 600);
    }

    #[test]
    fn test_long_gap_splits_short_sessions() {
        let series = make_series(&[(2 * HOUR, true), (1200, false), (2 * HOUR, true)]);
        assert!(make_builder().build(Side::Left, &series).is_empty());
    }

    #[test]
    fn test_empty_series() {
        assert!(make_builder().build(Side::Left, &[]).is_empty());
        assert_eq!(
            make_builder().presence_intervals(&[]),
            PresenceIntervals::default()
        );
    }

    #[test]
    fn test_brief_presence_is_ignored() {
        let builder = make_builder();
        let series = make_series(&[(HOUR, false), (60, true), (HOUR, false)]);
        let intervals = builder.presence_intervals(&series);
        assert_eq!(intervals.present.len(), 1);

        // shift the lone occupied sample so its run lasts 30 s
        let series = make_series(&[(HOUR, false), (60, true), (HOUR, false)]);
        let series: Vec<OccupancySample> = series
            .into_iter()
            .map(|mut s| {
                if s.occupied() {
                    s.ts += 30;
                }
                s
            })
            .collect();
        assert!(builder.presence_intervals(&series).present.is_empty());
    }
}
