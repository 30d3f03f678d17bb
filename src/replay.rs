//! Historical vitals replay
//!
//! Sweeps a recorded range for one side with a sliding window, estimating
//! heart rate, HRV and breathing per window with the same fusion and adaptive
//! bounds as the live tracker. The per-window series is then cleaned,
//! smoothed and averaged into fixed time buckets.

use std::collections::BTreeMap;

use log::{debug, info};
use serde::Serialize;

use crate::breathing::BreathingEstimator;
use crate::buffer::{BoundedHistory, PiezoChannel};
use crate::conditioner::SignalConditioner;
use crate::config::{ConditionerConfig, EngineConfig, ReplayConfig};
use crate::context::EngineContext;
use crate::error::{EngineError, SignalError, SignalResult};
use crate::peaks::PeakEngine;
use crate::tracker::AdaptiveBounds;
use crate::types::{SensorFrame, Side, SideSamples, VitalsRecord};

/// Smoothing applied after the sweep: (window, min_periods)
const BREATH_FILL_ROLLING: (usize, usize) = (3, 1);
const HRV_FILL_ROLLING: (usize, usize) = (30, 10);
const HEART_RATE_ROLLING: (usize, usize) = (15, 5);
const SLOW_ROLLING: (usize, usize) = (40, 10);

/// Counters for one replay run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub total_windows: u64,
    /// Windows where a channel produced no measurement, per channel
    pub channel_errors: [u64; 2],
    /// Windows where a channel's heart rate failed validation, per channel
    pub channel_drops: [u64; 2],
    /// Rejections caused by the adaptive percentile bounds
    pub dropped_from_percentile: u64,
    /// Windows that produced a fused estimate
    pub predicted: u64,
}

/// Fused estimate for one sweep window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowEstimate {
    pub start_ts: i64,
    pub end_ts: i64,
    pub heart_rate: f64,
    pub hrv: Option<f64>,
    pub breathing_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayOutput {
    pub side: Side,
    pub windows: Vec<WindowEstimate>,
    pub records: Vec<VitalsRecord>,
    pub stats: ReplayStats,
}

#[derive(Debug, Clone, Copy)]
struct ChannelEstimate {
    bpm: f64,
    sdnn: f64,
    breathing_rate: Option<f64>,
}

/// Sliding-window vitals estimator for one side
pub struct ReplayProcessor {
    side: Side,
    config: ReplayConfig,
    conditioner: SignalConditioner,
    engine: PeakEngine,
    breathing: BreathingEstimator,
    bounds: AdaptiveBounds,
    heart_rates: BoundedHistory,
}

impl ReplayProcessor {
    pub fn new(side: Side, config: &EngineConfig) -> SignalResult<Self> {
        let replay = &config.replay;
        let conditioner = SignalConditioner::new(&ConditionerConfig {
            signal_percentile: replay.signal_percentile,
            ..config.conditioner.clone()
        })?;

        Ok(Self {
            side,
            config: replay.clone(),
            conditioner,
            engine: PeakEngine::new(&config.peaks),
            breathing: BreathingEstimator::new(&config.breathing)?,
            bounds: AdaptiveBounds::new(
                replay.hr_percentile,
                replay.hr_std_range,
                config.tracker.min_bound_width,
                config.tracker.max_heart_rate,
            ),
            heart_rates: BoundedHistory::new(replay.moving_avg_size),
        })
    }

    /// Sweep `frames` and return per-window estimates plus bucketed records.
    ///
    /// Only full windows are estimated: the sweep stops once a window would
    /// extend past the last recorded second.
    pub fn run(&mut self, frames: &[SensorFrame]) -> ReplayOutput {
        let seconds = side_samples(self.side, frames);
        let mut stats = ReplayStats::default();
        let mut windows = Vec::new();

        let (Some(&first), Some(&last)) = (seconds.keys().next(), seconds.keys().next_back()) else {
            return ReplayOutput {
                side: self.side,
                windows,
                records: Vec::new(),
                stats,
            };
        };
        let dual = seconds.values().all(|s| s.secondary.is_some());
        let width = self.config.window_seconds as i64;
        let step = self.config.slide_by_seconds.max(1) as i64;

        let mut start = first;
        while start + width <= last + 1 {
            let end = start + width;
            stats.total_windows += 1;

            let frames_in_window: Vec<&SideSamples> = seconds.range(start..end).map(|(_, s)| s).collect();
            let first_estimate = self.channel(&frames_in_window, PiezoChannel::Primary, &mut stats);
            let second_estimate = if dual {
                self.channel(&frames_in_window, PiezoChannel::Secondary, &mut stats)
            } else {
                None
            };

            let fused = self.bounds.fuse(
                first_estimate.map(|e| e.bpm),
                second_estimate.map(|e| e.bpm),
            );
            if let Some(heart_rate) = fused {
                let valid: Vec<ChannelEstimate> =
                    first_estimate.into_iter().chain(second_estimate).collect();
                windows.push(WindowEstimate {
                    start_ts: start,
                    end_ts: end,
                    heart_rate,
                    hrv: mean_of(valid.iter().map(|e| Some(e.sdnn))),
                    breathing_rate: mean_of(valid.iter().map(|e| e.breathing_rate)),
                });
                self.heart_rates.push(heart_rate);
                stats.predicted += 1;
            }

            self.bounds.update(&self.heart_rates);
            start += step;
        }

        info!(
            "{} side replay: {}/{} windows predicted, errors {:?}, drops {:?}, percentile drops {}",
            self.side,
            stats.predicted,
            stats.total_windows,
            stats.channel_errors,
            stats.channel_drops,
            stats.dropped_from_percentile
        );

        let records = smooth_and_bucket(self.side, &windows, &self.config);
        ReplayOutput {
            side: self.side,
            windows,
            records,
            stats,
        }
    }

    fn channel(
        &self,
        frames: &[&SideSamples],
        channel: PiezoChannel,
        stats: &mut ReplayStats,
    ) -> Option<ChannelEstimate> {
        let index = usize::from(channel.number() - 1);
        let estimate = match self.measure(frames, channel) {
            Ok(estimate) => estimate,
            Err(err) => {
                stats.channel_errors[index] += 1;
                debug!("{} channel {}: {}", self.side, channel.number(), err);
                return None;
            }
        };

        if self.bounds.is_valid(estimate.bpm) {
            return Some(estimate);
        }
        stats.channel_drops[index] += 1;
        if self.bounds.is_outside_bounds(estimate.bpm) {
            stats.dropped_from_percentile += 1;
        }
        None
    }

    fn measure(&self, frames: &[&SideSamples], channel: PiezoChannel) -> SignalResult<ChannelEstimate> {
        let mut raw = Vec::new();
        for frame in frames {
            let chunk = match channel {
                PiezoChannel::Primary => Some(&frame.primary),
                PiezoChannel::Secondary => frame.secondary.as_ref(),
            };
            if let Some(chunk) = chunk {
                raw.extend_from_slice(chunk);
            }
        }
        if raw.is_empty() {
            return Err(SignalError::InsufficientData("no samples in window".to_string()));
        }

        let cleaned = self.conditioner.condition(&raw);
        let (working, measurement) = self.engine.process(&cleaned)?;
        Ok(ChannelEstimate {
            bpm: measurement.bpm,
            sdnn: measurement.sdnn,
            breathing_rate: self.breathing.estimate_rate(&working.rr_corrected),
        })
    }
}

/// One side's piezo seconds keyed by timestamp
fn side_samples(side: Side, frames: &[SensorFrame]) -> BTreeMap<i64, SideSamples> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            SensorFrame::Piezo(piezo) => {
                let (left, right) = piezo.clone().into_sides();
                Some(match side {
                    Side::Left => left,
                    Side::Right => right,
                })
            }
            SensorFrame::Cap(_) => None,
        })
        .map(|samples| (samples.ts, samples))
        .collect()
}

fn mean_of(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let present: Vec<f64> = values.flatten().filter(|v| v.is_finite()).collect();
    if present.is_empty() {
        None
    } else {
        Some(present.iter().sum::<f64>() / present.len() as f64)
    }
}

/// Replace values outside `[low, high]` with `None`
pub fn keep_in_range(values: &[Option<f64>], (low, high): (f64, f64)) -> Vec<Option<f64>> {
    values
        .iter()
        .map(|v| v.filter(|x| (low..=high).contains(x)))
        .collect()
}

/// Linear interpolation over gaps by position. Gaps after the last value
/// repeat it; gaps before the first value stay empty.
pub fn interpolate_gaps(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut out = values.to_vec();
    let mut previous: Option<(usize, f64)> = None;
    for i in 0..values.len() {
        let Some(value) = values[i] else {
            continue;
        };
        if let Some((j, before)) = previous {
            let span = (i - j) as f64;
            for (k, slot) in out.iter_mut().enumerate().take(i).skip(j + 1) {
                *slot = Some(before + (value - before) * (k - j) as f64 / span);
            }
        }
        previous = Some((i, value));
    }
    if let Some((j, last)) = previous {
        for slot in out.iter_mut().skip(j + 1) {
            *slot = Some(last);
        }
    }
    out
}

/// Trailing mean over `window` positions, ignoring gaps; `None` where fewer
/// than `min_periods` values are present
pub fn rolling_mean(values: &[Option<f64>], window: usize, min_periods: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            let start = (i + 1).saturating_sub(window);
            let present: Vec<f64> = values[start..=i].iter().flatten().copied().collect();
            if present.is_empty() || present.len() < min_periods {
                None
            } else {
                Some(present.iter().sum::<f64>() / present.len() as f64)
            }
        })
        .collect()
}

/// Clean and smooth the per-window series, then average it into buckets.
///
/// Buckets without a heart rate are dropped.
pub fn smooth_and_bucket(side: Side, windows: &[WindowEstimate], config: &ReplayConfig) -> Vec<VitalsRecord> {
    let heart: Vec<Option<f64>> = windows.iter().map(|w| Some(w.heart_rate)).collect();
    let hrv: Vec<Option<f64>> = windows.iter().map(|w| w.hrv).collect();
    let breath: Vec<Option<f64>> = windows.iter().map(|w| w.breathing_rate).collect();

    let breath = interpolate_gaps(&keep_in_range(&breath, config.breath_valid_range));
    let breath = rolling_mean(&breath, BREATH_FILL_ROLLING.0, BREATH_FILL_ROLLING.1);
    let hrv = interpolate_gaps(&keep_in_range(&hrv, config.hrv_valid_range));
    let hrv = rolling_mean(&hrv, HRV_FILL_ROLLING.0, HRV_FILL_ROLLING.1);

    let heart = rolling_mean(&heart, HEART_RATE_ROLLING.0, HEART_RATE_ROLLING.1);
    let breath = rolling_mean(&breath, SLOW_ROLLING.0, SLOW_ROLLING.1);
    let hrv = rolling_mean(&hrv, SLOW_ROLLING.0, SLOW_ROLLING.1);

    let bucket = config.bucket_seconds.max(1);
    let mut buckets: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (i, window) in windows.iter().enumerate() {
        let key = window.start_ts - window.start_ts.rem_euclid(bucket);
        buckets.entry(key).or_default().push(i);
    }

    buckets
        .into_iter()
        .filter_map(|(timestamp, rows)| {
            let heart_rate = mean_of(rows.iter().map(|&i| heart[i]))?;
            Some(VitalsRecord {
                side,
                timestamp,
                heart_rate,
                hrv: mean_of(rows.iter().map(|&i| hrv[i])),
                breathing_rate: mean_of(rows.iter().map(|&i| breath[i])),
            })
        })
        .collect()
}

/// Replay `frames` for `side` and write the bucketed records to the vitals sink
pub fn replay_vitals(
    context: &EngineContext,
    side: Side,
    frames: &[SensorFrame],
) -> Result<ReplayOutput, EngineError> {
    let mut processor = ReplayProcessor::new(side, &context.config)?;
    let output = processor.run(frames);

    let mut written = 0;
    for record in &output.records {
        if context.vitals.insert(record)? {
            written += 1;
        }
    }
    info!(
        "{} side replay wrote {} of {} records",
        side,
        written,
        output.records.len()
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PiezoFrame;
    use pretty_assertions::assert_eq;
    use std::f64::consts::PI;

    const SAMPLE_RATE: usize = 500;
    const START_TS: i64 = 1_700_000_040;

    /// Gaussian beats about once a second on channel 1 of the left side
    fn make_frames(seconds: usize) -> Vec<SensorFrame> {
        let n = seconds * SAMPLE_RATE;
        let mut signal = vec![0.0; n];
        let sigma = 0.03 * SAMPLE_RATE as f64;
        let mut t = 0.5;
        while t < seconds as f64 {
            let center = t * SAMPLE_RATE as f64;
            let lo = (center - 6.0 * sigma).max(0.0) as usize;
            let hi = ((center + 6.0 * sigma) as usize).min(n - 1);
            for (i, value) in signal.iter_mut().enumerate().take(hi + 1).skip(lo) {
                let d = i as f64 - center;
                *value += 300_000.0 * (-(d * d) / (2.0 * sigma * sigma)).exp();
            }
            t += 1.0 + 0.05 * (2.0 * PI * 0.25 * t).sin();
        }

        signal
            .chunks(SAMPLE_RATE)
            .enumerate()
            .map(|(i, chunk)| {
                SensorFrame::Piezo(PiezoFrame {
                    ts: START_TS + i as i64,
                    freq: SAMPLE_RATE as u32,
                    adc: 1,
                    gain: 400,
                    left1: chunk.iter().map(|v| *v as i32).collect(),
                    left2: None,
                    right1: vec![0; SAMPLE_RATE],
                    right2: None,
                    seq: i as u64,
                })
            })
            .collect()
    }

    fn make_window(start_ts: i64, heart_rate: f64) -> WindowEstimate {
        WindowEstimate {
            start_ts,
            end_ts: start_ts + 10,
            heart_rate,
            hrv: Some(40.0),
            breathing_rate: Some(15.0),
        }
    }

    #[test]
    fn test_interpolate_gaps() {
        let values = [None, Some(1.0), None, None, Some(4.0), None];
        assert_eq!(
            interpolate_gaps(&values),
            vec![None, Some(1.0), Some(2.0), Some(3.0), Some(4.0), Some(4.0)]
        );
    }

    #[test]
    fn test_rolling_mean_min_periods() {
        let values = [Some(1.0), None, Some(3.0), Some(5.0)];
        assert_eq!(
            rolling_mean(&values, 3, 2),
            vec![None, None, Some(2.0), Some(4.0)]
        );
        assert_eq!(rolling_mean(&values, 2, 1)[1], Some(1.0));
    }

    #[test]
    fn test_keep_in_range() {
        let values = [Some(9.0), Some(10.0), Some(23.0), Some(24.0), None];
        assert_eq!(
            keep_in_range(&values, (10.0, 23.0)),
            vec![None, Some(10.0), Some(23.0), None, None]
        );
    }

    #[test]
    fn test_buckets_floor_to_three_minutes() {
        let windows: Vec<WindowEstimate> = (0..400).map(|i| make_window(1_700_000_000 + i, 60.0)).collect();
        let records = smooth_and_bucket(Side::Right, &windows, &ReplayConfig::default());

        let stamps: Vec<i64> = records.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![1_699_999_920, 1_700_000_100, 1_700_000_280]);
        for record in &records {
            assert_eq!(record.side, Side::Right);
            assert!((record.heart_rate - 60.0).abs() < 1e-9);
        }
        assert_eq!(records[1].hrv, Some(40.0));
        assert_eq!(records[1].breathing_rate, Some(15.0));
    }

    #[test]
    fn test_empty_replay() {
        let mut processor = ReplayProcessor::new(Side::Left, &EngineConfig::default()).unwrap();
        let output = processor.run(&[]);
        assert_eq!(output.stats, ReplayStats::default());
        assert!(output.records.is_empty());
    }

    #[test]
    fn test_replay_skips_partial_window() {
        let config = EngineConfig::default();
        let mut processor = ReplayProcessor::new(Side::Left, &config).unwrap();
        let output = processor.run(&make_frames(9));
        assert_eq!(output.stats.total_windows, 0);
        assert!(output.windows.is_empty());
    }

    #[test]
    fn test_replay_pulse_train() {
        let memory = EngineContext::in_memory(EngineConfig::default());
        let frames = make_frames(120);

        let output = replay_vitals(&memory.context, Side::Left, &frames).unwrap();
        let stats = &output.stats;
        // 120 s of data holds 111 full 10 s windows
        assert_eq!(stats.total_windows, 111);
        assert!(stats.predicted > 60, "predicted {}", stats.predicted);
        assert_eq!(stats.channel_errors[1], 0);
        assert_eq!(
            stats.predicted + stats.channel_errors[0] + stats.channel_drops[0],
            stats.total_windows
        );

        for window in &output.windows {
            assert!(window.start_ts + 10 <= START_TS + 120);
            assert!(
                window.heart_rate > 50.0 && window.heart_rate < 70.0,
                "heart rate {} at {}",
                window.heart_rate,
                window.start_ts
            );
        }
        assert!(!output.records.is_empty());
        assert_eq!(memory.vitals.rows().len(), output.records.len());
        for record in &output.records {
            assert_eq!(record.timestamp % 180, 0);
        }
    }
}
