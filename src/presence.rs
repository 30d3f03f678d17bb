//! Bed occupancy from piezo activity and capacitance
//!
//! Each modality votes independently per second:
//! - piezo: the min/max range of the per-second channel 1 mean over
//!   `range_window` samples reaches `range_threshold`
//! - capacitance: the summed z-score of out/cen/in against the empty-bed
//!   baseline exceeds `cap_occupancy_threshold`
//!
//! A vote only becomes a presence bit once enough momentary flags accumulate
//! in a rolling window. The side counts as occupied when both bits agree.
//!
//! [`PresenceFusion::push`] is the streaming form used by the live pipeline
//! (trailing range window); [`PresenceFusion::classify_series`] is the batch
//! form used for sleep analysis (centred range window).

use std::collections::{BTreeMap, VecDeque};

use log::{debug, info};

use crate::config::PresenceConfig;
use crate::dsp::stats;
use crate::types::{CapBaseline, CapChannels, PresenceSample, PresenceState, SensorFrame, Side};

/// Number of flags in a window of `seconds` needed for `percent` coverage
pub fn required_count(percent: f64, seconds: usize) -> usize {
    (percent * seconds as f64).ceil() as usize
}

/// Trailing count of set flags over the last `window` pushes
#[derive(Debug, Clone)]
pub struct RollingCount {
    flags: VecDeque<bool>,
    window: usize,
    count: usize,
}

impl RollingCount {
    pub fn new(window: usize) -> Self {
        Self {
            flags: VecDeque::with_capacity(window),
            window: window.max(1),
            count: 0,
        }
    }

    /// Push a flag and return the number set in the window
    pub fn push(&mut self, flag: bool) -> usize {
        self.flags.push_back(flag);
        self.count += flag as usize;
        while self.flags.len() > self.window {
            if let Some(true) = self.flags.pop_front() {
                self.count -= 1;
            }
        }
        self.count
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn clear(&mut self) {
        self.flags.clear();
        self.count = 0;
    }
}

/// Per-side occupancy classifier
#[derive(Debug, Clone)]
pub struct PresenceFusion {
    side: Side,
    config: PresenceConfig,
    baseline: CapBaseline,
    piezo_means: VecDeque<f64>,
    piezo_flags: RollingCount,
    cap_flags: RollingCount,
    occupied: bool,
}

impl PresenceFusion {
    pub fn new(side: Side, config: &PresenceConfig, baseline: CapBaseline) -> Self {
        Self {
            side,
            config: config.clone(),
            baseline,
            piezo_means: VecDeque::with_capacity(config.range_window),
            piezo_flags: RollingCount::new(config.piezo_rolling_seconds),
            cap_flags: RollingCount::new(config.cap_rolling_seconds),
            occupied: false,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn baseline(&self) -> &CapBaseline {
        &self.baseline
    }

    /// Whether the last pushed sample left the side occupied
    pub fn is_occupied(&self) -> bool {
        self.occupied
    }

    pub fn reset(&mut self) {
        self.piezo_means.clear();
        self.piezo_flags.clear();
        self.cap_flags.clear();
        self.occupied = false;
    }

    /// Momentary capacitance vote for one reading
    pub fn cap_flag(&self, cap: &CapChannels) -> bool {
        self.baseline.combined_z(cap) > self.config.cap_occupancy_threshold
    }

    fn piezo_required(&self) -> usize {
        required_count(
            self.config.piezo_threshold_percent,
            self.config.piezo_rolling_seconds,
        )
    }

    fn cap_required(&self) -> usize {
        required_count(
            self.config.cap_threshold_percent,
            self.config.cap_rolling_seconds,
        )
    }

    /// Classify the next per-second sample using a trailing range window
    pub fn push(&mut self, sample: &PresenceSample) -> PresenceState {
        self.piezo_means.push_back(sample.piezo_mean);
        while self.piezo_means.len() > self.config.range_window {
            self.piezo_means.pop_front();
        }

        let piezo_flag = self.piezo_means.len() >= self.config.range_window
            && window_range(self.piezo_means.iter().copied()) >= self.config.range_threshold;
        let cap_flag = self.cap_flag(&sample.cap);

        let piezo_count = self.piezo_flags.push(piezo_flag);
        let cap_count = self.cap_flags.push(cap_flag);

        let state = PresenceState {
            ts: sample.ts,
            piezo_present: piezo_count >= self.piezo_required(),
            cap_present: cap_count >= self.cap_required(),
            piezo_count,
            cap_count,
        };

        if state.occupied() != self.occupied {
            self.occupied = state.occupied();
            info!(
                "{} side {} bed at {}",
                self.side,
                if self.occupied { "entered" } else { "left" },
                sample.ts
            );
        }
        state
    }

    /// Classify a whole series at once using a centred range window.
    ///
    /// Samples must be sorted by timestamp. Streaming state is not touched.
    pub fn classify_series(&self, samples: &[PresenceSample]) -> Vec<PresenceState> {
        let means: Vec<f64> = samples.iter().map(|s| s.piezo_mean).collect();
        let ranges = centered_ranges(&means, self.config.range_window);

        let mut piezo_flags = RollingCount::new(self.config.piezo_rolling_seconds);
        let mut cap_flags = RollingCount::new(self.config.cap_rolling_seconds);
        let piezo_required = self.piezo_required();
        let cap_required = self.cap_required();

        let states: Vec<PresenceState> = samples
            .iter()
            .zip(ranges)
            .map(|(sample, range)| {
                let piezo_flag = range.is_some_and(|r| r >= self.config.range_threshold);
                let piezo_count = piezo_flags.push(piezo_flag);
                let cap_count = cap_flags.push(self.cap_flag(&sample.cap));
                PresenceState {
                    ts: sample.ts,
                    piezo_present: piezo_count >= piezo_required,
                    cap_present: cap_count >= cap_required,
                    piezo_count,
                    cap_count,
                }
            })
            .collect();

        debug!(
            "{} side: classified {} samples, {} occupied",
            self.side,
            states.len(),
            states.iter().filter(|s| s.occupied()).count()
        );
        states
    }
}

fn window_range(values: impl Iterator<Item = f64>) -> f64 {
    let (min, max) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    max - min
}

/// Max minus min over a centred window of `window` samples.
///
/// The window at `i` covers `[i - window / 2, i - window / 2 + window - 1]`;
/// positions where it would run past either end are `None`.
pub fn centered_ranges(values: &[f64], window: usize) -> Vec<Option<f64>> {
    if window == 0 {
        return vec![None; values.len()];
    }
    let half = window / 2;
    (0..values.len())
        .map(|i| {
            let start = i.checked_sub(half)?;
            let end = start + window;
            if end > values.len() {
                return None;
            }
            Some(window_range(values[start..end].iter().copied()))
        })
        .collect()
}

/// Keep samples whose piezo mean lies within the given percentiles (inclusive)
pub fn trim_by_percentile(samples: &[PresenceSample], percentiles: (f64, f64)) -> Vec<PresenceSample> {
    if samples.is_empty() {
        return Vec::new();
    }
    let means: Vec<f64> = samples.iter().map(|s| s.piezo_mean).collect();
    let [lower, upper] = stats::percentiles(&means, [percentiles.0, percentiles.1]);
    let kept: Vec<PresenceSample> = samples
        .iter()
        .filter(|s| s.piezo_mean >= lower && s.piezo_mean <= upper)
        .copied()
        .collect();
    debug!(
        "trimmed {} of {} samples outside [{:.0}, {:.0}]",
        samples.len() - kept.len(),
        samples.len(),
        lower,
        upper
    );
    kept
}

/// Join piezo and capacitance frames of one side on timestamp.
///
/// Output is sorted by timestamp with one sample per second; seconds missing
/// either modality are dropped.
pub fn merge_frames<'a>(
    side: Side,
    frames: impl IntoIterator<Item = &'a SensorFrame>,
) -> Vec<PresenceSample> {
    let mut piezo = BTreeMap::new();
    let mut cap = BTreeMap::new();
    for frame in frames {
        match frame {
            SensorFrame::Piezo(p) => {
                if let Some(mean) = p.primary_mean(side) {
                    piezo.insert(p.ts, mean);
                }
            }
            SensorFrame::Cap(c) => {
                cap.insert(c.ts, c.side(side).channels);
            }
        }
    }

    piezo
        .into_iter()
        .filter_map(|(ts, piezo_mean)| {
            cap.get(&ts).map(|&cap| PresenceSample {
                ts,
                piezo_mean,
                cap,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CapFrame, CapReading, ChannelBaseline, PiezoFrame};
    use pretty_assertions::assert_eq;

    fn make_baseline() -> CapBaseline {
        let channel = ChannelBaseline { mean: 100.0, std: 5.0 };
        CapBaseline {
            out: channel,
            cen: channel,
            inner: channel,
        }
    }

    fn make_cap(level: f64) -> CapChannels {
        CapChannels {
            out: level,
            cen: level,
            inner: level,
        }
    }

    /// Occupied seconds swing the piezo mean and raise capacitance
    fn make_samples(occupied: &[bool]) -> Vec<PresenceSample> {
        occupied
            .iter()
            .enumerate()
            .map(|(i, &busy)| PresenceSample {
                ts: 1_000 + i as i64,
                piezo_mean: if busy && i % 2 == 0 { 50_000.0 } else { 0.0 },
                cap: make_cap(if busy { 120.0 } else { 100.0 }),
            })
            .collect()
    }

    fn make_fusion() -> PresenceFusion {
        PresenceFusion::new(Side::Left, &PresenceConfig::default(), make_baseline())
    }

    #[test]
    fn test_required_count() {
        assert_eq!(required_count(0.70, 10), 7);
        assert_eq!(required_count(0.90, 10), 9);
        assert_eq!(required_count(0.75, 120), 90);
    }

    #[test]
    fn test_rolling_count() {
        let mut count = RollingCount::new(3);
        assert_eq!(count.push(true), 1);
        assert_eq!(count.push(true), 2);
        assert_eq!(count.push(false), 2);
        assert_eq!(count.push(false), 1);
        assert_eq!(count.push(false), 0);
    }

    #[test]
    fn test_streaming_empty_bed() {
        let mut fusion = make_fusion();
        for sample in make_samples(&[false; 30]) {
            let state = fusion.push(&sample);
            assert_eq!(state.combined(), 0);
        }
        assert!(!fusion.is_occupied());
    }

    #[test]
    fn test_streaming_occupied_after_rolling_windows_fill() {
        let mut fusion = make_fusion();
        let states: Vec<PresenceState> = make_samples(&[true; 30])
            .iter()
            .map(|s| fusion.push(s))
            .collect();

        // capacitance needs 9 of 10 flags, set from the first sample
        assert!(!states[7].cap_present);
        assert!(states[8].cap_present);
        // piezo needs a full range window then 7 flags
        assert!(!states[14].piezo_present);
        assert!(states[15].piezo_present);
        assert!(states[29].occupied());
        assert!(fusion.is_occupied());
    }

    #[test]
    fn test_centered_ranges_edges() {
        let values: Vec<f64> = (0..12).map(|i| i as f64).collect();
        let ranges = centered_ranges(&values, 10);
        assert_eq!(ranges[4], None);
        assert_eq!(ranges[5], Some(9.0));
        assert_eq!(ranges[7], Some(9.0));
        assert_eq!(ranges[8], None);
    }

    #[test]
    fn test_classify_series() {
        let mut pattern = vec![false; 20];
        pattern.extend([true; 40]);
        pattern.extend([false; 20]);
        let samples = make_samples(&pattern);

        let states = make_fusion().classify_series(&samples);
        assert_eq!(states.len(), samples.len());
        assert_eq!(states[10].combined(), 0);
        assert!(states[45].occupied());
        assert_eq!(states[79].combined(), 0);
    }

    #[test]
    fn test_trim_by_percentile() {
        let mut samples = make_samples(&[false; 50]);
        for (i, sample) in samples.iter_mut().enumerate() {
            sample.piezo_mean = i as f64;
        }
        samples[0].piezo_mean = -1e9;
        samples[49].piezo_mean = 1e9;

        let kept = trim_by_percentile(&samples, (2.0, 98.0));
        assert_eq!(kept.len(), 48);
        assert!(kept.iter().all(|s| s.piezo_mean.abs() < 100.0));
        assert!(trim_by_percentile(&[], (2.0, 98.0)).is_empty());
    }

    #[test]
    fn test_merge_frames_inner_join() {
        let piezo = |ts: i64| {
            SensorFrame::Piezo(PiezoFrame {
                ts,
                freq: 500,
                adc: 1,
                gain: 400,
                left1: vec![10, 20],
                left2: None,
                right1: vec![0, 0],
                right2: None,
                seq: 0,
            })
        };
        let cap = |ts: i64| {
            let reading = CapReading {
                channels: make_cap(100.0),
                status: None,
            };
            SensorFrame::Cap(CapFrame {
                ts,
                left: reading.clone(),
                right: reading,
                seq: 0,
            })
        };

        let frames = vec![piezo(2), cap(1), piezo(1), cap(3)];
        let merged = merge_frames(Side::Left, &frames);
        assert_eq!(
            merged,
            vec![PresenceSample {
                ts: 1,
                piezo_mean: 15.0,
                cap: make_cap(100.0),
            }]
        );
    }
}
