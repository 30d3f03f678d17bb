//! Per-side live vitals tracking
//!
//! A [`VitalsTracker`] owns everything one bed side needs across a session:
//! the frame ring buffer, presence hysteresis, the fused heart-rate history
//! with its adaptive bounds, and the slower breathing and HRV cadences. It is
//! fed one frame per second and now and then yields a [`VitalsRecord`].
//!
//! Per-channel estimation failures are logged and skipped; they never disturb
//! the side's long-lived state.

use log::{debug, info};

use crate::breathing::BreathingEstimator;
use crate::buffer::{BoundedHistory, FrameBuffer, PiezoChannel};
use crate::conditioner::SignalConditioner;
use crate::config::{EngineConfig, TrackerConfig};
use crate::dsp::stats;
use crate::error::SignalResult;
use crate::peaks::{HeartMeasurement, PeakEngine, WorkingSignal};
use crate::types::{Side, SideSamples, VitalsRecord};

/// Moving average, percentile bounds and clamp half-range of fused heart rates
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveBounds {
    percentile: (f64, f64),
    std_range: (f64, f64),
    min_width: f64,
    max_heart_rate: f64,
    pub moving_avg: Option<f64>,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    /// Largest accepted deviation from the moving average
    pub hr_std_2: Option<f64>,
}

impl AdaptiveBounds {
    pub fn new(
        percentile: (f64, f64),
        std_range: (f64, f64),
        min_width: f64,
        max_heart_rate: f64,
    ) -> Self {
        Self {
            percentile,
            std_range,
            min_width,
            max_heart_rate,
            moving_avg: None,
            lower: None,
            upper: None,
            hr_std_2: None,
        }
    }

    pub fn from_tracker(config: &TrackerConfig) -> Self {
        Self::new(
            config.hr_percentile,
            config.hr_std_range,
            config.min_bound_width,
            config.max_heart_rate,
        )
    }

    /// Reject NaN, rates above the absolute ceiling and, once bounds exist,
    /// anything not strictly inside them
    pub fn is_valid(&self, bpm: f64) -> bool {
        if bpm.is_nan() || bpm > self.max_heart_rate {
            return false;
        }
        match (self.lower, self.upper) {
            (Some(lower), Some(upper)) => lower < bpm && bpm < upper,
            _ => true,
        }
    }

    /// Whether `bpm` fails only because it lies outside the percentile bounds
    pub fn is_outside_bounds(&self, bpm: f64) -> bool {
        !bpm.is_nan() && bpm <= self.max_heart_rate && !self.is_valid(bpm)
    }

    /// Fuse up to two channel heart rates into one value.
    ///
    /// Channels are averaged, the result is pulled halfway toward the moving
    /// average when one exists, then clamped to `moving_avg ± hr_std_2`.
    pub fn fuse(&self, first: Option<f64>, second: Option<f64>) -> Option<f64> {
        let combined = match (first, second) {
            (Some(a), Some(b)) => (a + b) / 2.0,
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return None,
        };
        let pulled = match self.moving_avg {
            Some(ma) => (combined + ma) / 2.0,
            None => combined,
        };
        Some(self.clamp(pulled))
    }

    /// Clamp `heart_rate` to the nearest bound of `moving_avg ± hr_std_2`
    pub fn clamp(&self, heart_rate: f64) -> f64 {
        match (self.moving_avg, self.hr_std_2) {
            (Some(ma), Some(std2)) if (heart_rate - ma).abs() > std2 => {
                if heart_rate < ma {
                    ma - std2
                } else {
                    ma + std2
                }
            }
            _ => heart_rate,
        }
    }

    /// Recompute from a full history; a partial history leaves bounds as is
    pub fn update(&mut self, history: &BoundedHistory) {
        if !history.is_full() || history.is_empty() {
            return;
        }

        let values = history.to_vec();
        let ma = stats::mean(&values);
        let [mut lower, mut upper] = stats::percentiles(&values, [self.percentile.0, self.percentile.1]);
        if upper - lower < self.min_width {
            lower = ma - self.min_width / 2.0;
            upper = ma + self.min_width / 2.0;
        }

        self.moving_avg = Some(ma);
        self.lower = Some(lower);
        self.upper = Some(upper);
        self.hr_std_2 = Some((stats::std_dev(&values) * 2.0).clamp(self.std_range.0, self.std_range.1));
    }

    pub fn width(&self) -> Option<f64> {
        Some(self.upper? - self.lower?)
    }

    pub fn reset(&mut self) {
        self.moving_avg = None;
        self.lower = None;
        self.upper = None;
        self.hr_std_2 = None;
    }
}

/// Long-lived state of one side
#[derive(Debug, Clone, PartialEq)]
pub struct VitalsTrackerState {
    /// Fused heart rates, capacity `moving_avg_size`
    pub heart_rates: BoundedHistory,
    pub breath_rates: BoundedHistory,
    pub hrv_values: BoundedHistory,
    pub bounds: AdaptiveBounds,
    pub present: bool,
    /// Ticks since the side became present
    pub present_for: u64,
    /// Consecutive ticks below the presence threshold
    pub not_present_for: u32,
    /// Processed ticks since the last reset
    pub iteration: u64,
    /// A fused heart rate was appended since the last emission
    pub pending: bool,
}

impl VitalsTrackerState {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            heart_rates: BoundedHistory::new(config.moving_avg_size),
            breath_rates: BoundedHistory::new(config.breath_smoothing_size),
            hrv_values: BoundedHistory::new(config.hrv_smoothing_size),
            bounds: AdaptiveBounds::from_tracker(config),
            present: false,
            present_for: 0,
            not_present_for: 0,
            iteration: 0,
            pending: false,
        }
    }

    /// Clear histories, bounds and cadence counters
    pub fn reset(&mut self) {
        self.heart_rates.clear();
        self.breath_rates.clear();
        self.hrv_values.clear();
        self.bounds.reset();
        self.present_for = 0;
        self.iteration = 0;
        self.pending = false;
    }
}

/// Vitals tracker for one bed side
pub struct VitalsTracker {
    side: Side,
    config: TrackerConfig,
    conditioner: SignalConditioner,
    engine: PeakEngine,
    breathing: BreathingEstimator,
    buffer: FrameBuffer,
    state: VitalsTrackerState,
}

impl VitalsTracker {
    pub fn new(side: Side, config: &EngineConfig) -> SignalResult<Self> {
        Ok(Self {
            side,
            conditioner: SignalConditioner::new(&config.conditioner)?,
            engine: PeakEngine::new(&config.peaks),
            breathing: BreathingEstimator::new(&config.breathing)?,
            buffer: FrameBuffer::new(config.tracker.buffer_seconds()),
            state: VitalsTrackerState::new(&config.tracker),
            config: config.tracker.clone(),
        })
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state(&self) -> &VitalsTrackerState {
        &self.state
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    /// Feed one second of samples; returns a record on emission ticks
    pub fn ingest(&mut self, samples: SideSamples) -> Option<VitalsRecord> {
        let ts = samples.ts;
        self.buffer.push(samples);

        let window = self
            .buffer
            .window(PiezoChannel::Primary, self.config.heart_rate_window_seconds)
            .ok()?;
        self.detect_presence(&window.samples);

        if !self.state.present
            || self.state.present_for < self.config.heart_rate_window_seconds as u64
        {
            return None;
        }

        self.state.iteration += 1;
        let first = self.channel_heart_rate(PiezoChannel::Primary);
        let second = if self.buffer.has_secondary() {
            self.channel_heart_rate(PiezoChannel::Secondary)
        } else {
            None
        };

        if let Some(heart_rate) = self.state.bounds.fuse(first, second) {
            self.state.heart_rates.push(heart_rate);
            self.state.pending = true;
        }

        if self.due(self.config.breath_insertion_frequency, self.config.breath_window_seconds) {
            self.update_breathing();
        }
        if self.due(self.config.hrv_insertion_frequency, self.config.hrv_window_seconds) {
            self.update_hrv();
        }

        let record = self.emit(ts);
        self.state.bounds.update(&self.state.heart_rates);
        record
    }

    /// Presence hysteresis on the peak-to-peak amplitude of `signal`.
    ///
    /// One sample above the threshold makes the side present; it turns absent
    /// only after `presence_tolerance` consecutive samples below it.
    pub fn detect_presence(&mut self, signal: &[i32]) -> bool {
        let range = stats::peak_to_peak(signal);
        let state = &mut self.state;

        if range > self.config.presence_threshold {
            if !state.present {
                info!("{} side present (signal range {:.0})", self.side, range);
            }
            state.present = true;
            state.not_present_for = 0;
        } else {
            state.not_present_for = state.not_present_for.saturating_add(1);
            if state.present && state.not_present_for >= self.config.presence_tolerance {
                info!(
                    "{} side absent for {} ticks, resetting",
                    self.side, state.not_present_for
                );
                state.present = false;
                state.reset();
            }
        }

        if state.present {
            state.present_for += 1;
        }
        state.present
    }

    fn due(&self, every: u64, window_seconds: usize) -> bool {
        every > 0
            && self.state.iteration % every == 0
            && self.state.present_for >= window_seconds as u64
    }

    /// Condition and analyse the last `seconds` of `channel`
    fn analyse(
        &self,
        channel: PiezoChannel,
        seconds: usize,
    ) -> SignalResult<(WorkingSignal, HeartMeasurement)> {
        let window = self.buffer.window(channel, seconds)?;
        let cleaned = self.conditioner.condition(&window.samples);
        self.engine.process(&cleaned)
    }

    fn channel_heart_rate(&self, channel: PiezoChannel) -> Option<f64> {
        match self.analyse(channel, self.config.heart_rate_window_seconds) {
            Ok((_, measurement)) if self.state.bounds.is_valid(measurement.bpm) => {
                Some(measurement.bpm)
            }
            Ok((_, measurement)) => {
                debug!(
                    "{} channel {}: {:.1} bpm rejected",
                    self.side,
                    channel.number(),
                    measurement.bpm
                );
                None
            }
            Err(err) => {
                debug!("{} channel {}: {}", self.side, channel.number(), err);
                None
            }
        }
    }

    fn update_breathing(&mut self) {
        let (working, _) = match self.analyse(PiezoChannel::Primary, self.config.breath_window_seconds) {
            Ok(result) => result,
            Err(err) => {
                debug!("{} breathing window: {}", self.side, err);
                return;
            }
        };

        let (low, high) = self.config.breath_rate_range;
        match self.breathing.estimate_rate(&working.rr_corrected) {
            Some(rate) if (low..=high).contains(&rate) => self.state.breath_rates.push(rate),
            Some(rate) => debug!("{} breathing rate {:.1} out of range", self.side, rate),
            None => {}
        }
    }

    fn update_hrv(&mut self) {
        match self.analyse(PiezoChannel::Primary, self.config.hrv_window_seconds) {
            Ok((_, measurement)) => {
                let (low, high) = self.config.hrv_range;
                if (low..=high).contains(&measurement.sdnn) {
                    self.state.hrv_values.push(measurement.sdnn);
                } else {
                    debug!("{} hrv {:.1} out of range", self.side, measurement.sdnn);
                }
            }
            Err(err) => debug!("{} hrv window: {}", self.side, err),
        }
    }

    fn emit(&mut self, ts: i64) -> Option<VitalsRecord> {
        let every = self.config.insertion_frequency;
        if every == 0 || self.state.iteration % every != 0 || !self.state.pending {
            return None;
        }

        let heart_rate = self
            .state
            .heart_rates
            .recent_mean(self.config.rolling_average_size)?;
        self.state.pending = false;

        let record = VitalsRecord {
            side: self.side,
            timestamp: ts,
            heart_rate,
            hrv: self.state.hrv_values.mean(),
            breathing_rate: self.state.breath_rates.mean(),
        };
        info!(
            "{} vitals @ {}: hr {:.1}, hrv {:?}, br {:?}",
            self.side, ts, record.heart_rate, record.hrv, record.breathing_rate
        );
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::f64::consts::PI;

    const SAMPLE_RATE: usize = 500;

    fn make_bounds(ma: f64, std2: f64) -> AdaptiveBounds {
        let mut bounds = AdaptiveBounds::from_tracker(&TrackerConfig::default());
        bounds.moving_avg = Some(ma);
        bounds.hr_std_2 = Some(std2);
        bounds
    }

    /// Frames of a pulse train with a breathing-modulated RR interval
    fn make_frames(seconds: usize, amplitude: f64) -> Vec<SideSamples> {
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
                *value += amplitude * (-(d * d) / (2.0 * sigma * sigma)).exp();
            }
            t += 1.0 + 0.05 * (2.0 * PI * 0.25 * t).sin();
        }

        signal
            .chunks(SAMPLE_RATE)
            .enumerate()
            .map(|(ts, chunk)| SideSamples {
                ts: 1_700_000_000 + ts as i64,
                primary: chunk.iter().map(|v| *v as i32).collect(),
                secondary: None,
            })
            .collect()
    }

    fn make_quiet_frame(ts: i64) -> SideSamples {
        SideSamples {
            ts,
            primary: vec![0; SAMPLE_RATE],
            secondary: None,
        }
    }

    #[test]
    fn test_fusion_clamp() {
        let bounds = make_bounds(60.0, 5.0);
        assert_eq!(bounds.clamp(70.0), 65.0);
        assert_eq!(bounds.clamp(50.0), 55.0);
        assert_eq!(bounds.clamp(63.0), 63.0);
    }

    #[test]
    fn test_fuse_pulls_toward_moving_average() {
        let bounds = make_bounds(60.0, 5.0);
        // (80 + 60) / 2 = 70, clamped to 65
        assert_eq!(bounds.fuse(Some(80.0), None), Some(65.0));
        assert_eq!(bounds.fuse(None, Some(62.0)), Some(61.0));
        assert_eq!(bounds.fuse(Some(58.0), Some(66.0)), Some(61.0));
        assert_eq!(bounds.fuse(None, None), None);

        let fresh = AdaptiveBounds::from_tracker(&TrackerConfig::default());
        assert_eq!(fresh.fuse(Some(58.0), Some(66.0)), Some(62.0));
    }

    #[test]
    fn test_is_valid() {
        let mut bounds = AdaptiveBounds::from_tracker(&TrackerConfig::default());
        assert!(bounds.is_valid(85.0));
        assert!(!bounds.is_valid(91.0));
        assert!(!bounds.is_valid(f64::NAN));

        bounds.lower = Some(50.0);
        bounds.upper = Some(75.0);
        assert!(bounds.is_valid(60.0));
        assert!(!bounds.is_valid(50.0));
        assert!(!bounds.is_valid(80.0));
        assert!(bounds.is_outside_bounds(80.0));
        assert!(!bounds.is_outside_bounds(95.0));
    }

    #[test]
    fn test_bound_width_floor() {
        let config = TrackerConfig {
            moving_avg_size: 10,
            ..TrackerConfig::default()
        };
        let mut bounds = AdaptiveBounds::from_tracker(&config);
        let mut history = BoundedHistory::new(config.moving_avg_size);

        for i in 0..50 {
            history.push(60.0 + (i % 7) as f64 * 0.5);
            bounds.update(&history);
            if let Some(width) = bounds.width() {
                assert!(width >= config.min_bound_width - 1e-9, "width {}", width);
            }
        }

        for _ in 0..10 {
            history.push(60.0);
        }
        bounds.update(&history);
        assert_eq!(bounds.lower, Some(47.5));
        assert_eq!(bounds.upper, Some(72.5));
        assert_eq!(bounds.hr_std_2, Some(1.0));
    }

    #[test]
    fn test_bounds_wait_for_full_history() {
        let mut bounds = AdaptiveBounds::from_tracker(&TrackerConfig::default());
        let mut history = BoundedHistory::new(120);
        history.push(60.0);
        bounds.update(&history);
        assert_eq!(bounds.moving_avg, None);
        assert_eq!(bounds.width(), None);
    }

    #[test]
    fn test_presence_hysteresis() {
        let config = EngineConfig::default();
        let tolerance = config.tracker.presence_tolerance;
        let mut tracker = VitalsTracker::new(Side::Left, &config).unwrap();

        let loud = [0, 250_000];
        let quiet = [0, 1_000];

        assert!(!tracker.detect_presence(&quiet));
        assert!(tracker.detect_presence(&loud));

        for _ in 0..tolerance - 1 {
            assert!(tracker.detect_presence(&quiet));
        }
        assert!(!tracker.detect_presence(&quiet));
        assert_eq!(tracker.state().present_for, 0);

        // a single loud sample flips it straight back
        assert!(tracker.detect_presence(&loud));
        assert_eq!(tracker.state().not_present_for, 0);
    }

    #[test]
    fn test_reset_on_absence_clears_histories() {
        let config = EngineConfig::default();
        let mut tracker = VitalsTracker::new(Side::Right, &config).unwrap();
        tracker.detect_presence(&[0, 300_000]);
        tracker.state.heart_rates.push(60.0);
        tracker.state.bounds.moving_avg = Some(60.0);

        for _ in 0..config.tracker.presence_tolerance {
            tracker.detect_presence(&[0, 10]);
        }
        assert!(tracker.state().heart_rates.is_empty());
        assert_eq!(tracker.state().bounds.moving_avg, None);
    }

    #[test]
    fn test_quiet_bed_emits_nothing() {
        let mut tracker = VitalsTracker::new(Side::Left, &EngineConfig::default()).unwrap();
        for ts in 0..120 {
            assert_eq!(tracker.ingest(make_quiet_frame(ts)), None);
        }
        assert!(!tracker.state().present);
        assert_eq!(tracker.state().iteration, 0);
    }

    #[test]
    fn test_ingest_emits_and_stays_bounded() {
        let mut config = EngineConfig::default();
        config.tracker.moving_avg_size = 20;
        let mut tracker = VitalsTracker::new(Side::Left, &config).unwrap();

        let mut records = Vec::new();
        for frame in make_frames(140, 300_000.0) {
            if let Some(record) = tracker.ingest(frame) {
                records.push(record);
            }
            let state = tracker.state();
            assert!(state.heart_rates.len() <= state.heart_rates.capacity());
            assert!(state.breath_rates.len() <= state.breath_rates.capacity());
            assert!(state.hrv_values.len() <= state.hrv_values.capacity());
            assert!(tracker.buffer().len() <= tracker.buffer().capacity());
            if let Some(width) = state.bounds.width() {
                assert!(width >= config.tracker.min_bound_width - 1e-9);
            }
        }

        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record.side, Side::Left);
            assert!(
                record.heart_rate > 50.0 && record.heart_rate < 70.0,
                "heart rate {}",
                record.heart_rate
            );
        }
    }
}
