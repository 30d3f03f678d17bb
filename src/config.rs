//! Engine configuration
//!
//! Every tunable constant of the pipeline lives here, grouped by stage. The
//! whole tree deserializes from TOML and any missing key falls back to its
//! default, so a config file only needs to name what it overrides:
//!
//! ```toml
//! [tracker]
//! insertion_frequency = 30
//!
//! [breathing]
//! method = "welch"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::EngineError;

/// Default piezo sample rate in Hz
pub const DEFAULT_SAMPLE_RATE: f64 = 500.0;

/// Raw peak-to-peak amplitude above which a side counts as present
pub const DEFAULT_PRESENCE_THRESHOLD: f64 = 200_000.0;

/// Power spectral density estimator used for breathing rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpectralMethod {
    Fft,
    Welch,
    Periodogram,
}

impl std::str::FromStr for SpectralMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fft" => Ok(SpectralMethod::Fft),
            "welch" => Ok(SpectralMethod::Welch),
            "periodogram" => Ok(SpectralMethod::Periodogram),
            other => Err(format!(
                "unknown spectral method '{}', expected fft, welch or periodogram",
                other
            )),
        }
    }
}

/// Waveform cleaning ahead of peak detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionerConfig {
    pub sample_rate: f64,
    /// Percentile bounds outside which samples are re-interpolated
    pub signal_percentile: (f64, f64),
    /// Output range of the affine rescale
    pub scale_range: (f64, f64),
    pub baseline_cutoff_hz: f64,
    pub notch_quality: f64,
    pub bandpass_hz: (f64, f64),
    pub filter_order: usize,
}

impl Default for ConditionerConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            signal_percentile: (0.2, 99.8),
            scale_range: (0.0, 1024.0),
            baseline_cutoff_hz: 0.05,
            notch_quality: 0.005,
            bandpass_hz: (0.5, 20.0),
            filter_order: 2,
        }
    }
}

/// Adaptive peak detection and RR cleaning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakConfig {
    pub sample_rate: f64,
    /// Rolling-mean window in seconds
    pub window_size: f64,
    pub bpm_min: f64,
    pub bpm_max: f64,
    /// Moving-average offsets tried in order; the first that fits wins
    pub ma_perc_candidates: Vec<f64>,
    /// RR standard deviation a fit must exceed (ms)
    pub rrsd_floor: f64,
    /// A first peak this close to the window start is dropped (ms)
    pub leading_peak_ms: f64,
    pub quotient_iterations: usize,
    pub quotient_band: (f64, f64),
}

impl Default for PeakConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            window_size: 0.65,
            bpm_min: 40.0,
            bpm_max: 90.0,
            ma_perc_candidates: vec![40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0, 110.0, 120.0],
            rrsd_floor: 0.1,
            leading_peak_ms: 150.0,
            quotient_iterations: 2,
            quotient_band: (0.8, 1.2),
        }
    }
}

/// Spectral breathing-rate estimation from RR intervals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreathingConfig {
    pub method: SpectralMethod,
    /// Bandpass the resampled series before the PSD
    pub filter: bool,
    pub band_hz: (f64, f64),
    /// Rate of the resampled RR series; RR values are in ms so this is 1000
    pub resample_rate: f64,
    /// Segment length bound used by Welch and the periodogram FFT size
    pub segment_floor: usize,
}

impl Default for BreathingConfig {
    fn default() -> Self {
        Self {
            method: SpectralMethod::Fft,
            filter: true,
            band_hz: (0.1, 0.4),
            resample_rate: 1000.0,
            segment_floor: 30_000,
        }
    }
}

/// Per-side live vitals tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub heart_rate_window_seconds: usize,
    pub breath_window_seconds: usize,
    pub breath_insertion_frequency: u64,
    pub hrv_window_seconds: usize,
    pub hrv_insertion_frequency: u64,
    /// Ticks between emitted vitals records
    pub insertion_frequency: u64,
    /// Fused heart rates kept for the moving average and bounds
    pub moving_avg_size: usize,
    /// Fused heart rates averaged into an emitted record
    pub rolling_average_size: usize,
    pub hr_std_range: (f64, f64),
    pub hr_percentile: (f64, f64),
    pub min_bound_width: f64,
    pub max_heart_rate: f64,
    pub presence_threshold: f64,
    /// Consecutive sub-threshold ticks before a side flips to absent
    pub presence_tolerance: u32,
    pub breath_rate_range: (f64, f64),
    pub breath_smoothing_size: usize,
    pub hrv_range: (f64, f64),
    pub hrv_smoothing_size: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            heart_rate_window_seconds: 10,
            breath_window_seconds: 30,
            breath_insertion_frequency: 10,
            hrv_window_seconds: 60,
            hrv_insertion_frequency: 30,
            insertion_frequency: 60,
            moving_avg_size: 120,
            rolling_average_size: 25,
            hr_std_range: (1.0, 10.0),
            hr_percentile: (15.0, 80.0),
            min_bound_width: 25.0,
            max_heart_rate: 90.0,
            presence_threshold: DEFAULT_PRESENCE_THRESHOLD,
            presence_tolerance: 10,
            breath_rate_range: (8.0, 20.0),
            breath_smoothing_size: 3,
            hrv_range: (30.0, 120.0),
            hrv_smoothing_size: 10,
        }
    }
}

impl TrackerConfig {
    /// Seconds of frames the ring buffer must hold
    pub fn buffer_seconds(&self) -> usize {
        self.heart_rate_window_seconds
            .max(self.breath_window_seconds)
            .max(self.hrv_window_seconds)
    }
}

/// Piezo + capacitance occupancy classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Samples in the piezo min/max range window
    pub range_window: usize,
    pub range_threshold: f64,
    pub piezo_rolling_seconds: usize,
    pub piezo_threshold_percent: f64,
    pub cap_occupancy_threshold: f64,
    pub cap_rolling_seconds: usize,
    pub cap_threshold_percent: f64,
    /// Percentiles of the per-second piezo mean kept by offline analysis
    pub trim_percentiles: (f64, f64),
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            range_window: 10,
            range_threshold: 20_000.0,
            piezo_rolling_seconds: 10,
            piezo_threshold_percent: 0.70,
            cap_occupancy_threshold: 5.0,
            cap_rolling_seconds: 10,
            cap_threshold_percent: 0.90,
            trim_percentiles: (2.0, 98.0),
        }
    }
}

/// Sleep-session segmentation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SleepConfig {
    /// Shortest present run kept as a presence interval
    pub presence_duration_threshold_seconds: i64,
    /// Largest absence merged into one session
    pub max_gap_seconds: i64,
    /// A session must accumulate strictly more present time than this
    pub min_sleep_seconds: i64,
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self {
            presence_duration_threshold_seconds: 60,
            max_gap_seconds: 15 * 60,
            min_sleep_seconds: 3 * 60 * 60,
        }
    }
}

/// Empty-bed baseline search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub window_seconds: i64,
    /// Piezo range that indicates someone on the bed
    pub threshold_range: f64,
    /// Largest accepted coefficient of variation per capacitance channel
    pub max_cv: f64,
    pub min_std: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            window_seconds: 5 * 60,
            threshold_range: 10_000.0,
            max_cv: 0.05,
            min_std: 5.0,
        }
    }
}

/// Live streaming pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Frames older than this (relative to the wall clock) are dropped
    pub stale_after_seconds: i64,
    /// Back-off when the frame source has nothing new
    pub poll_interval_ms: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            stale_after_seconds: 120,
            poll_interval_ms: 250,
        }
    }
}

/// Bounded historical vitals replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub window_seconds: usize,
    pub slide_by_seconds: usize,
    pub moving_avg_size: usize,
    pub hr_std_range: (f64, f64),
    pub hr_percentile: (f64, f64),
    pub signal_percentile: (f64, f64),
    /// Breathing values outside this range are re-interpolated
    pub breath_valid_range: (f64, f64),
    pub hrv_valid_range: (f64, f64),
    /// Output bucket size for the aggregated records
    pub bucket_seconds: i64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            window_seconds: 10,
            slide_by_seconds: 1,
            moving_avg_size: 120,
            hr_std_range: (1.0, 20.0),
            hr_percentile: (20.0, 75.0),
            signal_percentile: (0.5, 99.5),
            breath_valid_range: (10.0, 23.0),
            hrv_valid_range: (10.0, 100.0),
            bucket_seconds: 180,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub conditioner: ConditionerConfig,
    pub peaks: PeakConfig,
    pub breathing: BreathingConfig,
    pub tracker: TrackerConfig,
    pub presence: PresenceConfig,
    pub sleep: SleepConfig,
    pub calibration: CalibrationConfig,
    pub live: LiveConfig,
    pub replay: ReplayConfig,
}

impl EngineConfig {
    /// Parse a TOML document; absent keys take their defaults
    pub fn from_toml_str(toml_str: &str) -> Result<Self, EngineError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Load a TOML config file
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String, EngineError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.tracker.insertion_frequency, 60);
        assert_eq!(config.tracker.moving_avg_size, 120);
        assert_eq!(config.peaks.bpm_max, 90.0);
        assert_eq!(config.breathing.method, SpectralMethod::Fft);
        assert_eq!(config.sleep.max_gap_seconds, 900);
        assert_eq!(config.tracker.buffer_seconds(), 60);
    }

    #[test]
    fn test_partial_override() {
        let config = EngineConfig::from_toml_str(
            r#"
            [tracker]
            insertion_frequency = 30

            [breathing]
            method = "welch"
            "#,
        )
        .unwrap();

        assert_eq!(config.tracker.insertion_frequency, 30);
        assert_eq!(config.tracker.rolling_average_size, 25);
        assert_eq!(config.breathing.method, SpectralMethod::Welch);
        assert_eq!(config.presence, PresenceConfig::default());
    }

    #[test]
    fn test_round_trip_through_file() {
        let mut config = EngineConfig::default();
        config.sleep.presence_duration_threshold_seconds = 90;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml_string().unwrap().as_bytes())
            .unwrap();

        let loaded = EngineConfig::load(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_toml() {
        let result = EngineConfig::from_toml_str("[tracker]\ninsertion_frequency = \"often\"");
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
