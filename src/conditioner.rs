//! Waveform conditioning
//!
//! Cleans a raw piezo segment before peak detection:
//! - outliers beyond the configured percentiles are re-interpolated
//! - the result is rescaled to a fixed range so downstream thresholds hold
//! - baseline wander is removed with a wide notch at a very low frequency
//! - a zero-phase Butterworth bandpass isolates the cardiac band

use crate::config::ConditionerConfig;
use crate::dsp::stats;
use crate::dsp::SosFilter;
use crate::error::SignalResult;

/// Reusable conditioning chain with pre-designed filters
#[derive(Debug, Clone)]
pub struct SignalConditioner {
    signal_percentile: (f64, f64),
    scale_range: (f64, f64),
    baseline: SosFilter,
    bandpass: SosFilter,
}

impl SignalConditioner {
    /// Design the filters for `config`
    pub fn new(config: &ConditionerConfig) -> SignalResult<Self> {
        let baseline = SosFilter::notch(
            config.baseline_cutoff_hz,
            config.notch_quality,
            config.sample_rate,
        )?;
        let bandpass = SosFilter::butter_bandpass(
            config.bandpass_hz.0,
            config.bandpass_hz.1,
            config.sample_rate,
            config.filter_order,
        )?;

        Ok(Self {
            signal_percentile: config.signal_percentile,
            scale_range: config.scale_range,
            baseline,
            bandpass,
        })
    }

    /// Run the full chain; output has the same length as `raw`
    pub fn condition(&self, raw: &[i32]) -> Vec<f64> {
        if raw.is_empty() {
            return Vec::new();
        }

        let data: Vec<f64> = raw.iter().map(|&v| v as f64).collect();
        let data = interpolate_outliers(&data, self.signal_percentile.0, self.signal_percentile.1);
        let data = rescale(&data, self.scale_range.0, self.scale_range.1);
        let data = self.baseline.filtfilt(&data);
        self.bandpass.filtfilt(&data)
    }
}

/// Replace samples outside the `[lower, upper]` percentile band by linear
/// interpolation between the surrounding in-band samples
pub fn interpolate_outliers(data: &[f64], lower: f64, upper: f64) -> Vec<f64> {
    if data.is_empty() {
        return Vec::new();
    }

    let [low_bound, high_bound] = stats::percentiles(data, [lower, upper]);
    let is_outlier = |v: f64| v < low_bound || v > high_bound;

    let (valid_x, valid_y): (Vec<f64>, Vec<f64>) = data
        .iter()
        .enumerate()
        .filter(|(_, &v)| !is_outlier(v))
        .map(|(i, &v)| (i as f64, v))
        .unzip();

    if valid_x.is_empty() {
        return data
            .iter()
            .map(|v| v.clamp(low_bound, high_bound))
            .collect();
    }

    data.iter()
        .enumerate()
        .map(|(i, &v)| {
            if is_outlier(v) {
                stats::interp(i as f64, &valid_x, &valid_y)
            } else {
                v
            }
        })
        .collect()
}

/// Affine map of `data` onto `[lower, upper]`; constant input maps to `lower`
pub fn rescale(data: &[f64], lower: f64, upper: f64) -> Vec<f64> {
    let (min, max) = data
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;
    if !(range > 0.0) {
        return vec![lower; data.len()];
    }
    data.iter()
        .map(|v| (upper - lower) * (v - min) / range + lower)
        .collect()
}
