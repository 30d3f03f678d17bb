//! Adaptive peak detection and RR-interval analysis
//!
//! The detector thresholds the waveform against its own rolling mean lifted by
//! a percentage offset (`ma_perc`). Several offsets are tried and the smallest
//! one that yields a plausible heart rate with non-degenerate RR variability
//! wins. RR intervals are then cleaned in two stages:
//! 1. `check_peaks` rejects beats whose interval strays too far from the mean
//! 2. a quotient filter rejects intervals that jump against their neighbour
//!
//! All interval arithmetic is in milliseconds.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::PeakConfig;
use crate::dsp::stats;
use crate::error::{SignalError, SignalResult};

/// Per-call scratch state of the peak engine
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkingSignal {
    /// Rolling-mean baseline before the `ma_perc` lift
    pub rolling_mean: Vec<f64>,
    /// Offset percentage chosen by the fit
    pub ma_perc: f64,
    /// Sample indices of detected beats
    pub peaks: Vec<usize>,
    /// Intervals between consecutive peaks (ms)
    pub rr_list: Vec<f64>,
    /// `true` where the interval was rejected; same length as `rr_list`
    pub rr_mask: Vec<bool>,
    /// Accepted intervals
    pub rr_corrected: Vec<f64>,
    /// Absolute successive differences over adjacent accepted intervals
    pub rr_diff: Vec<f64>,
    pub rr_sqdiff: Vec<f64>,
}

/// Time-domain measures from one waveform
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartMeasurement {
    /// Beats per minute
    pub bpm: f64,
    /// Standard deviation of accepted RR intervals (ms)
    pub sdnn: f64,
}

/// Peak detector and RR cleaner
#[derive(Debug, Clone)]
pub struct PeakEngine {
    config: PeakConfig,
}

impl PeakEngine {
    pub fn new(config: &PeakConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Detect beats in a conditioned waveform and derive heart rate and sdnn
    pub fn process(&self, data: &[f64]) -> SignalResult<(WorkingSignal, HeartMeasurement)> {
        let sample_rate = self.config.sample_rate;
        if let Some(i) = data.iter().position(|v| !v.is_finite()) {
            return Err(SignalError::NumericInvalid(format!(
                "waveform sample {} is {}",
                i, data[i]
            )));
        }

        // Lift a negative floor so the percentage offset stays meaningful
        let floor = stats::percentile(data, 0.1);
        let data: Vec<f64> = if floor < 0.0 {
            data.iter().map(|v| v + floor.abs()).collect()
        } else {
            data.to_vec()
        };

        let window = (self.config.window_size * sample_rate) as usize;
        let rolling_mean = rolling_mean(&data, window)?;
        let ma_perc = self.fit_peaks(&data, &rolling_mean)?;

        let peaks = self.drop_leading_peak(detect_peaks(&data, &rolling_mean, ma_perc));
        if peaks.is_empty() {
            return Err(SignalError::BadSignal("no peaks detected".to_string()));
        }

        let rr_list = rr_intervals(&peaks, sample_rate);
        let accepted = check_peaks(&rr_list);
        let rr_mask = rr_mask_from_peaks(&accepted);
        let rr_mask = quotient_filter(
            &rr_list,
            rr_mask,
            self.config.quotient_iterations,
            self.config.quotient_band,
        );

        let rr_corrected: Vec<f64> = rr_list
            .iter()
            .zip(&rr_mask)
            .filter(|(_, &rejected)| !rejected)
            .map(|(&rr, _)| rr)
            .collect();
        let rr_diff = masked_diff(&rr_list, &rr_mask);
        let rr_sqdiff = rr_diff.iter().map(|d| d * d).collect();

        let bpm = 60_000.0 / stats::mean(&rr_corrected);
        let sdnn = stats::std_dev(&rr_corrected);
        if !bpm.is_finite() || sdnn.is_nan() {
            return Err(SignalError::NumericInvalid(format!(
                "bpm {} from {} accepted intervals",
                bpm,
                rr_corrected.len()
            )));
        }

        let working = WorkingSignal {
            rolling_mean,
            ma_perc,
            peaks,
            rr_list,
            rr_mask,
            rr_corrected,
            rr_diff,
            rr_sqdiff,
        };
        Ok((working, HeartMeasurement { bpm, sdnn }))
    }

    /// Smallest candidate offset whose detection gives plausible RR
    /// variability and heart rate
    pub fn fit_peaks(&self, data: &[f64], rolling_mean: &[f64]) -> SignalResult<f64> {
        let sample_rate = self.config.sample_rate;
        let seconds = data.len() as f64 / sample_rate;

        let mut candidates = self.config.ma_perc_candidates.clone();
        candidates.sort_by(|a, b| a.total_cmp(b));

        for ma_perc in candidates {
            let peaks = self.drop_leading_peak(detect_peaks(data, rolling_mean, ma_perc));
            let bpm = peaks.len() as f64 / seconds * 60.0;
            let rr = rr_intervals(&peaks, sample_rate);
            let rrsd = if rr.is_empty() {
                f64::INFINITY
            } else {
                stats::std_dev(&rr)
            };

            if rrsd.is_finite()
                && rrsd > self.config.rrsd_floor
                && bpm >= self.config.bpm_min
                && bpm <= self.config.bpm_max
            {
                debug!(
                    "peak fit: ma_perc {} gives {:.1} bpm, rrsd {:.1}",
                    ma_perc, bpm, rrsd
                );
                return Ok(ma_perc);
            }
        }

        Err(SignalError::BadSignal(
            "could not determine best fit".to_string(),
        ))
    }

    /// Drop a first peak that sits inside the leading guard interval
    fn drop_leading_peak(&self, mut peaks: Vec<usize>) -> Vec<usize> {
        let guard = self.config.sample_rate / 1000.0 * self.config.leading_peak_ms;
        if peaks.first().is_some_and(|&p| p as f64 <= guard) {
            peaks.remove(0);
        }
        peaks
    }
}

/// Centred rolling mean over `window` samples, padded with the first and last
/// value to the input length
pub fn rolling_mean(data: &[f64], window: usize) -> SignalResult<Vec<f64>> {
    if window == 0 || data.len() < window {
        return Err(SignalError::InsufficientData(format!(
            "rolling mean needs {} samples, got {}",
            window,
            data.len()
        )));
    }

    let mut means = Vec::with_capacity(data.len() - window + 1);
    let mut sum: f64 = data[..window].iter().sum();
    means.push(sum / window as f64);
    for i in window..data.len() {
        sum += data[i] - data[i - window];
        means.push(sum / window as f64);
    }

    let pad = (data.len() - means.len()) / 2;
    let first = means[0];
    let last = means[means.len() - 1];

    let mut out = Vec::with_capacity(data.len());
    out.extend(std::iter::repeat(first).take(pad));
    out.extend_from_slice(&means);
    out.extend(std::iter::repeat(last).take(pad));
    out.resize(data.len(), 0.0);
    Ok(out)
}

/// Index of the highest sample in every contiguous run above the lifted
/// rolling mean
pub fn detect_peaks(data: &[f64], rolling_mean: &[f64], ma_perc: f64) -> Vec<usize> {
    let lift = stats::mean(rolling_mean) / 100.0 * ma_perc;

    let mut peaks = Vec::new();
    let mut run_best: Option<usize> = None;
    for (i, (&value, &baseline)) in data.iter().zip(rolling_mean).enumerate() {
        if value > baseline + lift {
            run_best = match run_best {
                Some(best) if data[best] >= value => Some(best),
                _ => Some(i),
            };
        } else if let Some(best) = run_best.take() {
            peaks.push(best);
        }
    }
    if let Some(best) = run_best {
        peaks.push(best);
    }
    peaks
}

/// Intervals between consecutive peaks in milliseconds
pub fn rr_intervals(peaks: &[usize], sample_rate: f64) -> Vec<f64> {
    peaks
        .windows(2)
        .map(|w| (w[1] - w[0]) as f64 * 1000.0 / sample_rate)
        .collect()
}

/// Per-peak acceptance: the peak closing an out-of-range interval is rejected.
///
/// The accepted band is `mean ± max(300, 0.3 × mean)`, exclusive at both ends.
pub fn check_peaks(rr_list: &[f64]) -> Vec<bool> {
    let mut accepted = vec![true; rr_list.len() + 1];
    if rr_list.is_empty() {
        return accepted;
    }

    let mean = stats::mean(rr_list);
    let tolerance = (0.3 * mean).max(300.0);
    let (lower, upper) = (mean - tolerance, mean + tolerance);

    for (i, &rr) in rr_list.iter().enumerate() {
        if rr <= lower || rr >= upper {
            accepted[i + 1] = false;
        }
    }
    accepted
}

/// Interval mask from peak acceptance; an interval survives only when both of
/// its peaks do
pub fn rr_mask_from_peaks(accepted: &[bool]) -> Vec<bool> {
    accepted.windows(2).map(|w| !(w[0] && w[1])).collect()
}

/// Quotient filter over `iterations` passes.
///
/// For every adjacent pair still accepted, the later interval is rejected when
/// the ratio of the pair falls outside `band`.
pub fn quotient_filter(
    rr_list: &[f64],
    mut mask: Vec<bool>,
    iterations: usize,
    band: (f64, f64),
) -> Vec<bool> {
    debug_assert_eq!(rr_list.len(), mask.len());
    for _ in 0..iterations {
        for i in 0..rr_list.len().saturating_sub(1) {
            if mask[i] || mask[i + 1] {
                continue;
            }
            let ratio = rr_list[i] / rr_list[i + 1];
            if !(band.0..=band.1).contains(&ratio) {
                mask[i + 1] = true;
            }
        }
    }
    mask
}

/// Absolute successive differences taken only across adjacent accepted pairs
pub fn masked_diff(rr_list: &[f64], mask: &[bool]) -> Vec<f64> {
    (0..rr_list.len().saturating_sub(1))
        .filter(|&i| !mask[i] && !mask[i + 1])
        .map(|i| (rr_list[i + 1] - rr_list[i]).abs())
        .collect()
}
