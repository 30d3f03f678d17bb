//! Breathing-rate estimation from RR intervals
//!
//! Respiration modulates the beat-to-beat interval (respiratory sinus
//! arrhythmia). The RR series is resampled onto a uniform 1 kHz grid with a
//! cubic spline, optionally band-limited to the breathing band, and the
//! dominant frequency of its power spectrum is the breathing rate.

use log::debug;

use crate::config::{BreathingConfig, SpectralMethod};
use crate::dsp::spectrum::{self, Spectrum};
use crate::dsp::spline::{linspace, CubicSpline};
use crate::dsp::SosFilter;
use crate::error::{SignalError, SignalResult};

/// Spectral breathing-rate estimator
#[derive(Debug, Clone)]
pub struct BreathingEstimator {
    method: SpectralMethod,
    resample_rate: f64,
    segment_floor: usize,
    bandpass: Option<SosFilter>,
}

impl BreathingEstimator {
    pub fn new(config: &BreathingConfig) -> SignalResult<Self> {
        let bandpass = if config.filter {
            Some(SosFilter::butter_bandpass(
                config.band_hz.0,
                config.band_hz.1,
                config.resample_rate,
                2,
            )?)
        } else {
            None
        };

        Ok(Self {
            method: config.method,
            resample_rate: config.resample_rate,
            segment_floor: config.segment_floor,
            bandpass,
        })
    }

    /// Dominant breathing frequency in Hz for an RR series in milliseconds
    pub fn estimate(&self, rr_list: &[f64]) -> SignalResult<f64> {
        let signal = self.resample(rr_list)?;
        let signal = match &self.bandpass {
            Some(filter) => filter.filtfilt(&signal),
            None => signal,
        };

        let spectrum = self.spectrum(&signal)?;
        spectrum
            .peak_frequency()
            .ok_or_else(|| SignalError::NumericInvalid("spectrum has no finite bin".to_string()))
    }

    /// Breaths per minute, or `None` when no estimate can be made
    pub fn estimate_rate(&self, rr_list: &[f64]) -> Option<f64> {
        match self.estimate(rr_list) {
            Ok(hz) => Some(hz * 60.0),
            Err(err) => {
                debug!("breathing estimate unavailable: {}", err);
                None
            }
        }
    }

    /// Spline-resample so one output sample spans one millisecond of RR time
    fn resample(&self, rr_list: &[f64]) -> SignalResult<Vec<f64>> {
        let n = rr_list.len();
        if rr_list.iter().any(|rr| !rr.is_finite()) {
            return Err(SignalError::NumericInvalid("RR series has non-finite intervals".to_string()));
        }
        let total_ms = rr_list.iter().sum::<f64>();
        if !total_ms.is_finite() || total_ms < 2.0 {
            return Err(SignalError::InsufficientData(format!(
                "RR series spans {} ms",
                total_ms
            )));
        }

        let x = linspace(0.0, n as f64, n);
        let spline = CubicSpline::new(&x, rr_list)?;
        let x_new = linspace(0.0, n as f64, total_ms.floor() as usize);
        Ok(spline.eval_many(&x_new))
    }

    fn spectrum(&self, signal: &[f64]) -> SignalResult<Spectrum> {
        match self.method {
            SpectralMethod::Fft => spectrum::fft_power(signal, self.resample_rate),
            SpectralMethod::Welch => {
                let nperseg = if signal.len() < self.segment_floor {
                    signal.len()
                } else {
                    (signal.len() / 10).max(self.segment_floor)
                };
                spectrum::welch(signal, self.resample_rate, nperseg)
            }
            SpectralMethod::Periodogram => {
                spectrum::periodogram(signal, self.resample_rate, self.segment_floor)
            }
        }
    }
}
