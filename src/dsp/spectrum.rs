//! Power spectral density estimators
//!
//! Three estimators are available for breathing-rate extraction:
//! - raw FFT power (`|FFT(x)/N|²` over the first half of the bins)
//! - Welch's averaged periodogram (Hann window, 50 % overlap)
//! - zero-padded boxcar periodogram
//!
//! Welch and the periodogram remove the mean and use density scaling with
//! one-sided doubling.

use rustfft::{num_complex::Complex, FftPlanner};
use std::f64::consts::PI;

use crate::error::{SignalError, SignalResult};

/// Frequencies (Hz) and power per bin
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    pub freqs: Vec<f64>,
    pub power: Vec<f64>,
}

impl Spectrum {
    /// Frequency of the bin with the most power
    pub fn peak_frequency(&self) -> Option<f64> {
        super::stats::argmax(&self.power).map(|i| self.freqs[i])
    }
}

/// Forward FFT of a real signal, zero-padded to `nfft`
fn real_fft(data: &[f64], nfft: usize) -> Vec<Complex<f64>> {
    let mut buffer: Vec<Complex<f64>> = data
        .iter()
        .take(nfft)
        .map(|&x| Complex::new(x, 0.0))
        .collect();
    buffer.resize(nfft, Complex::new(0.0, 0.0));

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(nfft);
    fft.process(&mut buffer);
    buffer
}

/// Plain FFT power: first `N/2` bins of `|FFT(x)/N|²`
pub fn fft_power(data: &[f64], sample_rate: f64) -> SignalResult<Spectrum> {
    let n = data.len();
    if n < 2 {
        return Err(SignalError::InsufficientData(format!(
            "FFT needs at least 2 samples, got {}",
            n
        )));
    }

    let spectrum = real_fft(data, n);
    let half = n / 2;
    let scale = n as f64;
    let freqs = (0..half).map(|k| k as f64 * sample_rate / n as f64).collect();
    let power = spectrum[..half]
        .iter()
        .map(|c| (*c / scale).norm_sqr())
        .collect();

    Ok(Spectrum { freqs, power })
}

/// Periodic Hann window of length `n`
fn hann_window(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / n as f64).cos())
        .collect()
}

/// One-sided, density-scaled power of a detrended, windowed segment
fn segment_density(segment: &[f64], window: &[f64], nfft: usize, sample_rate: f64) -> Vec<f64> {
    let mean = super::stats::mean(segment);
    let windowed: Vec<f64> = segment
        .iter()
        .zip(window)
        .map(|(x, w)| (x - mean) * w)
        .collect();

    let spectrum = real_fft(&windowed, nfft);
    let scale = 1.0 / (sample_rate * window.iter().map(|w| w * w).sum::<f64>());
    let bins = nfft / 2 + 1;

    (0..bins)
        .map(|k| {
            let mut p = spectrum[k].norm_sqr() * scale;
            let is_nyquist = nfft % 2 == 0 && k == nfft / 2;
            if k != 0 && !is_nyquist {
                p *= 2.0;
            }
            p
        })
        .collect()
}

fn onesided_freqs(nfft: usize, sample_rate: f64) -> Vec<f64> {
    (0..nfft / 2 + 1)
        .map(|k| k as f64 * sample_rate / nfft as f64)
        .collect()
}

/// Welch's method with `nperseg`-sample Hann segments and 50 % overlap
pub fn welch(data: &[f64], sample_rate: f64, nperseg: usize) -> SignalResult<Spectrum> {
    if nperseg < 2 || data.len() < nperseg {
        return Err(SignalError::InsufficientData(format!(
            "Welch needs segments of at least 2 samples within {} samples (nperseg {})",
            data.len(),
            nperseg
        )));
    }

    let window = hann_window(nperseg);
    let step = nperseg - nperseg / 2;
    let mut accumulated = vec![0.0; nperseg / 2 + 1];
    let mut segments = 0usize;

    let mut start = 0;
    while start + nperseg <= data.len() {
        let density = segment_density(&data[start..start + nperseg], &window, nperseg, sample_rate);
        for (acc, p) in accumulated.iter_mut().zip(density) {
            *acc += p;
        }
        segments += 1;
        start += step;
    }

    let power = accumulated
        .into_iter()
        .map(|p| p / segments as f64)
        .collect();

    Ok(Spectrum {
        freqs: onesided_freqs(nperseg, sample_rate),
        power,
    })
}

/// Boxcar periodogram over `nfft` bins.
///
/// Shorter input is zero-padded; input longer than `nfft` is truncated to its
/// first `nfft` samples.
pub fn periodogram(data: &[f64], sample_rate: f64, nfft: usize) -> SignalResult<Spectrum> {
    if data.len() < 2 || nfft < 2 {
        return Err(SignalError::InsufficientData(format!(
            "periodogram needs at least 2 samples, got {} (nfft {})",
            data.len(),
            nfft
        )));
    }

    let data = &data[..data.len().min(nfft)];
    let window = vec![1.0; data.len()];
    Ok(Spectrum {
        freqs: onesided_freqs(nfft, sample_rate),
        power: segment_density(data, &window, nfft, sample_rate),
    })
}
