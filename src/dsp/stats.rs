//! Descriptive statistics over sample slices
//!
//! Percentiles use linear interpolation between closest ranks, so results line
//! up with the usual `percentile(data, q)` definition on sorted data.

/// Arithmetic mean; NaN for an empty slice
pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return f64::NAN;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Population standard deviation (divides by `n`); NaN for an empty slice
pub fn std_dev(data: &[f64]) -> f64 {
    variance(data, 0).sqrt()
}

/// Sample standard deviation (divides by `n - 1`); NaN below two samples
pub fn sample_std_dev(data: &[f64]) -> f64 {
    variance(data, 1).sqrt()
}

fn variance(data: &[f64], ddof: usize) -> f64 {
    if data.len() <= ddof {
        return f64::NAN;
    }
    let m = mean(data);
    let sum_sq: f64 = data.iter().map(|x| (x - m) * (x - m)).sum();
    sum_sq / (data.len() - ddof) as f64
}

/// Percentile `q` (0–100) with linear interpolation; NaN for an empty slice
pub fn percentile(data: &[f64], q: f64) -> f64 {
    let sorted = sorted_copy(data);
    percentile_sorted(&sorted, q)
}

/// Several percentiles with a single sort
pub fn percentiles<const N: usize>(data: &[f64], qs: [f64; N]) -> [f64; N] {
    let sorted = sorted_copy(data);
    qs.map(|q| percentile_sorted(&sorted, q))
}

fn sorted_copy(data: &[f64]) -> Vec<f64> {
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Peak-to-peak amplitude (max − min); 0 for an empty slice
pub fn peak_to_peak(data: &[i32]) -> f64 {
    let (min, max) = data
        .iter()
        .fold((i32::MAX, i32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if data.is_empty() {
        0.0
    } else {
        max as f64 - min as f64
    }
}

/// Index of the largest value, ignoring NaN
pub fn argmax(data: &[f64]) -> Option<usize> {
    data.iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i)
}

/// Piecewise-linear interpolation of `(xp, fp)` at `x`.
///
/// `xp` must be increasing. Points left of `xp[0]` take `fp[0]`, points right of
/// the last knot take the last value.
pub fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    debug_assert_eq!(xp.len(), fp.len());
    match xp.len() {
        0 => f64::NAN,
        1 => fp[0],
        n => {
            if x <= xp[0] {
                return fp[0];
            }
            if x >= xp[n - 1] {
                return fp[n - 1];
            }
            let hi = xp.partition_point(|&v| v <= x);
            let lo = hi - 1;
            let span = xp[hi] - xp[lo];
            if span == 0.0 {
                return fp[lo];
            }
            fp[lo] + (fp[hi] - fp[lo]) * (x - xp[lo]) / span
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_std() {
        let data = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((mean(&data) - 5.0).abs() < 1e-12);
        assert!((std_dev(&data) - 2.0).abs() < 1e-12);
        assert!((sample_std_dev(&data) - 2.138_089_935).abs() < 1e-6);
        assert!(mean(&[]).is_nan());
        assert!(sample_std_dev(&[1.0]).is_nan());
    }

    #[test]
    fn test_percentile_interpolates() {
        let data = [1.0, 2.0, 3.0, 4.0];
        assert!((percentile(&data, 50.0) - 2.5).abs() < 1e-12);
        assert!((percentile(&data, 0.0) - 1.0).abs() < 1e-12);
        assert!((percentile(&data, 100.0) - 4.0).abs() < 1e-12);
        let [p15, p80] = percentiles(&[4.0, 1.0, 3.0, 2.0], [15.0, 80.0]);
        assert!((p15 - 1.45).abs() < 1e-12);
        assert!((p80 - 3.4).abs() < 1e-12);
    }

    #[test]
    fn test_peak_to_peak() {
        assert_eq!(peak_to_peak(&[-5, 10, 3]), 15.0);
        assert_eq!(peak_to_peak(&[]), 0.0);
    }

    #[test]
    fn test_interp() {
        let xp = [0.0, 2.0, 4.0];
        let fp = [0.0, 10.0, 0.0];
        assert!((interp(1.0, &xp, &fp) - 5.0).abs() < 1e-12);
        assert!((interp(-1.0, &xp, &fp) - 0.0).abs() < 1e-12);
        assert!((interp(3.0, &xp, &fp) - 5.0).abs() < 1e-12);
        assert!((interp(9.0, &xp, &fp) - 0.0).abs() < 1e-12);
    }

    #[test]
    fn test_argmax_skips_nan() {
        assert_eq!(argmax(&[1.0, f64::NAN, 3.0, 2.0]), Some(2));
        assert_eq!(argmax(&[]), None);
    }
}
