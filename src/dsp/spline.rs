//! Natural cubic spline interpolation

use crate::error::{SignalError, SignalResult};

/// Minimum knots for a cubic fit
pub const MIN_SPLINE_POINTS: usize = 4;

/// Interpolating cubic spline with natural (zero second derivative) ends
#[derive(Debug, Clone)]
pub struct CubicSpline {
    x: Vec<f64>,
    y: Vec<f64>,
    /// Second derivatives at the knots
    m: Vec<f64>,
}

impl CubicSpline {
    /// Fit through `(x, y)`; `x` must be strictly increasing
    pub fn new(x: &[f64], y: &[f64]) -> SignalResult<Self> {
        if x.len() != y.len() {
            return Err(SignalError::BadSignal(format!(
                "spline knots mismatch: {} x vs {} y",
                x.len(),
                y.len()
            )));
        }
        if x.len() < MIN_SPLINE_POINTS {
            return Err(SignalError::InsufficientData(format!(
                "cubic spline needs {} points, got {}",
                MIN_SPLINE_POINTS,
                x.len()
            )));
        }
        if x.windows(2).any(|w| w[1] <= w[0]) {
            return Err(SignalError::BadSignal(
                "spline knots must be strictly increasing".to_string(),
            ));
        }

        let n = x.len();
        let h: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();

        // Tridiagonal system for interior second derivatives (Thomas algorithm)
        let mut m = vec![0.0; n];
        let mut diag = vec![0.0; n];
        let mut rhs = vec![0.0; n];
        for i in 1..n - 1 {
            diag[i] = 2.0 * (h[i - 1] + h[i]);
            rhs[i] = 6.0 * ((y[i + 1] - y[i]) / h[i] - (y[i] - y[i - 1]) / h[i - 1]);
        }
        for i in 2..n - 1 {
            let factor = h[i - 1] / diag[i - 1];
            diag[i] -= factor * h[i - 1];
            rhs[i] -= factor * rhs[i - 1];
        }
        for i in (1..n - 1).rev() {
            let upper = if i + 1 < n - 1 { h[i] * m[i + 1] } else { 0.0 };
            m[i] = (rhs[i] - upper) / diag[i];
        }

        Ok(Self {
            x: x.to_vec(),
            y: y.to_vec(),
            m,
        })
    }

    /// Evaluate at `t`; outside the knot range the end polynomials extrapolate
    pub fn eval(&self, t: f64) -> f64 {
        let n = self.x.len();
        let i = self.x.partition_point(|&v| v <= t).clamp(1, n - 1) - 1;
        let h = self.x[i + 1] - self.x[i];
        let a = (self.x[i + 1] - t) / h;
        let b = (t - self.x[i]) / h;
        a * self.y[i]
            + b * self.y[i + 1]
            + ((a * a * a - a) * self.m[i] + (b * b * b - b) * self.m[i + 1]) * h * h / 6.0
    }

    /// Evaluate at every point of `ts`
    pub fn eval_many(&self, ts: &[f64]) -> Vec<f64> {
        ts.iter().map(|&t| self.eval(t)).collect()
    }
}

/// `count` evenly spaced points over `[start, stop]`, both ends included
pub fn linspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (count - 1) as f64;
            (0..count).map(|i| start + step * i as f64).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passes_through_knots() {
        let x = [0.0, 1.0, 2.0, 3.0, 4.0];
        let y = [1.0, 3.0, 2.0, 5.0, 4.0];
        let spline = CubicSpline::new(&x, &y).unwrap();
        for (xi, yi) in x.iter().zip(y.iter()) {
            assert!((spline.eval(*xi) - yi).abs() < 1e-9);
        }
    }

    #[test]
    fn test_reproduces_linear_data() {
        let x = [0.0, 1.0, 2.5, 4.0];
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v + 1.0).collect();
        let spline = CubicSpline::new(&x, &y).unwrap();
        assert!((spline.eval(1.75) - 4.5).abs() < 1e-9);
        assert!((spline.eval(3.0) - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_short_or_unsorted_input() {
        assert!(matches!(
            CubicSpline::new(&[0.0, 1.0, 2.0], &[1.0, 2.0, 3.0]),
            Err(SignalError::InsufficientData(_))
        ));
        assert!(matches!(
            CubicSpline::new(&[0.0, 2.0, 1.0, 3.0], &[1.0, 2.0, 3.0, 4.0]),
            Err(SignalError::BadSignal(_))
        ));
    }

    #[test]
    fn test_linspace() {
        assert_eq!(linspace(0.0, 4.0, 5), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(linspace(2.0, 4.0, 1), vec![2.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }
}
