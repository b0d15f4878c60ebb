//! Natural cubic spline interpolation with pre-computed second derivatives.
//!
//! The template and the oversampled model grids are represented this way;
//! evaluation, first and second derivatives all come from the same
//! coefficient set, which is what the line-width estimator needs.

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SplineError {
    #[error("cubic spline needs at least 3 points, got {len}")]
    TooFewPoints { len: usize },
    #[error("spline grid must be finite and strictly increasing, violated at index {index}")]
    NonIncreasingGrid { index: usize },
    #[error("spline inputs must share one length, got x {x} and y {y}")]
    MismatchedLengths { x: usize, y: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CubicSpline {
    x: Vec<f64>,
    y: Vec<f64>,
    /// Second derivatives at the grid points (zero at both ends).
    d2: Vec<f64>,
}

impl CubicSpline {
    /// Fits the natural spline through `(x, y)`; tridiagonal solve for the
    /// interior second derivatives, free boundary at both ends.
    pub fn natural(x: Vec<f64>, y: Vec<f64>) -> Result<Self, SplineError> {
        if x.len() != y.len() {
            return Err(SplineError::MismatchedLengths {
                x: x.len(),
                y: y.len(),
            });
        }
        let n = x.len();
        if n < 3 {
            return Err(SplineError::TooFewPoints { len: n });
        }
        for (index, pair) in x.windows(2).enumerate() {
            if !pair[0].is_finite() || !(pair[1] > pair[0]) {
                return Err(SplineError::NonIncreasingGrid { index });
            }
        }
        if !x[n - 1].is_finite() {
            return Err(SplineError::NonIncreasingGrid { index: n - 1 });
        }

        // Thomas sweep over the n-2 interior equations.
        let m = n - 2;
        let mut diag = vec![0.0; m];
        let mut upper = vec![0.0; m];
        let mut rhs = vec![0.0; m];
        for i in 0..m {
            let h_lo = x[i + 1] - x[i];
            let h_hi = x[i + 2] - x[i + 1];
            diag[i] = (h_lo + h_hi) / 3.0;
            upper[i] = h_hi / 6.0;
            rhs[i] = (y[i + 2] - y[i + 1]) / h_hi - (y[i + 1] - y[i]) / h_lo;
        }
        for i in 1..m {
            let lower = (x[i + 1] - x[i]) / 6.0;
            let factor = lower / diag[i - 1];
            diag[i] -= factor * upper[i - 1];
            rhs[i] -= factor * rhs[i - 1];
        }
        let mut d2 = vec![0.0; n];
        if m > 0 {
            d2[m] = rhs[m - 1] / diag[m - 1];
            for i in (0..m - 1).rev() {
                d2[i + 1] = (rhs[i] - upper[i] * d2[i + 2]) / diag[i];
            }
        }

        Ok(Self { x, y, d2 })
    }

    fn bracket(&self, x: f64) -> usize {
        match self.x.partition_point(|&v| v < x) {
            i if i >= self.x.len() => self.x.len() - 1,
            0 => 1,
            i => i,
        }
    }

    pub fn eval(&self, x: f64) -> f64 {
        let hi = self.bracket(x);
        let lo = hi - 1;
        let h = self.x[hi] - self.x[lo];
        let a = (self.x[hi] - x) / h;
        let b = (x - self.x[lo]) / h;
        a * self.y[lo]
            + b * self.y[hi]
            + (h * h / 6.0) * ((a * a - 1.0) * a * self.d2[lo] + (b * b - 1.0) * b * self.d2[hi])
    }

    pub fn eval_many(&self, xs: &[f64]) -> Vec<f64> {
        xs.iter().map(|&x| self.eval(x)).collect()
    }

    pub fn derivative(&self, x: f64) -> f64 {
        let hi = self.bracket(x);
        let lo = hi - 1;
        let h = self.x[hi] - self.x[lo];
        let a = (self.x[hi] - x) / h;
        let b = (x - self.x[lo]) / h;
        (self.y[hi] - self.y[lo]) / h
            + (h / 6.0) * ((3.0 * b * b - 1.0) * self.d2[hi] - (3.0 * a * a - 1.0) * self.d2[lo])
    }

    pub fn second_derivative(&self, x: f64) -> f64 {
        let hi = self.bracket(x);
        let lo = hi - 1;
        let h = self.x[hi] - self.x[lo];
        let a = (self.x[hi] - x) / h;
        let b = (x - self.x[lo]) / h;
        a * self.d2[lo] + b * self.d2[hi]
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn second_derivatives(&self) -> &[f64] {
        &self.d2
    }

    pub fn domain(&self) -> (f64, f64) {
        (self.x[0], self.x[self.x.len() - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sin_spline(n: usize) -> CubicSpline {
        let x: Vec<f64> = (0..n)
            .map(|i| std::f64::consts::PI * i as f64 / (n - 1) as f64)
            .collect();
        let y: Vec<f64> = x.iter().map(|&v| v.sin()).collect();
        CubicSpline::natural(x, y).expect("valid grid")
    }

    #[test]
    fn passes_through_the_knots() {
        let spline = sin_spline(20);
        for (&x, &y) in spline.x().iter().zip(spline.y().iter()) {
            assert!((spline.eval(x) - y).abs() < 1e-12);
        }
    }

    #[test]
    fn linear_data_reproduces_the_line_exactly() {
        let x: Vec<f64> = (0..10).map(|i| 0.3 * i as f64).collect();
        let y: Vec<f64> = x.iter().map(|&v| 2.0 * v - 1.0).collect();
        let spline = CubicSpline::natural(x, y).expect("valid grid");

        assert!((spline.eval(1.23) - (2.0 * 1.23 - 1.0)).abs() < 1e-12);
        assert!((spline.derivative(0.71) - 2.0).abs() < 1e-12);
        assert!(spline.second_derivative(1.5).abs() < 1e-12);
    }

    #[test]
    fn interpolates_sine_with_natural_end_conditions() {
        // sin'' vanishes at 0 and pi, so natural boundaries are exact here.
        let spline = sin_spline(50);
        for k in 1..40 {
            let x = 0.07 * k as f64;
            assert!((spline.eval(x) - x.sin()).abs() < 1e-5, "at x={x}");
        }
    }

    #[test]
    fn derivatives_track_the_analytic_ones() {
        let spline = sin_spline(80);
        let x = 1.1;
        assert!((spline.derivative(x) - x.cos()).abs() < 1e-3);
        assert!((spline.second_derivative(x) + x.sin()).abs() < 5e-2);
    }

    #[test]
    fn non_increasing_grid_is_rejected() {
        let result = CubicSpline::natural(vec![0.0, 1.0, 1.0, 2.0], vec![0.0; 4]);
        assert_eq!(result, Err(SplineError::NonIncreasingGrid { index: 1 }));
    }
}
