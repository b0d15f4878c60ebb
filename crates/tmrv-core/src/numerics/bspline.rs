//! Weighted least-squares fitting of uniform cubic B-splines.
//!
//! The coadded template is a cubic B-spline on an equidistant knot grid.
//! The normal equations are banded with bandwidth 3, so the fit runs in
//! O(pixels + knots) with a banded Cholesky factorization. An optional
//! second-difference penalty on the coefficients smooths the curve and an
//! optional weak prior keeps coefficients bounded over unconstrained gaps.

/// Bandwidth of the normal matrix for cubic basis functions.
const BAND: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum BSplineError {
    #[error("B-spline fit needs at least 2 knots, got {0}")]
    TooFewKnots(usize),
    #[error("B-spline domain is empty or not increasing")]
    EmptyDomain,
    #[error("no usable pixels for the B-spline fit")]
    NoData,
    #[error("B-spline normal matrix is not positive definite (column {0})")]
    NotPositiveDefinite(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BSplineFitConfig {
    /// Number of knots spanning the domain.
    pub n_knots: usize,
    /// Inclusive fit domain; pixels outside are ignored.
    pub domain: (f64, f64),
    /// Weight of the second-difference penalty on the coefficients.
    pub smoothing: f64,
    /// Weight of the pull of every coefficient toward the weighted data mean.
    pub mean_prior_weight: f64,
}

/// A fitted uniform cubic B-spline plus per-knot coverage bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct BSplineFit {
    origin: f64,
    spacing: f64,
    n_knots: usize,
    coeffs: Vec<f64>,
    knot_weight: Vec<f64>,
    knot_count: Vec<u32>,
}

/// Basis values of the four cubic segments at local parameter `u` in [0, 1].
pub fn basis_weights(u: f64) -> [f64; 4] {
    let v = 1.0 - u;
    [
        v * v * v / 6.0,
        (3.0 * u * u * u - 6.0 * u * u + 4.0) / 6.0,
        (-3.0 * u * u * u + 3.0 * u * u + 3.0 * u + 1.0) / 6.0,
        u * u * u / 6.0,
    ]
}

pub fn fit(
    config: &BSplineFitConfig,
    x: &[f64],
    y: &[f64],
    w: &[f64],
) -> Result<BSplineFit, BSplineError> {
    let k = config.n_knots;
    if k < 2 {
        return Err(BSplineError::TooFewKnots(k));
    }
    let (a, b) = config.domain;
    if !(b > a) || !a.is_finite() || !b.is_finite() {
        return Err(BSplineError::EmptyDomain);
    }
    let spacing = (b - a) / (k - 1) as f64;
    let n = k + 2;

    let mut band = vec![0.0; (BAND + 1) * n];
    let mut rhs = vec![0.0; n];
    let mut knot_weight = vec![0.0; k];
    let mut knot_count = vec![0u32; k];
    let mut wsum = 0.0;
    let mut wysum = 0.0;
    let mut used = 0usize;

    for ((&xi, &yi), &wi) in x.iter().zip(y).zip(w) {
        if !(wi > 0.0) || !xi.is_finite() || !yi.is_finite() || xi < a || xi > b {
            continue;
        }
        let t = (xi - a) / spacing;
        let seg = (t as usize).min(k - 2);
        let bw = basis_weights(t - seg as f64);
        for (i, &bi) in bw.iter().enumerate() {
            let col = seg + i;
            rhs[col] += wi * bi * yi;
            for (j, &bj) in bw.iter().enumerate().skip(i) {
                band[(j - i) * n + col] += wi * bi * bj;
            }
            // Coefficient seg+i is centered on knot seg+i-1.
            let knot = (seg + i).saturating_sub(1).min(k - 1);
            knot_weight[knot] += wi * bi;
        }
        knot_count[(t.round() as usize).min(k - 1)] += 1;
        wsum += wi;
        wysum += wi * yi;
        used += 1;
    }
    if used == 0 {
        return Err(BSplineError::NoData);
    }

    if config.smoothing > 0.0 && n >= 3 {
        let stencil = [1.0, -2.0, 1.0];
        for start in 0..n - 2 {
            for (i, &si) in stencil.iter().enumerate() {
                for (j, &sj) in stencil.iter().enumerate().skip(i) {
                    band[(j - i) * n + start + i] += config.smoothing * si * sj;
                }
            }
        }
    }
    if config.mean_prior_weight > 0.0 {
        let mean = wysum / wsum;
        for col in 0..n {
            band[col] += config.mean_prior_weight;
            rhs[col] += config.mean_prior_weight * mean;
        }
    }

    let coeffs = solve_banded_spd(&mut band, &rhs, n)?;
    Ok(BSplineFit {
        origin: a,
        spacing,
        n_knots: k,
        coeffs,
        knot_weight,
        knot_count,
    })
}

/// Cholesky solve of a symmetric positive definite band system. `band`
/// holds the lower band columnwise, `band[r * n + i] = A[i + r, i]`, and is
/// overwritten with the factor.
fn solve_banded_spd(band: &mut [f64], rhs: &[f64], n: usize) -> Result<Vec<f64>, BSplineError> {
    for j in 0..n {
        for r in 0..=BAND.min(n - 1 - j) {
            let mut sum = band[r * n + j];
            let lo = (j + r).saturating_sub(BAND).min(j);
            for t in lo..j {
                sum -= band[(j - t) * n + t] * band[(j + r - t) * n + t];
            }
            if r == 0 {
                if !(sum > 0.0) {
                    return Err(BSplineError::NotPositiveDefinite(j));
                }
                band[j] = sum.sqrt();
            } else {
                band[r * n + j] = sum / band[j];
            }
        }
    }
    let mut z = vec![0.0; n];
    for i in 0..n {
        let mut sum = rhs[i];
        for t in i.saturating_sub(BAND)..i {
            sum -= band[(i - t) * n + t] * z[t];
        }
        z[i] = sum / band[i];
    }
    let mut c = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = z[i];
        for r in 1..=BAND.min(n - 1 - i) {
            sum -= band[r * n + i] * c[i + r];
        }
        c[i] = sum / band[i];
    }
    Ok(c)
}

impl BSplineFit {
    /// Series with the coefficients given directly, `coeffs.len()` = knots + 2.
    /// Coverage bookkeeping is empty; only evaluation is meaningful.
    pub fn from_coefficients(
        coeffs: Vec<f64>,
        domain: (f64, f64),
    ) -> Result<Self, BSplineError> {
        let k = coeffs.len().saturating_sub(2);
        if k < 2 {
            return Err(BSplineError::TooFewKnots(k));
        }
        let (a, b) = domain;
        if !(b > a) || !a.is_finite() || !b.is_finite() {
            return Err(BSplineError::EmptyDomain);
        }
        Ok(Self {
            origin: a,
            spacing: (b - a) / (k - 1) as f64,
            n_knots: k,
            coeffs,
            knot_weight: vec![0.0; k],
            knot_count: vec![0; k],
        })
    }

    pub fn n_knots(&self) -> usize {
        self.n_knots
    }

    pub fn spacing(&self) -> f64 {
        self.spacing
    }

    pub fn knot_positions(&self) -> Vec<f64> {
        (0..self.n_knots)
            .map(|j| self.origin + j as f64 * self.spacing)
            .collect()
    }

    /// Index of the knot nearest to `x`, clamped to the grid.
    pub fn nearest_knot(&self, x: f64) -> usize {
        let t = (x - self.origin) / self.spacing;
        (t.round().max(0.0) as usize).min(self.n_knots - 1)
    }

    pub fn eval(&self, x: f64) -> f64 {
        let t = ((x - self.origin) / self.spacing).clamp(0.0, (self.n_knots - 1) as f64);
        let seg = (t as usize).min(self.n_knots - 2);
        let bw = basis_weights(t - seg as f64);
        bw.iter()
            .enumerate()
            .map(|(i, &b)| b * self.coeffs[seg + i])
            .sum()
    }

    pub fn eval_many(&self, xs: &[f64]) -> Vec<f64> {
        xs.iter().map(|&x| self.eval(x)).collect()
    }

    /// Spline values at the knots, `(c[j] + 4 c[j+1] + c[j+2]) / 6`.
    pub fn knot_values(&self) -> Vec<f64> {
        (0..self.n_knots)
            .map(|j| (self.coeffs[j] + 4.0 * self.coeffs[j + 1] + self.coeffs[j + 2]) / 6.0)
            .collect()
    }

    /// Second derivatives at the knots, `(c[j] - 2 c[j+1] + c[j+2]) / h^2`.
    pub fn knot_second_derivatives(&self) -> Vec<f64> {
        let h2 = self.spacing * self.spacing;
        (0..self.n_knots)
            .map(|j| (self.coeffs[j] - 2.0 * self.coeffs[j + 1] + self.coeffs[j + 2]) / h2)
            .collect()
    }

    /// Effective statistical weight accumulated around each knot.
    pub fn knot_weight_sums(&self) -> &[f64] {
        &self.knot_weight
    }

    /// Number of pixels whose nearest knot is each knot.
    pub fn knot_counts(&self) -> &[u32] {
        &self.knot_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense_grid(n: usize, a: f64, b: f64) -> Vec<f64> {
        (0..n).map(|i| a + (b - a) * i as f64 / (n - 1) as f64).collect()
    }

    #[test]
    fn basis_weights_are_a_partition_of_unity() {
        for u in [0.0, 0.25, 0.5, 0.99, 1.0] {
            let sum: f64 = basis_weights(u).iter().sum();
            assert!((sum - 1.0).abs() < 1e-14, "at u={u}");
        }
    }

    #[test]
    fn unpenalized_fit_reproduces_a_line() {
        let config = BSplineFitConfig {
            n_knots: 8,
            domain: (0.0, 1.0),
            smoothing: 0.0,
            mean_prior_weight: 0.0,
        };
        let x = dense_grid(200, 0.0, 1.0);
        let y: Vec<f64> = x.iter().map(|&v| 2.0 * v + 1.0).collect();
        let w = vec![1.0; x.len()];

        let fit = fit(&config, &x, &y, &w).expect("well conditioned");
        for (pos, val) in fit.knot_positions().into_iter().zip(fit.knot_values()) {
            assert!((val - (2.0 * pos + 1.0)).abs() < 1e-8, "at knot {pos}");
        }
        assert!((fit.eval(0.37) - (2.0 * 0.37 + 1.0)).abs() < 1e-8);
        for d2 in fit.knot_second_derivatives() {
            assert!(d2.abs() < 1e-6);
        }
    }

    #[test]
    fn penalty_leaves_constant_data_untouched() {
        let config = BSplineFitConfig {
            n_knots: 6,
            domain: (0.0, 10.0),
            smoothing: 25.0,
            mean_prior_weight: 0.0,
        };
        let x = dense_grid(120, 0.0, 10.0);
        let y = vec![5.0; x.len()];
        let w = vec![0.5; x.len()];

        let fit = fit(&config, &x, &y, &w).expect("well conditioned");
        for val in fit.knot_values() {
            assert!((val - 5.0).abs() < 1e-9);
        }
    }

    #[test]
    fn coverage_bookkeeping_accounts_for_every_pixel() {
        let config = BSplineFitConfig {
            n_knots: 5,
            domain: (0.0, 4.0),
            smoothing: 0.0,
            mean_prior_weight: 0.0,
        };
        let x = dense_grid(97, 0.0, 4.0);
        let y: Vec<f64> = x.iter().map(|&v| v.sin()).collect();
        let w = vec![2.0; x.len()];

        let fit = fit(&config, &x, &y, &w).expect("well conditioned");
        let total: u32 = fit.knot_counts().iter().sum();
        assert_eq!(total as usize, x.len());
        let weight: f64 = fit.knot_weight_sums().iter().sum();
        assert!((weight - 2.0 * x.len() as f64).abs() < 1e-9);
    }

    #[test]
    fn uncovered_knots_make_the_system_singular() {
        let config = BSplineFitConfig {
            n_knots: 10,
            domain: (0.0, 9.0),
            smoothing: 0.0,
            mean_prior_weight: 0.0,
        };
        // Pixels only in the first interval.
        let x = dense_grid(30, 0.0, 0.9);
        let y = vec![1.0; x.len()];
        let w = vec![1.0; x.len()];

        assert!(matches!(
            fit(&config, &x, &y, &w),
            Err(BSplineError::NotPositiveDefinite(_))
        ));
    }

    #[test]
    fn mean_prior_bridges_uncovered_regions() {
        let config = BSplineFitConfig {
            n_knots: 10,
            domain: (0.0, 9.0),
            smoothing: 0.0,
            mean_prior_weight: 1e-4,
        };
        let x = dense_grid(30, 0.0, 0.9);
        let y = vec![3.0; x.len()];
        let w = vec![1.0; x.len()];

        let fit = fit(&config, &x, &y, &w).expect("prior regularizes");
        // Far from the data the curve relaxes to the weighted mean.
        assert!((fit.eval(8.5) - 3.0).abs() < 1e-6);
    }

    #[test]
    fn no_usable_pixels_is_reported() {
        let config = BSplineFitConfig {
            n_knots: 4,
            domain: (0.0, 1.0),
            smoothing: 0.0,
            mean_prior_weight: 0.0,
        };
        let x = [0.2, 0.4, f64::NAN];
        let y = [1.0, 2.0, 3.0];
        let w = [0.0, 0.0, 1.0];
        assert_eq!(fit(&config, &x, &y, &w), Err(BSplineError::NoData));
    }
}
