//! Continuum-polynomial Doppler model and its weighted linear regression.
//!
//! The model of an observed order is `poly(w - wcen) * T(rho(w, v))`: the
//! template evaluated in its rest frame times a low-order continuum
//! polynomial. At fixed velocity the polynomial coefficients follow from a
//! weighted linear least-squares solve; the velocity dependence is handled
//! by the grid search one level up.

use faer::Mat;

use crate::common::constants::TEMPLATE_FLUX_FLOOR;
use crate::numerics::spline::CubicSpline;
use crate::spectrum::WaveScale;

/// Sentinel reported when the normal matrix is not positive definite,
/// typically because every pixel weight collapsed to zero.
pub const DEGENERATE_SSR: f64 = -1.0;

/// Everything the per-velocity regression needs, borrowed from the order
/// and the template. `wavelength_center` stays fixed across one clipping
/// pass so the polynomial basis does not drift between velocities.
#[derive(Clone, Copy)]
pub struct DopplerDesign<'a> {
    pub wavelength: &'a [f64],
    pub flux: &'a [f64],
    pub error: &'a [f64],
    pub template: &'a CubicSpline,
    pub scale: WaveScale,
    pub degree: usize,
    pub wavelength_center: f64,
}

/// One fixed-velocity regression result.
#[derive(Debug, Clone, PartialEq)]
pub struct PolyFit {
    pub coeffs: Vec<f64>,
    pub e_coeffs: Vec<f64>,
    pub ssr: f64,
    /// Pixels that entered the regression after the template floor cut.
    pub n_used: usize,
}

impl PolyFit {
    pub fn is_degenerate(&self) -> bool {
        self.ssr < 0.0
    }

    fn degenerate(n_params: usize) -> Self {
        Self {
            coeffs: vec![0.0; n_params],
            e_coeffs: vec![f64::NAN; n_params],
            ssr: DEGENERATE_SSR,
            n_used: 0,
        }
    }
}

/// Error-weighted center of the kept wavelengths; the expansion point of
/// the continuum polynomial.
pub fn weighted_center(wavelength: &[f64], error: &[f64], keep: &[usize]) -> f64 {
    let mut wsum = 0.0;
    let mut acc = 0.0;
    for &i in keep {
        let w = 1.0 / (error[i] * error[i]);
        wsum += w;
        acc += w * wavelength[i];
    }
    if wsum > 0.0 {
        acc / wsum
    } else {
        f64::NAN
    }
}

/// Continuum polynomial alone at arbitrary wavelengths, without the
/// template factor.
pub fn continuum(coeffs: &[f64], wavelength_center: f64, wavelength: &[f64]) -> Vec<f64> {
    wavelength
        .iter()
        .map(|&w| {
            let u = w - wavelength_center;
            let mut poly = 0.0;
            for &c in coeffs.iter().rev() {
                poly = poly * u + c;
            }
            poly
        })
        .collect()
}

impl<'a> DopplerDesign<'a> {
    /// Template evaluated at the rest-frame wavelength of pixel `i` for a
    /// trial velocity.
    fn shifted_template(&self, i: usize, velocity_kms: f64) -> f64 {
        self.template
            .eval(self.scale.to_rest_frame(self.wavelength[i], velocity_kms))
    }

    /// Weighted linear least squares for the continuum polynomial at a
    /// fixed trial velocity. Pixels whose shifted template drops below the
    /// flux floor are left out; a non-positive-definite normal matrix
    /// yields the degenerate sentinel instead of an error.
    pub fn fit_at(&self, keep: &[usize], velocity_kms: f64) -> PolyFit {
        let n_params = self.degree + 1;

        // Condition the basis on the wavelength spread before solving.
        let mut spread = 0.0f64;
        for &i in keep {
            spread = spread.max((self.wavelength[i] - self.wavelength_center).abs());
        }
        if !(spread > 0.0) {
            spread = 1.0;
        }

        let mut normal = Mat::<f64>::zeros(n_params, n_params);
        let mut rhs = vec![0.0; n_params];
        let mut n_used = 0usize;
        let mut powers = vec![0.0; n_params];
        for &i in keep {
            let t = self.shifted_template(i, velocity_kms);
            if !(t > TEMPLATE_FLUX_FLOOR) {
                continue;
            }
            let e = self.error[i];
            if !(e > 0.0) || !e.is_finite() {
                continue;
            }
            let w = 1.0 / (e * e);
            let u = (self.wavelength[i] - self.wavelength_center) / spread;
            powers[0] = t;
            for j in 1..n_params {
                powers[j] = powers[j - 1] * u;
            }
            for j in 0..n_params {
                rhs[j] += w * powers[j] * self.flux[i];
                for k in j..n_params {
                    normal[(k, j)] += w * powers[j] * powers[k];
                }
            }
            n_used += 1;
        }
        if n_used < n_params {
            return PolyFit::degenerate(n_params);
        }

        let Some((scaled, inverse_diag)) = solve_normal(&mut normal, &rhs) else {
            return PolyFit::degenerate(n_params);
        };

        // Undo the conditioning scale on the way out.
        let mut coeffs = vec![0.0; n_params];
        let mut e_coeffs = vec![0.0; n_params];
        let mut unscale = 1.0;
        for j in 0..n_params {
            coeffs[j] = scaled[j] / unscale;
            e_coeffs[j] = inverse_diag[j].max(0.0).sqrt() / unscale;
            unscale *= spread;
        }

        let mut ssr = 0.0;
        for &i in keep {
            let t = self.shifted_template(i, velocity_kms);
            if !(t > TEMPLATE_FLUX_FLOOR) {
                continue;
            }
            let e = self.error[i];
            if !(e > 0.0) || !e.is_finite() {
                continue;
            }
            let u = (self.wavelength[i] - self.wavelength_center) / spread;
            let mut poly = 0.0;
            for &c in scaled.iter().rev() {
                poly = poly * u + c;
            }
            let r = (self.flux[i] - poly * t) / e;
            ssr += r * r;
        }

        PolyFit {
            coeffs,
            e_coeffs,
            ssr,
            n_used,
        }
    }

    /// Model values for every pixel in `keep` (no floor cut; pixels with a
    /// vanishing template simply get a vanishing model).
    pub fn model_at(&self, keep: &[usize], velocity_kms: f64, coeffs: &[f64]) -> Vec<f64> {
        keep.iter()
            .map(|&i| {
                let u = self.wavelength[i] - self.wavelength_center;
                let mut poly = 0.0;
                for &c in coeffs.iter().rev() {
                    poly = poly * u + c;
                }
                poly * self.shifted_template(i, velocity_kms)
            })
            .collect()
    }
}

/// Cholesky solve of the lower-triangular-filled normal matrix; also
/// returns the diagonal of the inverse for the coefficient errors.
fn solve_normal(normal: &mut Mat<f64>, rhs: &[f64]) -> Option<(Vec<f64>, Vec<f64>)> {
    let n = rhs.len();
    for j in 0..n {
        let mut d = normal[(j, j)];
        for t in 0..j {
            d -= normal[(j, t)] * normal[(j, t)];
        }
        if !(d > 0.0) {
            return None;
        }
        normal[(j, j)] = d.sqrt();
        for i in j + 1..n {
            let mut s = normal[(i, j)];
            for t in 0..j {
                s -= normal[(i, t)] * normal[(j, t)];
            }
            normal[(i, j)] = s / normal[(j, j)];
        }
    }

    let solve = |b: &[f64]| -> Vec<f64> {
        let mut z = vec![0.0; n];
        for i in 0..n {
            let mut s = b[i];
            for t in 0..i {
                s -= normal[(i, t)] * z[t];
            }
            z[i] = s / normal[(i, i)];
        }
        let mut x = vec![0.0; n];
        for i in (0..n).rev() {
            let mut s = z[i];
            for t in i + 1..n {
                s -= normal[(t, i)] * x[t];
            }
            x[i] = s / normal[(i, i)];
        }
        x
    };

    let coeffs = solve(rhs);
    let mut inverse_diag = vec![0.0; n];
    for k in 0..n {
        let mut unit = vec![0.0; n];
        unit[k] = 1.0;
        inverse_diag[k] = solve(&unit)[k];
    }
    Some((coeffs, inverse_diag))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_template(n: usize) -> CubicSpline {
        let x: Vec<f64> = (0..n).map(|i| 8.0 + 1e-4 * i as f64).collect();
        let y = vec![1.0; n];
        CubicSpline::natural(x, y).expect("valid grid")
    }

    #[test]
    fn recovers_a_known_continuum_polynomial() {
        let template = flat_template(64);
        let wavelength: Vec<f64> = (5..59).map(|i| 8.0 + 1e-4 * i as f64).collect();
        let center = wavelength[wavelength.len() / 2];
        let flux: Vec<f64> = wavelength
            .iter()
            .map(|&w| {
                let u = w - center;
                2.0 + 300.0 * u + 5.0e4 * u * u
            })
            .collect();
        let error = vec![0.01; wavelength.len()];
        let keep: Vec<usize> = (0..wavelength.len()).collect();

        let design = DopplerDesign {
            wavelength: &wavelength,
            flux: &flux,
            error: &error,
            template: &template,
            scale: WaveScale::LogLambda,
            degree: 2,
            wavelength_center: center,
        };
        let fit = design.fit_at(&keep, 0.0);

        assert!(!fit.is_degenerate());
        assert!((fit.coeffs[0] - 2.0).abs() < 1e-8);
        assert!((fit.coeffs[1] - 300.0).abs() < 1e-4);
        assert!((fit.coeffs[2] - 5.0e4).abs() < 1.0);
        assert!(fit.ssr < 1e-12);
    }

    #[test]
    fn zero_errors_raise_the_degenerate_sentinel() {
        let template = flat_template(32);
        let wavelength: Vec<f64> = (0..20).map(|i| 8.0005 + 1e-4 * i as f64).collect();
        let flux = vec![1.0; 20];
        let error = vec![0.0; 20];
        let keep: Vec<usize> = (0..20).collect();

        let design = DopplerDesign {
            wavelength: &wavelength,
            flux: &flux,
            error: &error,
            template: &template,
            scale: WaveScale::LogLambda,
            degree: 3,
            wavelength_center: 8.0015,
        };
        let fit = design.fit_at(&keep, 0.0);

        assert!(fit.is_degenerate());
        assert_eq!(fit.ssr, DEGENERATE_SSR);
        assert!(fit.coeffs.iter().all(|&c| c == 0.0));
    }

    #[test]
    fn pixels_below_the_template_floor_are_excluded() {
        // Template dives to zero over the second half.
        let x: Vec<f64> = (0..64).map(|i| 8.0 + 1e-4 * i as f64).collect();
        let y: Vec<f64> = (0..64).map(|i| if i < 32 { 1.0 } else { 0.0 }).collect();
        let template = CubicSpline::natural(x.clone(), y).expect("valid grid");

        let flux = vec![1.0; 64];
        let error = vec![0.1; 64];
        let keep: Vec<usize> = (0..64).collect();
        let design = DopplerDesign {
            wavelength: &x,
            flux: &flux,
            error: &error,
            template: &template,
            scale: WaveScale::LogLambda,
            degree: 0,
            wavelength_center: 8.0032,
        };
        let fit = design.fit_at(&keep, 0.0);

        assert!(fit.n_used < 40, "used {} pixels", fit.n_used);
        assert!(!fit.is_degenerate());
    }

    #[test]
    fn model_tracks_the_template_through_a_shift() {
        let x: Vec<f64> = (0..200).map(|i| 8.0 + 5e-5 * i as f64).collect();
        let y: Vec<f64> = x.iter().map(|&w| 1.0 - 0.5 * (-((w - 8.005) / 2e-4).powi(2)).exp()).collect();
        let template = CubicSpline::natural(x.clone(), y).expect("valid grid");

        let v = 3.0;
        let keep: Vec<usize> = (40..160).collect();
        let flux: Vec<f64> = x
            .iter()
            .map(|&w| template.eval(WaveScale::LogLambda.to_rest_frame(w, v)))
            .collect();
        let error = vec![0.01; x.len()];
        let design = DopplerDesign {
            wavelength: &x,
            flux: &flux,
            error: &error,
            template: &template,
            scale: WaveScale::LogLambda,
            degree: 1,
            wavelength_center: weighted_center(&x, &error, &keep),
        };

        let at_truth = design.fit_at(&keep, v);
        let away = design.fit_at(&keep, 0.0);
        assert!(at_truth.ssr < 1e-10);
        assert!(away.ssr > at_truth.ssr);

        let model = design.model_at(&keep, v, &at_truth.coeffs);
        for (&i, &m) in keep.iter().zip(&model) {
            assert!((m - flux[i]).abs() < 1e-6);
        }
    }
}
