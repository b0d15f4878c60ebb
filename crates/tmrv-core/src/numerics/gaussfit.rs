//! Four-parameter Gaussian profile fits for correlation functions.
//!
//! Levenberg-Marquardt with the analytic Jacobian; the 4x4 normal system is
//! small enough that a dense Cholesky per step is the whole cost.

use faer::Mat;

const N_PARAMS: usize = 4;
const MAX_ITERATIONS: usize = 120;
const STEP_TOLERANCE: f64 = 1e-10;
const LAMBDA_UP: f64 = 8.0;
const LAMBDA_DOWN: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum GaussFitError {
    #[error("gaussian fit needs at least 5 points, got {len}")]
    TooFewPoints { len: usize },
    #[error("gaussian fit inputs must share one length, got x {x} and y {y}")]
    MismatchedLengths { x: usize, y: usize },
    #[error("gaussian normal matrix is singular")]
    SingularNormalMatrix,
    #[error("gaussian fit did not converge after {iterations} iterations")]
    DidNotConverge { iterations: usize },
}

/// `offset + amplitude * exp(-(x - center)^2 / (2 sigma^2))` and its
/// best-fit parameter uncertainties.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianFit {
    pub center: f64,
    pub amplitude: f64,
    pub sigma: f64,
    pub offset: f64,
    pub e_center: f64,
    pub e_amplitude: f64,
    pub e_sigma: f64,
    pub e_offset: f64,
    pub rms: f64,
    pub iterations: usize,
}

fn model(p: &[f64; N_PARAMS], x: f64) -> f64 {
    let z = (x - p[0]) / p[2];
    p[3] + p[1] * (-0.5 * z * z).exp()
}

fn jacobian_row(p: &[f64; N_PARAMS], x: f64) -> [f64; N_PARAMS] {
    let dx = x - p[0];
    let z = dx / p[2];
    let e = (-0.5 * z * z).exp();
    [
        p[1] * e * dx / (p[2] * p[2]),
        e,
        p[1] * e * dx * dx / (p[2] * p[2] * p[2]),
        1.0,
    ]
}

fn sum_of_squares(p: &[f64; N_PARAMS], x: &[f64], y: &[f64]) -> f64 {
    x.iter()
        .zip(y)
        .map(|(&xi, &yi)| {
            let r = yi - model(p, xi);
            r * r
        })
        .sum()
}

/// In-place Cholesky solve of the symmetric system `a dx = b`.
fn solve_spd(a: &mut Mat<f64>, b: &[f64; N_PARAMS]) -> Option<[f64; N_PARAMS]> {
    let n = N_PARAMS;
    for j in 0..n {
        let mut d = a[(j, j)];
        for t in 0..j {
            d -= a[(j, t)] * a[(j, t)];
        }
        if !(d > 0.0) {
            return None;
        }
        a[(j, j)] = d.sqrt();
        for i in j + 1..n {
            let mut s = a[(i, j)];
            for t in 0..j {
                s -= a[(i, t)] * a[(j, t)];
            }
            a[(i, j)] = s / a[(j, j)];
        }
    }
    let mut z = [0.0; N_PARAMS];
    for i in 0..n {
        let mut s = b[i];
        for t in 0..i {
            s -= a[(i, t)] * z[t];
        }
        z[i] = s / a[(i, i)];
    }
    let mut dx = [0.0; N_PARAMS];
    for i in (0..n).rev() {
        let mut s = z[i];
        for t in i + 1..n {
            s -= a[(t, i)] * dx[t];
        }
        dx[i] = s / a[(i, i)];
    }
    Some(dx)
}

/// Fits `offset + amplitude * exp(-(x - center)^2 / (2 sigma^2))` starting
/// from `initial = [center, amplitude, sigma, offset]`.
pub fn fit_gaussian(
    x: &[f64],
    y: &[f64],
    initial: [f64; N_PARAMS],
) -> Result<GaussianFit, GaussFitError> {
    if x.len() != y.len() {
        return Err(GaussFitError::MismatchedLengths {
            x: x.len(),
            y: y.len(),
        });
    }
    if x.len() <= N_PARAMS {
        return Err(GaussFitError::TooFewPoints { len: x.len() });
    }

    let mut p = initial;
    if p[2] == 0.0 {
        p[2] = 1.0;
    }
    let mut ssr = sum_of_squares(&p, x, y);
    let mut lambda = 1e-3;
    let mut iterations = 0;
    let mut converged = false;

    while iterations < MAX_ITERATIONS && !converged {
        iterations += 1;

        let mut normal = Mat::<f64>::zeros(N_PARAMS, N_PARAMS);
        let mut grad = [0.0; N_PARAMS];
        for (&xi, &yi) in x.iter().zip(y) {
            let row = jacobian_row(&p, xi);
            let r = yi - model(&p, xi);
            for i in 0..N_PARAMS {
                grad[i] += row[i] * r;
                for j in i..N_PARAMS {
                    normal[(j, i)] += row[i] * row[j];
                }
            }
        }

        let mut damped = normal.clone();
        for i in 0..N_PARAMS {
            damped[(i, i)] *= 1.0 + lambda;
        }
        let Some(step) = solve_spd(&mut damped, &grad) else {
            return Err(GaussFitError::SingularNormalMatrix);
        };

        let mut trial = p;
        for i in 0..N_PARAMS {
            trial[i] += step[i];
        }
        if trial[2] == 0.0 {
            trial[2] = STEP_TOLERANCE;
        }
        let trial_ssr = sum_of_squares(&trial, x, y);

        if trial_ssr.is_finite() && trial_ssr <= ssr {
            let scale: f64 = step
                .iter()
                .zip(&p)
                .map(|(&s, &v)| (s / v.abs().max(1.0)).powi(2))
                .sum();
            p = trial;
            ssr = trial_ssr;
            lambda = (lambda / LAMBDA_DOWN).max(1e-12);
            if scale.sqrt() < STEP_TOLERANCE {
                converged = true;
            }
        } else {
            lambda *= LAMBDA_UP;
            if lambda > 1e10 {
                // No downhill direction left; treat the point as the optimum.
                converged = true;
            }
        }
    }
    if !converged {
        return Err(GaussFitError::DidNotConverge { iterations });
    }

    // Covariance from the undamped normal matrix at the solution.
    let mut normal = Mat::<f64>::zeros(N_PARAMS, N_PARAMS);
    for &xi in x {
        let row = jacobian_row(&p, xi);
        for i in 0..N_PARAMS {
            for j in i..N_PARAMS {
                normal[(j, i)] += row[i] * row[j];
            }
        }
    }
    let dof = (x.len() - N_PARAMS) as f64;
    let variance = ssr / dof;
    let mut sigma_diag = [f64::NAN; N_PARAMS];
    for k in 0..N_PARAMS {
        let mut unit = [0.0; N_PARAMS];
        unit[k] = 1.0;
        let mut factor = normal.clone();
        if let Some(col) = solve_spd(&mut factor, &unit) {
            if col[k] > 0.0 {
                sigma_diag[k] = (variance * col[k]).sqrt();
            }
        }
    }

    Ok(GaussianFit {
        center: p[0],
        amplitude: p[1],
        sigma: p[2].abs(),
        offset: p[3],
        e_center: sigma_diag[0],
        e_amplitude: sigma_diag[1],
        e_sigma: sigma_diag[2],
        e_offset: sigma_diag[3],
        rms: (ssr / x.len() as f64).sqrt(),
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampled(center: f64, amplitude: f64, sigma: f64, offset: f64) -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..81).map(|i| -8.0 + 0.2 * i as f64).collect();
        let y: Vec<f64> = x
            .iter()
            .map(|&v| {
                let z = (v - center) / sigma;
                offset + amplitude * (-0.5 * z * z).exp()
            })
            .collect();
        (x, y)
    }

    #[test]
    fn recovers_a_clean_emission_profile() {
        let (x, y) = sampled(0.8, 2.0, 1.5, 0.3);
        let fit = fit_gaussian(&x, &y, [0.0, 1.7, 2.5, 0.0]).expect("converges");
        assert!((fit.center - 0.8).abs() < 1e-6);
        assert!((fit.amplitude - 2.0).abs() < 1e-6);
        assert!((fit.sigma - 1.5).abs() < 1e-6);
        assert!((fit.offset - 0.3).abs() < 1e-6);
        assert!(fit.rms < 1e-7);
    }

    #[test]
    fn recovers_an_absorption_dip() {
        let (x, y) = sampled(-1.2, -0.6, 2.0, 1.0);
        let start = [0.0, -0.5, 2.5, 1.0];
        let fit = fit_gaussian(&x, &y, start).expect("converges");
        assert!((fit.center + 1.2).abs() < 1e-6);
        assert!(fit.amplitude < 0.0);
    }

    #[test]
    fn noisy_profile_yields_finite_uncertainties() {
        let (x, mut y) = sampled(0.0, 1.0, 2.5, 0.1);
        for (i, v) in y.iter_mut().enumerate() {
            // Deterministic, zero-ish mean perturbation.
            *v += 1e-3 * ((i * 37 % 11) as f64 - 5.0);
        }
        let fit = fit_gaussian(&x, &y, [0.3, 0.8, 2.0, 0.0]).expect("converges");
        assert!(fit.e_center.is_finite() && fit.e_center > 0.0);
        assert!((fit.center).abs() < 0.05);
    }

    #[test]
    fn rejects_short_input() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [0.0, 1.0, 0.5, 0.2];
        assert_eq!(
            fit_gaussian(&x, &y, [0.0, 1.0, 1.0, 0.0]),
            Err(GaussFitError::TooFewPoints { len: 4 })
        );
    }

    #[test]
    fn flat_data_cannot_constrain_the_profile() {
        let x: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let y = vec![1.0; 20];
        // Zero amplitude start removes the center/sigma columns.
        let result = fit_gaussian(&x, &y, [10.0, 0.0, 2.0, 1.0]);
        assert!(matches!(result, Err(GaussFitError::SingularNormalMatrix)));
    }
}
