//! Linearized drift estimation against a contemporaneous reference, and
//! the differential line-width diagnostic.
//!
//! Both lean on derivatives of a reference shape: the drift fit pairs the
//! observation with the first derivative of the reference spectrum, the
//! line width pairs fit residuals with the second derivative of the
//! template.

use serde::Serialize;

use crate::common::config::ClipConfig;
use crate::common::constants::{MIN_FIT_PIXELS, SPEED_OF_LIGHT_KMS};
use crate::fit::model::DopplerDesign;
use crate::fit::{FitStat, FitWarning};
use crate::numerics::{finite_gradient, quantile};
use crate::spectrum::{SpectralOrder, WaveScale};

/// Neighbor ratio below which a reference pixel counts as a sharp feature.
const SHARP_NEIGHBOR_RATIO: f64 = 0.15;
/// Half-width of the exclusion zone around a sharp feature, pixels.
const SHARP_EXCLUSION_PX: usize = 2;
/// Quartile multiplier of the flux-ratio prefilter.
const RATIO_CLIP_FACTOR: f64 = 5.0;

/// Closed-form drift fit of one order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftFit {
    pub velocity_kms: f64,
    pub e_velocity_mps: f64,
    /// Flux scale between observation and reference.
    pub scale_factor: f64,
    pub e_scale_factor: f64,
    pub stat: FitStat,
    pub wavelength_center: f64,
    pub warnings: Vec<FitWarning>,
}

impl DriftFit {
    fn unusable(warnings: Vec<FitWarning>) -> Self {
        Self {
            velocity_kms: f64::NAN,
            e_velocity_mps: f64::NAN,
            scale_factor: f64::NAN,
            e_scale_factor: f64::NAN,
            stat: FitStat {
                rms: f64::NAN,
                snr: f64::NAN,
                n_used: 0,
                n_clipped: 0,
                passes: 0,
            },
            wavelength_center: f64::NAN,
            warnings,
        }
    }
}

pub struct DriftInput<'a> {
    pub order: &'a SpectralOrder,
    /// Contemporaneous reference on the same pixel grid.
    pub reference: &'a SpectralOrder,
    pub scale: WaveScale,
    pub clip: ClipConfig,
    pub window: (usize, usize),
}

/// Reference pixels whose neighbor collapses below the sharp-feature ratio,
/// widened by the exclusion zone.
fn sharp_exclusion(reference: &[f64], n: usize) -> Vec<bool> {
    let mut sharp = vec![false; n];
    for i in 0..n {
        if !(reference[i] > 0.0) {
            continue;
        }
        let floor = SHARP_NEIGHBOR_RATIO * reference[i];
        if (i > 0 && reference[i - 1] < floor) || (i + 1 < n && reference[i + 1] < floor) {
            sharp[i] = true;
        }
    }
    let mut excluded = vec![false; n];
    for i in 0..n {
        if sharp[i] {
            let lo = i.saturating_sub(SHARP_EXCLUSION_PX);
            let hi = (i + SHARP_EXCLUSION_PX + 1).min(n);
            for e in &mut excluded[lo..hi] {
                *e = true;
            }
        }
    }
    excluded
}

/// Linearized drift of `order` against `reference`: the observation is
/// modeled as `A (ft - ft' v/c)` with a closed-form solution first for the
/// flux scale `A`, then for the velocity.
pub fn estimate_drift(input: &DriftInput<'_>) -> DriftFit {
    let obs = input.order;
    let reference = input.reference;
    let n = obs.len();
    if n != reference.len() {
        return DriftFit::unusable(vec![FitWarning::DegradedFit]);
    }

    let x = reference.wavelength();
    let ft = reference.flux();
    let f2 = obs.flux();
    let e2 = obs.error();

    // Per-ln-wavelength first derivative of the reference.
    let Some(mut df) = finite_gradient(x, ft) else {
        return DriftFit::unusable(vec![FitWarning::DegradedFit]);
    };
    if input.scale == WaveScale::Linear {
        for (d, &l) in df.iter_mut().zip(x) {
            *d *= l;
        }
    }

    let excluded = sharp_exclusion(ft, n);
    let (lo, hi) = (input.window.0, input.window.1.min(n));
    let mut keep: Vec<usize> = (lo..hi)
        .filter(|&i| {
            obs.flags()[i].is_clear()
                && reference.flags()[i].is_clear()
                && !excluded[i]
                && ft[i] > 0.0
                && e2[i] > 0.0
        })
        .collect();

    // Flux-ratio prefilter against gross mismatches. Skipped when the
    // quartile spread collapses, otherwise it would cut everything.
    let ratios: Vec<f64> = keep.iter().map(|&i| f2[i] / ft[i]).collect();
    if let (Some(q1), Some(med), Some(q3)) = (
        quantile(&ratios, 0.25),
        quantile(&ratios, 0.5),
        quantile(&ratios, 0.75),
    ) {
        if med - q1 > 0.0 && q3 - med > 0.0 {
            let lo_cut = med - RATIO_CLIP_FACTOR * (med - q1);
            let hi_cut = med + RATIO_CLIP_FACTOR * (q3 - med);
            keep = keep
                .into_iter()
                .zip(ratios)
                .filter(|&(_, r)| r >= lo_cut && r <= hi_cut)
                .map(|(i, _)| i)
                .collect();
        }
    }

    let mut result = DriftFit::unusable(Vec::new());
    let mut warnings = Vec::new();
    let mut removed = 0usize;
    let passes = input.clip.passes + 1;

    for pass in 0..passes {
        if keep.len() < MIN_FIT_PIXELS {
            if !warnings.contains(&FitWarning::DegradedFit) {
                warnings.push(FitWarning::DegradedFit);
            }
            break;
        }

        let mut s_tt = 0.0;
        let mut s_t2 = 0.0;
        let mut s_dd = 0.0;
        let mut wsum = 0.0;
        let mut wx = 0.0;
        for &i in &keep {
            let w = 1.0 / (e2[i] * e2[i]);
            s_tt += w * ft[i] * ft[i];
            s_t2 += w * ft[i] * f2[i];
            s_dd += w * df[i] * df[i];
            wsum += w;
            wx += w * x[i];
        }
        if !(s_tt > 0.0) || !(s_dd > 0.0) {
            if !warnings.contains(&FitWarning::DegradedFit) {
                warnings.push(FitWarning::DegradedFit);
            }
            break;
        }
        let a = s_t2 / s_tt;
        let mut s_dr = 0.0;
        for &i in &keep {
            let w = 1.0 / (e2[i] * e2[i]);
            s_dr += w * df[i] * (f2[i] - a * ft[i]);
        }
        let velocity = -SPEED_OF_LIGHT_KMS * s_dr / s_dd / a;
        let e_velocity_kms = SPEED_OF_LIGHT_KMS / (a.abs() * s_dd.sqrt());

        let mut residuals = Vec::with_capacity(keep.len());
        let mut model_sum = 0.0;
        let mut abs_resid_sum = 0.0;
        for &i in &keep {
            let m = a * (ft[i] - df[i] * velocity / SPEED_OF_LIGHT_KMS);
            let raw = f2[i] - m;
            residuals.push(raw / e2[i]);
            model_sum += m;
            abs_resid_sum += raw.abs();
        }
        let rms =
            (residuals.iter().map(|r| r * r).sum::<f64>() / keep.len() as f64).sqrt();
        let snr = if abs_resid_sum > 0.0 {
            model_sum / abs_resid_sum
        } else {
            f64::INFINITY
        };

        result = DriftFit {
            velocity_kms: velocity,
            e_velocity_mps: e_velocity_kms * rms * 1000.0,
            scale_factor: a,
            e_scale_factor: 1.0 / s_tt.sqrt(),
            stat: FitStat {
                rms,
                snr,
                n_used: keep.len(),
                n_clipped: removed,
                passes: pass + 1,
            },
            wavelength_center: wx / wsum,
            warnings: Vec::new(),
        };

        if pass + 1 < passes {
            let threshold = input.clip.kappa * rms;
            let survivors: Vec<usize> = keep
                .iter()
                .zip(&residuals)
                .filter(|&(_, &r)| r.abs() <= threshold)
                .map(|(&i, _)| i)
                .collect();
            removed += keep.len() - survivors.len();
            keep = survivors;
        }
    }

    result.warnings = warnings;
    result
}

/// Differential line width of a completed least-squares fit: residuals
/// projected onto the second derivative of the model, per ln-wavelength,
/// reported with its uncertainty (both scaled by 1000).
pub fn differential_line_width(
    design: &DopplerDesign<'_>,
    keep: &[usize],
    velocity_kms: f64,
    coeffs: &[f64],
) -> Option<(f64, f64)> {
    if keep.len() < MIN_FIT_PIXELS || coeffs.is_empty() {
        return None;
    }
    let model = design.model_at(keep, velocity_kms, coeffs);
    let shift = 1.0 + velocity_kms / SPEED_OF_LIGHT_KMS;

    let mut curvature = Vec::with_capacity(keep.len());
    for &i in keep {
        let w = design.wavelength[i];
        let rest = design.scale.to_rest_frame(w, velocity_kms);
        let mut poly = 0.0;
        for &c in coeffs.iter().rev() {
            poly = poly * (w - design.wavelength_center) + c;
        }
        // Second derivative of the shifted template per ln-wavelength.
        let d2 = match design.scale {
            WaveScale::LogLambda => design.template.second_derivative(rest),
            WaveScale::Linear => {
                let t1 = design.template.derivative(rest);
                let t2 = design.template.second_derivative(rest);
                w * w * t2 / (shift * shift) + w * t1 / shift
            }
        };
        curvature.push(poly * d2);
    }

    let mut num = 0.0;
    let mut den = 0.0;
    for ((&i, &d2), &m) in keep.iter().zip(&curvature).zip(&model) {
        let e = design.error[i];
        if !(e > 0.0) || !e.is_finite() {
            continue;
        }
        let w = 1.0 / (e * e);
        num += w * d2 * (design.flux[i] - m);
        den += w * d2 * d2;
    }
    if !(den > 0.0) {
        return None;
    }
    let ratio = num / den;

    // RMS of the residuals after removing the width term.
    let mut chi = 0.0;
    let mut n_chi = 0usize;
    for ((&i, &d2), &m) in keep.iter().zip(&curvature).zip(&model) {
        let e = design.error[i];
        if !(e > 0.0) || !e.is_finite() {
            continue;
        }
        let r = (design.flux[i] - m - ratio * d2) / e;
        chi += r * r;
        n_chi += 1;
    }
    let drchi = (chi / n_chi as f64).sqrt();

    let c2 = SPEED_OF_LIGHT_KMS * SPEED_OF_LIGHT_KMS;
    let dlw = 1000.0 * c2 * ratio;
    let e_dlw = 1000.0 * c2 / den.sqrt() * drchi;
    Some((dlw, e_dlw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::model::weighted_center;
    use crate::numerics::spline::CubicSpline;

    const N: usize = 400;

    fn lamp_spectrum() -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..N).map(|i| 8.60 + 5e-6 * i as f64).collect();
        let y: Vec<f64> = x
            .iter()
            .map(|&w| {
                let mut f = 100.0;
                for k in 0..6 {
                    let center = 8.6001 + 3.1e-4 * k as f64;
                    let z = (w - center) / 4e-5;
                    f += 900.0 * (-0.5 * z * z).exp();
                }
                f
            })
            .collect();
        (x, y)
    }

    fn order_from(x: &[f64], y: &[f64], snr: f64) -> SpectralOrder {
        let error: Vec<f64> = y.iter().map(|&f| f.abs().max(1.0) / snr).collect();
        SpectralOrder::new(x.to_vec(), y.to_vec(), error, Vec::new()).expect("valid order")
    }

    fn drifted(x: &[f64], y: &[f64], amp: f64, v_kms: f64) -> Vec<f64> {
        let spline = CubicSpline::natural(x.to_vec(), y.to_vec()).expect("valid grid");
        x.iter()
            .map(|&w| amp * spline.eval(WaveScale::LogLambda.to_rest_frame(w, v_kms)))
            .collect()
    }

    #[test]
    fn recovers_a_small_drift_and_the_flux_scale() {
        let (x, y) = lamp_spectrum();
        let obs_flux: Vec<f64> = drifted(&x, &y, 1.8, 0.05)
            .into_iter()
            .enumerate()
            .map(|(i, f)| {
                // Deterministic scatter so the ratio prefilter has a spread.
                let bump = ((i * 61 + 7) % 17) as f64 / 17.0 - 0.5;
                f * (1.0 + bump / 800.0)
            })
            .collect();
        let reference = order_from(&x, &y, 800.0);
        let observation = order_from(&x, &obs_flux, 800.0);

        let fit = estimate_drift(&DriftInput {
            order: &observation,
            reference: &reference,
            scale: WaveScale::LogLambda,
            clip: ClipConfig::default(),
            window: (0, N),
        });

        assert!(fit.warnings.is_empty(), "warnings {:?}", fit.warnings);
        assert!((fit.velocity_kms - 0.05).abs() < 0.01, "got {}", fit.velocity_kms);
        assert!((fit.scale_factor - 1.8).abs() < 0.01);
        assert!(fit.e_velocity_mps.is_finite() && fit.e_velocity_mps > 0.0);
    }

    #[test]
    fn sharp_features_are_fenced_off() {
        let (_x, mut y) = lamp_spectrum();
        // A one-pixel spike: its neighbors sit far below 15% of its flux.
        y[200] = 1e6;
        let excluded = sharp_exclusion(&y, y.len());
        for i in 198..=202 {
            assert!(excluded[i], "pixel {i} should be excluded");
        }
        assert!(!excluded[150]);
    }

    #[test]
    fn mismatched_grids_degrade_instead_of_failing() {
        let (x, y) = lamp_spectrum();
        let reference = order_from(&x, &y, 100.0);
        let observation = order_from(&x[..N - 10], &y[..N - 10], 100.0);
        let fit = estimate_drift(&DriftInput {
            order: &observation,
            reference: &reference,
            scale: WaveScale::LogLambda,
            clip: ClipConfig::default(),
            window: (0, N),
        });
        assert!(fit.warnings.contains(&FitWarning::DegradedFit));
        assert!(fit.velocity_kms.is_nan());
    }

    #[test]
    fn broadened_lines_give_a_positive_width_change() {
        let n = 500;
        let x: Vec<f64> = (0..n).map(|i| 8.70 + 4e-6 * i as f64).collect();
        let sigma = 5e-5;
        let center = 8.701;
        let profile = |w: f64, s: f64| {
            let z: f64 = (w - center) / s;
            1.0 - 0.6 * (-0.5 * z * z).exp()
        };
        let template_flux: Vec<f64> = x.iter().map(|&w| profile(w, sigma)).collect();
        let template = CubicSpline::natural(x.clone(), template_flux).expect("valid grid");

        let broadened: Vec<f64> = x.iter().map(|&w| profile(w, sigma * 1.1)).collect();
        let error = vec![0.002; n];
        let keep: Vec<usize> = (10..n - 10).collect();
        let design = DopplerDesign {
            wavelength: &x,
            flux: &broadened,
            error: &error,
            template: &template,
            scale: WaveScale::LogLambda,
            degree: 0,
            wavelength_center: weighted_center(&x, &error, &keep),
        };

        let (dlw, e_dlw) =
            differential_line_width(&design, &keep, 0.0, &[1.0]).expect("derivable");
        assert!(dlw > 0.0);
        assert!(e_dlw > 0.0);

        // For a fixed-depth Gaussian the curvature projection of the
        // broadening equals one sixth of the sigma^2 change.
        let c2 = SPEED_OF_LIGHT_KMS * SPEED_OF_LIGHT_KMS;
        let expected = 1000.0 * c2 * (sigma * sigma * (1.1f64.powi(2) - 1.0)) / 6.0;
        assert!(
            dlw > 0.8 * expected && dlw < 1.25 * expected,
            "dlw {dlw} vs expected {expected}"
        );
    }
}
