//! Combination of per-order estimates into one row per exposure.
//!
//! The combined velocity is the inverse-variance mean over usable orders.
//! On top of it sit the chromatic trend (velocity against ln-wavelength),
//! the differential line-width mean, the maximum-likelihood variants built
//! from the per-order chi-square surfaces, and the drift/secular corrected
//! series.

pub mod chi2;

use serde::Serialize;

use crate::fit::OrderEstimate;
use crate::numerics::{inverse_variance_mean, mean, weighted_line_fit};
use crate::spectrum::WaveScale;

use chi2::{combine_ml, MlCombination, MlInput};

/// Weighted linear trend of order velocity against ln-wavelength.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChromaticTrend {
    /// Slope, m/s per e-folding of wavelength (the chromatic index).
    pub crx: f64,
    pub e_crx: f64,
    /// Trend velocity at the pivot, m/s.
    pub offset_mps: f64,
    pub e_offset_mps: f64,
    /// Mean usable ln-wavelength; the regression is centered here.
    pub pivot: f64,
    /// Wavelength at which the trend crosses the combined velocity.
    pub crossing_wavelength: f64,
}

/// Frame corrections applied on top of the combined velocity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Corrections {
    pub drift_mps: f64,
    pub e_drift_mps: f64,
    pub secular_mps: f64,
}

pub struct CombineInput<'a> {
    /// Per-order estimates indexed by order; `None` where no estimate exists.
    pub estimates: &'a [Option<OrderEstimate>],
    pub scale: WaveScale,
    pub corrections: Corrections,
}

/// Everything combined for one exposure.
#[derive(Debug, Clone, Serialize)]
pub struct ExposureCombination {
    /// Inverse-variance combined velocity, m/s.
    pub rv_mps: f64,
    pub e_rv_mps: f64,
    /// Drift- and secular-corrected velocity, m/s.
    pub rvc_mps: f64,
    pub e_rvc_mps: f64,
    pub trend: Option<ChromaticTrend>,
    /// Differential line width, inverse-variance combined over orders.
    pub dlw: f64,
    pub e_dlw: f64,
    pub ml: Option<MlCombination>,
    /// Orders whose estimate entered the combination.
    pub usable_orders: Vec<usize>,
    pub n_orders: usize,
}

/// Indices of orders carrying a usable estimate.
pub fn usable_orders(estimates: &[Option<OrderEstimate>]) -> Vec<usize> {
    estimates
        .iter()
        .enumerate()
        .filter_map(|(o, est)| match est {
            Some(e) if e.is_usable() => Some(o),
            _ => None,
        })
        .collect()
}

fn ln_wavelength(scale: WaveScale, wavelength_center: f64) -> f64 {
    match scale {
        WaveScale::LogLambda => wavelength_center,
        WaveScale::Linear => wavelength_center.ln(),
    }
}

fn chromatic_trend(x: &[f64], v_mps: &[f64], e_mps: &[f64], rv_mps: f64) -> Option<ChromaticTrend> {
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    let mut es = Vec::new();
    for i in 0..x.len() {
        if x[i].is_finite() && v_mps[i].is_finite() && e_mps[i].is_finite() && e_mps[i] > 0.0 {
            xs.push(x[i]);
            ys.push(v_mps[i]);
            es.push(e_mps[i]);
        }
    }
    let pivot = mean(&xs)?;
    let centered: Vec<f64> = xs.iter().map(|&xi| xi - pivot).collect();
    let fit = weighted_line_fit(&centered, &ys, &es)?;
    let crossing = if fit.slope != 0.0 && fit.slope.is_finite() && rv_mps.is_finite() {
        (-(fit.intercept - rv_mps) / fit.slope + pivot).exp()
    } else {
        f64::NAN
    };
    Some(ChromaticTrend {
        crx: fit.slope,
        e_crx: fit.e_slope,
        offset_mps: fit.intercept,
        e_offset_mps: fit.e_intercept,
        pivot,
        crossing_wavelength: crossing,
    })
}

/// Combines one exposure's per-order estimates. Orders flagged as degraded
/// or without a finite velocity and positive error stay out of every
/// average; an exposure with no usable order reports NaN throughout.
pub fn combine_exposure(input: &CombineInput<'_>) -> ExposureCombination {
    let mut usable = Vec::new();
    let mut picked: Vec<&OrderEstimate> = Vec::new();
    for (o, est) in input.estimates.iter().enumerate() {
        if let Some(e) = est {
            if e.is_usable() {
                usable.push(o);
                picked.push(e);
            }
        }
    }

    let v_mps: Vec<f64> = picked.iter().map(|e| e.velocity_kms() * 1000.0).collect();
    let e_mps: Vec<f64> = picked.iter().map(|e| e.e_velocity_mps()).collect();
    let (rv_mps, e_rv_mps) =
        inverse_variance_mean(&v_mps, &e_mps).unwrap_or((f64::NAN, f64::NAN));

    let x: Vec<f64> = picked
        .iter()
        .map(|e| ln_wavelength(input.scale, e.wavelength_center()))
        .collect();
    let trend = chromatic_trend(&x, &v_mps, &e_mps, rv_mps);

    let mut dlw_values = Vec::new();
    let mut dlw_errors = Vec::new();
    for e in &picked {
        if let Some((value, error)) = e.line_width() {
            dlw_values.push(value);
            dlw_errors.push(error);
        }
    }
    let (dlw, e_dlw) =
        inverse_variance_mean(&dlw_values, &dlw_errors).unwrap_or((f64::NAN, f64::NAN));

    let ml = combine_surfaces(&picked, &x, trend.as_ref());

    let corrections = input.corrections;
    let rvc_mps = rv_mps - corrections.drift_mps - corrections.secular_mps;
    let e_rvc_mps = e_rv_mps.hypot(corrections.e_drift_mps);

    ExposureCombination {
        rv_mps,
        e_rv_mps,
        rvc_mps,
        e_rvc_mps,
        trend,
        dlw,
        e_dlw,
        ml,
        usable_orders: usable,
        n_orders: input.estimates.len(),
    }
}

fn combine_surfaces(
    picked: &[&OrderEstimate],
    x: &[f64],
    trend: Option<&ChromaticTrend>,
) -> Option<MlCombination> {
    let mut terms = Vec::new();
    let mut term_x = Vec::new();
    for (estimate, &xi) in picked.iter().zip(x) {
        let surface = match estimate.surface() {
            Some(s) => s,
            None => continue,
        };
        let rms = estimate.residual_rms();
        if xi.is_finite() && rms.is_finite() && rms > 0.0 {
            terms.push((surface, rms));
            term_x.push(xi);
        }
    }
    let pivot = mean(&term_x)?;
    let inputs: Vec<MlInput<'_>> = terms
        .iter()
        .zip(&term_x)
        .map(|(&(surface, rms), &xi)| MlInput {
            surface,
            rms,
            dx: xi - pivot,
        })
        .collect();
    let center = trend.map(|t| t.crx).filter(|c| c.is_finite()).unwrap_or(0.0);
    let fallback = trend.map_or(f64::NAN, |t| t.e_crx);
    combine_ml(&inputs, center, fallback)
}
