//! Maximum-likelihood combination over the per-order chi-square surfaces.
//!
//! Each contributing order brings its SSR-vs-velocity surface, zero-pointed
//! at its own minimum and scaled into chi-square units by 1/rms^2. Summing
//! the scaled surfaces on a common velocity grid gives one joint surface
//! whose refined minimum is the ML velocity; scanning a chromatic slope
//! through the per-order surfaces gives the ML chromatic index.

use serde::Serialize;

use crate::fit::grid::{refine_surface, ChiSquareSurface};
use crate::numerics::interpolate_linear;

/// Slope samples on each side of the scan center.
const SLOPE_SCAN_HALF: usize = 60;

/// Joint-surface velocity and chromatic index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MlCombination {
    pub rv_mps: f64,
    pub e_rv_mps: f64,
    /// Slope minimizing the slope-shifted joint surface, m/s per ln-wavelength.
    pub crx: f64,
    /// The slope scan carries no uncertainty model of its own; this is the
    /// linear-regression value handed in by the caller.
    pub e_crx: f64,
}

/// One order's contribution to the joint surface.
pub struct MlInput<'a> {
    pub surface: &'a ChiSquareSurface,
    /// Residual RMS of the order fit; the chi-square scale is 1/rms^2.
    pub rms: f64,
    /// ln-wavelength offset of the order from the combination pivot.
    pub dx: f64,
}

struct Prepared {
    velocities: Vec<f64>,
    /// (SSR - min SSR) / rms^2 per grid sample.
    scaled: Vec<f64>,
    step_kms: f64,
    dx: f64,
}

fn prepare(input: &MlInput<'_>) -> Option<Prepared> {
    let surface = input.surface;
    if surface.ssr.len() < 3
        || surface.has_degenerate_samples()
        || surface.ssr.iter().any(|s| !s.is_finite())
    {
        return None;
    }
    if !(input.rms.is_finite() && input.rms > 0.0) || !input.dx.is_finite() {
        return None;
    }
    let zero = surface.ssr[surface.argmin()?];
    let weight = 1.0 / (input.rms * input.rms);
    Some(Prepared {
        velocities: surface.velocities(),
        scaled: surface.ssr.iter().map(|&s| (s - zero) * weight).collect(),
        step_kms: surface.step_kms,
        dx: input.dx,
    })
}

/// Sums the prepared surfaces on the grid of the first one and refines the
/// joint minimum; the slope scan runs over the same terms. `crx_center`
/// centers the scan (the linear-regression slope when available).
pub fn combine_ml(
    terms: &[MlInput<'_>],
    crx_center: f64,
    e_crx_fallback: f64,
) -> Option<MlCombination> {
    let prepared: Vec<Prepared> = terms.iter().filter_map(prepare).collect();
    let first = prepared.first()?;
    let start = *first.velocities.first()?;
    let step = first.step_kms;
    let n = first.velocities.len();

    let mut joint = Vec::with_capacity(n);
    for k in 0..n {
        let v = start + k as f64 * step;
        let mut total = 0.0;
        for p in &prepared {
            total += interpolate_linear(v, &p.velocities, &p.scaled)?;
        }
        joint.push(total);
    }
    let joint = ChiSquareSurface {
        start_kms: start,
        step_kms: step,
        ssr: joint,
    };
    let refined = refine_surface(&joint);

    let crx = if prepared.len() >= 2 {
        let center = if crx_center.is_finite() { crx_center } else { 0.0 };
        scan_slope(&prepared, refined.velocity_kms, center).unwrap_or(f64::NAN)
    } else {
        f64::NAN
    };

    Some(MlCombination {
        rv_mps: refined.velocity_kms * 1000.0,
        e_rv_mps: refined.e_velocity_kms * 1000.0,
        crx,
        e_crx: e_crx_fallback,
    })
}

/// Minimizes chi2(b) = sum_o S_o(v + b dx_o / 1000) over a slope grid sized
/// so every order's shifted sample stays within half the common grid span.
fn scan_slope(prepared: &[Prepared], rv_kms: f64, center: f64) -> Option<f64> {
    let max_dx = prepared.iter().map(|p| p.dx.abs()).fold(0.0, f64::max);
    if !(max_dx > 0.0) || !rv_kms.is_finite() {
        return None;
    }
    let first = &prepared[0];
    let span_mps = (first.velocities.last()? - first.velocities.first()?) * 1000.0;
    let half = 0.5 * span_mps / max_dx;
    if !(half > 0.0) {
        return None;
    }
    let step = half / SLOPE_SCAN_HALF as f64;
    let start = center - half;

    let mut chi = Vec::with_capacity(2 * SLOPE_SCAN_HALF + 1);
    for j in 0..=2 * SLOPE_SCAN_HALF {
        let slope = start + j as f64 * step;
        let mut total = 0.0;
        for p in prepared {
            let v = rv_kms + slope * p.dx / 1000.0;
            total += interpolate_linear(v, &p.velocities, &p.scaled)?;
        }
        chi.push(total);
    }
    let scan = ChiSquareSurface {
        start_kms: start,
        step_kms: step,
        ssr: chi,
    };
    Some(refine_surface(&scan).velocity_kms)
}
