//! Velocity grid search and parabolic sub-step refinement.
//!
//! The SSR over a uniform velocity grid is minimized discretely, then a
//! parabola through the minimum and its two neighbors pins the velocity to
//! sub-step precision. Every degenerate surface shape degrades to the grid
//! midpoint with an undefined uncertainty instead of failing the order.

use serde::{Deserialize, Serialize};

use crate::common::config::VelocityGridConfig;
use crate::fit::model::DopplerDesign;
use crate::fit::FitWarning;

/// SSR sampled over a uniform velocity grid, kept for the maximum-likelihood
/// combination and optional artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChiSquareSurface {
    pub start_kms: f64,
    pub step_kms: f64,
    pub ssr: Vec<f64>,
}

impl ChiSquareSurface {
    pub fn velocity_at(&self, k: usize) -> f64 {
        self.start_kms + k as f64 * self.step_kms
    }

    pub fn velocities(&self) -> Vec<f64> {
        (0..self.ssr.len()).map(|k| self.velocity_at(k)).collect()
    }

    pub fn end_kms(&self) -> f64 {
        self.velocity_at(self.ssr.len().saturating_sub(1))
    }

    pub fn midpoint_kms(&self) -> f64 {
        0.5 * (self.start_kms + self.end_kms())
    }

    pub fn has_degenerate_samples(&self) -> bool {
        self.ssr.iter().any(|&s| s < 0.0)
    }

    /// Index of the smallest sample over the whole grid.
    pub fn argmin(&self) -> Option<usize> {
        (0..self.ssr.len()).min_by(|&a, &b| self.ssr[a].total_cmp(&self.ssr[b]))
    }
}

/// Refined velocity with its curvature uncertainty, or the midpoint
/// fallback with the matching warning.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceRefinement {
    pub velocity_kms: f64,
    pub e_velocity_kms: f64,
    pub warnings: Vec<FitWarning>,
}

/// Applies the 3-point parabola at the discrete minimum of `surface`.
pub fn refine_surface(surface: &ChiSquareSurface) -> SurfaceRefinement {
    let fallback = |warning: FitWarning| SurfaceRefinement {
        velocity_kms: surface.midpoint_kms(),
        e_velocity_kms: f64::NAN,
        warnings: vec![warning],
    };

    if surface.ssr.len() < 3 {
        return fallback(FitWarning::EdgeMinimum);
    }
    if surface.has_degenerate_samples() {
        return fallback(FitWarning::DegenerateSurface);
    }
    let k = match surface.argmin() {
        Some(k) if k > 0 && k + 1 < surface.ssr.len() => k,
        _ => return fallback(FitWarning::EdgeMinimum),
    };

    let h = surface.step_kms;
    let a1 = (surface.ssr[k + 1] - surface.ssr[k - 1]) / (2.0 * h);
    let a2 = (surface.ssr[k + 1] - 2.0 * surface.ssr[k] + surface.ssr[k - 1]) / (2.0 * h * h);
    if !(a2 > 0.0) {
        return fallback(FitWarning::NonPositiveCurvature);
    }
    let velocity = surface.velocity_at(k) - a1 / (2.0 * a2);
    if velocity < surface.start_kms || velocity > surface.end_kms() {
        return fallback(FitWarning::RefinedOutsideGrid);
    }
    SurfaceRefinement {
        velocity_kms: velocity,
        e_velocity_kms: 1.0 / a2.sqrt(),
        warnings: Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridOutcome {
    pub velocity_kms: f64,
    pub e_velocity_kms: f64,
    pub surface: ChiSquareSurface,
    pub warnings: Vec<FitWarning>,
}

/// Samples the SSR of `design` on the grid centered at `center_kms` and
/// refines the minimum.
pub fn search_velocity(
    design: &DopplerDesign<'_>,
    keep: &[usize],
    grid: &VelocityGridConfig,
    center_kms: f64,
) -> GridOutcome {
    let n = grid.n_samples();
    let start = center_kms + grid.start_kms;
    let mut ssr = Vec::with_capacity(n);
    for k in 0..n {
        let v = start + k as f64 * grid.step_kms;
        ssr.push(design.fit_at(keep, v).ssr);
    }
    let surface = ChiSquareSurface {
        start_kms: start,
        step_kms: grid.step_kms,
        ssr,
    };
    let refined = refine_surface(&surface);
    GridOutcome {
        velocity_kms: refined.velocity_kms,
        e_velocity_kms: refined.e_velocity_kms,
        surface,
        warnings: refined.warnings,
    }
}
