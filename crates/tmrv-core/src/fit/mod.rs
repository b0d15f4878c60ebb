//! Per-order fitting: robust clipping loop around the Doppler regression,
//! and the tagged per-order estimate shared by every estimator path.

pub mod drift;
pub mod grid;
pub mod model;

use serde::{Deserialize, Serialize};

use crate::common::config::{ClipConfig, VelocityGridConfig};
use crate::common::constants::MIN_FIT_PIXELS;
use crate::domain::EstimatorMethod;
use crate::fit::drift::DriftFit;
use crate::fit::grid::{search_velocity, ChiSquareSurface};
use crate::fit::model::{weighted_center, DopplerDesign};
use crate::ccf::CcfFit;
use crate::numerics::spline::CubicSpline;
use crate::spectrum::{SpectralOrder, WaveScale};

/// Fit-quality conditions. Carried in results, never raised as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FitWarning {
    /// The SSR surface contains the degenerate-regression sentinel.
    DegenerateSurface,
    /// The discrete minimum sits on the grid border.
    EdgeMinimum,
    /// The 3-point curvature at the minimum is not positive.
    NonPositiveCurvature,
    /// The parabola vertex landed outside the scanned grid.
    RefinedOutsideGrid,
    /// Fewer than the minimum usable pixels remained.
    DegradedFit,
    /// The CCF peak fit did not converge.
    PeakFitFailed,
}

impl FitWarning {
    pub const fn as_str(&self) -> &'static str {
        match self {
            FitWarning::DegenerateSurface => "degenerate-surface",
            FitWarning::EdgeMinimum => "edge-minimum",
            FitWarning::NonPositiveCurvature => "non-positive-curvature",
            FitWarning::RefinedOutsideGrid => "refined-outside-grid",
            FitWarning::DegradedFit => "degraded-fit",
            FitWarning::PeakFitFailed => "peak-fit-failed",
        }
    }
}

impl std::fmt::Display for FitWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statistics of the surviving pixel set after the clipping loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitStat {
    /// RMS of the normalized residuals.
    pub rms: f64,
    /// mean(model) / mean(|flux - model|) over kept pixels.
    pub snr: f64,
    pub n_used: usize,
    pub n_clipped: usize,
    pub passes: usize,
}

impl FitStat {
    fn empty() -> Self {
        Self {
            rms: f64::NAN,
            snr: f64::NAN,
            n_used: 0,
            n_clipped: 0,
            passes: 0,
        }
    }
}

/// Least-squares fit of one order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderFit {
    pub velocity_kms: f64,
    /// Grid-curvature error scaled by the residual RMS, m/s.
    pub e_velocity_mps: f64,
    pub coeffs: Vec<f64>,
    pub e_coeffs: Vec<f64>,
    pub ssr: f64,
    pub stat: FitStat,
    /// Error-weighted center of the fitted wavelengths.
    pub wavelength_center: f64,
    /// Differential line width and its error (NaN when not derivable).
    pub dlw: f64,
    pub e_dlw: f64,
    pub surface: Option<ChiSquareSurface>,
    pub warnings: Vec<FitWarning>,
}

impl OrderFit {
    fn unusable(warnings: Vec<FitWarning>) -> Self {
        Self {
            velocity_kms: f64::NAN,
            e_velocity_mps: f64::NAN,
            coeffs: Vec::new(),
            e_coeffs: Vec::new(),
            ssr: f64::NAN,
            stat: FitStat::empty(),
            wavelength_center: f64::NAN,
            dlw: f64::NAN,
            e_dlw: f64::NAN,
            surface: None,
            warnings,
        }
    }
}

/// How the clipping loop obtains the velocity each pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FitMode {
    /// Full grid search plus parabolic refinement.
    GridSearch,
    /// Polynomial-only regression at this fixed velocity.
    FixedVelocity(f64),
}

/// Borrowed inputs of the per-order robust fit.
pub struct OrderFitInput<'a> {
    pub order: &'a SpectralOrder,
    pub template: &'a CubicSpline,
    pub scale: WaveScale,
    pub degree: usize,
    pub clip: ClipConfig,
    pub grid: VelocityGridConfig,
    /// Center of the search grid, km/s.
    pub prior_kms: f64,
    /// Half-open pixel range of the order to use.
    pub window: (usize, usize),
    pub keep_surface: bool,
    /// Compute the differential line width after the velocity fit.
    pub line_width: bool,
}

/// Pixels allowed into the first fitting pass: inside the window, mask
/// clear, usable error, and covered by the template at both grid extremes.
pub fn initial_keep(
    order: &SpectralOrder,
    window: (usize, usize),
    template: &CubicSpline,
    scale: WaveScale,
    v_lo_kms: f64,
    v_hi_kms: f64,
) -> Vec<usize> {
    let (dom_lo, dom_hi) = template.domain();
    let wavelength = order.wavelength();
    let error = order.error();
    let flags = order.flags();
    (window.0..window.1.min(wavelength.len()))
        .filter(|&i| {
            if !flags[i].is_clear() {
                return false;
            }
            if !(error[i] > 0.0) || !error[i].is_finite() {
                return false;
            }
            let lo = scale.to_rest_frame(wavelength[i], v_lo_kms);
            let hi = scale.to_rest_frame(wavelength[i], v_hi_kms);
            lo.min(hi) >= dom_lo && lo.max(hi) <= dom_hi
        })
        .collect()
}

fn merge_warning(warnings: &mut Vec<FitWarning>, warning: FitWarning) {
    if !warnings.contains(&warning) {
        warnings.push(warning);
    }
}

/// Robust per-order fit: `clip.passes + 1` rounds of fit / drop / clip.
pub fn fit_order(input: &OrderFitInput<'_>, mode: FitMode) -> OrderFit {
    let order = input.order;
    let mut keep = initial_keep(
        order,
        input.window,
        input.template,
        input.scale,
        input.prior_kms + input.grid.start_kms,
        input.prior_kms + input.grid.stop_kms,
    );

    let mut result = OrderFit::unusable(Vec::new());
    let mut warnings: Vec<FitWarning> = Vec::new();
    let mut removed = 0usize;
    let passes = input.clip.passes + 1;

    for pass in 0..passes {
        if keep.len() < MIN_FIT_PIXELS {
            merge_warning(&mut warnings, FitWarning::DegradedFit);
            break;
        }
        let wcen = weighted_center(order.wavelength(), order.error(), &keep);
        let design = DopplerDesign {
            wavelength: order.wavelength(),
            flux: order.flux(),
            error: order.error(),
            template: input.template,
            scale: input.scale,
            degree: input.degree,
            wavelength_center: wcen,
        };

        let (velocity, e_velocity_kms, surface) = match mode {
            FitMode::GridSearch => {
                let out = search_velocity(&design, &keep, &input.grid, input.prior_kms);
                for w in out.warnings {
                    merge_warning(&mut warnings, w);
                }
                (out.velocity_kms, out.e_velocity_kms, Some(out.surface))
            }
            FitMode::FixedVelocity(v) => (v, f64::NAN, None),
        };

        let final_fit = design.fit_at(&keep, velocity);
        if final_fit.is_degenerate() {
            merge_warning(&mut warnings, FitWarning::DegradedFit);
            break;
        }
        let model = design.model_at(&keep, velocity, &final_fit.coeffs);

        // Pixels with a non-positive model carry no Doppler information.
        let mut kept = Vec::with_capacity(keep.len());
        let mut residuals = Vec::with_capacity(keep.len());
        let mut model_sum = 0.0;
        let mut abs_resid_sum = 0.0;
        for (&i, &m) in keep.iter().zip(&model) {
            if !(m > 0.0) {
                continue;
            }
            let raw = order.flux()[i] - m;
            kept.push(i);
            residuals.push(raw / order.error()[i]);
            model_sum += m;
            abs_resid_sum += raw.abs();
        }
        if kept.len() < MIN_FIT_PIXELS {
            merge_warning(&mut warnings, FitWarning::DegradedFit);
            break;
        }

        let n = kept.len() as f64;
        let rms = (residuals.iter().map(|r| r * r).sum::<f64>() / n).sqrt();
        let snr = if abs_resid_sum > 0.0 {
            model_sum / abs_resid_sum
        } else {
            f64::INFINITY
        };

        removed += keep.len() - kept.len();
        result = OrderFit {
            velocity_kms: velocity,
            e_velocity_mps: e_velocity_kms * rms * 1000.0,
            coeffs: final_fit.coeffs,
            e_coeffs: final_fit.e_coeffs,
            ssr: final_fit.ssr,
            stat: FitStat {
                rms,
                snr,
                n_used: kept.len(),
                n_clipped: removed,
                passes: pass + 1,
            },
            wavelength_center: wcen,
            dlw: f64::NAN,
            e_dlw: f64::NAN,
            surface: if input.keep_surface { surface } else { None },
            warnings: Vec::new(),
        };

        if pass + 1 < passes {
            let threshold = input.clip.kappa * rms;
            let survivors: Vec<usize> = kept
                .iter()
                .zip(&residuals)
                .filter(|&(_, &r)| r.abs() <= threshold)
                .map(|(&i, _)| i)
                .collect();
            removed += kept.len() - survivors.len();
            keep = survivors;
        } else {
            keep = kept;
        }
    }

    result.warnings = warnings;
    if input.line_width && result.e_velocity_mps.is_finite() && !keep.is_empty() {
        let design = DopplerDesign {
            wavelength: order.wavelength(),
            flux: order.flux(),
            error: order.error(),
            template: input.template,
            scale: input.scale,
            degree: input.degree,
            wavelength_center: result.wavelength_center,
        };
        if let Some((dlw, e_dlw)) = drift::differential_line_width(
            &design,
            &keep,
            result.velocity_kms,
            &result.coeffs,
        ) {
            result.dlw = dlw;
            result.e_dlw = e_dlw;
        }
    }
    result
}

/// One per-order estimate, tagged by the estimator that produced it. All
/// downstream combination goes through the common accessors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum OrderEstimate {
    LeastSquares(OrderFit),
    CcfBox(CcfFit),
    CcfBinless(CcfFit),
    Drift(DriftFit),
}

impl OrderEstimate {
    pub fn method(&self) -> EstimatorMethod {
        match self {
            OrderEstimate::LeastSquares(_) => EstimatorMethod::LeastSquares,
            OrderEstimate::CcfBox(_) => EstimatorMethod::CcfBox,
            OrderEstimate::CcfBinless(_) => EstimatorMethod::CcfBinless,
            OrderEstimate::Drift(_) => EstimatorMethod::Drift,
        }
    }

    pub fn velocity_kms(&self) -> f64 {
        match self {
            OrderEstimate::LeastSquares(fit) => fit.velocity_kms,
            OrderEstimate::CcfBox(fit) | OrderEstimate::CcfBinless(fit) => fit.velocity_kms,
            OrderEstimate::Drift(fit) => fit.velocity_kms,
        }
    }

    pub fn e_velocity_mps(&self) -> f64 {
        match self {
            OrderEstimate::LeastSquares(fit) => fit.e_velocity_mps,
            OrderEstimate::CcfBox(fit) | OrderEstimate::CcfBinless(fit) => fit.e_velocity_mps,
            OrderEstimate::Drift(fit) => fit.e_velocity_mps,
        }
    }

    pub fn wavelength_center(&self) -> f64 {
        match self {
            OrderEstimate::LeastSquares(fit) => fit.wavelength_center,
            OrderEstimate::CcfBox(fit) | OrderEstimate::CcfBinless(fit) => fit.wavelength_center,
            OrderEstimate::Drift(fit) => fit.wavelength_center,
        }
    }

    pub fn warnings(&self) -> &[FitWarning] {
        match self {
            OrderEstimate::LeastSquares(fit) => &fit.warnings,
            OrderEstimate::CcfBox(fit) | OrderEstimate::CcfBinless(fit) => &fit.warnings,
            OrderEstimate::Drift(fit) => &fit.warnings,
        }
    }

    pub fn surface(&self) -> Option<&ChiSquareSurface> {
        match self {
            OrderEstimate::LeastSquares(fit) => fit.surface.as_ref(),
            _ => None,
        }
    }

    /// Residual RMS used to scale joint chi2 surfaces.
    pub fn residual_rms(&self) -> f64 {
        match self {
            OrderEstimate::LeastSquares(fit) => fit.stat.rms,
            OrderEstimate::Drift(fit) => fit.stat.rms,
            _ => f64::NAN,
        }
    }

    pub fn line_width(&self) -> Option<(f64, f64)> {
        match self {
            OrderEstimate::LeastSquares(fit) if fit.dlw.is_finite() => {
                Some((fit.dlw, fit.e_dlw))
            }
            _ => None,
        }
    }

    /// Finite velocity and error, and no degraded-fit condition.
    pub fn is_usable(&self) -> bool {
        self.velocity_kms().is_finite()
            && self.e_velocity_mps().is_finite()
            && self.e_velocity_mps() > 0.0
            && !self.warnings().contains(&FitWarning::DegradedFit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::PixelFlags;

    const N_PIX: usize = 600;

    /// Template with a comb of absorption lines on a log-wavelength grid,
    /// spanning past the order on both sides so no pixel falls outside.
    fn line_template() -> CubicSpline {
        let x: Vec<f64> = (0..1600).map(|i| 8.4995 + 2.5e-6 * i as f64).collect();
        let y: Vec<f64> = x
            .iter()
            .map(|&w| {
                let mut f = 1.0;
                for k in 0..14 {
                    let center = 8.5001 + 2.1e-4 * k as f64;
                    let z = (w - center) / 2.2e-5;
                    f -= 0.55 * (-0.5 * z * z).exp();
                }
                f
            })
            .collect();
        CubicSpline::natural(x, y).expect("valid grid")
    }

    fn synthetic_order(template: &CubicSpline, v_kms: f64, snr: f64) -> SpectralOrder {
        let wavelength: Vec<f64> = (0..N_PIX).map(|i| 8.50 + 5e-6 * i as f64).collect();
        let flux: Vec<f64> = wavelength
            .iter()
            .enumerate()
            .map(|(i, &w)| {
                // Deterministic small perturbation standing in for noise.
                let bump = ((i * 97 + 13) % 23) as f64 / 23.0 - 0.5;
                let clean = 40.0 * template.eval(WaveScale::LogLambda.to_rest_frame(w, v_kms));
                clean * (1.0 + bump / snr)
            })
            .collect();
        let error: Vec<f64> = flux.iter().map(|&f| f.abs().max(1.0) / snr).collect();
        SpectralOrder::new(wavelength, flux, error, Vec::new()).expect("valid order")
    }

    fn base_input<'a>(order: &'a SpectralOrder, template: &'a CubicSpline) -> OrderFitInput<'a> {
        OrderFitInput {
            order,
            template,
            scale: WaveScale::LogLambda,
            degree: 2,
            clip: ClipConfig::default(),
            grid: VelocityGridConfig::default(),
            prior_kms: 0.0,
            window: (0, N_PIX),
            keep_surface: false,
            line_width: false,
        }
    }

    #[test]
    fn recovers_an_injected_velocity() {
        let template = line_template();
        let order = synthetic_order(&template, 1.2, 500.0);
        let input = base_input(&order, &template);

        let fit = fit_order(&input, FitMode::GridSearch);
        assert!(fit.warnings.is_empty(), "warnings {:?}", fit.warnings);
        assert!(
            (fit.velocity_kms - 1.2).abs() < 0.02,
            "got {}",
            fit.velocity_kms
        );
        assert!(fit.e_velocity_mps.is_finite() && fit.e_velocity_mps > 0.0);
        assert!(fit.stat.snr > 50.0);
    }

    #[test]
    fn zero_clip_passes_match_the_first_pass_of_two() {
        let template = line_template();
        let order = synthetic_order(&template, 0.4, 200.0);

        let mut one_pass = base_input(&order, &template);
        one_pass.clip = ClipConfig {
            kappa: 3.0,
            passes: 0,
        };
        let clean = fit_order(&one_pass, FitMode::GridSearch);

        let with_clipping = fit_order(&base_input(&order, &template), FitMode::GridSearch);

        // Clean data: nothing to clip, so the velocities agree tightly.
        assert!((clean.velocity_kms - with_clipping.velocity_kms).abs() < 1e-6);
    }

    #[test]
    fn clipping_absorbs_a_spiked_pixel() {
        let template = line_template();
        let clean = synthetic_order(&template, 0.0, 300.0);
        let clean_fit = fit_order(&base_input(&clean, &template), FitMode::GridSearch);

        let mut flux = clean.flux().to_vec();
        let error = clean.error().to_vec();
        // 10 sigma spike on the flank of the second line.
        flux[58] += 10.0 * error[58];
        let spiked = SpectralOrder::new(clean.wavelength().to_vec(), flux, error, Vec::new())
            .expect("valid order");

        let mut no_clip = base_input(&spiked, &template);
        no_clip.clip.passes = 0;
        let unclipped = fit_order(&no_clip, FitMode::GridSearch);
        let clipped = fit_order(&base_input(&spiked, &template), FitMode::GridSearch);

        assert!(clipped.stat.n_clipped >= 1);
        let drift_unclipped = (unclipped.velocity_kms - clean_fit.velocity_kms).abs();
        let drift_clipped = (clipped.velocity_kms - clean_fit.velocity_kms).abs();
        assert!(
            drift_clipped <= drift_unclipped,
            "clipped {drift_clipped} vs unclipped {drift_unclipped}"
        );
    }

    #[test]
    fn masked_pixels_never_enter_the_keep_set() {
        let template = line_template();
        let mut order = synthetic_order(&template, 0.0, 300.0);
        for flag in &mut order.flags_mut()[100..140] {
            flag.insert(PixelFlags::ATM);
        }
        let keep = initial_keep(
            &order,
            (0, N_PIX),
            &template,
            WaveScale::LogLambda,
            -5.5,
            5.6,
        );
        assert!(keep.iter().all(|&i| !(100..140).contains(&i)));
        assert!(!keep.is_empty());
    }

    #[test]
    fn too_few_pixels_degrade_instead_of_failing() {
        let template = line_template();
        let order = synthetic_order(&template, 0.0, 300.0);
        let mut input = base_input(&order, &template);
        input.window = (0, MIN_FIT_PIXELS - 2);

        let fit = fit_order(&input, FitMode::GridSearch);
        assert!(fit.warnings.contains(&FitWarning::DegradedFit));
        assert!(fit.velocity_kms.is_nan());
        assert!(fit.e_velocity_mps.is_nan());
    }

    #[test]
    fn fixed_velocity_mode_skips_the_search() {
        let template = line_template();
        let order = synthetic_order(&template, 0.0, 300.0);
        let fit = fit_order(&base_input(&order, &template), FitMode::FixedVelocity(0.0));
        assert!(fit.surface.is_none());
        assert_eq!(fit.velocity_kms, 0.0);
        assert!(fit.e_velocity_mps.is_nan());
        assert!(!fit.coeffs.is_empty());
    }
}
