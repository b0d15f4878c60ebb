//! Binary-mask cross-correlation: box and binless modes.
//!
//! The CCF path needs no template. A binary line mask defines where the
//! stellar lines sit in the rest frame; correlating the observed flux with
//! the mask over a velocity grid (box mode) or folding pixels around each
//! line into a velocity cloud (binless mode) yields a profile whose
//! Gaussian center is the velocity estimate.

use serde::Serialize;

use crate::common::config::{ClipConfig, VelocityGridConfig};
use crate::common::constants::{CCF_BINLESS_WINDOW_KMS, CCF_SIGMA_GUESS_KMS, SPEED_OF_LIGHT_KMS};
use crate::fit::FitWarning;
use crate::numerics::gaussfit::{fit_gaussian, GaussianFit};
use crate::numerics::quantile;
use crate::spectrum::{SpectralOrder, WaveScale};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CcfMaskError {
    #[error("line mask is empty")]
    Empty,
    #[error("mask line {index} has an empty or reversed box")]
    ReversedBox { index: usize },
    #[error("mask lines must be sorted by wavelength, violated at line {index}")]
    Unsorted { index: usize },
    #[error("mask line {index} carries a non-positive weight")]
    BadWeight { index: usize },
}

/// One box of the binary mask, in the rest-frame wavelength coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, serde::Deserialize)]
pub struct MaskLine {
    pub begin: f64,
    pub end: f64,
    pub weight: f64,
}

impl MaskLine {
    pub fn center(&self) -> f64 {
        0.5 * (self.begin + self.end)
    }
}

/// Sorted binary line mask.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct LineMask {
    lines: Vec<MaskLine>,
}

impl LineMask {
    pub fn new(lines: Vec<MaskLine>) -> Result<Self, CcfMaskError> {
        if lines.is_empty() {
            return Err(CcfMaskError::Empty);
        }
        for (index, line) in lines.iter().enumerate() {
            if !(line.begin < line.end) || !line.begin.is_finite() || !line.end.is_finite() {
                return Err(CcfMaskError::ReversedBox { index });
            }
            if !(line.weight > 0.0) {
                return Err(CcfMaskError::BadWeight { index });
            }
            if index > 0 && line.begin < lines[index - 1].end {
                return Err(CcfMaskError::Unsorted { index });
            }
        }
        Ok(Self { lines })
    }

    pub fn lines(&self) -> &[MaskLine] {
        &self.lines
    }

    /// The box containing `w`, if any.
    fn find(&self, w: f64) -> Option<&MaskLine> {
        let idx = self.lines.partition_point(|line| line.end <= w);
        self.lines
            .get(idx)
            .filter(|line| line.begin <= w && w < line.end)
    }
}

/// Gaussian peak fit of a correlation profile, the CCF flavor of the
/// per-order estimate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CcfFit {
    pub velocity_kms: f64,
    pub e_velocity_mps: f64,
    pub amplitude: f64,
    pub sigma_kms: f64,
    pub e_sigma_kms: f64,
    pub offset: f64,
    /// Dip depth relative to the continuum level, percent.
    pub contrast: f64,
    /// Correlation samples (box) or folded cloud points (binless).
    pub n_points: usize,
    pub n_lines: usize,
    pub wavelength_center: f64,
    pub warnings: Vec<FitWarning>,
}

impl CcfFit {
    /// Non-convergence result: zero-filled parameters, undefined errors.
    fn failed(wavelength_center: f64, n_points: usize, n_lines: usize) -> Self {
        Self {
            velocity_kms: 0.0,
            e_velocity_mps: f64::NAN,
            amplitude: 0.0,
            sigma_kms: 0.0,
            e_sigma_kms: f64::NAN,
            offset: 0.0,
            contrast: 0.0,
            n_points,
            n_lines,
            wavelength_center,
            warnings: vec![FitWarning::PeakFitFailed],
        }
    }

    fn from_gaussian(
        fit: &GaussianFit,
        wavelength_center: f64,
        n_points: usize,
        n_lines: usize,
    ) -> Self {
        let contrast = if fit.offset != 0.0 {
            -100.0 * fit.amplitude / fit.offset
        } else {
            f64::NAN
        };
        Self {
            velocity_kms: fit.center,
            e_velocity_mps: fit.e_center * 1000.0,
            amplitude: fit.amplitude,
            sigma_kms: fit.sigma,
            e_sigma_kms: fit.e_sigma,
            offset: fit.offset,
            contrast,
            n_points,
            n_lines,
            wavelength_center,
            warnings: Vec::new(),
        }
    }
}

pub struct CcfInput<'a> {
    pub order: &'a SpectralOrder,
    pub mask: &'a LineMask,
    pub scale: WaveScale,
    pub grid: VelocityGridConfig,
    pub clip: ClipConfig,
    pub prior_kms: f64,
    pub window: (usize, usize),
}

impl CcfInput<'_> {
    fn eligible_pixels(&self) -> Vec<usize> {
        let n = self.order.len();
        (self.window.0..self.window.1.min(n))
            .filter(|&i| self.order.flags()[i].is_clear() && self.order.error()[i] > 0.0)
            .collect()
    }

    /// Weighted center and contributing line count at the prior velocity.
    fn coverage(&self, pixels: &[usize]) -> (f64, usize) {
        let wavelength = self.order.wavelength();
        let error = self.order.error();
        let mut wsum = 0.0;
        let mut acc = 0.0;
        let mut line_hit = vec![false; self.mask.lines.len()];
        for &i in pixels {
            let rest = self.scale.to_rest_frame(wavelength[i], self.prior_kms);
            let idx = self.mask.lines.partition_point(|line| line.end <= rest);
            if let Some(line) = self.mask.lines.get(idx) {
                if line.begin <= rest && rest < line.end {
                    line_hit[idx] = true;
                    let w = 1.0 / (error[i] * error[i]);
                    wsum += w;
                    acc += w * wavelength[i];
                }
            }
        }
        let center = if wsum > 0.0 { acc / wsum } else { f64::NAN };
        (center, line_hit.iter().filter(|&&h| h).count())
    }
}

/// Box-mode CCF: the weighted mean in-box flux per grid velocity, with a
/// Gaussian fit to the resulting profile.
pub fn ccf_box(input: &CcfInput<'_>) -> CcfFit {
    let pixels = input.eligible_pixels();
    let (wavelength_center, n_lines) = input.coverage(&pixels);
    let wavelength = input.order.wavelength();
    let flux = input.order.flux();

    let n_grid = input.grid.n_samples();
    let start = input.prior_kms + input.grid.start_kms;
    let mut v_samples = Vec::with_capacity(n_grid);
    let mut ccf = Vec::with_capacity(n_grid);
    for k in 0..n_grid {
        let v = start + k as f64 * input.grid.step_kms;
        let mut wsum = 0.0;
        let mut acc = 0.0;
        for &i in &pixels {
            let rest = input.scale.to_rest_frame(wavelength[i], v);
            if let Some(line) = input.mask.find(rest) {
                wsum += line.weight;
                acc += line.weight * flux[i];
            }
        }
        if wsum > 0.0 {
            v_samples.push(v);
            ccf.push(acc / wsum);
        }
    }
    let n_points = v_samples.len();
    if n_points < 6 {
        return CcfFit::failed(wavelength_center, n_points, n_lines);
    }

    let lo = ccf.iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = ccf.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let start_params = [input.prior_kms, hi - lo, CCF_SIGMA_GUESS_KMS, lo];
    match fit_gaussian(&v_samples, &ccf, start_params) {
        Ok(fit) => CcfFit::from_gaussian(&fit, wavelength_center, n_points, n_lines),
        Err(_) => CcfFit::failed(wavelength_center, n_points, n_lines),
    }
}

/// Binless CCF: pixels fold into velocity offsets around each mask line,
/// continuum-normalized per line, one Gaussian fit to the pooled cloud
/// after a single kappa-sigma pre-clip.
pub fn ccf_binless(input: &CcfInput<'_>) -> CcfFit {
    let pixels = input.eligible_pixels();
    let (wavelength_center, n_lines) = input.coverage(&pixels);
    let wavelength = input.order.wavelength();
    let flux = input.order.flux();

    let mut cloud_v = Vec::new();
    let mut cloud_f = Vec::new();
    for line in input.mask.lines() {
        let center = line.center();
        let mut chunk_v = Vec::new();
        let mut chunk_f = Vec::new();
        for &i in &pixels {
            let offset = match input.scale {
                WaveScale::LogLambda => {
                    SPEED_OF_LIGHT_KMS * (wavelength[i] - center).exp_m1()
                }
                WaveScale::Linear => SPEED_OF_LIGHT_KMS * (wavelength[i] / center - 1.0),
            };
            if (offset - input.prior_kms).abs() <= CCF_BINLESS_WINDOW_KMS {
                chunk_v.push(offset);
                chunk_f.push(flux[i]);
            }
        }
        if chunk_v.len() < 4 {
            continue;
        }
        // Continuum level of this line from the upper flux quartile.
        let Some(continuum) = quantile(&chunk_f, 0.75) else {
            continue;
        };
        if !(continuum > 0.0) {
            continue;
        }
        for (v, f) in chunk_v.into_iter().zip(chunk_f) {
            cloud_v.push(v);
            cloud_f.push(f / continuum);
        }
    }
    let n_points = cloud_v.len();
    if n_points < 8 {
        return CcfFit::failed(wavelength_center, n_points, n_lines);
    }

    let lo = cloud_f.iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = cloud_f.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let start_params = [input.prior_kms, hi - lo, CCF_SIGMA_GUESS_KMS, lo];
    let Ok(first) = fit_gaussian(&cloud_v, &cloud_f, start_params) else {
        return CcfFit::failed(wavelength_center, n_points, n_lines);
    };

    // One pre-clip against the provisional profile, then the final fit.
    let model = |v: f64| {
        let z = (v - first.center) / first.sigma;
        first.offset + first.amplitude * (-0.5 * z * z).exp()
    };
    let residuals: Vec<f64> = cloud_v
        .iter()
        .zip(&cloud_f)
        .map(|(&v, &f)| f - model(v))
        .collect();
    let rms = (residuals.iter().map(|r| r * r).sum::<f64>() / n_points as f64).sqrt();
    let threshold = input.clip.kappa * rms;
    let mut kept_v = Vec::with_capacity(n_points);
    let mut kept_f = Vec::with_capacity(n_points);
    for ((&v, &f), &r) in cloud_v.iter().zip(&cloud_f).zip(&residuals) {
        if r.abs() <= threshold {
            kept_v.push(v);
            kept_f.push(f);
        }
    }
    if kept_v.len() < 8 {
        return CcfFit::failed(wavelength_center, kept_v.len(), n_lines);
    }
    let retry = [first.center, first.amplitude, first.sigma, first.offset];
    match fit_gaussian(&kept_v, &kept_f, retry) {
        Ok(fit) => CcfFit::from_gaussian(&fit, wavelength_center, kept_v.len(), n_lines),
        Err(_) => CcfFit::failed(wavelength_center, kept_v.len(), n_lines),
    }
}
