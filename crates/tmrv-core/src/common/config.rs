//! Run configuration: serde-backed, file-loadable, validated up front.
//!
//! Every tunable of the engine lives here with the operational defaults.
//! `RunConfig::validate` runs before any data is touched so that
//! contradictory settings surface as one configuration error instead of a
//! mid-run failure.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::common::constants::{
    DEFAULT_GRID_START_KMS, DEFAULT_GRID_STEP_KMS, DEFAULT_GRID_STOP_KMS,
};
use crate::domain::{CoaddPolicy, EstimatorMethod, RvError, RvResult};
use crate::spectrum::WaveScale;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read configuration {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse configuration {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Uniform velocity grid for the SSR search, km/s relative to the prior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VelocityGridConfig {
    pub start_kms: f64,
    pub stop_kms: f64,
    pub step_kms: f64,
}

impl Default for VelocityGridConfig {
    fn default() -> Self {
        Self {
            start_kms: DEFAULT_GRID_START_KMS,
            stop_kms: DEFAULT_GRID_STOP_KMS,
            step_kms: DEFAULT_GRID_STEP_KMS,
        }
    }
}

impl VelocityGridConfig {
    /// Number of grid samples, end inclusive when the step divides the span.
    pub fn n_samples(&self) -> usize {
        if !(self.step_kms > 0.0) || !(self.stop_kms > self.start_kms) {
            return 0;
        }
        ((self.stop_kms - self.start_kms) / self.step_kms + 1.5).floor() as usize
    }
}

/// Kappa-sigma clipping of the robust fitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClipConfig {
    pub kappa: f64,
    pub passes: usize,
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            kappa: 3.0,
            passes: 2,
        }
    }
}

/// Template coaddition controls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoaddConfig {
    pub policy: CoaddPolicy,
    /// Lower/upper clip thresholds against the local noise level.
    pub kappa_low: f64,
    pub kappa_high: f64,
    pub passes: usize,
    /// Knots per template pixel.
    pub knot_factor: f64,
    /// Second-difference roughness penalty on the B-spline coefficients.
    pub smoothing: f64,
    /// Weak pull of the B-spline toward the data mean over masked gaps.
    pub mean_prior_weight: f64,
    /// Base factor of the telluric down-weighting.
    pub telluric_weight_factor: f64,
}

impl Default for CoaddConfig {
    fn default() -> Self {
        Self {
            policy: CoaddPolicy::Post3,
            kappa_low: 4.0,
            kappa_high: 4.0,
            passes: 2,
            knot_factor: 1.0,
            smoothing: 0.0,
            mean_prior_weight: 0.0,
            telluric_weight_factor: 0.1,
        }
    }
}

/// Pixel range of an order that participates in fitting and coaddition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PixelWindow {
    pub min_px: usize,
    pub max_px: usize,
}

impl Default for PixelWindow {
    fn default() -> Self {
        Self {
            min_px: 300,
            max_px: 3800,
        }
    }
}

impl PixelWindow {
    /// Clamps the window to an order of `len` pixels.
    pub fn clamp_to(&self, len: usize) -> (usize, usize) {
        let hi = self.max_px.min(len);
        let lo = self.min_px.min(hi);
        (lo, hi)
    }
}

/// Exposures outside these estimated S/N limits are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnrLimits {
    pub min: f64,
    pub max: f64,
}

impl Default for SnrLimits {
    fn default() -> Self {
        Self {
            min: 10.0,
            max: 400.0,
        }
    }
}

/// A line activity index: mean flux in the line band over the mean of two
/// reference bands, bounds in the wavelength coordinate of the spectra.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexWindow {
    pub name: String,
    pub line: (f64, f64),
    pub reference_low: (f64, f64),
    pub reference_high: (f64, f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub method: EstimatorMethod,
    pub scale: WaveScale,
    pub grid: VelocityGridConfig,
    /// Continuum polynomial degree.
    pub degree: usize,
    pub clip: ClipConfig,
    pub coadd: CoaddConfig,
    pub pixel_window: PixelWindow,
    pub snr_limits: SnrLimits,
    /// Prior stellar velocity the search grid is centered on, km/s.
    pub prior_rv_kms: f64,
    /// Velocity the template is shifted by before use, km/s.
    pub template_rv_kms: f64,
    pub index_windows: Vec<IndexWindow>,
    /// Retain per-order chi2 surfaces in the results.
    pub keep_surfaces: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            method: EstimatorMethod::default(),
            scale: WaveScale::default(),
            grid: VelocityGridConfig::default(),
            degree: 3,
            clip: ClipConfig::default(),
            coadd: CoaddConfig::default(),
            pixel_window: PixelWindow::default(),
            snr_limits: SnrLimits::default(),
            prior_rv_kms: 0.0,
            template_rv_kms: 0.0,
            index_windows: Vec::new(),
            keep_surfaces: false,
        }
    }
}

impl RunConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks the settings against each other before any data is loaded.
    pub fn validate(&self) -> RvResult<()> {
        if !(self.grid.step_kms > 0.0) {
            return Err(RvError::input_validation(
                "CONFIG_GRID",
                format!("velocity grid step must be positive, got {}", self.grid.step_kms),
            ));
        }
        if !(self.grid.stop_kms > self.grid.start_kms) {
            return Err(RvError::input_validation(
                "CONFIG_GRID",
                format!(
                    "velocity grid is empty: start {} stop {}",
                    self.grid.start_kms, self.grid.stop_kms
                ),
            ));
        }
        if self.grid.n_samples() < 5 {
            return Err(RvError::input_validation(
                "CONFIG_GRID",
                format!(
                    "velocity grid needs at least 5 samples for the parabolic refiner, got {}",
                    self.grid.n_samples()
                ),
            ));
        }
        if !(self.clip.kappa > 0.0) {
            return Err(RvError::input_validation(
                "CONFIG_CLIP",
                format!("clip kappa must be positive, got {}", self.clip.kappa),
            ));
        }
        if self.coadd.policy == CoaddPolicy::Post2 {
            return Err(RvError::input_validation(
                "CONFIG_COADD",
                "coadd policy 'post2' carries an unresolved weighting scheme and is not \
                 available; use 'post3' (default), 'post' or 'flying'",
            ));
        }
        if !(self.coadd.kappa_low > 0.0) || !(self.coadd.kappa_high > 0.0) {
            return Err(RvError::input_validation(
                "CONFIG_COADD",
                format!(
                    "coadd clip kappas must be positive, got ({}, {})",
                    self.coadd.kappa_low, self.coadd.kappa_high
                ),
            ));
        }
        if !(self.coadd.knot_factor > 0.0) {
            return Err(RvError::input_validation(
                "CONFIG_COADD",
                format!("coadd knot factor must be positive, got {}", self.coadd.knot_factor),
            ));
        }
        if !(self.coadd.telluric_weight_factor > 0.0) {
            return Err(RvError::input_validation(
                "CONFIG_COADD",
                format!(
                    "telluric weight factor must be positive, got {}",
                    self.coadd.telluric_weight_factor
                ),
            ));
        }
        if self.pixel_window.min_px >= self.pixel_window.max_px {
            return Err(RvError::input_validation(
                "CONFIG_PIXELS",
                format!(
                    "pixel window is empty: {}..{}",
                    self.pixel_window.min_px, self.pixel_window.max_px
                ),
            ));
        }
        if !(self.snr_limits.min < self.snr_limits.max) {
            return Err(RvError::input_validation(
                "CONFIG_SNR",
                format!(
                    "S/N limits are contradictory: min {} max {}",
                    self.snr_limits.min, self.snr_limits.max
                ),
            ));
        }
        for window in &self.index_windows {
            for (label, band) in [
                ("line", window.line),
                ("reference_low", window.reference_low),
                ("reference_high", window.reference_high),
            ] {
                if !(band.0 < band.1) {
                    return Err(RvError::input_validation(
                        "CONFIG_INDEX",
                        format!(
                            "index '{}' {label} band is empty: ({}, {})",
                            window.name, band.0, band.1
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}
