//! Coadded stellar template: per-order oversampled spline representation,
//! reference seeding, quality diagnostics and JSON persistence.
//!
//! A template starts as a spline-resampled copy of the highest-S/N
//! exposure and is then refined by one of the coaddition policies in
//! [`coadd`]. Restoring a stored template skips both the seeding and the
//! pre-RV alignment pass.

pub mod coadd;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::common::config::PixelWindow;
use crate::common::constants::{
    SPEED_OF_LIGHT_KMS, TEMPLATE_OVERSAMPLING, TEMPLATE_PIXEL_MARGIN,
};
use crate::numerics::bspline::BSplineError;
use crate::numerics::interpolate_linear;
use crate::numerics::spline::{CubicSpline, SplineError};
use crate::spectrum::{Exposure, PixelFlags, SpectralOrder, WaveScale, WavelengthMask};

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("no usable exposure to seed the template")]
    NoUsableExposure,
    #[error("exposure {id} carries {found} orders, the template has {expected}")]
    MismatchedOrders {
        id: String,
        expected: usize,
        found: usize,
    },
    #[error("order {order}: {source}")]
    Spline { order: usize, source: SplineError },
    #[error(
        "order {order}: coadd spline fit failed ({source}); gaps from masking or \
         bad-pixel flagging are the usual cause, a roughness penalty (smoothing > 0) \
         or a mean prior bridges them"
    )]
    Coadd {
        order: usize,
        source: BSplineError,
    },
    #[error(
        "order {order}: non-finite noise estimate in coadding; gaps from masking or \
         bad-pixel flagging are the usual cause, a roughness penalty (smoothing > 0) \
         bridges them"
    )]
    NonFiniteNoise { order: usize },
    #[error("coadd policy 'post2' carries an unresolved weighting scheme; use 'post3'")]
    UnresolvedPolicy,
    #[error("failed to read template {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write template {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("template {} is not valid JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("template serialization failed: {source}")]
    Encode { source: serde_json::Error },
}

/// Coadd knot bookkeeping: positions, fitted values, local noise estimates
/// and the number of good pixels nearest to each knot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnotDiagnostics {
    pub wavelength: Vec<f64>,
    pub value: Vec<f64>,
    pub error: Vec<f64>,
    pub good_pixels: Vec<u32>,
}

/// Photon-limited quality of the reference spectrum for one order,
/// following the Bouchy weighting: gradient information sets the
/// theoretical RV precision, and Q relates it to the plain S/N.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderQuality {
    pub q_factor: f64,
    pub rv_precision_mps: f64,
    pub reference_snr: f64,
}

impl OrderQuality {
    fn undefined() -> Self {
        Self {
            q_factor: f64::NAN,
            rv_precision_mps: f64::NAN,
            reference_snr: f64::NAN,
        }
    }
}

/// One order of the template: the natural-spline representation over the
/// oversampled barycentric wavelength grid plus coadd diagnostics.
#[derive(Debug, Clone)]
pub struct OrderTemplate {
    spline: CubicSpline,
    knots: KnotDiagnostics,
    quality: OrderQuality,
    snr: f64,
}

impl OrderTemplate {
    pub fn new(
        wavelength: Vec<f64>,
        flux: Vec<f64>,
        quality: OrderQuality,
    ) -> Result<Self, SplineError> {
        Ok(Self {
            spline: CubicSpline::natural(wavelength, flux)?,
            knots: KnotDiagnostics::default(),
            quality,
            snr: f64::NAN,
        })
    }

    pub fn wavelength(&self) -> &[f64] {
        self.spline.x()
    }

    pub fn flux(&self) -> &[f64] {
        self.spline.y()
    }

    pub fn spline(&self) -> &CubicSpline {
        &self.spline
    }

    pub fn domain(&self) -> (f64, f64) {
        self.spline.domain()
    }

    pub fn knots(&self) -> &KnotDiagnostics {
        &self.knots
    }

    pub fn quality(&self) -> OrderQuality {
        self.quality
    }

    /// Combined coadd S/N, rms-summed over the contributing exposures.
    pub fn snr(&self) -> f64 {
        self.snr
    }

    pub(crate) fn set_knots(&mut self, knots: KnotDiagnostics) {
        self.knots = knots;
    }

    pub(crate) fn set_snr(&mut self, snr: f64) {
        self.snr = snr;
    }

    /// Swaps in new flux samples on the unchanged wavelength grid.
    pub(crate) fn replace_flux(&mut self, flux: Vec<f64>) -> Result<(), SplineError> {
        self.spline = CubicSpline::natural(self.spline.x().to_vec(), flux)?;
        Ok(())
    }
}

/// The full per-order template of one target.
#[derive(Debug, Clone)]
pub struct Template {
    scale: WaveScale,
    reference_id: String,
    n_exposures: usize,
    orders: Vec<Option<OrderTemplate>>,
}

impl Template {
    pub(crate) fn new(
        scale: WaveScale,
        reference_id: String,
        orders: Vec<Option<OrderTemplate>>,
    ) -> Self {
        Self {
            scale,
            reference_id,
            n_exposures: 1,
            orders,
        }
    }

    pub fn scale(&self) -> WaveScale {
        self.scale
    }

    pub fn reference_id(&self) -> &str {
        &self.reference_id
    }

    /// Exposures folded into the template (1 for a bare seed).
    pub fn n_exposures(&self) -> usize {
        self.n_exposures
    }

    pub fn n_orders(&self) -> usize {
        self.orders.len()
    }

    pub fn order(&self, o: usize) -> Option<&OrderTemplate> {
        self.orders.get(o).and_then(|t| t.as_ref())
    }

    pub(crate) fn order_mut(&mut self, o: usize) -> Option<&mut OrderTemplate> {
        self.orders.get_mut(o).and_then(|t| t.as_mut())
    }

    pub(crate) fn set_n_exposures(&mut self, n: usize) {
        self.n_exposures = n;
    }

    pub fn store(&self, path: &Path) -> Result<(), TemplateError> {
        let record = TemplateFile {
            reference_id: self.reference_id.clone(),
            scale: self.scale,
            n_exposures: self.n_exposures,
            orders: self
                .orders
                .iter()
                .map(|order| {
                    order.as_ref().map(|t| OrderRecord {
                        wavelength: t.wavelength().to_vec(),
                        flux: t.flux().to_vec(),
                        knots: t.knots.clone(),
                        quality: t.quality,
                        snr: t.snr,
                    })
                })
                .collect(),
        };
        let text = serde_json::to_string_pretty(&record)
            .map_err(|source| TemplateError::Encode { source })?;
        fs::write(path, text).map_err(|source| TemplateError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn restore(path: &Path) -> Result<Self, TemplateError> {
        let text = fs::read_to_string(path).map_err(|source| TemplateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let record: TemplateFile =
            serde_json::from_str(&text).map_err(|source| TemplateError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let mut orders = Vec::with_capacity(record.orders.len());
        for (o, stored) in record.orders.into_iter().enumerate() {
            match stored {
                None => orders.push(None),
                Some(rec) => {
                    let mut order = OrderTemplate::new(rec.wavelength, rec.flux, rec.quality)
                        .map_err(|source| TemplateError::Spline { order: o, source })?;
                    order.knots = rec.knots;
                    order.snr = rec.snr;
                    orders.push(Some(order));
                }
            }
        }
        Ok(Self {
            scale: record.scale,
            reference_id: record.reference_id,
            n_exposures: record.n_exposures,
            orders,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct TemplateFile {
    reference_id: String,
    scale: WaveScale,
    n_exposures: usize,
    orders: Vec<Option<OrderRecord>>,
}

#[derive(Serialize, Deserialize)]
struct OrderRecord {
    wavelength: Vec<f64>,
    flux: Vec<f64>,
    knots: KnotDiagnostics,
    quality: OrderQuality,
    snr: f64,
}

/// Reference exposure for seeding: the highest estimated S/N among the
/// usable ones. Exposures without a finite S/N estimate never qualify.
pub(crate) fn select_reference(exposures: &[Exposure]) -> Result<usize, TemplateError> {
    exposures
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_usable())
        .map(|(i, e)| (i, e.snr_estimate()))
        .filter(|(_, snr)| snr.is_finite())
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i)
        .ok_or(TemplateError::NoUsableExposure)
}

/// Oversampled seed of one order, with interpolated errors and grid flags
/// so the coadd policies can weight and exclude subpixels.
#[derive(Debug, Clone)]
pub(crate) struct SeedOrder {
    pub wavelength: Vec<f64>,
    pub flux: Vec<f64>,
    pub error: Vec<f64>,
    pub flags: Vec<PixelFlags>,
}

/// Builds the oversampled grid of one order from the reference exposure:
/// pixel-to-wavelength and wavelength-to-flux splines over the finite
/// pixels, evaluated at fixed subpixel steps over the oversized pixel
/// window, errors interpolated linearly across good pixels. Telluric and
/// sky masks are evaluated in the observer frame of the reference. Orders
/// without enough clear pixels yield no seed.
pub(crate) fn seed_order(
    order: &SpectralOrder,
    berv_kms: f64,
    scale: WaveScale,
    window: &PixelWindow,
    telluric: Option<&WavelengthMask>,
    sky: Option<&WavelengthMask>,
) -> Option<SeedOrder> {
    let n = order.len();
    let (win_lo, win_hi) = window.clamp_to(n);
    let lo = win_lo.saturating_sub(TEMPLATE_PIXEL_MARGIN);
    let hi = (win_hi + TEMPLATE_PIXEL_MARGIN).min(n);
    if hi <= lo + 1 {
        return None;
    }

    let wavelength = order.wavelength();
    let flux = order.flux();
    let error = order.error();
    let flags = order.flags();

    // Finite pixels inside the oversized window, as relative positions.
    let mut pix = Vec::new();
    let mut wl = Vec::new();
    let mut fl = Vec::new();
    let mut usable = 0usize;
    for i in lo..hi {
        if wavelength[i].is_finite() && flux[i].is_finite() && error[i].is_finite() {
            pix.push((i - lo) as f64);
            wl.push(scale.barycentric(wavelength[i], berv_kms));
            fl.push(flux[i]);
            if flags[i].is_clear() && error[i] > 0.0 {
                usable += 1;
            }
        }
    }
    // A seed needs unflagged pixels, not just finite ones.
    if pix.len() < 4 || usable < 4 {
        return None;
    }

    let span = hi - lo;
    let n_sub = (span - 1) * TEMPLATE_OVERSAMPLING + 1;
    let pixel_to_wavelength = CubicSpline::natural(pix, wl.clone()).ok()?;
    let wavelength_to_flux = CubicSpline::natural(wl.clone(), fl).ok()?;

    let mut grid = Vec::with_capacity(n_sub);
    for k in 0..n_sub {
        let p = k as f64 / TEMPLATE_OVERSAMPLING as f64;
        grid.push(pixel_to_wavelength.eval(p));
    }
    if grid.windows(2).any(|w| !(w[1] > w[0])) {
        return None;
    }
    let grid_flux: Vec<f64> = grid.iter().map(|&w| wavelength_to_flux.eval(w)).collect();

    // Errors interpolate linearly across good pixels; the border pixels of
    // the finite set stay in even when flagged so the ends are anchored.
    let mut good_w = Vec::new();
    let mut good_e = Vec::new();
    for i in lo..hi {
        if !wavelength[i].is_finite() || !error[i].is_finite() {
            continue;
        }
        let border = good_w.is_empty();
        if border || (flags[i].is_clear() && error[i] > 0.0) {
            good_w.push(scale.barycentric(wavelength[i], berv_kms));
            good_e.push(error[i]);
        }
    }
    if let Some(i) = (lo..hi)
        .rev()
        .find(|&i| wavelength[i].is_finite() && error[i].is_finite())
    {
        let w = scale.barycentric(wavelength[i], berv_kms);
        if good_w.last().is_none_or(|&last| last < w) {
            good_w.push(w);
            good_e.push(error[i]);
        }
    }
    let grid_error: Vec<f64> = grid
        .iter()
        .map(|&w| interpolate_linear(w, &good_w, &good_e).unwrap_or(f64::NAN))
        .collect();

    let mut grid_flags = vec![PixelFlags::OK; n_sub];
    for (k, flag) in grid_flags.iter_mut().enumerate() {
        // Masks apply at the observer-frame position of the grid point.
        let observer = scale.to_rest_frame(grid[k], berv_kms);
        if telluric.is_some_and(|m| m.is_masked(observer)) {
            flag.insert(PixelFlags::ATM);
        }
        if sky.is_some_and(|m| m.is_masked(observer)) {
            flag.insert(PixelFlags::SKY);
        }
        if !(grid_error[k] > 0.0) || !grid_error[k].is_finite() {
            flag.insert(PixelFlags::NAN);
        }
        if grid_flux[k] < 0.0 {
            flag.insert(PixelFlags::NEG);
        }
    }

    Some(SeedOrder {
        wavelength: grid,
        flux: grid_flux,
        error: grid_error,
        flags: grid_flags,
    })
}

/// Photon-limited theoretical RV precision and Q factor of one order,
/// gradient-weighted over the unflagged interior pixels.
pub(crate) fn order_quality(order: &SpectralOrder) -> OrderQuality {
    let wavelength = order.wavelength();
    let flux = order.flux();
    let error = order.error();
    let flags = order.flags();
    let n = order.len();
    if n < 3 {
        return OrderQuality::undefined();
    }

    let mut gradient_info = 0.0;
    let mut snr_sq = 0.0;
    for i in 1..n - 1 {
        if !flags[i].is_clear() || !(error[i] > 0.0) || !error[i].is_finite() {
            continue;
        }
        if !flux[i - 1].is_finite() || !flux[i + 1].is_finite() || !flux[i].is_finite() {
            continue;
        }
        let dw = wavelength[i + 1] - wavelength[i - 1];
        if !(dw > 0.0) {
            continue;
        }
        let wi = (flux[i + 1] - flux[i - 1]) / dw / error[i];
        gradient_info += wi * wi;
        let s = flux[i] / error[i];
        snr_sq += s * s;
    }
    if !(gradient_info > 0.0) || !(snr_sq > 0.0) {
        return OrderQuality::undefined();
    }
    let dv_kms = SPEED_OF_LIGHT_KMS / gradient_info.sqrt();
    let snr = snr_sq.sqrt();
    OrderQuality {
        q_factor: SPEED_OF_LIGHT_KMS / dv_kms / snr,
        rv_precision_mps: dv_kms * 1000.0,
        reference_snr: snr,
    }
}
