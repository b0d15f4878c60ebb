//! Physical constants and fit floors shared across the engine.

/// Speed of light [km/s], the value the velocity scales are calibrated to.
pub const SPEED_OF_LIGHT_KMS: f64 = 299_792.4580;

/// Template flux floor below which a pixel is excluded from the
/// continuum regression; shifted-template samples at or under this level
/// carry no usable line information.
pub const TEMPLATE_FLUX_FLOOR: f64 = 1.0e-4;

/// Minimum pixels a robust fit may shrink to before it is declared degraded.
pub const MIN_FIT_PIXELS: usize = 10;

/// Mask value above which a wavelength counts as telluric/sky affected.
pub const MASK_THRESHOLD: f64 = 0.01;

/// Default velocity grid [km/s] around the prior guess.
pub const DEFAULT_GRID_START_KMS: f64 = -5.5;
pub const DEFAULT_GRID_STOP_KMS: f64 = 5.6;
pub const DEFAULT_GRID_STEP_KMS: f64 = 0.1;

/// Subpixel sampling of the template grid relative to detector pixels.
pub const TEMPLATE_OVERSAMPLING: usize = 4;

/// Extra pixels kept on each side of the fitted pixel window when the
/// template grid is laid out, so Doppler shifts stay inside the template.
pub const TEMPLATE_PIXEL_MARGIN: usize = 100;

/// Default half-width [km/s] of the per-line window in binless CCF mode.
pub const CCF_BINLESS_WINDOW_KMS: f64 = 6.0;

/// Initial sigma guess [km/s] for the CCF Gaussian peak fit.
pub const CCF_SIGMA_GUESS_KMS: f64 = 2.5;
