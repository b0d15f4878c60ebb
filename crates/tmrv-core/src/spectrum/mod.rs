//! Spectral data model: per-order arrays, pixel condition flags and the
//! wavelength-scale conventions every estimator shares.

pub mod mask;

pub use mask::WavelengthMask;

use crate::common::constants::SPEED_OF_LIGHT_KMS;

/// Wavelength axis convention. Orders are stored either as natural log of
/// wavelength (default, uniform velocity per pixel) or as linear wavelength.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum WaveScale {
    #[default]
    LogLambda,
    Linear,
}

impl WaveScale {
    /// Doppler-shifts a wavelength sample by `+v_kms` (receding emitter).
    pub fn shift(self, w: f64, v_kms: f64) -> f64 {
        let a = 1.0 + v_kms / SPEED_OF_LIGHT_KMS;
        match self {
            Self::LogLambda => w + a.ln(),
            Self::Linear => w * a,
        }
    }

    /// Inverse of [`WaveScale::shift`]: the rest-frame wavelength that an
    /// emitter moving at `v_kms` presents at observed wavelength `w`.
    pub fn to_rest_frame(self, w: f64, v_kms: f64) -> f64 {
        let a = 1.0 + v_kms / SPEED_OF_LIGHT_KMS;
        match self {
            Self::LogLambda => w - a.ln(),
            Self::Linear => w / a,
        }
    }

    /// Observer-to-barycenter correction; `berv_kms` follows the convention
    /// that positive values shift observed wavelengths redward.
    pub fn barycentric(self, w: f64, berv_kms: f64) -> f64 {
        self.shift(w, berv_kms)
    }
}

/// Per-pixel condition word. A pixel takes part in fits iff the word is zero.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct PixelFlags(u16);

impl PixelFlags {
    pub const OK: Self = Self(0);
    /// Missing or non-finite flux, or unusable error value.
    pub const NAN: Self = Self(1);
    /// Significantly negative flux.
    pub const NEG: Self = Self(1 << 1);
    /// Saturated or too-sharp feature.
    pub const SAT: Self = Self(1 << 2);
    /// Telluric absorption at this wavelength.
    pub const ATM: Self = Self(1 << 3);
    /// Sky emission at this wavelength.
    pub const SKY: Self = Self(1 << 4);
    /// Outside the template wavelength coverage.
    pub const OUT: Self = Self(1 << 5);
    /// Rejected by kappa-sigma clipping.
    pub const CLIP: Self = Self(1 << 6);
    /// Low information content.
    pub const LOW_Q: Self = Self(1 << 7);
    /// Bad corresponding region in the template.
    pub const BAD_TEMPLATE: Self = Self(1 << 8);

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn is_clear(self) -> bool {
        self.0 == 0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for PixelFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

/// Exposure-level condition word; nonzero exposures are excluded from
/// template building and reported as skipped.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct ExposureFlags(u8);

impl ExposureFlags {
    pub const OK: Self = Self(0);
    /// Below the signal-to-noise floor.
    pub const LOW_SN: Self = Self(1);
    /// Above the signal-to-noise ceiling (likely saturation).
    pub const HIGH_SN: Self = Self(1 << 1);
    /// Deselected by the caller.
    pub const SKIP: Self = Self(1 << 2);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_clear(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpectrumError {
    #[error(
        "spectral arrays must share one length, got wavelength {wavelength}, flux {flux}, error {error}"
    )]
    MismatchedLengths {
        wavelength: usize,
        flux: usize,
        error: usize,
    },
    #[error("spectral order needs at least {min} pixels, got {len}")]
    TooShort { len: usize, min: usize },
    #[error("wavelength must be finite and strictly increasing, violated at pixel {index}")]
    NonMonotonicWavelength { index: usize },
}

const MIN_ORDER_PIXELS: usize = 4;

/// One echelle order: wavelength, flux, error and a condition word per pixel.
///
/// Wavelengths are validated strictly increasing at construction; flux and
/// error values are never rejected, pixels with unusable ones are flagged.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralOrder {
    wavelength: Vec<f64>,
    flux: Vec<f64>,
    error: Vec<f64>,
    flags: Vec<PixelFlags>,
}

impl SpectralOrder {
    pub fn new(
        wavelength: Vec<f64>,
        flux: Vec<f64>,
        error: Vec<f64>,
        flags: Vec<PixelFlags>,
    ) -> Result<Self, SpectrumError> {
        if wavelength.len() != flux.len()
            || wavelength.len() != error.len()
            || (!flags.is_empty() && flags.len() != wavelength.len())
        {
            return Err(SpectrumError::MismatchedLengths {
                wavelength: wavelength.len(),
                flux: flux.len(),
                error: error.len(),
            });
        }
        if wavelength.len() < MIN_ORDER_PIXELS {
            return Err(SpectrumError::TooShort {
                len: wavelength.len(),
                min: MIN_ORDER_PIXELS,
            });
        }
        for (index, pair) in wavelength.windows(2).enumerate() {
            if !pair[0].is_finite() || !(pair[1] > pair[0]) {
                return Err(SpectrumError::NonMonotonicWavelength { index });
            }
        }
        if !wavelength[wavelength.len() - 1].is_finite() {
            return Err(SpectrumError::NonMonotonicWavelength {
                index: wavelength.len() - 1,
            });
        }

        let mut flags = if flags.is_empty() {
            vec![PixelFlags::OK; wavelength.len()]
        } else {
            flags
        };
        for i in 0..wavelength.len() {
            if !flux[i].is_finite() || !error[i].is_finite() || error[i] <= 0.0 {
                flags[i].insert(PixelFlags::NAN);
            } else if flux[i] < -3.0 * error[i] {
                flags[i].insert(PixelFlags::NEG);
            }
        }

        Ok(Self {
            wavelength,
            flux,
            error,
            flags,
        })
    }

    pub fn len(&self) -> usize {
        self.wavelength.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelength.is_empty()
    }

    pub fn wavelength(&self) -> &[f64] {
        &self.wavelength
    }

    pub fn flux(&self) -> &[f64] {
        &self.flux
    }

    pub fn error(&self) -> &[f64] {
        &self.error
    }

    pub fn flags(&self) -> &[PixelFlags] {
        &self.flags
    }

    pub fn flags_mut(&mut self) -> &mut [PixelFlags] {
        &mut self.flags
    }

    /// Indices of pixels whose condition word carries none of `reject`.
    pub fn pixels_clear_of(&self, reject: PixelFlags) -> Vec<usize> {
        (0..self.len())
            .filter(|&i| !self.flags[i].intersects(reject))
            .collect()
    }

    /// Indices of pixels with a fully clear condition word.
    pub fn good_pixels(&self) -> Vec<usize> {
        (0..self.len())
            .filter(|&i| self.flags[i].is_clear())
            .collect()
    }

    /// Flags every pixel whose shifted wavelength the mask covers.
    ///
    /// `shift` maps the stored wavelength into the frame the mask is
    /// defined in (identity for an observer-frame mask).
    pub fn flag_masked_pixels(
        &mut self,
        mask: &WavelengthMask,
        flag: PixelFlags,
        shift: impl Fn(f64) -> f64,
    ) -> usize {
        let mut flagged = 0;
        for i in 0..self.wavelength.len() {
            if mask.is_masked(shift(self.wavelength[i])) {
                self.flags[i].insert(flag);
                flagged += 1;
            }
        }
        flagged
    }

    /// Median flux-to-error ratio over clear pixels; NaN when none.
    pub fn median_snr(&self) -> f64 {
        let mut ratios: Vec<f64> = (0..self.len())
            .filter(|&i| self.flags[i].is_clear() && self.error[i] > 0.0)
            .map(|i| self.flux[i] / self.error[i])
            .collect();
        crate::numerics::median_inplace(&mut ratios).unwrap_or(f64::NAN)
    }
}

/// One observed exposure: all orders plus the frame corrections that move
/// it into the barycentric and stellar rest frames.
#[derive(Debug, Clone, PartialEq)]
pub struct Exposure {
    pub id: String,
    /// Barycentric epoch of observation [day].
    pub bjd: f64,
    /// Barycentric velocity correction [km/s].
    pub berv_kms: f64,
    /// Instrumental drift at the epoch [m/s], subtracted from the RV series.
    pub drift_mps: f64,
    pub e_drift_mps: f64,
    /// Secular acceleration correction [m/s].
    pub secular_mps: f64,
    pub flags: ExposureFlags,
    pub orders: Vec<SpectralOrder>,
}

impl Exposure {
    pub fn n_orders(&self) -> usize {
        self.orders.len()
    }

    pub fn is_usable(&self) -> bool {
        self.flags.is_clear()
    }

    /// Median over orders of the per-order median S/N; the reference
    /// exposure for template building is picked by this figure.
    pub fn snr_estimate(&self) -> f64 {
        let mut per_order: Vec<f64> = self
            .orders
            .iter()
            .map(SpectralOrder::median_snr)
            .filter(|snr| snr.is_finite())
            .collect();
        crate::numerics::median_inplace(&mut per_order).unwrap_or(f64::NAN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_with_flux(flux: Vec<f64>) -> SpectralOrder {
        let n = flux.len();
        let wavelength: Vec<f64> = (0..n).map(|i| 6.0 + 1e-5 * i as f64).collect();
        let error = vec![0.1; n];
        SpectralOrder::new(wavelength, flux, error, Vec::new()).expect("valid order")
    }

    #[test]
    fn shift_and_rest_frame_are_exact_inverses() {
        for scale in [WaveScale::LogLambda, WaveScale::Linear] {
            let w = 8.131;
            let v = 17.25;
            let shifted = scale.shift(w, v);
            assert!((scale.to_rest_frame(shifted, v) - w).abs() < 1e-14);
        }
    }

    #[test]
    fn log_shift_matches_linear_shift_through_exp() {
        let lambda = 5500.0_f64;
        let v = 3.4;
        let shifted_log = WaveScale::LogLambda.shift(lambda.ln(), v);
        let shifted_lin = WaveScale::Linear.shift(lambda, v);
        assert!((shifted_log.exp() - shifted_lin).abs() / shifted_lin < 1e-13);
    }

    #[test]
    fn construction_flags_unusable_pixels_instead_of_failing() {
        let wavelength = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let flux = vec![1.0, f64::NAN, 1.0, -10.0, 1.0];
        let error = vec![0.1, 0.1, -1.0, 0.1, 0.1];
        let order =
            SpectralOrder::new(wavelength, flux, error, Vec::new()).expect("flagged, not fatal");

        assert!(order.flags()[0].is_clear());
        assert!(order.flags()[1].intersects(PixelFlags::NAN));
        assert!(order.flags()[2].intersects(PixelFlags::NAN));
        assert!(order.flags()[3].intersects(PixelFlags::NEG));
        assert_eq!(order.good_pixels(), vec![0, 4]);
    }

    #[test]
    fn non_monotonic_wavelength_is_rejected() {
        let result = SpectralOrder::new(
            vec![1.0, 2.0, 2.0, 3.0],
            vec![1.0; 4],
            vec![0.1; 4],
            Vec::new(),
        );
        assert_eq!(
            result,
            Err(SpectrumError::NonMonotonicWavelength { index: 1 })
        );
    }

    #[test]
    fn masked_pixels_receive_the_requested_flag() {
        let mut order = order_with_flux(vec![1.0; 6]);
        let lo = order.wavelength()[2];
        let hi = order.wavelength()[3];
        let mask = WavelengthMask::new(vec![
            (lo - 1e-7, 0.0),
            (lo, 1.0),
            (hi, 1.0),
            (hi + 1e-7, 0.0),
        ])
        .expect("valid mask");

        let flagged = order.flag_masked_pixels(&mask, PixelFlags::ATM, |w| w);
        assert_eq!(flagged, 2);
        assert!(order.flags()[2].intersects(PixelFlags::ATM));
        assert!(order.flags()[3].intersects(PixelFlags::ATM));
        assert!(order.flags()[1].is_clear());
    }
}
