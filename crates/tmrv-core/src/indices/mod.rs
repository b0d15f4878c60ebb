//! Line activity indices measured in configured wavelength windows.
//!
//! An index is the mean flux inside a line band divided by the mean of two
//! reference bands, all taken in the stellar rest frame. Band edges are
//! linear wavelengths; observed pixels are corrected for the barycentric
//! motion and the measured velocity before band membership is decided.

use serde::Serialize;

use crate::common::config::IndexWindow;
use crate::spectrum::{Exposure, WaveScale};

/// One measured index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexValue {
    pub name: String,
    /// line / (0.5 * (reference_low + reference_high)).
    pub value: f64,
    pub error: f64,
    pub line_flux: f64,
    pub reference_flux: (f64, f64),
    /// Clear pixels counted per band (line, low, high).
    pub n_pixels: (usize, usize, usize),
}

struct BandSum {
    flux: f64,
    var: f64,
    n: usize,
}

impl BandSum {
    fn new() -> Self {
        Self {
            flux: 0.0,
            var: 0.0,
            n: 0,
        }
    }

    fn push(&mut self, flux: f64, error: f64) {
        self.flux += flux;
        self.var += error * error;
        self.n += 1;
    }

    /// Mean flux and its error.
    fn mean(&self) -> Option<(f64, f64)> {
        if self.n == 0 {
            return None;
        }
        let n = self.n as f64;
        Some((self.flux / n, self.var.sqrt() / n))
    }
}

fn in_band(w: f64, band: (f64, f64)) -> bool {
    w >= band.0 && w <= band.1
}

/// Measures one window over the whole exposure. `rv_kms` is the velocity
/// used to place pixels in the rest frame, normally the combined RV of the
/// exposure. Returns `None` when any band collects no clear pixel or the
/// reference level is not positive.
pub fn measure_index(
    exposure: &Exposure,
    scale: WaveScale,
    rv_kms: f64,
    window: &IndexWindow,
) -> Option<IndexValue> {
    if !rv_kms.is_finite() {
        return None;
    }
    let mut line = BandSum::new();
    let mut low = BandSum::new();
    let mut high = BandSum::new();

    for order in &exposure.orders {
        let wavelength = order.wavelength();
        let flux = order.flux();
        let error = order.error();
        for i in order.good_pixels() {
            if !flux[i].is_finite() || !(error[i] > 0.0) {
                continue;
            }
            let rest = scale.to_rest_frame(
                scale.barycentric(wavelength[i], exposure.berv_kms),
                rv_kms,
            );
            let rest_linear = match scale {
                WaveScale::LogLambda => rest.exp(),
                WaveScale::Linear => rest,
            };
            if in_band(rest_linear, window.line) {
                line.push(flux[i], error[i]);
            } else if in_band(rest_linear, window.reference_low) {
                low.push(flux[i], error[i]);
            } else if in_band(rest_linear, window.reference_high) {
                high.push(flux[i], error[i]);
            }
        }
    }

    let (line_flux, e_line) = line.mean()?;
    let (low_flux, e_low) = low.mean()?;
    let (high_flux, e_high) = high.mean()?;
    let reference = 0.5 * (low_flux + high_flux);
    if !(reference > 0.0) || !reference.is_finite() {
        return None;
    }

    let value = line_flux / reference;
    let d_ref = 0.5 * value / reference;
    let error = ((e_line / reference).powi(2)
        + d_ref * d_ref * (e_low * e_low + e_high * e_high))
        .sqrt();

    Some(IndexValue {
        name: window.name.clone(),
        value,
        error,
        line_flux,
        reference_flux: (low_flux, high_flux),
        n_pixels: (line.n, low.n, high.n),
    })
}

/// Measures every configured window; windows that collect no data map to
/// `None` so callers can report them as missing rather than drop them.
pub fn measure_all(
    exposure: &Exposure,
    scale: WaveScale,
    rv_kms: f64,
    windows: &[IndexWindow],
) -> Vec<(String, Option<IndexValue>)> {
    windows
        .iter()
        .map(|w| (w.name.clone(), measure_index(exposure, scale, rv_kms, w)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::{ExposureFlags, PixelFlags, SpectralOrder};

    fn flat_order(w_lo: f64, w_hi: f64, n: usize, flux: f64, error: f64) -> SpectralOrder {
        let step = (w_hi - w_lo) / (n - 1) as f64;
        let wavelength: Vec<f64> = (0..n).map(|i| w_lo + i as f64 * step).collect();
        SpectralOrder::new(
            wavelength,
            vec![flux; n],
            vec![error; n],
            Vec::new(),
        )
        .expect("valid synthetic order")
    }

    fn exposure(orders: Vec<SpectralOrder>) -> Exposure {
        Exposure {
            id: "exp-1".into(),
            bjd: 2_457_000.5,
            berv_kms: 0.0,
            drift_mps: 0.0,
            e_drift_mps: 0.0,
            secular_mps: 0.0,
            flags: ExposureFlags::OK,
            orders,
        }
    }

    fn halpha_like() -> IndexWindow {
        IndexWindow {
            name: "halpha".into(),
            line: (6560.0, 6566.0),
            reference_low: (6545.0, 6552.0),
            reference_high: (6575.0, 6582.0),
        }
    }

    #[test]
    fn flat_spectrum_has_unit_index() {
        let exp = exposure(vec![flat_order(6540.0, 6590.0, 501, 100.0, 2.0)]);
        let index = measure_index(&exp, WaveScale::Linear, 0.0, &halpha_like())
            .expect("all bands populated");
        assert!((index.value - 1.0).abs() < 1e-12);
        assert!(index.error > 0.0 && index.error < 0.1);
        assert!(index.n_pixels.0 > 0 && index.n_pixels.1 > 0 && index.n_pixels.2 > 0);
    }

    #[test]
    fn depressed_line_band_lowers_the_index() {
        let mut order = flat_order(6540.0, 6590.0, 501, 100.0, 2.0);
        // Halve the flux inside the line band.
        let wavelengths = order.wavelength().to_vec();
        let flux = order.flux().to_vec();
        let new_flux: Vec<f64> = wavelengths
            .iter()
            .zip(&flux)
            .map(|(&w, &f)| if (6560.0..=6566.0).contains(&w) { f / 2.0 } else { f })
            .collect();
        order = SpectralOrder::new(wavelengths, new_flux, order.error().to_vec(), Vec::new())
            .expect("valid synthetic order");
        let exp = exposure(vec![order]);
        let index = measure_index(&exp, WaveScale::Linear, 0.0, &halpha_like())
            .expect("all bands populated");
        assert!((index.value - 0.5).abs() < 1e-12, "value {}", index.value);
    }

    #[test]
    fn velocity_shift_moves_band_membership() {
        // A narrow order covering only the line band once de-shifted.
        let exp = exposure(vec![flat_order(6540.0, 6590.0, 501, 100.0, 2.0)]);
        // 3000 km/s pushes the whole order out of every band (~66 A).
        assert!(measure_index(&exp, WaveScale::Linear, 3000.0, &halpha_like()).is_none());
    }

    #[test]
    fn flagged_pixels_stay_out_of_band_sums() {
        let mut order = flat_order(6540.0, 6590.0, 501, 100.0, 2.0);
        let reference = {
            let exp = exposure(vec![order.clone()]);
            measure_index(&exp, WaveScale::Linear, 0.0, &halpha_like())
                .expect("all bands populated")
        };
        // Flag every pixel of the line band.
        let wavelengths = order.wavelength().to_vec();
        for (i, &w) in wavelengths.iter().enumerate() {
            if (6560.0..=6566.0).contains(&w) {
                order.flags_mut()[i].insert(PixelFlags::ATM);
            }
        }
        let exp = exposure(vec![order]);
        assert!(measure_index(&exp, WaveScale::Linear, 0.0, &halpha_like()).is_none());
        assert!(reference.n_pixels.0 > 0);
    }

    #[test]
    fn log_scale_matches_linear_bands() {
        let n = 501;
        let w_lo: f64 = 6540.0;
        let w_hi: f64 = 6590.0;
        let step = (w_hi - w_lo) / (n - 1) as f64;
        let linear: Vec<f64> = (0..n).map(|i| w_lo + i as f64 * step).collect();
        let log: Vec<f64> = linear.iter().map(|w| w.ln()).collect();
        let lin_exp = exposure(vec![SpectralOrder::new(
            linear,
            vec![100.0; n],
            vec![2.0; n],
            Vec::new(),
        )
        .expect("valid synthetic order")]);
        let log_exp = exposure(vec![SpectralOrder::new(
            log,
            vec![100.0; n],
            vec![2.0; n],
            Vec::new(),
        )
        .expect("valid synthetic order")]);
        let a = measure_index(&lin_exp, WaveScale::Linear, 0.0, &halpha_like())
            .expect("bands populated");
        let b = measure_index(&log_exp, WaveScale::LogLambda, 0.0, &halpha_like())
            .expect("bands populated");
        assert_eq!(a.n_pixels, b.n_pixels);
        assert!((a.value - b.value).abs() < 1e-12);
    }

    #[test]
    fn non_finite_velocity_is_rejected() {
        let exp = exposure(vec![flat_order(6540.0, 6590.0, 501, 100.0, 2.0)]);
        assert!(measure_index(&exp, WaveScale::Linear, f64::NAN, &halpha_like()).is_none());
    }
}
