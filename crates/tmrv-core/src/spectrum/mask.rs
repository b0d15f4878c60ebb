//! Telluric and sky-emission masks as continuous wavelength polylines.

use crate::common::constants::MASK_THRESHOLD;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MaskError {
    #[error("mask needs at least 2 points, got {len}")]
    TooFewPoints { len: usize },
    #[error("mask wavelengths must be finite and non-decreasing, violated at point {index}")]
    UnsortedWavelength { index: usize },
    #[error("mask value at point {index} is not finite")]
    NonFiniteValue { index: usize },
}

/// Piecewise-linear 0/1-valued mask over wavelength. A wavelength counts as
/// masked when the interpolated value exceeds the fixed threshold; outside
/// the tabulated range the mask is open (value 0).
#[derive(Debug, Clone, PartialEq)]
pub struct WavelengthMask {
    points: Vec<(f64, f64)>,
}

impl WavelengthMask {
    pub fn new(points: Vec<(f64, f64)>) -> Result<Self, MaskError> {
        if points.len() < 2 {
            return Err(MaskError::TooFewPoints { len: points.len() });
        }
        for (index, pair) in points.windows(2).enumerate() {
            if !pair[0].0.is_finite() || pair[1].0 < pair[0].0 {
                return Err(MaskError::UnsortedWavelength { index: index + 1 });
            }
        }
        if !points[points.len() - 1].0.is_finite() {
            return Err(MaskError::UnsortedWavelength {
                index: points.len() - 1,
            });
        }
        if let Some(index) = points.iter().position(|&(_, v)| !v.is_finite()) {
            return Err(MaskError::NonFiniteValue { index });
        }
        Ok(Self { points })
    }

    /// Interpolated mask value; 0 outside the tabulated range.
    pub fn value(&self, w: f64) -> f64 {
        let n = self.points.len();
        if w < self.points[0].0 || w > self.points[n - 1].0 {
            return 0.0;
        }
        let hi = self
            .points
            .partition_point(|&(x, _)| x < w)
            .clamp(1, n - 1);
        let (x0, y0) = self.points[hi - 1];
        let (x1, y1) = self.points[hi];
        if x1 == x0 {
            return y0.max(y1);
        }
        let t = (w - x0) / (x1 - x0);
        y0 + t * (y1 - y0)
    }

    pub fn is_masked(&self, w: f64) -> bool {
        self.value(w) > MASK_THRESHOLD
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }
}
