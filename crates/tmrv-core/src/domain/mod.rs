pub mod errors;

pub use errors::{PipelineResult, RvError, RvErrorCategory, RvResult};

use std::fmt::{Display, Formatter};

/// Velocity-measurement back end for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EstimatorMethod {
    /// Template least squares over a velocity grid.
    #[default]
    LeastSquares,
    /// Binary-mask cross correlation, box windows.
    CcfBox,
    /// Binary-mask cross correlation, binless folding.
    CcfBinless,
    /// Linearized drift fit against a contemporaneous reference.
    Drift,
}

impl EstimatorMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LeastSquares => "least-squares",
            Self::CcfBox => "ccf-box",
            Self::CcfBinless => "ccf-binless",
            Self::Drift => "drift",
        }
    }
}

impl Display for EstimatorMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

/// Template coaddition policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoaddPolicy {
    /// One-pass running accumulation while exposures stream through.
    Flying,
    /// Buffer all exposures, combine once, Savitzky-Golay smoothing.
    Post,
    /// Recognized but rejected: its weighting scheme is unresolved.
    Post2,
    /// Buffered B-spline coadd with local-noise clipping.
    #[default]
    Post3,
}

impl CoaddPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Flying => "flying",
            Self::Post => "post",
            Self::Post2 => "post2",
            Self::Post3 => "post3",
        }
    }
}

impl Display for CoaddPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}
