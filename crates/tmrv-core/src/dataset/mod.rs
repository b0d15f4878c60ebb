//! Loading of exposures and masks from disk.
//!
//! Exposures arrive as one JSON document per file: identification, frame
//! corrections, and the per-order arrays. Files are selected by a glob over
//! file names inside one directory and loaded in name order so a run is
//! deterministic regardless of directory enumeration.

use std::fs;
use std::path::{Path, PathBuf};

use globset::Glob;
use serde::Deserialize;

use crate::ccf::{CcfMaskError, LineMask, MaskLine};
use crate::common::config::SnrLimits;
use crate::spectrum::mask::{MaskError, WavelengthMask};
use crate::spectrum::{Exposure, ExposureFlags, PixelFlags, SpectralOrder, SpectrumError};

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("invalid file pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        source: globset::Error,
    },
    #[error("cannot list data directory {}: {source}", path.display())]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no exposure file in {} matches `{pattern}`", path.display())]
    Empty { path: PathBuf, pattern: String },
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{}, order {order}: {source}", path.display())]
    Order {
        path: PathBuf,
        order: usize,
        source: SpectrumError,
    },
    #[error("mask {}: {source}", path.display())]
    Mask { path: PathBuf, source: MaskError },
    #[error("line mask {}: {source}", path.display())]
    Lines { path: PathBuf, source: CcfMaskError },
}

/// On-disk form of one order.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OrderRecord {
    wavelength: Vec<f64>,
    flux: Vec<f64>,
    error: Vec<f64>,
    #[serde(default)]
    flags: Vec<PixelFlags>,
}

/// On-disk form of one exposure.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExposureRecord {
    id: String,
    bjd: f64,
    #[serde(default)]
    berv_kms: f64,
    #[serde(default)]
    drift_mps: f64,
    #[serde(default)]
    e_drift_mps: f64,
    #[serde(default)]
    secular_mps: f64,
    orders: Vec<OrderRecord>,
}

impl ExposureRecord {
    fn into_exposure(self, path: &Path) -> Result<Exposure, DatasetError> {
        let mut orders = Vec::with_capacity(self.orders.len());
        for (index, record) in self.orders.into_iter().enumerate() {
            let order =
                SpectralOrder::new(record.wavelength, record.flux, record.error, record.flags)
                    .map_err(|source| DatasetError::Order {
                        path: path.to_path_buf(),
                        order: index,
                        source,
                    })?;
            orders.push(order);
        }
        Ok(Exposure {
            id: self.id,
            bjd: self.bjd,
            berv_kms: self.berv_kms,
            drift_mps: self.drift_mps,
            e_drift_mps: self.e_drift_mps,
            secular_mps: self.secular_mps,
            flags: ExposureFlags::OK,
            orders,
        })
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, DatasetError> {
    let text = fs::read_to_string(path).map_err(|source| DatasetError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| DatasetError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads every exposure whose file name matches `pattern`, sorted by name.
pub fn load_exposures(dir: &Path, pattern: &str) -> Result<Vec<Exposure>, DatasetError> {
    let matcher = Glob::new(pattern)
        .map_err(|source| DatasetError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?
        .compile_matcher();

    let entries = fs::read_dir(dir).map_err(|source| DatasetError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| DatasetError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let matches = path
            .file_name()
            .map(|name| matcher.is_match(Path::new(name)))
            .unwrap_or(false);
        if matches && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    if paths.is_empty() {
        return Err(DatasetError::Empty {
            path: dir.to_path_buf(),
            pattern: pattern.to_string(),
        });
    }

    let mut exposures = Vec::with_capacity(paths.len());
    for path in &paths {
        let record: ExposureRecord = read_json(path)?;
        exposures.push(record.into_exposure(path)?);
    }
    Ok(exposures)
}

/// Flags exposures outside the S/N limits; returns how many were flagged.
/// Flagged exposures are kept in the set so they still appear in reports.
pub fn screen_exposures(exposures: &mut [Exposure], limits: &SnrLimits) -> usize {
    let mut flagged = 0;
    for exposure in exposures.iter_mut() {
        let snr = exposure.snr_estimate();
        if !snr.is_finite() || snr < limits.min {
            exposure.flags.insert(ExposureFlags::LOW_SN);
            flagged += 1;
        } else if snr > limits.max {
            exposure.flags.insert(ExposureFlags::HIGH_SN);
            flagged += 1;
        }
    }
    flagged
}

/// Loads a telluric or sky mask stored as `[[wavelength, value], ...]`.
pub fn load_wavelength_mask(path: &Path) -> Result<WavelengthMask, DatasetError> {
    let points: Vec<(f64, f64)> = read_json(path)?;
    WavelengthMask::new(points).map_err(|source| DatasetError::Mask {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads a CCF line mask stored as `[{"begin": .., "end": .., "weight": ..}, ...]`.
pub fn load_line_mask(path: &Path) -> Result<LineMask, DatasetError> {
    let lines: Vec<MaskLine> = read_json(path)?;
    LineMask::new(lines).map_err(|source| DatasetError::Lines {
        path: path.to_path_buf(),
        source,
    })
}
