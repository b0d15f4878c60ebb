//! Output tables and JSON artifacts.
//!
//! Every table renders to a string first and goes to disk through one
//! normalizing writer, so repeated runs over the same inputs produce
//! byte-identical artifacts. Columns are fixed width with a `#`-prefixed
//! header line; non-finite values print as `nan`/`inf` so the tables stay
//! machine-readable.

use std::fs;
use std::path::Path;

use crate::fit::grid::ChiSquareSurface;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("cannot write artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot encode artifact: {0}")]
    Json(#[from] serde_json::Error),
}

/// Right-aligned fixed-width cell; non-finite values render lowercase.
pub fn format_cell(value: f64, width: usize, precision: usize) -> String {
    if value.is_finite() {
        format!("{value:>width$.precision$}")
    } else if value.is_nan() {
        format!("{:>width$}", "nan")
    } else if value > 0.0 {
        format!("{:>width$}", "inf")
    } else {
        format!("{:>width$}", "-inf")
    }
}

pub fn normalize_text_artifact(content: &str) -> String {
    let mut normalized = content.replace("\r\n", "\n").replace('\r', "\n");
    if !normalized.is_empty() && !normalized.ends_with('\n') {
        normalized.push('\n');
    }
    normalized
}

pub fn write_text_artifact(path: &Path, content: &str) -> Result<(), ReportError> {
    fs::write(path, normalize_text_artifact(content))?;
    Ok(())
}

/// One line of the per-order velocity table.
pub struct OrderTableRow<'a> {
    pub id: &'a str,
    pub bjd: f64,
    pub order: usize,
    pub method: &'static str,
    pub velocity_mps: f64,
    pub e_velocity_mps: f64,
    pub wavelength_center: f64,
    pub rms: f64,
    /// Comma-joined warning labels, `-` when clean.
    pub warnings: String,
}

pub fn order_table(rows: &[OrderTableRow<'_>]) -> String {
    let mut out = String::from(
        "# per-order velocities\n# id           bjd            order  method          v[m/s]     e_v[m/s]  wcen          rms        warnings\n",
    );
    for row in rows {
        out.push_str(&format!(
            "{:<14}{} {:>6}  {:<14}{}{}{}{}  {}\n",
            row.id,
            format_cell(row.bjd, 14, 6),
            row.order,
            row.method,
            format_cell(row.velocity_mps, 12, 3),
            format_cell(row.e_velocity_mps, 11, 3),
            format_cell(row.wavelength_center, 14, 4),
            format_cell(row.rms, 11, 4),
            row.warnings,
        ));
    }
    out
}

/// One line of the combined RV series.
pub struct RvRow<'a> {
    pub id: &'a str,
    pub bjd: f64,
    pub rv_mps: f64,
    pub e_rv_mps: f64,
}

pub fn rv_table(rows: &[RvRow<'_>]) -> String {
    let mut out = String::from("# combined radial velocities\n# id           bjd            rv[m/s]     e_rv[m/s]\n");
    for row in rows {
        out.push_str(&format!(
            "{:<14}{}{}{}\n",
            row.id,
            format_cell(row.bjd, 14, 6),
            format_cell(row.rv_mps, 12, 3),
            format_cell(row.e_rv_mps, 13, 3),
        ));
    }
    out
}

/// One line of the drift/secular corrected series.
pub struct CorrectedRow<'a> {
    pub id: &'a str,
    pub bjd: f64,
    pub rvc_mps: f64,
    pub e_rvc_mps: f64,
    pub rv_mps: f64,
    pub e_rv_mps: f64,
    pub drift_mps: f64,
    pub e_drift_mps: f64,
    pub secular_mps: f64,
    pub berv_kms: f64,
}

pub fn corrected_table(rows: &[CorrectedRow<'_>]) -> String {
    let mut out = String::from(
        "# corrected radial velocities\n# id           bjd            rvc[m/s]    e_rvc[m/s]  rv[m/s]     e_rv[m/s]  drift      e_drift    secular    berv[km/s]\n",
    );
    for row in rows {
        out.push_str(&format!(
            "{:<14}{}{}{}{}{}{}{}{}{}\n",
            row.id,
            format_cell(row.bjd, 14, 6),
            format_cell(row.rvc_mps, 12, 3),
            format_cell(row.e_rvc_mps, 12, 3),
            format_cell(row.rv_mps, 12, 3),
            format_cell(row.e_rv_mps, 11, 3),
            format_cell(row.drift_mps, 11, 3),
            format_cell(row.e_drift_mps, 11, 3),
            format_cell(row.secular_mps, 11, 3),
            format_cell(row.berv_kms, 12, 4),
        ));
    }
    out
}

/// One line of the chromatic/width diagnostics table.
pub struct DiagnosticsRow<'a> {
    pub id: &'a str,
    pub bjd: f64,
    pub crx: f64,
    pub e_crx: f64,
    pub crossing_wavelength: f64,
    pub dlw: f64,
    pub e_dlw: f64,
    pub ml_rv_mps: f64,
    pub e_ml_rv_mps: f64,
    pub ml_crx: f64,
    pub e_ml_crx: f64,
}

pub fn diagnostics_table(rows: &[DiagnosticsRow<'_>]) -> String {
    let mut out = String::from(
        "# chromatic index, line width and maximum-likelihood series\n# id           bjd            crx        e_crx      l_v           dlw        e_dlw      mlrv[m/s]   e_mlrv     mlcrx      e_mlcrx\n",
    );
    for row in rows {
        out.push_str(&format!(
            "{:<14}{}{}{}{}{}{}{}{}{}{}\n",
            row.id,
            format_cell(row.bjd, 14, 6),
            format_cell(row.crx, 11, 3),
            format_cell(row.e_crx, 11, 3),
            format_cell(row.crossing_wavelength, 14, 4),
            format_cell(row.dlw, 11, 3),
            format_cell(row.e_dlw, 11, 3),
            format_cell(row.ml_rv_mps, 12, 3),
            format_cell(row.e_ml_rv_mps, 11, 3),
            format_cell(row.ml_crx, 11, 3),
            format_cell(row.e_ml_crx, 11, 3),
        ));
    }
    out
}

/// One measured index line, long format.
pub struct IndexRow<'a> {
    pub id: &'a str,
    pub bjd: f64,
    pub name: &'a str,
    pub value: f64,
    pub error: f64,
}

pub fn index_table(rows: &[IndexRow<'_>]) -> String {
    let mut out =
        String::from("# line activity indices\n# id           bjd            index           value      error\n");
    for row in rows {
        out.push_str(&format!(
            "{:<14}{} {:<15}{}{}\n",
            row.id,
            format_cell(row.bjd, 14, 6),
            row.name,
            format_cell(row.value, 10, 5),
            format_cell(row.error, 11, 5),
        ));
    }
    out
}

/// One template pre-RV line.
pub struct PreRvRow<'a> {
    pub id: &'a str,
    pub bjd: f64,
    pub velocity_mps: f64,
    pub e_velocity_mps: f64,
}

pub fn pre_rv_table(rows: &[PreRvRow<'_>]) -> String {
    let mut out = String::from(
        "# template-pass velocities\n# id           bjd            v[m/s]      e_v[m/s]\n",
    );
    for row in rows {
        out.push_str(&format!(
            "{:<14}{}{}{}\n",
            row.id,
            format_cell(row.bjd, 14, 6),
            format_cell(row.velocity_mps, 12, 3),
            format_cell(row.e_velocity_mps, 12, 3),
        ));
    }
    out
}

/// Per-exposure chi-square surfaces, serialized for offline inspection.
#[derive(serde::Serialize)]
pub struct SurfaceDump<'a> {
    pub id: &'a str,
    /// One entry per order; `None` where no surface was kept.
    pub surfaces: &'a [Option<ChiSquareSurface>],
}

pub fn write_surfaces(path: &Path, dumps: &[SurfaceDump<'_>]) -> Result<(), ReportError> {
    let encoded = serde_json::to_string_pretty(dumps)?;
    write_text_artifact(path, &encoded)
}
