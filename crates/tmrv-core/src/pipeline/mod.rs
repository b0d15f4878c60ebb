//! End-to-end run orchestration: load and screen the exposures, prepare the
//! method back end (template, line mask or drift reference), estimate every
//! order, combine per exposure and write the artifacts.
//!
//! Exposures are processed in load order; a flagged exposure keeps its row
//! in every output table (NaN values) so the time series stay aligned
//! across files.

use std::fs;
use std::path::{Path, PathBuf};

use crate::ccf::{ccf_binless, ccf_box, CcfInput, LineMask};
use crate::combine::{combine_exposure, CombineInput, Corrections, ExposureCombination};
use crate::common::config::RunConfig;
use crate::dataset::{self, DatasetError};
use crate::domain::{EstimatorMethod, PipelineResult, RvError};
use crate::fit::drift::{estimate_drift, DriftInput};
use crate::fit::grid::ChiSquareSurface;
use crate::fit::{fit_order, FitMode, FitWarning, OrderEstimate, OrderFitInput};
use crate::indices::{measure_all, IndexValue};
use crate::numerics::spline::CubicSpline;
use crate::report;
use crate::spectrum::{Exposure, PixelFlags, SpectralOrder, WaveScale, WavelengthMask};
use crate::template::coadd::{build_template, CoaddInput, PreRv};
use crate::template::{select_reference, Template, TemplateError};

/// Everything one run needs besides the configuration itself.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub config: RunConfig,
    pub data_dir: PathBuf,
    /// Glob over file names inside `data_dir`.
    pub pattern: String,
    pub output_dir: PathBuf,
    /// Restore the template from this file instead of building one.
    pub template_path: Option<PathBuf>,
    /// Store a freshly built template next to the other artifacts.
    pub store_template: bool,
    pub telluric_path: Option<PathBuf>,
    pub sky_path: Option<PathBuf>,
    /// Line list for the CCF methods.
    pub line_mask_path: Option<PathBuf>,
    /// Reference exposure id for the drift method; highest S/N when unset.
    pub drift_reference: Option<String>,
}

impl RunRequest {
    pub fn new(config: RunConfig, data_dir: PathBuf, pattern: String, output_dir: PathBuf) -> Self {
        Self {
            config,
            data_dir,
            pattern,
            output_dir,
            template_path: None,
            store_template: false,
            telluric_path: None,
            sky_path: None,
            line_mask_path: None,
            drift_reference: None,
        }
    }
}

#[derive(Debug)]
pub struct OrderRow {
    pub order: usize,
    pub estimate: Option<OrderEstimate>,
}

#[derive(Debug)]
pub struct ExposureRow {
    pub id: String,
    pub bjd: f64,
    pub berv_kms: f64,
    pub drift_mps: f64,
    pub e_drift_mps: f64,
    pub secular_mps: f64,
    pub snr: f64,
    /// Outside the S/N limits; excluded from estimation but reported.
    pub skipped: bool,
    pub orders: Vec<OrderRow>,
    pub combined: Option<ExposureCombination>,
    pub indices: Vec<(String, Option<IndexValue>)>,
}

#[derive(Debug)]
pub struct RunSummary {
    pub method: EstimatorMethod,
    /// Seed exposure of the template (least-squares method only).
    pub template_reference: Option<String>,
    pub exposures: Vec<ExposureRow>,
    pub artifacts: Vec<PathBuf>,
}

impl RunSummary {
    pub fn n_usable(&self) -> usize {
        self.exposures.iter().filter(|row| !row.skipped).count()
    }
}

/// Outcome of a template-only run.
pub struct TemplateRunSummary {
    pub reference_id: String,
    /// Exposures folded into the template.
    pub n_exposures: usize,
    pub n_orders: usize,
    /// Orders that actually carry a template.
    pub n_seeded: usize,
    pub template_path: PathBuf,
    pub artifacts: Vec<PathBuf>,
}

fn dataset_error(err: DatasetError) -> RvError {
    match &err {
        DatasetError::Pattern { .. } => RvError::input_validation("DATA_PATTERN", err.to_string()),
        DatasetError::ReadDir { .. } => RvError::io_system("DATA_DIR", err.to_string()),
        DatasetError::Empty { .. } => RvError::input_validation("DATA_EMPTY", err.to_string()),
        DatasetError::Read { .. } => RvError::io_system("DATA_READ", err.to_string()),
        DatasetError::Parse { .. } => RvError::io_system("DATA_PARSE", err.to_string()),
        DatasetError::Order { .. } => RvError::input_validation("DATA_ORDER", err.to_string()),
        DatasetError::Mask { .. } => RvError::input_validation("MASK_INVALID", err.to_string()),
        DatasetError::Lines { .. } => {
            RvError::input_validation("LINE_MASK_INVALID", err.to_string())
        }
    }
}

fn template_error(err: TemplateError) -> RvError {
    match &err {
        TemplateError::Read { .. }
        | TemplateError::Write { .. }
        | TemplateError::Parse { .. }
        | TemplateError::Encode { .. } => RvError::io_system("TEMPLATE_IO", err.to_string()),
        TemplateError::NoUsableExposure => {
            RvError::input_validation("NO_USABLE_EXPOSURE", err.to_string())
        }
        _ => RvError::computation("TEMPLATE_BUILD", err.to_string()),
    }
}

fn artifact_error(err: report::ReportError) -> RvError {
    RvError::io_system("ARTIFACT_WRITE", err.to_string())
}

fn output_dir_error(path: &Path, err: std::io::Error) -> RvError {
    RvError::io_system(
        "OUTPUT_DIR",
        format!("cannot create output directory {}: {err}", path.display()),
    )
}

/// Telluric and sky masks apply in the observer frame; flagged pixels stay
/// out of fits and are down-weighted in coadding.
fn flag_contaminated(
    exposures: &mut [Exposure],
    telluric: Option<&WavelengthMask>,
    sky: Option<&WavelengthMask>,
) -> (usize, usize) {
    let mut n_telluric = 0;
    let mut n_sky = 0;
    for exposure in exposures.iter_mut() {
        for order in exposure.orders.iter_mut() {
            if let Some(mask) = telluric {
                n_telluric += order.flag_masked_pixels(mask, PixelFlags::ATM, |w| w);
            }
            if let Some(mask) = sky {
                n_sky += order.flag_masked_pixels(mask, PixelFlags::SKY, |w| w);
            }
        }
    }
    (n_telluric, n_sky)
}

/// Copy of an order with wavelengths moved into the barycentric frame.
/// `None` when the shift breaks the monotonicity invariant.
fn barycentric_order(
    order: &SpectralOrder,
    berv_kms: f64,
    scale: WaveScale,
) -> Option<SpectralOrder> {
    if berv_kms == 0.0 {
        return Some(order.clone());
    }
    let wavelength: Vec<f64> = order
        .wavelength()
        .iter()
        .map(|&w| scale.barycentric(w, berv_kms))
        .collect();
    SpectralOrder::new(
        wavelength,
        order.flux().to_vec(),
        order.error().to_vec(),
        order.flags().to_vec(),
    )
    .ok()
}

/// Per-order template splines moved by the configured template velocity.
/// Orders whose shifted grid no longer splines drop out of the run.
fn shift_template_orders(template: &Template, v_kms: f64) -> Vec<Option<CubicSpline>> {
    let scale = template.scale();
    (0..template.n_orders())
        .map(|o| {
            template.order(o).and_then(|tpl| {
                let spline = tpl.spline();
                let x: Vec<f64> = spline.x().iter().map(|&w| scale.shift(w, v_kms)).collect();
                CubicSpline::natural(x, spline.y().to_vec()).ok()
            })
        })
        .collect()
}

fn warning_labels(warnings: &[FitWarning]) -> String {
    if warnings.is_empty() {
        "-".to_string()
    } else {
        warnings
            .iter()
            .map(|w| w.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

struct LoadedSet {
    exposures: Vec<Exposure>,
    telluric: Option<WavelengthMask>,
    sky: Option<WavelengthMask>,
}

fn load_and_screen(request: &RunRequest) -> PipelineResult<LoadedSet> {
    let mut exposures =
        dataset::load_exposures(&request.data_dir, &request.pattern).map_err(dataset_error)?;
    let telluric = request
        .telluric_path
        .as_deref()
        .map(dataset::load_wavelength_mask)
        .transpose()
        .map_err(dataset_error)?;
    let sky = request
        .sky_path
        .as_deref()
        .map(dataset::load_wavelength_mask)
        .transpose()
        .map_err(dataset_error)?;
    flag_contaminated(&mut exposures, telluric.as_ref(), sky.as_ref());
    dataset::screen_exposures(&mut exposures, &request.config.snr_limits);
    Ok(LoadedSet {
        exposures,
        telluric,
        sky,
    })
}

/// Runs the full pipeline and writes every applicable artifact under the
/// request's output directory.
pub fn run(request: &RunRequest) -> PipelineResult<RunSummary> {
    let config = &request.config;
    config.validate()?;

    let LoadedSet {
        exposures,
        telluric,
        sky,
    } = load_and_screen(request)?;

    fs::create_dir_all(&request.output_dir)
        .map_err(|err| output_dir_error(&request.output_dir, err))?;
    let mut artifacts = Vec::new();

    // Method back ends.
    let (template, pre_rvs) = match config.method {
        EstimatorMethod::LeastSquares => match &request.template_path {
            Some(path) => {
                let template = Template::restore(path).map_err(template_error)?;
                if template.scale() != config.scale {
                    return Err(RvError::input_validation(
                        "TEMPLATE_SCALE",
                        format!(
                            "template {} is on the {:?} scale, the run is configured for {:?}",
                            path.display(),
                            template.scale(),
                            config.scale
                        ),
                    ));
                }
                (Some(template), Vec::new())
            }
            None => {
                let outcome = build_template(&CoaddInput {
                    exposures: &exposures,
                    config,
                    telluric: telluric.as_ref(),
                    sky: sky.as_ref(),
                })
                .map_err(template_error)?;
                (Some(outcome.template), outcome.pre_rvs)
            }
        },
        _ => (None, Vec::new()),
    };
    let line_mask: Option<LineMask> = match config.method {
        EstimatorMethod::CcfBox | EstimatorMethod::CcfBinless => {
            let path = request.line_mask_path.as_deref().ok_or_else(|| {
                RvError::input_validation(
                    "CCF_MASK",
                    "the ccf methods need a line mask; pass one with --line-mask",
                )
            })?;
            Some(dataset::load_line_mask(path).map_err(dataset_error)?)
        }
        _ => None,
    };
    let drift_reference: Option<usize> = match config.method {
        EstimatorMethod::Drift => Some(match &request.drift_reference {
            Some(id) => exposures
                .iter()
                .position(|e| e.id == *id)
                .ok_or_else(|| {
                    RvError::input_validation(
                        "DRIFT_REFERENCE",
                        format!("no exposure with id '{id}' in the loaded set"),
                    )
                })?,
            None => select_reference(&exposures).map_err(template_error)?,
        }),
        _ => None,
    };

    if request.store_template {
        if let Some(template) = &template {
            let path = request.output_dir.join("template.json");
            template.store(&path).map_err(template_error)?;
            artifacts.push(path);
        }
    }

    let shifted: Option<Vec<Option<CubicSpline>>> = match &template {
        Some(t) if config.template_rv_kms != 0.0 => {
            Some(shift_template_orders(t, config.template_rv_kms))
        }
        _ => None,
    };

    let mut rows = Vec::with_capacity(exposures.len());
    for exposure in &exposures {
        let skipped = !exposure.is_usable();
        let n_orders = exposure.n_orders();
        let mut estimates: Vec<Option<OrderEstimate>> = (0..n_orders).map(|_| None).collect();

        if !skipped {
            match config.method {
                EstimatorMethod::Drift => {
                    // Drift compares two observer-frame spectra of the same
                    // source; no barycentric move.
                    let reference = &exposures[drift_reference.unwrap_or(0)];
                    for (o, estimate) in estimates.iter_mut().enumerate() {
                        let Some(ref_order) = reference.orders.get(o) else {
                            continue;
                        };
                        let order = &exposure.orders[o];
                        *estimate = Some(OrderEstimate::Drift(estimate_drift(&DriftInput {
                            order,
                            reference: ref_order,
                            scale: config.scale,
                            clip: config.clip,
                            window: config.pixel_window.clamp_to(order.len()),
                        })));
                    }
                }
                _ => {
                    for (o, estimate) in estimates.iter_mut().enumerate() {
                        let Some(order) =
                            barycentric_order(&exposure.orders[o], exposure.berv_kms, config.scale)
                        else {
                            continue;
                        };
                        let window = config.pixel_window.clamp_to(order.len());
                        *estimate = match config.method {
                            EstimatorMethod::LeastSquares => {
                                let spline = match &shifted {
                                    Some(list) => list.get(o).and_then(|s| s.as_ref()),
                                    None => template
                                        .as_ref()
                                        .and_then(|t| t.order(o))
                                        .map(|t| t.spline()),
                                };
                                spline.map(|tpl| {
                                    OrderEstimate::LeastSquares(fit_order(
                                        &OrderFitInput {
                                            order: &order,
                                            template: tpl,
                                            scale: config.scale,
                                            degree: config.degree,
                                            clip: config.clip,
                                            grid: config.grid,
                                            prior_kms: config.prior_rv_kms,
                                            window,
                                            keep_surface: config.keep_surfaces,
                                            line_width: true,
                                        },
                                        FitMode::GridSearch,
                                    ))
                                })
                            }
                            EstimatorMethod::CcfBox | EstimatorMethod::CcfBinless => {
                                line_mask.as_ref().map(|mask| {
                                    let input = CcfInput {
                                        order: &order,
                                        mask,
                                        scale: config.scale,
                                        grid: config.grid,
                                        clip: config.clip,
                                        prior_kms: config.prior_rv_kms,
                                        window,
                                    };
                                    if config.method == EstimatorMethod::CcfBinless {
                                        OrderEstimate::CcfBinless(ccf_binless(&input))
                                    } else {
                                        OrderEstimate::CcfBox(ccf_box(&input))
                                    }
                                })
                            }
                            EstimatorMethod::Drift => None,
                        };
                    }
                }
            }
        }

        let combined = if skipped {
            None
        } else {
            Some(combine_exposure(&CombineInput {
                estimates: &estimates,
                scale: config.scale,
                corrections: Corrections {
                    drift_mps: exposure.drift_mps,
                    e_drift_mps: exposure.e_drift_mps,
                    secular_mps: exposure.secular_mps,
                },
            }))
        };

        let indices = match &combined {
            Some(c) if !config.index_windows.is_empty() => {
                measure_all(exposure, config.scale, c.rv_mps / 1000.0, &config.index_windows)
            }
            _ => config
                .index_windows
                .iter()
                .map(|w| (w.name.clone(), None))
                .collect(),
        };

        rows.push(ExposureRow {
            id: exposure.id.clone(),
            bjd: exposure.bjd,
            berv_kms: exposure.berv_kms,
            drift_mps: exposure.drift_mps,
            e_drift_mps: exposure.e_drift_mps,
            secular_mps: exposure.secular_mps,
            snr: exposure.snr_estimate(),
            skipped,
            orders: estimates
                .into_iter()
                .enumerate()
                .map(|(order, estimate)| OrderRow { order, estimate })
                .collect(),
            combined,
            indices,
        });
    }

    write_artifacts(&request.output_dir, config, &rows, &pre_rvs, &mut artifacts)?;

    Ok(RunSummary {
        method: config.method,
        template_reference: template.as_ref().map(|t| t.reference_id().to_string()),
        exposures: rows,
        artifacts,
    })
}

/// Builds and stores the template without an RV pass.
pub fn run_template(request: &RunRequest) -> PipelineResult<TemplateRunSummary> {
    let config = &request.config;
    config.validate()?;

    let LoadedSet {
        exposures,
        telluric,
        sky,
    } = load_and_screen(request)?;

    let outcome = build_template(&CoaddInput {
        exposures: &exposures,
        config,
        telluric: telluric.as_ref(),
        sky: sky.as_ref(),
    })
    .map_err(template_error)?;

    fs::create_dir_all(&request.output_dir)
        .map_err(|err| output_dir_error(&request.output_dir, err))?;
    let template_path = request
        .template_path
        .clone()
        .unwrap_or_else(|| request.output_dir.join("template.json"));
    outcome.template.store(&template_path).map_err(template_error)?;

    let mut artifacts = vec![template_path.clone()];
    let pre_rv_rows: Vec<report::PreRvRow<'_>> = outcome
        .pre_rvs
        .iter()
        .map(|pre| report::PreRvRow {
            id: &pre.exposure_id,
            bjd: pre.bjd,
            velocity_mps: pre.velocity_kms * 1000.0,
            e_velocity_mps: pre.e_velocity_mps,
        })
        .collect();
    let path = request.output_dir.join("prerv.dat");
    report::write_text_artifact(&path, &report::pre_rv_table(&pre_rv_rows))
        .map_err(artifact_error)?;
    artifacts.push(path);

    let template = &outcome.template;
    let n_seeded = (0..template.n_orders())
        .filter(|&o| template.order(o).is_some())
        .count();
    Ok(TemplateRunSummary {
        reference_id: template.reference_id().to_string(),
        n_exposures: template.n_exposures(),
        n_orders: template.n_orders(),
        n_seeded,
        template_path,
        artifacts,
    })
}

fn write_artifacts(
    output_dir: &Path,
    config: &RunConfig,
    rows: &[ExposureRow],
    pre_rvs: &[PreRv],
    artifacts: &mut Vec<PathBuf>,
) -> PipelineResult<()> {
    let mut order_rows = Vec::new();
    for row in rows {
        for order_row in &row.orders {
            if let Some(estimate) = &order_row.estimate {
                order_rows.push(report::OrderTableRow {
                    id: &row.id,
                    bjd: row.bjd,
                    order: order_row.order,
                    method: estimate.method().as_str(),
                    velocity_mps: estimate.velocity_kms() * 1000.0,
                    e_velocity_mps: estimate.e_velocity_mps(),
                    wavelength_center: estimate.wavelength_center(),
                    rms: estimate.residual_rms(),
                    warnings: warning_labels(estimate.warnings()),
                });
            }
        }
    }
    let path = output_dir.join("rvo.dat");
    report::write_text_artifact(&path, &report::order_table(&order_rows)).map_err(artifact_error)?;
    artifacts.push(path);

    let rv_rows: Vec<report::RvRow<'_>> = rows
        .iter()
        .map(|row| {
            let c = row.combined.as_ref();
            report::RvRow {
                id: &row.id,
                bjd: row.bjd,
                rv_mps: c.map_or(f64::NAN, |c| c.rv_mps),
                e_rv_mps: c.map_or(f64::NAN, |c| c.e_rv_mps),
            }
        })
        .collect();
    let path = output_dir.join("rv.dat");
    report::write_text_artifact(&path, &report::rv_table(&rv_rows)).map_err(artifact_error)?;
    artifacts.push(path);

    let corrected_rows: Vec<report::CorrectedRow<'_>> = rows
        .iter()
        .map(|row| {
            let c = row.combined.as_ref();
            report::CorrectedRow {
                id: &row.id,
                bjd: row.bjd,
                rvc_mps: c.map_or(f64::NAN, |c| c.rvc_mps),
                e_rvc_mps: c.map_or(f64::NAN, |c| c.e_rvc_mps),
                rv_mps: c.map_or(f64::NAN, |c| c.rv_mps),
                e_rv_mps: c.map_or(f64::NAN, |c| c.e_rv_mps),
                drift_mps: row.drift_mps,
                e_drift_mps: row.e_drift_mps,
                secular_mps: row.secular_mps,
                berv_kms: row.berv_kms,
            }
        })
        .collect();
    let path = output_dir.join("rvc.dat");
    report::write_text_artifact(&path, &report::corrected_table(&corrected_rows))
        .map_err(artifact_error)?;
    artifacts.push(path);

    let diag_rows: Vec<report::DiagnosticsRow<'_>> = rows
        .iter()
        .map(|row| {
            let c = row.combined.as_ref();
            let trend = c.and_then(|c| c.trend);
            let ml = c.and_then(|c| c.ml);
            report::DiagnosticsRow {
                id: &row.id,
                bjd: row.bjd,
                crx: trend.map_or(f64::NAN, |t| t.crx),
                e_crx: trend.map_or(f64::NAN, |t| t.e_crx),
                crossing_wavelength: trend.map_or(f64::NAN, |t| t.crossing_wavelength),
                dlw: c.map_or(f64::NAN, |c| c.dlw),
                e_dlw: c.map_or(f64::NAN, |c| c.e_dlw),
                ml_rv_mps: ml.map_or(f64::NAN, |m| m.rv_mps),
                e_ml_rv_mps: ml.map_or(f64::NAN, |m| m.e_rv_mps),
                ml_crx: ml.map_or(f64::NAN, |m| m.crx),
                e_ml_crx: ml.map_or(f64::NAN, |m| m.e_crx),
            }
        })
        .collect();
    let path = output_dir.join("diagnostics.dat");
    report::write_text_artifact(&path, &report::diagnostics_table(&diag_rows))
        .map_err(artifact_error)?;
    artifacts.push(path);

    if !config.index_windows.is_empty() {
        let mut index_rows = Vec::new();
        for row in rows {
            for (name, value) in &row.indices {
                index_rows.push(report::IndexRow {
                    id: &row.id,
                    bjd: row.bjd,
                    name,
                    value: value.as_ref().map_or(f64::NAN, |v| v.value),
                    error: value.as_ref().map_or(f64::NAN, |v| v.error),
                });
            }
        }
        let path = output_dir.join("indices.dat");
        report::write_text_artifact(&path, &report::index_table(&index_rows))
            .map_err(artifact_error)?;
        artifacts.push(path);
    }

    if config.keep_surfaces {
        let collected: Vec<(String, Vec<Option<ChiSquareSurface>>)> = rows
            .iter()
            .map(|row| {
                (
                    row.id.clone(),
                    row.orders
                        .iter()
                        .map(|o| o.estimate.as_ref().and_then(|e| e.surface()).cloned())
                        .collect(),
                )
            })
            .collect();
        let dumps: Vec<report::SurfaceDump<'_>> = collected
            .iter()
            .map(|(id, surfaces)| report::SurfaceDump { id, surfaces })
            .collect();
        let path = output_dir.join("surfaces.json");
        report::write_surfaces(&path, &dumps).map_err(artifact_error)?;
        artifacts.push(path);
    }

    if !pre_rvs.is_empty() {
        let pre_rv_rows: Vec<report::PreRvRow<'_>> = pre_rvs
            .iter()
            .map(|pre| report::PreRvRow {
                id: &pre.exposure_id,
                bjd: pre.bjd,
                velocity_mps: pre.velocity_kms * 1000.0,
                e_velocity_mps: pre.e_velocity_mps,
            })
            .collect();
        let path = output_dir.join("prerv.dat");
        report::write_text_artifact(&path, &report::pre_rv_table(&pre_rv_rows))
            .map_err(artifact_error)?;
        artifacts.push(path);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RvErrorCategory;

    #[test]
    fn dataset_errors_map_to_stable_categories() {
        let err = dataset_error(DatasetError::Empty {
            path: PathBuf::from("/tmp/none"),
            pattern: "*.json".into(),
        });
        assert_eq!(err.category(), RvErrorCategory::InputValidation);
        assert_eq!(err.code(), "DATA_EMPTY");

        let err = dataset_error(DatasetError::Read {
            path: PathBuf::from("/tmp/x.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        });
        assert_eq!(err.category(), RvErrorCategory::IoSystem);
        assert_eq!(err.code(), "DATA_READ");
    }

    #[test]
    fn template_errors_split_io_from_computation() {
        let err = template_error(TemplateError::NoUsableExposure);
        assert_eq!(err.category(), RvErrorCategory::InputValidation);

        let err = template_error(TemplateError::Read {
            path: PathBuf::from("/tmp/tpl.json"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        });
        assert_eq!(err.category(), RvErrorCategory::IoSystem);
        assert_eq!(err.code(), "TEMPLATE_IO");
    }

    #[test]
    fn barycentric_copy_shifts_every_wavelength() {
        let wavelength: Vec<f64> = (0..6).map(|i| 5000.0 + i as f64 * 0.1).collect();
        let order = SpectralOrder::new(
            wavelength.clone(),
            vec![1.0; 6],
            vec![0.1; 6],
            Vec::new(),
        )
        .expect("valid order");
        let shifted = barycentric_order(&order, 2.5, WaveScale::Linear).expect("monotone shift");
        for (w, s) in wavelength.iter().zip(shifted.wavelength()) {
            assert!((s - WaveScale::Linear.barycentric(*w, 2.5)).abs() < 1e-12);
        }
        // Zero shift is a plain copy.
        let copy = barycentric_order(&order, 0.0, WaveScale::Linear).expect("copy");
        assert_eq!(copy.wavelength(), order.wavelength());
    }

    #[test]
    fn warning_labels_join_kebab_names() {
        assert_eq!(warning_labels(&[]), "-");
        assert_eq!(
            warning_labels(&[FitWarning::EdgeMinimum, FitWarning::DegradedFit]),
            "edge-minimum,degraded-fit"
        );
    }
}
