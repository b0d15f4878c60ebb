use super::CliError;
use tmrv_core::common::config::{ConfigError, RunConfig};
use tmrv_core::domain::{EstimatorMethod, RvError};
use tmrv_core::pipeline::{self, RunRequest, RunSummary};
use std::path::{Path, PathBuf};

#[derive(clap::Args)]
pub(super) struct InputArgs {
    /// Run configuration JSON; engine defaults when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding the extracted exposures
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Glob over file names inside the data directory
    #[arg(long, default_value = "*.json")]
    pattern: String,

    /// Artifact output directory
    #[arg(long, default_value = "tmrv-out")]
    output_dir: PathBuf,

    /// Telluric absorption mask JSON
    #[arg(long)]
    telluric: Option<PathBuf>,

    /// Sky emission mask JSON
    #[arg(long)]
    sky: Option<PathBuf>,
}

#[derive(clap::Args)]
pub(super) struct RvArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Restore the template from this file instead of coadding one
    #[arg(long)]
    template: Option<PathBuf>,

    /// Store the freshly built template next to the other artifacts
    #[arg(long)]
    store_template: bool,
}

#[derive(clap::Args)]
pub(super) struct TemplateArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Write the template here instead of <output-dir>/template.json
    #[arg(long)]
    template: Option<PathBuf>,
}

#[derive(clap::Args)]
pub(super) struct CcfArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Line list the binary mask is built from
    #[arg(long)]
    line_mask: Option<PathBuf>,

    /// Fold the mask lines directly instead of box binning
    #[arg(long)]
    binless: bool,
}

#[derive(clap::Args)]
pub(super) struct DriftArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Reference exposure id; highest S/N exposure when omitted
    #[arg(long)]
    reference: Option<String>,
}

#[derive(clap::Args)]
pub(super) struct IndicesArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Restore the template from this file instead of coadding one
    #[arg(long)]
    template: Option<PathBuf>,
}

fn load_config(path: Option<&Path>) -> Result<RunConfig, CliError> {
    match path {
        Some(path) => RunConfig::from_json_file(path).map_err(|err| {
            CliError::Compute(match &err {
                ConfigError::Read { .. } => RvError::io_system("CONFIG_READ", err.to_string()),
                ConfigError::Parse { .. } => {
                    RvError::input_validation("CONFIG_PARSE", err.to_string())
                }
            })
        }),
        None => Ok(RunConfig::default()),
    }
}

impl InputArgs {
    fn into_request(self, method: EstimatorMethod) -> Result<RunRequest, CliError> {
        let mut config = load_config(self.config.as_deref())?;
        // The subcommand decides the method; the file sets everything else.
        config.method = method;
        let mut request = RunRequest::new(config, self.data_dir, self.pattern, self.output_dir);
        request.telluric_path = self.telluric;
        request.sky_path = self.sky;
        Ok(request)
    }
}

impl RvArgs {
    fn into_request(self) -> Result<RunRequest, CliError> {
        let mut request = self.input.into_request(EstimatorMethod::LeastSquares)?;
        request.template_path = self.template;
        request.store_template = self.store_template;
        Ok(request)
    }
}

impl TemplateArgs {
    fn into_request(self) -> Result<RunRequest, CliError> {
        let mut request = self.input.into_request(EstimatorMethod::LeastSquares)?;
        request.template_path = self.template;
        Ok(request)
    }
}

impl CcfArgs {
    fn into_request(self) -> Result<RunRequest, CliError> {
        let method = if self.binless {
            EstimatorMethod::CcfBinless
        } else {
            EstimatorMethod::CcfBox
        };
        let mut request = self.input.into_request(method)?;
        request.line_mask_path = self.line_mask;
        Ok(request)
    }
}

impl DriftArgs {
    fn into_request(self) -> Result<RunRequest, CliError> {
        let mut request = self.input.into_request(EstimatorMethod::Drift)?;
        request.drift_reference = self.reference;
        Ok(request)
    }
}

impl IndicesArgs {
    fn into_request(self) -> Result<RunRequest, CliError> {
        let mut request = self.input.into_request(EstimatorMethod::LeastSquares)?;
        request.template_path = self.template;
        if request.config.index_windows.is_empty() {
            return Err(CliError::Compute(RvError::input_validation(
                "INDEX_WINDOWS",
                "no index windows configured; add index_windows to the configuration file",
            )));
        }
        Ok(request)
    }
}

pub(super) fn run_rv_command(args: RvArgs) -> Result<i32, CliError> {
    let request = args.into_request()?;
    tracing::info!(
        "measuring least-squares velocities over '{}' in {}",
        request.pattern,
        request.data_dir.display()
    );
    let summary = pipeline::run(&request).map_err(CliError::Compute)?;
    print_run_summary(&summary);
    Ok(0)
}

pub(super) fn run_template_command(args: TemplateArgs) -> Result<i32, CliError> {
    let request = args.into_request()?;
    tracing::info!(
        "coadding a template over '{}' in {}",
        request.pattern,
        request.data_dir.display()
    );
    let summary = pipeline::run_template(&request).map_err(CliError::Compute)?;
    println!(
        "Template coadded from {} exposures, seeded from '{}' ({}/{} orders).",
        summary.n_exposures, summary.reference_id, summary.n_seeded, summary.n_orders
    );
    println!("Template: {}", summary.template_path.display());
    Ok(0)
}

pub(super) fn run_ccf_command(args: CcfArgs) -> Result<i32, CliError> {
    let request = args.into_request()?;
    tracing::info!(
        "cross correlating '{}' in {}",
        request.pattern,
        request.data_dir.display()
    );
    let summary = pipeline::run(&request).map_err(CliError::Compute)?;
    print_run_summary(&summary);
    Ok(0)
}

pub(super) fn run_drift_command(args: DriftArgs) -> Result<i32, CliError> {
    let request = args.into_request()?;
    tracing::info!(
        "measuring drifts over '{}' in {}",
        request.pattern,
        request.data_dir.display()
    );
    let summary = pipeline::run(&request).map_err(CliError::Compute)?;
    print_run_summary(&summary);
    Ok(0)
}

pub(super) fn run_indices_command(args: IndicesArgs) -> Result<i32, CliError> {
    let request = args.into_request()?;
    let summary = pipeline::run(&request).map_err(CliError::Compute)?;
    print_index_summary(&summary);
    Ok(0)
}

fn print_run_summary(summary: &RunSummary) {
    println!(
        "{} run over {} exposures ({} usable).",
        summary.method,
        summary.exposures.len(),
        summary.n_usable()
    );
    if let Some(reference) = &summary.template_reference {
        println!("Template seeded from '{}'.", reference);
    }
    for row in &summary.exposures {
        match &row.combined {
            Some(combined) => println!(
                "  {}  BJD {:.5}  RV {:+10.2} +/- {:.2} m/s",
                row.id, row.bjd, combined.rv_mps, combined.e_rv_mps
            ),
            None => println!(
                "  {}  BJD {:.5}  skipped (S/N {:.0})",
                row.id, row.bjd, row.snr
            ),
        }
    }
    println!("Artifacts:");
    for path in &summary.artifacts {
        println!("  {}", path.display());
    }
}

fn print_index_summary(summary: &RunSummary) {
    println!(
        "Indices over {} exposures ({} usable).",
        summary.exposures.len(),
        summary.n_usable()
    );
    for row in &summary.exposures {
        for (name, value) in &row.indices {
            match value {
                Some(index) => println!(
                    "  {}  {:<10}  {:.6} +/- {:.6}",
                    row.id, name, index.value, index.error
                ),
                None => println!("  {}  {:<10}  not measurable", row.id, name),
            }
        }
    }
    println!("Artifacts:");
    for path in &summary.artifacts {
        println!("  {}", path.display());
    }
}
