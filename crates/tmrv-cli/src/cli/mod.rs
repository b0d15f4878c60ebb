mod commands;

use clap::Parser;
use tmrv_core::domain::RvError;

#[derive(Parser)]
#[command(name = "tmrv", about = "Template-matching radial velocities for echelle spectra")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(clap::Subcommand)]
enum CliCommand {
    /// Measure radial velocities against a coadded template
    Rv(commands::RvArgs),
    /// Build and store the template without a velocity pass
    Template(commands::TemplateArgs),
    /// Measure velocities by binary-mask cross correlation
    Ccf(commands::CcfArgs),
    /// Measure instrumental drifts against a reference exposure
    Drift(commands::DriftArgs),
    /// Measure line activity indices alongside the velocities
    Indices(commands::IndicesArgs),
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Compute(RvError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Parses the process arguments, runs the selected subcommand and turns
/// every failure into a diagnostic line plus the matching exit code.
pub fn run_from_env() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // Help and version are not failures; clap renders both.
        Err(err) if err.kind() == clap::error::ErrorKind::DisplayHelp => {
            print!("{err}");
            return 0;
        }
        Err(err) if err.kind() == clap::error::ErrorKind::DisplayVersion => {
            print!("{err}");
            return 0;
        }
        Err(err) => return report_failure(&CliError::Usage(err.to_string())),
    };

    let outcome = match cli.command {
        CliCommand::Rv(args) => commands::run_rv_command(args),
        CliCommand::Template(args) => commands::run_template_command(args),
        CliCommand::Ccf(args) => commands::run_ccf_command(args),
        CliCommand::Drift(args) => commands::run_drift_command(args),
        CliCommand::Indices(args) => commands::run_indices_command(args),
    };
    match outcome {
        Ok(code) => code,
        Err(error) => report_failure(&error),
    }
}

fn report_failure(error: &CliError) -> i32 {
    let rv_error = match error {
        CliError::Usage(message) => RvError::input_validation("CLI_USAGE", message.clone()),
        CliError::Compute(error) => error.clone(),
        CliError::Internal(error) => RvError::internal("CLI_INTERNAL", format!("{error:#}")),
    };
    eprintln!("{}", rv_error.diagnostic_line());
    if let Some(summary_line) = rv_error.fatal_exit_line() {
        eprintln!("{summary_line}");
    }
    rv_error.exit_code()
}
