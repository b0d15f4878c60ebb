mod cli;

fn main() {
    // Progress goes through tracing on stderr; stdout carries the summaries.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::level_filters::LevelFilter::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    std::process::exit(cli::run_from_env());
}
