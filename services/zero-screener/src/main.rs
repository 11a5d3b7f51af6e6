//! Zero Screener - full market A-share screening run.
//!
//! Loads the shared configuration, runs one screening pass and publishes
//! the ranked output. Ctrl-C cancels the run without publishing anything.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use zero_common::config::Config;
use zero_common::config_loader::check_modular_files;
use zero_common::logging::init_logging_with_exclusions;
use zero_screener::screener::shutdown_on;
use zero_screener::{ReportFormat, ScreenerConfig, ScreenerEngine, ScreenerError};

/// Full market A-share screener.
#[derive(Parser, Debug)]
#[command(name = "zero-screener")]
#[command(author = "theonlyhennygod")]
#[command(version)]
#[command(about = "Rank the whole A-share market by a five-factor composite score.", long_about = None)]
struct Cli {
    /// Config directory (defaults to ~/.codecoder)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Output directory or file for the ranked output
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Number of instruments in the final output (N)
    #[arg(long)]
    top: Option<usize>,

    /// Output format; may be repeated (json, markdown)
    #[arg(long = "format", short)]
    formats: Vec<ReportFormat>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => {}
        Err(e) => {
            let code = e
                .downcast_ref::<ScreenerError>()
                .map(ScreenerError::exit_code)
                .unwrap_or(1);
            tracing::error!(error = %e, "Screening failed");
            eprintln!("Error: {:#}", e);
            std::process::exit(code);
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Load configuration
    let mut config = match &cli.config {
        Some(dir) => Config::load_from_dir(dir)?,
        None => Config::load()?,
    };
    config.apply_env_overrides()?;

    // Initialize logging
    init_logging_with_exclusions(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    tracing::info!("Zero Screener v{}", env!("CARGO_PKG_VERSION"));
    for (file, present) in check_modular_files(cli.config.clone()) {
        tracing::debug!(file = %file, present, "Config file");
    }

    let mut screener = ScreenerConfig::from_common(&config).context("Invalid screener config")?;
    if let Some(top) = cli.top {
        screener.output.top_n = top;
    }
    if !cli.formats.is_empty() {
        screener.output.formats = cli.formats.clone();
    }

    let engine = ScreenerEngine::with_default_sources(screener)?;

    let output = engine
        .run_until_cancelled(shutdown_on(tokio::signal::ctrl_c()))
        .await?;

    let formats = &engine.config().output.formats;
    let written = match &cli.output {
        // A path with an extension names a single file
        Some(path) if path.extension().is_some() => {
            let format = formats.first().copied().unwrap_or(ReportFormat::Json);
            vec![output.save_to_file(path, format)?]
        }
        Some(dir) => output.publish(dir, formats)?,
        None => output.publish(&engine.config().output.output_dir, formats)?,
    };

    for path in &written {
        tracing::info!(path = %path.display(), "Ranked output published");
    }
    println!("{}", output.summary());

    Ok(())
}
