use anyhow::{Context, Result};
use clap::Parser;
use facesort_core::discovery::list_images;
use facesort_core::reference::build_reference_set;
use facesort_core::{CascadeController, FaceOracle, FsRouter, OnnxOracle, PipelineMode, RunSummary};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(
    name = "facesort",
    version,
    about = "Sort photos into matched/unmatched folders by whether they contain a known face"
)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Pipeline mode: "single-pass" or "cascade"
    #[arg(short, long)]
    mode: Option<PipelineMode>,
    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    config.validate()?;

    let summary = run(&config)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn run(config: &Config) -> Result<RunSummary> {
    tracing::info!(
        mode = %config.mode,
        model_dir = %config.model_dir.display(),
        "facesort starting"
    );

    let oracle = OnnxOracle::load(&config.model_dir, config.mode == PipelineMode::Cascade)
        .context("loading face models")?;
    sort(config, oracle)
}

/// Build references, then classify and route every candidate.
fn sort<O: FaceOracle>(config: &Config, mut oracle: O) -> Result<RunSummary> {
    let reference_dir = config.reference_dir.display();
    let reference_paths = list_images(&config.reference_dir)
        .with_context(|| format!("listing reference images in {reference_dir}"))?;
    // Fails before the source directory is touched when no reference face survives.
    let references = build_reference_set(&mut oracle, &reference_paths, &config.preprocess())
        .context("building reference set")?;

    let source_dir = config.source_dir.display();
    let candidates = list_images(&config.source_dir)
        .with_context(|| format!("listing candidate images in {source_dir}"))?;
    let router = FsRouter::new(&config.matched_dir, &config.unmatched_dir)?;

    let mut controller = CascadeController::new(oracle, router, references, config.pipeline());
    Ok(controller.run(&candidates))
}

fn print_summary(summary: &RunSummary) {
    println!("Mode:       {}", summary.mode);
    println!("References: {}", summary.references);
    println!("Matched:    {}", summary.matched);
    println!("Unmatched:  {}", summary.unmatched);
    if summary.mode == PipelineMode::Cascade {
        println!("Escalated:  {}", summary.escalated);
    }
    println!("Skipped:    {}", summary.skipped);

    for report in summary.reports.iter().filter(|r| r.error.is_some()) {
        println!(
            "  left in place: {} ({})",
            report.file,
            report.error.as_deref().unwrap_or_default()
        );
    }
}
