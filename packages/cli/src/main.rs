#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Command-line entry point for hotspot anomaly detection jobs.
//!
//! Loads a TOML job configuration, wires the stage runner to a
//! filesystem artifact store, and runs one job end to end. Status
//! updates go to the log; plots are skipped (no renderer is wired in
//! yet).

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use hotspot_models::StageConfig;
use hotspot_pipeline::plot::NullPlotSink;
use hotspot_pipeline::status::LogStatusSink;
use hotspot_pipeline::store::LocalArtifactStore;
use hotspot_pipeline::{STAGE_NAME, StageRunner};

#[derive(Parser)]
#[command(
    name = "hotspot",
    about = "Spatial-temporal anomaly detection over CSV event feeds"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the H3 anomaly stage for one job
    Run {
        /// TOML job configuration
        #[arg(long)]
        config: PathBuf,
        /// Directory that receives job artifacts
        #[arg(long, default_value = "results")]
        output: PathBuf,
        /// Job id; a random one is generated when omitted
        #[arg(long)]
        job_id: Option<String>,
    },
    /// Validate a TOML job configuration without running anything
    Check {
        /// TOML job configuration
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            output,
            job_id,
        } => run(&config, &output, job_id)?,
        Commands::Check { config } => check(&config)?,
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<StageConfig, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    let config: StageConfig = toml::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}

fn run(
    config_path: &Path,
    output: &Path,
    job_id: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let job_id = job_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    log::info!(
        "Running job {job_id}: {} sources at H3 resolution {}",
        config.sources.len(),
        config.h3_resolution
    );

    let store = LocalArtifactStore::new(output);
    let runner = StageRunner::new(
        &job_id,
        &config,
        &store,
        &NullPlotSink,
        &LogStatusSink,
        output.join("work"),
    );
    let value = runner.run()?;

    let localized = value["results"].as_array().map_or(0, Vec::len);
    let city_wide = value["city_wide_results"].as_array().map_or(0, Vec::len);
    log::info!("Job {job_id} complete: {localized} localized and {city_wide} city-wide results");

    println!(
        "{}",
        output.join(&job_id).join(format!("{STAGE_NAME}.json")).display()
    );
    Ok(())
}

fn check(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    println!(
        "OK: {} sources, H3 resolution {}, trend windows {:?}",
        config.sources.len(),
        config.h3_resolution,
        config.analysis_weeks_trend
    );
    Ok(())
}
