use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::BufReader;

use sensorwatch::config::{LoggingConfig, Settings, CONFIG_ENV};
use sensorwatch::detect::HealthReport;
use sensorwatch::ingest::{self, Mode};
use sensorwatch::storage::{SqliteWindowStore, WindowStore};
use sensorwatch::DetectionEngine;

#[derive(Parser)]
#[command(
    name = "sensorwatch",
    about = "Staged anomaly detection for industrial sensor streams",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run JSON-lines sensor records through the detectors
    Detect {
        /// Input file, or "-" for stdin
        #[arg(long, default_value = "-")]
        input: String,

        /// combined, heuristic, statistical or ml
        #[arg(long, default_value = "combined")]
        method: Mode,
    },

    /// Report window store and model status
    Health {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Reset sensor windows whose key matches a glob pattern
    ClearWindows {
        /// Glob pattern over sensor ids
        #[arg(long, default_value = "*")]
        pattern: String,
    },

    /// Show metadata of the loaded model
    ModelInfo,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_engine(settings: &Settings) -> Result<DetectionEngine> {
    DetectionEngine::from_settings(settings).context("failed to initialize detection engine")
}

/// Window store alone, for commands that never touch the detectors.
fn open_store(settings: &Settings) -> Result<SqliteWindowStore> {
    SqliteWindowStore::from_config(&settings.window).with_context(|| {
        format!(
            "failed to open window store: {}",
            settings.window.db_path.display()
        )
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::resolve(cli.config.as_deref())?;
    init_tracing(&settings.logging);

    match cli.command {
        Commands::Detect { input, method } => {
            let engine = build_engine(&settings)?;
            tracing::info!(%input, %method, "Starting detection");
            let stdout = tokio::io::stdout();
            let summary = if input == "-" {
                ingest::run_stream(&engine, method, BufReader::new(tokio::io::stdin()), stdout)
                    .await?
            } else {
                let file = tokio::fs::File::open(&input)
                    .await
                    .with_context(|| format!("failed to open input: {}", input))?;
                ingest::run_stream(&engine, method, BufReader::new(file), stdout).await?
            };
            eprintln!(
                "{} records: {} anomalies, {} errors, {} rejected lines",
                summary.records, summary.anomalies, summary.errors, summary.rejected
            );
        }
        Commands::Health { json } => {
            let health = match DetectionEngine::from_settings(&settings) {
                Ok(engine) => engine.health().await,
                Err(e) => {
                    tracing::warn!(error = %e, "Detectors unavailable, checking window store only");
                    let store = open_store(&settings)?;
                    HealthReport::for_store(
                        &store,
                        settings.window.min_data_points,
                        Err(e.to_string()),
                    )
                    .await
                }
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&health)?);
            } else {
                println!("\nSensorWatch Health");
                println!("Status:          {}", health.status);
                if let Some(err) = &health.store_error {
                    println!("Store error:     {}", err);
                }
                println!("Window size:     {}", health.window_size);
                println!("Min data points: {}", health.min_data_points);
                match (&health.model, &health.engine_error) {
                    (Some(model), _) => println!("Model:           {}", model.model_path.display()),
                    (None, Some(err)) => println!("Engine error:    {}", err),
                    (None, None) => {}
                }
                println!();
                println!("{:<25} | Points", "Sensor");
                println!("{:-<25}-|-{:-<8}", "", "");
                for (sensor, len) in &health.windows {
                    println!("{:<25} | {}", sensor, len);
                }
                println!();
            }
            if health.status != "healthy" {
                std::process::exit(1);
            }
        }
        Commands::ClearWindows { pattern } => {
            let removed = open_store(&settings)?.clear(&pattern).await?;
            tracing::info!(%pattern, removed, "Cleared sensor windows");
            println!("Cleared {} window(s) matching '{}'.", removed, pattern);
        }
        Commands::ModelInfo => {
            let info = build_engine(&settings)?.model_info();
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}
