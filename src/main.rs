//! trailtemp - temperature overlay extraction and data-quality triage
//!
//! Reads the burned-in temperature stamp out of trail camera imagery, merges
//! manual corrections over the raw table, and ranks data-quality issues in
//! the per-deployment time series for human review.

mod anomaly;
mod config;
mod extract;
mod filename;
mod issues;
mod table;
mod vision;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::extract::runner::BatchRunner;
use crate::extract::Extractor;
use crate::vision::{OcrEngine, OcrModels};

/// trailtemp - temperature overlay extraction and triage
#[derive(Parser, Debug)]
#[command(name = "trailtemp")]
#[command(about = "Extract temperature overlays from trail camera images and triage data-quality issues")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run OCR extraction over an image corpus
    Extract {
        /// Directory containing stamped images
        input: PathBuf,

        /// Output CSV table
        #[arg(short, long, default_value = "temperature_data.csv")]
        output: PathBuf,
    },

    /// Merge correction tables over a base extraction table
    Clean {
        /// Base extraction table (CSV)
        base: PathBuf,

        /// Correction tables, applied in order
        corrections: Vec<PathBuf>,

        /// Output CSV table
        #[arg(short, long, default_value = "cleaned_temperature_data.csv")]
        output: PathBuf,
    },

    /// Detect and rank data-quality issues in a record table
    Issues {
        /// Record table (CSV), ideally already cleaned
        table: PathBuf,

        /// Output issues CSV
        #[arg(short, long, default_value = "temperature_data_issues.csv")]
        output: PathBuf,

        /// Override the z-score threshold for flagging
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Show or prefetch the OCR model files
    Models {
        /// Download any missing model files now
        #[arg(long)]
        download: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_or_default_config(args.config.as_deref())?;

    match args.command {
        Command::Extract { input, output } => cmd_extract(&config, &input, &output),
        Command::Clean {
            base,
            corrections,
            output,
        } => cmd_clean(&base, &corrections, &output),
        Command::Issues {
            table,
            output,
            threshold,
        } => cmd_issues(&config, &table, &output, threshold),
        Command::Models { download } => cmd_models(&config, download),
    }
}

/// Load configuration from the given path, or fall back to defaults.
fn load_or_default_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => {
            let config = config::load_config(path)
                .with_context(|| format!("failed to load configuration {path:?}"))?;
            info!("Loaded configuration from {:?}", path);
            Ok(config)
        }
        None => Ok(AppConfig::default()),
    }
}

/// Build the model store from configuration.
fn model_store(config: &AppConfig) -> Result<OcrModels> {
    let models = match &config.models.model_dir {
        Some(dir) => OcrModels::with_dir(dir.clone())?,
        None => OcrModels::new()?,
    };
    Ok(if config.models.allow_download {
        models
    } else {
        models.offline()
    })
}

fn cmd_extract(config: &AppConfig, input: &Path, output: &Path) -> Result<()> {
    anyhow::ensure!(input.is_dir(), "input path {input:?} is not a directory");

    let files = filename::scan_corpus(input)?;
    if files.is_empty() {
        warn!("No matching image files found in {:?}", input);
        return Ok(());
    }
    info!("Found {} image files to process", files.len());

    // The engine is constructed exactly once; model loading dominates
    // per-image inference cost.
    info!("Initializing OCR engine...");
    let mut engine = OcrEngine::new(&model_store(config)?)?;

    let runner = BatchRunner::new(Extractor::new()?, config.extraction);
    let (records, _summary) = runner.run(&files, &mut engine)?;

    table::write_table(output, &records)
}

fn cmd_clean(base: &Path, corrections: &[PathBuf], output: &Path) -> Result<()> {
    let base_records = table::load_table(base)?;
    info!("Base table: {} records", base_records.len());

    let mut override_tables = Vec::new();
    for path in corrections {
        if !path.exists() {
            warn!("Correction file not found: {:?}", path);
            continue;
        }
        let records = table::load_table(path)?;
        info!("Applying {} corrections from {:?}", records.len(), path);
        override_tables.push(records);
    }

    let (merged, report) = table::merge_corrections(base_records, &override_tables);
    if report.unmatched > 0 {
        warn!(
            "{} corrections referenced filenames absent from the base table",
            report.unmatched
        );
    }

    let with_temperature = merged.iter().filter(|r| r.temperature.is_some()).count();
    info!(
        "Merged table: {} records, {} with a temperature, {} still missing",
        merged.len(),
        with_temperature,
        merged.len() - with_temperature
    );

    table::write_table(output, &merged)
}

fn cmd_issues(
    config: &AppConfig,
    table_path: &Path,
    output: &Path,
    threshold: Option<f64>,
) -> Result<()> {
    let records = table::load_table(table_path)?;
    info!("Loaded {} records from {:?}", records.len(), table_path);

    let window_config = config.anomaly.window_config();
    let threshold = threshold.unwrap_or(config.anomaly.extreme_threshold);

    let report = anomaly::analyze_all(&records, &window_config);
    let flagged: Vec<&anomaly::ResidualPoint> = report
        .deployments
        .iter()
        .flat_map(|scores| anomaly::flag_anomalies(scores, threshold))
        .collect();
    info!(
        "Flagged {} anomalous readings at z > {}",
        flagged.len(),
        threshold
    );

    let issues = issues::classify(&records, &flagged, &config.issues);

    for (deployment_id, valid_points) in &report.skipped {
        warn!(
            "Deployment {deployment_id} skipped: only {valid_points} valid readings"
        );
    }

    issues::write_issues(output, &issues)
}

fn cmd_models(config: &AppConfig, download: bool) -> Result<()> {
    let models = model_store(config)?;

    if download {
        models.ensure_all()?;
    }

    println!("Model directory: {:?}", models.models_dir());
    for (file, available, size) in models.status() {
        let size = size
            .map(|s| format!("{:.2} MB", s as f64 / 1_048_576.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<22} {:<9} {}",
            file.display_name(),
            if available { "ready" } else { "missing" },
            size
        );
    }

    Ok(())
}
