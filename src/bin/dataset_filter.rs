use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};

use dataset_filter::batch::STATUS_FILE;
use dataset_filter::logging::init_logging;
use dataset_filter::necessity::ModelKey;
use dataset_filter::{
    BatchDriver, BatchStatus, ContaminationEstimator, DatasetStore, DirectoryStore, FileType,
    NecessityScorer, NumericTable, Settings, StatusReporter,
};

/// Contamination estimation and necessity scoring for tabular datasets
#[derive(Parser)]
#[command(name = "dataset-filter", version)]
struct Cli {
    /// JSON settings file (falls back to DATASET_FILTER_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Estimate the outlier fraction of a CSV or Excel file
    Estimate {
        file: PathBuf,
        /// Print the full estimation trace as JSON
        #[arg(long)]
        report: bool,
    },
    /// Feature importance of a training file against its target column
    Importance {
        file: PathBuf,
        #[arg(short, long)]
        target: String,
        /// Comma-separated feature columns (default: every numeric column)
        #[arg(short, long, value_delimiter = ',')]
        features: Option<Vec<String>>,
    },
    /// Rank the datasets an owner can see against a model's importance
    Rank {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        model: u64,
    },
    /// Score every dataset that has no contamination value yet
    Batch {
        #[arg(long)]
        store: PathBuf,
        /// Run on a worker thread and print progress while it works
        #[arg(long)]
        background: bool,
    },
    /// Clear every stored contamination value
    Reset {
        #[arg(long)]
        store: PathBuf,
    },
    /// Show the status file of the last batch run
    Status,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;

    let log_dir = match cli.command {
        Command::Batch { .. } if settings.batch.log_to_file => Some(settings.batch.status_dir.as_path()),
        _ => None,
    };
    if let Some(path) = init_logging(log_dir)? {
        tracing::info!(log = %path.display(), "writing run log");
    }
    settings.install_thread_pool();

    match cli.command {
        Command::Estimate { file, report } => estimate(&settings, &file, report),
        Command::Importance {
            file,
            target,
            features,
        } => importance(&settings, &file, &target, features),
        Command::Rank { store, owner, model } => rank(&settings, &store, &owner, model),
        Command::Batch { store, background } => batch(&settings, &store, background),
        Command::Reset { store } => {
            let store = DirectoryStore::open(&store)?;
            let cleared = store.reset_contamination()?;
            println!("Reset contamination for {} datasets", cleared);
            Ok(())
        }
        Command::Status => {
            let path = settings.batch.status_dir.join(STATUS_FILE);
            let status = BatchStatus::read(&path)
                .with_context(|| format!("no status at {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

fn read_table(file: &Path) -> Result<NumericTable> {
    let bytes = fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let name = file.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    NumericTable::decode(&bytes, FileType::from_file_name(name))
        .with_context(|| format!("decoding {}", file.display()))
}

fn estimate(settings: &Settings, file: &Path, report: bool) -> Result<()> {
    let table = read_table(file)?;
    let estimator = ContaminationEstimator::new(settings.contamination.clone());
    let result = estimator.estimate_report(&table)?;
    if report {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!(
            "contamination {:.4} (accuracy {:.2}%)",
            result.contamination,
            result.accuracy()
        );
    }
    Ok(())
}

fn importance(
    settings: &Settings,
    file: &Path,
    target: &str,
    features: Option<Vec<String>>,
) -> Result<()> {
    let table = read_table(file)?;
    let features = features.unwrap_or_else(|| table.numeric_column_names());
    let scorer = NecessityScorer::new(settings.necessity.clone());
    let key = ModelKey::new("cli", 0);
    let importance = scorer.compute_importance(&key, &table, target, &features)?;
    for (feature, weight) in importance.iter() {
        println!("{:<32} {:.6}", feature, weight);
    }
    Ok(())
}

fn rank(settings: &Settings, store: &Path, owner: &str, model: u64) -> Result<()> {
    let store = DirectoryStore::open(store)?;
    let scorer = NecessityScorer::new(settings.necessity.clone());
    let ranking = scorer.rank_visible_datasets(&store, owner, model)?;
    let datasets = store.datasets()?;
    for candidate in ranking.iter() {
        let name = datasets
            .iter()
            .find(|d| d.id == candidate.id)
            .map(|d| d.name.as_str())
            .unwrap_or("?");
        println!("{:>6}  {:.6}  {}", candidate.id, candidate.score, name);
    }
    Ok(())
}

fn batch(settings: &Settings, store: &Path, background: bool) -> Result<()> {
    let store = DirectoryStore::open(store)?;
    let estimator = ContaminationEstimator::new(settings.contamination.clone());
    let reporter = StatusReporter::with_file(&settings.batch.status_dir)?;
    let driver = Arc::new(BatchDriver::new(store, estimator));

    let status = if background {
        let handle = Arc::clone(&driver).spawn_background(reporter.clone());
        while !handle.is_finished() {
            let status = reporter.snapshot();
            if status.is_running {
                eprintln!(
                    "{}/{} processed, {} failed{}",
                    status.processed_datasets,
                    status.total_datasets,
                    status.failed_datasets,
                    status
                        .current_dataset
                        .map(|d| format!(", on {}", d))
                        .unwrap_or_default()
                );
            }
            thread::sleep(Duration::from_millis(500));
        }
        handle
            .join()
            .map_err(|_| anyhow!("batch worker panicked"))??
    } else {
        driver.run(&reporter)?
    };

    println!(
        "Processed {} of {} datasets, {} failed",
        status.processed_datasets, status.total_datasets, status.failed_datasets
    );
    for error in &status.errors {
        println!("  {}", error);
    }
    Ok(())
}
