//! Sequential sweep over every dataset that has no contamination value yet.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contamination::ContaminationEstimator;
use crate::error::{FilterError, Result};
use crate::store::{DatasetRecord, DatasetStore};

pub const STATUS_FILE: &str = "contamination_process_status.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub is_running: bool,
    pub total_datasets: usize,
    pub processed_datasets: usize,
    pub failed_datasets: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub current_dataset: Option<String>,
    pub errors: Vec<String>,
}

impl BatchStatus {
    /// Read a status file written by a previous or concurrent run.
    pub fn read(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

/// Shared handle on one run's status. Every update is mirrored to the
/// status file when one is configured.
#[derive(Debug, Clone, Default)]
pub struct StatusReporter {
    status: Arc<Mutex<BatchStatus>>,
    path: Option<PathBuf>,
}

impl StatusReporter {
    pub fn in_memory() -> Self {
        StatusReporter::default()
    }

    pub fn with_file(status_dir: &Path) -> Result<Self> {
        fs::create_dir_all(status_dir)?;
        Ok(StatusReporter {
            status: Arc::default(),
            path: Some(status_dir.join(STATUS_FILE)),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> BatchStatus {
        match self.status.lock() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut BatchStatus),
    {
        let snapshot = {
            let mut status = self
                .status
                .lock()
                .map_err(|_| FilterError::Store("status lock poisoned".into()))?;
            f(&mut status);
            status.clone()
        };
        if let Some(path) = &self.path {
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?)?;
            fs::rename(&tmp, path)?;
        }
        Ok(())
    }
}

pub struct BatchDriver<S> {
    store: S,
    estimator: ContaminationEstimator,
    running: AtomicBool,
}

impl<S: DatasetStore> BatchDriver<S> {
    pub fn new(store: S, estimator: ContaminationEstimator) -> Self {
        BatchDriver {
            store,
            estimator,
            running: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Score every unscored dataset. A failing dataset is logged, counted,
    /// rolled back and skipped; only store-level failures abort the run.
    pub fn run(&self, reporter: &StatusReporter) -> Result<BatchStatus> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(FilterError::AlreadyRunning);
        }
        let outcome = self.sweep(reporter);
        self.running.store(false, Ordering::SeqCst);

        let finished = reporter.update(|status| {
            status.is_running = false;
            status.current_dataset = None;
            status.end_time = Some(Utc::now());
            if let Err(e) = &outcome {
                status.errors.push(format!("Batch process error: {}", e));
            }
        });
        outcome?;
        finished?;

        let status = reporter.snapshot();
        tracing::info!(
            processed = status.processed_datasets,
            failed = status.failed_datasets,
            total = status.total_datasets,
            "batch finished"
        );
        Ok(status)
    }

    fn sweep(&self, reporter: &StatusReporter) -> Result<()> {
        let datasets = self.store.unscored_datasets()?;
        reporter.update(|status| {
            *status = BatchStatus {
                is_running: true,
                total_datasets: datasets.len(),
                start_time: Some(Utc::now()),
                ..BatchStatus::default()
            };
        })?;
        tracing::info!(total = datasets.len(), "batch started");

        for record in &datasets {
            reporter.update(|status| status.current_dataset = Some(record.label()))?;
            match self.process(record) {
                Ok(contamination) => {
                    tracing::info!(
                        dataset = record.id,
                        contamination,
                        accuracy = crate::contamination::accuracy(contamination),
                        "dataset scored"
                    );
                    reporter.update(|status| status.processed_datasets += 1)?;
                }
                Err(e) => {
                    let message = format!("Error processing {}: {}", record.label(), e);
                    tracing::error!(dataset = record.id, error = %e, "dataset failed");
                    if let Err(rollback) = self.store.rollback(record.id) {
                        tracing::warn!(dataset = record.id, error = %rollback, "rollback failed");
                    }
                    reporter.update(|status| {
                        status.failed_datasets += 1;
                        status.errors.push(message);
                    })?;
                }
            }
        }
        Ok(())
    }

    fn process(&self, record: &DatasetRecord) -> Result<f64> {
        let table = self.store.load_dataset(record.id)?.decode()?;
        let contamination = self.estimator.estimate(&table)?;
        self.store.save_contamination(record.id, contamination)?;
        Ok(contamination)
    }
}

impl<S: DatasetStore + 'static> BatchDriver<S> {
    /// Run on a detached thread; poll `reporter` for progress.
    pub fn spawn_background(
        self: Arc<Self>,
        reporter: StatusReporter,
    ) -> JoinHandle<Result<BatchStatus>> {
        thread::spawn(move || self.run(&reporter))
    }
}
