use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};

/// Environment variable naming a JSON settings file.
pub const CONFIG_ENV: &str = "DATASET_FILTER_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContaminationConfig {
    /// Contamination the elbow-pass forest is fitted at.
    pub reference_contamination: f64,
    pub n_estimators: usize,
    pub max_samples: usize,
    pub random_state: u64,
    pub smoothing_sigma: f64,
    /// Elbow estimate used when the score curve has no local minimum.
    pub default_elbow: f64,
    pub refine_points: usize,
    pub min_contamination: f64,
    pub max_contamination: f64,
}

impl Default for ContaminationConfig {
    fn default() -> Self {
        ContaminationConfig {
            reference_contamination: 0.1,
            n_estimators: 100,
            max_samples: 256,
            random_state: 42,
            smoothing_sigma: 5.0,
            default_elbow: 0.05,
            refine_points: 20,
            min_contamination: 0.001,
            max_contamination: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NecessityConfig {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    /// L2 regularization on leaf weights.
    pub lambda: f64,
    pub min_child_weight: f64,
    pub test_fraction: f64,
    pub split_seed: u64,
}

impl Default for NecessityConfig {
    fn default() -> Self {
        NecessityConfig {
            n_estimators: 100,
            max_depth: 4,
            learning_rate: 0.3,
            lambda: 1.0,
            min_child_weight: 1.0,
            test_fraction: 0.2,
            split_seed: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Directory receiving the status file and the run log.
    pub status_dir: PathBuf,
    pub log_to_file: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            status_dir: PathBuf::from("logs"),
            log_to_file: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub contamination: ContaminationConfig,
    pub necessity: NecessityConfig,
    pub batch: BatchConfig,
    /// Worker threads for the rayon pool; `None` uses every core.
    pub threads: Option<usize>,
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            FilterError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let settings: Settings = serde_json::from_str(&raw)
            .map_err(|e| FilterError::Config(format!("invalid {}: {}", path.display(), e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Explicit path first, then `DATASET_FILTER_CONFIG`, then defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match std::env::var(CONFIG_ENV) {
            Ok(env_path) if !env_path.is_empty() => Self::from_file(Path::new(&env_path)),
            _ => Ok(Settings::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.contamination;
        if !(c.reference_contamination > 0.0 && c.reference_contamination <= 0.5) {
            return Err(FilterError::Config(format!(
                "contamination.reference_contamination must be in (0, 0.5], got {}",
                c.reference_contamination
            )));
        }
        if !(c.min_contamination > 0.0 && c.min_contamination <= c.max_contamination) {
            return Err(FilterError::Config(
                "contamination bounds must satisfy 0 < min_contamination <= max_contamination".into(),
            ));
        }
        if c.max_contamination > 0.5 {
            return Err(FilterError::Config(
                "contamination.max_contamination must not exceed 0.5".into(),
            ));
        }
        if c.n_estimators == 0 || c.max_samples == 0 || c.refine_points == 0 {
            return Err(FilterError::Config(
                "contamination.n_estimators, max_samples and refine_points must be positive".into(),
            ));
        }
        if c.smoothing_sigma < 0.0 {
            return Err(FilterError::Config("contamination.smoothing_sigma must be >= 0".into()));
        }

        let n = &self.necessity;
        if n.n_estimators == 0 || n.max_depth == 0 {
            return Err(FilterError::Config(
                "necessity.n_estimators and max_depth must be positive".into(),
            ));
        }
        if !(n.test_fraction > 0.0 && n.test_fraction < 1.0) {
            return Err(FilterError::Config(format!(
                "necessity.test_fraction must be in (0, 1), got {}",
                n.test_fraction
            )));
        }
        if n.learning_rate <= 0.0 || n.lambda < 0.0 || n.min_child_weight < 0.0 {
            return Err(FilterError::Config(
                "necessity.learning_rate must be positive, lambda and min_child_weight non-negative"
                    .into(),
            ));
        }
        if self.threads == Some(0) {
            return Err(FilterError::Config("threads must be positive".into()));
        }
        Ok(())
    }

    pub fn worker_threads(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get)
    }

    /// Size the global rayon pool. Only the first call in a process takes effect.
    pub fn install_thread_pool(&self) {
        let threads = self.worker_threads();
        match rayon::ThreadPoolBuilder::new().num_threads(threads).build_global() {
            Ok(()) => tracing::debug!(threads, "rayon pool configured"),
            Err(e) => tracing::debug!(error = %e, "rayon pool already configured"),
        }
    }
}
