//! Dataset quality filters: contamination estimation for uploaded tables and
//! necessity scoring of candidate datasets against a trained model.

pub mod batch;
pub mod config;
pub mod contamination;
pub mod error;
pub mod logging;
pub mod models;
pub mod necessity;
pub mod store;
pub mod table;
pub mod utils;

#[cfg(feature = "python")]
mod python;

pub use batch::{BatchDriver, BatchStatus, StatusReporter};
pub use config::Settings;
pub use contamination::{ContaminationEstimator, ContaminationReport};
pub use error::{FilterError, Result};
pub use necessity::{FeatureImportance, ModelKey, NecessityRanking, NecessityScorer};
pub use store::{DatasetStore, DirectoryStore};
pub use table::{FileType, NumericTable};

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// Python module exposing the estimator and the scorer.
#[cfg(feature = "python")]
#[pymodule]
fn dataset_filter(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<python::ContaminationEstimator>()?;
    m.add_class::<python::NecessityScorer>()?;
    Ok(())
}
