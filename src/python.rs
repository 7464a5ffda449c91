use numpy::PyArray2;
use pyo3::exceptions::{PyTypeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyAny;

use crate::config::{ContaminationConfig, NecessityConfig};
use crate::contamination;
use crate::error::FilterError;
use crate::necessity::{self, ModelKey};
use crate::table::{FileType, NumericTable};

impl From<FilterError> for PyErr {
    fn from(err: FilterError) -> PyErr {
        PyValueError::new_err(err.to_string())
    }
}

// Accept any common numeric dtype and hand back an owned f64 matrix.
fn get_matrix_f64(x: &PyAny) -> PyResult<ndarray::Array2<f64>> {
    if let Ok(arr) = x.extract::<&PyArray2<f64>>() {
        return Ok(arr.readonly().as_array().to_owned());
    }
    let casted = if let Ok(arr) = x.extract::<&PyArray2<f32>>() {
        arr.cast::<f64>(false)
    } else if let Ok(arr) = x.extract::<&PyArray2<i64>>() {
        arr.cast::<f64>(false)
    } else if let Ok(arr) = x.extract::<&PyArray2<i32>>() {
        arr.cast::<f64>(false)
    } else {
        return Err(PyTypeError::new_err(
            "Unsupported array for 'x': expected a 2-D float or integer array",
        ));
    };
    let arr = casted.map_err(|e| PyTypeError::new_err(format!("Failed to cast array to f64: {}", e)))?;
    Ok(arr.readonly().as_array().to_owned())
}

#[pyclass]
pub struct ContaminationEstimator {
    inner: contamination::ContaminationEstimator,
}

#[pymethods]
impl ContaminationEstimator {
    #[new]
    #[pyo3(signature = (n_estimators=100, random_state=42))]
    fn new(n_estimators: usize, random_state: u64) -> Self {
        ContaminationEstimator {
            inner: contamination::ContaminationEstimator::new(ContaminationConfig {
                n_estimators,
                random_state,
                ..ContaminationConfig::default()
            }),
        }
    }

    /// Estimate on a complete 2-D numeric array.
    fn estimate(&self, py: Python<'_>, x: &PyAny) -> PyResult<f64> {
        let matrix = get_matrix_f64(x)?;
        Ok(py.allow_threads(|| self.inner.estimate_matrix(matrix.view()))?)
    }

    /// Estimate on raw CSV or Excel bytes; the format follows `file_name`.
    fn estimate_bytes(&self, py: Python<'_>, data: &[u8], file_name: &str) -> PyResult<f64> {
        let bytes = data.to_vec();
        let file_type = FileType::from_file_name(file_name);
        Ok(py.allow_threads(|| {
            NumericTable::decode(&bytes, file_type).and_then(|table| self.inner.estimate(&table))
        })?)
    }
}

#[pyclass]
pub struct NecessityScorer {
    inner: necessity::NecessityScorer,
}

#[pymethods]
impl NecessityScorer {
    #[new]
    #[pyo3(signature = (n_estimators=100, max_depth=4, learning_rate=0.3))]
    fn new(n_estimators: usize, max_depth: usize, learning_rate: f64) -> Self {
        NecessityScorer {
            inner: necessity::NecessityScorer::new(NecessityConfig {
                n_estimators,
                max_depth,
                learning_rate,
                ..NecessityConfig::default()
            }),
        }
    }

    /// Returns `(feature, weight)` pairs in declaration order.
    #[pyo3(signature = (owner, model_id, data, file_name, target, features=None))]
    fn compute_importance(
        &self,
        py: Python<'_>,
        owner: &str,
        model_id: u64,
        data: &[u8],
        file_name: &str,
        target: &str,
        features: Option<Vec<String>>,
    ) -> PyResult<Vec<(String, f64)>> {
        let key = ModelKey::new(owner, model_id);
        let bytes = data.to_vec();
        let file_type = FileType::from_file_name(file_name);
        let importance = py.allow_threads(|| {
            let table = NumericTable::decode(&bytes, file_type)?;
            let features = features.unwrap_or_else(|| table.numeric_column_names());
            self.inner.compute_importance(&key, &table, target, &features)
        })?;
        Ok(importance
            .iter()
            .map(|(feature, weight)| (feature.to_string(), weight))
            .collect())
    }

    /// Rank `(id, bytes, file_name)` candidates against an importance
    /// already computed for `(owner, model_id)`.
    fn rank_candidates(
        &self,
        py: Python<'_>,
        owner: &str,
        model_id: u64,
        candidates: Vec<(u64, Vec<u8>, String)>,
    ) -> PyResult<Vec<(u64, f64)>> {
        let key = ModelKey::new(owner, model_id);
        let importance = self.inner.cache().get(&key).ok_or_else(|| {
            FilterError::NotFound(format!(
                "no feature importance computed for model {} of {}",
                model_id, owner
            ))
        })?;
        let ranking = py.allow_threads(|| -> Result<_, FilterError> {
            let mut tables = Vec::with_capacity(candidates.len());
            for (id, bytes, file_name) in &candidates {
                let table = NumericTable::decode(bytes, FileType::from_file_name(file_name))?;
                tables.push((*id, table));
            }
            Ok(self
                .inner
                .rank_candidates(&importance, tables.iter().map(|(id, t)| (*id, t))))
        })?;
        Ok(ranking.iter().map(|c| (c.id, c.score)).collect())
    }

    fn fits(&self) -> usize {
        self.inner.fits()
    }
}
