use ndarray::{Array2, ArrayView2};
use serde::Serialize;

use crate::config::ContaminationConfig;
use crate::error::{FilterError, Result};
use crate::models::base_model::{BaseModel, OUTLIER};
use crate::models::iforest::{IsolationForest, IsolationForestParams};
use crate::table::NumericTable;
use crate::utils::evaluation::silhouette_score;
use crate::utils::signal::{gaussian_filter1d, gradient, local_minima};
use crate::utils::ss::StandardScaler;

/// Sorted decision scores with their smoothed curve and its second derivative.
#[derive(Debug, Clone)]
pub struct AnomalyScoreCurve {
    pub sorted: Vec<f64>,
    pub smoothed: Vec<f64>,
    pub second_derivative: Vec<f64>,
}

impl AnomalyScoreCurve {
    pub fn new(mut scores: Vec<f64>, sigma: f64) -> Self {
        scores.sort_by(|a, b| a.total_cmp(b));
        let smoothed = gaussian_filter1d(&scores, sigma);
        let second_derivative = gradient(&gradient(&smoothed));
        AnomalyScoreCurve {
            sorted: scores,
            smoothed,
            second_derivative,
        }
    }

    /// First local minimum of the second derivative, left to right.
    pub fn elbow_index(&self) -> Option<usize> {
        local_minima(&self.second_derivative).first().copied()
    }
}

/// One evaluated point of the refine scan.
#[derive(Debug, Clone, Serialize)]
pub struct RefineCandidate {
    pub contamination: f64,
    pub outliers: usize,
    /// `None` when every row got the same label.
    pub silhouette: Option<f64>,
}

/// Full trace of one estimation, for logging and inspection.
#[derive(Debug, Clone, Serialize)]
pub struct ContaminationReport {
    pub rows: usize,
    pub features: Vec<String>,
    pub elbow_index: Option<usize>,
    pub elbow_estimate: f64,
    pub candidates: Vec<RefineCandidate>,
    pub contamination: f64,
}

impl ContaminationReport {
    /// Dataset quality as shown to users: `(1 - contamination) * 100`.
    pub fn accuracy(&self) -> f64 {
        accuracy(self.contamination)
    }
}

pub fn accuracy(contamination: f64) -> f64 {
    (1.0 - contamination) * 100.0
}

/// Highest silhouette among scored candidates; the earliest one wins a tie.
pub fn best_candidate(candidates: &[RefineCandidate]) -> Option<&RefineCandidate> {
    let mut best: Option<(&RefineCandidate, f64)> = None;
    for candidate in candidates {
        if let Some(score) = candidate.silhouette {
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((candidate, score));
            }
        }
    }
    best.map(|(candidate, _)| candidate)
}

/// Estimates the outlier fraction of a table: an elbow on the sorted
/// isolation-forest scores, refined by the best silhouette in a window around it.
#[derive(Debug, Clone, Default)]
pub struct ContaminationEstimator {
    config: ContaminationConfig,
}

impl ContaminationEstimator {
    pub fn new(config: ContaminationConfig) -> Self {
        ContaminationEstimator { config }
    }

    pub fn estimate(&self, table: &NumericTable) -> Result<f64> {
        Ok(self.estimate_report(table)?.contamination)
    }

    pub fn estimate_report(&self, table: &NumericTable) -> Result<ContaminationReport> {
        let (features, matrix) = table.analysis_matrix()?;
        let scaled = StandardScaler::fit_transform(matrix.view());
        let mut report = self
            .estimate_scaled(scaled.view())
            .map_err(FilterError::contamination_from)?;
        report.features = features;
        tracing::info!(
            rows = report.rows,
            elbow = report.elbow_estimate,
            contamination = report.contamination,
            "contamination estimated"
        );
        Ok(report)
    }

    /// Estimate on a complete numeric matrix; rows with gaps must already be gone.
    pub fn estimate_matrix(&self, x: ArrayView2<f64>) -> Result<f64> {
        if x.nrows() == 0 || x.ncols() == 0 {
            return Err(FilterError::Data("empty matrix".into()));
        }
        let scaled: Array2<f64> = StandardScaler::fit_transform(x);
        self.estimate_scaled(scaled.view())
            .map(|r| r.contamination)
            .map_err(FilterError::contamination_from)
    }

    fn estimate_scaled(&self, x: ArrayView2<f64>) -> Result<ContaminationReport> {
        let n_rows = x.nrows();
        let mut forest = IsolationForest::fit(
            x,
            IsolationForestParams {
                n_estimators: self.config.n_estimators,
                max_samples: self.config.max_samples,
                contamination: self.config.reference_contamination,
                random_state: self.config.random_state,
            },
        )?;

        let curve = AnomalyScoreCurve::new(
            forest.training_decisions().to_vec(),
            self.config.smoothing_sigma,
        );
        let elbow_index = curve.elbow_index();
        let elbow_estimate = match elbow_index {
            Some(idx) => idx as f64 / n_rows as f64,
            None => self.config.default_elbow,
        };
        tracing::debug!(?elbow_index, elbow_estimate, "elbow pass done");

        let mut report = ContaminationReport {
            rows: n_rows,
            features: Vec::new(),
            elbow_index,
            elbow_estimate,
            candidates: Vec::new(),
            contamination: elbow_estimate,
        };

        // Constant columns scale to zeros; with no column varying there is
        // nothing to separate and every candidate would be single-label.
        if x.iter().all(|v| *v == 0.0) {
            tracing::warn!("every numeric column is constant, keeping elbow estimate");
            return Ok(report);
        }

        for contamination in self.refine_window(elbow_estimate) {
            forest.recalibrate(contamination);
            let labels = forest.predict(x);
            let outliers = labels.iter().filter(|&&l| l == OUTLIER).count();

            let silhouette = if outliers == 0 || outliers == labels.len() {
                None
            } else {
                Some(silhouette_score(x, &labels)?)
            };
            tracing::trace!(contamination, outliers, ?silhouette, "refine candidate");
            report.candidates.push(RefineCandidate {
                contamination,
                outliers,
                silhouette,
            });
        }

        match best_candidate(&report.candidates).map(|c| c.contamination) {
            Some(contamination) => {
                report.contamination = contamination;
                Ok(report)
            }
            None => Err(FilterError::contamination(format!(
                "no contamination in [{:.4}, {:.4}] separates the rows into two groups",
                report.candidates.first().map_or(0.0, |c| c.contamination),
                report.candidates.last().map_or(0.0, |c| c.contamination),
            ))),
        }
    }

    /// Evenly spaced candidates around the elbow estimate, both ends included.
    pub fn refine_window(&self, elbow_estimate: f64) -> Vec<f64> {
        let upper = (1.5 * elbow_estimate)
            .clamp(self.config.min_contamination, self.config.max_contamination);
        let lower = (0.5 * elbow_estimate)
            .max(self.config.min_contamination)
            .min(upper);
        let points = self.config.refine_points;
        if points == 1 {
            return vec![lower];
        }
        let step = (upper - lower) / (points - 1) as f64;
        (0..points).map(|i| lower + step * i as f64).collect()
    }
}
