use ndarray::{Array1, ArrayView1, ArrayView2, Axis};

/// Label given to rows the detector considers normal.
pub const INLIER: i32 = 1;
/// Label given to anomalous rows.
pub const OUTLIER: i32 = -1;

/// A common Rust trait for batch anomaly detectors.
pub trait BaseModel {
    /// Raw normality of one row; higher is more normal.
    fn score_partial(&self, x: ArrayView1<f64>) -> f64;

    /// Threshold separating inliers from outliers on the raw score.
    fn offset(&self) -> f64;

    /// Default: score a batch.
    fn score_samples(&self, xs: ArrayView2<f64>) -> Array1<f64> {
        xs.axis_iter(Axis(0)).map(|x| self.score_partial(x)).collect()
    }

    /// Default: shifted scores, negative for outliers.
    fn decision_function(&self, xs: ArrayView2<f64>) -> Array1<f64> {
        let offset = self.offset();
        self.score_samples(xs).mapv(|s| s - offset)
    }

    /// Default: `INLIER` / `OUTLIER` per row.
    fn predict(&self, xs: ArrayView2<f64>) -> Vec<i32> {
        self.decision_function(xs)
            .iter()
            .map(|&d| if d < 0.0 { OUTLIER } else { INLIER })
            .collect()
    }
}
