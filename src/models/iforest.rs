// src/models/iforest.rs

use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::prelude::*;
use rand::seq::index;
use rayon::prelude::*;
use std::cmp;

use crate::error::{FilterError, Result};
use crate::models::base_model::BaseModel;
use crate::utils::evaluation::percentile;

const EULER_GAMMA: f64 = 0.5772156649;

// Custom tree node structure
struct Node {
    split_feature: Option<usize>,
    split_value: f64,
    size: usize,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
}

impl Node {
    fn leaf(size: usize) -> Self {
        Node {
            split_feature: None,
            split_value: 0.0,
            size,
            left: None,
            right: None,
        }
    }

    fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct IsolationForestParams {
    pub n_estimators: usize,
    pub max_samples: usize,
    /// Expected outlier fraction; sets the decision threshold only.
    pub contamination: f64,
    pub random_state: u64,
}

impl Default for IsolationForestParams {
    fn default() -> Self {
        IsolationForestParams {
            n_estimators: 100,
            max_samples: 256,
            contamination: 0.1,
            random_state: 42,
        }
    }
}

/// Batch isolation forest. Trees are grown on subsamples drawn without
/// replacement; the offset is the `contamination` percentile of the training
/// scores.
pub struct IsolationForest {
    params: IsolationForestParams,
    trees: Vec<Node>,
    sample_size: usize,
    training_scores: Array1<f64>,
    offset: f64,
}

impl IsolationForest {
    pub fn fit(x: ArrayView2<f64>, params: IsolationForestParams) -> Result<Self> {
        let n_rows = x.nrows();
        if n_rows == 0 || x.ncols() == 0 {
            return Err(FilterError::Data(
                "isolation forest needs at least one row and one column".into(),
            ));
        }
        if !(params.contamination > 0.0 && params.contamination <= 0.5) {
            return Err(FilterError::Data(format!(
                "contamination must be in (0, 0.5], got {}",
                params.contamination
            )));
        }

        let sample_size = cmp::min(params.max_samples, n_rows);
        let height_limit = (cmp::max(sample_size, 2) as f64).log2().ceil() as usize;

        // One seed per tree so the forest is identical however rayon schedules it.
        let mut rng = StdRng::seed_from_u64(params.random_state);
        let seeds: Vec<u64> = (0..params.n_estimators).map(|_| rng.gen()).collect();
        let trees: Vec<Node> = seeds
            .par_iter()
            .map(|&seed| {
                let mut tree_rng = StdRng::seed_from_u64(seed);
                let sampled = index::sample(&mut tree_rng, n_rows, sample_size).into_vec();
                Self::build_tree(x, &sampled, 0, height_limit, &mut tree_rng)
            })
            .collect();

        let mut forest = IsolationForest {
            params,
            trees,
            sample_size,
            training_scores: Array1::zeros(0),
            offset: 0.0,
        };
        forest.training_scores = forest.score_samples(x);
        forest.offset = forest.threshold_for(forest.params.contamination);
        tracing::trace!(
            trees = forest.trees.len(),
            sample_size,
            offset = forest.offset,
            "isolation forest fitted"
        );
        Ok(forest)
    }

    fn build_tree(
        data: ArrayView2<f64>,
        rows: &[usize],
        height: usize,
        height_limit: usize,
        rng: &mut StdRng,
    ) -> Node {
        let size = rows.len();

        // Stop criteria
        if size <= 1 || height >= height_limit {
            return Node::leaf(size);
        }

        // Only features that still vary inside this node can split it.
        let ranges: Vec<(usize, f64, f64)> = (0..data.ncols())
            .filter_map(|feature| {
                let mut min_val = data[[rows[0], feature]];
                let mut max_val = min_val;
                for &row in rows {
                    let val = data[[row, feature]];
                    min_val = min_val.min(val);
                    max_val = max_val.max(val);
                }
                if (max_val - min_val).abs() < 1e-10 {
                    None
                } else {
                    Some((feature, min_val, max_val))
                }
            })
            .collect();

        let (split_feature, min_val, max_val) = match ranges.choose(rng) {
            Some(&range) => range,
            None => return Node::leaf(size),
        };
        let split_value = rng.gen_range(min_val..max_val);

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .partition(|&&row| data[[row, split_feature]] < split_value);

        // Only split if we actually divided the data
        if left_rows.is_empty() || right_rows.is_empty() {
            return Node::leaf(size);
        }

        Node {
            split_feature: Some(split_feature),
            split_value,
            size,
            left: Some(Box::new(Self::build_tree(
                data,
                &left_rows,
                height + 1,
                height_limit,
                rng,
            ))),
            right: Some(Box::new(Self::build_tree(
                data,
                &right_rows,
                height + 1,
                height_limit,
                rng,
            ))),
        }
    }

    fn path_length(node: &Node, x: ArrayView1<f64>, current_height: usize) -> f64 {
        if node.is_leaf() {
            // Unbuilt subtree below the leaf is estimated from its size.
            return current_height as f64 + Self::average_path_length(node.size);
        }

        if let Some(split_feature) = node.split_feature {
            if x[split_feature] < node.split_value {
                if let Some(ref left) = node.left {
                    return Self::path_length(left, x, current_height + 1);
                }
            } else if let Some(ref right) = node.right {
                return Self::path_length(right, x, current_height + 1);
            }
        }

        current_height as f64
    }

    /// Average unsuccessful-search path length in a binary search tree of `n` nodes.
    fn average_path_length(n: usize) -> f64 {
        match n {
            0 | 1 => 0.0,
            2 => 1.0,
            _ => {
                let n = n as f64;
                2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
            }
        }
    }

    fn threshold_for(&self, contamination: f64) -> f64 {
        percentile(
            self.training_scores.as_slice().unwrap_or(&[]),
            100.0 * contamination,
        )
        .unwrap_or(0.0)
    }

    /// Move the decision threshold to a new contamination. With a fixed seed
    /// the trees do not depend on contamination, so this equals a refit.
    pub fn recalibrate(&mut self, contamination: f64) {
        self.params.contamination = contamination;
        self.offset = self.threshold_for(contamination);
    }

    pub fn training_scores(&self) -> &Array1<f64> {
        &self.training_scores
    }

    /// Decision scores of the training rows, negative for outliers.
    pub fn training_decisions(&self) -> Array1<f64> {
        self.training_scores.mapv(|s| s - self.offset)
    }
}

impl BaseModel for IsolationForest {
    fn score_partial(&self, x: ArrayView1<f64>) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }

        // Calculate average path length across all trees
        let total_path_length: f64 = self
            .trees
            .iter()
            .map(|tree| Self::path_length(tree, x, 0))
            .sum();
        let avg_path_length = total_path_length / self.trees.len() as f64;

        // Normalize score
        let expected_path_length = Self::average_path_length(self.sample_size);
        let ratio = if expected_path_length > 0.0 {
            avg_path_length / expected_path_length
        } else {
            1.0
        };
        -(2.0f64.powf(-ratio))
    }

    fn offset(&self) -> f64 {
        self.offset
    }

    fn score_samples(&self, xs: ArrayView2<f64>) -> Array1<f64> {
        let scores: Vec<f64> = (0..xs.nrows())
            .into_par_iter()
            .map(|i| self.score_partial(xs.row(i)))
            .collect();
        Array1::from(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::base_model::{INLIER, OUTLIER};
    use ndarray::Array2;

    fn cloud_with_outlier() -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(7);
        let mut x = Array2::from_shape_fn((200, 2), |_| rng.gen_range(-1.0..1.0));
        x[[0, 0]] = 25.0;
        x[[0, 1]] = -25.0;
        x
    }

    #[test]
    fn isolated_point_scores_lowest() {
        let x = cloud_with_outlier();
        let forest = IsolationForest::fit(x.view(), IsolationForestParams::default()).unwrap();
        let scores = forest.training_scores();
        let min_idx = scores
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(min_idx, 0);
        assert!(scores.iter().all(|s| *s < 0.0 && *s >= -1.0));
    }

    #[test]
    fn predicted_outlier_share_follows_contamination() {
        let x = cloud_with_outlier();
        let mut forest = IsolationForest::fit(x.view(), IsolationForestParams::default()).unwrap();
        let labels = forest.predict(x.view());
        let outliers = labels.iter().filter(|&&l| l == OUTLIER).count();
        assert!((15..=25).contains(&outliers), "{} outliers", outliers);
        assert_eq!(labels[0], OUTLIER);

        forest.recalibrate(0.02);
        let outliers = forest
            .predict(x.view())
            .iter()
            .filter(|&&l| l == OUTLIER)
            .count();
        assert!(outliers <= 5);
    }

    #[test]
    fn fitting_is_deterministic_for_a_seed() {
        let x = cloud_with_outlier();
        let a = IsolationForest::fit(x.view(), IsolationForestParams::default()).unwrap();
        let b = IsolationForest::fit(x.view(), IsolationForestParams::default()).unwrap();
        assert_eq!(a.training_scores(), b.training_scores());
        assert_eq!(a.offset(), b.offset());
    }

    #[test]
    fn constant_data_grows_single_leaf_trees() {
        let x = Array2::<f64>::zeros((50, 3));
        let forest = IsolationForest::fit(x.view(), IsolationForestParams::default()).unwrap();
        let scores = forest.training_scores();
        assert!(scores.iter().all(|s| (*s + 0.5).abs() < 1e-12));
        assert!(forest.predict(x.view()).iter().all(|&l| l == INLIER));
    }
}
