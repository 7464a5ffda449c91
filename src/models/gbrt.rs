use ndarray::{Array1, ArrayView1, ArrayView2};
use rayon::prelude::*;

use crate::config::NecessityConfig;
use crate::error::{FilterError, Result};

#[derive(Debug, Clone)]
pub struct GbrtParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub lambda: f64,
    pub min_child_weight: f64,
}

impl Default for GbrtParams {
    fn default() -> Self {
        GbrtParams::from(&NecessityConfig::default())
    }
}

impl From<&NecessityConfig> for GbrtParams {
    fn from(config: &NecessityConfig) -> Self {
        GbrtParams {
            n_estimators: config.n_estimators,
            max_depth: config.max_depth,
            learning_rate: config.learning_rate,
            lambda: config.lambda,
            min_child_weight: config.min_child_weight,
        }
    }
}

/// Node of a regression tree stored in a flat arena. `cover` is the number of
/// training rows that reached the node; attribution weighs branches by it.
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub feature: Option<usize>,
    pub threshold: f64,
    pub left: usize,
    pub right: usize,
    /// Leaf output, already shrunk by the learning rate.
    pub value: f64,
    pub cover: f64,
}

impl TreeNode {
    fn leaf(value: f64, cover: f64) -> Self {
        TreeNode {
            feature: None,
            threshold: 0.0,
            left: 0,
            right: 0,
            value,
            cover,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.feature.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct RegressionTree {
    nodes: Vec<TreeNode>,
}

impl RegressionTree {
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn predict_row(&self, x: ArrayView1<f64>) -> f64 {
        let mut idx = 0;
        loop {
            let node = &self.nodes[idx];
            match node.feature {
                None => return node.value,
                Some(feature) => {
                    idx = if x[feature] < node.threshold {
                        node.left
                    } else {
                        node.right
                    };
                }
            }
        }
    }

    /// Mean output over the training rows, i.e. cover-weighted leaf values.
    pub fn expected_value(&self) -> f64 {
        let root_cover = self.nodes[0].cover;
        if root_cover <= 0.0 {
            return 0.0;
        }
        self.nodes
            .iter()
            .filter(|n| n.is_leaf())
            .map(|n| n.value * n.cover / root_cover)
            .sum()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[TreeNode], idx: usize) -> usize {
            let node = &nodes[idx];
            if node.is_leaf() {
                0
            } else {
                1 + walk(nodes, node.left).max(walk(nodes, node.right))
            }
        }
        walk(&self.nodes, 0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Split {
    feature: usize,
    threshold: f64,
    gain: f64,
}

// The view keeps the caller's lifetime; gradients and params live per round.
struct TreeBuilder<'x, 'g> {
    x: ArrayView2<'x, f64>,
    grad: &'g [f64],
    params: &'g GbrtParams,
    nodes: Vec<TreeNode>,
}

impl<'x, 'g> TreeBuilder<'x, 'g> {
    fn grow(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        // Squared error: unit hessian per row.
        let g: f64 = rows.iter().map(|&r| self.grad[r]).sum();
        let h = rows.len() as f64;
        let idx = self.nodes.len();
        let weight = -g / (h + self.params.lambda);
        self.nodes
            .push(TreeNode::leaf(weight * self.params.learning_rate, h));

        if depth >= self.params.max_depth || rows.len() < 2 {
            return idx;
        }
        let split = match self.best_split(&rows, g, h) {
            Some(split) => split,
            None => return idx,
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .partition(|&&r| self.x[[r, split.feature]] < split.threshold);
        if left_rows.is_empty() || right_rows.is_empty() {
            return idx;
        }

        let left = self.grow(left_rows, depth + 1);
        let right = self.grow(right_rows, depth + 1);
        let node = &mut self.nodes[idx];
        node.feature = Some(split.feature);
        node.threshold = split.threshold;
        node.left = left;
        node.right = right;
        idx
    }

    /// Exact greedy search over every feature, in parallel. Ties go to the
    /// lower feature index, then the lower threshold.
    fn best_split(&self, rows: &[usize], g: f64, h: f64) -> Option<Split> {
        let lambda = self.params.lambda;
        let min_child = self.params.min_child_weight;
        let parent_score = g * g / (h + lambda);

        (0..self.x.ncols())
            .into_par_iter()
            .filter_map(|feature| {
                let mut ordered: Vec<(f64, f64)> = rows
                    .iter()
                    .map(|&r| (self.x[[r, feature]], self.grad[r]))
                    .collect();
                ordered.sort_by(|a, b| a.0.total_cmp(&b.0));

                let mut best: Option<Split> = None;
                let mut g_left = 0.0;
                let mut h_left = 0.0;
                for i in 0..ordered.len() - 1 {
                    g_left += ordered[i].1;
                    h_left += 1.0;
                    if ordered[i].0 == ordered[i + 1].0 {
                        continue;
                    }
                    let g_right = g - g_left;
                    let h_right = h - h_left;
                    if h_left < min_child || h_right < min_child {
                        continue;
                    }
                    let gain = g_left * g_left / (h_left + lambda)
                        + g_right * g_right / (h_right + lambda)
                        - parent_score;
                    if best.map_or(true, |b| gain > b.gain) {
                        best = Some(Split {
                            feature,
                            threshold: 0.5 * (ordered[i].0 + ordered[i + 1].0),
                            gain,
                        });
                    }
                }
                best
            })
            .reduce_with(|a, b| {
                if b.gain > a.gain || (b.gain == a.gain && b.feature < a.feature) {
                    b
                } else {
                    a
                }
            })
            .filter(|s| s.gain > 1e-12 * (1.0 + parent_score))
    }
}

/// Gradient-boosted regression trees on squared error with L2-regularized
/// leaf weights.
#[derive(Debug, Clone)]
pub struct GradientBoostedRegressor {
    base_score: f64,
    trees: Vec<RegressionTree>,
    n_features: usize,
}

impl GradientBoostedRegressor {
    pub fn fit(x: ArrayView2<f64>, y: ArrayView1<f64>, params: GbrtParams) -> Result<Self> {
        if x.nrows() == 0 || x.ncols() == 0 {
            return Err(FilterError::Data(
                "boosting needs at least one training row and one feature".into(),
            ));
        }
        if x.nrows() != y.len() {
            return Err(FilterError::Data(format!(
                "{} feature rows but {} targets",
                x.nrows(),
                y.len()
            )));
        }

        let base_score = y.mean().unwrap_or(0.0);
        let mut predictions = Array1::from_elem(y.len(), base_score);
        let mut trees = Vec::with_capacity(params.n_estimators);

        for round in 0..params.n_estimators {
            let grad: Vec<f64> = predictions
                .iter()
                .zip(y.iter())
                .map(|(p, t)| p - t)
                .collect();
            let mut builder = TreeBuilder {
                x,
                grad: &grad,
                params: &params,
                nodes: Vec::new(),
            };
            builder.grow((0..x.nrows()).collect(), 0);
            let tree = RegressionTree {
                nodes: builder.nodes,
            };

            for (i, pred) in predictions.iter_mut().enumerate() {
                *pred += tree.predict_row(x.row(i));
            }
            tracing::trace!(round, nodes = tree.nodes.len(), "boosting round");
            trees.push(tree);
        }

        Ok(GradientBoostedRegressor {
            base_score,
            trees,
            n_features: x.ncols(),
        })
    }

    pub fn predict_row(&self, x: ArrayView1<f64>) -> f64 {
        self.base_score + self.trees.iter().map(|t| t.predict_row(x)).sum::<f64>()
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Array1<f64> {
        x.rows().into_iter().map(|row| self.predict_row(row)).collect()
    }

    pub fn base_score(&self) -> f64 {
        self.base_score
    }

    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn fits_a_step_function() {
        let x = Array2::from_shape_fn((40, 1), |(i, _)| i as f64);
        let y = x.column(0).mapv(|v| if v < 20.0 { 1.0 } else { 5.0 });
        let model = GradientBoostedRegressor::fit(x.view(), y.view(), GbrtParams::default()).unwrap();
        let preds = model.predict(x.view());
        for (p, t) in preds.iter().zip(y.iter()) {
            assert!((p - t).abs() < 0.05, "{} vs {}", p, t);
        }
        assert_eq!(model.trees()[0].nodes()[0].feature, Some(0));
        assert_eq!(model.trees()[0].nodes()[0].threshold, 19.5);
    }

    #[test]
    fn trees_respect_max_depth() {
        let x = Array2::from_shape_fn((64, 2), |(i, j)| ((i * 7 + j * 13) % 17) as f64);
        let y = x.column(0).mapv(|v| v.sin()) + x.column(1);
        let params = GbrtParams {
            max_depth: 2,
            n_estimators: 5,
            ..GbrtParams::default()
        };
        let model = GradientBoostedRegressor::fit(x.view(), y.view(), params).unwrap();
        assert!(model.trees().iter().all(|t| t.depth() <= 2));
    }

    #[test]
    fn constant_target_grows_no_splits() {
        let x = array![[1.0, 2.0], [2.0, 1.0], [3.0, 0.0]];
        let y = array![4.0, 4.0, 4.0];
        let model = GradientBoostedRegressor::fit(x.view(), y.view(), GbrtParams::default()).unwrap();
        assert_eq!(model.base_score(), 4.0);
        assert!(model.trees().iter().all(|t| t.nodes().len() == 1));
        assert_eq!(model.predict_row(x.row(0)), 4.0);
    }

    #[test]
    fn expected_value_matches_mean_training_output() {
        let x = Array2::from_shape_fn((30, 2), |(i, j)| (i * (j + 1)) as f64);
        let y = x.column(0).mapv(|v| v * 0.5);
        let model = GradientBoostedRegressor::fit(x.view(), y.view(), GbrtParams::default()).unwrap();
        let tree = &model.trees()[0];
        let mean: f64 = x.rows().into_iter().map(|r| tree.predict_row(r)).sum::<f64>() / 30.0;
        assert!((tree.expected_value() - mean).abs() < 1e-9);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let x = array![[1.0], [2.0]];
        let y = array![1.0];
        assert!(GradientBoostedRegressor::fit(x.view(), y.view(), GbrtParams::default()).is_err());
    }
}
