//! Exact additive feature attribution for tree ensembles.
//!
//! Path-dependent tree SHAP: a row's prediction splits into a baseline (the
//! ensemble's mean training output) plus one contribution per feature. Branches
//! the row does not take are weighted by their training cover.

use ndarray::{Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;

use crate::models::gbrt::{GradientBoostedRegressor, RegressionTree, TreeNode};

/// Per-row, per-feature contributions and the shared baseline.
#[derive(Debug, Clone)]
pub struct Attribution {
    pub values: Array2<f64>,
    pub baseline: f64,
}

impl Attribution {
    /// Mean absolute contribution of every feature.
    pub fn mean_abs(&self) -> Vec<f64> {
        let n = self.values.nrows().max(1) as f64;
        self.values
            .columns()
            .into_iter()
            .map(|col| col.iter().map(|v| v.abs()).sum::<f64>() / n)
            .collect()
    }
}

pub fn explain(model: &GradientBoostedRegressor, x: ArrayView2<f64>) -> Attribution {
    let n_features = model.n_features();
    let rows: Vec<Vec<f64>> = (0..x.nrows())
        .into_par_iter()
        .map(|i| {
            let mut phi = vec![0.0; n_features];
            for tree in model.trees() {
                tree_shap(tree, x.row(i), &mut phi);
            }
            phi
        })
        .collect();

    let mut values = Array2::zeros((x.nrows(), n_features));
    for (i, phi) in rows.into_iter().enumerate() {
        for (j, v) in phi.into_iter().enumerate() {
            values[[i, j]] = v;
        }
    }
    let baseline = model.base_score()
        + model
            .trees()
            .iter()
            .map(RegressionTree::expected_value)
            .sum::<f64>();
    Attribution { values, baseline }
}

#[derive(Debug, Clone, Copy)]
struct PathElement {
    feature: Option<usize>,
    zero_fraction: f64,
    one_fraction: f64,
    pweight: f64,
}

/// Add the contributions of one tree for row `x` into `phi`.
pub fn tree_shap(tree: &RegressionTree, x: ArrayView1<f64>, phi: &mut [f64]) {
    let nodes = tree.nodes();
    if nodes.is_empty() || nodes[0].cover <= 0.0 {
        return;
    }
    recurse(nodes, 0, x, phi, &[], 1.0, 1.0, None);
}

#[allow(clippy::too_many_arguments)]
fn recurse(
    nodes: &[TreeNode],
    node_index: usize,
    x: ArrayView1<f64>,
    phi: &mut [f64],
    parent_path: &[PathElement],
    parent_zero_fraction: f64,
    parent_one_fraction: f64,
    parent_feature: Option<usize>,
) {
    let mut path = parent_path.to_vec();
    extend_path(&mut path, parent_zero_fraction, parent_one_fraction, parent_feature);

    let node = &nodes[node_index];
    let split = match node.feature {
        Some(split) => split,
        None => {
            for i in 1..path.len() {
                let weight = unwound_path_sum(&path, i);
                let el = path[i];
                if let Some(feature) = el.feature {
                    phi[feature] += weight * (el.one_fraction - el.zero_fraction) * node.value;
                }
            }
            return;
        }
    };

    let (hot, cold) = if x[split] < node.threshold {
        (node.left, node.right)
    } else {
        (node.right, node.left)
    };
    let hot_zero_fraction = nodes[hot].cover / node.cover;
    let cold_zero_fraction = nodes[cold].cover / node.cover;

    // A feature seen higher up is undone and redone here.
    let mut incoming_zero_fraction = 1.0;
    let mut incoming_one_fraction = 1.0;
    if let Some(k) = path.iter().position(|e| e.feature == Some(split)) {
        incoming_zero_fraction = path[k].zero_fraction;
        incoming_one_fraction = path[k].one_fraction;
        unwind_path(&mut path, k);
    }

    recurse(
        nodes,
        hot,
        x,
        phi,
        &path,
        hot_zero_fraction * incoming_zero_fraction,
        incoming_one_fraction,
        Some(split),
    );
    recurse(
        nodes,
        cold,
        x,
        phi,
        &path,
        cold_zero_fraction * incoming_zero_fraction,
        0.0,
        Some(split),
    );
}

fn extend_path(
    path: &mut Vec<PathElement>,
    zero_fraction: f64,
    one_fraction: f64,
    feature: Option<usize>,
) {
    let depth = path.len();
    path.push(PathElement {
        feature,
        zero_fraction,
        one_fraction,
        pweight: if depth == 0 { 1.0 } else { 0.0 },
    });
    let denom = (depth + 1) as f64;
    for i in (0..depth).rev() {
        path[i + 1].pweight += one_fraction * path[i].pweight * (i + 1) as f64 / denom;
        path[i].pweight = zero_fraction * path[i].pweight * (depth - i) as f64 / denom;
    }
}

fn unwind_path(path: &mut Vec<PathElement>, path_index: usize) {
    let depth = path.len() - 1;
    let one_fraction = path[path_index].one_fraction;
    let zero_fraction = path[path_index].zero_fraction;
    let denom = (depth + 1) as f64;
    let mut next_one_portion = path[depth].pweight;

    for i in (0..depth).rev() {
        if one_fraction != 0.0 {
            let tmp = path[i].pweight;
            path[i].pweight = next_one_portion * denom / ((i + 1) as f64 * one_fraction);
            next_one_portion = tmp - path[i].pweight * zero_fraction * (depth - i) as f64 / denom;
        } else {
            path[i].pweight = path[i].pweight * denom / (zero_fraction * (depth - i) as f64);
        }
    }
    for i in path_index..depth {
        path[i].feature = path[i + 1].feature;
        path[i].zero_fraction = path[i + 1].zero_fraction;
        path[i].one_fraction = path[i + 1].one_fraction;
    }
    path.pop();
}

fn unwound_path_sum(path: &[PathElement], path_index: usize) -> f64 {
    let depth = path.len() - 1;
    let one_fraction = path[path_index].one_fraction;
    let zero_fraction = path[path_index].zero_fraction;
    let denom = (depth + 1) as f64;
    let mut next_one_portion = path[depth].pweight;
    let mut total = 0.0;

    for i in (0..depth).rev() {
        if one_fraction != 0.0 {
            let tmp = next_one_portion * denom / ((i + 1) as f64 * one_fraction);
            total += tmp;
            next_one_portion = path[i].pweight - tmp * zero_fraction * ((depth - i) as f64 / denom);
        } else if zero_fraction != 0.0 {
            total += (path[i].pweight / zero_fraction) / ((depth - i) as f64 / denom);
        }
    }
    total
}
