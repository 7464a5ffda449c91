use std::collections::BTreeMap;

use ndarray::{ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

use crate::error::{FilterError, Result};

/// Mean silhouette coefficient over every row, euclidean distance.
///
/// Rows in a singleton cluster score 0. Needs at least two distinct labels and
/// fewer labels than rows.
pub fn silhouette_score(x: ArrayView2<f64>, labels: &[i32]) -> Result<f64> {
    let n = x.nrows();
    if labels.len() != n {
        return Err(FilterError::Data(format!(
            "silhouette: {} labels for {} rows",
            labels.len(),
            n
        )));
    }

    // Dense cluster ids in label order.
    let mut cluster_of: BTreeMap<i32, usize> = BTreeMap::new();
    for &label in labels {
        let next = cluster_of.len();
        cluster_of.entry(label).or_insert(next);
    }
    let n_clusters = cluster_of.len();
    if n_clusters < 2 || n_clusters >= n {
        return Err(FilterError::Data(format!(
            "silhouette needs 2 <= n_labels <= n_rows - 1, got {} labels for {} rows",
            n_clusters, n
        )));
    }
    let assigned: Vec<usize> = labels.iter().map(|l| cluster_of[l]).collect();
    let mut sizes = vec![0usize; n_clusters];
    for &c in &assigned {
        sizes[c] += 1;
    }

    // Collected before summing so the total does not depend on thread scheduling.
    let per_row: Vec<f64> = (0..n)
        .into_par_iter()
        .map(|i| {
            let own = assigned[i];
            if sizes[own] <= 1 {
                return 0.0;
            }
            let row = x.row(i);
            let mut sums = vec![0.0; n_clusters];
            for (j, other) in x.axis_iter(Axis(0)).enumerate() {
                if i != j {
                    sums[assigned[j]] += euclidean_distance(row, other);
                }
            }
            let a = sums[own] / (sizes[own] - 1) as f64;
            let b = (0..n_clusters)
                .filter(|&c| c != own)
                .map(|c| sums[c] / sizes[c] as f64)
                .fold(f64::INFINITY, f64::min);
            let denom = a.max(b);
            if denom > 0.0 {
                (b - a) / denom
            } else {
                0.0
            }
        })
        .collect();

    Ok(per_row.iter().sum::<f64>() / n as f64)
}

fn euclidean_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// `q`-th percentile (0..=100) with linear interpolation between order
/// statistics. `values` need not be sorted.
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * frac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn silhouette_of_hand_computed_layout() {
        // 1-D points 0, 1 | 5; cluster A = {0, 1}, B = {5}
        // s(0) = (5 - 1) / 5, s(1) = (4 - 1) / 4, s(5) = 0 (singleton)
        let x = array![[0.0], [1.0], [5.0]];
        let score = silhouette_score(x.view(), &[1, 1, -1]).unwrap();
        let expected = (0.8 + 0.75 + 0.0) / 3.0;
        assert!((score - expected).abs() < 1e-12);
    }

    #[test]
    fn well_separated_clusters_score_near_one() {
        let x = array![[0.0, 0.0], [0.1, 0.0], [0.0, 0.1], [10.0, 10.0], [10.1, 10.0]];
        let score = silhouette_score(x.view(), &[0, 0, 0, 1, 1]).unwrap();
        assert!(score > 0.95);
    }

    #[test]
    fn single_label_is_rejected() {
        let x = array![[0.0], [1.0]];
        assert!(silhouette_score(x.view(), &[1, 1]).is_err());
    }

    #[test]
    fn percentile_interpolates() {
        let values = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(percentile(&values, 0.0), Some(1.0));
        assert_eq!(percentile(&values, 100.0), Some(4.0));
        assert!((percentile(&values, 10.0).unwrap() - 1.3).abs() < 1e-12);
        assert_eq!(percentile(&[], 50.0), None);
    }
}
