use dataset_filter::{ContaminationEstimator, FilterError, NumericTable};
use ndarray::Array2;
use rand::prelude::*;

fn shifted_cluster(n: usize, outliers: usize) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(7);
    Array2::from_shape_fn((n, 3), |(i, _)| {
        if i < outliers {
            rng.gen_range(5.0..7.0)
        } else {
            rng.gen_range(-1.0..1.0)
        }
    })
}

#[test]
fn first_minimum_elbow_lands_in_the_cluster_tail() {
    let x = shifted_cluster(1000, 50);
    let table = NumericTable::from_columns(vec![
        ("a", x.column(0).to_vec()),
        ("b", x.column(1).to_vec()),
        ("c", x.column(2).to_vec()),
    ])
    .unwrap();

    let estimator = ContaminationEstimator::default();
    let report = estimator.estimate_report(&table).unwrap();
    assert_eq!(report.features, vec!["a", "b", "c"]);
    assert_eq!(report.rows, 1000);

    // The first local minimum of the second derivative sits among the
    // shifted rows, before the knee at the cluster boundary.
    let elbow = report.elbow_index.unwrap();
    assert!(elbow < 50, "elbow at {}", elbow);
    assert_eq!(report.elbow_estimate, elbow as f64 / 1000.0);

    // So the refine window stays below the true fraction.
    let window = estimator.refine_window(report.elbow_estimate);
    let scanned: Vec<f64> = report.candidates.iter().map(|c| c.contamination).collect();
    assert_eq!(scanned, window);
    assert!(window.iter().all(|c| *c < 0.075));

    // The answer is the first best-scoring grid point.
    let best = report
        .candidates
        .iter()
        .filter_map(|c| c.silhouette)
        .fold(f64::NEG_INFINITY, f64::max);
    let winner = report
        .candidates
        .iter()
        .find(|c| c.silhouette == Some(best))
        .unwrap();
    assert_eq!(winner.contamination, report.contamination);
}

#[test]
fn estimate_is_deterministic() {
    let x = shifted_cluster(400, 20);
    let estimator = ContaminationEstimator::default();
    let first = estimator.estimate_matrix(x.view()).unwrap();
    let second = estimator.estimate_matrix(x.view()).unwrap();
    assert_eq!(first.to_bits(), second.to_bits());
}

#[test]
fn constant_table_still_yields_a_value() {
    let table = NumericTable::from_columns(vec![("a", vec![3.0; 40]), ("b", vec![-1.0; 40])]).unwrap();
    let c = ContaminationEstimator::default().estimate(&table).unwrap();
    assert!(c > 0.0 && c <= 0.2, "contamination {}", c);
}

#[test]
fn text_only_table_is_a_data_error() {
    let table = NumericTable::from_csv(b"name,city\nann,rome\nbob,oslo\n").unwrap();
    let err = ContaminationEstimator::default().estimate(&table).unwrap_err();
    assert!(matches!(err, FilterError::Data(ref m) if m.contains("No numeric columns")));
}

#[test]
fn table_without_complete_rows_is_a_data_error() {
    let table = NumericTable::from_csv(b"a,b\n1,\n,2\nNA,3\n").unwrap();
    let err = ContaminationEstimator::default().estimate(&table).unwrap_err();
    assert!(matches!(err, FilterError::Data(ref m) if m.contains("No valid data rows")));
}

#[test]
fn text_columns_are_ignored() {
    let mut csv = String::from("id,label,value\n");
    for i in 0..80 {
        csv.push_str(&format!("{},row{},{}\n", i, i, (i * 37 % 23) as f64 / 4.0));
    }
    csv.push_str("80,odd,500\n");
    let table = NumericTable::from_csv(csv.as_bytes()).unwrap();
    let report = ContaminationEstimator::default().estimate_report(&table).unwrap();
    assert_eq!(report.features, vec!["id", "value"]);
    assert!(report.contamination > 0.0 && report.contamination <= 0.2);
}
