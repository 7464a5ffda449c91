use std::fs;
use std::sync::Arc;

use dataset_filter::necessity::{rank_candidates, FeatureImportance, ModelKey};
use dataset_filter::store::{DatasetRecord, Manifest, ModelRecord};
use dataset_filter::{DatasetStore, DirectoryStore, FilterError, NecessityScorer, NumericTable};
use rand::prelude::*;

fn linear_table(n: usize) -> NumericTable {
    let mut rng = StdRng::seed_from_u64(11);
    let a: Vec<f64> = (0..n).map(|_| rng.gen_range(-2.0..2.0)).collect();
    let b: Vec<f64> = (0..n).map(|_| rng.gen_range(-2.0..2.0)).collect();
    let y: Vec<f64> = a
        .iter()
        .map(|a| 3.0 * a + rng.gen_range(-0.2..0.2))
        .collect();
    NumericTable::from_columns(vec![("A", a), ("B", b), ("y", y)]).unwrap()
}

fn features() -> Vec<String> {
    vec!["A".into(), "B".into()]
}

#[test]
fn driving_feature_outweighs_noise() {
    let scorer = NecessityScorer::default();
    let importance = scorer
        .compute_importance(&ModelKey::new("alice", 1), &linear_table(300), "y", &features())
        .unwrap();
    let a = importance.get("A").unwrap();
    let b = importance.get("B").unwrap();
    assert!(a > b, "A {} vs B {}", a, b);
    assert!(a > 0.8);
    let total: f64 = importance.iter().map(|(_, w)| w).sum();
    assert!((total - 1.0).abs() < 1e-9);
}

#[test]
fn repeated_requests_hit_the_cache() {
    let scorer = NecessityScorer::default();
    let key = ModelKey::new("alice", 2);
    let table = linear_table(120);
    let first = scorer.compute_importance(&key, &table, "y", &features()).unwrap();
    let second = scorer.compute_importance(&key, &table, "y", &features()).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    for (x, y) in first.iter().zip(second.iter()) {
        assert_eq!(x.1.to_bits(), y.1.to_bits());
    }
    assert_eq!(scorer.fits(), 1);
}

#[test]
fn target_listed_as_feature_is_dropped() {
    let scorer = NecessityScorer::default();
    let mut declared = features();
    declared.push("y".into());
    let importance = scorer
        .compute_importance(&ModelKey::new("alice", 3), &linear_table(120), "y", &declared)
        .unwrap();
    assert_eq!(importance.len(), 2);
    assert!(importance.get("y").is_none());
}

#[test]
fn missing_target_leaves_no_cache_entry() {
    let scorer = NecessityScorer::default();
    let key = ModelKey::new("alice", 4);
    let err = scorer
        .compute_importance(&key, &linear_table(50), "price", &features())
        .unwrap_err();
    assert!(matches!(err, FilterError::Data(_)));
    assert!(!scorer.cache().contains(&key));
    assert_eq!(scorer.fits(), 0);
}

#[test]
fn constant_target_is_degenerate() {
    let table = NumericTable::from_columns(vec![
        ("A", (0..40).map(f64::from).collect()),
        ("y", vec![2.0; 40]),
    ])
    .unwrap();
    let scorer = NecessityScorer::default();
    let key = ModelKey::new("alice", 5);
    let err = scorer
        .compute_importance(&key, &table, "y", &["A".to_string()])
        .unwrap_err();
    assert!(matches!(err, FilterError::DegenerateModel(_)));
    assert!(!scorer.cache().contains(&key));
}

#[test]
fn ranking_covers_every_candidate() {
    let importance = FeatureImportance::from_magnitudes(&features(), &[3.0, 1.0]).unwrap();
    let empty: Vec<(u32, &NumericTable)> = Vec::new();
    assert!(rank_candidates(&importance, empty).is_empty());

    let both = NumericTable::from_csv(b"A,B\n1,2\n").unwrap();
    let only_b = NumericTable::from_csv(b"B,C\n1,2\n").unwrap();
    let neither = NumericTable::from_csv(b"C\n1\n").unwrap();
    let ranking = rank_candidates(&importance, vec![(1, &neither), (2, &only_b), (3, &both)]);
    assert_eq!(ranking.len(), 3);
    assert!(ranking.iter().all(|c| c.score >= 0.0));
    let ids: Vec<u32> = ranking.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![3, 2, 1]);
}

fn write_csv(store: &DirectoryStore, name: &str, table: &str) {
    fs::write(store.data_path(name), table).unwrap();
}

fn training_csv() -> String {
    let mut rng = StdRng::seed_from_u64(5);
    let mut csv = String::from("A,B,y\n");
    for _ in 0..150 {
        let a: f64 = rng.gen_range(-2.0..2.0);
        let b: f64 = rng.gen_range(-2.0..2.0);
        let y = 3.0 * a + rng.gen_range(-0.2..0.2);
        csv.push_str(&format!("{},{},{}\n", a, b, y));
    }
    csv
}

fn dataset(id: u64, owner: &str, public: bool, file_name: &str) -> DatasetRecord {
    DatasetRecord {
        id,
        name: format!("set-{}", id),
        owner: owner.into(),
        file_name: file_name.into(),
        is_public: public,
        contamination: None,
    }
}

#[test]
fn visible_datasets_are_ranked_and_importance_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = Manifest {
        datasets: vec![
            dataset(1, "alice", false, "b_only.csv"),
            dataset(2, "bob", true, "a_and_b.csv"),
            dataset(3, "bob", false, "hidden.csv"),
            dataset(4, "alice", false, "broken.xlsx"),
        ],
        models: vec![ModelRecord {
            id: 9,
            name: "price".into(),
            owner: "alice".into(),
            training_file: "train.csv".into(),
            target_field: "y".into(),
            columns: vec!["A".into(), "B".into(), "y".into()],
        }],
        necessity_scores: Vec::new(),
    };
    let store = DirectoryStore::create(dir.path(), manifest).unwrap();
    write_csv(&store, "train.csv", &training_csv());
    write_csv(&store, "b_only.csv", "B\n1\n2\n");
    write_csv(&store, "a_and_b.csv", "A,B\n1,2\n");
    write_csv(&store, "hidden.csv", "A\n1\n");
    write_csv(&store, "broken.xlsx", "not a workbook");

    let scorer = NecessityScorer::default();
    let ranking = scorer.rank_visible_datasets(&store, "alice", 9).unwrap();
    let ids: Vec<u64> = ranking.iter().map(|c| c.id).collect();
    // hidden is not visible to alice, broken does not decode
    assert_eq!(ids, vec![2, 1]);
    assert!((ranking.iter().next().unwrap().score - 1.0).abs() < 1e-9);
    assert_eq!(scorer.fits(), 1);

    let key = ModelKey::new("alice", 9);
    let stored = store.load_importance(&key).unwrap().unwrap();
    assert_eq!(&stored, scorer.cache().get(&key).unwrap().as_ref());

    // A fresh scorer reads the persisted weights instead of refitting.
    let reopened = DirectoryStore::open(dir.path()).unwrap();
    let fresh = NecessityScorer::default();
    let again = fresh.rank_visible_datasets(&reopened, "alice", 9).unwrap();
    assert_eq!(fresh.fits(), 0);
    assert_eq!(again, ranking);
}

#[test]
fn unknown_model_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirectoryStore::create(dir.path(), Manifest::default()).unwrap();
    let err = NecessityScorer::default()
        .rank_visible_datasets(&store, "alice", 1)
        .unwrap_err();
    assert!(matches!(err, FilterError::NotFound(_)));
}
