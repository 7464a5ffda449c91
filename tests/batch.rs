use std::fs;

use dataset_filter::batch::STATUS_FILE;
use dataset_filter::store::{DatasetRecord, Manifest};
use dataset_filter::{
    BatchDriver, BatchStatus, ContaminationEstimator, DatasetStore, DirectoryStore, StatusReporter,
};

fn record(id: u64, file_name: &str, contamination: Option<f64>) -> DatasetRecord {
    DatasetRecord {
        id,
        name: format!("upload-{}", id),
        owner: "alice".into(),
        file_name: file_name.into(),
        is_public: true,
        contamination,
    }
}

fn numeric_csv(seed: usize) -> String {
    let mut csv = String::from("x,y\n");
    for i in 0..100 {
        csv.push_str(&format!("{},{}\n", (i * 13 + seed) % 29, (i * 7 + seed) % 31));
    }
    csv.push_str("400,-400\n");
    csv
}

#[test]
fn sweep_scores_good_datasets_and_records_failures() {
    let store_dir = tempfile::tempdir().unwrap();
    let status_dir = tempfile::tempdir().unwrap();
    let store = DirectoryStore::create(
        store_dir.path(),
        Manifest {
            datasets: vec![
                record(1, "one.csv", None),
                record(2, "words.csv", None),
                record(3, "three.csv", None),
                record(4, "done.csv", Some(0.02)),
            ],
            ..Manifest::default()
        },
    )
    .unwrap();
    fs::write(store.data_path("one.csv"), numeric_csv(1)).unwrap();
    fs::write(store.data_path("words.csv"), "a,b\nx,y\nz,w\n").unwrap();
    fs::write(store.data_path("three.csv"), numeric_csv(3)).unwrap();

    let reporter = StatusReporter::with_file(status_dir.path()).unwrap();
    let driver = BatchDriver::new(store, ContaminationEstimator::default());
    let status = driver.run(&reporter).unwrap();

    assert_eq!(status.total_datasets, 3);
    assert_eq!(status.processed_datasets, 2);
    assert_eq!(status.failed_datasets, 1);
    assert!(status.errors[0].starts_with("Error processing Dataset 2: upload-2"));
    assert!(status.start_time.unwrap() <= status.end_time.unwrap());

    let written = BatchStatus::read(&status_dir.path().join(STATUS_FILE)).unwrap();
    assert_eq!(written, status);

    let reopened = DirectoryStore::open(store_dir.path()).unwrap();
    let datasets = reopened.datasets().unwrap();
    assert!(datasets[0].contamination.is_some());
    assert_eq!(datasets[1].contamination, None);
    assert!(datasets[2].contamination.is_some());
    assert_eq!(datasets[3].contamination, Some(0.02));
    let unscored: Vec<u64> = reopened.unscored_datasets().unwrap().iter().map(|d| d.id).collect();
    assert_eq!(unscored, vec![2]);
}

#[test]
fn reset_makes_everything_eligible_again() {
    let store_dir = tempfile::tempdir().unwrap();
    let store = DirectoryStore::create(
        store_dir.path(),
        Manifest {
            datasets: vec![record(1, "one.csv", Some(0.1)), record(2, "two.csv", Some(0.05))],
            ..Manifest::default()
        },
    )
    .unwrap();
    fs::write(store.data_path("one.csv"), numeric_csv(1)).unwrap();
    fs::write(store.data_path("two.csv"), numeric_csv(2)).unwrap();

    let driver = BatchDriver::new(store, ContaminationEstimator::default());
    let idle = driver.run(&StatusReporter::in_memory()).unwrap();
    assert_eq!(idle.total_datasets, 0);

    assert_eq!(driver.store().reset_contamination().unwrap(), 2);
    let status = driver.run(&StatusReporter::in_memory()).unwrap();
    assert_eq!(status.total_datasets, 2);
    assert_eq!(status.processed_datasets, 2);
    assert!(status.errors.is_empty());
}
