//! Storage collaborator: where raw tables come from and where results go.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::contamination::accuracy;
use crate::error::{FilterError, Result};
use crate::necessity::{FeatureImportance, FeatureWeight, ModelKey};
use crate::table::{FileType, NumericTable};

pub type DatasetId = u64;
pub type ModelId = u64;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const DATA_DIR: &str = "data";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub id: DatasetId,
    pub name: String,
    pub owner: String,
    pub file_name: String,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub contamination: Option<f64>,
}

impl DatasetRecord {
    pub fn file_type(&self) -> FileType {
        FileType::from_file_name(&self.file_name)
    }

    pub fn accuracy(&self) -> Option<f64> {
        self.contamination.map(accuracy)
    }

    pub fn label(&self) -> String {
        format!("Dataset {}: {}", self.id, self.name)
    }

    pub fn visible_to(&self, owner: &str) -> bool {
        self.is_public || self.owner == owner
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: ModelId,
    pub name: String,
    pub owner: String,
    pub training_file: String,
    pub target_field: String,
    /// Every column of the training file, target included.
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NecessityScoreRecord {
    pub owner: String,
    pub model_id: ModelId,
    pub feature_name: String,
    pub score: f64,
}

/// Undecoded table bytes plus how to decode them.
#[derive(Debug, Clone)]
pub struct RawDataset {
    pub bytes: Vec<u8>,
    pub file_type: FileType,
}

impl RawDataset {
    pub fn decode(&self) -> Result<NumericTable> {
        NumericTable::decode(&self.bytes, self.file_type)
    }
}

#[derive(Debug, Clone)]
pub struct ModelSource {
    pub raw: RawDataset,
    pub target_field: String,
    pub columns: Vec<String>,
}

impl ModelSource {
    pub fn feature_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| **c != self.target_field)
            .cloned()
            .collect()
    }
}

pub trait DatasetStore: Send + Sync {
    /// Datasets with no contamination value yet.
    fn unscored_datasets(&self) -> Result<Vec<DatasetRecord>>;

    fn load_dataset(&self, id: DatasetId) -> Result<RawDataset>;

    fn save_contamination(&self, id: DatasetId, contamination: f64) -> Result<()>;

    /// Drop any unpersisted change touching `id`.
    fn rollback(&self, id: DatasetId) -> Result<()>;

    /// Clear every contamination value; returns how many datasets exist.
    fn reset_contamination(&self) -> Result<usize>;

    fn load_model(&self, id: ModelId) -> Result<ModelSource>;

    /// Datasets that are public or owned by `owner`.
    fn candidate_datasets(&self, owner: &str) -> Result<Vec<DatasetRecord>>;

    fn load_importance(&self, key: &ModelKey) -> Result<Option<FeatureImportance>>;

    fn save_importance(&self, key: &ModelKey, importance: &FeatureImportance) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub datasets: Vec<DatasetRecord>,
    #[serde(default)]
    pub models: Vec<ModelRecord>,
    #[serde(default)]
    pub necessity_scores: Vec<NecessityScoreRecord>,
}

/// Store backed by a directory: `manifest.json` holds the records and
/// `data/` holds the uploaded files they name.
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    manifest: Mutex<Manifest>,
}

impl DirectoryStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let manifest = Self::read_manifest(&root)?;
        tracing::debug!(
            root = %root.display(),
            datasets = manifest.datasets.len(),
            models = manifest.models.len(),
            "store opened"
        );
        Ok(DirectoryStore {
            root,
            manifest: Mutex::new(manifest),
        })
    }

    /// Create the directory layout and write `manifest`.
    pub fn create(root: impl Into<PathBuf>, manifest: Manifest) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(DATA_DIR))?;
        Self::write_manifest(&root, &manifest)?;
        Ok(DirectoryStore {
            root,
            manifest: Mutex::new(manifest),
        })
    }

    pub fn data_path(&self, file_name: &str) -> PathBuf {
        self.root.join(DATA_DIR).join(file_name)
    }

    pub fn datasets(&self) -> Result<Vec<DatasetRecord>> {
        Ok(self.lock()?.datasets.clone())
    }

    fn read_manifest(root: &Path) -> Result<Manifest> {
        let path = root.join(MANIFEST_FILE);
        let raw = fs::read_to_string(&path)
            .map_err(|e| FilterError::Store(format!("cannot read {}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_manifest(root: &Path, manifest: &Manifest) -> Result<()> {
        let tmp = root.join(format!("{}.tmp", MANIFEST_FILE));
        fs::write(&tmp, serde_json::to_vec_pretty(manifest)?)?;
        fs::rename(&tmp, root.join(MANIFEST_FILE))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Manifest>> {
        self.manifest
            .lock()
            .map_err(|_| FilterError::Store("manifest lock poisoned".into()))
    }

    fn read_file(&self, file_name: &str) -> Result<Vec<u8>> {
        let path = self.data_path(file_name);
        fs::read(&path)
            .map_err(|e| FilterError::Store(format!("cannot read {}: {}", path.display(), e)))
    }
}

impl DatasetStore for DirectoryStore {
    fn unscored_datasets(&self) -> Result<Vec<DatasetRecord>> {
        Ok(self
            .lock()?
            .datasets
            .iter()
            .filter(|d| d.contamination.is_none())
            .cloned()
            .collect())
    }

    fn load_dataset(&self, id: DatasetId) -> Result<RawDataset> {
        let record = self
            .lock()?
            .datasets
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| FilterError::NotFound(format!("Dataset with ID {} not found", id)))?;
        Ok(RawDataset {
            bytes: self.read_file(&record.file_name)?,
            file_type: record.file_type(),
        })
    }

    fn save_contamination(&self, id: DatasetId, contamination: f64) -> Result<()> {
        let mut manifest = self.lock()?;
        let record = manifest
            .datasets
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| FilterError::NotFound(format!("Dataset with ID {} not found", id)))?;
        record.contamination = Some(contamination);
        Self::write_manifest(&self.root, &manifest)
    }

    fn rollback(&self, id: DatasetId) -> Result<()> {
        let on_disk = Self::read_manifest(&self.root)?;
        let mut manifest = self.lock()?;
        let persisted = on_disk.datasets.iter().find(|d| d.id == id).cloned();
        match (manifest.datasets.iter_mut().find(|d| d.id == id), persisted) {
            (Some(current), Some(persisted)) => *current = persisted,
            (Some(current), None) => current.contamination = None,
            _ => {}
        }
        tracing::debug!(dataset = id, "rolled back");
        Ok(())
    }

    fn reset_contamination(&self) -> Result<usize> {
        let mut manifest = self.lock()?;
        for record in manifest.datasets.iter_mut() {
            record.contamination = None;
        }
        Self::write_manifest(&self.root, &manifest)?;
        Ok(manifest.datasets.len())
    }

    fn load_model(&self, id: ModelId) -> Result<ModelSource> {
        let record = self
            .lock()?
            .models
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| FilterError::NotFound(format!("Model with ID {} not found", id)))?;
        Ok(ModelSource {
            raw: RawDataset {
                bytes: self.read_file(&record.training_file)?,
                file_type: FileType::from_file_name(&record.training_file),
            },
            target_field: record.target_field,
            columns: record.columns,
        })
    }

    fn candidate_datasets(&self, owner: &str) -> Result<Vec<DatasetRecord>> {
        Ok(self
            .lock()?
            .datasets
            .iter()
            .filter(|d| d.visible_to(owner))
            .cloned()
            .collect())
    }

    fn load_importance(&self, key: &ModelKey) -> Result<Option<FeatureImportance>> {
        let manifest = self.lock()?;
        let weights: Vec<FeatureWeight> = manifest
            .necessity_scores
            .iter()
            .filter(|s| s.owner == key.owner && s.model_id == key.model)
            .map(|s| FeatureWeight {
                feature: s.feature_name.clone(),
                weight: s.score,
            })
            .collect();
        if weights.is_empty() {
            return Ok(None);
        }
        FeatureImportance::new(weights).map(Some)
    }

    fn save_importance(&self, key: &ModelKey, importance: &FeatureImportance) -> Result<()> {
        let mut manifest = self.lock()?;
        // First writer wins here too.
        if manifest
            .necessity_scores
            .iter()
            .any(|s| s.owner == key.owner && s.model_id == key.model)
        {
            return Ok(());
        }
        manifest
            .necessity_scores
            .extend(importance.iter().map(|(feature, score)| NecessityScoreRecord {
                owner: key.owner.clone(),
                model_id: key.model,
                feature_name: feature.to_string(),
                score,
            }));
        Self::write_manifest(&self.root, &manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: DatasetId, owner: &str, public: bool, contamination: Option<f64>) -> DatasetRecord {
        DatasetRecord {
            id,
            name: format!("set-{}", id),
            owner: owner.into(),
            file_name: format!("{}.csv", id),
            is_public: public,
            contamination,
        }
    }

    fn store_with(datasets: Vec<DatasetRecord>) -> (tempfile::TempDir, DirectoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::create(
            dir.path(),
            Manifest {
                datasets,
                ..Manifest::default()
            },
        )
        .unwrap();
        (dir, store)
    }

    #[test]
    fn contamination_round_trips_through_disk() {
        let (dir, store) = store_with(vec![record(1, "a", false, None), record(2, "a", false, Some(0.1))]);
        assert_eq!(store.unscored_datasets().unwrap().len(), 1);
        store.save_contamination(1, 0.04).unwrap();

        let reopened = DirectoryStore::open(dir.path()).unwrap();
        assert!(reopened.unscored_datasets().unwrap().is_empty());
        let first = &reopened.datasets().unwrap()[0];
        assert_eq!(first.contamination, Some(0.04));
        assert!((first.accuracy().unwrap() - 96.0).abs() < 1e-9);

        assert_eq!(reopened.reset_contamination().unwrap(), 2);
        assert_eq!(reopened.unscored_datasets().unwrap().len(), 2);
    }

    #[test]
    fn candidates_are_public_or_owned() {
        let (_dir, store) = store_with(vec![
            record(1, "alice", false, None),
            record(2, "bob", false, None),
            record(3, "bob", true, None),
        ]);
        let ids: Vec<DatasetId> = store
            .candidate_datasets("alice")
            .unwrap()
            .iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn missing_dataset_is_not_found() {
        let (_dir, store) = store_with(vec![]);
        assert!(matches!(store.load_dataset(5), Err(FilterError::NotFound(_))));
        assert!(matches!(store.save_contamination(5, 0.1), Err(FilterError::NotFound(_))));
    }

    #[test]
    fn importance_is_persisted_once() {
        let (dir, store) = store_with(vec![]);
        let key = ModelKey::new("alice", 7);
        let first = FeatureImportance::from_magnitudes(&["a".into(), "b".into()], &[3.0, 1.0]).unwrap();
        let second = FeatureImportance::from_magnitudes(&["c".into()], &[1.0]).unwrap();
        store.save_importance(&key, &first).unwrap();
        store.save_importance(&key, &second).unwrap();

        let reopened = DirectoryStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load_importance(&key).unwrap(), Some(first));
        assert_eq!(reopened.load_importance(&ModelKey::new("bob", 7)).unwrap(), None);
    }

    #[test]
    fn feature_columns_exclude_target() {
        let source = ModelSource {
            raw: RawDataset {
                bytes: Vec::new(),
                file_type: FileType::Csv,
            },
            target_field: "y".into(),
            columns: vec!["a".into(), "y".into(), "b".into()],
        };
        assert_eq!(source.feature_columns(), vec!["a", "b"]);
    }
}
