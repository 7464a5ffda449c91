use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use ndarray::{s, Axis};
use once_cell::sync::OnceCell;
use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::NecessityConfig;
use crate::error::{FilterError, Result};
use crate::models::gbrt::{GbrtParams, GradientBoostedRegressor};
use crate::models::tree_shap::explain;
use crate::store::{DatasetId, DatasetStore, ModelId};
use crate::table::NumericTable;

/// Identity of one cached importance: who asked, for which model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelKey {
    pub owner: String,
    pub model: ModelId,
}

impl ModelKey {
    pub fn new(owner: impl Into<String>, model: ModelId) -> Self {
        ModelKey {
            owner: owner.into(),
            model,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureWeight {
    pub feature: String,
    pub weight: f64,
}

/// Relative importance per declared feature: non-negative, summing to 1,
/// in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    weights: Vec<FeatureWeight>,
}

impl FeatureImportance {
    pub fn new(weights: Vec<FeatureWeight>) -> Result<Self> {
        if weights.is_empty() {
            return Err(FilterError::Data("feature importance needs at least one feature".into()));
        }
        if let Some(bad) = weights.iter().find(|w| !(w.weight >= 0.0 && w.weight.is_finite())) {
            return Err(FilterError::Data(format!(
                "weight of '{}' is {}, expected a finite non-negative value",
                bad.feature, bad.weight
            )));
        }
        let total: f64 = weights.iter().map(|w| w.weight).sum();
        if (total - 1.0).abs() > 1e-6 {
            return Err(FilterError::Data(format!("weights sum to {}, expected 1", total)));
        }
        Ok(FeatureImportance { weights })
    }

    /// Normalize raw non-negative magnitudes into weights.
    pub fn from_magnitudes(features: &[String], magnitudes: &[f64]) -> Result<Self> {
        let total: f64 = magnitudes.iter().sum();
        if !(total > 0.0) || !total.is_finite() {
            return Err(FilterError::DegenerateModel(
                "every feature has zero attribution; the target shows no learnable signal".into(),
            ));
        }
        Self::new(
            features
                .iter()
                .zip(magnitudes)
                .map(|(feature, m)| FeatureWeight {
                    feature: feature.clone(),
                    weight: m / total,
                })
                .collect(),
        )
    }

    pub fn get(&self, feature: &str) -> Option<f64> {
        self.weights
            .iter()
            .find(|w| w.feature == feature)
            .map(|w| w.weight)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.weights.iter().map(|w| (w.feature.as_str(), w.weight))
    }

    pub fn weights(&self) -> &[FeatureWeight] {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Importance mass carried by the columns of `table`.
    pub fn coverage(&self, table: &NumericTable) -> f64 {
        self.weights
            .iter()
            .filter(|w| table.has_column(&w.feature))
            .map(|w| w.weight)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedCandidate<I> {
    pub id: I,
    pub score: f64,
}

/// Candidates ordered by covered importance, best first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NecessityRanking<I> {
    pub entries: Vec<RankedCandidate<I>>,
}

impl<I> NecessityRanking<I> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RankedCandidate<I>> {
        self.entries.iter()
    }
}

/// Score every candidate by the importance its columns cover. Ties keep input order.
pub fn rank_candidates<'a, I, C>(importance: &FeatureImportance, candidates: C) -> NecessityRanking<I>
where
    C: IntoIterator<Item = (I, &'a NumericTable)>,
{
    let mut entries: Vec<RankedCandidate<I>> = candidates
        .into_iter()
        .map(|(id, table)| RankedCandidate {
            id,
            score: importance.coverage(table),
        })
        .collect();
    // `sort_by` is stable.
    entries.sort_by(|a, b| b.score.total_cmp(&a.score));
    NecessityRanking { entries }
}

type Slot = Arc<OnceCell<Arc<FeatureImportance>>>;

/// Eviction-free map from `ModelKey` to its importance. Each key is computed
/// at most once; concurrent callers for the same key wait for the first one.
#[derive(Debug, Default)]
pub struct ImportanceCache {
    slots: DashMap<ModelKey, Slot>,
}

impl ImportanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ModelKey) -> Option<Arc<FeatureImportance>> {
        self.slots
            .get(key)
            .and_then(|slot| slot.value().get().cloned())
    }

    pub fn contains(&self, key: &ModelKey) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store `importance` unless the key is already filled; returns the stored value.
    pub fn insert(&self, key: &ModelKey, importance: FeatureImportance) -> Arc<FeatureImportance> {
        let slot = self.slot(key);
        slot.get_or_init(|| Arc::new(importance)).clone()
    }

    pub fn get_or_try_compute<F>(&self, key: &ModelKey, compute: F) -> Result<Arc<FeatureImportance>>
    where
        F: FnOnce() -> Result<FeatureImportance>,
    {
        let slot = self.slot(key);
        let result = slot
            .get_or_try_init(|| compute().map(Arc::new))
            .map(Arc::clone);
        if result.is_err() {
            // Drop the empty slot only when no other caller holds it: a waiter
            // retries the init in this same cell, and later callers must see it.
            // The map's reference plus ours make two.
            self.slots.remove_if(key, |_, current| {
                Arc::ptr_eq(current, &slot)
                    && current.get().is_none()
                    && Arc::strong_count(current) == 2
            });
        }
        result
    }

    fn slot(&self, key: &ModelKey) -> Slot {
        // The map guard is released at the end of this statement, before any
        // computation runs.
        self.slots.entry(key.clone()).or_default().value().clone()
    }
}

/// Fits a boosted surrogate of the target, turns held-out attributions into
/// feature weights, and caches them per `ModelKey`.
#[derive(Debug, Default)]
pub struct NecessityScorer {
    config: NecessityConfig,
    cache: ImportanceCache,
    fits: AtomicUsize,
}

impl NecessityScorer {
    pub fn new(config: NecessityConfig) -> Self {
        NecessityScorer {
            config,
            cache: ImportanceCache::new(),
            fits: AtomicUsize::new(0),
        }
    }

    pub fn cache(&self) -> &ImportanceCache {
        &self.cache
    }

    /// Number of surrogate models fitted so far.
    pub fn fits(&self) -> usize {
        self.fits.load(Ordering::SeqCst)
    }

    pub fn compute_importance(
        &self,
        key: &ModelKey,
        table: &NumericTable,
        target: &str,
        feature_columns: &[String],
    ) -> Result<Arc<FeatureImportance>> {
        if let Some(cached) = self.cache.get(key) {
            tracing::debug!(owner = %key.owner, model = key.model, "importance served from cache");
            return Ok(cached);
        }
        let features = Self::validate(table, target, feature_columns)?;
        self.cache
            .get_or_try_compute(key, || self.fit_importance(table, target, &features))
    }

    fn validate(table: &NumericTable, target: &str, feature_columns: &[String]) -> Result<Vec<String>> {
        if !table.has_column(target) {
            return Err(FilterError::Data(format!(
                "target column '{}' not found in training data",
                target
            )));
        }
        let features: Vec<String> = feature_columns
            .iter()
            .filter(|f| f.as_str() != target)
            .cloned()
            .collect();
        if features.is_empty() {
            return Err(FilterError::Data("no feature columns declared".into()));
        }
        Ok(features)
    }

    /// Uncached importance computation.
    pub fn fit_importance(
        &self,
        table: &NumericTable,
        target: &str,
        features: &[String],
    ) -> Result<FeatureImportance> {
        let mut names: Vec<&str> = features.iter().map(String::as_str).collect();
        names.push(target);
        let matrix = table.complete_rows(&names)?;
        let n_rows = matrix.nrows();
        if n_rows < 2 {
            return Err(FilterError::Data(format!(
                "need at least 2 complete rows to split train/holdout, got {}",
                n_rows
            )));
        }

        let n_features = features.len();
        let x = matrix.slice(s![.., ..n_features]);
        let y = matrix.column(n_features);

        let mut order: Vec<usize> = (0..n_rows).collect();
        order.shuffle(&mut StdRng::seed_from_u64(self.config.split_seed));
        let n_test = ((self.config.test_fraction * n_rows as f64).ceil() as usize).clamp(1, n_rows - 1);
        let (test_idx, train_idx) = order.split_at(n_test);

        let x_train = x.select(Axis(0), train_idx);
        let y_train = y.select(Axis(0), train_idx);
        let x_test = x.select(Axis(0), test_idx);

        let model = GradientBoostedRegressor::fit(
            x_train.view(),
            y_train.view(),
            GbrtParams::from(&self.config),
        )?;
        self.fits.fetch_add(1, Ordering::SeqCst);

        let attribution = explain(&model, x_test.view());
        let importance = FeatureImportance::from_magnitudes(features, &attribution.mean_abs())?;
        tracing::info!(
            train_rows = train_idx.len(),
            holdout_rows = test_idx.len(),
            features = n_features,
            "feature importance computed"
        );
        Ok(importance)
    }

    pub fn rank_candidates<'a, I, C>(&self, importance: &FeatureImportance, candidates: C) -> NecessityRanking<I>
    where
        C: IntoIterator<Item = (I, &'a NumericTable)>,
    {
        rank_candidates(importance, candidates)
    }

    /// Rank every dataset `owner` may see against the importance of `model`.
    /// A persisted importance is reused; a fresh one is persisted.
    pub fn rank_visible_datasets(
        &self,
        store: &dyn DatasetStore,
        owner: &str,
        model: ModelId,
    ) -> Result<NecessityRanking<DatasetId>> {
        let key = ModelKey::new(owner, model);
        let importance = match self.cache.get(&key) {
            Some(cached) => cached,
            None => match store.load_importance(&key)? {
                Some(stored) => self.cache.insert(&key, stored),
                None => {
                    let source = store.load_model(model)?;
                    let table = source.raw.decode()?;
                    let computed = self.compute_importance(
                        &key,
                        &table,
                        &source.target_field,
                        &source.feature_columns(),
                    )?;
                    store.save_importance(&key, &computed)?;
                    computed
                }
            },
        };

        let mut tables = Vec::new();
        for record in store.candidate_datasets(owner)? {
            match store.load_dataset(record.id).and_then(|raw| raw.decode()) {
                Ok(table) => tables.push((record.id, table)),
                Err(e) => {
                    tracing::warn!(dataset = record.id, error = %e, "skipping unreadable candidate")
                }
            }
        }
        Ok(rank_candidates(
            &importance,
            tables.iter().map(|(id, table)| (*id, table)),
        ))
    }
}
