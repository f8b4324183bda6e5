//! Population archive: the live set of program records, its capacity bound,
//! biased parent sampling and durable JSON storage.
//!
//! The archive is owned by a single controller and mutated through `&mut`.
//! Sharing one archive between controllers requires wrapping it in a `Mutex`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use super::retention::{RetentionPolicy, rank_by};
use crate::schema::{ACTIVE_KEY, ArchiveConfig, ConfigError, ProgramRecord, Scores};

/// Probability of drawing the parent from the top third of the population.
pub const TOP_THIRD_PROBABILITY: f64 = 0.7;

/// Maximum number of inspirations returned with a sampled parent.
pub const MAX_INSPIRATIONS: usize = 3;

/// Errors raised by the durable record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Archive errors.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("population is empty")]
    EmptyPopulation,

    #[error("unknown parent program: {0}")]
    UnknownParent(String),

    /// JSON has no representation for NaN or infinity.
    #[error("score {metric} = {value} is not finite")]
    NonFiniteScore { metric: String, value: f64 },

    /// The record was added in memory but could not be written to disk.
    #[error("program {id} added but not persisted: {source}")]
    Persistence {
        id: String,
        #[source]
        source: StoreError,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("invalid archive configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Directory of `<id>.json` records, each with a `<id>.<ext>` source copy.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
    extension: String,
}

impl RecordStore {
    /// Open (creating if needed) a record directory. Relative paths are
    /// resolved against the current directory once, here.
    pub fn open<P: AsRef<Path>>(dir: P, extension: &str) -> Result<Self, StoreError> {
        let dir = std::path::absolute(dir.as_ref())?;
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            extension: extension.trim_start_matches('.').to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn source_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{}", self.extension))
    }

    /// Write the JSON record and the standalone source file.
    pub fn save(&self, record: &ProgramRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(record)?;
        fs::write(self.record_path(&record.id), json)?;
        fs::write(self.source_path(&record.id), &record.code)?;
        Ok(())
    }

    /// Rewrite a record's JSON with `active: false`. The source file is kept.
    pub fn mark_inactive(&self, record: &ProgramRecord) -> Result<(), StoreError> {
        let mut record = record.clone();
        record
            .metadata
            .insert(ACTIVE_KEY.to_string(), Value::Bool(false));
        let json = serde_json::to_string_pretty(&record)?;
        fs::write(self.record_path(&record.id), json)?;
        Ok(())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.record_path(id).is_file()
    }

    /// Load one record, `None` if it was never stored.
    pub fn load(&self, id: &str) -> Result<Option<ProgramRecord>, StoreError> {
        let path = self.record_path(id);
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Load every readable record. Unreadable files are logged and skipped.
    pub fn load_all(&self) -> Result<Vec<ProgramRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            match load_record(&path) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }
        Ok(records)
    }
}

fn load_record(path: &Path) -> Result<ProgramRecord, StoreError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Population of program records with a capacity bound.
pub struct ProgramArchive {
    /// Live records indexed by id.
    programs: HashMap<String, ProgramRecord>,
    /// Insertion order of live records.
    order: Vec<String>,
    /// Evicted records, kept only when there is no durable store.
    retired: HashMap<String, ProgramRecord>,
    store: Option<RecordStore>,
    capacity: usize,
    /// Ordered metric names; index 0 is primary.
    metrics: Vec<String>,
    policy: Box<dyn RetentionPolicy>,
    rng: StdRng,
    last_created: Option<DateTime<Utc>>,
}

impl fmt::Debug for ProgramArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramArchive")
            .field("len", &self.order.len())
            .field("capacity", &self.capacity)
            .field("metrics", &self.metrics)
            .field("policy", &self.policy.name())
            .field("store", &self.store.as_ref().map(RecordStore::dir))
            .finish()
    }
}

impl ProgramArchive {
    /// Create an archive without durable storage.
    pub fn in_memory(config: &ArchiveConfig) -> Result<Self, ArchiveError> {
        config.validate()?;

        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            programs: HashMap::new(),
            order: Vec::new(),
            retired: HashMap::new(),
            store: None,
            capacity: config.capacity,
            metrics: config.metrics.clone(),
            policy: config.retention.policy(),
            rng,
            last_created: None,
        })
    }

    /// Open an archive backed by `<results_dir>/programs/`, reloading every
    /// active record found there.
    pub fn open<P: AsRef<Path>>(results_dir: P, config: &ArchiveConfig) -> Result<Self, ArchiveError> {
        config.validate()?;
        let store = RecordStore::open(
            results_dir.as_ref().join("programs"),
            &config.source_extension,
        )?;

        let mut records: Vec<ProgramRecord> = store
            .load_all()?
            .into_iter()
            .filter(ProgramRecord::is_active)
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut archive = Self::in_memory(config)?;
        archive.store = Some(store);
        for record in records {
            archive.last_created = archive.last_created.max(Some(record.created_at));
            archive.order.push(record.id.clone());
            archive.programs.insert(record.id.clone(), record);
        }
        archive.enforce_capacity();

        log::info!(
            "Opened archive with {} active programs (capacity {}, retention {})",
            archive.len(),
            archive.capacity,
            archive.policy.name()
        );
        Ok(archive)
    }

    /// Replace the retention policy.
    pub fn with_policy(mut self, policy: Box<dyn RetentionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Add a program and enforce the capacity bound.
    ///
    /// Non-finite scores are rejected. When persistence fails the record
    /// still joins the population and [`ArchiveError::Persistence`] carries
    /// its id.
    pub fn add(
        &mut self,
        code: impl Into<String>,
        scores: Scores,
        parent_id: Option<&str>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<String, ArchiveError> {
        if let Some(parent) = parent_id
            && !self.is_known(parent)
        {
            return Err(ArchiveError::UnknownParent(parent.to_string()));
        }
        if let Some((metric, value)) = scores.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ArchiveError::NonFiniteScore {
                metric: metric.to_string(),
                value,
            });
        }

        let now = Utc::now();
        let created_at = match self.last_created {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        self.last_created = Some(created_at);

        let record = ProgramRecord {
            id: Uuid::new_v4().to_string(),
            code: code.into(),
            scores,
            parent_id: parent_id.map(str::to_string),
            created_at,
            metadata: metadata.unwrap_or_default(),
        };
        let id = record.id.clone();

        let persisted = match &self.store {
            Some(store) => store.save(&record),
            None => Ok(()),
        };

        log::debug!("Added program {} ({})", id, record.scores);
        self.order.push(id.clone());
        self.programs.insert(id.clone(), record);
        self.enforce_capacity();

        match persisted {
            Ok(()) => Ok(id),
            Err(source) => Err(ArchiveError::Persistence { id, source }),
        }
    }

    fn is_known(&self, id: &str) -> bool {
        self.programs.contains_key(id)
            || self.retired.contains_key(id)
            || self.store.as_ref().is_some_and(|s| s.exists(id))
    }

    fn enforce_capacity(&mut self) {
        if self.order.len() <= self.capacity {
            return;
        }

        let live: Vec<&ProgramRecord> = self
            .order
            .iter()
            .filter_map(|id| self.programs.get(id))
            .collect();
        let selected = self.policy.select(&live, &self.metrics, self.capacity);

        let mut keep = HashSet::with_capacity(self.capacity);
        for id in selected {
            if keep.len() >= self.capacity {
                break;
            }
            if self.programs.contains_key(&id) {
                keep.insert(id);
            }
        }

        let (kept, evicted): (Vec<String>, Vec<String>) =
            self.order.drain(..).partition(|id| keep.contains(id));
        self.order = kept;

        for id in evicted {
            let Some(record) = self.programs.remove(&id) else {
                continue;
            };
            match &self.store {
                Some(store) => {
                    if let Err(e) = store.mark_inactive(&record) {
                        log::error!("Failed to mark program {} inactive: {}", id, e);
                    }
                }
                None => {
                    self.retired.insert(id, record);
                }
            }
        }

        log::debug!(
            "Retention '{}' kept {} programs",
            self.policy.name(),
            self.order.len()
        );
    }

    fn live(&self) -> Vec<&ProgramRecord> {
        self.order
            .iter()
            .filter_map(|id| self.programs.get(id))
            .collect()
    }

    /// Sample a parent and up to three inspirations.
    ///
    /// With three or more records the parent comes from the top third by
    /// primary metric with probability [`TOP_THIRD_PROBABILITY`], otherwise
    /// uniformly from the whole population. Inspirations are the best
    /// records other than the parent.
    pub fn sample(&mut self) -> Result<(ProgramRecord, Vec<ProgramRecord>), ArchiveError> {
        if self.order.is_empty() {
            return Err(ArchiveError::EmptyPopulation);
        }

        let live: Vec<&ProgramRecord> = self
            .order
            .iter()
            .filter_map(|id| self.programs.get(id))
            .collect();
        let ranked = rank_by(&live, self.metrics[0].as_str());
        let n = ranked.len();

        let parent_idx = if n >= 3 && self.rng.gen_bool(TOP_THIRD_PROBABILITY) {
            self.rng.gen_range(0..(n / 3).max(1))
        } else {
            self.rng.gen_range(0..n)
        };

        let parent = ranked[parent_idx].clone();
        let inspirations = ranked
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != parent_idx)
            .take(MAX_INSPIRATIONS)
            .map(|(_, r)| (*r).clone())
            .collect();

        Ok((parent, inspirations))
    }

    /// Best record by `metric` (primary when `None`); ties go to the
    /// earliest inserted.
    pub fn best(&self, metric: Option<&str>) -> Option<&ProgramRecord> {
        let metric = metric.unwrap_or(self.primary_metric());
        let mut best: Option<&ProgramRecord> = None;
        for record in self.live() {
            if best.is_none_or(|b| record.score(metric) > b.score(metric)) {
                best = Some(record);
            }
        }
        best
    }

    /// Up to `limit` records, best first.
    pub fn top(&self, metric: Option<&str>, limit: usize) -> Vec<&ProgramRecord> {
        let metric = metric.unwrap_or(self.primary_metric());
        let mut ranked = rank_by(&self.live(), metric);
        ranked.truncate(limit);
        ranked
    }

    /// Lineage of `id`, nearest ancestor first, following evicted records
    /// through durable storage.
    pub fn ancestors(&self, id: &str, max_depth: usize) -> Vec<ProgramRecord> {
        let mut lineage = Vec::new();
        let mut visited = HashSet::from([id.to_string()]);
        let mut next = self.lookup(id).and_then(|r| r.parent_id);

        while let Some(parent_id) = next {
            if lineage.len() >= max_depth || !visited.insert(parent_id.clone()) {
                break;
            }
            let Some(parent) = self.lookup(&parent_id) else {
                log::warn!("Ancestor {} of {} not found", parent_id, id);
                break;
            };
            next = parent.parent_id.clone();
            lineage.push(parent);
        }

        lineage
    }

    /// Find a record whether live, evicted in memory, or on disk.
    pub fn lookup(&self, id: &str) -> Option<ProgramRecord> {
        if let Some(record) = self.programs.get(id).or_else(|| self.retired.get(id)) {
            return Some(record.clone());
        }
        let store = self.store.as_ref()?;
        match store.load(id) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("Failed to load program {}: {}", id, e);
                None
            }
        }
    }

    /// Live record by id.
    pub fn get(&self, id: &str) -> Option<&ProgramRecord> {
        self.programs.get(id)
    }

    /// Live records in insertion order.
    pub fn all(&self) -> Vec<&ProgramRecord> {
        self.live()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn metrics(&self) -> &[String] {
        &self.metrics
    }

    pub fn primary_metric(&self) -> &str {
        &self.metrics[0]
    }

    /// Durable store, if any.
    pub fn store(&self) -> Option<&RecordStore> {
        self.store.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RetentionKind;
    use proptest::prelude::*;

    fn config(capacity: usize, retention: RetentionKind) -> ArchiveConfig {
        ArchiveConfig {
            capacity,
            retention,
            metrics: vec!["accuracy".to_string()],
            random_seed: Some(42),
            ..ArchiveConfig::default()
        }
    }

    fn accuracy(value: f64) -> Scores {
        Scores::from([("accuracy", value)])
    }

    #[test]
    fn test_best_retention_keeps_top_scores() {
        let mut archive = ProgramArchive::in_memory(&config(3, RetentionKind::Best)).unwrap();
        for (i, value) in [0.5, 0.8, 0.7, 0.9, 0.6].into_iter().enumerate() {
            archive
                .add(format!("v{i}"), accuracy(value), None, None)
                .unwrap();
            assert!(archive.len() <= 3);
        }

        let mut kept: Vec<f64> = archive.all().iter().map(|r| r.score("accuracy")).collect();
        kept.sort_by(|a, b| b.total_cmp(a));
        assert_eq!(kept, vec![0.9, 0.8, 0.7]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let no_metrics = ArchiveConfig {
            metrics: Vec::new(),
            ..ArchiveConfig::default()
        };
        assert!(matches!(
            ProgramArchive::in_memory(&no_metrics),
            Err(ArchiveError::Config(ConfigError::NoMetrics))
        ));

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ProgramArchive::open(dir.path(), &config(0, RetentionKind::Best)),
            Err(ArchiveError::Config(ConfigError::InvalidCapacity))
        ));
    }

    #[test]
    fn test_sample_empty() {
        let mut archive = ProgramArchive::in_memory(&config(10, RetentionKind::Pareto)).unwrap();
        assert!(matches!(archive.sample(), Err(ArchiveError::EmptyPopulation)));
    }

    #[test]
    fn test_sample_small_population() {
        let mut archive = ProgramArchive::in_memory(&config(10, RetentionKind::Best)).unwrap();
        let only = archive.add("x = 1", accuracy(0.3), None, None).unwrap();

        let (parent, inspirations) = archive.sample().unwrap();
        assert_eq!(parent.id, only);
        assert!(inspirations.is_empty());

        archive.add("x = 2", accuracy(0.4), None, None).unwrap();
        let (parent, inspirations) = archive.sample().unwrap();
        assert_eq!(inspirations.len(), 1);
        assert_ne!(inspirations[0].id, parent.id);
    }

    #[test]
    fn test_sample_prefers_top_third() {
        let mut archive = ProgramArchive::in_memory(&config(100, RetentionKind::Best)).unwrap();
        let mut top = HashSet::new();
        for i in 0..9 {
            let id = archive
                .add(format!("v{i}"), accuracy(i as f64), None, None)
                .unwrap();
            if i >= 6 {
                top.insert(id);
            }
        }

        let trials = 2000;
        let mut hits = 0;
        for _ in 0..trials {
            let (parent, inspirations) = archive.sample().unwrap();
            assert_eq!(inspirations.len(), 3);
            assert!(inspirations.iter().all(|r| r.id != parent.id));

            let scores: Vec<f64> = inspirations.iter().map(|r| r.score("accuracy")).collect();
            let expected: Vec<f64> = (0..9u8)
                .rev()
                .map(f64::from)
                .filter(|v| *v != parent.score("accuracy"))
                .take(3)
                .collect();
            assert_eq!(scores, expected);

            if top.contains(&parent.id) {
                hits += 1;
            }
        }

        // Expected share: 0.7 + 0.3 * 3/9 = 0.8.
        let share = hits as f64 / trials as f64;
        assert!(share > 0.74 && share < 0.86, "top-third share was {share}");
    }

    #[test]
    fn test_best_ties_go_to_first_inserted() {
        let mut archive = ProgramArchive::in_memory(&config(10, RetentionKind::Best)).unwrap();
        let first = archive.add("a", accuracy(0.9), None, None).unwrap();
        archive.add("b", accuracy(0.9), None, None).unwrap();
        archive.add("c", Scores::error(), None, None).unwrap();

        assert_eq!(archive.best(None).unwrap().id, first);
        // Nobody reports the metric; first inserted still wins.
        assert_eq!(archive.best(Some("speed")).unwrap().id, first);
        assert_eq!(archive.top(None, 2).len(), 2);
        assert_eq!(archive.top(None, 2)[0].id, first);
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let mut archive = ProgramArchive::in_memory(&config(10, RetentionKind::Best)).unwrap();
        let result = archive.add("a", accuracy(0.1), Some("missing"), None);
        assert!(matches!(result, Err(ArchiveError::UnknownParent(id)) if id == "missing"));
        assert!(archive.is_empty());
    }

    #[test]
    fn test_ancestors_follow_evicted_records() {
        let mut archive = ProgramArchive::in_memory(&config(2, RetentionKind::Best)).unwrap();
        let root = archive.add("root", accuracy(0.1), None, None).unwrap();
        let child = archive.add("child", accuracy(0.2), Some(&root), None).unwrap();
        let grandchild = archive
            .add("grandchild", accuracy(0.3), Some(&child), None)
            .unwrap();
        archive.add("other", accuracy(0.9), None, None).unwrap();

        assert!(archive.get(&root).is_none());
        let lineage = archive.ancestors(&grandchild, 10);
        let ids: Vec<&str> = lineage.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![child.as_str(), root.as_str()]);
        assert_eq!(archive.ancestors(&grandchild, 1).len(), 1);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(10, RetentionKind::Best);

        let (parent, child) = {
            let mut archive = ProgramArchive::open(dir.path(), &cfg).unwrap();
            let parent = archive.add("print(1)", accuracy(0.5), None, None).unwrap();
            let child = archive
                .add("print(2)", accuracy(0.7), Some(&parent), None)
                .unwrap();
            (parent, child)
        };

        assert!(dir.path().join("programs").join(format!("{child}.py")).is_file());

        let reopened = ProgramArchive::open(dir.path(), &cfg).unwrap();
        assert_eq!(reopened.len(), 2);
        let record = reopened.get(&child).unwrap();
        assert_eq!(record.code, "print(2)");
        assert_eq!(record.scores, accuracy(0.7));
        assert_eq!(record.parent_id.as_deref(), Some(parent.as_str()));
        assert_eq!(reopened.all()[0].id, parent);
    }

    #[test]
    fn test_non_finite_scores_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(10, RetentionKind::Best);
        let mut archive = ProgramArchive::open(dir.path(), &cfg).unwrap();

        for value in [f64::INFINITY, f64::NAN] {
            match archive.add("x", accuracy(value), None, None) {
                Err(ArchiveError::NonFiniteScore { metric, .. }) => assert_eq!(metric, "accuracy"),
                other => panic!("expected non-finite score error, got {other:?}"),
            }
        }
        assert!(archive.is_empty());

        let kept = archive.add("y", accuracy(0.5), None, None).unwrap();
        let reopened = ProgramArchive::open(dir.path(), &cfg).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(reopened.get(&kept).is_some());
    }

    #[test]
    fn test_store_resolves_relative_dir() {
        let relative = PathBuf::from("target").join(format!("record-store-{}", Uuid::new_v4()));
        let store = RecordStore::open(&relative, "py").unwrap();
        assert!(store.dir().is_absolute());
        assert!(store.dir().ends_with(&relative));
        fs::remove_dir_all(store.dir()).unwrap();
    }

    #[test]
    fn test_evicted_records_stay_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(1, RetentionKind::Best);

        let mut archive = ProgramArchive::open(dir.path(), &cfg).unwrap();
        let weak = archive.add("weak", accuracy(0.1), None, None).unwrap();
        let strong = archive.add("strong", accuracy(0.9), Some(&weak), None).unwrap();
        assert_eq!(archive.len(), 1);

        let stored = archive.store().unwrap().load(&weak).unwrap().unwrap();
        assert!(!stored.is_active());
        assert_eq!(archive.ancestors(&strong, 5)[0].id, weak);

        let reopened = ProgramArchive::open(dir.path(), &cfg).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(reopened.get(&strong).is_some());
    }

    #[test]
    fn test_unreadable_records_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(10, RetentionKind::Best);
        {
            let mut archive = ProgramArchive::open(dir.path(), &cfg).unwrap();
            archive.add("ok", accuracy(0.5), None, None).unwrap();
        }
        fs::write(dir.path().join("programs").join("broken.json"), "{ not json").unwrap();

        let reopened = ProgramArchive::open(dir.path(), &cfg).unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_persistence_failure_keeps_record() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(10, RetentionKind::Best);
        let mut archive = ProgramArchive::open(dir.path(), &cfg).unwrap();
        fs::remove_dir_all(dir.path().join("programs")).unwrap();

        let id = match archive.add("lost", accuracy(0.5), None, None) {
            Err(ArchiveError::Persistence { id, .. }) => id,
            other => panic!("expected persistence error, got {other:?}"),
        };
        assert_eq!(archive.len(), 1);
        assert_eq!(archive.get(&id).unwrap().code, "lost");
    }

    #[test]
    fn test_reopen_enforces_smaller_capacity() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut archive = ProgramArchive::open(dir.path(), &config(10, RetentionKind::Best)).unwrap();
            for i in 0..5 {
                archive.add(format!("v{i}"), accuracy(i as f64), None, None).unwrap();
            }
        }

        let archive = ProgramArchive::open(dir.path(), &config(2, RetentionKind::Best)).unwrap();
        assert_eq!(archive.len(), 2);
        assert_eq!(archive.best(None).unwrap().score("accuracy"), 4.0);
    }

    #[test]
    fn test_created_at_monotonic() {
        let mut archive = ProgramArchive::in_memory(&config(10, RetentionKind::Diverse)).unwrap();
        for i in 0..20 {
            archive.add(format!("v{i}"), accuracy(0.0), None, None).unwrap();
        }
        let times: Vec<_> = archive.all().iter().map(|r| r.created_at).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    proptest! {
        #[test]
        fn prop_population_never_exceeds_capacity(
            capacity in 1usize..8,
            retention in prop_oneof![
                Just(RetentionKind::Best),
                Just(RetentionKind::Pareto),
                Just(RetentionKind::Diverse),
            ],
            values in prop::collection::vec((0.0f64..1.0, prop::option::of(0.0f64..1.0)), 1..30),
        ) {
            let mut cfg = config(capacity, retention);
            cfg.metrics.push("speed".to_string());
            let mut archive = ProgramArchive::in_memory(&cfg).unwrap();

            for (i, (acc, speed)) in values.into_iter().enumerate() {
                let mut scores = accuracy(acc);
                if let Some(speed) = speed {
                    scores.insert("speed", speed);
                }
                archive.add(format!("v{i}"), scores, None, None).unwrap();
                prop_assert!(archive.len() <= capacity);
                prop_assert_eq!(archive.len(), archive.all().len());
            }
        }
    }
}
