//! Session-scoped manifest cache
//!
//! Maps `(commit, machine)` to the run manifest fetched for it, together with
//! whatever benchmark results of that run have been retrieved so far. Entries
//! are never evicted: published runs are immutable per commit hash.

use crate::data::{BenchmarkResult, RunManifest};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Cache key: one benchmark run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunKey {
    pub commit: String,
    pub machine: String,
}

impl RunKey {
    pub fn new(commit: impl Into<String>, machine: impl Into<String>) -> Self {
        Self {
            commit: commit.into(),
            machine: machine.into(),
        }
    }
}

impl std::fmt::Display for RunKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.commit, self.machine)
    }
}

#[derive(Debug)]
struct CachedRun {
    manifest: Arc<RunManifest>,
    results: HashMap<String, BenchmarkResult>,
}

/// Cheaply cloneable handle to the shared cache
#[derive(Debug, Clone, Default)]
pub struct ManifestCache {
    runs: Arc<RwLock<HashMap<RunKey, CachedRun>>>,
}

impl ManifestCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<RunKey, CachedRun>> {
        self.runs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<RunKey, CachedRun>> {
        self.runs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cached manifest for a run, if it was fetched before
    pub fn get(&self, key: &RunKey) -> Option<Arc<RunManifest>> {
        self.read().get(key).map(|run| Arc::clone(&run.manifest))
    }

    pub fn contains(&self, key: &RunKey) -> bool {
        self.read().contains_key(key)
    }

    /// Register a fetched manifest.
    ///
    /// Results already cached for the key are kept: the same commit hash
    /// always describes the same run.
    pub fn put(&self, key: RunKey, manifest: RunManifest) {
        self.write()
            .entry(key)
            .and_modify(|run| run.manifest = Arc::new(manifest.clone()))
            .or_insert_with(|| CachedRun {
                manifest: Arc::new(manifest),
                results: HashMap::new(),
            });
    }

    /// Store a benchmark result of a cached run. Results for runs whose
    /// manifest is unknown are ignored.
    pub fn put_result(&self, key: &RunKey, result: BenchmarkResult) -> bool {
        match self.write().get_mut(key) {
            Some(run) => {
                run.results.insert(result.benchmark_id.clone(), result);
                true
            }
            None => false,
        }
    }

    /// Benchmark ids listed by the run's manifest that have no cached result
    pub fn missing_results(&self, key: &RunKey) -> Vec<String> {
        let runs = self.read();
        let Some(run) = runs.get(key) else {
            return Vec::new();
        };
        run.manifest
            .benchmark_ids
            .iter()
            .filter(|id| !run.results.contains_key(*id))
            .cloned()
            .collect()
    }

    /// Cached results of a run, in manifest order
    pub fn results(&self, key: &RunKey) -> Vec<BenchmarkResult> {
        let runs = self.read();
        let Some(run) = runs.get(key) else {
            return Vec::new();
        };
        run.manifest
            .benchmark_ids
            .iter()
            .filter_map(|id| run.results.get(id).cloned())
            .collect()
    }

    /// Number of cached manifests
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
