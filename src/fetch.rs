//! Fetch orchestration
//!
//! Works out which `(commit, machine)` runs a view needs, retrieves the
//! manifests the cache does not hold yet, then every benchmark result those
//! manifests list. Retrievals run concurrently; a failed cell is logged and
//! left out without disturbing its siblings.

use crate::cache::{ManifestCache, RunKey};
use crate::data::{BenchmarkResult, Commit, RunIndex, RunManifest};
use crate::error::{Error, Result};
use crate::source::BenchmarkSource;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Limits applied to retrievals
#[derive(Debug, Clone, PartialEq)]
pub struct FetchConfig {
    /// Maximum retrievals in flight at once
    pub max_in_flight: usize,
    /// Deadline for a single retrieval
    pub task_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 32,
            task_timeout: Duration::from_secs(30),
        }
    }
}

impl FetchConfig {
    pub fn new(max_in_flight: usize, task_timeout: Duration) -> Result<Self> {
        if max_in_flight == 0 {
            return Err(Error::ConfigError(
                "max-in-flight must be at least 1".to_string(),
            ));
        }
        if task_timeout.is_zero() {
            return Err(Error::ConfigError(
                "task timeout must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            max_in_flight,
            task_timeout,
        })
    }
}

/// One populated cell: a benchmark value of one commit on one machine
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Measurement {
    pub commit: String,
    pub machine: String,
    pub benchmark_id: String,
    pub estimate: f64,
    pub unit: String,
}

impl Measurement {
    fn new(key: &RunKey, result: BenchmarkResult) -> Self {
        Self {
            commit: key.commit.clone(),
            machine: key.machine.clone(),
            benchmark_id: result.benchmark_id,
            estimate: result.estimate,
            unit: result.unit,
        }
    }
}

/// Retrieval counters of one `resolve` call
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct FetchStats {
    /// Runs that needed data
    pub runs: usize,
    /// Runs answered from the cache
    pub cached_runs: usize,
    pub manifests_requested: usize,
    pub results_requested: usize,
    /// Retrievals that failed, timed out, or found nothing
    pub failures: usize,
}

impl FetchStats {
    /// Total retrievals issued
    pub fn requests(&self) -> usize {
        self.manifests_requested + self.results_requested
    }
}

/// Everything retrieved for a view
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ResultBag {
    pub measurements: Vec<Measurement>,
    pub stats: FetchStats,
}

enum Outcome {
    Manifest(RunKey, Result<RunManifest>),
    Result(RunKey, String, Result<BenchmarkResult>),
}

/// Issues retrievals against a [`BenchmarkSource`]
#[derive(Clone)]
pub struct FetchOrchestrator {
    source: Arc<dyn BenchmarkSource>,
    config: FetchConfig,
    permits: Arc<Semaphore>,
}

impl FetchOrchestrator {
    pub fn new(source: Arc<dyn BenchmarkSource>, config: FetchConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight));
        Self {
            source,
            config,
            permits,
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Runs the index lists for any of `commits` on any of `machines`, in
    /// commit order then machine order.
    pub fn runs_needed(commits: &[Commit], machines: &[String], index: &RunIndex) -> Vec<RunKey> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();

        for commit in commits {
            for machine in machines {
                if index.has_run(&commit.hash, machine) {
                    let key = RunKey::new(&commit.hash, machine);
                    if seen.insert(key.clone()) {
                        keys.push(key);
                    }
                }
            }
        }
        keys
    }

    /// Retrieve everything needed to chart `commits` on `machines`.
    ///
    /// Completes once every issued retrieval has settled. Manifests already in
    /// `cache` are not fetched again; only their results that are still
    /// missing are. Returns `Error::Superseded` if `cancel` fires first.
    pub async fn resolve(
        &self,
        commits: &[Commit],
        machines: &[String],
        index: &RunIndex,
        cache: &ManifestCache,
        cancel: &CancellationToken,
    ) -> Result<ResultBag> {
        let keys = Self::runs_needed(commits, machines, index);
        self.resolve_runs(&keys, cache, cancel).await
    }

    /// Retrieve the given runs, see [`FetchOrchestrator::resolve`].
    /// Measurements come back in `keys` order, manifest order within a run.
    pub async fn resolve_runs(
        &self,
        keys: &[RunKey],
        cache: &ManifestCache,
        cancel: &CancellationToken,
    ) -> Result<ResultBag> {
        let mut stats = FetchStats {
            runs: keys.len(),
            ..FetchStats::default()
        };
        let mut tasks = JoinSet::new();

        for key in keys {
            if cache.contains(key) {
                stats.cached_runs += 1;
                for id in cache.missing_results(key) {
                    stats.results_requested += 1;
                    self.spawn_result(&mut tasks, key.clone(), id, cancel);
                }
            } else {
                stats.manifests_requested += 1;
                self.spawn_manifest(&mut tasks, key.clone(), cancel);
            }
        }

        debug!(
            "Resolving {} runs ({} cached): {} manifest and {} result retrievals issued",
            stats.runs, stats.cached_runs, stats.manifests_requested, stats.results_requested
        );

        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Retrieval task panicked: {}", e);
                    stats.failures += 1;
                    continue;
                }
            };

            match outcome {
                Outcome::Manifest(key, Ok(manifest)) => {
                    let ids = manifest.benchmark_ids.clone();
                    cache.put(key.clone(), manifest);
                    for id in ids {
                        stats.results_requested += 1;
                        self.spawn_result(&mut tasks, key.clone(), id, cancel);
                    }
                }
                Outcome::Manifest(key, Err(e)) => {
                    stats.failures += 1;
                    log_failure(&format!("manifest {}", key), &e);
                }
                Outcome::Result(key, _, Ok(result)) => {
                    cache.put_result(&key, result);
                }
                Outcome::Result(key, id, Err(e)) => {
                    stats.failures += 1;
                    log_failure(&format!("result {}/{}", key, id), &e);
                }
            }
        }

        if cancel.is_cancelled() {
            debug!("Resolve cancelled after {} retrievals", stats.requests());
            return Err(Error::Superseded);
        }

        let measurements: Vec<Measurement> = keys
            .iter()
            .flat_map(|key| {
                cache
                    .results(key)
                    .into_iter()
                    .map(move |result| Measurement::new(key, result))
            })
            .collect();

        if stats.failures > 0 {
            info!(
                "Resolved {} measurements, {} retrievals failed",
                measurements.len(),
                stats.failures
            );
        }

        Ok(ResultBag {
            measurements,
            stats,
        })
    }

    fn spawn_manifest(
        &self,
        tasks: &mut JoinSet<Outcome>,
        key: RunKey,
        cancel: &CancellationToken,
    ) {
        let source = Arc::clone(&self.source);
        let (commit, machine) = (key.commit.clone(), key.machine.clone());
        let call = async move { source.resolve_manifest(&commit, &machine).await };
        let limited = self.limited(format!("manifest {}", key), call, cancel);
        tasks.spawn(async move { Outcome::Manifest(key, limited.await) });
    }

    fn spawn_result(
        &self,
        tasks: &mut JoinSet<Outcome>,
        key: RunKey,
        id: String,
        cancel: &CancellationToken,
    ) {
        let source = Arc::clone(&self.source);
        let (commit, machine, benchmark_id) = (key.commit.clone(), key.machine.clone(), id.clone());
        let call = async move {
            source
                .resolve_result(&commit, &machine, &benchmark_id)
                .await
        };
        let limited = self.limited(format!("result {}/{}", key, id), call, cancel);
        tasks.spawn(async move { Outcome::Result(key, id, limited.await) });
    }

    /// Wrap a retrieval with the in-flight cap, the per-task deadline and the
    /// cancellation token.
    fn limited<T, F>(
        &self,
        what: String,
        call: F,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let deadline = self.config.task_timeout;
        let cancel = cancel.clone();

        async move {
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Superseded),
                permit = permits.acquire_owned() => permit
                    .map_err(|_| Error::Other("retrieval pool closed".to_string()))?,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Superseded),
                timed = tokio::time::timeout(deadline, call) => timed
                    .map_err(|_| Error::Timeout(format!("{} after {:?}", what, deadline)))?,
            }
        }
    }
}

fn log_failure(what: &str, err: &Error) {
    match err {
        e if e.is_absence() => debug!("No data for {}: {}", what, e),
        Error::Superseded => debug!("Dropped {}: superseded", what),
        e => warn!("Failed to fetch {}: {}", what, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Commit, SystemInfo};
    use crate::source::Schema;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeSource {
        runs: HashMap<RunKey, Vec<String>>,
        failing_results: HashSet<String>,
        delay: Option<Duration>,
        manifest_calls: AtomicUsize,
        result_calls: AtomicUsize,
    }

    impl FakeSource {
        fn with_run(mut self, commit: &str, machine: &str, ids: &[&str]) -> Self {
            self.runs.insert(
                RunKey::new(commit, machine),
                ids.iter().map(|s| s.to_string()).collect(),
            );
            self
        }

        fn failing(mut self, commit: &str, machine: &str, id: &str) -> Self {
            self.failing_results
                .insert(format!("{}/{}/{}", commit, machine, id));
            self
        }

        fn index(&self) -> RunIndex {
            RunIndex::from_runs(
                self.runs
                    .keys()
                    .map(|k| (k.commit.clone(), vec![k.machine.clone()])),
            )
        }
    }

    #[async_trait]
    impl BenchmarkSource for FakeSource {
        async fn load_graph(&self) -> Result<Vec<Commit>> {
            Ok(Vec::new())
        }

        async fn load_index(&self) -> Result<RunIndex> {
            Ok(self.index())
        }

        async fn resolve_manifest(&self, commit: &str, machine: &str) -> Result<RunManifest> {
            self.manifest_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let ids = self
                .runs
                .get(&RunKey::new(commit, machine))
                .ok_or_else(|| Error::NotFound(format!("{}/{}", commit, machine)))?;
            Ok(RunManifest {
                commit_hash: commit.to_string(),
                machine: machine.to_string(),
                system: SystemInfo::default(),
                benchmark_ids: ids.clone(),
            })
        }

        async fn resolve_result(
            &self,
            commit: &str,
            machine: &str,
            benchmark_id: &str,
        ) -> Result<BenchmarkResult> {
            self.result_calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failing_results
                .contains(&format!("{}/{}/{}", commit, machine, benchmark_id))
            {
                return Err(Error::Other("connection reset".to_string()));
            }
            Ok(BenchmarkResult {
                benchmark_id: benchmark_id.to_string(),
                estimate: benchmark_id.len() as f64,
                unit: "ns".to_string(),
                lower_bound: None,
                upper_bound: None,
            })
        }

        fn schema(&self) -> Schema {
            Schema::Split
        }
    }

    fn commits(hashes: &[&str]) -> Vec<Commit> {
        hashes
            .iter()
            .map(|h| Commit {
                hash: h.to_string(),
                parents: Vec::new(),
                date: Utc::now(),
                author: String::new(),
                message: String::new(),
                refs: String::new(),
                branches: Vec::new(),
                column: None,
                color: None,
            })
            .collect()
    }

    fn machines(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent_with_cache() {
        let source = Arc::new(
            FakeSource::default()
                .with_run("c1", "aorus", &["a", "b"])
                .with_run("c2", "aorus", &["a"])
                .with_run("c2", "macbook", &["a"]),
        );
        let index = source.index();
        let orchestrator = FetchOrchestrator::new(source.clone(), FetchConfig::default());
        let cache = ManifestCache::new();
        let cancel = CancellationToken::new();
        let view = commits(&["c1", "c2"]);
        let selected = machines(&["aorus", "macbook"]);

        let first = orchestrator
            .resolve(&view, &selected, &index, &cache, &cancel)
            .await
            .unwrap();
        assert_eq!(first.stats.manifests_requested, 3);
        assert_eq!(first.stats.results_requested, 4);
        assert_eq!(first.measurements.len(), 4);

        let second = orchestrator
            .resolve(&view, &selected, &index, &cache, &cancel)
            .await
            .unwrap();
        assert_eq!(second.stats.requests(), 0);
        assert_eq!(second.stats.cached_runs, 3);
        assert_eq!(second.measurements, first.measurements);

        assert_eq!(source.manifest_calls.load(Ordering::SeqCst), 3);
        assert_eq!(source.result_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_only_indexed_runs_are_requested() {
        let source = Arc::new(FakeSource::default().with_run("c1", "aorus", &["a"]));
        let index = source.index();
        let orchestrator = FetchOrchestrator::new(source.clone(), FetchConfig::default());

        let bag = orchestrator
            .resolve(
                &commits(&["c0", "c1"]),
                &machines(&["aorus", "macbook"]),
                &index,
                &ManifestCache::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(bag.stats.runs, 1);
        assert_eq!(source.manifest_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_result_does_not_affect_siblings() {
        let source = Arc::new(
            FakeSource::default()
                .with_run("c1", "aorus", &["a", "bb", "ccc"])
                .failing("c1", "aorus", "bb"),
        );
        let index = source.index();
        let orchestrator = FetchOrchestrator::new(source.clone(), FetchConfig::default());
        let cache = ManifestCache::new();

        let bag = orchestrator
            .resolve(
                &commits(&["c1"]),
                &machines(&["aorus"]),
                &index,
                &cache,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let ids: Vec<_> = bag
            .measurements
            .iter()
            .map(|m| m.benchmark_id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "ccc"]);
        assert_eq!(bag.stats.failures, 1);

        // The failed cell is retried on the next pass, nothing else is
        let again = orchestrator
            .resolve(
                &commits(&["c1"]),
                &machines(&["aorus"]),
                &index,
                &cache,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(again.stats.manifests_requested, 0);
        assert_eq!(again.stats.results_requested, 1);
    }

    #[tokio::test]
    async fn test_missing_manifest_is_swallowed() {
        let source = Arc::new(FakeSource::default().with_run("c1", "aorus", &["a"]));
        // The index claims a run the store does not have
        let index = RunIndex::from_runs(vec![
            ("c1".to_string(), machines(&["aorus"])),
            ("c2".to_string(), machines(&["aorus"])),
        ]);
        let orchestrator = FetchOrchestrator::new(source, FetchConfig::default());

        let bag = orchestrator
            .resolve(
                &commits(&["c1", "c2"]),
                &machines(&["aorus"]),
                &index,
                &ManifestCache::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(bag.measurements.len(), 1);
        assert_eq!(bag.stats.failures, 1);
    }

    #[tokio::test]
    async fn test_timeout_is_a_cell_failure() {
        let source = Arc::new(FakeSource {
            delay: Some(Duration::from_millis(200)),
            ..FakeSource::default().with_run("c1", "aorus", &["a"])
        });
        let index = source.index();
        let config = FetchConfig::new(4, Duration::from_millis(10)).unwrap();
        let orchestrator = FetchOrchestrator::new(source, config);
        let cache = ManifestCache::new();

        let bag = orchestrator
            .resolve(
                &commits(&["c1"]),
                &machines(&["aorus"]),
                &index,
                &cache,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(bag.measurements.is_empty());
        assert_eq!(bag.stats.failures, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_resolve_is_superseded() {
        let source = Arc::new(FakeSource::default().with_run("c1", "aorus", &["a"]));
        let index = source.index();
        let orchestrator = FetchOrchestrator::new(source, FetchConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = orchestrator
            .resolve(
                &commits(&["c1"]),
                &machines(&["aorus"]),
                &index,
                &ManifestCache::new(),
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(Error::Superseded)));
    }

    #[test]
    fn test_fetch_config_validation() {
        assert!(FetchConfig::new(0, Duration::from_secs(1)).is_err());
        assert!(FetchConfig::new(1, Duration::ZERO).is_err());
        assert_eq!(FetchConfig::default().max_in_flight, 32);
    }
}
