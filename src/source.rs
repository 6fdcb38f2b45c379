//! Storage schemas behind one access interface
//!
//! Benchmark history is published in one of two layouts:
//!
//! - **split**: a lightweight `manifest.json` index plus one `run.json` per
//!   commit/machine and one result file per benchmark
//! - **combined**: a single `all-data.json` with every value inlined
//!
//! Both implement [`BenchmarkSource`], so fetching and merging are written
//! once against the trait.

use crate::data::{
    BenchmarkResult, CombinedDocument, Commit, ResultFile, RunIndex, RunIndexFile, RunManifest,
};
use crate::error::{Error, Result};
use crate::store::{get_json, ObjectStore};
use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Commit graph document, newest commit first
pub const GRAPH_FILE: &str = "git-graph.json";
/// Split schema index
pub const INDEX_FILE: &str = "manifest.json";
/// Combined schema document
pub const COMBINED_FILE: &str = "all-data.json";
/// Per-run manifest file name
pub const RUN_FILE: &str = "run.json";

/// Relative path of a run manifest in the split schema
pub fn run_path(commit: &str, machine: &str) -> String {
    format!("{}/{}/{}", commit, machine, RUN_FILE)
}

/// Relative path of a benchmark result in the split schema
pub fn result_path(commit: &str, machine: &str, benchmark_id: &str) -> String {
    format!("{}/{}/{}.json", commit, machine, benchmark_id)
}

/// Storage-access interface shared by both schemas
#[async_trait]
pub trait BenchmarkSource: Send + Sync {
    /// Load the commit graph (newest first, as published)
    async fn load_graph(&self) -> Result<Vec<Commit>>;

    /// Load the top-level index of which commits have runs on which machines
    async fn load_index(&self) -> Result<RunIndex>;

    /// Retrieve the manifest of one run
    async fn resolve_manifest(&self, commit: &str, machine: &str) -> Result<RunManifest>;

    /// Retrieve one benchmark result of one run
    async fn resolve_result(
        &self,
        commit: &str,
        machine: &str,
        benchmark_id: &str,
    ) -> Result<BenchmarkResult>;

    /// Short name for log lines
    fn schema(&self) -> Schema;
}

/// Which artifact layout a store uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Schema {
    #[default]
    Split,
    Combined,
}

impl FromStr for Schema {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "split" => Ok(Schema::Split),
            "combined" => Ok(Schema::Combined),
            other => Err(Error::ConfigError(format!(
                "Unknown schema '{}'. Expected 'split' or 'combined'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schema::Split => write!(f, "split"),
            Schema::Combined => write!(f, "combined"),
        }
    }
}

/// Build the source for `schema` on top of `store`
pub fn open_source(store: Arc<dyn ObjectStore>, schema: Schema) -> Arc<dyn BenchmarkSource> {
    match schema {
        Schema::Split => Arc::new(SplitSource::new(store)),
        Schema::Combined => Arc::new(CombinedSource::new(store)),
    }
}

async fn load_graph_from(store: &dyn ObjectStore) -> Result<Vec<Commit>> {
    get_json(store, GRAPH_FILE).await.map_err(|e| {
        Error::LoadError(format!(
            "commit graph {} from {}: {}",
            GRAPH_FILE,
            store.describe(),
            e
        ))
    })
}

/// Index plus per-run manifests plus per-benchmark result files
pub struct SplitSource {
    store: Arc<dyn ObjectStore>,
}

impl SplitSource {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BenchmarkSource for SplitSource {
    async fn load_graph(&self) -> Result<Vec<Commit>> {
        load_graph_from(self.store.as_ref()).await
    }

    async fn load_index(&self) -> Result<RunIndex> {
        let file: RunIndexFile = get_json(self.store.as_ref(), INDEX_FILE)
            .await
            .map_err(|e| {
                Error::LoadError(format!(
                    "run index {} from {}: {}",
                    INDEX_FILE,
                    self.store.describe(),
                    e
                ))
            })?;
        info!(
            "Loaded run index with {} benchmarked commits",
            file.benches.len()
        );
        Ok(RunIndex::from(&file))
    }

    async fn resolve_manifest(&self, commit: &str, machine: &str) -> Result<RunManifest> {
        let mut manifest: RunManifest =
            get_json(self.store.as_ref(), &run_path(commit, machine)).await?;

        if manifest.commit_hash != commit || manifest.machine != machine {
            debug!(
                "run.json at {}/{} names {}/{}, keeping the requested key",
                commit, machine, manifest.commit_hash, manifest.machine
            );
            manifest.commit_hash = commit.to_string();
            manifest.machine = machine.to_string();
        }
        Ok(manifest)
    }

    async fn resolve_result(
        &self,
        commit: &str,
        machine: &str,
        benchmark_id: &str,
    ) -> Result<BenchmarkResult> {
        let file: ResultFile = get_json(
            self.store.as_ref(),
            &result_path(commit, machine, benchmark_id),
        )
        .await?;
        let mut result = BenchmarkResult::from_file(benchmark_id, file);
        // The manifest's id is the key everything downstream joins on
        result.benchmark_id = benchmark_id.to_string();
        Ok(result)
    }

    fn schema(&self) -> Schema {
        Schema::Split
    }
}

/// Everything inlined in `all-data.json`, fetched once per session
pub struct CombinedSource {
    store: Arc<dyn ObjectStore>,
    document: OnceCell<Arc<CombinedDocument>>,
}

impl CombinedSource {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            document: OnceCell::new(),
        }
    }

    /// Build a source around an already loaded document
    pub fn from_document(store: Arc<dyn ObjectStore>, document: CombinedDocument) -> Self {
        Self {
            store,
            document: OnceCell::new_with(Some(Arc::new(document))),
        }
    }

    async fn document(&self) -> Result<Arc<CombinedDocument>> {
        self.document
            .get_or_try_init(|| async {
                let doc: CombinedDocument = get_json(self.store.as_ref(), COMBINED_FILE)
                    .await
                    .map_err(|e| {
                        Error::LoadError(format!(
                            "combined document {} from {}: {}",
                            COMBINED_FILE,
                            self.store.describe(),
                            e
                        ))
                    })?;
                info!(
                    "Loaded {} with {} commits and {} machines",
                    COMBINED_FILE,
                    doc.commits.len(),
                    doc.machines.len()
                );
                Ok::<_, Error>(Arc::new(doc))
            })
            .await
            .cloned()
    }
}

#[async_trait]
impl BenchmarkSource for CombinedSource {
    async fn load_graph(&self) -> Result<Vec<Commit>> {
        load_graph_from(self.store.as_ref()).await
    }

    async fn load_index(&self) -> Result<RunIndex> {
        let doc = self.document().await?;
        Ok(RunIndex::from(doc.as_ref()))
    }

    async fn resolve_manifest(&self, commit: &str, machine: &str) -> Result<RunManifest> {
        let doc = self.document().await?;
        let values = doc
            .commits
            .get(commit)
            .and_then(|data| data.benchmarks.get(machine))
            .ok_or_else(|| Error::NotFound(format!("run {}/{}", commit, machine)))?;

        Ok(RunManifest {
            commit_hash: commit.to_string(),
            machine: machine.to_string(),
            system: doc.machines.get(machine).cloned().unwrap_or_default(),
            benchmark_ids: values.keys().cloned().collect(),
        })
    }

    async fn resolve_result(
        &self,
        commit: &str,
        machine: &str,
        benchmark_id: &str,
    ) -> Result<BenchmarkResult> {
        let doc = self.document().await?;
        let value = doc
            .commits
            .get(commit)
            .and_then(|data| data.benchmarks.get(machine))
            .and_then(|values| values.get(benchmark_id))
            .ok_or_else(|| {
                Error::NotFound(format!("result {}/{}/{}", commit, machine, benchmark_id))
            })?;

        Ok(BenchmarkResult {
            benchmark_id: benchmark_id.to_string(),
            estimate: value.estimate,
            unit: value.unit.clone(),
            lower_bound: None,
            upper_bound: None,
        })
    }

    fn schema(&self) -> Schema {
        Schema::Combined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalStore;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, path: &str, content: &str) {
        let full = dir.path().join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }

    #[test]
    fn test_schema_from_str() {
        assert_eq!("split".parse::<Schema>().unwrap(), Schema::Split);
        assert_eq!(" Combined ".parse::<Schema>().unwrap(), Schema::Combined);
        assert!("sqlite".parse::<Schema>().is_err());
    }

    #[test]
    fn test_paths() {
        assert_eq!(run_path("abc", "aorus"), "abc/aorus/run.json");
        assert_eq!(
            result_path("abc", "aorus", "parse/small"),
            "abc/aorus/parse/small.json"
        );
    }

    #[tokio::test]
    async fn test_split_source_resolves_run() {
        let dir = TempDir::new().unwrap();
        write(&dir, "manifest.json", r#"{"benches": {"abc": ["aorus"]}}"#);
        write(
            &dir,
            "abc/aorus/run.json",
            r#"{"commit_hash": "abc", "name": "aorus", "os_version": "Linux", "arch": "x86_64",
                "benchmarks": ["parse/small"]}"#,
        );
        write(
            &dir,
            "abc/aorus/parse/small.json",
            r#"{"id": "parse/small", "mean": {"estimate": 42.0, "unit": "ns"}}"#,
        );

        let source = SplitSource::new(Arc::new(LocalStore::new(dir.path())));

        let index = source.load_index().await.unwrap();
        assert!(index.has_run("abc", "aorus"));

        let manifest = source.resolve_manifest("abc", "aorus").await.unwrap();
        assert_eq!(manifest.system.arch, "x86_64");
        assert_eq!(manifest.benchmark_ids, vec!["parse/small"]);

        let result = source
            .resolve_result("abc", "aorus", "parse/small")
            .await
            .unwrap();
        assert_eq!(result.estimate, 42.0);

        let missing = source.resolve_result("abc", "aorus", "io").await.unwrap_err();
        assert!(missing.is_absence());
    }

    #[tokio::test]
    async fn test_split_source_malformed_index_is_load_error() {
        let dir = TempDir::new().unwrap();
        write(&dir, "manifest.json", r#"{"benches": ["not", "a", "map"]}"#);

        let source = SplitSource::new(Arc::new(LocalStore::new(dir.path())));
        assert!(matches!(
            source.load_index().await,
            Err(Error::LoadError(_))
        ));
    }

    #[tokio::test]
    async fn test_combined_source_synthesises_manifests() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "all-data.json",
            r#"{
                "machines": {"aorus": {"os_version": "Linux", "arch": "x86_64", "memory": 1024}},
                "commits": {"abc": {"machines": ["aorus"], "benchmarks": {"aorus": {
                    "io": {"estimate": 3.5, "unit": "ms"},
                    "parse/small": {"estimate": 42.0, "unit": "ns"}
                }}}}
            }"#,
        );

        let source = CombinedSource::new(Arc::new(LocalStore::new(dir.path())));

        let manifest = source.resolve_manifest("abc", "aorus").await.unwrap();
        assert_eq!(manifest.system.memory, 1024);
        assert_eq!(manifest.benchmark_ids, vec!["io", "parse/small"]);

        let result = source.resolve_result("abc", "aorus", "io").await.unwrap();
        assert_eq!(result.unit, "ms");

        assert!(source
            .resolve_manifest("abc", "macbook")
            .await
            .unwrap_err()
            .is_absence());
    }

    #[tokio::test]
    async fn test_missing_graph_is_load_error() {
        let dir = TempDir::new().unwrap();
        let source = CombinedSource::new(Arc::new(LocalStore::new(dir.path())));

        assert!(matches!(source.load_graph().await, Err(Error::LoadError(_))));
        assert!(matches!(source.load_index().await, Err(Error::LoadError(_))));
    }
}
