//! Data structures for commits, run manifests and benchmark results
//!
//! These mirror the JSON artifacts published next to the dashboard:
//! `git-graph.json`, the run index, per-run `run.json` manifests and one
//! result file per benchmark.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Number of hash characters shown on chart axes
pub const SHORT_HASH_LEN: usize = 7;

/// A commit of the benchmarked repository
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Commit {
    /// Full commit SHA
    pub hash: String,
    /// Parent SHAs, first parent first
    #[serde(default)]
    pub parents: Vec<String>,
    /// Commit timestamp
    pub date: DateTime<Utc>,
    /// Author name
    #[serde(default)]
    pub author: String,
    /// Commit message
    #[serde(default)]
    pub message: String,
    /// Decorations, e.g. `"main, tag: v0.1"`
    #[serde(default)]
    pub refs: String,
    /// Branch the commit was attributed to
    #[serde(default)]
    pub branches: Vec<String>,
    /// Lane hint for the graph renderer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
    /// Lane color hint for the graph renderer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl Commit {
    /// Abbreviated hash used as chart label
    pub fn short_hash(&self) -> &str {
        match self.hash.char_indices().nth(SHORT_HASH_LEN) {
            Some((idx, _)) => &self.hash[..idx],
            None => &self.hash,
        }
    }
}

/// CPU description captured by the benchmark runner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CpuInfo {
    pub name: String,
    pub vendor_id: String,
    pub brand: String,
    pub frequency: u64,
}

/// GPU adapter reported by wgpu on the benchmark machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: String,
    pub driver: String,
    pub driver_info: String,
    pub backend: String,
}

/// Hardware and OS description of a benchmark machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_version: Option<String>,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub distribution_id: String,
    #[serde(default)]
    pub arch: String,
    /// Total memory in bytes
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub cpus: Vec<CpuInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wgpu_adapter_info: Option<AdapterInfo>,
}

/// Lists the benchmark result files recorded for one commit on one machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunManifest {
    pub commit_hash: String,
    /// Machine (run) name
    #[serde(rename = "name")]
    pub machine: String,
    #[serde(flatten)]
    pub system: SystemInfo,
    /// Benchmark IDs executed in this run
    #[serde(rename = "benchmarks", default)]
    pub benchmark_ids: Vec<String>,
}

/// Point estimate with optional confidence bounds, as written by criterion
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Estimate {
    pub estimate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_bound: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_bound: Option<f64>,
    pub unit: String,
}

/// On-disk shape of a single benchmark result file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub mean: Estimate,
}

/// A single benchmark measurement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchmarkResult {
    pub benchmark_id: String,
    /// Mean estimate, in `unit`
    pub estimate: f64,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_bound: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_bound: Option<f64>,
}

impl BenchmarkResult {
    /// Build a result from a result file, falling back to `benchmark_id` when
    /// the file does not name itself.
    pub fn from_file(benchmark_id: &str, file: ResultFile) -> Self {
        Self {
            benchmark_id: file.id.unwrap_or_else(|| benchmark_id.to_string()),
            estimate: file.mean.estimate,
            unit: file.mean.unit,
            lower_bound: file.mean.lower_bound,
            upper_bound: file.mean.upper_bound,
        }
    }
}

/// Inline value used by the combined document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchValue {
    pub estimate: f64,
    pub unit: String,
}

impl From<&BenchmarkResult> for BenchValue {
    fn from(result: &BenchmarkResult) -> Self {
        Self {
            estimate: result.estimate,
            unit: result.unit.clone(),
        }
    }
}

/// Per-commit section of the combined document
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CommitBenchData {
    /// Which machines have data for this commit
    #[serde(default)]
    pub machines: Vec<String>,
    /// machine -> benchmark id -> value
    #[serde(default)]
    pub benchmarks: BTreeMap<String, BTreeMap<String, BenchValue>>,
}

/// Combined `all-data.json`: every run of every commit in one document
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CombinedDocument {
    /// Per-machine system info (from the newest run)
    #[serde(default)]
    pub machines: BTreeMap<String, SystemInfo>,
    /// Per-commit benchmark data
    #[serde(default)]
    pub commits: BTreeMap<String, CommitBenchData>,
}

/// Lightweight split-schema index (`manifest.json`): commit -> run names
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RunIndexFile {
    #[serde(default)]
    pub benches: BTreeMap<String, Vec<String>>,
}

/// Which machines have a run for which commit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunIndex {
    runs: HashMap<String, Vec<String>>,
    machines: Vec<String>,
}

impl RunIndex {
    /// Build an index from `(commit, machines)` pairs.
    ///
    /// Known machines are the sorted union of every listed machine.
    pub fn from_runs<I>(runs: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let mut all_machines = BTreeSet::new();
        let mut by_commit: HashMap<String, Vec<String>> = HashMap::new();

        for (commit, machines) in runs {
            let entry = by_commit.entry(commit).or_default();
            for machine in machines {
                if !entry.contains(&machine) {
                    all_machines.insert(machine.clone());
                    entry.push(machine);
                }
            }
        }

        Self {
            runs: by_commit,
            machines: all_machines.into_iter().collect(),
        }
    }

    /// Add machines that may have no runs at all (the combined document lists
    /// them separately).
    pub fn with_machines<I>(mut self, machines: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut all: BTreeSet<String> = self.machines.drain(..).collect();
        all.extend(machines);
        self.machines = all.into_iter().collect();
        self
    }

    /// Whether `commit` has a run recorded for `machine`
    pub fn has_run(&self, commit: &str, machine: &str) -> bool {
        self.runs
            .get(commit)
            .is_some_and(|machines| machines.iter().any(|m| m == machine))
    }

    /// Machines with a run for `commit`
    pub fn machines_for(&self, commit: &str) -> &[String] {
        self.runs.get(commit).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether the index lists `commit` at all, even with no machines
    pub fn has_data(&self, commit: &str) -> bool {
        self.runs.contains_key(commit)
    }

    /// Commits listed in the index, in no particular order
    pub fn commits(&self) -> impl Iterator<Item = &str> {
        self.runs.keys().map(String::as_str)
    }

    /// Every machine known to the index, sorted by name
    pub fn machines(&self) -> &[String] {
        &self.machines
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

impl From<&RunIndexFile> for RunIndex {
    fn from(file: &RunIndexFile) -> Self {
        RunIndex::from_runs(
            file.benches
                .iter()
                .map(|(commit, runs)| (commit.clone(), runs.clone())),
        )
    }
}

impl From<&CombinedDocument> for RunIndex {
    fn from(doc: &CombinedDocument) -> Self {
        RunIndex::from_runs(doc.commits.iter().map(|(commit, data)| {
            let mut machines = data.machines.clone();
            for machine in data.benchmarks.keys() {
                if !machines.contains(machine) {
                    machines.push(machine.clone());
                }
            }
            (commit.clone(), machines)
        }))
        .with_machines(doc.machines.keys().cloned())
    }
}
