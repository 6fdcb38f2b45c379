//! bench-history - benchmark history aggregation for commit-graph dashboards
//!
//! This library turns published benchmark artifacts (a commit graph plus
//! per-commit, per-machine result files) into chart-ready time series.
//!
//! # Features
//!
//! - Ancestor/descendant closure over the commit DAG
//! - Concurrent, cached retrieval of run manifests and benchmark results
//! - Split (`manifest.json` + per-run files) and combined (`all-data.json`)
//!   storage schemas behind one interface
//! - Series aligned to the commit axis, tolerant of missing measurements
//! - Artifact generation from a git repository and a results directory
//!
//! # Example
//!
//! ```no_run
//! use bench_history::{engine::Session, fetch::FetchConfig, source, store};
//!
//! # async fn run() -> bench_history::Result<()> {
//! let store = store::open_store("https://example.org/bench")?;
//! let source = source::open_source(store, source::Schema::Split);
//! let session = Session::open(source, FetchConfig::default()).await?;
//!
//! let machines = session.machines();
//! let view = session.aggregate(None, &machines).await?;
//! for group in &view.groups {
//!     println!("{}: {} charts", group.name, group.benchmarks.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod cache;
pub mod data;
pub mod engine;
pub mod error;
pub mod export;
pub mod fetch;
pub mod graph;
pub mod source;
pub mod store;
pub mod view;

pub use aggregate::{
    aggregate, aggregate_ordered, group_by_prefix, Aggregation, BenchmarkSeries, ChartGroup,
    SeriesMap, SeriesPoint,
};
pub use cache::{ManifestCache, RunKey};
pub use data::{BenchmarkResult, Commit, RunIndex, RunManifest, SystemInfo};
pub use engine::{Aggregate, Session};
pub use error::{Error, Result};
pub use fetch::{FetchConfig, FetchOrchestrator, Measurement, ResultBag};
pub use graph::CommitGraph;
pub use source::{BenchmarkSource, Schema};
pub use store::ObjectStore;
