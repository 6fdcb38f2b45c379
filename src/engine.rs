//! Browsing session: owns the commit graph, the run index and the manifest
//! cache, and turns a selection into chart-ready series.

use crate::aggregate::{aggregate_ordered, ChartGroup, SeriesMap};
use crate::cache::ManifestCache;
use crate::data::{Commit, RunIndex, SystemInfo};
use crate::error::{Error, Result};
use crate::fetch::{FetchConfig, FetchOrchestrator, FetchStats};
use crate::graph::CommitGraph;
use crate::source::BenchmarkSource;
use crate::view;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Result of one aggregation pass
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Aggregate {
    /// Commits of the view, oldest first; every series has one point per entry
    pub commits: Vec<Commit>,
    pub series: SeriesMap,
    pub groups: Vec<ChartGroup>,
    pub stats: FetchStats,
}

impl Aggregate {
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

pub struct Session {
    source: Arc<dyn BenchmarkSource>,
    graph: CommitGraph,
    index: RunIndex,
    cache: ManifestCache,
    orchestrator: FetchOrchestrator,
    current: Mutex<CancellationToken>,
}

impl Session {
    /// Load the commit graph and run index. Any failure here means the
    /// dashboard has nothing to show and is reported as `Error::LoadError`.
    pub async fn open(source: Arc<dyn BenchmarkSource>, config: FetchConfig) -> Result<Self> {
        let (commits, index) = tokio::try_join!(source.load_graph(), source.load_index())
            .map_err(|e| match e {
                Error::LoadError(_) => e,
                other => Error::LoadError(other.to_string()),
            })?;

        let mut graph = CommitGraph::load(commits);
        graph.trim_leading(|hash| index.has_data(hash));

        info!(
            "Opened {} source: {} commits, {} benchmarked, {} machines",
            source.schema(),
            graph.len(),
            index.commits().count(),
            index.machines().len()
        );

        let orchestrator = FetchOrchestrator::new(Arc::clone(&source), config);

        Ok(Self {
            source,
            graph,
            index,
            cache: ManifestCache::new(),
            orchestrator,
            current: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn source(&self) -> &Arc<dyn BenchmarkSource> {
        &self.source
    }

    /// Commits in canonical oldest-first order
    pub fn commits(&self) -> &[Commit] {
        self.graph.commits()
    }

    pub fn graph(&self) -> &CommitGraph {
        &self.graph
    }

    pub fn index(&self) -> &RunIndex {
        &self.index
    }

    pub fn cache(&self) -> &ManifestCache {
        &self.cache
    }

    pub fn machines(&self) -> Vec<String> {
        view::machines(&self.index)
    }

    pub fn commits_with_data(&self) -> BTreeSet<String> {
        view::commits_with_data(&self.index)
    }

    pub fn system_info(&self, machine: &str) -> Option<SystemInfo> {
        view::system_info(machine, self.graph.commits(), &self.cache)
    }

    /// Cancel whatever aggregation is in flight and hand out the token for
    /// the next one.
    fn supersede(&self) -> CancellationToken {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        current.cancel();
        *current = CancellationToken::new();
        current.clone()
    }

    /// Cancel the in-flight aggregation, if any
    pub fn cancel(&self) {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .cancel();
    }

    /// Chart data for the commits related to `pivot` (all commits when
    /// `None`) on the selected `machines`.
    ///
    /// Starting a new aggregation cancels the previous one, which then
    /// returns `Error::Superseded` instead of stale series.
    pub async fn aggregate(&self, pivot: Option<&str>, machines: &[String]) -> Result<Aggregate> {
        let token = self.supersede();
        let commits = self.graph.ancestry_closure(pivot);

        if commits.is_empty() || machines.is_empty() {
            debug!("Nothing to aggregate for pivot {:?}", pivot);
            return Ok(Aggregate {
                commits,
                ..Aggregate::default()
            });
        }

        let bag = self
            .orchestrator
            .resolve(&commits, machines, &self.index, &self.cache, &token)
            .await?;

        if token.is_cancelled() {
            return Err(Error::Superseded);
        }

        let folded = aggregate_ordered(&commits, machines, &bag.measurements);
        let groups = view::chart_groups(&folded.order);
        let series = folded.series;

        debug!(
            "Aggregated {} benchmarks in {} groups over {} commits",
            series.len(),
            groups.len(),
            commits.len()
        );

        Ok(Aggregate {
            commits,
            series,
            groups,
            stats: bag.stats,
        })
    }
}
