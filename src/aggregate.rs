//! Series aggregation
//!
//! Folds sparse measurements into one aligned series per benchmark: every
//! series has exactly one point per commit of the view, in view order, and a
//! missing measurement is an absent key rather than a placeholder value.

use crate::data::Commit;
use crate::fetch::Measurement;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

/// Separator between a benchmark's group and the rest of its id
pub const GROUP_SEPARATOR: char = '/';

/// One commit's row of a benchmark chart
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SeriesPoint {
    pub hash: String,
    pub short_hash: String,
    pub date: DateTime<Utc>,
    pub message: String,
    /// machine -> estimate; machines without a measurement are absent
    pub values: BTreeMap<String, f64>,
}

impl SeriesPoint {
    fn empty(commit: &Commit) -> Self {
        Self {
            hash: commit.hash.clone(),
            short_hash: commit.short_hash().to_string(),
            date: commit.date,
            message: commit.message.clone(),
            values: BTreeMap::new(),
        }
    }
}

/// Chart-ready history of one benchmark
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BenchmarkSeries {
    pub unit: String,
    pub points: Vec<SeriesPoint>,
}

/// benchmark id -> series
pub type SeriesMap = BTreeMap<String, BenchmarkSeries>;

/// Benchmarks shown together under one heading
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChartGroup {
    pub name: String,
    pub benchmarks: Vec<String>,
}

/// Output of [`aggregate_ordered`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregation {
    pub series: SeriesMap,
    /// Benchmark ids in the order they were first folded
    pub order: Vec<String>,
}

/// Build one aligned series per benchmark observed in `measurements`.
///
/// Measurements for commits outside `commits` or machines outside `machines`
/// are ignored. If a benchmark reports different units across cells, the
/// last one folded wins.
pub fn aggregate(commits: &[Commit], machines: &[String], measurements: &[Measurement]) -> SeriesMap {
    aggregate_ordered(commits, machines, measurements).series
}

/// Like [`aggregate`], also recording the first-seen order of benchmark ids.
pub fn aggregate_ordered(
    commits: &[Commit],
    machines: &[String],
    measurements: &[Measurement],
) -> Aggregation {
    let in_view: HashSet<&str> = commits.iter().map(|c| c.hash.as_str()).collect();
    let selected: HashSet<&str> = machines.iter().map(String::as_str).collect();

    // benchmark -> commit -> machine -> value
    let mut cells: HashMap<&str, HashMap<&str, BTreeMap<String, f64>>> = HashMap::new();
    let mut units: HashMap<&str, &str> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for m in measurements {
        if !in_view.contains(m.commit.as_str()) || !selected.contains(m.machine.as_str()) {
            continue;
        }

        if !cells.contains_key(m.benchmark_id.as_str()) {
            order.push(m.benchmark_id.clone());
        }
        cells
            .entry(m.benchmark_id.as_str())
            .or_default()
            .entry(m.commit.as_str())
            .or_default()
            .insert(m.machine.clone(), m.estimate);

        if let Some(previous) = units.insert(m.benchmark_id.as_str(), m.unit.as_str()) {
            if previous != m.unit {
                warn!(
                    "Benchmark {} reports mixed units ({} and {}), using {}",
                    m.benchmark_id, previous, m.unit, m.unit
                );
            }
        }
    }

    let series = cells
        .into_iter()
        .map(|(benchmark_id, by_commit)| {
            let points = commits
                .iter()
                .map(|commit| {
                    let mut point = SeriesPoint::empty(commit);
                    if let Some(values) = by_commit.get(commit.hash.as_str()) {
                        point.values = values.clone();
                    }
                    point
                })
                .collect();

            let series = BenchmarkSeries {
                unit: units.get(benchmark_id).copied().unwrap_or_default().to_string(),
                points,
            };
            (benchmark_id.to_string(), series)
        })
        .collect();

    Aggregation { series, order }
}

/// Group part of a benchmark id: everything before the first separator
pub fn group_name(benchmark_id: &str) -> &str {
    benchmark_id
        .split_once(GROUP_SEPARATOR)
        .map(|(group, _)| group)
        .unwrap_or(benchmark_id)
}

/// Partition benchmark ids by [`group_name`], keeping first-seen order of
/// both groups and ids.
pub fn group_by_prefix<'a, I>(benchmark_ids: I) -> Vec<ChartGroup>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut groups: Vec<ChartGroup> = Vec::new();
    let mut positions: HashMap<&str, usize> = HashMap::new();

    for id in benchmark_ids {
        let name = group_name(id);
        let idx = *positions.entry(name).or_insert_with(|| {
            groups.push(ChartGroup {
                name: name.to_string(),
                benchmarks: Vec::new(),
            });
            groups.len() - 1
        });
        groups[idx].benchmarks.push(id.to_string());
    }

    groups
}
