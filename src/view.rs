//! Read-only projections for the presentation layer

use crate::aggregate::{group_by_prefix, ChartGroup};
use crate::cache::{ManifestCache, RunKey};
use crate::data::{Commit, RunIndex, SystemInfo};
use std::collections::BTreeSet;

/// Every machine the run index knows, regardless of the current selection
pub fn machines(index: &RunIndex) -> Vec<String> {
    index.machines().to_vec()
}

/// Commits that have at least one run on any machine
pub fn commits_with_data(index: &RunIndex) -> BTreeSet<String> {
    index.commits().map(str::to_string).collect()
}

/// System info of the newest cached run of `machine`.
///
/// `commits` is in canonical oldest-first order. Returns `None` until a
/// manifest of that machine has been fetched.
pub fn system_info(machine: &str, commits: &[Commit], cache: &ManifestCache) -> Option<SystemInfo> {
    commits
        .iter()
        .rev()
        .find_map(|commit| cache.get(&RunKey::new(&commit.hash, machine)))
        .map(|manifest| manifest.system.clone())
}

/// Display groups of the benchmarks in `order`, which lists each id once in
/// first-seen order
pub fn chart_groups(order: &[String]) -> Vec<ChartGroup> {
    group_by_prefix(order.iter().map(String::as_str))
}
