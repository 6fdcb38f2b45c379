//! Commit graph store
//!
//! Holds the commits of the benchmarked repository in chronological order
//! (oldest first) and answers "which commits belong to the current view".

use crate::data::Commit;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Commits in canonical oldest-first order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitGraph {
    commits: Vec<Commit>,
}

impl CommitGraph {
    /// Load a graph published newest-first, as `git-graph.json` is.
    pub fn load(mut newest_first: Vec<Commit>) -> Self {
        newest_first.reverse();
        Self {
            commits: newest_first,
        }
    }

    /// Build a graph from commits that are already oldest-first
    pub fn from_oldest_first(commits: Vec<Commit>) -> Self {
        Self { commits }
    }

    pub fn commits(&self) -> &[Commit] {
        &self.commits
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn get(&self, hash: &str) -> Option<&Commit> {
        self.commits.iter().find(|c| c.hash == hash)
    }

    /// Drop the history that predates the first commit satisfying `has_data`.
    ///
    /// Benchmarking usually starts long after the repository does; charts
    /// begin at the first measured commit. If nothing has data the graph is
    /// left untouched.
    pub fn trim_leading<F>(&mut self, has_data: F)
    where
        F: Fn(&str) -> bool,
    {
        if let Some(first) = self.commits.iter().position(|c| has_data(&c.hash)) {
            if first > 0 {
                debug!("Dropping {} commits older than the first benchmarked one", first);
                self.commits.drain(..first);
            }
        }
    }

    /// Ancestors and descendants of `pivot`, including the pivot itself, in
    /// canonical order.
    ///
    /// Without a pivot the full commit list is returned. A pivot that is not
    /// part of the graph yields an empty list.
    pub fn ancestry_closure(&self, pivot: Option<&str>) -> Vec<Commit> {
        let Some(pivot) = pivot else {
            return self.commits.clone();
        };

        let mut parents: HashMap<&str, &[String]> = HashMap::with_capacity(self.commits.len());
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();

        for commit in &self.commits {
            parents.insert(commit.hash.as_str(), commit.parents.as_slice());
            for parent in &commit.parents {
                children
                    .entry(parent.as_str())
                    .or_default()
                    .push(commit.hash.as_str());
            }
        }

        if !parents.contains_key(pivot) {
            debug!("Pivot {} is not part of the commit graph", pivot);
            return Vec::new();
        }

        let mut keep = reachable(pivot, |hash| {
            parents
                .get(hash)
                .copied()
                .map(|ps| ps.iter().map(String::as_str).collect())
                .unwrap_or_default()
        });
        keep.extend(reachable(pivot, |hash| {
            children.get(hash).cloned().unwrap_or_default()
        }));

        self.commits
            .iter()
            .filter(|c| keep.contains(c.hash.as_str()))
            .cloned()
            .collect()
    }
}

/// Iterative depth-first walk; the visited set guarantees termination.
fn reachable<'a, F>(start: &'a str, next: F) -> HashSet<&'a str>
where
    F: Fn(&'a str) -> Vec<&'a str>,
{
    let mut visited = HashSet::new();
    let mut stack = vec![start];

    while let Some(hash) = stack.pop() {
        if !visited.insert(hash) {
            continue;
        }
        stack.extend(next(hash).into_iter().filter(|h| !visited.contains(h)));
    }

    visited
}
