//! Artifact generation: the publishing side of the dashboard
//!
//! Produces `git-graph.json` from a local repository, regenerates the split
//! schema's per-run `run.json` files and its `manifest.json` from a results
//! directory, and flattens any source into the combined `all-data.json`.

use crate::cache::{ManifestCache, RunKey};
use crate::data::{BenchValue, CombinedDocument, Commit, RunIndexFile, RunManifest, SystemInfo};
use crate::error::{Error, Result};
use crate::fetch::{FetchConfig, FetchOrchestrator};
use crate::source::{BenchmarkSource, INDEX_FILE, RUN_FILE};
use chrono::{TimeZone, Utc};
use git2::{BranchType, Oid, Repository, Sort};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Write `value` as pretty JSON, creating parent directories
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::FileWriteError {
            path: parent.display().to_string(),
            source: e,
        })?;
    }

    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(path, content).map_err(|e| Error::FileWriteError {
        path: path.display().to_string(),
        source: e,
    })?;

    Ok(())
}

/// Branches whose names should claim shared history first
fn branch_rank(name: &str) -> (u8, &str) {
    match name {
        "main" | "master" => (0, name),
        _ => (1, name),
    }
}

/// Build the commit graph of every local branch, newest commit first.
///
/// Each commit is attributed to the first branch (mainline first, then by
/// name) whose first-parent chain reaches it. Lane layout is left to the
/// renderer.
pub fn export_graph(repo_path: &Path) -> Result<Vec<Commit>> {
    let repo = Repository::open(repo_path)?;

    let mut tips: Vec<(String, Oid)> = Vec::new();
    for branch in repo.branches(Some(BranchType::Local))? {
        let (branch, _) = branch?;
        if let (Some(name), Some(oid)) = (branch.name()?, branch.get().target()) {
            tips.push((name.to_string(), oid));
        }
    }
    tips.sort_by(|a, b| branch_rank(&a.0).cmp(&branch_rank(&b.0)));

    let mut decorations: HashMap<Oid, Vec<String>> = HashMap::new();
    for (name, oid) in &tips {
        decorations.entry(*oid).or_default().push(name.clone());
    }

    let mut tag_refs = Vec::new();
    repo.tag_foreach(|oid, name| {
        let name = String::from_utf8_lossy(name);
        tag_refs.push((oid, name.trim_start_matches("refs/tags/").to_string()));
        true
    })?;
    for (oid, name) in tag_refs {
        match repo.find_object(oid, None).and_then(|o| o.peel_to_commit()) {
            Ok(commit) => decorations
                .entry(commit.id())
                .or_default()
                .push(format!("tag: {}", name)),
            Err(e) => debug!("Skipping tag {}: {}", name, e),
        }
    }

    let mut owner: HashMap<Oid, String> = HashMap::new();
    for (name, tip) in &tips {
        let mut next = Some(*tip);
        while let Some(oid) = next {
            if owner.contains_key(&oid) {
                break;
            }
            owner.insert(oid, name.clone());
            next = repo.find_commit(oid)?.parent_id(0).ok();
        }
    }

    let mut revwalk = repo.revwalk()?;
    revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
    if tips.is_empty() {
        revwalk.push_head()?;
    }
    for (_, oid) in &tips {
        revwalk.push(*oid)?;
    }

    let mut records = Vec::new();
    for oid in revwalk {
        let oid = oid?;
        let commit = repo.find_commit(oid)?;
        let date = Utc
            .timestamp_opt(commit.time().seconds(), 0)
            .single()
            .ok_or_else(|| Error::GitError(git2::Error::from_str("Invalid timestamp")))?;

        records.push(Commit {
            hash: oid.to_string(),
            parents: commit.parent_ids().map(|p| p.to_string()).collect(),
            date,
            author: commit.author().name().unwrap_or("Unknown").to_string(),
            message: commit.message().unwrap_or("").trim().to_string(),
            refs: decorations
                .get(&oid)
                .map(|names| names.join(", "))
                .unwrap_or_default(),
            branches: owner.get(&oid).cloned().into_iter().collect(),
            column: None,
            color: None,
        });
    }

    info!(
        "Built commit graph with {} commits across {} branches",
        records.len(),
        tips.len()
    );
    Ok(records)
}

/// Legacy per-run system description, superseded by `run.json`
pub const LEGACY_SYSTEM_FILE: &str = "system_info.json";
/// Criterion group metadata, not a benchmark result
const GROUP_FILE: &str = "group.json";

fn read_dir(dir: &Path) -> Result<std::fs::ReadDir> {
    std::fs::read_dir(dir).map_err(|e| Error::FileReadError {
        path: dir.display().to_string(),
        source: e,
    })
}

/// `(commit, path)` of every directory under `db_root` named by a full
/// 40-character hex hash
fn commit_dirs(db_root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let hash_dir = Regex::new(r"^[0-9a-f]{40}$")?;
    let mut dirs = Vec::new();

    for entry in read_dir(db_root)? {
        let entry = entry?;
        let path = entry.path();
        let Some(commit) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if path.is_dir() && hash_dir.is_match(&commit) {
            dirs.push((commit, path));
        }
    }

    dirs.sort();
    Ok(dirs)
}

/// Scan `<commit>/<machine>/run.json` under `db_root` into an index.
///
/// Only directories named by a full 40-character hex hash are considered.
pub fn scan_runs(db_root: &Path) -> Result<RunIndexFile> {
    let mut index = RunIndexFile::default();

    if !db_root.exists() {
        warn!("Results directory not found at {}", db_root.display());
        return Ok(index);
    }

    for (commit, commit_dir) in commit_dirs(db_root)? {
        let mut runs = Vec::new();
        for run_entry in read_dir(&commit_dir)? {
            let run_entry = run_entry?;
            let Some(machine) = run_entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if run_entry.path().join(RUN_FILE).is_file() {
                runs.push(machine);
            } else if run_entry.path().is_dir() {
                warn!("Missing {} for {}/{}", RUN_FILE, commit, machine);
            }
        }

        if !runs.is_empty() {
            runs.sort();
            index.benches.insert(commit, runs);
        }
    }

    Ok(index)
}

/// Rebuild `manifest.json` in `db_root` from the runs on disk
pub fn rebuild_index(db_root: &Path) -> Result<RunIndexFile> {
    let index = scan_runs(db_root)?;
    save_json(&db_root.join(INDEX_FILE), &index)?;
    info!(
        "Indexed {} commits into {}",
        index.benches.len(),
        db_root.join(INDEX_FILE).display()
    );
    Ok(index)
}

/// Regenerate every `<commit>/<machine>/run.json` under `db_root` from the
/// result files on disk. Runs that cannot be synced are logged and skipped.
///
/// Returns the number of manifests written.
pub fn sync_runs(db_root: &Path) -> Result<usize> {
    if !db_root.exists() {
        warn!("Results directory not found at {}", db_root.display());
        return Ok(0);
    }

    let mut synced = 0;
    for (commit, commit_dir) in commit_dirs(db_root)? {
        for run_entry in read_dir(&commit_dir)? {
            let run_entry = run_entry?;
            let run_dir = run_entry.path();
            let Some(machine) = run_entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !run_dir.is_dir() {
                continue;
            }

            match sync_run(&run_dir, &commit, &machine) {
                Ok(manifest) => {
                    debug!(
                        "Synced {}/{} with {} benchmarks",
                        commit,
                        machine,
                        manifest.benchmark_ids.len()
                    );
                    synced += 1;
                }
                Err(e) => warn!("Failed to sync {} for {}/{}: {}", RUN_FILE, commit, machine, e),
            }
        }
    }

    info!("Synced {} {} files", synced, RUN_FILE);
    Ok(synced)
}

/// Rewrite `run_dir/run.json` listing every result file in the run.
///
/// System info is kept from the existing `run.json`, falling back to the
/// legacy `system_info.json`. Nested directories yield `group/name` ids.
pub fn sync_run(run_dir: &Path, commit: &str, machine: &str) -> Result<RunManifest> {
    let run_file = run_dir.join(RUN_FILE);
    let legacy = run_dir.join(LEGACY_SYSTEM_FILE);

    let system = read_json::<RunManifest>(&run_file)
        .map(|m| m.system)
        .or_else(|| read_json::<RunManifest>(&legacy).map(|m| m.system))
        .or_else(|| read_json::<SystemInfo>(&legacy))
        .ok_or_else(|| {
            Error::NotFound(format!(
                "{} or {} in {}",
                RUN_FILE,
                LEGACY_SYSTEM_FILE,
                run_dir.display()
            ))
        })?;

    let mut benchmark_ids = Vec::new();
    for entry in read_dir(run_dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };

        if path.is_dir() {
            collect_bench_ids(&path, &name, &mut benchmark_ids)?;
        } else if name != RUN_FILE && name != LEGACY_SYSTEM_FILE {
            if let Some(id) = name.strip_suffix(".json") {
                benchmark_ids.push(id.to_string());
            }
        }
    }
    benchmark_ids.sort();

    let manifest = RunManifest {
        commit_hash: commit.to_string(),
        machine: machine.to_string(),
        system,
        benchmark_ids,
    };
    save_json(&run_file, &manifest)?;

    Ok(manifest)
}

fn collect_bench_ids(dir: &Path, prefix: &str, ids: &mut Vec<String>) -> Result<()> {
    for entry in read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };

        if path.is_dir() {
            collect_bench_ids(&path, &format!("{}/{}", prefix, name), ids)?;
        } else if name != GROUP_FILE {
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(format!("{}/{}", prefix, id));
            }
        }
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("Ignoring unreadable {}: {}", path.display(), e);
            None
        }
    }
}

/// Read every run of `source` and inline it into one combined document.
///
/// Machine system info is taken from the machine's newest run in graph
/// order. Runs whose manifest cannot be read are left out.
pub async fn export_combined(
    source: Arc<dyn BenchmarkSource>,
    config: FetchConfig,
) -> Result<CombinedDocument> {
    let index = source.load_index().await?;

    // Without a graph, fall back to hash order for "newest"
    let position: HashMap<String, usize> = match source.load_graph().await {
        Ok(newest_first) => newest_first
            .into_iter()
            .rev()
            .enumerate()
            .map(|(i, c)| (c.hash, i))
            .collect(),
        Err(e) => {
            warn!("Exporting without commit order: {}", e);
            HashMap::new()
        }
    };

    let mut commits: Vec<&str> = index.commits().collect();
    commits.sort_by_key(|hash| (position.get(*hash).copied(), *hash));

    let keys: Vec<RunKey> = commits
        .iter()
        .flat_map(|commit| {
            index
                .machines_for(commit)
                .iter()
                .map(move |machine| RunKey::new(*commit, machine))
        })
        .collect();

    let cache = ManifestCache::new();
    let orchestrator = FetchOrchestrator::new(source, config);
    let bag = orchestrator
        .resolve_runs(&keys, &cache, &CancellationToken::new())
        .await?;

    let mut doc = CombinedDocument::default();
    let mut seen_runs = HashSet::new();
    for key in &keys {
        let Some(manifest) = cache.get(key) else {
            continue;
        };
        doc.machines
            .insert(key.machine.clone(), manifest.system.clone());

        let entry = doc.commits.entry(key.commit.clone()).or_default();
        if seen_runs.insert(key.clone()) {
            entry.machines.push(key.machine.clone());
        }
        let values = entry.benchmarks.entry(key.machine.clone()).or_default();
        for result in cache.results(key) {
            values.insert(result.benchmark_id.clone(), BenchValue::from(&result));
        }
    }

    info!(
        "Exported {} commits, {} machines ({} retrievals failed)",
        doc.commits.len(),
        doc.machines.len(),
        bag.stats.failures
    );
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SplitSource, COMBINED_FILE};
    use crate::store::LocalStore;
    use std::fs;
    use tempfile::TempDir;

    const H1: &str = "1111111111111111111111111111111111111111";
    const H2: &str = "2222222222222222222222222222222222222222";

    fn write(root: &Path, path: &str, content: &str) {
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }

    fn run_json(commit: &str, machine: &str, os: &str, ids: &[&str]) -> String {
        serde_json::json!({
            "commit_hash": commit,
            "name": machine,
            "os_version": os,
            "benchmarks": ids,
        })
        .to_string()
    }

    #[test]
    fn test_scan_runs_only_takes_hash_dirs_with_manifests() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), &format!("{}/aorus/run.json", H1), "{}");
        write(dir.path(), &format!("{}/macbook/run.json", H1), "{}");
        write(dir.path(), &format!("{}/broken/io.json", H2), "{}");
        write(dir.path(), "not-a-hash/aorus/run.json", "{}");

        let index = rebuild_index(dir.path()).unwrap();

        assert_eq!(index.benches.len(), 1);
        assert_eq!(index.benches[H1], vec!["aorus", "macbook"]);

        let written: RunIndexFile =
            serde_json::from_str(&fs::read_to_string(dir.path().join(INDEX_FILE)).unwrap())
                .unwrap();
        assert_eq!(written, index);
    }

    #[test]
    fn test_sync_runs_rebuilds_benchmark_lists() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let result = r#"{"mean": {"estimate": 1.0, "unit": "ns"}}"#;

        // Stale manifest: keeps its system info, loses its benchmark list
        write(root, &format!("{}/aorus/run.json", H1), &run_json(H1, "aorus", "linux", &["gone"]));
        write(root, &format!("{}/aorus/io.json", H1), result);
        write(root, &format!("{}/aorus/parse/small.json", H1), result);
        write(root, &format!("{}/aorus/parse/large.json", H1), result);
        write(root, &format!("{}/aorus/parse/group.json", H1), "{}");
        write(root, &format!("{}/aorus/render/scene/100.json", H1), result);

        // Legacy layout with only system_info.json
        write(root, &format!("{}/legacy/system_info.json", H1), r#"{"os_version": "old"}"#);
        write(root, &format!("{}/legacy/io.json", H1), result);

        // Nothing describes this machine
        write(root, &format!("{}/bare/io.json", H2), result);

        assert_eq!(sync_runs(root).unwrap(), 2);

        let aorus: RunManifest = serde_json::from_str(
            &fs::read_to_string(root.join(format!("{}/aorus/run.json", H1))).unwrap(),
        )
        .unwrap();
        assert_eq!(aorus.system.os_version, "linux");
        assert_eq!(
            aorus.benchmark_ids,
            vec!["io", "parse/large", "parse/small", "render/scene/100"]
        );

        let legacy: RunManifest = serde_json::from_str(
            &fs::read_to_string(root.join(format!("{}/legacy/run.json", H1))).unwrap(),
        )
        .unwrap();
        assert_eq!(legacy.commit_hash, H1);
        assert_eq!(legacy.machine, "legacy");
        assert_eq!(legacy.system.os_version, "old");
        assert_eq!(legacy.benchmark_ids, vec!["io"]);

        assert!(!root.join(format!("{}/bare/run.json", H2)).exists());

        let index = rebuild_index(root).unwrap();
        assert_eq!(index.benches[H1], vec!["aorus", "legacy"]);
        assert!(!index.benches.contains_key(H2));
    }

    #[test]
    fn test_sync_run_without_system_info_fails() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "io.json", "{}");

        let err = sync_run(dir.path(), H1, "aorus").unwrap_err();
        assert!(err.is_absence());
    }

    #[test]
    fn test_scan_runs_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let index = scan_runs(&dir.path().join("missing")).unwrap();
        assert!(index.benches.is_empty());
    }

    #[tokio::test]
    async fn test_export_combined_from_split_store() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(
            root,
            "manifest.json",
            &serde_json::json!({"benches": {H1: ["aorus"], H2: ["aorus", "ghost"]}}).to_string(),
        );
        write(
            root,
            "git-graph.json",
            &serde_json::json!([
                {"hash": H2, "parents": [H1], "date": "2024-01-02T00:00:00Z"},
                {"hash": H1, "parents": [], "date": "2024-01-01T00:00:00Z"},
            ])
            .to_string(),
        );
        write(root, &format!("{}/aorus/run.json", H1), &run_json(H1, "aorus", "old", &["io"]));
        write(root, &format!("{}/aorus/run.json", H2), &run_json(H2, "aorus", "new", &["io", "gone"]));
        write(root, &format!("{}/aorus/io.json", H1), r#"{"mean": {"estimate": 1.0, "unit": "ns"}}"#);
        write(root, &format!("{}/aorus/io.json", H2), r#"{"mean": {"estimate": 2.0, "unit": "ns"}}"#);

        let source = Arc::new(SplitSource::new(Arc::new(LocalStore::new(root))));
        let doc = export_combined(source, FetchConfig::default()).await.unwrap();

        assert_eq!(doc.machines.len(), 1);
        assert_eq!(doc.machines["aorus"].os_version, "new");
        assert_eq!(doc.commits[H2].machines, vec!["aorus"]);
        assert_eq!(doc.commits[H2].benchmarks["aorus"].len(), 1);
        assert_eq!(doc.commits[H1].benchmarks["aorus"]["io"].estimate, 1.0);

        save_json(&root.join(COMBINED_FILE), &doc).unwrap();
        assert!(root.join(COMBINED_FILE).is_file());
    }

    #[test]
    fn test_export_graph_attributes_branches() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let sig = git2::Signature::new("Tester", "t@example.org", &git2::Time::new(1_700_000_000, 0))
            .unwrap();

        let tree_id = repo.index().unwrap().write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let first = repo
            .commit(Some("HEAD"), &sig, &sig, "first\n", &tree, &[])
            .unwrap();
        let first_commit = repo.find_commit(first).unwrap();
        let second = repo
            .commit(Some("HEAD"), &sig, &sig, "second", &tree, &[&first_commit])
            .unwrap();
        repo.branch("feature", &first_commit, false).unwrap();
        repo.tag_lightweight("v0.1", repo.find_commit(second).unwrap().as_object(), false)
            .unwrap();

        let head_name = repo.head().unwrap().shorthand().unwrap().to_string();
        let graph = export_graph(dir.path()).unwrap();

        assert_eq!(graph.len(), 2);
        assert_eq!(graph[0].hash, second.to_string());
        assert_eq!(graph[0].parents, vec![first.to_string()]);
        assert_eq!(graph[1].message, "first");
        assert!(graph[0].refs.contains("tag: v0.1"));
        assert!(graph[0].refs.contains(&head_name));
        // Whichever branch ranks first claims the shared root
        let expected_owner = if branch_rank(&head_name) < branch_rank("feature") {
            head_name.clone()
        } else {
            "feature".to_string()
        };
        assert_eq!(graph[1].branches, vec![expected_owner]);
    }
}
