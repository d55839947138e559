//! Debounced file watchers.
//!
//! One polling task per watched directory; services sharing a directory
//! share a task. A change is acted on only after the tree has been quiet
//! for the debounce window, so a burst of writes (editor save, git
//! checkout) triggers a single restart.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::manifest::ProjectModel;
use crate::progress::ProgressReporter;
use crate::runtime::ContainerRuntime;

/// Quiet window before a change triggers a restart.
pub const DEBOUNCE: Duration = Duration::from_millis(250);
/// Poll interval between directory scans.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Directories skipped while scanning.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "dist", "build"];

/// Signature of a directory tree: file count and newest mtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeSignature {
    pub files: usize,
    pub newest_mtime_ms: u64,
}

/// Scan a tree, skipping dependency and VCS directories.
pub fn scan(path: &Path) -> TreeSignature {
    let mut sig = TreeSignature { files: 0, newest_mtime_ms: 0 };
    scan_into(path, &mut sig, 0);
    sig
}

fn scan_into(path: &Path, sig: &mut TreeSignature, depth: usize) {
    // Deep trees are someone else's build output.
    if depth > 16 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(path) else { return };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if SKIPPED_DIRS.contains(&name.as_ref()) || name.starts_with('.') {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            scan_into(&entry.path(), sig, depth + 1);
        } else {
            sig.files += 1;
            if let Ok(modified) = meta.modified() {
                let ms = modified
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                sig.newest_mtime_ms = sig.newest_mtime_ms.max(ms);
            }
        }
    }
}

/// Group watched services by directory so a shared path gets one watcher.
pub fn watch_groups(model: &ProjectModel) -> BTreeMap<PathBuf, Vec<String>> {
    let mut groups: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
    for record in model.services.values().filter(|s| s.watched) {
        let Some(path) = record.build_context.clone().or_else(|| record.manifest_dir.clone())
        else {
            continue;
        };
        groups.entry(path).or_default().push(record.container_name.clone());
    }
    groups
}

/// Running watcher tasks. Dropping the set aborts them.
#[derive(Debug)]
pub struct WatchSet {
    handles: Vec<(PathBuf, JoinHandle<()>)>,
}

impl WatchSet {
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn paths(&self) -> Vec<&Path> {
        self.handles.iter().map(|(p, _)| p.as_path()).collect()
    }
}

impl Drop for WatchSet {
    fn drop(&mut self) {
        for (_, handle) in &self.handles {
            handle.abort();
        }
    }
}

/// Spawn one watcher task per watched directory.
pub fn start_watchers(
    runtime: Arc<dyn ContainerRuntime>,
    model: &ProjectModel,
    progress: ProgressReporter,
) -> WatchSet {
    let mut handles = Vec::new();
    for (path, containers) in watch_groups(model) {
        debug!(path = %path.display(), containers = containers.len(), "starting watcher");
        let task = tokio::spawn(watch_loop(
            runtime.clone(),
            path.clone(),
            containers,
            progress.clone(),
        ));
        handles.push((path, task));
    }
    WatchSet { handles }
}

async fn watch_loop(
    runtime: Arc<dyn ContainerRuntime>,
    path: PathBuf,
    containers: Vec<String>,
    progress: ProgressReporter,
) {
    let mut current = scan(&path);
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        let mut next = scan(&path);
        if next == current {
            continue;
        }

        // Wait for the tree to settle before acting.
        loop {
            tokio::time::sleep(DEBOUNCE).await;
            let settled = scan(&path);
            if settled == next {
                break;
            }
            next = settled;
        }
        current = next;

        progress.emit(&format!("Change detected in {}, restarting", path.display()));
        for container in &containers {
            if let Err(e) = runtime.restart_container(container).await {
                warn!(container, error = %e, "restart after change failed");
            }
        }
    }
}
