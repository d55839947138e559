//! Project snapshot persistence.
//!
//! One JSON document per project, keyed by a stable hash of the project's
//! filesystem path, stored under the dockhand data directory. The snapshot is
//! the sole source of truth for "did anything change since last run"; when it
//! is absent every service is treated as newly created. It is destroyed only
//! by explicit project teardown.

use crate::error::{DockhandError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Three-valued outcome of the last dependency-volume population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PopulationState {
    /// Population has never run for this project.
    #[default]
    NeverRun,
    /// The last population attempt failed; the next run must treat the
    /// affected services as needing a clean install.
    Failed,
    /// The last population attempt completed.
    Succeeded,
}

/// Last-observed state of one tracked manager file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileStamp {
    /// Modification time in milliseconds since the epoch.
    pub mtime_ms: u64,
    /// Content hash of the dependency manifest; only recorded when the
    /// service has no lockfile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// Persisted per-service state used for change detection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub container_name: String,
    pub volume_name: String,
    pub install_dir: String,
    /// Tracked manager files keyed by host path.
    #[serde(default)]
    pub files: BTreeMap<String, FileStamp>,
    /// Whether the service's build file declared a non-root user.
    #[serde(default)]
    pub has_user: bool,
}

/// One entry in the force-reinstall package registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForcedPackage {
    pub name: String,
    pub enabled: bool,
}

/// Persisted record of last-known file states and service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    /// Last known modification time of the manifest itself.
    #[serde(default)]
    pub manifest_mtime_ms: u64,
    /// Last known modification times of the per-service build files,
    /// keyed by host path.
    #[serde(default)]
    pub build_file_mtimes: BTreeMap<String, u64>,
    /// Per-service change-detection state.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSnapshot>,
    /// User-managed force-reinstall package registry.
    #[serde(default)]
    pub force_reinstall: Vec<ForcedPackage>,
    /// Outcome of the last population run.
    #[serde(default)]
    pub population: PopulationState,
    /// Whether one-time permission normalization has completed.
    #[serde(default)]
    pub user_setup_done: bool,
    /// Properties owned by other layers (e.g. the dashboard's command
    /// indices). Preserved verbatim, cleared through `delete_property`.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ProjectSnapshot {
    /// Names of the enabled force-reinstall packages.
    pub fn enabled_force_reinstalls(&self) -> Vec<String> {
        self.force_reinstall.iter().filter(|p| p.enabled).map(|p| p.name.clone()).collect()
    }
}

/// Key/value snapshot store for one project.
///
/// Exposed operations are get-whole-record, put-whole-record,
/// set-one-property, and delete-one-property.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    path: PathBuf,
}

impl ProjectStore {
    /// Store for the project rooted at `project_root`. The backing file is
    /// keyed by a hash of the canonicalized root so renames of the manifest
    /// do not orphan state.
    pub fn for_project(project_root: &Path) -> Self {
        let canonical =
            project_root.canonicalize().unwrap_or_else(|_| project_root.to_path_buf());
        let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
        let key = hex::encode(&digest[..8]);
        Self { path: paths::projects_dir().join(format!("{}.json", key)) }
    }

    /// Store at an explicit path (tests).
    pub fn at_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole snapshot. `None` when the project has never been run.
    pub fn get(&self) -> Result<Option<ProjectSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| DockhandError::FileRead { path: self.path.clone(), source: e })?;
        let snapshot = serde_json::from_str(&content)
            .map_err(|e| DockhandError::Snapshot { reason: format!("corrupt snapshot: {}", e) })?;
        Ok(Some(snapshot))
    }

    /// Replace the whole snapshot.
    pub fn put(&self, snapshot: &ProjectSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DockhandError::Io { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|e| DockhandError::Snapshot { reason: format!("serialize: {}", e) })?;
        std::fs::write(&self.path, content)
            .map_err(|e| DockhandError::Io { path: self.path.clone(), source: e })
    }

    /// Set one top-level property without rewriting the rest of the record.
    pub fn set_property(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let mut doc = self.raw_document()?;
        doc.insert(key.to_string(), value);
        self.write_raw(doc)
    }

    /// Delete one top-level property. Absence is success.
    pub fn delete_property(&self, key: &str) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let mut doc = self.raw_document()?;
        doc.remove(key);
        self.write_raw(doc)
    }

    /// Destroy the persisted snapshot. Only called from explicit teardown.
    pub fn destroy(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DockhandError::Io { path: self.path.clone(), source: e }),
        }
    }

    fn raw_document(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        if !self.path.exists() {
            return Ok(serde_json::Map::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| DockhandError::FileRead { path: self.path.clone(), source: e })?;
        match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(_) => Err(DockhandError::Snapshot { reason: "snapshot is not an object".into() }),
            Err(e) => Err(DockhandError::Snapshot { reason: format!("corrupt snapshot: {}", e) }),
        }
    }

    fn write_raw(&self, doc: serde_json::Map<String, serde_json::Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DockhandError::Io { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(&serde_json::Value::Object(doc))
            .map_err(|e| DockhandError::Snapshot { reason: format!("serialize: {}", e) })?;
        std::fs::write(&self.path, content)
            .map_err(|e| DockhandError::Io { path: self.path.clone(), source: e })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, ProjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::at_path(dir.path().join("snapshot.json"));
        (dir, store)
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        let (_dir, store) = temp_store();
        assert!(store.get().unwrap().is_none());
    }

    #[test]
    fn test_put_then_get_roundtrip() {
        let (_dir, store) = temp_store();

        let mut snapshot = ProjectSnapshot::default();
        snapshot.manifest_mtime_ms = 1_700_000_000_000;
        snapshot.population = PopulationState::Succeeded;
        snapshot.services.insert(
            "web".into(),
            ServiceSnapshot {
                container_name: "app-web".into(),
                volume_name: "app-web-modules".into(),
                install_dir: "/app/node_modules".into(),
                ..Default::default()
            },
        );

        store.put(&snapshot).unwrap();
        let loaded = store.get().unwrap().unwrap();
        assert_eq!(loaded.manifest_mtime_ms, 1_700_000_000_000);
        assert_eq!(loaded.population, PopulationState::Succeeded);
        assert_eq!(loaded.services["web"].volume_name, "app-web-modules");
    }

    #[test]
    fn test_set_property_preserves_record() {
        let (_dir, store) = temp_store();
        let mut snapshot = ProjectSnapshot::default();
        snapshot.user_setup_done = true;
        store.put(&snapshot).unwrap();

        store.set_property("recent_commands", serde_json::json!(["yarn test"])).unwrap();

        let loaded = store.get().unwrap().unwrap();
        assert!(loaded.user_setup_done);
        assert_eq!(loaded.extra["recent_commands"], serde_json::json!(["yarn test"]));
    }

    #[test]
    fn test_delete_property_is_idempotent() {
        let (_dir, store) = temp_store();
        // No file at all: still success.
        store.delete_property("recent_commands").unwrap();

        store.put(&ProjectSnapshot::default()).unwrap();
        store.set_property("recent_commands", serde_json::json!([])).unwrap();
        store.delete_property("recent_commands").unwrap();
        store.delete_property("recent_commands").unwrap();

        let loaded = store.get().unwrap().unwrap();
        assert!(!loaded.extra.contains_key("recent_commands"));
    }

    #[test]
    fn test_destroy_removes_file() {
        let (_dir, store) = temp_store();
        store.put(&ProjectSnapshot::default()).unwrap();
        store.destroy().unwrap();
        assert!(store.get().unwrap().is_none());
        // Second destroy is absence-is-success.
        store.destroy().unwrap();
    }

    #[test]
    fn test_enabled_force_reinstalls() {
        let mut snapshot = ProjectSnapshot::default();
        snapshot.force_reinstall = vec![
            ForcedPackage { name: "sharp".into(), enabled: true },
            ForcedPackage { name: "canvas".into(), enabled: false },
        ];
        assert_eq!(snapshot.enabled_force_reinstalls(), vec!["sharp".to_string()]);
    }
}
