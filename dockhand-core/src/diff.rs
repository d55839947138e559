//! Change detection against the persisted snapshot.
//!
//! Per-service diffing answers "do dependencies need reinstalling"; the
//! project-level check answers "must the derived manifest be regenerated".
//! Lockfile mtimes are authoritative when a lockfile exists. Without one,
//! the dependency manifest's content hash decides, and the hash comparison
//! runs before any change is declared, so a bare mtime touch with identical
//! bytes does not trigger a reinstall.

use tracing::debug;

use crate::manifest::{ManagerFileKind, ProjectModel, ServiceRecord};
use crate::store::ProjectSnapshot;

/// Outcome of diffing one service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDiff {
    pub changed: bool,
    pub reason: Option<String>,
}

impl ServiceDiff {
    fn unchanged() -> Self {
        ServiceDiff { changed: false, reason: None }
    }

    fn changed(reason: impl Into<String>) -> Self {
        ServiceDiff { changed: true, reason: Some(reason.into()) }
    }
}

/// Compare a freshly parsed service against its snapshot entry.
pub fn diff_service(current: &ServiceRecord, snapshot: Option<&ProjectSnapshot>) -> ServiceDiff {
    let Some(prev) = snapshot.and_then(|s| s.services.get(&current.name)) else {
        return ServiceDiff::changed("no previous snapshot");
    };

    if let Some(lockfile) = current.lockfile() {
        let host = lockfile.host_path.to_string_lossy();
        match prev.files.get(host.as_ref()) {
            None => return ServiceDiff::changed(format!("lockfile {host} is new")),
            Some(stamp) if stamp.mtime_ms != lockfile.mtime_ms => {
                return ServiceDiff::changed(format!("lockfile {host} modified"));
            }
            Some(_) => {}
        }
    } else if let Some(manifest) = current.dependency_manifest() {
        let host = manifest.host_path.to_string_lossy();
        match prev.files.get(host.as_ref()) {
            None => return ServiceDiff::changed(format!("dependency manifest {host} is new")),
            Some(stamp) => {
                // Compare content before declaring change. An mtime touch
                // with identical bytes is not a change.
                let prev_hash = stamp.content_hash.as_deref();
                let cur_hash = manifest.content_hash.as_deref();
                if prev_hash.is_none() || prev_hash != cur_hash {
                    return ServiceDiff::changed(format!(
                        "dependency manifest {host} content changed"
                    ));
                }
            }
        }
    }

    for dotfile in current.dotfiles() {
        let host = dotfile.host_path.to_string_lossy();
        if !prev.files.contains_key(host.as_ref()) {
            return ServiceDiff::changed(format!("manager file {host} appeared"));
        }
    }

    ServiceDiff::unchanged()
}

/// Whether any project-level tracked file changed since the snapshot. A
/// change forces full regeneration of the derived manifest.
pub fn manifest_changed(model: &ProjectModel, snapshot: Option<&ProjectSnapshot>) -> bool {
    let Some(prev) = snapshot else {
        return true;
    };

    if prev.manifest_mtime_ms != model.manifest_mtime_ms {
        debug!(path = %model.manifest_path.display(), "manifest mtime changed");
        return true;
    }

    for (path, mtime) in &model.build_file_mtimes {
        match prev.build_file_mtimes.get(path) {
            Some(prev_mtime) if prev_mtime == mtime => {}
            _ => {
                debug!(path, "build file changed");
                return true;
            }
        }
    }

    // A build file that disappeared also invalidates the derived manifest.
    prev.build_file_mtimes.keys().any(|path| !model.build_file_mtimes.contains_key(path))
}

/// Run the diff over every managed service, recording results in place.
pub fn apply_diffs(model: &mut ProjectModel, snapshot: Option<&ProjectSnapshot>) {
    for record in model.services.values_mut().filter(|s| s.managed) {
        let diff = diff_service(record, snapshot);
        if diff.changed {
            debug!(service = %record.name, reason = ?diff.reason, "service changed");
        }
        record.changed = diff.changed;
        record.change_reason = diff.reason;
    }
}

/// True when a service's tracked file set includes a file of `kind`.
pub fn has_file(record: &ServiceRecord, kind: ManagerFileKind) -> bool {
    record.manager_files.iter().any(|f| f.kind == kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ManagerFile, PackageManager};
    use crate::store::{FileStamp, ServiceSnapshot};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn record(files: Vec<ManagerFile>) -> ServiceRecord {
        ServiceRecord {
            name: "api".to_string(),
            container_name: "p-api-1".to_string(),
            build_context: None,
            build_file: None,
            base_image: Some("node:20".to_string()),
            working_dir: Some("/app".to_string()),
            user: None,
            managed: true,
            manager: Some(PackageManager::Npm),
            manager_files: files,
            manifest_dir: Some(PathBuf::from("/proj")),
            install_dir: Some("/app/node_modules".to_string()),
            volume_name: Some("p_app_node_modules".to_string()),
            has_user: false,
            global_tools: Vec::new(),
            instrumented: false,
            watched: false,
            changed: false,
            change_reason: None,
            fresh_volume: false,
            health_port: None,
        }
    }

    fn file(kind: ManagerFileKind, host: &str, mtime_ms: u64, hash: Option<&str>) -> ManagerFile {
        ManagerFile {
            kind,
            host_path: PathBuf::from(host),
            container_path: PathBuf::from("/app").join(
                PathBuf::from(host).file_name().unwrap(),
            ),
            mtime_ms,
            content_hash: hash.map(str::to_string),
        }
    }

    fn snapshot_with(files: Vec<(&str, u64, Option<&str>)>) -> ProjectSnapshot {
        let mut snap = ProjectSnapshot::default();
        let stamps: BTreeMap<String, FileStamp> = files
            .into_iter()
            .map(|(p, m, h)| {
                (
                    p.to_string(),
                    FileStamp { mtime_ms: m, content_hash: h.map(str::to_string) },
                )
            })
            .collect();
        snap.services.insert(
            "api".to_string(),
            ServiceSnapshot {
                container_name: "p-api-1".to_string(),
                volume_name: "p_app_node_modules".to_string(),
                install_dir: "/app/node_modules".to_string(),
                files: stamps,
                has_user: false,
            },
        );
        snap
    }

    #[test]
    fn test_first_run_is_changed() {
        let rec = record(vec![]);
        let diff = diff_service(&rec, None);
        assert!(diff.changed);
        assert_eq!(diff.reason.as_deref(), Some("no previous snapshot"));
    }

    #[test]
    fn test_lockfile_mtime_governs() {
        let rec = record(vec![
            file(ManagerFileKind::Manifest, "/proj/package.json", 50, None),
            file(ManagerFileKind::Lockfile, "/proj/package-lock.json", 100, None),
        ]);

        let same = snapshot_with(vec![
            ("/proj/package.json", 50, None),
            ("/proj/package-lock.json", 100, None),
        ]);
        assert!(!diff_service(&rec, Some(&same)).changed);

        let older = snapshot_with(vec![
            ("/proj/package.json", 50, None),
            ("/proj/package-lock.json", 90, None),
        ]);
        assert!(diff_service(&rec, Some(&older)).changed);
    }

    #[test]
    fn test_manifest_mtime_touch_with_same_hash_is_not_a_change() {
        let rec = record(vec![file(
            ManagerFileKind::Manifest,
            "/proj/package.json",
            200,
            Some("abc"),
        )]);
        // Snapshot recorded an older mtime but the same content hash.
        let snap = snapshot_with(vec![("/proj/package.json", 100, Some("abc"))]);
        assert!(!diff_service(&rec, Some(&snap)).changed);
    }

    #[test]
    fn test_manifest_hash_change_without_lockfile() {
        let rec = record(vec![file(
            ManagerFileKind::Manifest,
            "/proj/package.json",
            200,
            Some("def"),
        )]);
        let snap = snapshot_with(vec![("/proj/package.json", 100, Some("abc"))]);
        let diff = diff_service(&rec, Some(&snap));
        assert!(diff.changed);
        assert!(diff.reason.unwrap().contains("content changed"));
    }

    #[test]
    fn test_hash_ignored_when_lockfile_present() {
        // Manifest bytes changed but the lockfile did not: unchanged.
        let rec = record(vec![
            file(ManagerFileKind::Manifest, "/proj/package.json", 300, None),
            file(ManagerFileKind::Lockfile, "/proj/package-lock.json", 100, None),
        ]);
        let snap = snapshot_with(vec![
            ("/proj/package.json", 100, None),
            ("/proj/package-lock.json", 100, None),
        ]);
        assert!(!diff_service(&rec, Some(&snap)).changed);
    }

    fn model_with(manifest_mtime: u64, build_files: Vec<(&str, u64)>) -> ProjectModel {
        ProjectModel {
            name: "p".to_string(),
            root: PathBuf::from("/proj"),
            manifest_path: PathBuf::from("/proj/docker-compose.yml"),
            manifest_mtime_ms: manifest_mtime,
            compose: Default::default(),
            services: BTreeMap::new(),
            build_file_mtimes: build_files
                .into_iter()
                .map(|(p, m)| (p.to_string(), m))
                .collect(),
        }
    }

    #[test]
    fn test_manifest_changed_tracks_all_files() {
        let model = model_with(10, vec![("/proj/Dockerfile", 5)]);

        assert!(manifest_changed(&model, None));

        let mut snap = ProjectSnapshot::default();
        snap.manifest_mtime_ms = 10;
        snap.build_file_mtimes.insert("/proj/Dockerfile".to_string(), 5);
        assert!(!manifest_changed(&model, Some(&snap)));

        snap.manifest_mtime_ms = 11;
        assert!(manifest_changed(&model, Some(&snap)));

        snap.manifest_mtime_ms = 10;
        snap.build_file_mtimes.insert("/proj/Dockerfile".to_string(), 6);
        assert!(manifest_changed(&model, Some(&snap)));

        snap.build_file_mtimes.insert("/proj/Dockerfile".to_string(), 5);
        snap.build_file_mtimes.insert("/proj/other.Dockerfile".to_string(), 1);
        assert!(manifest_changed(&model, Some(&snap)));
    }

    #[test]
    fn test_new_dotfile_is_a_change() {
        let rec = record(vec![
            file(ManagerFileKind::Lockfile, "/proj/package-lock.json", 100, None),
            file(ManagerFileKind::Dotfile, "/proj/.npmrc", 100, None),
        ]);
        let snap = snapshot_with(vec![("/proj/package-lock.json", 100, None)]);
        let diff = diff_service(&rec, Some(&snap));
        assert!(diff.changed);
        assert!(diff.reason.unwrap().contains(".npmrc"));
    }
}
