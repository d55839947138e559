//! Centralized path configuration for dockhand.
//!
//! All data paths go through this module so the CLI and any embedding tool
//! agree on where snapshots live.

use std::path::{Path, PathBuf};

/// Filename of the generated, volume-backed manifest variant.
pub const DERIVED_MANIFEST_NAME: &str = "docker-compose.dockhand.yml";

/// Get the dockhand data directory.
///
/// Resolution order:
/// 1. `DOCKHAND_DATA_DIR` environment variable
/// 2. `~/.dockhand`
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DOCKHAND_DATA_DIR") {
        return PathBuf::from(dir);
    }

    dirs::home_dir().map(|h| h.join(".dockhand")).unwrap_or_else(|| PathBuf::from(".dockhand"))
}

/// Directory holding one snapshot file per project.
pub fn projects_dir() -> PathBuf {
    data_dir().join("projects")
}

/// Path of the derived manifest for a project root.
pub fn derived_manifest_path(project_root: &Path) -> PathBuf {
    project_root.join(DERIVED_MANIFEST_NAME)
}
