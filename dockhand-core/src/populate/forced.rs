//! Force-reinstall resolution.
//!
//! Packages whose install runs native build steps (through node-gyp and
//! friends) can be left broken when a dependency volume is reused across
//! base-image changes. This module parses the service's lockfile into a
//! flat dependency tree and computes which packages must be reinstalled
//! with `--force`: everything that transitively depends on the native
//! watch-list and is not already a direct dependency (direct dependencies
//! are rebuilt by the base install). The result is deterministic: the
//! native build tool itself always comes first, the rest sorted by name,
//! since forced packages may need the build tool present to rebuild.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::{DockhandError, Result};
use crate::manifest::PackageManager;

/// Packages whose presence in a dependency chain marks it as native.
pub const NATIVE_WATCH_LIST: &[&str] = &[
    "node-gyp",
    "node-pre-gyp",
    "@mapbox/node-pre-gyp",
    "prebuild-install",
    "node-addon-api",
    "nan",
];

/// Build tool other forced packages may depend on; always reinstalled first.
pub const NATIVE_BUILD_TOOL: &str = "node-gyp";

/// Flattened dependency tree: package name to the names it depends on.
#[derive(Debug, Clone, Default)]
pub struct DependencyTree {
    pub dependencies: BTreeMap<String, BTreeSet<String>>,
    /// Direct dependencies declared in the service's package.json.
    pub direct: BTreeSet<String>,
}

impl DependencyTree {
    /// Load the tree for a service from its lockfile and manifest.
    pub fn load(
        manager: PackageManager,
        lockfile_path: &Path,
        manifest_path: &Path,
    ) -> Result<Self> {
        let lock = std::fs::read_to_string(lockfile_path)
            .map_err(|e| DockhandError::FileRead { path: lockfile_path.to_path_buf(), source: e })?;
        let manifest = std::fs::read_to_string(manifest_path)
            .map_err(|e| DockhandError::FileRead { path: manifest_path.to_path_buf(), source: e })?;

        match manager {
            PackageManager::Npm => Self::from_npm_lockfile(&lock, &manifest),
            PackageManager::Yarn => Self::from_yarn_lockfile(&lock, &manifest),
            PackageManager::Pnpm => Self::from_pnpm_lockfile(&lock, &manifest),
        }
    }

    /// Parse an npm lockfile, handling both the v2/v3 `packages` map and
    /// the v1 nested `dependencies` shape.
    pub fn from_npm_lockfile(lock: &str, manifest: &str) -> Result<Self> {
        let doc: serde_json::Value = serde_json::from_str(lock).map_err(|e| {
            DockhandError::Configuration { reason: format!("unreadable npm lockfile: {e}") }
        })?;

        let mut tree = DependencyTree { direct: direct_dependencies(manifest)?, ..Default::default() };

        if let Some(packages) = doc.get("packages").and_then(|p| p.as_object()) {
            for (key, entry) in packages {
                // Keys look like "node_modules/x" or "node_modules/a/node_modules/b".
                let Some(name) = key.rsplit("node_modules/").next().filter(|_| !key.is_empty())
                else {
                    continue;
                };
                if name.is_empty() {
                    continue;
                }
                let deps = tree.dependencies.entry(name.to_string()).or_default();
                for field in ["dependencies", "optionalDependencies"] {
                    if let Some(map) = entry.get(field).and_then(|d| d.as_object()) {
                        deps.extend(map.keys().cloned());
                    }
                }
            }
        } else if let Some(dependencies) = doc.get("dependencies").and_then(|d| d.as_object()) {
            collect_v1(dependencies, &mut tree.dependencies);
        }

        Ok(tree)
    }

    /// Parse a classic (v1) yarn lockfile.
    pub fn from_yarn_lockfile(lock: &str, manifest: &str) -> Result<Self> {
        let mut tree = DependencyTree { direct: direct_dependencies(manifest)?, ..Default::default() };
        let mut current: Option<String> = None;
        let mut in_deps = false;

        for line in lock.lines() {
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }

            if !line.starts_with(' ') && line.trim_end().ends_with(':') {
                // Block header: one or more specs, e.g. `sqlite3@^5.0.0:`.
                let spec = line.trim_end().trim_end_matches(':');
                let first = spec.split(',').next().unwrap_or(spec).trim().trim_matches('"');
                let name = package_name_of_spec(first);
                tree.dependencies.entry(name.clone()).or_default();
                current = Some(name);
                in_deps = false;
            } else if line.starts_with("  ") && line.trim() == "dependencies:" {
                in_deps = true;
            } else if in_deps && line.starts_with("    ") {
                if let Some(pkg) = &current {
                    let dep = line.trim().split_whitespace().next().unwrap_or("");
                    let dep = dep.trim_matches('"');
                    if !dep.is_empty() {
                        tree.dependencies.entry(pkg.clone()).or_default().insert(dep.to_string());
                    }
                }
            } else if line.starts_with("  ") && !line.starts_with("    ") {
                in_deps = false;
            }
        }

        Ok(tree)
    }

    /// Parse a pnpm lockfile (YAML, `packages` keyed by `name@version`).
    pub fn from_pnpm_lockfile(lock: &str, manifest: &str) -> Result<Self> {
        let doc: serde_yaml::Value = serde_yaml::from_str(lock).map_err(|e| {
            DockhandError::Configuration { reason: format!("unreadable pnpm lockfile: {e}") }
        })?;

        let mut tree = DependencyTree { direct: direct_dependencies(manifest)?, ..Default::default() };

        if let Some(packages) = doc.get("packages").and_then(|p| p.as_mapping()) {
            for (key, entry) in packages {
                let Some(key) = key.as_str() else { continue };
                let name = package_name_of_spec(key.trim_start_matches('/'));
                let deps = tree.dependencies.entry(name).or_default();
                for field in ["dependencies", "optionalDependencies"] {
                    if let Some(map) = entry.get(field).and_then(|d| d.as_mapping()) {
                        deps.extend(map.keys().filter_map(|k| k.as_str().map(str::to_string)));
                    }
                }
            }
        }

        Ok(tree)
    }

    /// Whether the tree contains `package` at all.
    pub fn contains(&self, package: &str) -> bool {
        self.dependencies.contains_key(package)
            || self.dependencies.values().any(|deps| deps.contains(package))
    }
}

/// Package name of a spec like `sqlite3@^5.0.0` or `@scope/pkg@1.2.3(peer)`.
fn package_name_of_spec(spec: &str) -> String {
    let spec = spec.split('(').next().unwrap_or(spec);
    match spec.rfind('@') {
        Some(0) | None => spec.to_string(),
        Some(pos) => spec[..pos].to_string(),
    }
}

fn direct_dependencies(manifest: &str) -> Result<BTreeSet<String>> {
    let doc: serde_json::Value = serde_json::from_str(manifest).map_err(|e| {
        DockhandError::Configuration { reason: format!("unreadable package.json: {e}") }
    })?;

    let mut direct = BTreeSet::new();
    for field in ["dependencies", "devDependencies", "optionalDependencies"] {
        if let Some(map) = doc.get(field).and_then(|d| d.as_object()) {
            direct.extend(map.keys().cloned());
        }
    }
    Ok(direct)
}

fn collect_v1(
    dependencies: &serde_json::Map<String, serde_json::Value>,
    out: &mut BTreeMap<String, BTreeSet<String>>,
) {
    for (name, entry) in dependencies {
        let deps = out.entry(name.clone()).or_default();
        if let Some(requires) = entry.get("requires").and_then(|r| r.as_object()) {
            deps.extend(requires.keys().cloned());
        }
        if let Some(nested) = entry.get("dependencies").and_then(|d| d.as_object()) {
            deps.extend(nested.keys().cloned());
            collect_v1(nested, out);
        }
    }
}

/// Compute the force-reinstall set for a tree.
pub fn resolve_force_set(tree: &DependencyTree, watch_list: &[&str]) -> Vec<String> {
    // Fixpoint of "reaches a watched package": seed with the watched
    // packages present in the tree, then pull in every dependent.
    let mut reaching: BTreeSet<String> = watch_list
        .iter()
        .filter(|w| tree.contains(w))
        .map(|w| w.to_string())
        .collect();

    loop {
        let before = reaching.len();
        for (name, deps) in &tree.dependencies {
            if deps.iter().any(|d| reaching.contains(d)) {
                reaching.insert(name.clone());
            }
        }
        if reaching.len() == before {
            break;
        }
    }

    let mut forced: Vec<String> = reaching
        .into_iter()
        .filter(|name| !tree.direct.contains(name))
        .filter(|name| tree.dependencies.contains_key(name))
        .collect();
    forced.sort();

    // The build tool goes first; forced packages may need it to rebuild.
    if let Some(pos) = forced.iter().position(|p| p == NATIVE_BUILD_TOOL) {
        let tool = forced.remove(pos);
        forced.insert(0, tool);
    }
    forced
}
