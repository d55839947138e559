//! Project model.
//!
//! Parses the compose manifest and each service's build file into a
//! normalized `ServiceRecord` map. This is where managed-runtime detection,
//! dependency-manager resolution, and manager-file location happen; the
//! records produced here feed the diff engine, the manifest generator, and
//! the populator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::buildfile::{BuildFile, VirtualFs};
use crate::error::{DockhandError, Result};
use crate::store::{FileStamp, ProjectSnapshot, ServiceSnapshot};

pub mod compose;


pub use compose::{ComposeFile, Service, VolumeMount};

/// Label that overrides lockfile-based manager detection.
pub const MANAGER_LABEL: &str = "dev.dockhand.package-manager";
/// Label listing global tools to install into the dependency volume.
pub const GLOBAL_TOOLS_LABEL: &str = "dev.dockhand.global-packages";
/// Label selecting a service for metrics instrumentation.
pub const INSTRUMENT_LABEL: &str = "dev.dockhand.instrument";
/// Label selecting a service for file watching.
pub const WATCH_LABEL: &str = "dev.dockhand.watch";

/// Marker directory that identifies managed-runtime services.
const DEPENDENCY_DIR: &str = "node_modules";

/// Supported dependency managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
}

impl PackageManager {
    pub fn name(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Yarn => "yarn",
            PackageManager::Pnpm => "pnpm",
        }
    }

    pub fn lockfile_name(&self) -> &'static str {
        match self {
            PackageManager::Npm => "package-lock.json",
            PackageManager::Yarn => "yarn.lock",
            PackageManager::Pnpm => "pnpm-lock.yaml",
        }
    }

    /// Manager-specific dotfiles that change install behavior when present.
    pub fn dotfiles(&self) -> &'static [&'static str] {
        match self {
            PackageManager::Npm => &[".npmrc"],
            PackageManager::Yarn => &[".yarnrc", ".yarnrc.yml"],
            PackageManager::Pnpm => &[".npmrc", ".pnpmfile.cjs"],
        }
    }

    /// Additional tracked files beyond manifest, lockfile, and dotfiles.
    pub fn extra_files(&self) -> &'static [&'static str] {
        match self {
            PackageManager::Npm => &["npm-shrinkwrap.json"],
            _ => &[],
        }
    }

    /// Base install command run inside the helper container.
    pub fn install_command(&self, has_lockfile: bool) -> String {
        match (self, has_lockfile) {
            (PackageManager::Npm, true) => "npm ci".to_string(),
            (PackageManager::Npm, false) => "npm install".to_string(),
            (PackageManager::Yarn, true) => "yarn install --frozen-lockfile".to_string(),
            (PackageManager::Yarn, false) => "yarn install".to_string(),
            (PackageManager::Pnpm, true) => "pnpm install --frozen-lockfile".to_string(),
            (PackageManager::Pnpm, false) => "pnpm install".to_string(),
        }
    }

    /// Command forcing a single package to rebuild from source.
    pub fn force_install_command(&self, package: &str) -> String {
        match self {
            PackageManager::Npm => format!("npm install --force {package}"),
            PackageManager::Yarn => format!("yarn add --force {package}"),
            PackageManager::Pnpm => format!("pnpm install --force {package}"),
        }
    }

    /// Command installing a global tool.
    pub fn global_install_command(&self, package: &str) -> String {
        match self {
            PackageManager::Npm => format!("npm install -g {package}"),
            PackageManager::Yarn => format!("yarn global add {package}"),
            PackageManager::Pnpm => format!("pnpm add -g {package}"),
        }
    }

    /// Host cache directory, relative to the home directory.
    pub fn cache_dir(&self) -> &'static str {
        match self {
            PackageManager::Npm => ".npm",
            PackageManager::Yarn => ".cache/yarn",
            PackageManager::Pnpm => ".local/share/pnpm/store",
        }
    }

    /// Cache mount point inside the helper container.
    pub fn cache_mount_target(&self) -> &'static str {
        match self {
            PackageManager::Npm => "/root/.npm",
            PackageManager::Yarn => "/usr/local/share/.cache/yarn",
            PackageManager::Pnpm => "/root/.local/share/pnpm/store",
        }
    }

    /// Whether bind-mounting the host cache is safe for this manager.
    /// pnpm hard-links out of its store, which breaks across a bind mount.
    pub fn cache_mount_safe(&self) -> bool {
        !matches!(self, PackageManager::Pnpm)
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "npm" => Some(PackageManager::Npm),
            "yarn" => Some(PackageManager::Yarn),
            "pnpm" => Some(PackageManager::Pnpm),
            _ => None,
        }
    }

    /// Infer the manager from lockfiles present in `dir`.
    pub fn detect(dir: &Path) -> Self {
        for manager in [PackageManager::Npm, PackageManager::Yarn, PackageManager::Pnpm] {
            if dir.join(manager.lockfile_name()).is_file() {
                return manager;
            }
        }
        PackageManager::Npm
    }
}

/// Role of a tracked manager file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerFileKind {
    /// package.json
    Manifest,
    /// The manager's lockfile
    Lockfile,
    /// Manager-specific dotfile
    Dotfile,
    /// Other tracked file (e.g. npm-shrinkwrap.json)
    Extra,
}

/// One tracked manager file with its host and container locations.
#[derive(Debug, Clone)]
pub struct ManagerFile {
    pub kind: ManagerFileKind,
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    /// Observed at parse time; promoted into the snapshot on success.
    pub mtime_ms: u64,
    /// sha256 of content, computed for the manifest when no lockfile exists.
    pub content_hash: Option<String>,
}

/// Normalized view of one manifest service.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub name: String,
    pub container_name: String,
    pub build_context: Option<PathBuf>,
    pub build_file: Option<PathBuf>,
    pub base_image: Option<String>,
    /// Effective working directory of the final build stage.
    pub working_dir: Option<String>,
    pub user: Option<String>,

    /// Whether this service participates in dependency-volume management.
    pub managed: bool,
    pub manager: Option<PackageManager>,
    pub manager_files: Vec<ManagerFile>,
    /// Host directory holding the dependency manifest.
    pub manifest_dir: Option<PathBuf>,
    /// In-container dependency install directory.
    pub install_dir: Option<String>,
    /// Named volume backing the install directory.
    pub volume_name: Option<String>,

    pub has_user: bool,
    pub global_tools: Vec<String>,
    pub instrumented: bool,
    pub watched: bool,

    /// Set by the diff engine.
    pub changed: bool,
    pub change_reason: Option<String>,
    /// Set by the populator when the volume was created this run.
    pub fresh_volume: bool,
    /// Assigned by the generator for instrumented services.
    pub health_port: Option<u16>,
}

impl ServiceRecord {
    pub fn lockfile(&self) -> Option<&ManagerFile> {
        self.manager_files.iter().find(|f| f.kind == ManagerFileKind::Lockfile)
    }

    pub fn dependency_manifest(&self) -> Option<&ManagerFile> {
        self.manager_files.iter().find(|f| f.kind == ManagerFileKind::Manifest)
    }

    pub fn dotfiles(&self) -> impl Iterator<Item = &ManagerFile> {
        self.manager_files.iter().filter(|f| f.kind == ManagerFileKind::Dotfile)
    }

    /// Snapshot form persisted at the end of a successful run.
    pub fn to_snapshot(&self) -> ServiceSnapshot {
        let files = self
            .manager_files
            .iter()
            .map(|f| {
                (
                    f.host_path.to_string_lossy().into_owned(),
                    FileStamp { mtime_ms: f.mtime_ms, content_hash: f.content_hash.clone() },
                )
            })
            .collect();
        ServiceSnapshot {
            container_name: self.container_name.clone(),
            volume_name: self.volume_name.clone().unwrap_or_default(),
            install_dir: self.install_dir.clone().unwrap_or_default(),
            files,
            has_user: self.has_user,
        }
    }
}

/// The parsed project: compose file plus per-service records.
#[derive(Debug, Clone)]
pub struct ProjectModel {
    pub name: String,
    pub root: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest_mtime_ms: u64,
    pub compose: ComposeFile,
    pub services: BTreeMap<String, ServiceRecord>,
    /// Build file path to observed mtime, for regeneration decisions.
    pub build_file_mtimes: BTreeMap<String, u64>,
}

impl ProjectModel {
    /// Parse a compose manifest and every referenced build file.
    pub fn parse(manifest_path: &Path, project_name: Option<&str>) -> Result<Self> {
        let manifest_path = manifest_path
            .canonicalize()
            .map_err(|e| DockhandError::FileRead { path: manifest_path.to_path_buf(), source: e })?;
        let root = manifest_path
            .parent()
            .ok_or_else(|| DockhandError::Configuration {
                reason: format!("manifest {} has no parent directory", manifest_path.display()),
            })?
            .to_path_buf();

        let name = match project_name {
            Some(n) => n.to_string(),
            None => root
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_else(|| "default".to_string()),
        };

        let content = std::fs::read_to_string(&manifest_path)
            .map_err(|e| DockhandError::FileRead { path: manifest_path.clone(), source: e })?;
        let compose: ComposeFile =
            serde_yaml::from_str(&content).map_err(|e| DockhandError::ManifestParse {
                path: manifest_path.clone(),
                reason: e.to_string(),
            })?;

        if compose.services.is_empty() {
            return Err(DockhandError::Configuration {
                reason: "manifest declares no services".to_string(),
            });
        }

        let manifest_mtime_ms = mtime_ms(&manifest_path)?;
        let mut services = BTreeMap::new();
        let mut build_file_mtimes = BTreeMap::new();

        for (svc_name, svc) in &compose.services {
            let record = parse_service(&name, &root, svc_name, svc)?;
            if let Some(build_file) = &record.build_file {
                build_file_mtimes
                    .insert(build_file.to_string_lossy().into_owned(), mtime_ms(build_file)?);
            }
            services.insert(svc_name.clone(), record);
        }

        debug!(
            project = %name,
            services = services.len(),
            managed = services.values().filter(|s| s.managed).count(),
            "parsed project model"
        );

        Ok(ProjectModel {
            name,
            root,
            manifest_path,
            manifest_mtime_ms,
            compose,
            services,
            build_file_mtimes,
        })
    }

    pub fn managed_services(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.services.values().filter(|s| s.managed)
    }

    /// Distinct dependency volumes, shared install dirs deduplicated.
    pub fn volume_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.services.values().filter_map(|s| s.volume_name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Snapshot of the whole project, preserving fields this run does not
    /// own (population state, force-reinstall registry, user properties).
    pub fn to_snapshot(&self, previous: Option<&ProjectSnapshot>) -> ProjectSnapshot {
        let mut snapshot = previous.cloned().unwrap_or_default();
        snapshot.manifest_mtime_ms = self.manifest_mtime_ms;
        snapshot.build_file_mtimes = self.build_file_mtimes.clone();
        snapshot.services =
            self.services.iter().map(|(k, v)| (k.clone(), v.to_snapshot())).collect();
        snapshot
    }
}

fn parse_service(
    project: &str,
    root: &Path,
    svc_name: &str,
    svc: &Service,
) -> Result<ServiceRecord> {
    let container_name = svc
        .container_name
        .clone()
        .unwrap_or_else(|| format!("{project}-{svc_name}-1"));

    let mut record = ServiceRecord {
        name: svc_name.to_string(),
        container_name,
        build_context: None,
        build_file: None,
        base_image: svc.image.clone(),
        working_dir: svc.working_dir.clone(),
        user: svc.user.clone(),
        managed: false,
        manager: None,
        manager_files: Vec::new(),
        manifest_dir: None,
        install_dir: None,
        volume_name: None,
        has_user: false,
        global_tools: parse_tool_list(svc.labels.get(GLOBAL_TOOLS_LABEL)),
        instrumented: label_truthy(svc.labels.get(INSTRUMENT_LABEL)),
        watched: label_truthy(svc.labels.get(WATCH_LABEL)),
        changed: false,
        change_reason: None,
        fresh_volume: false,
        health_port: None,
    };

    let mut vfs = VirtualFs::default();
    let mut context_dir = root.to_path_buf();
    let mut cmd_text = svc.command.as_ref().map(|c| c.text()).unwrap_or_default();

    if let Some(build) = &svc.build {
        context_dir = root.join(build.context());
        let build_file_path = context_dir.join(build.dockerfile());
        let build_file =
            BuildFile::parse_file(&build_file_path).map_err(|e| DockhandError::BuildFileParse {
                path: build_file_path.clone(),
                line: e.line,
                reason: e.message,
            })?;

        let target = build.target();
        validate_workdirs(&build_file, target, &build_file_path)?;

        let final_stage = build_file.final_stage(target).ok_or_else(|| {
            DockhandError::Configuration {
                reason: format!(
                    "service '{}' targets unknown build stage '{}'",
                    svc_name,
                    target.unwrap_or("")
                ),
            }
        })?;

        record.build_context = Some(context_dir.clone());
        record.build_file = Some(build_file_path);
        record.base_image = build_file.resolved_base_image(target).or(record.base_image);
        if record.working_dir.is_none() {
            record.working_dir = effective_workdir(&build_file, final_stage);
        }
        if record.user.is_none() {
            record.user = effective_user(&build_file, final_stage);
        }
        if cmd_text.is_empty() {
            cmd_text = final_stage.cmd.as_ref().map(|c| c.text()).unwrap_or_default();
        }

        vfs = VirtualFs::from_build(&build_file, target, &context_dir);
    }

    record.has_user = record.user.as_deref().map(|u| u != "root" && u != "0").unwrap_or(false);
    record.managed = is_managed_runtime(&cmd_text, record.base_image.as_deref(), &svc.volumes);

    if record.managed {
        resolve_dependencies(project, svc, &mut record, &vfs, &context_dir)?;
    }

    Ok(record)
}

/// Every stage the build uses must resolve to a working directory, either
/// its own or one inherited from the stage it builds from.
fn validate_workdirs(
    build_file: &BuildFile,
    target: Option<&str>,
    path: &Path,
) -> Result<()> {
    for stage in build_file.used_stages(target) {
        if !stage.copies.is_empty() && effective_workdir(build_file, stage).is_none() {
            return Err(DockhandError::Configuration {
                reason: format!(
                    "{}: stage '{}' copies files but declares no WORKDIR",
                    path.display(),
                    stage.name.as_deref().unwrap_or(&stage.from)
                ),
            });
        }
    }
    Ok(())
}

fn effective_workdir(build_file: &BuildFile, stage: &crate::buildfile::Stage) -> Option<String> {
    let mut current = stage;
    loop {
        if let Some(wd) = &current.workdir {
            return Some(wd.clone());
        }
        match build_file
            .stages
            .iter()
            .find(|s| s.name.as_deref() == Some(current.from.as_str()))
        {
            Some(parent) => current = parent,
            None => return None,
        }
    }
}

fn effective_user(build_file: &BuildFile, stage: &crate::buildfile::Stage) -> Option<String> {
    let mut current = stage;
    loop {
        if let Some(user) = &current.user {
            return Some(user.clone());
        }
        match build_file
            .stages
            .iter()
            .find(|s| s.name.as_deref() == Some(current.from.as_str()))
        {
            Some(parent) => current = parent,
            None => return None,
        }
    }
}

/// A service is managed when its command, image, or mounts point at the
/// dependency directory of the supported runtime.
fn is_managed_runtime(cmd: &str, image: Option<&str>, volumes: &[String]) -> bool {
    let cmd_hit = cmd
        .split_whitespace()
        .next()
        .map(|bin| {
            let bin = bin.rsplit('/').next().unwrap_or(bin);
            matches!(bin, "node" | "npm" | "npx" | "yarn" | "pnpm" | "nodemon" | "ts-node")
        })
        .unwrap_or(false);

    let image_hit = image
        .map(|img| {
            let repo = img.split(':').next().unwrap_or(img);
            repo == "node" || repo.ends_with("/node")
        })
        .unwrap_or(false);

    let mount_hit = volumes
        .iter()
        .any(|v| VolumeMount::parse(v).target().contains(DEPENDENCY_DIR));

    cmd_hit || image_hit || mount_hit
}

fn resolve_dependencies(
    project: &str,
    svc: &Service,
    record: &mut ServiceRecord,
    vfs: &VirtualFs,
    context_dir: &Path,
) -> Result<()> {
    // The dependency manifest's container location anchors everything else.
    let (container_manifest, host_manifest) = locate_dependency_manifest(record, vfs, context_dir)
        .ok_or_else(|| DockhandError::Configuration {
            reason: format!(
                "service '{}' looks like a managed runtime service but no package.json \
                 could be located",
                record.name
            ),
        })?;

    let container_dir = container_manifest
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));
    let host_dir = host_manifest
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| context_dir.to_path_buf());

    let install_dir = container_dir.join(DEPENDENCY_DIR);
    let install_dir_str = install_dir.to_string_lossy().into_owned();

    if let Some(workdir) = &record.working_dir {
        if !install_dir.starts_with(workdir) {
            return Err(DockhandError::Configuration {
                reason: format!(
                    "service '{}': dependency directory {} lies outside working directory {}",
                    record.name, install_dir_str, workdir
                ),
            });
        }
    }

    let manager = svc
        .labels
        .get(MANAGER_LABEL)
        .and_then(|v| PackageManager::from_label(&v))
        .unwrap_or_else(|| PackageManager::detect(&host_dir));

    let has_lockfile = host_dir.join(manager.lockfile_name()).is_file();
    let mut files = Vec::new();

    let mut track = |kind: ManagerFileKind, name: &str, hash: bool| -> Result<()> {
        let host_path = host_dir.join(name);
        if !host_path.is_file() {
            return Ok(());
        }
        let content_hash = if hash { Some(hash_file(&host_path)?) } else { None };
        files.push(ManagerFile {
            kind,
            host_path: host_path.clone(),
            container_path: container_dir.join(name),
            mtime_ms: mtime_ms(&host_path)?,
            content_hash,
        });
        Ok(())
    };

    // Hash the manifest only when no lockfile pins versions.
    track(ManagerFileKind::Manifest, "package.json", !has_lockfile)?;
    track(ManagerFileKind::Lockfile, manager.lockfile_name(), false)?;
    for dotfile in manager.dotfiles() {
        track(ManagerFileKind::Dotfile, dotfile, false)?;
    }
    for extra in manager.extra_files() {
        track(ManagerFileKind::Extra, extra, false)?;
    }

    record.manager = Some(manager);
    record.manager_files = files;
    record.manifest_dir = Some(host_dir);
    record.volume_name = Some(volume_name(project, &install_dir_str));
    record.install_dir = Some(install_dir_str);
    Ok(())
}

/// Find package.json through the build's virtual filesystem, preferring the
/// working directory; fall back to the build context root.
fn locate_dependency_manifest(
    record: &ServiceRecord,
    vfs: &VirtualFs,
    context_dir: &Path,
) -> Option<(PathBuf, PathBuf)> {
    let mut candidates: Vec<(PathBuf, PathBuf)> = vfs
        .container_paths()
        .filter(|p| p.file_name().map(|n| n == "package.json").unwrap_or(false))
        .filter_map(|p| {
            let host = vfs.host_path(p, context_dir)?;
            host.is_file().then(|| (p.clone(), host))
        })
        .collect();

    if let Some(workdir) = &record.working_dir {
        if let Some(hit) = candidates.iter().find(|(c, _)| c.starts_with(workdir)) {
            return Some(hit.clone());
        }
    }
    if let Some(hit) = candidates.pop() {
        return Some(hit);
    }

    // No build file path information, e.g. image-only services with a bind
    // mount; fall back to the workdir and the context root.
    let host = context_dir.join("package.json");
    if host.is_file() {
        let container = PathBuf::from(record.working_dir.as_deref().unwrap_or("/app"))
            .join("package.json");
        return Some((container, host));
    }
    None
}

/// Volume name shared by services resolving the same install directory.
pub fn volume_name(project: &str, install_dir: &str) -> String {
    let sanitized: String = install_dir
        .trim_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("{project}_{sanitized}")
}

fn parse_tool_list(label: Option<String>) -> Vec<String> {
    label
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn label_truthy(label: Option<String>) -> bool {
    matches!(label.as_deref().map(str::trim), Some("true") | Some("1") | Some("yes"))
}

/// Modification time of `path` in milliseconds since the epoch.
pub fn mtime_ms(path: &Path) -> Result<u64> {
    let meta = std::fs::metadata(path)
        .map_err(|e| DockhandError::FileRead { path: path.to_path_buf(), source: e })?;
    let modified = meta
        .modified()
        .map_err(|e| DockhandError::FileRead { path: path.to_path_buf(), source: e })?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0))
}

/// sha256 of a file's content, hex-encoded.
pub fn hash_file(path: &Path) -> Result<String> {
    let content = std::fs::read(path)
        .map_err(|e| DockhandError::FileRead { path: path.to_path_buf(), source: e })?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(hex::encode(hasher.finalize()))
}
