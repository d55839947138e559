//! Dependency volume population.
//!
//! Drives one service's dependency volume from "unknown" to "populated"
//! through an explicit state machine:
//!
//! Start -> CleanSlate -> VolumeReady -> InstallDecision -> {Skip | Install}
//! -> Cleanup -> Done, with Failed reachable from any non-terminal state.
//!
//! The installer runs inside a disposable helper container whose working
//! directory is the in-container install directory with the volume mounted
//! there. On failure the helper, the service's container, and the volume
//! are all removed and the snapshot is marked so the next run starts from a
//! clean slate. The state machine carries no retry logic; callers wrap
//! `populate` in a bounded retry for the transient error class.

use tracing::{debug, instrument, warn};

use crate::error::{DockhandError, Result};
use crate::generate::{MANAGED_LABEL, PROJECT_LABEL};
use crate::manifest::ServiceRecord;
use crate::progress::ProgressReporter;
use crate::runtime::{ContainerRuntime, HelperSpec, ResourceLifecycle};
use crate::store::{PopulationState, ProjectStore};

pub mod filter;
pub mod forced;

pub use filter::InstallLineFilter;
pub use forced::{resolve_force_set, DependencyTree, NATIVE_WATCH_LIST};

/// Label carried by helper containers, valued with the project name.
pub const HELPER_LABEL: &str = "dev.dockhand.helper";

/// Store properties scoped to volume identity, cleared on fresh volumes.
const VOLUME_SCOPED_PROPERTIES: &[&str] = &["recent_commands", "executed_commands"];

/// States of the population machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PopulateState {
    Start,
    CleanSlate,
    VolumeReady,
    InstallDecision,
    Install,
    Skip,
    Cleanup,
    Done,
}

/// What population did, applied to the service record by the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PopulateOutcome {
    /// The volume was created by this run.
    pub fresh_volume: bool,
    /// An install actually ran.
    pub installed: bool,
    /// Packages force-reinstalled, in execution order.
    pub forced_packages: Vec<String>,
}

pub struct Populator<'a> {
    runtime: &'a dyn ContainerRuntime,
    store: &'a ProjectStore,
    project: String,
    progress: ProgressReporter,
}

impl<'a> Populator<'a> {
    pub fn new(
        runtime: &'a dyn ContainerRuntime,
        store: &'a ProjectStore,
        project: &str,
        progress: ProgressReporter,
    ) -> Self {
        Populator { runtime, store, project: project.to_string(), progress }
    }

    /// Populate one service's dependency volume. `force` requests an
    /// install regardless of the diff result.
    #[instrument(skip(self, record), fields(service = %record.name))]
    pub async fn populate(&self, record: &ServiceRecord, force: bool) -> Result<PopulateOutcome> {
        match self.run_machine(record, force).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.rollback(record).await;
                Err(err)
            }
        }
    }

    async fn run_machine(&self, record: &ServiceRecord, force: bool) -> Result<PopulateOutcome> {
        let volume = record.volume_name.as_deref().ok_or_else(|| {
            DockhandError::Configuration {
                reason: format!("service '{}' has no dependency volume", record.name),
            }
        })?;
        let helper = helper_name(volume);
        let lifecycle = ResourceLifecycle::new(self.runtime);
        let mut outcome = PopulateOutcome::default();
        let mut state = PopulateState::Start;

        loop {
            debug!(?state, "population state");
            state = match state {
                PopulateState::Start => PopulateState::CleanSlate,

                PopulateState::CleanSlate => {
                    // A helper left behind by an interrupted run would hold
                    // the volume; kill and remove it first.
                    lifecycle.ensure_container_absent(&helper, true).await?;
                    PopulateState::VolumeReady
                }

                PopulateState::VolumeReady => {
                    let labels = volume_labels(&self.project);
                    if lifecycle.ensure_volume(volume, &labels).await? {
                        outcome.fresh_volume = true;
                        // Cached command indices are scoped to volume
                        // identity and no longer apply.
                        for property in VOLUME_SCOPED_PROPERTIES {
                            self.store.delete_property(property)?;
                        }
                    }
                    PopulateState::InstallDecision
                }

                PopulateState::InstallDecision => {
                    if outcome.fresh_volume || record.changed || force {
                        PopulateState::Install
                    } else {
                        PopulateState::Skip
                    }
                }

                PopulateState::Skip => {
                    debug!(volume, "dependencies up to date");
                    PopulateState::Done
                }

                PopulateState::Install => {
                    self.install(record, volume, &helper, &mut outcome).await?;
                    PopulateState::Cleanup
                }

                PopulateState::Cleanup => {
                    lifecycle.ensure_container_absent(&helper, false).await?;
                    PopulateState::Done
                }

                PopulateState::Done => return Ok(outcome),
            };
        }
    }

    async fn install(
        &self,
        record: &ServiceRecord,
        volume: &str,
        helper: &str,
        outcome: &mut PopulateOutcome,
    ) -> Result<()> {
        let manager = record.manager.ok_or_else(|| DockhandError::Configuration {
            reason: format!("service '{}' has no resolved dependency manager", record.name),
        })?;
        let install_dir = record.install_dir.as_deref().ok_or_else(|| {
            DockhandError::Configuration {
                reason: format!("service '{}' has no install directory", record.name),
            }
        })?;
        let image = record.base_image.as_deref().ok_or_else(|| {
            DockhandError::Configuration {
                reason: format!("service '{}' has no base image", record.name),
            }
        })?;

        outcome.forced_packages = self.forced_packages(record)?;

        // Binding the shared host cache is skipped when the manager's
        // lockless mode makes it unsafe and when forced reinstalls would
        // contend with a held cache lock.
        let cache_bind = if manager.cache_mount_safe() && outcome.forced_packages.is_empty() {
            dirs::home_dir().map(|home| {
                (home.join(manager.cache_dir()), manager.cache_mount_target().to_string())
            })
        } else {
            None
        };

        let file_names: Vec<String> = record
            .manager_files
            .iter()
            .filter_map(|f| f.host_path.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        let script = install_script(
            manager,
            record.lockfile().is_some(),
            &file_names,
            &outcome.forced_packages,
        );

        let spec = HelperSpec {
            name: helper.to_string(),
            image: image.to_string(),
            workdir: install_dir.to_string(),
            volume: volume.to_string(),
            cache_bind,
            labels: vec![
                (HELPER_LABEL.to_string(), self.project.clone()),
                (PROJECT_LABEL.to_string(), self.project.clone()),
            ],
            script,
        };

        self.progress.emit(&format!("Installing dependencies for {}", record.name));
        self.runtime.create_helper(&spec).await?;

        for file in &record.manager_files {
            let name = file.host_path.file_name().unwrap_or_default().to_string_lossy();
            self.runtime
                .copy_into(helper, &file.host_path, &format!("{install_dir}/{name}"))
                .await?;
        }

        let line_filter = std::sync::Mutex::new(InstallLineFilter::new());
        let progress = self.progress.clone();
        let sink = move |line: &str| {
            let mut filter = line_filter.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(kept) = filter.filter(line) {
                progress.emit(&kept);
            }
        };

        let exit_code = self.runtime.run_attached(helper, &sink).await?;
        if exit_code != 0 {
            return Err(DockhandError::InstallFailed {
                service: record.name.clone(),
                exit_code,
            });
        }

        outcome.installed = true;
        Ok(())
    }

    fn forced_packages(&self, record: &ServiceRecord) -> Result<Vec<String>> {
        let mut forced: Vec<String> = Vec::new();

        // User-registered packages come from the snapshot's registry.
        if let Some(snapshot) = self.store.get()? {
            forced.extend(snapshot.enabled_force_reinstalls());
        }

        // The rest are resolved from the lockfile's dependency tree.
        if let (Some(lockfile), Some(manifest), Some(manager)) =
            (record.lockfile(), record.dependency_manifest(), record.manager)
        {
            let tree = DependencyTree::load(manager, &lockfile.host_path, &manifest.host_path)?;
            for package in resolve_force_set(&tree, NATIVE_WATCH_LIST) {
                if !forced.contains(&package) {
                    forced.push(package);
                }
            }
        }

        // Tree resolution already orders the build tool first; keep that
        // invariant when the registry contributed entries.
        if let Some(pos) = forced.iter().position(|p| p == forced::NATIVE_BUILD_TOOL) {
            let tool = forced.remove(pos);
            forced.insert(0, tool);
        }
        Ok(forced)
    }

    /// Tear down everything this service's failed install may have left:
    /// the helper, the service's own container, and the volume. Marks the
    /// snapshot so the next run treats the service as needing a clean
    /// install.
    async fn rollback(&self, record: &ServiceRecord) {
        warn!(service = %record.name, "install failed, rolling back");
        if let Err(e) = self.mark_population_failed() {
            warn!(error = %e, "could not mark snapshot population state");
        }

        let lifecycle = ResourceLifecycle::new(self.runtime);
        if let Some(volume) = &record.volume_name {
            let helper = helper_name(volume);
            if let Err(e) = lifecycle.ensure_container_absent(&helper, true).await {
                warn!(error = %e, helper, "rollback: helper removal failed");
            }
            if let Err(e) =
                lifecycle.ensure_container_absent(&record.container_name, true).await
            {
                warn!(error = %e, container = %record.container_name,
                    "rollback: container removal failed");
            }
            if let Err(e) = lifecycle.remove_volume_if_exists(volume).await {
                warn!(error = %e, volume, "rollback: volume removal failed");
            }
        }
    }

    fn mark_population_failed(&self) -> Result<()> {
        let mut snapshot = self.store.get()?.unwrap_or_default();
        snapshot.population = PopulationState::Failed;
        self.store.put(&snapshot)
    }
}

/// Stable helper container name for a volume.
pub fn helper_name(volume: &str) -> String {
    format!("dockhand-helper-{volume}")
}

fn volume_labels(project: &str) -> Vec<(String, String)> {
    vec![
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (PROJECT_LABEL.to_string(), project.to_string()),
    ]
}

/// Assemble the helper's shell script. The working directory is the
/// install directory; manager files are moved up one level so the install
/// directory holds nothing but the installed tree, then deleted once the
/// install finishes.
fn install_script(
    manager: crate::manifest::PackageManager,
    has_lockfile: bool,
    file_names: &[String],
    forced: &[String],
) -> String {
    let mut lines = vec!["set -e".to_string()];
    for name in file_names {
        lines.push(format!("mv \"{name}\" .."));
    }
    lines.push("cd ..".to_string());
    lines.push(manager.install_command(has_lockfile));
    for package in forced {
        lines.push(manager.force_install_command(package));
    }
    for name in file_names {
        lines.push(format!("rm -f \"{name}\""));
    }
    lines.join("\n")
}
