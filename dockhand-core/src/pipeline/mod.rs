//! The up pipeline.
//!
//! Sequences validation, diffing, derived-manifest generation, volume
//! population, permission normalization, image builds, global tool
//! installs, watcher startup, and finally `compose up`, as ordinary
//! sequential calls over a typed context. The first stage error
//! short-circuits the run; artifacts from completed stages (a regenerated
//! derived manifest, populated volumes) are left in place, since they are
//! idempotent to recreate and useful for debugging.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::diff::{apply_diffs, manifest_changed};
use crate::error::{DockhandError, Result};
use crate::generate::{self, PROJECT_LABEL};
use crate::manifest::ProjectModel;
use crate::paths;
use crate::populate::{helper_name, PopulateOutcome, Populator};
use crate::progress::ProgressReporter;
use crate::retry::with_retry;
use crate::runtime::{ContainerRuntime, ContainerState, HelperSpec, ResourceLifecycle};
use crate::store::{ForcedPackage, PopulationState, ProjectStore};

pub mod watch;

pub use watch::WatchSet;

/// User-facing options for an up run.
#[derive(Debug, Clone)]
pub struct UpOptions {
    pub manifest_path: PathBuf,
    pub project_name: Option<String>,
    pub detach: bool,
    /// Reinstall dependencies even when nothing changed.
    pub reinstall: bool,
    pub no_watch: bool,
    /// Services instrumented in addition to those labeled in the manifest.
    pub instrument: Vec<String>,
}

/// Everything the pipeline accumulates across stages. All fields are
/// declared upfront; stages fill them in order and never mutate what an
/// earlier stage produced.
#[derive(Debug)]
pub struct PipelineContext {
    pub model: ProjectModel,
    pub store: ProjectStore,
    pub snapshot: Option<crate::store::ProjectSnapshot>,
    pub derived_manifest: PathBuf,
    pub regenerated: bool,
    pub container_states: BTreeMap<String, ContainerState>,
    pub populate_outcomes: BTreeMap<String, PopulateOutcome>,
    pub built_services: Vec<String>,
    pub permissions_normalized: bool,
    pub watchers: Option<WatchSet>,
}

pub struct UpPipeline {
    runtime: Arc<dyn ContainerRuntime>,
    progress: ProgressReporter,
}

impl UpPipeline {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, progress: ProgressReporter) -> Self {
        UpPipeline { runtime, progress }
    }

    /// Run the full pipeline. On success the snapshot is committed with
    /// the file timestamps observed at parse time.
    #[instrument(skip(self, options), fields(manifest = %options.manifest_path.display()))]
    pub async fn run(&self, options: &UpOptions) -> Result<PipelineContext> {
        let mut ctx = self.validate(options).await?;
        self.decide_regeneration(&mut ctx, options)?;
        self.generate(&mut ctx)?;
        self.observe_containers(&mut ctx).await?;
        self.populate(&mut ctx, options).await?;
        self.normalize_permissions(&mut ctx).await?;
        self.build_images(&mut ctx).await?;
        self.install_global_tools(&ctx).await?;
        self.start_watchers(&mut ctx, options);
        self.compose_up(&ctx, options).await?;
        self.commit(&mut ctx)?;
        Ok(ctx)
    }

    /// Parse the project, check the runtime is reachable, and let the
    /// runtime validate the manifest so its exact diagnostics surface.
    async fn validate(&self, options: &UpOptions) -> Result<PipelineContext> {
        self.runtime.ping().await?;

        let mut model =
            ProjectModel::parse(&options.manifest_path, options.project_name.as_deref())?;
        for name in &options.instrument {
            if let Some(record) = model.services.get_mut(name) {
                record.instrumented = true;
            }
        }

        self.runtime.validate_manifest(&model.manifest_path, &model.name).await?;

        let store = ProjectStore::for_project(&model.root);
        let snapshot = store.get()?;
        let derived_manifest = paths::derived_manifest_path(&model.root);

        Ok(PipelineContext {
            model,
            store,
            snapshot,
            derived_manifest,
            regenerated: false,
            container_states: BTreeMap::new(),
            populate_outcomes: BTreeMap::new(),
            built_services: Vec::new(),
            permissions_normalized: false,
            watchers: None,
        })
    }

    /// Diff against the snapshot and decide whether the derived manifest
    /// must be rewritten.
    fn decide_regeneration(&self, ctx: &mut PipelineContext, options: &UpOptions) -> Result<()> {
        apply_diffs(&mut ctx.model, ctx.snapshot.as_ref());

        // A previously failed population means the volumes were rolled
        // back; every managed service needs a clean install.
        if ctx.snapshot.as_ref().map(|s| s.population) == Some(PopulationState::Failed) {
            for record in ctx.model.services.values_mut().filter(|s| s.managed) {
                record.changed = true;
                record.change_reason = Some("previous install failed".to_string());
            }
        }

        ctx.regenerated = manifest_changed(&ctx.model, ctx.snapshot.as_ref())
            || !ctx.derived_manifest.exists()
            || options.reinstall
            || ctx.snapshot.is_none();
        debug!(regenerate = ctx.regenerated, "regeneration decision");
        Ok(())
    }

    fn generate(&self, ctx: &mut PipelineContext) -> Result<()> {
        if !ctx.regenerated {
            return Ok(());
        }
        self.progress.emit("Generating derived manifest");
        ctx.derived_manifest = generate::generate(&mut ctx.model)?;
        Ok(())
    }

    async fn observe_containers(&self, ctx: &mut PipelineContext) -> Result<()> {
        for record in ctx.model.services.values() {
            let state = self.runtime.container_state(&record.container_name).await?;
            ctx.container_states.insert(record.name.clone(), state);
        }
        Ok(())
    }

    /// Populate dependency volumes, one service at a time. Sequential by
    /// design: helpers share the host package cache, and concurrent
    /// writers would corrupt it. The transient error class gets one
    /// automatic retry.
    async fn populate(&self, ctx: &mut PipelineContext, options: &UpOptions) -> Result<()> {
        let populator = Populator::new(
            self.runtime.as_ref(),
            &ctx.store,
            &ctx.model.name,
            self.progress.clone(),
        );

        let managed: Vec<String> =
            ctx.model.managed_services().map(|s| s.name.clone()).collect();
        for name in managed {
            let record = &ctx.model.services[&name];

            // A running container holds the dependency volume; stop it
            // before the helper reinstalls into that volume.
            let reinstalling = record.changed || options.reinstall;
            if reinstalling
                && ctx.container_states.get(&name) == Some(&ContainerState::Running)
            {
                self.progress.emit(&format!("Stopping {name} for reinstall"));
                self.runtime.stop_container(&record.container_name).await?;
            }

            let outcome = with_retry(2, DockhandError::is_transient, || {
                populator.populate(record, options.reinstall)
            })
            .await?;

            if let Some(record) = ctx.model.services.get_mut(&name) {
                record.fresh_volume = outcome.fresh_volume;
            }
            ctx.populate_outcomes.insert(name, outcome);
        }
        Ok(())
    }

    /// One-time chown of the install directory for services that run as a
    /// non-root user, done inside a short-lived container mounting the
    /// volume. Only the volume's contents persist, which is exactly what
    /// needs fixing.
    async fn normalize_permissions(&self, ctx: &mut PipelineContext) -> Result<()> {
        let already_done = ctx.snapshot.as_ref().map(|s| s.user_setup_done).unwrap_or(false);
        if already_done {
            ctx.permissions_normalized = true;
            return Ok(());
        }

        let lifecycle = ResourceLifecycle::new(self.runtime.as_ref());
        let mut any = false;

        let targets: Vec<(String, String, String, String, String)> = ctx
            .model
            .services
            .values()
            .filter(|s| s.managed && s.has_user)
            .filter_map(|s| {
                Some((
                    s.name.clone(),
                    s.user.clone()?,
                    s.base_image.clone()?,
                    s.install_dir.clone()?,
                    s.volume_name.clone()?,
                ))
            })
            .collect();

        for (service, user, image, install_dir, volume) in targets {
            self.progress.emit(&format!("Fixing permissions for {service}"));
            let name = format!("dockhand-perms-{volume}");
            let spec = HelperSpec {
                name: name.clone(),
                image,
                workdir: install_dir,
                volume,
                cache_bind: None,
                labels: vec![(PROJECT_LABEL.to_string(), ctx.model.name.clone())],
                script: format!("chown -R {user}:{user} ."),
            };
            self.runtime.create_helper(&spec).await?;
            let exit = self.runtime.run_attached(&name, &|_line| {}).await?;
            lifecycle.ensure_container_absent(&name, false).await?;
            if exit != 0 {
                return Err(DockhandError::RuntimeCommand {
                    command: format!("chown in {name}"),
                    stderr: format!("permission normalization exited with {exit}"),
                });
            }
            any = true;
        }

        ctx.permissions_normalized = any || !ctx.model.services.values().any(|s| s.has_user);
        Ok(())
    }

    /// Build images only for services whose image is missing or whose
    /// tracked files changed.
    async fn build_images(&self, ctx: &mut PipelineContext) -> Result<()> {
        let targets: Vec<(String, String, bool)> = ctx
            .model
            .services
            .values()
            .filter(|s| s.build_file.is_some())
            .map(|s| {
                (s.name.clone(), format!("{}-{}", ctx.model.name, s.name), s.changed)
            })
            .collect();

        for (service, image, changed) in targets {
            let missing = !self.runtime.image_exists(&image).await?;
            if !missing && !changed && !ctx.regenerated {
                continue;
            }
            self.progress.emit(&format!("Building image for {service}"));
            self.runtime
                .build_service_image(&ctx.derived_manifest, &ctx.model.name, &service)
                .await?;
            ctx.built_services.push(service);
        }
        Ok(())
    }

    /// Install label-declared global tools into the dependency volume.
    async fn install_global_tools(&self, ctx: &PipelineContext) -> Result<()> {
        let lifecycle = ResourceLifecycle::new(self.runtime.as_ref());

        for record in ctx.model.managed_services() {
            if record.global_tools.is_empty() {
                continue;
            }
            let (Some(manager), Some(image), Some(install_dir), Some(volume)) = (
                record.manager,
                record.base_image.as_deref(),
                record.install_dir.as_deref(),
                record.volume_name.as_deref(),
            ) else {
                continue;
            };

            self.progress
                .emit(&format!("Installing tools for {}: {}", record.name, record.global_tools.join(", ")));

            let mut lines = vec!["set -e".to_string()];
            for tool in &record.global_tools {
                lines.push(manager.global_install_command(tool));
            }
            let name = format!("dockhand-tools-{volume}");
            let spec = HelperSpec {
                name: name.clone(),
                image: image.to_string(),
                workdir: install_dir.to_string(),
                volume: volume.to_string(),
                cache_bind: None,
                labels: vec![(PROJECT_LABEL.to_string(), ctx.model.name.clone())],
                script: lines.join("\n"),
            };
            self.runtime.create_helper(&spec).await?;
            let exit = self.runtime.run_attached(&name, &|_line| {}).await?;
            lifecycle.ensure_container_absent(&name, false).await?;
            if exit != 0 {
                return Err(DockhandError::InstallFailed {
                    service: record.name.clone(),
                    exit_code: exit,
                });
            }
        }
        Ok(())
    }

    fn start_watchers(&self, ctx: &mut PipelineContext, options: &UpOptions) {
        if options.no_watch {
            return;
        }
        let set = watch::start_watchers(
            self.runtime.clone(),
            &ctx.model,
            self.progress.clone(),
        );
        if !set.is_empty() {
            self.progress.emit(&format!("Watching {} path(s) for changes", set.len()));
            ctx.watchers = Some(set);
        }
    }

    /// Bring services up with the derived manifest when one applies. One
    /// retry on the transient signature; one force-recreate retry on the
    /// network signature.
    async fn compose_up(&self, ctx: &PipelineContext, options: &UpOptions) -> Result<()> {
        let has_managed = ctx.model.managed_services().next().is_some();
        let manifest = if has_managed && ctx.derived_manifest.exists() {
            ctx.derived_manifest.clone()
        } else {
            ctx.model.manifest_path.clone()
        };

        self.progress.emit("Starting services");
        let first = self
            .runtime
            .compose_up(&manifest, &ctx.model.name, options.detach, false)
            .await;

        match first {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                info!(error = %e, "transient failure bringing services up, retrying");
                self.runtime
                    .compose_up(&manifest, &ctx.model.name, options.detach, false)
                    .await
            }
            Err(e) if e.is_network() => {
                info!(error = %e, "network failure bringing services up, retrying with recreate");
                self.runtime
                    .compose_up(&manifest, &ctx.model.name, options.detach, true)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Persist the snapshot, promoting observed timestamps to confirmed.
    fn commit(&self, ctx: &mut PipelineContext) -> Result<()> {
        let mut snapshot = ctx.model.to_snapshot(ctx.snapshot.as_ref());
        snapshot.population = PopulationState::Succeeded;
        if ctx.permissions_normalized {
            snapshot.user_setup_done = true;
        }
        ctx.store.put(&snapshot)?;
        ctx.snapshot = Some(snapshot);
        debug!("snapshot committed");
        Ok(())
    }
}

/// Stop the project's services. Optionally delete the derived manifest.
pub async fn down(
    runtime: &dyn ContainerRuntime,
    manifest_path: &std::path::Path,
    project_name: Option<&str>,
    remove_derived: bool,
) -> Result<()> {
    let model = ProjectModel::parse(manifest_path, project_name)?;
    let derived = paths::derived_manifest_path(&model.root);
    let manifest = if derived.exists() { derived.clone() } else { model.manifest_path.clone() };

    runtime.compose_stop(&manifest, &model.name).await?;

    if remove_derived && derived.exists() {
        std::fs::remove_file(&derived)
            .map_err(|e| DockhandError::Io { path: derived, source: e })?;
    }
    Ok(())
}

/// Full teardown: containers, labeled volumes, project networks, derived
/// manifest, and the snapshot. This is the only path that destroys the
/// snapshot.
pub async fn clean(
    runtime: &dyn ContainerRuntime,
    manifest_path: &std::path::Path,
    project_name: Option<&str>,
    progress: &ProgressReporter,
) -> Result<()> {
    let model = ProjectModel::parse(manifest_path, project_name)?;
    let lifecycle = ResourceLifecycle::new(runtime);

    let containers: Vec<String> = model
        .services
        .values()
        .map(|s| s.container_name.clone())
        .chain(model.volume_names().into_iter().map(|v| helper_name(&v)))
        .collect();
    lifecycle.remove_containers(&containers, true).await?;

    let label = format!("{PROJECT_LABEL}={}", model.name);
    let volumes = lifecycle.remove_labeled_volumes(&label).await?;
    let networks = lifecycle.remove_networks_matching(&format!("{}_", model.name)).await?;
    progress.emit(&format!(
        "Removed {} container(s), {} volume(s), {} network(s)",
        containers.len(),
        volumes.len(),
        networks.len()
    ));

    let derived = paths::derived_manifest_path(&model.root);
    if derived.exists() {
        std::fs::remove_file(&derived)
            .map_err(|e| DockhandError::Io { path: derived, source: e })?;
    }

    ProjectStore::for_project(&model.root).destroy()?;
    Ok(())
}

/// One row of `status` output.
#[derive(Debug, Clone)]
pub struct StatusEntry {
    pub service: String,
    pub container: String,
    pub state: ContainerState,
    pub managed: bool,
    pub volume: Option<String>,
    pub volume_exists: bool,
}

/// Live state of the project's containers and volumes.
pub async fn status(
    runtime: &dyn ContainerRuntime,
    manifest_path: &std::path::Path,
    project_name: Option<&str>,
) -> Result<Vec<StatusEntry>> {
    let model = ProjectModel::parse(manifest_path, project_name)?;
    let mut entries = Vec::new();

    for record in model.services.values() {
        let state = runtime.container_state(&record.container_name).await?;
        let volume_exists = match &record.volume_name {
            Some(volume) => runtime.volume_exists(volume).await?,
            None => false,
        };
        entries.push(StatusEntry {
            service: record.name.clone(),
            container: record.container_name.clone(),
            state,
            managed: record.managed,
            volume: record.volume_name.clone(),
            volume_exists,
        });
    }
    Ok(entries)
}

/// Edit the persisted force-reinstall registry. Returns the registry after
/// the edit.
pub fn edit_force_reinstalls(
    store: &ProjectStore,
    add: &[String],
    remove: &[String],
) -> Result<Vec<ForcedPackage>> {
    let mut snapshot = store.get()?.unwrap_or_default();

    for name in add {
        match snapshot.force_reinstall.iter_mut().find(|p| &p.name == name) {
            Some(entry) => entry.enabled = true,
            None => snapshot
                .force_reinstall
                .push(ForcedPackage { name: name.clone(), enabled: true }),
        }
    }
    for name in remove {
        if let Some(entry) = snapshot.force_reinstall.iter_mut().find(|p| &p.name == name) {
            entry.enabled = false;
        }
    }
    snapshot.force_reinstall.sort_by(|a, b| a.name.cmp(&b.name));

    store.put(&snapshot)?;
    Ok(snapshot.force_reinstall)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ProjectStore;

    #[test]
    fn test_force_reinstall_registry_edits() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ProjectStore::at_path(tmp.path().join("state.json"));

        let registry =
            edit_force_reinstalls(&store, &["bcrypt".to_string(), "sharp".to_string()], &[])
                .unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.iter().all(|p| p.enabled));

        let registry = edit_force_reinstalls(&store, &[], &["sharp".to_string()]).unwrap();
        let sharp = registry.iter().find(|p| p.name == "sharp").unwrap();
        assert!(!sharp.enabled);

        // Disabled entries stay in the registry for later re-enable.
        let snapshot = store.get().unwrap().unwrap();
        assert_eq!(snapshot.enabled_force_reinstalls(), vec!["bcrypt".to_string()]);
    }
}
