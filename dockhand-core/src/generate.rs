//! Derived manifest generation.
//!
//! Rewrites the project's compose file so that each managed service mounts
//! its dependency volume instead of bind-mounting a host dependency
//! directory, and declares those volumes as external at the top level.
//! Rendering uses ordered maps throughout, so regenerating with unchanged
//! inputs reproduces the file byte for byte.

use std::path::PathBuf;

use tracing::{debug, instrument};

use crate::error::{DockhandError, Result};
use crate::manifest::compose::{ComposeFile, VolumeDefinition, VolumeMount};
use crate::manifest::ProjectModel;
use crate::paths;

/// Label marking a resource as owned by this tool.
pub const MANAGED_LABEL: &str = "dev.dockhand.managed";
/// Label carrying the owning project's name.
pub const PROJECT_LABEL: &str = "dev.dockhand.project";

/// First health port handed to instrumented services.
const HEALTH_PORT_BASE: u16 = 34400;
/// Preload script injected into instrumented Node services.
const METRICS_SHIM: &str = "/opt/dockhand/metrics-shim.js";

/// Render the derived manifest and assign health ports back into the model.
pub fn render(model: &mut ProjectModel) -> Result<String> {
    let mut derived: ComposeFile = model.compose.clone();
    let mut next_port = HEALTH_PORT_BASE;

    // BTreeMap iteration keeps port assignment stable across runs.
    for (name, service) in derived.services.iter_mut() {
        let Some(record) = model.services.get_mut(name) else { continue };
        if !record.managed {
            continue;
        }
        let (Some(install_dir), Some(volume)) = (&record.install_dir, &record.volume_name) else {
            continue;
        };

        // The volume solely owns the install directory. Drop every mount
        // that targets it, then mount the volume there with nocopy so the
        // image's own content never seeds it.
        service.volumes.retain(|entry| {
            let target = VolumeMount::parse(entry).target().to_string();
            target != *install_dir && !target.starts_with(&format!("{install_dir}/"))
        });
        service.volumes.push(format!("{volume}:{install_dir}:nocopy"));

        service.labels.set(MANAGED_LABEL, "true");
        service.labels.set(PROJECT_LABEL, &model.name);

        if record.instrumented {
            let port = next_port;
            next_port += 1;
            record.health_port = Some(port);
            service
                .environment
                .set("NODE_OPTIONS", &format!("--require {METRICS_SHIM}"));
            service.environment.set("DOCKHAND_METRICS_PORT", &port.to_string());
            service.ports.push(format!("{port}:{port}"));
        }

        derived
            .volumes
            .entry(volume.clone())
            .or_insert_with(|| Some(external_volume()));
    }

    let body = serde_yaml::to_string(&derived).map_err(|e| DockhandError::Other(e.into()))?;
    Ok(format!("# Generated by dockhand. Do not edit.\n{body}"))
}

/// Render and write the derived manifest into the project root.
#[instrument(skip(model), fields(project = %model.name))]
pub fn generate(model: &mut ProjectModel) -> Result<PathBuf> {
    let content = render(model)?;
    let path = paths::derived_manifest_path(&model.root);
    std::fs::write(&path, &content)
        .map_err(|e| DockhandError::Io { path: path.clone(), source: e })?;
    debug!(path = %path.display(), bytes = content.len(), "wrote derived manifest");
    Ok(path)
}

fn external_volume() -> VolumeDefinition {
    let mut def = VolumeDefinition::default();
    def.extra
        .insert("external".to_string(), serde_yaml::Value::Bool(true));
    def
}
