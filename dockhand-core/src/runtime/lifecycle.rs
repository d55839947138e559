//! Idempotent resource lifecycle operations.
//!
//! Thin layer over [`ContainerRuntime`] that makes create/remove calls
//! converge: existence is checked before mutating, "already absent" is
//! success, and every other error propagates unmodified. Bulk removals fan
//! out concurrently; each removal targets a distinct named resource, so
//! concurrent execution is safe.

use futures::future::try_join_all;
use tracing::debug;

use crate::error::{DockhandError, Result};

use super::{ContainerRuntime, ContainerState};

pub struct ResourceLifecycle<'a> {
    runtime: &'a dyn ContainerRuntime,
}

impl<'a> ResourceLifecycle<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime) -> Self {
        ResourceLifecycle { runtime }
    }

    /// Create a labeled volume if absent. Returns true when it was created
    /// by this call.
    pub async fn ensure_volume(
        &self,
        name: &str,
        labels: &[(String, String)],
    ) -> Result<bool> {
        if self.runtime.volume_exists(name).await? {
            return Ok(false);
        }
        debug!(volume = name, "creating volume");
        self.runtime.create_volume(name, labels).await?;
        Ok(true)
    }

    pub async fn remove_volume_if_exists(&self, name: &str) -> Result<()> {
        if !self.runtime.volume_exists(name).await? {
            return Ok(());
        }
        match self.runtime.remove_volume(name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Stop (or kill) and remove a container, converging on "absent".
    /// Auto-remove containers are only stopped; the runtime reaps them.
    pub async fn ensure_container_absent(&self, name: &str, kill: bool) -> Result<()> {
        match self.runtime.container_state(name).await? {
            ContainerState::Missing => return Ok(()),
            ContainerState::Running => {
                let halt = if kill {
                    self.runtime.kill_container(name).await
                } else {
                    self.runtime.stop_container(name).await
                };
                match halt {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
            ContainerState::Exited => {}
        }

        let auto_remove = match self.runtime.is_auto_remove(name).await {
            Ok(auto) => auto,
            // The runtime reaped the container between calls.
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if auto_remove {
            return Ok(());
        }

        match self.runtime.remove_container(name, true).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove a set of containers concurrently.
    pub async fn remove_containers(&self, names: &[String], kill: bool) -> Result<()> {
        try_join_all(names.iter().map(|name| self.ensure_container_absent(name, kill))).await?;
        Ok(())
    }

    /// Remove every volume carrying `label`, concurrently.
    pub async fn remove_labeled_volumes(&self, label: &str) -> Result<Vec<String>> {
        let volumes = self.runtime.list_volumes(label).await?;
        try_join_all(volumes.iter().map(|v| self.remove_volume_if_exists(v))).await?;
        Ok(volumes)
    }

    /// Remove every network whose name starts with `prefix`, concurrently.
    pub async fn remove_networks_matching(&self, prefix: &str) -> Result<Vec<String>> {
        let networks = self.runtime.list_networks(prefix).await?;
        let removals = networks.iter().map(|name| async move {
            match self.runtime.remove_network(name).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err::<(), DockhandError>(e),
            }
        });
        try_join_all(removals).await?;
        Ok(networks)
    }
}
