//! Container runtime abstraction.
//!
//! Everything that touches the container runtime goes through the
//! [`ContainerRuntime`] trait so the orchestration logic can be driven
//! against a scriptable mock in tests. The production implementation
//! shells out to the `docker` CLI.

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

pub mod classify;
pub mod docker;
pub mod lifecycle;

#[cfg(any(test, feature = "mock-runtime"))]
pub mod mock;

pub use classify::{classify_runtime_output, RuntimeErrorKind};
pub use docker::DockerCli;
pub use lifecycle::ResourceLifecycle;

/// Observed state of a named container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited,
    Missing,
}

/// Description of a disposable helper container.
#[derive(Debug, Clone)]
pub struct HelperSpec {
    pub name: String,
    pub image: String,
    /// Working directory, also the dependency volume's mount point.
    pub workdir: String,
    pub volume: String,
    /// Optional host cache directory bind, `(host_path, container_path)`.
    pub cache_bind: Option<(std::path::PathBuf, String)>,
    pub labels: Vec<(String, String)>,
    /// Shell script the helper runs.
    pub script: String,
}

/// Line sink for streamed container output.
pub type LineSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Operations the orchestrator needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Verify the runtime daemon is reachable.
    async fn ping(&self) -> Result<()>;

    /// Validate a compose manifest without creating anything. Surfaces the
    /// runtime's exact diagnostics on failure.
    async fn validate_manifest(&self, manifest: &Path, project: &str) -> Result<()>;

    async fn container_state(&self, name: &str) -> Result<ContainerState>;

    /// Names of containers carrying `label` (as `key=value`), any state.
    async fn list_containers(&self, label: &str) -> Result<Vec<String>>;

    async fn stop_container(&self, name: &str) -> Result<()>;
    async fn kill_container(&self, name: &str) -> Result<()>;
    async fn remove_container(&self, name: &str, force: bool) -> Result<()>;
    async fn restart_container(&self, name: &str) -> Result<()>;

    /// Whether the container was created with auto-remove; such containers
    /// are reaped by the runtime once stopped and must not be removed.
    async fn is_auto_remove(&self, name: &str) -> Result<bool>;

    async fn volume_exists(&self, name: &str) -> Result<bool>;
    async fn create_volume(&self, name: &str, labels: &[(String, String)]) -> Result<()>;
    async fn remove_volume(&self, name: &str) -> Result<()>;
    /// Names of volumes carrying `label` (as `key=value`).
    async fn list_volumes(&self, label: &str) -> Result<Vec<String>>;

    async fn list_networks(&self, name_prefix: &str) -> Result<Vec<String>>;
    async fn remove_network(&self, name: &str) -> Result<()>;

    async fn image_exists(&self, image: &str) -> Result<bool>;
    async fn build_service_image(&self, manifest: &Path, project: &str, service: &str)
        -> Result<()>;

    /// Create (but do not start) a helper container.
    async fn create_helper(&self, spec: &HelperSpec) -> Result<()>;

    /// Copy a host file into a container.
    async fn copy_into(&self, container: &str, host_path: &Path, container_path: &str)
        -> Result<()>;

    /// Start a created container attached, streaming each output line to
    /// `sink`, and return its exit code.
    async fn run_attached(&self, name: &str, sink: LineSink<'_>) -> Result<i32>;

    async fn compose_up(
        &self,
        manifest: &Path,
        project: &str,
        detach: bool,
        force_recreate: bool,
    ) -> Result<()>;

    async fn compose_stop(&self, manifest: &Path, project: &str) -> Result<()>;
}
