//! Scriptable in-memory runtime for tests.
//!
//! Tracks containers, volumes, networks, and images in plain maps, records
//! every call, and can be told to fail the next call to a given operation.
//! Exposed behind the `mock-runtime` feature so integration tests can drive
//! the full pipeline without a container runtime on the machine.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{DockhandError, Result};

use super::{ContainerRuntime, ContainerState, HelperSpec, LineSink};

#[derive(Debug, Clone)]
struct MockContainer {
    state: ContainerState,
    labels: Vec<(String, String)>,
    auto_remove: bool,
    /// Script given at creation, kept for assertions.
    script: Option<String>,
    /// Lines emitted when run attached.
    output: Vec<String>,
    exit_code: i32,
}

#[derive(Default)]
struct State {
    containers: BTreeMap<String, MockContainer>,
    volumes: BTreeMap<String, Vec<(String, String)>>,
    networks: BTreeSet<String>,
    images: BTreeSet<String>,
    calls: Vec<String>,
    failures: BTreeMap<String, VecDeque<DockhandError>>,
    compose_ups: Vec<(String, bool, bool)>,
    /// Scripts handed to create_helper, kept after the helper is removed.
    scripts: Vec<String>,
    /// Output and exit code per container name for attached runs. Applies
    /// to containers created later too, so helper runs can be scripted
    /// before the machine creates them.
    scripted_runs: BTreeMap<String, (Vec<String>, i32)>,
}

/// In-memory [`ContainerRuntime`].
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<State>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call and consume a queued failure for `op`, if any.
    fn gate(&self, op: &str, arg: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{op} {arg}"));
        if let Some(queue) = state.failures.get_mut(op) {
            if let Some(err) = queue.pop_front() {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Queue an error returned by the next call to `op`.
    pub fn fail_next(&self, op: &str, err: DockhandError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn add_container(
        &self,
        name: &str,
        state: ContainerState,
        labels: &[(&str, &str)],
        auto_remove: bool,
    ) {
        self.state.lock().unwrap().containers.insert(
            name.to_string(),
            MockContainer {
                state,
                labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                auto_remove,
                script: None,
                output: Vec::new(),
                exit_code: 0,
            },
        );
    }

    pub fn add_volume(&self, name: &str) {
        self.state.lock().unwrap().volumes.insert(name.to_string(), Vec::new());
    }

    pub fn add_network(&self, name: &str) {
        self.state.lock().unwrap().networks.insert(name.to_string());
    }

    pub fn add_image(&self, name: &str) {
        self.state.lock().unwrap().images.insert(name.to_string());
    }

    /// Script the output and exit code of a container run attached. The
    /// container does not need to exist yet.
    pub fn script_container_run(&self, name: &str, output: &[&str], exit_code: i32) {
        self.state.lock().unwrap().scripted_runs.insert(
            name.to_string(),
            (output.iter().map(|s| s.to_string()).collect(), exit_code),
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, op: &str) -> usize {
        let prefix = format!("{op} ");
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix) || *c == op)
            .count()
    }

    /// Scripts handed to `create_helper`, in call order.
    pub fn helper_scripts(&self) -> Vec<String> {
        self.state.lock().unwrap().scripts.clone()
    }

    /// Names of containers currently known to the runtime.
    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }

    /// `(manifest, detach, force_recreate)` per compose_up call.
    pub fn compose_ups(&self) -> Vec<(String, bool, bool)> {
        self.state.lock().unwrap().compose_ups.clone()
    }

    pub fn volume_labels(&self, name: &str) -> Option<Vec<(String, String)>> {
        self.state.lock().unwrap().volumes.get(name).cloned()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<()> {
        self.gate("ping", "")
    }

    async fn validate_manifest(&self, manifest: &Path, project: &str) -> Result<()> {
        self.gate("validate_manifest", &format!("{} {}", manifest.display(), project))
    }

    async fn container_state(&self, name: &str) -> Result<ContainerState> {
        self.gate("container_state", name)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .get(name)
            .map(|c| c.state)
            .unwrap_or(ContainerState::Missing))
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<String>> {
        self.gate("list_containers", label)?;
        let (key, value) = label.split_once('=').unwrap_or((label, ""));
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| c.labels.iter().any(|(k, v)| k == key && v == value))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.gate("stop_container", name)?;
        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(name) {
            Some(c) => {
                c.state = ContainerState::Exited;
                let auto = c.auto_remove;
                if auto {
                    state.containers.remove(name);
                }
                Ok(())
            }
            None => Err(DockhandError::NotFound { what: format!("no such container: {name}") }),
        }
    }

    async fn kill_container(&self, name: &str) -> Result<()> {
        self.gate("kill_container", name)?;
        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(name) {
            Some(c) => {
                c.state = ContainerState::Exited;
                let auto = c.auto_remove;
                if auto {
                    state.containers.remove(name);
                }
                Ok(())
            }
            None => Err(DockhandError::NotFound { what: format!("no such container: {name}") }),
        }
    }

    async fn remove_container(&self, name: &str, _force: bool) -> Result<()> {
        self.gate("remove_container", name)?;
        let mut state = self.state.lock().unwrap();
        match state.containers.remove(name) {
            Some(_) => Ok(()),
            None => Err(DockhandError::NotFound { what: format!("no such container: {name}") }),
        }
    }

    async fn restart_container(&self, name: &str) -> Result<()> {
        self.gate("restart_container", name)?;
        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(name) {
            Some(c) => {
                c.state = ContainerState::Running;
                Ok(())
            }
            None => Err(DockhandError::NotFound { what: format!("no such container: {name}") }),
        }
    }

    async fn is_auto_remove(&self, name: &str) -> Result<bool> {
        self.gate("is_auto_remove", name)?;
        let state = self.state.lock().unwrap();
        Ok(state.containers.get(name).map(|c| c.auto_remove).unwrap_or(false))
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        self.gate("volume_exists", name)?;
        Ok(self.state.lock().unwrap().volumes.contains_key(name))
    }

    async fn create_volume(&self, name: &str, labels: &[(String, String)]) -> Result<()> {
        self.gate("create_volume", name)?;
        self.state
            .lock()
            .unwrap()
            .volumes
            .insert(name.to_string(), labels.to_vec());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.gate("remove_volume", name)?;
        match self.state.lock().unwrap().volumes.remove(name) {
            Some(_) => Ok(()),
            None => Err(DockhandError::NotFound { what: format!("no such volume: {name}") }),
        }
    }

    async fn list_volumes(&self, label: &str) -> Result<Vec<String>> {
        self.gate("list_volumes", label)?;
        let (key, value) = label.split_once('=').unwrap_or((label, ""));
        let state = self.state.lock().unwrap();
        Ok(state
            .volumes
            .iter()
            .filter(|(_, labels)| labels.iter().any(|(k, v)| k == key && v == value))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn list_networks(&self, name_prefix: &str) -> Result<Vec<String>> {
        self.gate("list_networks", name_prefix)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .networks
            .iter()
            .filter(|n| n.starts_with(name_prefix))
            .cloned()
            .collect())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.gate("remove_network", name)?;
        if self.state.lock().unwrap().networks.remove(name) {
            Ok(())
        } else {
            Err(DockhandError::NotFound { what: format!("no such network: {name}") })
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        self.gate("image_exists", image)?;
        Ok(self.state.lock().unwrap().images.contains(image))
    }

    async fn build_service_image(
        &self,
        _manifest: &Path,
        project: &str,
        service: &str,
    ) -> Result<()> {
        self.gate("build_service_image", service)?;
        self.state.lock().unwrap().images.insert(format!("{project}-{service}"));
        Ok(())
    }

    async fn create_helper(&self, spec: &HelperSpec) -> Result<()> {
        self.gate("create_helper", &spec.name)?;
        let mut state = self.state.lock().unwrap();
        state.scripts.push(spec.script.clone());
        state.containers.insert(
            spec.name.clone(),
            MockContainer {
                state: ContainerState::Exited,
                labels: spec.labels.clone(),
                auto_remove: false,
                script: Some(spec.script.clone()),
                output: Vec::new(),
                exit_code: 0,
            },
        );
        Ok(())
    }

    async fn copy_into(
        &self,
        container: &str,
        host_path: &Path,
        container_path: &str,
    ) -> Result<()> {
        self.gate(
            "copy_into",
            &format!("{container} {} {container_path}", host_path.display()),
        )
    }

    async fn run_attached(&self, name: &str, sink: LineSink<'_>) -> Result<i32> {
        self.gate("run_attached", name)?;
        let (output, exit_code) = {
            let state = self.state.lock().unwrap();
            if !state.containers.contains_key(name) {
                return Err(DockhandError::NotFound {
                    what: format!("no such container: {name}"),
                });
            }
            match state.scripted_runs.get(name) {
                Some((output, code)) => (output.clone(), *code),
                None => {
                    let c = &state.containers[name];
                    (c.output.clone(), c.exit_code)
                }
            }
        };
        for line in &output {
            sink(line);
        }
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(name) {
            c.state = ContainerState::Exited;
        }
        Ok(exit_code)
    }

    async fn compose_up(
        &self,
        manifest: &Path,
        project: &str,
        detach: bool,
        force_recreate: bool,
    ) -> Result<()> {
        self.gate("compose_up", project)?;
        self.state.lock().unwrap().compose_ups.push((
            manifest.to_string_lossy().into_owned(),
            detach,
            force_recreate,
        ));
        Ok(())
    }

    async fn compose_stop(&self, _manifest: &Path, project: &str) -> Result<()> {
        self.gate("compose_stop", project)
    }
}
