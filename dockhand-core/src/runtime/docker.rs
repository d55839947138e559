//! Docker CLI runtime.
//!
//! Shells out to `docker` (and `docker compose`) via `tokio::process`.
//! Failures are classified from stderr so callers can apply retry policy
//! by error variant instead of scraping output themselves.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::error::{DockhandError, Result};

use super::classify::{classify_runtime_output, RuntimeErrorKind};
use super::{ContainerRuntime, ContainerState, HelperSpec, LineSink};

/// Environment variable overriding the runtime binary, mainly for tests.
const RUNTIME_BIN_ENV: &str = "DOCKHAND_RUNTIME_BIN";

/// Container runtime backed by the `docker` command-line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        let binary = std::env::var(RUNTIME_BIN_ENV).unwrap_or_else(|_| "docker".to_string());
        DockerCli { binary }
    }

    #[cfg(test)]
    fn with_binary(binary: impl Into<String>) -> Self {
        DockerCli { binary: binary.into() }
    }

    /// Run a docker command, returning trimmed stdout.
    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(command = %args.join(" "), "runtime call");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DockhandError::RuntimeUnavailable {
                reason: format!("failed to execute {}: {}", self.binary, e),
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(command_error(&format!("{} {}", self.binary, args.join(" ")), stderr))
        }
    }

    /// Like `run`, but treats a not-found error as `Ok(None)`.
    async fn run_tolerant(&self, args: &[&str]) -> Result<Option<String>> {
        match self.run(args).await {
            Ok(out) => Ok(Some(out)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a failed command's stderr to the matching error variant.
fn command_error(command: &str, stderr: String) -> DockhandError {
    match classify_runtime_output(&stderr) {
        RuntimeErrorKind::Unavailable => DockhandError::RuntimeUnavailable { reason: stderr },
        RuntimeErrorKind::NotFound => DockhandError::NotFound { what: stderr },
        RuntimeErrorKind::Network => DockhandError::Network { reason: stderr },
        RuntimeErrorKind::Transient => DockhandError::TransientRuntime { reason: stderr },
        RuntimeErrorKind::Other => {
            DockhandError::RuntimeCommand { command: command.to_string(), stderr }
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ping(&self) -> Result<()> {
        self.run(&["version", "--format", "{{.Server.Version}}"]).await?;
        Ok(())
    }

    async fn validate_manifest(&self, manifest: &Path, project: &str) -> Result<()> {
        let manifest = manifest.to_string_lossy();
        match self
            .run(&["compose", "-f", &manifest, "-p", project, "config", "--quiet"])
            .await
        {
            Ok(_) => Ok(()),
            // Surface the runtime's exact diagnostics to the user.
            Err(DockhandError::RuntimeCommand { stderr, .. }) => {
                Err(DockhandError::Configuration { reason: stderr })
            }
            Err(e) => Err(e),
        }
    }

    async fn container_state(&self, name: &str) -> Result<ContainerState> {
        match self
            .run_tolerant(&["inspect", "--format", "{{.State.Status}}", name])
            .await?
        {
            Some(status) if status == "running" => Ok(ContainerState::Running),
            Some(_) => Ok(ContainerState::Exited),
            None => Ok(ContainerState::Missing),
        }
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<String>> {
        let filter = format!("label={label}");
        let out = self
            .run(&["ps", "--all", "--filter", &filter, "--format", "{{.Names}}"])
            .await?;
        Ok(out.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.run(&["stop", name]).await.map(|_| ())
    }

    async fn kill_container(&self, name: &str) -> Result<()> {
        self.run(&["kill", name]).await.map(|_| ())
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<()> {
        if force {
            self.run(&["rm", "--force", name]).await.map(|_| ())
        } else {
            self.run(&["rm", name]).await.map(|_| ())
        }
    }

    async fn restart_container(&self, name: &str) -> Result<()> {
        self.run(&["restart", name]).await.map(|_| ())
    }

    async fn is_auto_remove(&self, name: &str) -> Result<bool> {
        match self
            .run_tolerant(&["inspect", "--format", "{{.HostConfig.AutoRemove}}", name])
            .await?
        {
            Some(out) => Ok(out == "true"),
            None => Ok(false),
        }
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        Ok(self.run_tolerant(&["volume", "inspect", name]).await?.is_some())
    }

    async fn create_volume(&self, name: &str, labels: &[(String, String)]) -> Result<()> {
        let mut args: Vec<String> = vec!["volume".into(), "create".into()];
        for (key, value) in labels {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }
        args.push(name.to_string());
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&refs).await.map(|_| ())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.run(&["volume", "rm", name]).await.map(|_| ())
    }

    async fn list_volumes(&self, label: &str) -> Result<Vec<String>> {
        let filter = format!("label={label}");
        let out = self
            .run(&["volume", "ls", "--filter", &filter, "--format", "{{.Name}}"])
            .await?;
        Ok(out.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
    }

    async fn list_networks(&self, name_prefix: &str) -> Result<Vec<String>> {
        let out = self.run(&["network", "ls", "--format", "{{.Name}}"]).await?;
        Ok(out
            .lines()
            .filter(|l| l.starts_with(name_prefix))
            .map(str::to_string)
            .collect())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.run(&["network", "rm", name]).await.map(|_| ())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.run_tolerant(&["image", "inspect", image]).await?.is_some())
    }

    #[instrument(skip(self, manifest))]
    async fn build_service_image(
        &self,
        manifest: &Path,
        project: &str,
        service: &str,
    ) -> Result<()> {
        let manifest = manifest.to_string_lossy();
        self.run(&["compose", "-f", &manifest, "-p", project, "build", service])
            .await
            .map(|_| ())
    }

    async fn create_helper(&self, spec: &HelperSpec) -> Result<()> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            spec.name.clone(),
            "--workdir".into(),
            spec.workdir.clone(),
            "--volume".into(),
            format!("{}:{}", spec.volume, spec.workdir),
        ];
        if let Some((host, target)) = &spec.cache_bind {
            args.push("--volume".into());
            args.push(format!("{}:{}", host.display(), target));
        }
        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }
        args.push("--entrypoint".into());
        args.push("sh".into());
        args.push(spec.image.clone());
        args.push("-c".into());
        args.push(spec.script.clone());

        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&refs).await.map(|_| ())
    }

    async fn copy_into(
        &self,
        container: &str,
        host_path: &Path,
        container_path: &str,
    ) -> Result<()> {
        let src = host_path.to_string_lossy();
        let dest = format!("{container}:{container_path}");
        self.run(&["cp", &src, &dest]).await.map(|_| ())
    }

    async fn run_attached(&self, name: &str, sink: LineSink<'_>) -> Result<i32> {
        let mut child = Command::new(&self.binary)
            .args(["start", "--attach", name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DockhandError::RuntimeUnavailable {
                reason: format!("failed to execute {}: {}", self.binary, e),
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Both pipes must be drained together; a child blocked writing to a
        // full stderr buffer never reaches stdout EOF.
        let drain_stdout = async {
            if let Some(out) = stdout {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink(&line);
                }
            }
        };
        let drain_stderr = async {
            let mut tail = String::new();
            if let Some(err) = stderr {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink(&line);
                    tail.push_str(&line);
                    tail.push('\n');
                }
            }
            tail
        };
        let ((), stderr_tail) = tokio::join!(drain_stdout, drain_stderr);

        let status = child.wait().await.map_err(|e| DockhandError::RuntimeUnavailable {
            reason: format!("waiting on {}: {}", self.binary, e),
        })?;

        match status.code() {
            Some(code) => Ok(code),
            None => Err(command_error(
                &format!("{} start --attach {}", self.binary, name),
                stderr_tail,
            )),
        }
    }

    #[instrument(skip(self, manifest))]
    async fn compose_up(
        &self,
        manifest: &Path,
        project: &str,
        detach: bool,
        force_recreate: bool,
    ) -> Result<()> {
        let manifest_str = manifest.to_string_lossy();
        let mut args = vec!["compose", "-f", &*manifest_str, "-p", project, "up"];
        if detach {
            args.push("--detach");
        }
        if force_recreate {
            args.push("--force-recreate");
        }

        if detach {
            return self.run(&args).await.map(|_| ());
        }

        // Attached mode hands the terminal to compose until interrupted.
        let status = Command::new(&self.binary)
            .args(&args)
            .status()
            .await
            .map_err(|e| DockhandError::RuntimeUnavailable {
                reason: format!("failed to execute {}: {}", self.binary, e),
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(DockhandError::RuntimeCommand {
                command: format!("{} {}", self.binary, args.join(" ")),
                stderr: format!("compose exited with status {status}"),
            })
        }
    }

    async fn compose_stop(&self, manifest: &Path, project: &str) -> Result<()> {
        let manifest = manifest.to_string_lossy();
        self.run(&["compose", "-f", &manifest, "-p", project, "stop"])
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_maps_by_classification() {
        let err = command_error("docker volume rm x", "Error: No such volume: x".to_string());
        assert!(err.is_not_found());

        let err = command_error(
            "docker compose up",
            "failed to create shim task: OCI runtime create failed".to_string(),
        );
        assert!(err.is_transient());

        let err = command_error(
            "docker compose up",
            "dial tcp: lookup registry-1.docker.io: no such host".to_string(),
        );
        assert!(err.is_network());

        let err = command_error("docker rm y", "conflict: unable to remove".to_string());
        assert!(matches!(err, DockhandError::RuntimeCommand { .. }));
    }

    #[tokio::test]
    async fn test_run_attached_drains_stderr_heavy_child() {
        use std::os::unix::fs::PermissionsExt;
        use std::sync::Mutex;
        use std::time::Duration;

        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("fake-runtime.sh");
        // Floods stderr well past the pipe buffer before touching stdout,
        // the shape of an npm install full of deprecation warnings.
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             i=0\n\
             while [ $i -lt 16000 ]; do\n\
               echo 'npm warn deprecated inflight@1.0.6: unsupported' 1>&2\n\
               i=$((i+1))\n\
             done\n\
             echo 'added 212 packages in 9s'\n\
             exit 0\n",
        )
        .unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let cli = DockerCli::with_binary(script.to_string_lossy().into_owned());
        let lines = Mutex::new(Vec::<String>::new());
        let sink = |line: &str| {
            lines.lock().unwrap().push(line.to_string());
        };

        let code = tokio::time::timeout(
            Duration::from_secs(30),
            cli.run_attached("ignored", &sink),
        )
        .await
        .expect("attached run must not hang on a stderr-heavy child")
        .unwrap();

        assert_eq!(code, 0);
        let lines = lines.into_inner().unwrap();
        assert!(lines.iter().any(|l| l == "added 212 packages in 9s"));
        assert_eq!(lines.len(), 16001);
    }
}
