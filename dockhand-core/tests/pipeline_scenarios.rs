//! End-to-end pipeline scenarios driven through the mock runtime.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use dockhand_core::error::DockhandError;
use dockhand_core::paths;
use dockhand_core::pipeline::{UpOptions, UpPipeline};
use dockhand_core::populate::{helper_name, HELPER_LABEL};
use dockhand_core::progress::ProgressReporter;
use dockhand_core::runtime::mock::MockRuntime;
use dockhand_core::runtime::{ContainerRuntime, ContainerState};
use dockhand_core::store::{PopulationState, ProjectStore};

/// Tests set the data-dir environment variable; serialize them.
fn env_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}

struct Fixture {
    _env: MutexGuard<'static, ()>,
    _data: tempfile::TempDir,
    project: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let env = env_lock();
        let data = tempfile::tempdir().unwrap();
        std::env::set_var("DOCKHAND_DATA_DIR", data.path());

        let project = tempfile::tempdir().unwrap();
        write(
            project.path(),
            "docker-compose.yml",
            r#"
services:
  api:
    build: .
    ports:
      - "3000:3000"
    volumes:
      - ./src:/app/src
      - ./node_modules:/app/node_modules
  db:
    image: postgres:16
"#,
        );
        write(
            project.path(),
            "Dockerfile",
            "FROM node:20-alpine\nWORKDIR /app\nCOPY package.json package-lock.json ./\nRUN npm ci\nCOPY . .\nCMD [\"npm\", \"start\"]\n",
        );
        write(project.path(), "package.json", r#"{"dependencies":{"express":"^4"}}"#);
        write(
            project.path(),
            "package-lock.json",
            r#"{"lockfileVersion":3,"packages":{"node_modules/express":{}}}"#,
        );
        write(project.path(), "src/index.js", "console.log('hi')");

        Fixture { _env: env, _data: data, project }
    }

    fn manifest(&self) -> PathBuf {
        self.project.path().join("docker-compose.yml")
    }

    fn options(&self) -> UpOptions {
        UpOptions {
            manifest_path: self.manifest(),
            project_name: Some("shop".to_string()),
            detach: true,
            reinstall: false,
            no_watch: true,
            instrument: Vec::new(),
        }
    }

    fn derived_path(&self) -> PathBuf {
        paths::derived_manifest_path(&self.project.path().canonicalize().unwrap())
    }

    fn store(&self) -> ProjectStore {
        ProjectStore::for_project(&self.project.path().canonicalize().unwrap())
    }
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

const VOLUME: &str = "shop_app_node_modules";

async fn no_leaked_helpers(runtime: &MockRuntime) -> bool {
    runtime
        .list_containers(&format!("{HELPER_LABEL}=shop"))
        .await
        .unwrap()
        .is_empty()
}

// Scenario A: fresh project, first run.
#[tokio::test]
async fn test_first_run_provisions_everything() {
    let fixture = Fixture::new();
    let runtime = Arc::new(MockRuntime::new());
    let pipeline = UpPipeline::new(runtime.clone(), ProgressReporter::sink());

    let ctx = pipeline.run(&fixture.options()).await.unwrap();

    // Volume created and labeled with the project.
    assert_eq!(runtime.count_calls("create_volume"), 1);
    let labels = runtime.volume_labels(VOLUME).unwrap();
    assert!(labels.iter().any(|(k, v)| k == "dev.dockhand.project" && v == "shop"));

    // One install ran; the helper is gone.
    assert_eq!(runtime.count_calls("create_helper"), 1);
    assert!(runtime.helper_scripts()[0].contains("npm ci"));
    assert!(no_leaked_helpers(&runtime).await);

    // Derived manifest written and used for startup.
    assert!(fixture.derived_path().exists());
    let ups = runtime.compose_ups();
    assert_eq!(ups.len(), 1);
    assert!(ups[0].0.ends_with("docker-compose.dockhand.yml"));
    assert!(ups[0].1, "detached");

    // Image built for the buildable service only.
    assert_eq!(runtime.count_calls("build_service_image"), 1);

    // Snapshot committed as succeeded.
    let snapshot = fixture.store().get().unwrap().unwrap();
    assert_eq!(snapshot.population, PopulationState::Succeeded);
    assert!(snapshot.services.contains_key("api"));
    assert!(ctx.populate_outcomes["api"].installed);
}

// Scenario B: unchanged project, second run is a no-op for installs.
#[tokio::test]
async fn test_second_run_is_idempotent() {
    let fixture = Fixture::new();
    let runtime = Arc::new(MockRuntime::new());
    let pipeline = UpPipeline::new(runtime.clone(), ProgressReporter::sink());

    pipeline.run(&fixture.options()).await.unwrap();
    let derived_first = fs::read_to_string(fixture.derived_path()).unwrap();
    let snapshot_first =
        serde_json::to_string(&fixture.store().get().unwrap().unwrap()).unwrap();

    let ctx = pipeline.run(&fixture.options()).await.unwrap();

    // No new volume, no new install, no rebuild.
    assert_eq!(runtime.count_calls("create_volume"), 1);
    assert_eq!(runtime.count_calls("create_helper"), 1);
    assert_eq!(runtime.count_calls("build_service_image"), 1);
    assert!(!ctx.populate_outcomes["api"].installed);

    // Derived manifest is byte-identical; confirmed timestamps unchanged.
    let derived_second = fs::read_to_string(fixture.derived_path()).unwrap();
    assert_eq!(derived_first, derived_second);
    let snapshot_second =
        serde_json::to_string(&fixture.store().get().unwrap().unwrap()).unwrap();
    assert_eq!(snapshot_first, snapshot_second);

    // Services were still brought up both times.
    assert_eq!(runtime.compose_ups().len(), 2);
}

// Scenario C: lockfile change triggers a reinstall into the same volume.
#[tokio::test]
async fn test_lockfile_change_reinstalls_without_recreating_volume() {
    let fixture = Fixture::new();
    let runtime = Arc::new(MockRuntime::new());
    let pipeline = UpPipeline::new(runtime.clone(), ProgressReporter::sink());

    pipeline.run(&fixture.options()).await.unwrap();

    std::thread::sleep(std::time::Duration::from_millis(50));
    write(
        fixture.project.path(),
        "package-lock.json",
        r#"{"lockfileVersion":3,"packages":{"node_modules/express":{},"node_modules/cors":{}}}"#,
    );

    let ctx = pipeline.run(&fixture.options()).await.unwrap();

    assert_eq!(runtime.count_calls("create_volume"), 1, "volume reused");
    assert_eq!(runtime.count_calls("create_helper"), 2, "second install ran");
    assert!(ctx.populate_outcomes["api"].installed);
    assert!(!ctx.populate_outcomes["api"].fresh_volume);
    assert!(no_leaked_helpers(&runtime).await);
}

// A running container holds the dependency volume; a reinstall stops it
// before the helper runs, while an up-to-date service is left alone.
#[tokio::test]
async fn test_running_container_stopped_before_reinstall() {
    let fixture = Fixture::new();
    let runtime = Arc::new(MockRuntime::new());
    let pipeline = UpPipeline::new(runtime.clone(), ProgressReporter::sink());

    pipeline.run(&fixture.options()).await.unwrap();
    runtime.add_container("shop-api-1", ContainerState::Running, &[], false);

    pipeline.run(&fixture.options()).await.unwrap();
    assert_eq!(runtime.count_calls("stop_container"), 0, "unchanged service untouched");

    std::thread::sleep(std::time::Duration::from_millis(50));
    write(
        fixture.project.path(),
        "package-lock.json",
        r#"{"lockfileVersion":3,"packages":{"node_modules/express":{},"node_modules/cors":{}}}"#,
    );

    pipeline.run(&fixture.options()).await.unwrap();
    assert!(runtime.calls().iter().any(|c| c == "stop_container shop-api-1"));
    assert!(no_leaked_helpers(&runtime).await);
}

// A manifest mtime touch with identical bytes must not reinstall. The
// lockfile pins versions, so only the lockfile's mtime matters.
#[tokio::test]
async fn test_manifest_touch_does_not_reinstall() {
    let fixture = Fixture::new();
    let runtime = Arc::new(MockRuntime::new());
    let pipeline = UpPipeline::new(runtime.clone(), ProgressReporter::sink());

    pipeline.run(&fixture.options()).await.unwrap();

    std::thread::sleep(std::time::Duration::from_millis(50));
    let manifest = fs::read_to_string(fixture.project.path().join("package.json")).unwrap();
    write(fixture.project.path(), "package.json", &manifest);

    let ctx = pipeline.run(&fixture.options()).await.unwrap();
    assert!(!ctx.populate_outcomes["api"].installed);
    assert_eq!(runtime.count_calls("create_helper"), 1);
}

// Scenario D: failed install rolls back and the next run starts clean.
#[tokio::test]
async fn test_install_failure_rolls_back_then_recovers() {
    let fixture = Fixture::new();
    let runtime = Arc::new(MockRuntime::new());
    let pipeline = UpPipeline::new(runtime.clone(), ProgressReporter::sink());

    runtime.script_container_run(&helper_name(VOLUME), &["npm ERR! code E404"], 1);

    let err = pipeline.run(&fixture.options()).await.unwrap_err();
    assert!(matches!(err, DockhandError::InstallFailed { .. }), "got {err:?}");
    assert!(no_leaked_helpers(&runtime).await);
    // The volume was rolled back and the snapshot marked.
    assert_eq!(runtime.count_calls("remove_volume"), 1);
    let snapshot = fixture.store().get().unwrap().unwrap();
    assert_eq!(snapshot.population, PopulationState::Failed);
    // No services were started.
    assert!(runtime.compose_ups().is_empty());

    // Next run performs a clean install and succeeds.
    runtime.script_container_run(&helper_name(VOLUME), &["added 12 packages"], 0);
    let ctx = pipeline.run(&fixture.options()).await.unwrap();
    assert!(ctx.populate_outcomes["api"].installed);
    assert!(ctx.populate_outcomes["api"].fresh_volume);
    let snapshot = fixture.store().get().unwrap().unwrap();
    assert_eq!(snapshot.population, PopulationState::Succeeded);
}

// Scenario E: transient startup failure is retried once.
#[tokio::test]
async fn test_transient_startup_failure_retried() {
    let fixture = Fixture::new();
    let runtime = Arc::new(MockRuntime::new());
    let pipeline = UpPipeline::new(runtime.clone(), ProgressReporter::sink());

    runtime.fail_next(
        "compose_up",
        DockhandError::TransientRuntime { reason: "failed to create shim task".to_string() },
    );

    pipeline.run(&fixture.options()).await.unwrap();
    assert_eq!(runtime.count_calls("compose_up"), 2);
    // The retry kept the original flags.
    let ups = runtime.compose_ups();
    assert_eq!(ups.len(), 1);
    assert!(!ups[0].2, "no force recreate");
}

// Scenario E variant: network failure retries with force-recreate.
#[tokio::test]
async fn test_network_failure_retries_with_recreate() {
    let fixture = Fixture::new();
    let runtime = Arc::new(MockRuntime::new());
    let pipeline = UpPipeline::new(runtime.clone(), ProgressReporter::sink());

    runtime.fail_next(
        "compose_up",
        DockhandError::Network { reason: "tls handshake timeout".to_string() },
    );

    pipeline.run(&fixture.options()).await.unwrap();
    let ups = runtime.compose_ups();
    assert_eq!(ups.len(), 1);
    assert!(ups[0].2, "retried with force recreate");
}

// A second transient failure is fatal.
#[tokio::test]
async fn test_second_transient_failure_is_fatal() {
    let fixture = Fixture::new();
    let runtime = Arc::new(MockRuntime::new());
    let pipeline = UpPipeline::new(runtime.clone(), ProgressReporter::sink());

    for _ in 0..2 {
        runtime.fail_next(
            "compose_up",
            DockhandError::TransientRuntime { reason: "oci runtime create failed".to_string() },
        );
    }

    let err = pipeline.run(&fixture.options()).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(runtime.count_calls("compose_up"), 2);
}

// Forced reinstall requested from the CLI reinstalls despite no changes.
#[tokio::test]
async fn test_requested_reinstall_forces_install() {
    let fixture = Fixture::new();
    let runtime = Arc::new(MockRuntime::new());
    let pipeline = UpPipeline::new(runtime.clone(), ProgressReporter::sink());

    pipeline.run(&fixture.options()).await.unwrap();

    let mut options = fixture.options();
    options.reinstall = true;
    let ctx = pipeline.run(&options).await.unwrap();

    assert!(ctx.populate_outcomes["api"].installed);
    assert_eq!(runtime.count_calls("create_helper"), 2);
    assert!(no_leaked_helpers(&runtime).await);
}

// Unmanaged-only projects start from the original manifest.
#[tokio::test]
async fn test_unmanaged_project_uses_original_manifest() {
    let env = env_lock();
    let data = tempfile::tempdir().unwrap();
    std::env::set_var("DOCKHAND_DATA_DIR", data.path());
    let project = tempfile::tempdir().unwrap();
    write(
        project.path(),
        "docker-compose.yml",
        "services:\n  db:\n    image: postgres:16\n",
    );

    let runtime = Arc::new(MockRuntime::new());
    let pipeline = UpPipeline::new(runtime.clone(), ProgressReporter::sink());
    let options = UpOptions {
        manifest_path: project.path().join("docker-compose.yml"),
        project_name: Some("plain".to_string()),
        detach: true,
        reinstall: false,
        no_watch: true,
        instrument: Vec::new(),
    };

    pipeline.run(&options).await.unwrap();

    assert_eq!(runtime.count_calls("create_volume"), 0);
    assert_eq!(runtime.count_calls("create_helper"), 0);
    let ups = runtime.compose_ups();
    assert!(ups[0].0.ends_with("docker-compose.yml"));
    drop(env);
}
