//! Integration tests for the modhost daemon.
//!
//! These tests start a full [`Host`] against a temporary data directory and
//! drive it through the extension API, the way extensions do.

use async_trait::async_trait;
use modhost_daemon::config::Config;
use modhost_daemon::host::Host;
use modhost_daemon::notifications::NotificationCenter;
use modhost_daemon::runner::{DeploySignal, LaunchRequest, Spawner, DEPLOY_DIALOG_TITLE};
use modhost_extension_api::{
    BuiltinExtension, ExtensionContext, HostEvent, LookupDetails, ModInfo, ModReference,
    RunParameters,
};
use modhost_runtime::ExtensionStateStore;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ==============================================================================
// Test Fixture Helpers
// ==============================================================================

struct Fixture {
    temp_dir: TempDir,
    config: Config,
}

impl Fixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.daemon.data_dir = Some(temp_dir.path().to_path_buf());
        config.metadb.servers.clear();
        config.session.game_id = Some("skyrim".to_string());
        config.runner.elevation_command = vec!["sudo".to_string(), "-E".to_string()];

        std::fs::create_dir_all(temp_dir.path().join("plugins")).unwrap();
        std::fs::create_dir_all(temp_dir.path().join("bundled")).unwrap();

        Self { temp_dir, config }
    }

    fn user_dir(&self) -> PathBuf {
        self.temp_dir.path().join("plugins")
    }

    fn write_extension(&self, name: &str, calls: &[(&str, &str)]) -> PathBuf {
        let dir = self.user_dir().join(name);
        std::fs::create_dir_all(&dir).unwrap();

        let mut manifest = format!(
            "[extension]\nid = \"{name}\"\nname = \"{name}\"\nversion = \"1.0.0\"\n"
        );
        for (key, args) in calls {
            manifest.push_str(&format!("\n[[calls]]\nkey = \"{key}\"\nargs = {args}\n"));
        }
        std::fs::write(dir.join("extension.toml"), manifest).unwrap();
        dir
    }
}

/// Records launches; the first `denied` launches fail with a permission error.
struct RecordingSpawner {
    launches: Mutex<Vec<LaunchRequest>>,
    denied: usize,
}

impl RecordingSpawner {
    fn new(denied: usize) -> Arc<Self> {
        Arc::new(Self {
            launches: Mutex::new(Vec::new()),
            denied,
        })
    }

    fn launches(&self) -> Vec<LaunchRequest> {
        self.launches.lock().unwrap().clone()
    }
}

#[async_trait]
impl Spawner for RecordingSpawner {
    async fn spawn(&self, request: &LaunchRequest) -> std::io::Result<Option<i32>> {
        let mut launches = self.launches.lock().unwrap();
        launches.push(request.clone());
        if launches.len() <= self.denied {
            return Err(std::io::Error::from(ErrorKind::PermissionDenied));
        }
        Ok(Some(0))
    }
}

fn mod_info(hash: &str, version: &str) -> ModInfo {
    ModInfo {
        file_name: "Better Skies.zip".to_string(),
        file_size_bytes: 2048,
        game_id: "skyrim".to_string(),
        file_hash: hash.to_string(),
        file_version: version.to_string(),
        ..Default::default()
    }
}

// ==============================================================================
// Startup
// ==============================================================================

#[test]
fn test_startup_applies_markers_and_removals() {
    let fixture = Fixture::new();
    fixture.write_extension("keep", &[("registerDownloadProtocol", "[\"nxm\"]")]);
    fixture.write_extension("muted", &[("registerDownloadProtocol", "[\"muted\"]")]);
    let doomed = fixture.write_extension("doomed", &[]);
    std::fs::write(fixture.user_dir().join("__disable_muted"), "").unwrap();

    let state_file = fixture.config.state_file().unwrap();
    let mut state = ExtensionStateStore::load(&state_file).unwrap();
    state.mark_for_removal("doomed");
    state.save().unwrap();

    let host = Host::builder(fixture.config.clone()).start().unwrap();

    assert!(!doomed.exists());
    assert!(!fixture.user_dir().join("__disable_muted").exists());

    let active = host.manager().active_extensions();
    assert!(active.contains(&"keep"));
    assert!(active.contains(&"download_protocols"));
    assert!(!active.contains(&"muted"));
    assert!(!active.contains(&"doomed"));

    assert!(host.api().protocol_handler("nxm").is_some());
    assert!(host.api().protocol_handler("muted").is_none());

    let saved = ExtensionStateStore::load(&state_file).unwrap();
    assert!(!saved.is_enabled("muted"));
    assert!(saved.get("doomed").is_none());
}

#[test]
fn test_incompatible_extension_is_reported() {
    let fixture = Fixture::new();
    fixture.write_extension("hologram", &[("registerHologram", "[]")]);

    let notifications = Arc::new(NotificationCenter::new());
    let host = Host::builder(fixture.config.clone())
        .with_notifications(notifications.clone())
        .start()
        .unwrap();

    assert!(!host.manager().active_extensions().contains(&"hologram"));
    assert!(notifications.load_failures().contains_key("hologram"));
}

#[tokio::test]
async fn test_once_failures_are_reported() {
    let fixture = Fixture::new();
    let failing = BuiltinExtension::new("flaky", |ctx: &mut ExtensionContext<'_>| {
        ctx.once(|| async { anyhow::bail!("no database") });
        Ok(())
    });

    let host = Host::builder(fixture.config.clone())
        .with_builtin(failing)
        .start()
        .unwrap();

    assert_eq!(host.run_once(false).await, vec!["flaky".to_string()]);
    assert_eq!(host.notifications().errors()[0].extension.as_deref(), Some("flaky"));
}

#[tokio::test]
async fn test_setup_runs_main_then_other_phase() {
    let fixture = Fixture::new();
    let order: Arc<Mutex<Vec<&str>>> = Arc::new(Mutex::new(Vec::new()));

    let recorder = {
        let order = Arc::clone(&order);
        BuiltinExtension::new("setup-order", move |ctx: &mut ExtensionContext<'_>| {
            let main = Arc::clone(&order);
            ctx.once_main(move || {
                let main = Arc::clone(&main);
                async move {
                    main.lock().unwrap().push("main");
                    Ok(())
                }
            });
            let other = Arc::clone(&order);
            ctx.once(move || {
                let other = Arc::clone(&other);
                async move {
                    other.lock().unwrap().push("once");
                    Ok(())
                }
            });
            Ok(())
        })
    };

    let host = Host::builder(fixture.config.clone())
        .with_builtin(recorder)
        .start()
        .unwrap();

    assert!(host.run_setup().await.is_empty());
    assert_eq!(*order.lock().unwrap(), vec!["main", "once"]);
}

// ==============================================================================
// Executables
// ==============================================================================

#[tokio::test]
async fn test_interpreter_rewrites_launch() {
    let fixture = Fixture::new();
    fixture.write_extension(
        "foo-support",
        &[("registerScriptInterpreter", "[\".foo\", \"/opt/real.exe\"]")],
    );

    let spawner = RecordingSpawner::new(0);
    let host = Host::builder(fixture.config.clone())
        .with_spawner(spawner.clone())
        .start()
        .unwrap();

    host.api()
        .run_executable(RunParameters::new("x.foo", vec![]).with_cwd("/mods"))
        .await
        .unwrap();

    let launches = spawner.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].tool_path, PathBuf::from("/opt/real.exe"));
    assert_eq!(launches[0].parameters, vec!["x.foo"]);
}

#[tokio::test]
async fn test_permission_denied_is_retried_elevated_once() {
    let fixture = Fixture::new();
    let spawner = RecordingSpawner::new(1);
    let host = Host::builder(fixture.config.clone())
        .with_spawner(spawner.clone())
        .start()
        .unwrap();

    host.api()
        .run_executable(RunParameters::new("/tools/patcher", vec!["--all".to_string()]))
        .await
        .unwrap();

    let launches = spawner.launches();
    assert_eq!(launches.len(), 2);
    assert_eq!(launches[1].tool_path, PathBuf::from("sudo"));
    assert_eq!(launches[1].parameters, vec!["-E", "/tools/patcher", "--all"]);
    assert_eq!(launches[1].tool_cwd, launches[0].tool_cwd);
    assert_eq!(launches[1].environment, launches[0].environment);
}

#[tokio::test]
async fn test_denied_elevation_is_not_retried_again() {
    let fixture = Fixture::new();
    let spawner = RecordingSpawner::new(2);
    let host = Host::builder(fixture.config.clone())
        .with_spawner(spawner.clone())
        .start()
        .unwrap();

    let result = host
        .api()
        .run_executable(RunParameters::new("/tools/patcher", vec![]))
        .await;

    assert!(result.is_err());
    assert_eq!(spawner.launches().len(), 2);
}

#[tokio::test]
async fn test_deploy_dialog_gates_launch() {
    let fixture = Fixture::new();
    let spawner = RecordingSpawner::new(0);
    let mut host = Host::builder(fixture.config.clone())
        .with_spawner(spawner.clone())
        .start()
        .unwrap();

    let mut signals = host.take_deploy_signals().unwrap();
    let deployer = tokio::spawn(async move {
        match signals.recv().await {
            Some(DeploySignal::DeployMods(reply)) => {
                reply.send(Ok(())).unwrap();
                true
            }
            _ => false,
        }
    });

    let notifications = Arc::clone(host.notifications());
    let user = tokio::spawn(async move {
        let (id, dialog) = notifications.next_dialog().await;
        assert_eq!(dialog.title, DEPLOY_DIALOG_TITLE);
        assert_eq!(dialog.actions, vec!["Cancel", "Skip", "Deploy"]);
        notifications.resolve_dialog(&id, "Deploy");
    });

    host.api()
        .run_executable(RunParameters::new("/tools/lod-gen", vec![]).suggest_deploy())
        .await
        .unwrap();

    user.await.unwrap();
    assert!(deployer.await.unwrap());
    assert_eq!(spawner.launches().len(), 1);
}

// ==============================================================================
// Metadata
// ==============================================================================

#[tokio::test]
async fn test_metadata_roundtrip_through_api() {
    let fixture = Fixture::new();
    let host = Host::builder(fixture.config.clone()).start().unwrap();
    let api = host.api();

    let info = mod_info("abc", "1.0");
    assert!(api.lookup_mod_meta(&info.lookup_details()).await.unwrap().is_empty());

    api.save_mod_meta(&info).await.unwrap();
    let found = api.lookup_mod_meta(&info.lookup_details()).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].value, info);

    let by_reference = api
        .lookup_mod_reference(&ModReference {
            file_hash: "abc".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(by_reference.len(), 1);

    assert!(api
        .lookup_mod_meta(&LookupDetails::default())
        .await
        .unwrap()
        .is_empty());

    host.shutdown().await.unwrap();
    assert!(fixture.temp_dir.path().join("metadb.db").exists());
}

#[tokio::test]
async fn test_switching_game_keeps_database() {
    let fixture = Fixture::new();
    let host = Host::builder(fixture.config.clone()).start().unwrap();

    host.api().save_mod_meta(&mod_info("abc", "1.0")).await.unwrap();

    host.set_active_game("fallout4");
    host.set_api_key("new-key");
    assert_eq!(host.active_tag().game_id, "fallout4");
    assert_eq!(host.active_tag().api_key, "new-key");

    let found = host
        .api()
        .lookup_mod_reference(&ModReference {
            file_hash: "abc".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
}

#[tokio::test]
async fn test_lookup_by_path_publishes_hash() {
    let fixture = Fixture::new();
    let host = Host::builder(fixture.config.clone()).start().unwrap();
    let mut events = host.api().subscribe();

    let archive = fixture.temp_dir.path().join("Better Skies.zip");
    std::fs::write(&archive, b"zip").unwrap();

    let found = host
        .api()
        .lookup_mod_meta(&LookupDetails::for_path(&archive).with_game("skyrim"))
        .await
        .unwrap();
    assert!(found.is_empty());

    let mut hashed = None;
    while let Ok(event) = events.try_recv() {
        if let HostEvent::FileHashCalculated { path, size, .. } = event {
            hashed = Some((path, size));
        }
    }
    assert_eq!(hashed, Some((archive.clone(), 3)));
}

#[test]
fn test_missing_state_file_starts_empty() {
    let fixture = Fixture::new();
    let state_file = fixture.config.state_file().unwrap();
    assert!(!Path::new(&state_file).exists());

    let host = Host::builder(fixture.config.clone()).start().unwrap();
    assert_eq!(
        host.manager().active_extensions(),
        vec!["download_protocols", "script_interpreters"]
    );
}
