//! Host wiring
//!
//! [`Host`] owns everything the daemon runs: the notification center, the
//! extension manager and the API handle extensions use, the metadata cache
//! and the process runner. Startup happens in [`HostBuilder::start`]:
//!
//! 1. Read the persisted extension state, apply disable markers and delete
//!    extensions flagged for removal
//! 2. Load built-in and on-disk extensions, validate them and run the
//!    extensions-of-extensions pass
//! 3. Collect registrations and wire the metadata cache and process runner
//!    into the API handle
//!
//! The once phases are left to the caller ([`Host::run_setup`]).

use crate::builtin::{download_protocols, ScriptInterpreters};
use crate::config::Config;
use crate::metadb::{
    MetaDbTag, MetaLookupCache, MetaStoreFactory, RemoteServer, RemoteSource, SqliteStoreFactory,
};
use crate::notifications::NotificationCenter;
use crate::runner::{
    CommandElevator, DeploySignal, ProcessRunner, SettingsDeploymentGate, Spawner, TokioSpawner,
};
use anyhow::{Context, Result};
use modhost_extension_api::{BuiltinExtension, ExtensionApi, ExtensionManager, Registrations};
use modhost_runtime::ExtensionStateStore;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Capacity of the deploy signal channel.
const DEPLOY_SIGNAL_CAPACITY: usize = 8;

/// Builds and starts a [`Host`].
pub struct HostBuilder {
    config: Config,
    builtins: Vec<BuiltinExtension>,
    spawner: Option<Arc<dyn Spawner>>,
    store_factory: Option<Arc<dyn MetaStoreFactory>>,
    notifications: Option<Arc<NotificationCenter>>,
}

impl HostBuilder {
    /// Add a built-in extension after the daemon's own.
    pub fn with_builtin(mut self, builtin: BuiltinExtension) -> Self {
        self.builtins.push(builtin);
        self
    }

    /// Start processes with `spawner` instead of `tokio::process`.
    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Open metadata stores with `factory` instead of SQLite.
    pub fn with_store_factory(mut self, factory: Arc<dyn MetaStoreFactory>) -> Self {
        self.store_factory = Some(factory);
        self
    }

    pub fn with_notifications(mut self, notifications: Arc<NotificationCenter>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    /// Load extensions and wire up host services.
    pub fn start(self) -> Result<Host> {
        let config = self.config;

        let state = prepare_state(&config)?;

        let notifications = self
            .notifications
            .unwrap_or_else(|| Arc::new(NotificationCenter::new()));
        let api = Arc::new(ExtensionApi::new(notifications.clone()));

        let scripts = ScriptInterpreters::new();
        let mut builtins = vec![download_protocols(), scripts.extension()];
        builtins.extend(self.builtins);

        let mut manager = ExtensionManager::new(Arc::clone(&api))
            .with_builtins(builtins)
            .with_search_roots(config.search_roots()?);

        let active = manager.load(&state);
        info!("Loaded {} extension(s)", active);

        let invoked = manager.apply_extensions_of_extensions();
        info!("Dispatched {} extension-provided call(s)", invoked);

        let registrations = manager.collect_registrations();
        let mut interpreters = scripts.interpreters();
        interpreters.extend(registrations.interpreters.clone());

        // Metadata
        let (tag, tag_rx) = watch::channel(MetaDbTag::new(
            config.session.game_id.clone().unwrap_or_default(),
            config.api_key(),
        ));
        let factory: Arc<dyn MetaStoreFactory> = match self.store_factory {
            Some(factory) => factory,
            None => {
                let servers = config.metadb.servers.iter().map(RemoteServer::from).collect();
                Arc::new(SqliteStoreFactory::new(
                    config.metadb_path()?,
                    RemoteSource::new(servers),
                ))
            }
        };
        let meta = Arc::new(MetaLookupCache::new(factory, tag_rx).with_events(api.event_sender()));
        api.set_meta_lookup(meta.clone());

        // Executables
        let (deploy_tx, deploy_rx) = mpsc::channel(DEPLOY_SIGNAL_CAPACITY);
        let gate = SettingsDeploymentGate::new(
            config.runner.auto_deploy,
            notifications.clone(),
            deploy_tx,
        );
        let spawner: Arc<dyn Spawner> = match self.spawner {
            Some(spawner) => spawner,
            None => Arc::new(TokioSpawner),
        };
        let elevator = CommandElevator::new(config.runner.elevation_command.clone(), spawner.clone());
        let runner = Arc::new(
            ProcessRunner::new(spawner, Arc::new(elevator))
                .with_interpreters(interpreters)
                .with_gate(Arc::new(gate)),
        );
        api.set_runner(runner.clone());

        Ok(Host {
            config,
            notifications,
            api,
            manager,
            registrations,
            meta,
            runner,
            tag,
            deploy_signals: Some(deploy_rx),
        })
    }
}

/// Load the persisted extension state and apply pending changes to it.
fn prepare_state(config: &Config) -> Result<ExtensionStateStore> {
    let state_file = config.state_file()?;
    let mut state = ExtensionStateStore::load(&state_file)
        .with_context(|| format!("Failed to read extension state: {}", state_file.display()))?;

    let disabled = state
        .apply_disable_markers(&config.disable_marker_dir()?)
        .context("Failed to apply disable markers")?;
    let removed = state
        .remove_flagged(&config.user_extensions_dir()?)
        .context("Failed to remove extensions")?;

    for name in &disabled {
        info!(extension = %name, "Disabled by marker");
    }
    for name in &removed {
        info!(extension = %name, "Removed");
    }

    if !disabled.is_empty() || !removed.is_empty() {
        state
            .save()
            .with_context(|| format!("Failed to write extension state: {}", state_file.display()))?;
    }

    Ok(state)
}

/// The running daemon.
pub struct Host {
    config: Config,
    notifications: Arc<NotificationCenter>,
    api: Arc<ExtensionApi>,
    manager: ExtensionManager,
    registrations: Registrations,
    meta: Arc<MetaLookupCache>,
    runner: Arc<ProcessRunner>,
    tag: watch::Sender<MetaDbTag>,
    deploy_signals: Option<mpsc::Receiver<DeploySignal>>,
}

impl Host {
    pub fn builder(config: Config) -> HostBuilder {
        HostBuilder {
            config,
            builtins: Vec::new(),
            spawner: None,
            store_factory: None,
            notifications: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn notifications(&self) -> &Arc<NotificationCenter> {
        &self.notifications
    }

    pub fn api(&self) -> &Arc<ExtensionApi> {
        &self.api
    }

    pub fn manager(&self) -> &ExtensionManager {
        &self.manager
    }

    /// Reducers, action checks and interpreters extensions registered.
    pub fn registrations(&self) -> &Registrations {
        &self.registrations
    }

    pub fn meta(&self) -> &Arc<MetaLookupCache> {
        &self.meta
    }

    pub fn runner(&self) -> &Arc<ProcessRunner> {
        &self.runner
    }

    /// Take the receiving end of deployment requests. Whoever deploys mods
    /// answers them.
    pub fn take_deploy_signals(&mut self) -> Option<mpsc::Receiver<DeploySignal>> {
        self.deploy_signals.take()
    }

    /// Run the one-time setup of every extension.
    ///
    /// Returns the names of extensions whose setup failed.
    pub async fn run_once(&self, main: bool) -> Vec<String> {
        let failed = self.manager.do_once(main).await;
        if !failed.is_empty() {
            warn!(?failed, "Extension setup failed");
        }
        failed
    }

    /// Run both setup phases: `onceMain` thunks, then `once` thunks.
    ///
    /// The daemon is the only process, so it runs both. Returns the names
    /// of extensions whose setup failed, in phase order.
    pub async fn run_setup(&self) -> Vec<String> {
        let mut failed = self.run_once(true).await;
        failed.extend(self.run_once(false).await);
        failed
    }

    /// Switch the game metadata lookups are scoped to.
    pub fn set_active_game(&self, game_id: impl Into<String>) {
        let game_id = game_id.into();
        info!(game = %game_id, "Active game changed");
        self.tag.send_modify(|tag| tag.game_id = game_id);
    }

    /// Switch the API key used for remote metadata.
    pub fn set_api_key(&self, api_key: impl Into<String>) {
        let api_key = api_key.into();
        self.tag.send_modify(|tag| tag.api_key = api_key);
    }

    /// The tag the metadata store is currently opened for.
    pub fn active_tag(&self) -> MetaDbTag {
        self.tag.borrow().clone()
    }

    /// Release the metadata store.
    pub async fn shutdown(&self) -> Result<()> {
        self.meta
            .close()
            .await
            .context("Failed to close metadata database")
    }
}
