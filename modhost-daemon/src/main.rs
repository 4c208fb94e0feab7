//! # modhost-daemon
//!
//! The modhost daemon.
//!
//! This daemon is responsible for:
//! - Loading built-in and on-disk extensions and validating what they use
//! - Serving mod metadata from the local database and remote servers
//! - Launching tools on behalf of extensions
//! - Keeping notifications and questions for the front end
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      modhost-daemon                          │
//! │                                                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │  │  Extension   │  │   Metadata   │  │   Process    │      │
//! │  │   Manager    │  │    Cache     │  │   Runner     │      │
//! │  └──────────────┘  └──────────────┘  └──────────────┘      │
//! │          │                 │                 │              │
//! │  ┌────────────────────────────────────────────────────┐    │
//! │  │          Extension API + Notification Center        │    │
//! │  └────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration
//!
//! The daemon reads configuration from `$XDG_CONFIG_HOME/modhost/config.toml`.
//!
//! ## Running
//!
//! ```bash
//! # Start the daemon
//! cargo run --bin modhost-daemon
//!
//! # With debug logging
//! RUST_LOG=debug cargo run --bin modhost-daemon
//! ```

use anyhow::Result;
use modhost_daemon::config::Config;
use modhost_daemon::host::Host;
use modhost_daemon::runner::DeploySignal;
use modhost_extension_api::{ExtensionStatus, HostEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration comes first: it carries the log level
    let loaded = Config::load_default();
    let log_level = loaded
        .as_ref()
        .map(|cfg| cfg.daemon.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting modhost-daemon v{}", env!("CARGO_PKG_VERSION"));

    let config = match loaded {
        Ok(cfg) => {
            info!("Loaded configuration from default path");
            cfg
        }
        Err(e) => {
            info!("Failed to load config, using defaults: {:#}", e);
            Config::default()
        }
    };

    let mut host = Host::builder(config).start()?;

    for extension in host.manager().list_extensions() {
        match &extension.status {
            ExtensionStatus::Active => info!("Extension: {} ({:?})", extension.name, extension.path),
            status => warn!("Extension: {} not active: {:?}", extension.name, status),
        }
    }

    // No deployment engine runs inside the daemon; acknowledge requests so
    // launches are not held up.
    if let Some(mut signals) = host.take_deploy_signals() {
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let reply = match signal {
                    DeploySignal::DeployMods(reply) => {
                        info!("Deployment requested");
                        reply
                    }
                    DeploySignal::AwaitActivation(reply) => {
                        info!("Waiting for activation");
                        reply
                    }
                };
                if reply.send(Ok(())).is_err() {
                    debug!("Deployment requester went away");
                }
            }
        });
    }

    let mut events = host.api().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(HostEvent::FileHashCalculated { path, hash, size }) => {
                    debug!(path = %path.display(), %hash, size, "File hashed")
                }
                Ok(event) => debug!(?event, "Host event"),
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {} host event(s)", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let failed = host.run_setup().await;
    info!(
        "Daemon startup complete ({} extension setup failure(s))",
        failed.len()
    );
    info!("Press Ctrl+C to stop");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    host.shutdown().await?;

    info!("Daemon stopped");
    Ok(())
}
