//! Executable launching
//!
//! [`ProcessRunner`] starts tools on behalf of extensions:
//!
//! 1. A registered interpreter for the executable's file extension rewrites
//!    the request first.
//! 2. Requests with `suggest_deploy` pass the [`DeploymentGate`].
//! 3. The process is started detached from the daemon's stdio and awaited.
//!    A non-zero exit is logged, not returned.
//! 4. A permission error is retried exactly once through the [`Elevator`]
//!    with the same request.

use async_trait::async_trait;
use modhost_extension_api::{
    Dialog, ExecutableRunner, Interpreter, NotificationKind, Notifier, RunParameters,
};
use modhost_extension_api::run::interpreter_key_for;
use std::collections::HashMap;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Errors from launching an executable.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Failed to start {}: {source}", .tool_path.display())]
    Spawn {
        tool_path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Elevated launch of {} failed: {reason}", .tool_path.display())]
    Elevation { tool_path: PathBuf, reason: String },

    #[error("Permission denied and no elevation command is configured")]
    ElevationUnavailable,

    #[error("Deployment failed: {0}")]
    Deployment(String),
}

/// A fully resolved launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub tool_path: PathBuf,
    pub tool_cwd: PathBuf,
    pub parameters: Vec<String>,
    /// Complete environment of the process.
    pub environment: HashMap<OsString, OsString>,
}

impl LaunchRequest {
    /// Resolve `params`: working directory, merged environment and
    /// arguments without quote characters.
    pub fn from_parameters(params: &RunParameters) -> Self {
        let mut environment: HashMap<OsString, OsString> = std::env::vars_os().collect();
        environment.extend(
            params
                .options
                .env
                .iter()
                .map(|(key, value)| (OsString::from(key), OsString::from(value))),
        );

        Self {
            tool_path: params.executable.clone(),
            tool_cwd: params.working_dir(),
            parameters: params.args.iter().map(|arg| arg.replace('"', "")).collect(),
            environment,
        }
    }
}

// ============================================================================
// Process boundary
// ============================================================================

/// Starts processes.
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Start the process and wait for it. Returns its exit code, if any.
    async fn spawn(&self, request: &LaunchRequest) -> std::io::Result<Option<i32>>;
}

/// Spawner using `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

#[async_trait]
impl Spawner for TokioSpawner {
    async fn spawn(&self, request: &LaunchRequest) -> std::io::Result<Option<i32>> {
        let mut command = Command::new(&request.tool_path);
        command
            .args(&request.parameters)
            .current_dir(&request.tool_cwd)
            .env_clear()
            .envs(&request.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        debug!(pid = ?child.id(), tool = %request.tool_path.display(), "Process started");

        let status = child.wait().await?;
        Ok(status.code())
    }
}

/// Runs a launch with elevated privileges.
#[async_trait]
pub trait Elevator: Send + Sync {
    async fn run_elevated(&self, request: &LaunchRequest) -> Result<Option<i32>, RunError>;
}

/// Elevates by prefixing the launch with a command such as `pkexec`.
pub struct CommandElevator {
    command: Vec<String>,
    spawner: Arc<dyn Spawner>,
}

impl CommandElevator {
    pub fn new(command: Vec<String>, spawner: Arc<dyn Spawner>) -> Self {
        Self { command, spawner }
    }
}

#[async_trait]
impl Elevator for CommandElevator {
    async fn run_elevated(&self, request: &LaunchRequest) -> Result<Option<i32>, RunError> {
        let Some((program, prefix_args)) = self.command.split_first() else {
            return Err(RunError::ElevationUnavailable);
        };

        let mut parameters = prefix_args.to_vec();
        parameters.push(request.tool_path.to_string_lossy().into_owned());
        parameters.extend(request.parameters.iter().cloned());

        let elevated = LaunchRequest {
            tool_path: PathBuf::from(program),
            tool_cwd: request.tool_cwd.clone(),
            parameters,
            environment: request.environment.clone(),
        };

        info!(tool = %request.tool_path.display(), via = %program, "Running elevated");
        self.spawner
            .spawn(&elevated)
            .await
            .map_err(|e| RunError::Elevation {
                tool_path: request.tool_path.clone(),
                reason: e.to_string(),
            })
    }
}

// ============================================================================
// Deployment gate
// ============================================================================

/// The user's answer to "deploy before launching?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployDecision {
    /// Deployment happens automatically; wait for it.
    Auto,
    /// Deploy now.
    Yes,
    /// Launch without deploying.
    Skip,
    /// Don't launch.
    Cancel,
}

/// Asked before launching a tool that suggests deployment.
#[async_trait]
pub trait DeploymentGate: Send + Sync {
    async fn query_deploy(&self) -> DeployDecision;

    /// Deploy as the user wants. Returns false if the launch should not
    /// happen.
    async fn check_deploy(&self) -> anyhow::Result<bool>;
}

/// Requests handled by whoever deploys mods.
#[derive(Debug)]
pub enum DeploySignal {
    /// Deploy now and reply when done.
    DeployMods(oneshot::Sender<anyhow::Result<()>>),
    /// Reply once the automatic deployment in progress has finished.
    AwaitActivation(oneshot::Sender<anyhow::Result<()>>),
}

pub const DEPLOY_DIALOG_TITLE: &str = "Deploy now?";
pub const DEPLOY_DIALOG_MESSAGE: &str =
    "You should deploy mods now, otherwise the mods in game will be outdated";

/// Gate driven by the `auto_deploy` setting and a dialog.
pub struct SettingsDeploymentGate {
    auto_deploy: bool,
    notifier: Arc<dyn Notifier>,
    signals: mpsc::Sender<DeploySignal>,
}

impl SettingsDeploymentGate {
    pub fn new(
        auto_deploy: bool,
        notifier: Arc<dyn Notifier>,
        signals: mpsc::Sender<DeploySignal>,
    ) -> Self {
        Self {
            auto_deploy,
            notifier,
            signals,
        }
    }

    async fn signal(
        &self,
        make: impl FnOnce(oneshot::Sender<anyhow::Result<()>>) -> DeploySignal,
    ) -> anyhow::Result<()> {
        let (reply, done) = oneshot::channel();
        self.signals
            .send(make(reply))
            .await
            .map_err(|_| anyhow::anyhow!("Nothing handles deployment"))?;
        done.await
            .map_err(|_| anyhow::anyhow!("Deployment was abandoned"))?
    }
}

#[async_trait]
impl DeploymentGate for SettingsDeploymentGate {
    async fn query_deploy(&self) -> DeployDecision {
        if self.auto_deploy {
            return DeployDecision::Auto;
        }

        let dialog = Dialog {
            kind: NotificationKind::Info,
            title: DEPLOY_DIALOG_TITLE.to_string(),
            message: DEPLOY_DIALOG_MESSAGE.to_string(),
            actions: vec!["Cancel".to_string(), "Skip".to_string(), "Deploy".to_string()],
        };

        match self.notifier.show_dialog(dialog).await {
            Ok(result) if result.action == "Skip" => DeployDecision::Skip,
            Ok(result) if result.action == "Deploy" => DeployDecision::Yes,
            Ok(_) => DeployDecision::Cancel,
            Err(e) => {
                warn!("Deploy dialog failed: {}", e);
                DeployDecision::Cancel
            }
        }
    }

    async fn check_deploy(&self) -> anyhow::Result<bool> {
        let decision = self.query_deploy().await;
        debug!(?decision, "Deployment decision");

        match decision {
            DeployDecision::Yes => {
                self.signal(DeploySignal::DeployMods).await?;
                Ok(true)
            }
            DeployDecision::Auto => {
                self.signal(DeploySignal::AwaitActivation).await?;
                Ok(true)
            }
            DeployDecision::Cancel => Ok(false),
            DeployDecision::Skip => Ok(true),
        }
    }
}

// ============================================================================
// ProcessRunner
// ============================================================================

/// Launches executables for extensions.
pub struct ProcessRunner {
    interpreters: HashMap<String, Interpreter>,
    gate: Option<Arc<dyn DeploymentGate>>,
    spawner: Arc<dyn Spawner>,
    elevator: Arc<dyn Elevator>,
}

impl ProcessRunner {
    pub fn new(spawner: Arc<dyn Spawner>, elevator: Arc<dyn Elevator>) -> Self {
        Self {
            interpreters: HashMap::new(),
            gate: None,
            spawner,
            elevator,
        }
    }

    /// Interpreters by normalized file extension.
    pub fn with_interpreters(mut self, interpreters: HashMap<String, Interpreter>) -> Self {
        self.interpreters = interpreters;
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn DeploymentGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Launch an executable and wait for it to exit.
    pub async fn run(&self, params: RunParameters) -> Result<(), RunError> {
        let params = match interpreter_key_for(&params.executable)
            .and_then(|key| self.interpreters.get(&key))
        {
            Some(interpreter) => {
                let rewritten = interpreter(params.clone());
                debug!(
                    from = %params.executable.display(),
                    to = %rewritten.executable.display(),
                    "Interpreter rewrote launch"
                );
                rewritten
            }
            None => params,
        };

        if params.options.suggest_deploy {
            if let Some(gate) = &self.gate {
                let proceed = gate
                    .check_deploy()
                    .await
                    .map_err(|e| RunError::Deployment(e.to_string()))?;
                if !proceed {
                    info!(tool = %params.executable.display(), "Launch cancelled");
                    return Ok(());
                }
            }
        }

        let request = LaunchRequest::from_parameters(&params);
        info!(tool = %request.tool_path.display(), args = ?request.parameters, "Launching");

        let code = match self.spawner.spawn(&request).await {
            Ok(code) => code,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                info!(tool = %request.tool_path.display(), "Permission denied, retrying elevated");
                self.elevator.run_elevated(&request).await?
            }
            Err(e) => {
                return Err(RunError::Spawn {
                    tool_path: request.tool_path,
                    source: e,
                })
            }
        };

        if code != Some(0) {
            warn!(tool = %request.tool_path.display(), exit_code = ?code, "Process exited with an error");
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutableRunner for ProcessRunner {
    async fn run_executable(&self, params: RunParameters) -> anyhow::Result<()> {
        Ok(self.run(params).await?)
    }
}
