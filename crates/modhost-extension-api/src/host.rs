//! The host API handle extensions receive.
//!
//! [`ExtensionApi`] is the only pre-declared field of the extension
//! context. It gives extensions access to host services that exist
//! independently of the capability log: notifications, the event bus,
//! protocol handlers, metadata lookup and executable launching.
//!
//! Metadata lookup and executable launching are wired in by the host
//! after extensions have been loaded; calling them earlier fails with
//! [`ApiError::Unavailable`].

use crate::meta::{LookupDetails, LookupResult, ModInfo, ModReference};
use crate::run::RunParameters;
use async_trait::async_trait;
use modhost_runtime::LoadFailures;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Capacity of the host event channel.
const EVENT_CAPACITY: usize = 256;

/// Errors raised by the host API itself.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0} is not available yet")]
    Unavailable(&'static str),

    #[error("No handler registered for protocol: {0}")]
    UnknownProtocol(String),

    #[error("Not a URL: {0}")]
    InvalidUrl(String),
}

// ============================================================================
// Notifications
// ============================================================================

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
}

/// A non-blocking message for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Assigned by the notifier when empty.
    #[serde(default)]
    pub id: Option<String>,
    pub kind: NotificationKind,
    #[serde(default)]
    pub title: Option<String>,
    pub message: String,
}

impl Notification {
    pub fn new(kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            id: None,
            kind,
            title: None,
            message: message.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// An error shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotification {
    pub title: String,
    pub message: String,
    /// Extension the error is attributed to.
    #[serde(default)]
    pub extension: Option<String>,
    pub error_message: String,
    /// Error chain or backtrace, if any.
    #[serde(default)]
    pub stack: Option<String>,
}

impl ErrorNotification {
    /// Build a notification from an error, keeping its full chain.
    pub fn from_error(title: impl Into<String>, message: impl Into<String>, err: &anyhow::Error) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            extension: None,
            error_message: err.to_string(),
            stack: Some(format!("{:?}", err)),
        }
    }

    pub fn for_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }
}

/// A question for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dialog {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    /// Button labels, in display order.
    pub actions: Vec<String>,
}

/// The user's answer to a dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogResult {
    /// Label of the chosen action.
    pub action: String,
}

/// Presentation collaborator.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Show a notification; returns its id.
    fn send_notification(&self, notification: Notification) -> String;

    /// Remove a notification.
    fn dismiss_notification(&self, id: &str);

    /// Show an error.
    fn show_error(&self, error: ErrorNotification);

    /// Hand over the extensions dropped by validation.
    fn report_load_failures(&self, failures: &LoadFailures);

    /// Ask the user a question and wait for the answer.
    async fn show_dialog(&self, dialog: Dialog) -> anyhow::Result<DialogResult>;
}

/// Notifier that only logs. Dialogs are never answered.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn send_notification(&self, notification: Notification) -> String {
        info!(kind = ?notification.kind, "{}", notification.message);
        notification.id.unwrap_or_default()
    }

    fn dismiss_notification(&self, _id: &str) {}

    fn show_error(&self, error: ErrorNotification) {
        error!(
            extension = error.extension.as_deref().unwrap_or("-"),
            "{}: {} ({})",
            error.title,
            error.message,
            error.error_message
        );
    }

    fn report_load_failures(&self, failures: &LoadFailures) {
        for (extension, failures) in failures {
            warn!(extension = %extension, ?failures, "Extension not loaded");
        }
    }

    async fn show_dialog(&self, dialog: Dialog) -> anyhow::Result<DialogResult> {
        anyhow::bail!("Cannot ask \"{}\": no interactive notifier", dialog.title)
    }
}

// ============================================================================
// Services wired in after loading
// ============================================================================

/// Metadata lookup service.
#[async_trait]
pub trait MetaLookup: Send + Sync {
    async fn lookup_mod_meta(&self, details: &LookupDetails) -> anyhow::Result<Vec<LookupResult>>;

    async fn save_mod_meta(&self, info: &ModInfo) -> anyhow::Result<()>;

    async fn lookup_mod_reference(
        &self,
        reference: &ModReference,
    ) -> anyhow::Result<Vec<LookupResult>>;
}

/// Executable launcher.
#[async_trait]
pub trait ExecutableRunner: Send + Sync {
    async fn run_executable(&self, params: RunParameters) -> anyhow::Result<()>;
}

// ============================================================================
// Events
// ============================================================================

/// Events published on the host event bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A file was hashed while looking up its metadata.
    FileHashCalculated {
        path: PathBuf,
        hash: String,
        size: u64,
    },

    /// A handler was registered for a URL protocol.
    ProtocolRegistered { protocol: String },

    /// An extension failed during init or its one-time setup.
    ExtensionFailed { extension: String, error: String },
}

/// Handler for URLs of one protocol.
pub type ProtocolHandler = Arc<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>;

// ============================================================================
// API handle
// ============================================================================

/// Host services available to extensions.
pub struct ExtensionApi {
    notifier: Arc<dyn Notifier>,
    events: broadcast::Sender<HostEvent>,
    protocols: RwLock<HashMap<String, ProtocolHandler>>,
    meta: RwLock<Option<Arc<dyn MetaLookup>>>,
    runner: RwLock<Option<Arc<dyn ExecutableRunner>>>,
}

impl ExtensionApi {
    /// Create an API handle reporting through `notifier`.
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            notifier,
            events,
            protocols: RwLock::new(HashMap::new()),
            meta: RwLock::new(None),
            runner: RwLock::new(None),
        }
    }

    /// The presentation collaborator.
    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn send_notification(&self, notification: Notification) -> String {
        self.notifier.send_notification(notification)
    }

    pub fn dismiss_notification(&self, id: &str) {
        self.notifier.dismiss_notification(id)
    }

    pub fn show_error(&self, error: ErrorNotification) {
        self.notifier.show_error(error)
    }

    pub async fn show_dialog(&self, dialog: Dialog) -> anyhow::Result<DialogResult> {
        self.notifier.show_dialog(dialog).await
    }

    /// Subscribe to host events.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    /// A sender for host services that publish events on their own.
    pub fn event_sender(&self) -> broadcast::Sender<HostEvent> {
        self.events.clone()
    }

    /// Publish a host event. Events without subscribers are dropped.
    pub fn emit(&self, event: HostEvent) {
        if self.events.send(event).is_err() {
            debug!("Host event dropped, no subscribers");
        }
    }

    // ------------------------------------------------------------------------
    // Protocol handlers
    // ------------------------------------------------------------------------

    /// Handle URLs of `protocol` with `handler`, replacing any previous one.
    pub fn register_protocol(&self, protocol: &str, handler: ProtocolHandler) {
        info!(protocol, "Registering protocol handler");
        self.protocols
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(protocol.to_string(), handler);
        self.emit(HostEvent::ProtocolRegistered {
            protocol: protocol.to_string(),
        });
    }

    /// Stop handling URLs of `protocol`.
    pub fn deregister_protocol(&self, protocol: &str) -> bool {
        info!(protocol, "Deregistering protocol handler");
        self.protocols
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(protocol)
            .is_some()
    }

    /// The handler registered for `protocol`.
    pub fn protocol_handler(&self, protocol: &str) -> Option<ProtocolHandler> {
        self.protocols
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(protocol)
            .cloned()
    }

    /// Dispatch a URL to the handler of its protocol.
    pub fn handle_url(&self, url: &str) -> anyhow::Result<()> {
        let (protocol, _) = url
            .split_once("://")
            .ok_or_else(|| ApiError::InvalidUrl(url.to_string()))?;
        let handler = self
            .protocol_handler(protocol)
            .ok_or_else(|| ApiError::UnknownProtocol(protocol.to_string()))?;
        handler(url)
    }

    // ------------------------------------------------------------------------
    // Metadata lookup
    // ------------------------------------------------------------------------

    /// Wire in the metadata lookup service.
    pub fn set_meta_lookup(&self, meta: Arc<dyn MetaLookup>) {
        *self.meta.write().unwrap_or_else(PoisonError::into_inner) = Some(meta);
    }

    fn meta(&self) -> Result<Arc<dyn MetaLookup>, ApiError> {
        self.meta
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ApiError::Unavailable("Metadata lookup"))
    }

    pub async fn lookup_mod_meta(&self, details: &LookupDetails) -> anyhow::Result<Vec<LookupResult>> {
        self.meta()?.lookup_mod_meta(details).await
    }

    pub async fn save_mod_meta(&self, info: &ModInfo) -> anyhow::Result<()> {
        self.meta()?.save_mod_meta(info).await
    }

    pub async fn lookup_mod_reference(
        &self,
        reference: &ModReference,
    ) -> anyhow::Result<Vec<LookupResult>> {
        self.meta()?.lookup_mod_reference(reference).await
    }

    // ------------------------------------------------------------------------
    // Executables
    // ------------------------------------------------------------------------

    /// Wire in the executable launcher.
    pub fn set_runner(&self, runner: Arc<dyn ExecutableRunner>) {
        *self.runner.write().unwrap_or_else(PoisonError::into_inner) = Some(runner);
    }

    /// Launch an executable.
    pub async fn run_executable(&self, params: RunParameters) -> anyhow::Result<()> {
        let runner = self
            .runner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ApiError::Unavailable("Executable runner"))?;
        runner.run_executable(params).await
    }
}

impl Default for ExtensionApi {
    fn default() -> Self {
        Self::new(Arc::new(LogNotifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_protocol_handlers() {
        let api = ExtensionApi::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        api.register_protocol(
            "nxm",
            Arc::new(move |url: &str| -> anyhow::Result<()> {
                sink.lock().unwrap().push(url.to_string());
                Ok(())
            }),
        );

        assert!(api.protocol_handler("nxm").is_some());
        api.handle_url("nxm://skyrim/mods/1").unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["nxm://skyrim/mods/1".to_string()]);

        assert!(api.deregister_protocol("nxm"));
        assert!(api.protocol_handler("nxm").is_none());
        assert!(api.handle_url("nxm://skyrim/mods/1").is_err());
        assert!(api.handle_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let api = ExtensionApi::default();
        let mut events = api.subscribe();

        api.emit(HostEvent::FileHashCalculated {
            path: PathBuf::from("/downloads/mod.zip"),
            hash: "abc".to_string(),
            size: 3,
        });

        let event = events.recv().await.unwrap();
        assert!(matches!(event, HostEvent::FileHashCalculated { size: 3, .. }));
    }

    #[tokio::test]
    async fn test_services_unavailable_until_wired() {
        let api = ExtensionApi::default();

        let err = api
            .lookup_mod_meta(&LookupDetails::for_hash("abc"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not available"));

        let err = api
            .run_executable(RunParameters::new("/bin/true", vec![]))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ApiError>().is_some());
    }

    #[tokio::test]
    async fn test_log_notifier_refuses_dialogs() {
        let notifier = LogNotifier;
        let result = notifier
            .show_dialog(Dialog {
                kind: NotificationKind::Info,
                title: "Deploy now?".to_string(),
                message: String::new(),
                actions: vec!["Cancel".to_string()],
            })
            .await;
        assert!(result.is_err());
    }
}
