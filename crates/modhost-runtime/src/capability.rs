//! The capability log.
//!
//! Extensions never reach host subsystems directly while they initialize.
//! Every registration they make is appended to the log held by
//! [`CapabilityRegistry`] and replayed later by the host, once it knows
//! which capabilities it can actually serve.
//!
//! Two kinds of entries exist:
//!
//! - `Apply` entries carry a capability key and its arguments and are
//!   replayed synchronously into host subsystems.
//! - `Once` entries carry a deferred thunk that runs exactly once after
//!   startup, one extension at a time.

use crate::error::{RuntimeError, RuntimeResult};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

/// Capability key under which `once` thunks are recorded.
pub const ONCE_KEY: &str = "once";

/// Capability key under which `onceMain` thunks are recorded.
pub const ONCE_MAIN_KEY: &str = "onceMain";

/// Completion returned by a once thunk.
pub type OnceFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A deferred one-time setup function. Returning `None` means the work
/// finished synchronously.
pub type OnceThunk = Arc<dyn Fn() -> Option<OnceFuture> + Send + Sync>;

/// Handler an extension provides for a capability other extensions call.
///
/// Receives the recorded arguments followed by the calling extension's path.
pub type ApiCallback = Arc<dyn Fn(&[CallArg], &Path) -> anyhow::Result<()> + Send + Sync>;

/// A single recorded argument.
///
/// Plain data is kept as JSON. Anything else (reducers, interpreters,
/// protocol handlers) is stored type-erased and recovered by the
/// subsystem that knows its concrete type.
#[derive(Clone)]
pub enum CallArg {
    /// Plain data.
    Value(Value),
    /// A host object such as a closure.
    Object(Arc<dyn Any + Send + Sync>),
}

impl CallArg {
    /// Wrap plain data.
    pub fn value(value: impl Into<Value>) -> Self {
        CallArg::Value(value.into())
    }

    /// Wrap a host object.
    pub fn object<T: Any + Send + Sync>(object: T) -> Self {
        CallArg::Object(Arc::new(object))
    }

    /// Get the plain data, if this argument is data.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            CallArg::Value(value) => Some(value),
            CallArg::Object(_) => None,
        }
    }

    /// Get the argument as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        self.as_value().and_then(Value::as_str)
    }

    /// Recover a host object of type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            CallArg::Object(object) => (**object).downcast_ref::<T>(),
            CallArg::Value(_) => None,
        }
    }
}

impl fmt::Debug for CallArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallArg::Value(value) => write!(f, "{}", value),
            CallArg::Object(_) => f.write_str("<object>"),
        }
    }
}

impl From<Value> for CallArg {
    fn from(value: Value) -> Self {
        CallArg::Value(value)
    }
}

impl From<&str> for CallArg {
    fn from(value: &str) -> Self {
        CallArg::Value(Value::String(value.to_string()))
    }
}

impl From<String> for CallArg {
    fn from(value: String) -> Self {
        CallArg::Value(Value::String(value))
    }
}

/// What an extension asked for.
#[derive(Clone)]
pub enum CapabilityCommand {
    /// Register with a host feature; replayed synchronously.
    Apply { key: String, args: Vec<CallArg> },
    /// Deferred one-time setup. `main` selects the main-process variant.
    Once { main: bool, thunk: OnceThunk },
}

impl CapabilityCommand {
    /// The capability key this command is recorded under.
    pub fn key(&self) -> &str {
        match self {
            CapabilityCommand::Apply { key, .. } => key,
            CapabilityCommand::Once { main: true, .. } => ONCE_MAIN_KEY,
            CapabilityCommand::Once { main: false, .. } => ONCE_KEY,
        }
    }
}

impl fmt::Debug for CapabilityCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityCommand::Apply { key, args } => f
                .debug_struct("Apply")
                .field("key", key)
                .field("args", args)
                .finish(),
            CapabilityCommand::Once { main, .. } => {
                f.debug_struct("Once").field("main", main).finish()
            }
        }
    }
}

/// One entry of the capability log.
#[derive(Debug, Clone)]
pub struct CapabilityCall {
    /// Name of the extension that made the call.
    pub extension: String,

    /// Path of the extension that made the call.
    pub extension_path: PathBuf,

    /// The recorded command.
    pub command: CapabilityCommand,

    /// Calls made through the optional recorder are never held against
    /// the extension during validation.
    pub optional: bool,
}

impl CapabilityCall {
    /// The capability key.
    pub fn key(&self) -> &str {
        self.command.key()
    }

    /// Recorded arguments. Once entries have none.
    pub fn args(&self) -> &[CallArg] {
        match &self.command {
            CapabilityCommand::Apply { args, .. } => args,
            CapabilityCommand::Once { .. } => &[],
        }
    }

    /// The deferred thunk of a once entry.
    pub fn thunk(&self) -> Option<&OnceThunk> {
        match &self.command {
            CapabilityCommand::Once { thunk, .. } => Some(thunk),
            CapabilityCommand::Apply { .. } => None,
        }
    }
}

/// A handler for a capability, contributed by an extension.
#[derive(Clone)]
pub struct ApiAddition {
    pub key: String,
    pub callback: ApiCallback,
}

impl fmt::Debug for ApiAddition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiAddition").field("key", &self.key).finish()
    }
}

/// Append-only log of capability calls plus the extension-provided
/// handlers that consume some of them.
///
/// The registry is driven by a single loader: [`set_extension`] must be
/// called before each extension's init so that every call is attributed.
///
/// [`set_extension`]: CapabilityRegistry::set_extension
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    /// Active calls, in recording order.
    calls: Vec<CapabilityCall>,

    /// Calls removed by validation, kept for diagnostics.
    pruned: Vec<CapabilityCall>,

    /// Extension-provided handlers, in the order they were provided.
    additions: Vec<ApiAddition>,

    current_extension: String,
    current_path: PathBuf,
}

impl CapabilityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Change the extension subsequent calls are attributed to.
    pub fn set_extension(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.current_extension = name.into();
        self.current_path = path.into();
    }

    /// Name of the extension calls are currently attributed to.
    pub fn current_extension(&self) -> &str {
        &self.current_extension
    }

    /// Path of the extension calls are currently attributed to.
    pub fn current_path(&self) -> &Path {
        &self.current_path
    }

    /// Record a capability call.
    pub fn record(&mut self, key: impl Into<String>, args: Vec<CallArg>) {
        let key = key.into();
        self.push(CapabilityCommand::Apply { key, args }, false);
    }

    /// Record a capability call the extension can live without.
    pub fn record_optional(&mut self, key: impl Into<String>, args: Vec<CallArg>) {
        let key = key.into();
        self.push(CapabilityCommand::Apply { key, args }, true);
    }

    /// Record a deferred one-time thunk.
    pub fn record_once(&mut self, main: bool, thunk: OnceThunk, optional: bool) {
        self.push(CapabilityCommand::Once { main, thunk }, optional);
    }

    fn push(&mut self, command: CapabilityCommand, optional: bool) {
        debug!(
            extension = %self.current_extension,
            key = command.key(),
            optional,
            "Recorded capability call"
        );
        self.calls.push(CapabilityCall {
            extension: self.current_extension.clone(),
            extension_path: self.current_path.clone(),
            command,
            optional,
        });
    }

    /// Provide a handler for a capability.
    ///
    /// A key can have at most one handler.
    pub fn add_api(&mut self, key: impl Into<String>, callback: ApiCallback) -> RuntimeResult<()> {
        let key = key.into();
        if self.has_api(&key) {
            return Err(RuntimeError::DuplicateApi(key));
        }

        debug!(extension = %self.current_extension, key = %key, "Capability handler provided");
        self.additions.push(ApiAddition { key, callback });
        Ok(())
    }

    /// Check whether an extension provided a handler for `key`.
    pub fn has_api(&self, key: &str) -> bool {
        self.additions.iter().any(|addition| addition.key == key)
    }

    /// Keys of all extension-provided handlers.
    pub fn api_keys(&self) -> impl Iterator<Item = &str> {
        self.additions.iter().map(|addition| addition.key.as_str())
    }

    /// Calls recorded under `key`, in recording order.
    pub fn get_calls<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a CapabilityCall> + 'a {
        self.calls.iter().filter(move |call| call.key() == key)
    }

    /// All active calls.
    pub fn calls(&self) -> &[CapabilityCall] {
        &self.calls
    }

    /// Calls removed by validation or by a failed init.
    pub fn pruned_calls(&self) -> &[CapabilityCall] {
        &self.pruned
    }

    /// Replay every call to an extension-provided capability through its
    /// handler.
    ///
    /// Handlers run in the order they were provided; calls in recording
    /// order. A failing handler invocation is logged and does not stop the
    /// replay. Returns the number of invocations.
    pub fn invoke_additions(&self) -> usize {
        let mut invoked = 0;

        for addition in &self.additions {
            for call in self.get_calls(&addition.key) {
                invoked += 1;
                if let Err(e) = (addition.callback)(call.args(), &call.extension_path) {
                    warn!(
                        extension = %call.extension,
                        key = %addition.key,
                        "Capability handler failed: {:#}",
                        e
                    );
                }
            }
        }

        invoked
    }

    /// Move every call of the given extensions out of the active log.
    pub(crate) fn prune<F>(&mut self, mut is_removed: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.calls)
            .into_iter()
            .partition(|call| is_removed(&call.extension));

        let count = removed.len();
        self.calls = kept;
        self.pruned.extend(removed);
        count
    }

    /// Drop every call an extension made, e.g. after its init failed.
    pub fn discard_extension(&mut self, extension: &str) -> usize {
        self.prune(|name| name == extension)
    }
}
