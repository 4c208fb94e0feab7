//! Extension lifecycle management.
//!
//! The manager discovers extension units, initializes each one against a
//! shared capability registry, validates the resulting log and then
//! drives its two execution phases:
//!
//! - **apply**: synchronous replay of registrations into host subsystems,
//!   see [`ExtensionManager::apply`] and
//!   [`ExtensionManager::collect_registrations`].
//! - **once**: deferred one-time setup, run one extension at a time, see
//!   [`ExtensionManager::do_once`].
//!
//! A failure in one extension never stops the others from loading or
//! running.

use crate::context::{
    ActionCheck, ExtensionContext, Reducer, REGISTER_ACTION_CHECK, REGISTER_INTERPRETER,
    REGISTER_REDUCER,
};
use crate::host::{ErrorNotification, ExtensionApi, HostEvent};
use crate::run::{interpreter_key_for, normalize_extension, Interpreter};
use crate::unit::{BuiltinExtension, ExtensionUnit, ManifestLoader, UnitLoader};
use modhost_runtime::capability::{OnceThunk, ONCE_KEY, ONCE_MAIN_KEY};
use modhost_runtime::{
    discover_in_directory, CallArg, CapabilityRegistry, ExtensionLoadFailure,
    ExtensionStateStore, LoadFailures,
};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const REPORT_HINT: &str = "If this isn't an official extension, please report the error to the \
                           respective author.";

/// Status of an extension after loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionStatus {
    /// Loaded, initialized and compatible.
    Active,
    /// Dropped by validation.
    Incompatible(Vec<ExtensionLoadFailure>),
    /// Failed to load or to initialize.
    Failed(String),
}

/// Information about an extension the manager tried to load.
#[derive(Debug, Clone)]
pub struct ExtensionInfo {
    pub name: String,
    pub path: PathBuf,
    pub status: ExtensionStatus,
}

/// Host-side registrations collected in the apply phase.
#[derive(Clone, Default)]
pub struct Registrations {
    /// Reducers with the state path they own, in registration order.
    pub reducers: Vec<(Vec<String>, Reducer)>,

    /// Action checks per action type.
    pub action_checks: HashMap<String, Vec<ActionCheck>>,

    /// Interpreters per normalized file extension.
    pub interpreters: HashMap<String, Interpreter>,
}

impl Registrations {
    /// The interpreter registered for `executable`'s extension.
    pub fn interpreter_for(&self, executable: &Path) -> Option<&Interpreter> {
        interpreter_key_for(executable).and_then(|key| self.interpreters.get(&key))
    }
}

impl fmt::Debug for Registrations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registrations")
            .field(
                "reducers",
                &self.reducers.iter().map(|(path, _)| path).collect::<Vec<_>>(),
            )
            .field("action_checks", &self.action_checks.keys().collect::<Vec<_>>())
            .field("interpreters", &self.interpreters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Manager for extensions.
///
/// Owns the capability registry for the lifetime of the process. `load`
/// is meant to be called once.
pub struct ExtensionManager {
    api: Arc<ExtensionApi>,
    registry: CapabilityRegistry,
    builtins: Vec<BuiltinExtension>,
    loader: Arc<dyn UnitLoader>,
    search_roots: Vec<PathBuf>,
    ui_apis: HashSet<String>,
    extensions: Vec<ExtensionInfo>,
    load_failures: LoadFailures,
}

impl ExtensionManager {
    /// Create a manager without built-ins or search roots.
    pub fn new(api: Arc<ExtensionApi>) -> Self {
        Self {
            api,
            registry: CapabilityRegistry::new(),
            builtins: Vec::new(),
            loader: Arc::new(ManifestLoader),
            search_roots: Vec::new(),
            ui_apis: HashSet::new(),
            extensions: Vec::new(),
            load_failures: LoadFailures::new(),
        }
    }

    /// Built-in extensions, loaded first in the given order.
    pub fn with_builtins(mut self, builtins: Vec<BuiltinExtension>) -> Self {
        self.builtins = builtins;
        self
    }

    /// Search roots, scanned in order. The first root that has an extension
    /// of a given name wins, so user roots go before bundled ones.
    pub fn with_search_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.search_roots = roots;
        self
    }

    /// Use `loader` for on-disk extensions.
    pub fn with_loader(mut self, loader: Arc<dyn UnitLoader>) -> Self {
        self.loader = loader;
        self
    }

    /// Declare a capability implemented by the presentation layer.
    ///
    /// Must be called before [`load`](Self::load).
    pub fn register_ui_api(&mut self, name: impl Into<String>) {
        self.ui_apis.insert(name.into());
    }

    /// The host API handle passed to extensions.
    pub fn api(&self) -> &Arc<ExtensionApi> {
        &self.api
    }

    /// The validated capability log.
    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Extensions dropped by validation, with the reasons.
    pub fn load_failures(&self) -> &LoadFailures {
        &self.load_failures
    }

    /// Every extension the manager tried to load, in load order.
    pub fn list_extensions(&self) -> &[ExtensionInfo] {
        &self.extensions
    }

    /// Names of the active extensions, in load order.
    pub fn active_extensions(&self) -> Vec<&str> {
        self.extensions
            .iter()
            .filter(|info| info.status == ExtensionStatus::Active)
            .map(|info| info.name.as_str())
            .collect()
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Discover, initialize and validate all extensions.
    ///
    /// Returns the number of active extensions.
    pub fn load(&mut self, state: &ExtensionStateStore) -> usize {
        let units = self.collect_units(state);

        let mut initialized = Vec::with_capacity(units.len());
        for unit in &units {
            match self.init_unit(unit) {
                Ok(()) => initialized.push(unit),
                Err(message) => self.extensions.push(ExtensionInfo {
                    name: unit.name.clone(),
                    path: unit.path.clone(),
                    status: ExtensionStatus::Failed(message),
                }),
            }
        }

        // Units that failed to initialize don't satisfy dependencies.
        let names: Vec<String> = initialized.iter().map(|unit| unit.name.clone()).collect();
        self.load_failures = self.registry.unload_incompatible(&self.ui_apis, &names);

        for unit in initialized {
            let status = match self.load_failures.get(&unit.name) {
                Some(failures) => ExtensionStatus::Incompatible(failures.clone()),
                None => ExtensionStatus::Active,
            };
            self.extensions.push(ExtensionInfo {
                name: unit.name.clone(),
                path: unit.path.clone(),
                status,
            });
        }

        self.api.notifier().report_load_failures(&self.load_failures);

        let active = self.active_extensions().len();
        info!(
            "Loaded {} extensions ({} incompatible, {} failed)",
            active,
            self.load_failures.len(),
            self.extensions.len() - active - self.load_failures.len()
        );
        active
    }

    /// Built-ins first, then every search root in order.
    fn collect_units(&mut self, state: &ExtensionStateStore) -> Vec<ExtensionUnit> {
        let canonical_root = self.search_roots.first().cloned().unwrap_or_default();

        // On-disk extensions never shadow built-ins.
        let mut taken: HashSet<String> = self.builtins.iter().map(|b| b.name.clone()).collect();

        let mut units: Vec<ExtensionUnit> = self
            .builtins
            .iter()
            .filter(|builtin| {
                let enabled = state.is_enabled(&builtin.name);
                if !enabled {
                    debug!("Skipping disabled extension: {}", builtin.name);
                }
                enabled
            })
            .map(|builtin| ExtensionUnit {
                name: builtin.name.clone(),
                path: canonical_root.join(&builtin.name),
                init: Arc::clone(&builtin.init),
            })
            .collect();

        let roots = self.search_roots.clone();
        for root in &roots {
            let discovered = match discover_in_directory(root, &mut taken, state) {
                Ok(discovered) => discovered,
                Err(e) => {
                    warn!("Failed to scan extensions in {:?}: {}", root, e);
                    continue;
                }
            };

            for extension in discovered {
                let started = Instant::now();
                match self.loader.load(&extension) {
                    Ok(Some(unit)) => {
                        debug!(
                            extension = %unit.name,
                            load_time_ms = started.elapsed().as_millis() as u64,
                            "Loaded extension"
                        );
                        units.push(unit);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let error = anyhow::Error::from(e);
                        warn!(extension = %extension.name, "Failed to load extension: {:#}", error);
                        self.report_failure(&extension.name, "Failed to load extension", &error);
                        self.extensions.push(ExtensionInfo {
                            name: extension.name,
                            path: extension.path,
                            status: ExtensionStatus::Failed(error.to_string()),
                        });
                    }
                }
            }
        }

        units
    }

    /// Run one extension's init function.
    ///
    /// On failure every call the extension made is discarded.
    fn init_unit(&mut self, unit: &ExtensionUnit) -> Result<(), String> {
        debug!(extension = %unit.name, "Initializing extension");
        self.registry.set_extension(&unit.name, &unit.path);

        let outcome = {
            let mut context = ExtensionContext::new(&mut self.registry, &self.api);
            panic::catch_unwind(AssertUnwindSafe(|| (unit.init)(&mut context)))
        };

        let error = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(payload) => anyhow::anyhow!("init panicked: {}", panic_message(payload.as_ref())),
        };

        warn!(extension = %unit.name, "Couldn't initialize extension: {:#}", error);
        let discarded = self.registry.discard_extension(&unit.name);
        debug!(extension = %unit.name, "Discarded {} calls", discarded);
        self.report_failure(&unit.name, "Extension failed to initialize", &error);

        Err(format!("{:#}", error))
    }

    fn report_failure(&self, extension: &str, title: &str, error: &anyhow::Error) {
        self.api.show_error(
            ErrorNotification::from_error(title, REPORT_HINT, error).for_extension(extension),
        );
        self.api.emit(HostEvent::ExtensionFailed {
            extension: extension.to_string(),
            error: format!("{:#}", error),
        });
    }

    // ========================================================================
    // Apply phase
    // ========================================================================

    /// Replay every call to `key` through `handler`, in call order.
    ///
    /// Returns the number of replayed calls.
    pub fn apply<F>(&self, key: &str, mut handler: F) -> usize
    where
        F: FnMut(&[CallArg]),
    {
        let mut count = 0;
        for call in self.registry.get_calls(key) {
            handler(call.args());
            count += 1;
        }
        count
    }

    /// Collect the reducers, action checks and interpreters extensions
    /// registered.
    pub fn collect_registrations(&self) -> Registrations {
        let mut registrations = Registrations::default();

        self.apply(REGISTER_REDUCER, |args| {
            let path = args
                .first()
                .and_then(CallArg::as_value)
                .and_then(|value| value.as_array())
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|part| part.as_str().map(str::to_string))
                        .collect::<Vec<_>>()
                });
            let reducer = args.get(1).and_then(|arg| arg.downcast_ref::<Reducer>());

            match (path, reducer) {
                (Some(path), Some(reducer)) => {
                    registrations.reducers.push((path, Arc::clone(reducer)))
                }
                _ => warn!("Ignoring malformed {} call: {:?}", REGISTER_REDUCER, args),
            }
        });

        self.apply(REGISTER_ACTION_CHECK, |args| {
            let action_type = args.first().and_then(CallArg::as_str);
            let check = args.get(1).and_then(|arg| arg.downcast_ref::<ActionCheck>());

            match (action_type, check) {
                (Some(action_type), Some(check)) => registrations
                    .action_checks
                    .entry(action_type.to_string())
                    .or_default()
                    .push(Arc::clone(check)),
                _ => warn!("Ignoring malformed {} call: {:?}", REGISTER_ACTION_CHECK, args),
            }
        });

        self.apply(REGISTER_INTERPRETER, |args| {
            let extension = args.first().and_then(CallArg::as_str);
            let interpreter = args.get(1).and_then(|arg| arg.downcast_ref::<Interpreter>());

            match (extension, interpreter) {
                (Some(extension), Some(interpreter)) => {
                    let key = normalize_extension(extension);
                    if registrations
                        .interpreters
                        .insert(key.clone(), Arc::clone(interpreter))
                        .is_some()
                    {
                        debug!("Interpreter for .{} replaced", key);
                    }
                }
                _ => warn!("Ignoring malformed {} call: {:?}", REGISTER_INTERPRETER, args),
            }
        });

        registrations
    }

    /// Feed extension-provided capabilities with the calls other extensions
    /// made to them.
    pub fn apply_extensions_of_extensions(&self) -> usize {
        self.registry.invoke_additions()
    }

    // ========================================================================
    // Once phase
    // ========================================================================

    /// Run every `once` (or, with `main`, `onceMain`) thunk, one extension
    /// at a time.
    ///
    /// A failing thunk is reported and the remaining ones still run.
    /// Returns the names of the extensions whose setup failed.
    pub async fn do_once(&self, main: bool) -> Vec<String> {
        let key = if main { ONCE_MAIN_KEY } else { ONCE_KEY };
        let thunks: Vec<(String, OnceThunk)> = self
            .registry
            .get_calls(key)
            .filter_map(|call| call.thunk().map(|t| (call.extension.clone(), Arc::clone(t))))
            .collect();

        debug!("Running {} {} thunks", thunks.len(), key);

        let mut failed = Vec::new();
        for (extension, thunk) in thunks {
            let result = match panic::catch_unwind(AssertUnwindSafe(|| thunk())) {
                Ok(Some(future)) => match tokio::spawn(future).await {
                    Ok(result) => result,
                    Err(e) => Err(anyhow::anyhow!("one-time setup panicked: {}", e)),
                },
                Ok(None) => Ok(()),
                Err(payload) => Err(anyhow::anyhow!(
                    "one-time setup panicked: {}",
                    panic_message(payload.as_ref())
                )),
            };

            if let Err(e) = result {
                warn!(extension = %extension, "Failed to call {}: {:#}", key, e);
                self.report_failure(&extension, "Extension failed to initialize", &e);
                failed.push(extension);
            }
        }

        failed
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
