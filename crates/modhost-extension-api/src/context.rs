//! The registration facade handed to extension init functions.
//!
//! Every registration funnels into [`ExtensionContext::record`], which
//! appends to the capability log without checking whether the host
//! implements the capability. Typed wrappers exist for the capabilities
//! the host itself consumes; anything else goes through `record` with a
//! free-form key and is validated after all extensions have run.

use crate::host::ExtensionApi;
use crate::run::Interpreter;
use modhost_runtime::capability::{OnceFuture, OnceThunk};
use modhost_runtime::compat::REQUIRE_EXTENSION;
use modhost_runtime::{ApiCallback, CallArg, CapabilityRegistry, RuntimeResult};
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

/// Capability key of reducer registrations.
pub const REGISTER_REDUCER: &str = "registerReducer";

/// Capability key of action check registrations.
pub const REGISTER_ACTION_CHECK: &str = "registerActionCheck";

/// Capability key of interpreter registrations.
pub const REGISTER_INTERPRETER: &str = "registerInterpreter";

/// Computes the next state of a state subtree from an action.
pub type Reducer = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

/// Inspects an action before it is applied; returns a complaint if the
/// action would leave the state inconsistent.
pub type ActionCheck = Arc<dyn Fn(&Value, &Value) -> Option<String> + Send + Sync>;

/// Context an extension registers itself through during init.
pub struct ExtensionContext<'a> {
    registry: &'a mut CapabilityRegistry,
    api: &'a Arc<ExtensionApi>,
    optional: bool,
}

impl<'a> ExtensionContext<'a> {
    /// Create a context recording into `registry`.
    ///
    /// The registry must already be attributed to the extension being
    /// initialized.
    pub fn new(registry: &'a mut CapabilityRegistry, api: &'a Arc<ExtensionApi>) -> Self {
        Self {
            registry,
            api,
            optional: false,
        }
    }

    /// The host API handle.
    pub fn api(&self) -> &Arc<ExtensionApi> {
        self.api
    }

    /// Name of the extension being initialized.
    pub fn extension_name(&self) -> &str {
        self.registry.current_extension()
    }

    /// Path of the extension being initialized.
    pub fn extension_path(&self) -> &Path {
        self.registry.current_path()
    }

    /// Whether calls through this context are optional.
    pub fn is_optional(&self) -> bool {
        self.optional
    }

    /// A context whose calls are optional: the extension is never dropped
    /// because the host lacks one of them.
    pub fn optional(&mut self) -> ExtensionContext<'_> {
        ExtensionContext {
            registry: &mut *self.registry,
            api: self.api,
            optional: true,
        }
    }

    /// Register for the capability `key`.
    pub fn record(&mut self, key: &str, args: Vec<CallArg>) {
        if self.optional {
            self.registry.record_optional(key, args);
        } else {
            self.registry.record(key, args);
        }
    }

    /// Declare that this extension needs the extension `name`.
    pub fn require_extension(&mut self, name: &str) {
        self.record(REQUIRE_EXTENSION, vec![name.into()]);
    }

    /// Contribute a reducer for the state subtree at `path`.
    pub fn register_reducer(&mut self, path: &[&str], reducer: Reducer) {
        let path: Vec<Value> = path.iter().map(|s| Value::from(*s)).collect();
        self.record(
            REGISTER_REDUCER,
            vec![CallArg::value(path), CallArg::object(reducer)],
        );
    }

    /// Contribute a check for actions of `action_type`.
    pub fn register_action_check(&mut self, action_type: &str, check: ActionCheck) {
        self.record(
            REGISTER_ACTION_CHECK,
            vec![action_type.into(), CallArg::object(check)],
        );
    }

    /// Launch files with `extension` through `interpreter`.
    pub fn register_interpreter(&mut self, extension: &str, interpreter: Interpreter) {
        self.record(
            REGISTER_INTERPRETER,
            vec![extension.into(), CallArg::object(interpreter)],
        );
    }

    /// Run `setup` once after startup.
    pub fn once<F, Fut>(&mut self, setup: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.once_thunk(false, into_thunk(setup));
    }

    /// Run `setup` once after startup, in the main host process.
    pub fn once_main<F, Fut>(&mut self, setup: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.once_thunk(true, into_thunk(setup));
    }

    /// Register a raw once thunk. A thunk returning `None` completed
    /// synchronously.
    pub fn once_thunk(&mut self, main: bool, thunk: OnceThunk) {
        self.registry.record_once(main, thunk, self.optional);
    }

    /// Handle every call other extensions make to `key`.
    pub fn provide_api<F>(&mut self, key: &str, handler: F) -> RuntimeResult<()>
    where
        F: Fn(&[CallArg], &Path) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback: ApiCallback = Arc::new(handler);
        self.registry.add_api(key, callback)
    }
}

fn into_thunk<F, Fut>(setup: F) -> OnceThunk
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || {
        let future: OnceFuture = Box::pin(setup());
        Some(future)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunParameters;

    fn registry_for(name: &str) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.set_extension(name, format!("/ext/{}", name));
        registry
    }

    #[test]
    fn test_typed_wrappers_record_calls() {
        let api = Arc::new(ExtensionApi::default());
        let mut registry = registry_for("scripts");

        {
            let mut context = ExtensionContext::new(&mut registry, &api);
            assert_eq!(context.extension_name(), "scripts");

            let interpreter: Interpreter = Arc::new(|params: RunParameters| params);
            context.register_interpreter(".py", interpreter);
            context.require_extension("python_runtime");
            context.record("registerSettings", vec!["Python".into()]);
        }

        let keys: Vec<_> = registry.calls().iter().map(|c| c.key().to_string()).collect();
        assert_eq!(
            keys,
            vec![REGISTER_INTERPRETER, REQUIRE_EXTENSION, "registerSettings"]
        );

        let call = registry.get_calls(REGISTER_INTERPRETER).next().unwrap();
        assert_eq!(call.args()[0].as_str(), Some(".py"));
        assert!(call.args()[1].downcast_ref::<Interpreter>().is_some());
    }

    #[test]
    fn test_optional_context() {
        let api = Arc::new(ExtensionApi::default());
        let mut registry = registry_for("fancy");

        {
            let mut context = ExtensionContext::new(&mut registry, &api);
            context.optional().record("registerHologram", vec![]);
            context.record("registerSettings", vec![]);
            context.optional().once(|| async { Ok(()) });
        }

        let optional: Vec<_> = registry.calls().iter().map(|c| c.optional).collect();
        assert_eq!(optional, vec![true, false, true]);
    }

    #[test]
    fn test_reducer_path_is_plain_data() {
        let api = Arc::new(ExtensionApi::default());
        let mut registry = registry_for("downloads");

        {
            let mut context = ExtensionContext::new(&mut registry, &api);
            let reducer: Reducer = Arc::new(|state: &Value, _action: &Value| state.clone());
            context.register_reducer(&["persistent", "downloads"], reducer);
        }

        let call = registry.get_calls(REGISTER_REDUCER).next().unwrap();
        assert_eq!(
            call.args()[0].as_value(),
            Some(&serde_json::json!(["persistent", "downloads"]))
        );
    }

    #[test]
    fn test_provide_api_rejects_duplicates() {
        let api = Arc::new(ExtensionApi::default());
        let mut registry = registry_for("provider");

        let mut context = ExtensionContext::new(&mut registry, &api);
        context
            .provide_api("registerDownloadProtocol", |_, _| Ok(()))
            .unwrap();
        assert!(context
            .provide_api("registerDownloadProtocol", |_, _| Ok(()))
            .is_err());
    }

    #[tokio::test]
    async fn test_once_records_deferred_thunk() {
        let api = Arc::new(ExtensionApi::default());
        let mut registry = registry_for("setup");

        {
            let mut context = ExtensionContext::new(&mut registry, &api);
            context.once_main(|| async { anyhow::bail!("boom") });
        }

        let call = registry.get_calls("onceMain").next().unwrap();
        let future = (call.thunk().unwrap())().unwrap();
        assert!(future.await.is_err());
    }
}
