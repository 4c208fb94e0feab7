//! Extensions compiled into the daemon.
//!
//! Both provide capabilities to other extensions: on-disk extensions can
//! only declare plain-data calls, so these turn such calls into protocol
//! handlers and interpreters.

use modhost_extension_api::run::normalize_extension;
use modhost_extension_api::{
    BuiltinExtension, ExtensionApi, ExtensionContext, Interpreter, Notification,
    NotificationKind, RunParameters,
};
use modhost_runtime::CallArg;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, info};

pub const DOWNLOAD_PROTOCOLS: &str = "download_protocols";
pub const REGISTER_DOWNLOAD_PROTOCOL: &str = "registerDownloadProtocol";

pub const SCRIPT_INTERPRETERS: &str = "script_interpreters";
pub const REGISTER_SCRIPT_INTERPRETER: &str = "registerScriptInterpreter";

/// Provides `registerDownloadProtocol(protocol, ...)`.
///
/// URLs of a registered protocol are announced as download requests.
pub fn download_protocols() -> BuiltinExtension {
    BuiltinExtension::new(DOWNLOAD_PROTOCOLS, |ctx: &mut ExtensionContext<'_>| {
        let api = Arc::downgrade(ctx.api());
        ctx.provide_api(REGISTER_DOWNLOAD_PROTOCOL, move |args, extension_path| {
            let Some(api) = api.upgrade() else {
                return Ok(());
            };
            for protocol in args.iter().filter_map(CallArg::as_str) {
                debug!(protocol, path = %extension_path.display(), "Download protocol requested");
                api.register_protocol(protocol, download_handler(Arc::downgrade(&api)));
            }
            Ok(())
        })?;
        Ok(())
    })
}

fn download_handler(api: Weak<ExtensionApi>) -> modhost_extension_api::ProtocolHandler {
    Arc::new(move |url: &str| -> anyhow::Result<()> {
        info!(url, "Download requested");
        if let Some(api) = api.upgrade() {
            api.send_notification(
                Notification::new(NotificationKind::Info, format!("Download requested: {url}"))
                    .with_title("Download"),
            );
        }
        Ok(())
    })
}

/// Interpreters registered with `registerScriptInterpreter`.
///
/// `registerScriptInterpreter(extension, program, ...program_args)` starts
/// files with `extension` as `program ...program_args file ...args`. A
/// relative `program` is resolved against the registering extension's
/// directory when it exists there.
#[derive(Clone, Default)]
pub struct ScriptInterpreters {
    registered: Arc<Mutex<HashMap<String, Interpreter>>>,
}

impl ScriptInterpreters {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in extension providing `registerScriptInterpreter`.
    pub fn extension(&self) -> BuiltinExtension {
        let registered = Arc::clone(&self.registered);
        BuiltinExtension::new(SCRIPT_INTERPRETERS, move |ctx: &mut ExtensionContext<'_>| {
            let registered = Arc::clone(&registered);
            ctx.provide_api(REGISTER_SCRIPT_INTERPRETER, move |args, extension_path| {
                let mut strings = args.iter().filter_map(CallArg::as_str);
                let (Some(extension), Some(program)) = (strings.next(), strings.next()) else {
                    anyhow::bail!(
                        "{} expects an extension and a program",
                        REGISTER_SCRIPT_INTERPRETER
                    );
                };
                let program_args: Vec<String> = strings.map(str::to_string).collect();
                let program = resolve_program(program, extension_path);

                let key = normalize_extension(extension);
                info!(extension = %key, program = %program.display(), "Registering script interpreter");
                registered
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key, script_interpreter(program, program_args));
                Ok(())
            })?;
            Ok(())
        })
    }

    /// Interpreters registered so far, by normalized extension.
    pub fn interpreters(&self) -> HashMap<String, Interpreter> {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn resolve_program(program: &str, extension_path: &Path) -> PathBuf {
    let program = PathBuf::from(program);
    if program.is_relative() {
        let bundled = extension_path.join(&program);
        if bundled.exists() {
            return bundled;
        }
    }
    program
}

fn script_interpreter(program: PathBuf, program_args: Vec<String>) -> Interpreter {
    Arc::new(move |params: RunParameters| {
        let mut args = program_args.clone();
        args.push(params.executable.to_string_lossy().into_owned());
        args.extend(params.args);
        RunParameters {
            executable: program.clone(),
            args,
            options: params.options,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use modhost_extension_api::ExtensionManager;
    use modhost_runtime::ExtensionStateStore;
    use tempfile::TempDir;

    fn manager(builtins: Vec<BuiltinExtension>, root: &Path) -> ExtensionManager {
        ExtensionManager::new(Arc::new(ExtensionApi::default()))
            .with_builtins(builtins)
            .with_search_roots(vec![root.to_path_buf()])
    }

    fn user_extension(root: &Path, name: &str, key: &str, args: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("extension.toml"),
            format!(
                "[extension]\nid = \"{name}\"\nname = \"{name}\"\nversion = \"0.1.0\"\n\n[[calls]]\nkey = \"{key}\"\nargs = {args}\n"
            ),
        )
        .unwrap();
    }

    #[test]
    fn test_download_protocols_registers_handlers() {
        let temp_dir = TempDir::new().unwrap();
        user_extension(temp_dir.path(), "nxm-links", REGISTER_DOWNLOAD_PROTOCOL, "[\"nxm\"]");

        let mut manager = manager(vec![download_protocols()], temp_dir.path());
        manager.load(&ExtensionStateStore::in_memory());
        manager.apply_extensions_of_extensions();

        let api = manager.api();
        assert!(api.protocol_handler("nxm").is_some());
        api.handle_url("nxm://skyrim/mods/266/files/1000").unwrap();
    }

    #[test]
    fn test_script_interpreter_rewrites_launch() {
        let temp_dir = TempDir::new().unwrap();
        user_extension(
            temp_dir.path(),
            "python",
            REGISTER_SCRIPT_INTERPRETER,
            "[\".PY\", \"/usr/bin/python3\", \"-u\"]",
        );

        let scripts = ScriptInterpreters::new();
        let mut manager = manager(vec![scripts.extension()], temp_dir.path());
        manager.load(&ExtensionStateStore::in_memory());
        manager.apply_extensions_of_extensions();

        let interpreters = scripts.interpreters();
        let interpreter = interpreters.get("py").unwrap();
        let rewritten = interpreter(RunParameters::new("/tools/clean.py", vec!["--dry".to_string()]));

        assert_eq!(rewritten.executable, PathBuf::from("/usr/bin/python3"));
        assert_eq!(rewritten.args, vec!["-u", "/tools/clean.py", "--dry"]);
    }

    #[test]
    fn test_relative_program_resolves_next_to_extension() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("runner.sh"), "#!/bin/sh\n").unwrap();

        assert_eq!(
            resolve_program("runner.sh", temp_dir.path()),
            temp_dir.path().join("runner.sh")
        );
        assert_eq!(resolve_program("python3", temp_dir.path()), PathBuf::from("python3"));
    }

    #[test]
    fn test_malformed_script_interpreter_call_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        user_extension(temp_dir.path(), "broken", REGISTER_SCRIPT_INTERPRETER, "[\"py\"]");

        let scripts = ScriptInterpreters::new();
        let mut manager = manager(vec![scripts.extension()], temp_dir.path());
        manager.load(&ExtensionStateStore::in_memory());

        assert_eq!(manager.apply_extensions_of_extensions(), 1);
        assert!(scripts.interpreters().is_empty());
    }
}
