//! Extension units: a name, a location and an init function.
//!
//! Built-in extensions are compiled into the host. On-disk extensions are
//! turned into units by a [`UnitLoader`]; the default [`ManifestLoader`]
//! builds the init function from the calls declared in `extension.toml`.

use crate::context::ExtensionContext;
use modhost_runtime::{CallArg, ExtensionManifest, ExtensionPath, RuntimeResult};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// An extension's init function. Called exactly once, with the context
/// attributed to the extension.
pub type ExtensionInit =
    Arc<dyn Fn(&mut ExtensionContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as an init function.
pub fn init_fn<F>(init: F) -> ExtensionInit
where
    F: Fn(&mut ExtensionContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(init)
}

/// A loadable extension.
#[derive(Clone)]
pub struct ExtensionUnit {
    pub name: String,
    pub path: PathBuf,
    pub init: ExtensionInit,
}

impl ExtensionUnit {
    pub fn new<F>(name: impl Into<String>, path: impl Into<PathBuf>, init: F) -> Self
    where
        F: Fn(&mut ExtensionContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            path: path.into(),
            init: init_fn(init),
        }
    }
}

impl fmt::Debug for ExtensionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionUnit")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

/// An extension compiled into the host.
///
/// Its path is the directory of the same name in the first search root.
#[derive(Clone)]
pub struct BuiltinExtension {
    pub name: String,
    pub init: ExtensionInit,
}

impl BuiltinExtension {
    pub fn new<F>(name: impl Into<String>, init: F) -> Self
    where
        F: Fn(&mut ExtensionContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            init: init_fn(init),
        }
    }
}

impl fmt::Debug for BuiltinExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltinExtension")
            .field("name", &self.name)
            .finish()
    }
}

/// Turns a discovered extension directory into a unit.
pub trait UnitLoader: Send + Sync {
    /// Load the extension at `extension`.
    ///
    /// Returns `Ok(None)` when the directory is not an extension.
    fn load(&self, extension: &ExtensionPath) -> RuntimeResult<Option<ExtensionUnit>>;
}

/// Loads extensions declared by an `extension.toml` manifest.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestLoader;

impl UnitLoader for ManifestLoader {
    fn load(&self, extension: &ExtensionPath) -> RuntimeResult<Option<ExtensionUnit>> {
        if !extension.has_manifest() {
            debug!("No manifest in {:?}, skipping", extension.path);
            return Ok(None);
        }

        let manifest = ExtensionManifest::from_file(&extension.manifest_path())?;
        debug!(
            "Loaded manifest for {} v{} ({} calls)",
            manifest.extension.name,
            manifest.extension.version,
            manifest.calls.len()
        );

        let calls: Vec<(String, Vec<Value>, bool)> = manifest
            .calls
            .iter()
            .map(|call| -> RuntimeResult<_> {
                Ok((call.key.clone(), call.json_args()?, call.optional))
            })
            .collect::<RuntimeResult<_>>()?;

        let unit = ExtensionUnit::new(
            extension.name.clone(),
            extension.path.clone(),
            move |context: &mut ExtensionContext<'_>| {
                for (key, args, optional) in &calls {
                    let args: Vec<CallArg> = args.iter().cloned().map(CallArg::from).collect();
                    if *optional {
                        context.optional().record(key, args);
                    } else {
                        context.record(key, args);
                    }
                }
                Ok(())
            },
        );

        Ok(Some(unit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ExtensionApi;
    use modhost_runtime::{discover_extension, CapabilityRegistry, RuntimeError};
    use tempfile::TempDir;

    #[test]
    fn test_manifest_loader_replays_calls() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("links");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("extension.toml"),
            r#"
[extension]
id = "links"
name = "Links"
version = "1.0.0"

[[calls]]
key = "registerDownloadProtocol"
args = ["nxm"]

[[calls]]
key = "registerDashlet"
args = ["Links", 3]
optional = true
"#,
        )
        .unwrap();

        let extension = discover_extension(&dir).unwrap();
        let unit = ManifestLoader.load(&extension).unwrap().unwrap();
        assert_eq!(unit.name, "links");

        let api = Arc::new(ExtensionApi::default());
        let mut registry = CapabilityRegistry::new();
        registry.set_extension(&unit.name, &unit.path);
        {
            let mut context = ExtensionContext::new(&mut registry, &api);
            (unit.init)(&mut context).unwrap();
        }

        let calls = registry.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].key(), "registerDownloadProtocol");
        assert_eq!(calls[0].args()[0].as_str(), Some("nxm"));
        assert!(!calls[0].optional);
        assert!(calls[1].optional);
        assert_eq!(calls[1].args()[1].as_value(), Some(&serde_json::json!(3)));
    }

    #[test]
    fn test_directory_without_manifest_is_not_a_unit() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("assets");
        std::fs::create_dir_all(&dir).unwrap();

        let extension = discover_extension(&dir).unwrap();
        assert!(ManifestLoader.load(&extension).unwrap().is_none());
    }

    #[test]
    fn test_invalid_manifest_is_a_load_error() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("broken");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("extension.toml"), "[extension]\nid = 3\n").unwrap();

        let extension = discover_extension(&dir).unwrap();
        let result = ManifestLoader.load(&extension);
        assert!(matches!(result, Err(RuntimeError::Toml(_))));
    }
}
