//! Extension discovery from ordered search roots.
//!
//! Extensions are discovered from the following locations (in order):
//!
//! 1. `$XDG_DATA_HOME/modhost/plugins/` (user extensions)
//! 2. The bundled extensions directory shipped with the host
//!
//! Only the first extension with a given name is used, so the user root
//! must be scanned before the bundled one for user copies to replace
//! bundled ones. Each extension is a directory; its name is the directory
//! name.

use crate::error::{RuntimeError, RuntimeResult};
use crate::manifest::MANIFEST_FILE;
use crate::state::ExtensionStateStore;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A discovered on-disk extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionPath {
    /// Extension name (the directory name).
    pub name: String,

    /// Path to the extension directory.
    pub path: PathBuf,
}

impl ExtensionPath {
    /// Get the path to the manifest file.
    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    /// Check if the manifest file exists.
    pub fn has_manifest(&self) -> bool {
        self.manifest_path().exists()
    }
}

/// Get the user extensions directory.
pub fn user_extensions_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "modhost", "modhost")
        .map(|dirs| dirs.data_dir().join("plugins"))
}

/// Scan one search root for extensions.
///
/// Names in `taken` are skipped; every returned extension is added to
/// `taken` before the caller gets a chance to load it, so a user copy that
/// fails to load never falls back to a bundled copy of the same name.
/// Disabled extensions are skipped. A missing root is created and yields
/// nothing.
pub fn discover_in_directory(
    dir: &Path,
    taken: &mut HashSet<String>,
    state: &ExtensionStateStore,
) -> RuntimeResult<Vec<ExtensionPath>> {
    if !dir.exists() {
        info!("Extensions directory {:?} doesn't exist, creating it", dir);
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!("Failed to create extensions directory {:?}: {}", dir, e);
        }
        return Ok(Vec::new());
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!("Failed to read extensions directory {:?}: {}", dir, e);
            return Ok(Vec::new());
        }
    };

    // Directory order is filesystem dependent.
    let mut candidates: Vec<(String, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            Some((name, entry.path()))
        })
        .collect();
    candidates.sort_by(|a, b| a.0.cmp(&b.0));

    let mut found = Vec::new();

    for (name, path) in candidates {
        if taken.contains(&name) {
            debug!("Skipping {}: an extension with that name is already loaded", name);
            continue;
        }

        if !state.is_enabled(&name) {
            debug!("Skipping disabled extension: {}", name);
            continue;
        }

        if !path.is_dir() {
            continue;
        }

        taken.insert(name.clone());
        found.push(ExtensionPath { name, path });
    }

    Ok(found)
}

/// Discover a single extension from a path.
pub fn discover_extension(path: &Path) -> RuntimeResult<ExtensionPath> {
    if !path.is_dir() {
        return Err(RuntimeError::ExtensionNotFound(path.display().to_string()));
    }

    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| RuntimeError::ExtensionNotFound(path.display().to_string()))?;

    Ok(ExtensionPath {
        name: name.to_string(),
        path: path.to_path_buf(),
    })
}
