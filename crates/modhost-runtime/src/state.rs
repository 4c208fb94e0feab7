//! Persisted enable/disable state of extensions.
//!
//! The state is a JSON object mapping extension names to
//! `{ "enabled": bool, "remove": bool }`. It is read once at startup;
//! changes made while the host runs take effect on the next start.

use crate::error::RuntimeResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Prefix of marker files that disable an extension on next start.
pub const DISABLE_MARKER_PREFIX: &str = "__disable_";

/// Persisted state of one extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionState {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Delete the extension from the user root on next start.
    #[serde(default)]
    pub remove: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for ExtensionState {
    fn default() -> Self {
        Self {
            enabled: true,
            remove: false,
        }
    }
}

/// Extension state backed by a JSON file.
#[derive(Debug, Default)]
pub struct ExtensionStateStore {
    path: Option<PathBuf>,
    states: BTreeMap<String, ExtensionState>,
}

impl ExtensionStateStore {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the state file. A missing file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> RuntimeResult<Self> {
        let path = path.into();

        let states = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            debug!("No extension state at {:?}, starting empty", path);
            BTreeMap::new()
        };

        Ok(Self {
            path: Some(path),
            states,
        })
    }

    /// Write the state back to its file.
    pub fn save(&self) -> RuntimeResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&self.states)?)?;
        Ok(())
    }

    /// Extensions are enabled unless the state says otherwise.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.states.get(name).map(|s| s.enabled).unwrap_or(true)
    }

    /// Get the state of an extension, if any was persisted.
    pub fn get(&self, name: &str) -> Option<&ExtensionState> {
        self.states.get(name)
    }

    /// Enable or disable an extension.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) {
        self.states.entry(name.to_string()).or_default().enabled = enabled;
    }

    /// Flag an extension for deletion on next start.
    pub fn mark_for_removal(&mut self, name: &str) {
        self.states.entry(name.to_string()).or_default().remove = true;
    }

    /// Forget everything about an extension.
    pub fn forget(&mut self, name: &str) -> Option<ExtensionState> {
        self.states.remove(name)
    }

    /// Names with persisted state.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(String::as_str)
    }

    /// Disable every extension that has a `__disable_<name>` marker file in
    /// `marker_dir`, deleting the markers.
    ///
    /// Returns the names that were disabled. A missing directory is fine.
    pub fn apply_disable_markers(&mut self, marker_dir: &Path) -> RuntimeResult<Vec<String>> {
        let entries = match std::fs::read_dir(marker_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut disabled = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name
                .to_str()
                .and_then(|n| n.strip_prefix(DISABLE_MARKER_PREFIX))
            else {
                continue;
            };

            info!("Disabling extension {} (marker file)", name);
            self.set_enabled(name, false);
            if let Err(e) = std::fs::remove_file(entry.path()) {
                warn!("Failed to remove disable marker {:?}: {}", entry.path(), e);
            }
            disabled.push(name.to_string());
        }

        Ok(disabled)
    }

    /// Delete every extension flagged for removal from `user_dir` and
    /// forget it.
    pub fn remove_flagged(&mut self, user_dir: &Path) -> RuntimeResult<Vec<String>> {
        let flagged: Vec<String> = self
            .states
            .iter()
            .filter(|(_, state)| state.remove)
            .map(|(name, _)| name.clone())
            .collect();

        for name in &flagged {
            let path = user_dir.join(name);
            if path.exists() {
                info!("Removing extension {} from {:?}", name, path);
                std::fs::remove_dir_all(&path)?;
            }
            self.forget(name);
        }

        Ok(flagged)
    }
}
