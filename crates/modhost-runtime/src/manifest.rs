//! Extension manifest parsing.
//!
//! Each on-disk extension has an `extension.toml` file that describes its
//! metadata and the capability calls it makes when initialized.

use crate::error::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name of the manifest file inside an extension directory.
pub const MANIFEST_FILE: &str = "extension.toml";

/// Extension manifest structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionManifest {
    /// Extension metadata.
    pub extension: ExtensionMetadata,

    /// Capability calls made during init, in order.
    #[serde(default)]
    pub calls: Vec<DeclaredCall>,
}

/// Extension metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionMetadata {
    /// Unique identifier for the extension.
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Version string (semver).
    pub version: String,

    /// Extension description.
    #[serde(default)]
    pub description: Option<String>,

    /// Extension author(s).
    #[serde(default)]
    pub authors: Vec<String>,

    /// License identifier.
    #[serde(default)]
    pub license: Option<String>,

    /// Homepage URL.
    #[serde(default)]
    pub homepage: Option<String>,
}

/// A capability call declared in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclaredCall {
    /// Capability key.
    pub key: String,

    /// Arguments, plain data only.
    #[serde(default)]
    pub args: Vec<toml::Value>,

    /// Whether the call goes through the optional recorder.
    #[serde(default)]
    pub optional: bool,
}

impl DeclaredCall {
    /// Arguments converted to JSON values.
    pub fn json_args(&self) -> RuntimeResult<Vec<serde_json::Value>> {
        self.args
            .iter()
            .map(|arg| serde_json::to_value(arg).map_err(RuntimeError::from))
            .collect()
    }
}

impl ExtensionManifest {
    /// Load a manifest from a TOML file.
    pub fn from_file(path: &Path) -> RuntimeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse a manifest from a TOML string.
    pub fn from_str(content: &str) -> RuntimeResult<Self> {
        let manifest: ExtensionManifest = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate the manifest.
    fn validate(&self) -> RuntimeResult<()> {
        if self.extension.id.is_empty() {
            return Err(RuntimeError::InvalidManifest(
                "Extension ID cannot be empty".to_string(),
            ));
        }

        if self.extension.name.is_empty() {
            return Err(RuntimeError::InvalidManifest(
                "Extension name cannot be empty".to_string(),
            ));
        }

        if self.extension.version.is_empty() {
            return Err(RuntimeError::InvalidManifest(
                "Extension version cannot be empty".to_string(),
            ));
        }

        if let Some(index) = self.calls.iter().position(|call| call.key.is_empty()) {
            return Err(RuntimeError::InvalidManifest(format!(
                "Call #{} has an empty key",
                index + 1
            )));
        }

        Ok(())
    }
}
