//! Error types for the extension runtime.

use thiserror::Error;

/// Errors that can occur in the extension runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Extension not found at the specified path or under the given name.
    #[error("Extension not found: {0}")]
    ExtensionNotFound(String),

    /// Failed to parse extension manifest.
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// A handler for this capability was already provided.
    #[error("Capability already has a handler: {0}")]
    DuplicateApi(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
