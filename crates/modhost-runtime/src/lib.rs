//! # modhost-runtime
//!
//! Extension runtime primitives for modhost.
//!
//! This crate provides:
//! - The capability log extensions record their registrations into
//! - Post-hoc compatibility and dependency validation of that log
//! - Extension discovery from ordered search roots
//! - Extension manifest parsing
//! - Persisted enable/disable state
//!
//! ## Extension Structure
//!
//! On-disk extensions are directories containing an `extension.toml`
//! file. Built-in extensions are compiled into the host and never touch
//! the filesystem.
//!
//! ## Compatibility Model
//!
//! Extensions may call any capability while they initialize. Nothing is
//! checked at call time; once every extension has run, the log is
//! validated against the capabilities the host actually implements and
//! every extension that used something missing is dropped as a whole.

pub mod capability;
pub mod compat;
pub mod discovery;
pub mod error;
pub mod manifest;
pub mod state;

pub use capability::{
    ApiAddition, ApiCallback, CallArg, CapabilityCall, CapabilityCommand, CapabilityRegistry,
    OnceFuture, OnceThunk,
};
pub use compat::{ExtensionLoadFailure, FailureKind, LoadFailures, STATIC_APIS};
pub use discovery::{discover_extension, discover_in_directory, ExtensionPath};
pub use error::{RuntimeError, RuntimeResult};
pub use manifest::{DeclaredCall, ExtensionManifest, ExtensionMetadata};
pub use state::{ExtensionState, ExtensionStateStore};
