//! # modhost-extension-api
//!
//! Extension API for modhost.
//!
//! This crate sits between the capability log in `modhost-runtime` and the
//! host process. It provides:
//!
//! - [`ExtensionContext`], the registration facade extensions receive
//! - [`ExtensionApi`], the host services extensions can call directly
//! - Extension units and loaders for built-in and on-disk extensions
//! - [`ExtensionManager`], which drives loading, validation and the apply
//!   and once phases
//!
//! ## Writing an Extension
//!
//! A built-in extension is a name plus an init function:
//!
//! ```no_run
//! use modhost_extension_api::{BuiltinExtension, ExtensionContext};
//!
//! let settings = BuiltinExtension::new("settings_interface", |ctx: &mut ExtensionContext<'_>| {
//!     ctx.record("registerSettings", vec!["Interface".into()]);
//!     ctx.optional().record("registerBanner", vec!["main".into()]);
//!     ctx.once(|| async { Ok(()) });
//!     Ok(())
//! });
//! ```

pub mod context;
pub mod host;
pub mod manager;
pub mod meta;
pub mod run;
pub mod unit;

pub use context::{ActionCheck, ExtensionContext, Reducer};
pub use host::{
    ApiError, Dialog, DialogResult, ErrorNotification, ExecutableRunner, ExtensionApi, HostEvent,
    LogNotifier, MetaLookup, Notification, NotificationKind, Notifier, ProtocolHandler,
};
pub use manager::{ExtensionInfo, ExtensionManager, ExtensionStatus, Registrations};
pub use meta::{LookupDetails, LookupFingerprint, LookupResult, ModDetails, ModInfo, ModReference};
pub use run::{Interpreter, RunOptions, RunParameters};
pub use unit::{init_fn, BuiltinExtension, ExtensionInit, ExtensionUnit, ManifestLoader, UnitLoader};
