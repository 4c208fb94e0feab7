//! Compatibility and dependency validation of the capability log.
//!
//! Validation runs once, after every extension has been initialized.
//! Failures are collected across all extensions first and the log is
//! pruned afterwards in a single pass, so one extension's failure never
//! hides another's.

use crate::capability::CapabilityRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

/// Capability key extensions use to declare a dependency on another
/// extension.
pub const REQUIRE_EXTENSION: &str = "requireExtension";

/// Capabilities every host version implements.
pub const STATIC_APIS: &[&str] = &[
    "registerMainPage",
    "registerDashlet",
    "registerDialog",
    "registerSettings",
    "registerAction",
    "registerBanner",
    "registerDeploymentMethod",
    "registerInstaller",
    "registerFooter",
    "registerToDo",
    "registerModSource",
    "registerReducer",
    "registerPersistor",
    "registerSettingsHive",
    "registerTableAttribute",
    "registerTest",
    "registerArchiveType",
    "registerGame",
    "registerGameInfoProvider",
    "registerAttributeExtractor",
    "registerModType",
    "registerActionCheck",
    "registerMerge",
    "registerInterpreter",
    REQUIRE_EXTENSION,
    "api",
    "once",
    "onceMain",
    "optional",
];

/// Why an extension was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "kebab-case")]
pub enum ExtensionLoadFailure {
    /// The extension called a capability nothing implements.
    UnsupportedApi { api: String },

    /// The extension requires another extension that isn't installed.
    #[serde(rename_all = "camelCase")]
    Dependency { dependency_id: String },
}

/// Failure category, without details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    UnsupportedApi,
    Dependency,
}

impl ExtensionLoadFailure {
    /// The failure category.
    pub fn kind(&self) -> FailureKind {
        match self {
            ExtensionLoadFailure::UnsupportedApi { .. } => FailureKind::UnsupportedApi,
            ExtensionLoadFailure::Dependency { .. } => FailureKind::Dependency,
        }
    }
}

/// Load failures per extension name.
pub type LoadFailures = BTreeMap<String, Vec<ExtensionLoadFailure>>;

impl CapabilityRegistry {
    /// Remove every call of every extension that is incompatible with this
    /// host.
    ///
    /// An extension is incompatible if it made a non-optional call to a
    /// capability that is neither static, in `further_apis`, nor provided
    /// by another extension, or if it requires an extension missing from
    /// `all_extensions`. Never fails; the returned map is empty when all
    /// extensions are compatible.
    pub fn unload_incompatible(
        &mut self,
        further_apis: &HashSet<String>,
        all_extensions: &[String],
    ) -> LoadFailures {
        let full_api: HashSet<&str> = STATIC_APIS
            .iter()
            .copied()
            .chain(further_apis.iter().map(String::as_str))
            .chain(self.api_keys())
            .collect();

        let mut incompatible = LoadFailures::new();

        for call in self
            .calls()
            .iter()
            .filter(|call| !call.optional && !full_api.contains(call.key()))
        {
            debug!(extension = %call.extension, api = call.key(), "Unsupported api call");
            incompatible
                .entry(call.extension.clone())
                .or_default()
                .push(ExtensionLoadFailure::UnsupportedApi {
                    api: call.key().to_string(),
                });
        }

        for call in self.get_calls(REQUIRE_EXTENSION) {
            let required = call.args().first().and_then(|arg| arg.as_str());
            let present = required
                .map(|id| all_extensions.iter().any(|name| name == id))
                .unwrap_or(false);

            if !present {
                incompatible
                    .entry(call.extension.clone())
                    .or_default()
                    .push(ExtensionLoadFailure::Dependency {
                        dependency_id: required.unwrap_or_default().to_string(),
                    });
            }
        }

        if incompatible.is_empty() {
            debug!("All extensions compatible");
        } else {
            info!(
                extensions = %incompatible.keys().cloned().collect::<Vec<_>>().join(", "),
                "Extensions ignored for using unsupported api"
            );
            let removed = self.prune(|name| incompatible.contains_key(name));
            debug!("Pruned {} calls of incompatible extensions", removed);
        }

        incompatible
    }
}
