//! Mod metadata types exchanged with the metadata lookup service.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// What is known about a file whose metadata is being looked up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupDetails {
    /// Path of the file on disk.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    /// Content hash of the file, if already known.
    #[serde(default)]
    pub file_hash: Option<String>,

    /// Size of the file in bytes.
    #[serde(default)]
    pub file_size: Option<u64>,

    /// Game the file belongs to.
    #[serde(default)]
    pub game_id: Option<String>,
}

impl LookupDetails {
    /// Details for a file on disk whose hash is not known yet.
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Details for a file with a known hash.
    pub fn for_hash(hash: impl Into<String>) -> Self {
        Self {
            file_hash: Some(hash.into()),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.file_size = Some(size);
        self
    }

    pub fn with_game(mut self, game_id: impl Into<String>) -> Self {
        self.game_id = Some(game_id.into());
        self
    }

    /// Cache key for these details.
    pub fn fingerprint(&self) -> LookupFingerprint {
        LookupFingerprint::new(
            self.file_hash.as_deref(),
            self.file_path.as_deref(),
            self.file_size,
            self.game_id.as_deref(),
        )
    }
}

/// Cache key of a metadata lookup.
///
/// Combines the content hash, the file name without extension, the file
/// size and the game id. Missing parts are left empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LookupFingerprint(String);

impl LookupFingerprint {
    pub fn new(
        hash: Option<&str>,
        path: Option<&Path>,
        size: Option<u64>,
        game_id: Option<&str>,
    ) -> Self {
        let stem = path
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let size = size.map(|s| s.to_string()).unwrap_or_default();

        Self(format!(
            "{}_{}_{}_{}",
            hash.unwrap_or_default(),
            stem,
            size,
            game_id.unwrap_or_default()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LookupFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Descriptive details of a mod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModDetails {
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
}

/// Metadata of one mod file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModInfo {
    /// File name, including extension.
    pub file_name: String,

    pub file_size_bytes: u64,

    pub game_id: String,

    /// Content hash of the file.
    pub file_hash: String,

    #[serde(default)]
    pub file_version: String,

    #[serde(default)]
    pub logical_file_name: Option<String>,

    /// Where the file came from, e.g. the name of a mod site.
    #[serde(default)]
    pub source: Option<String>,

    #[serde(default)]
    pub source_uri: Option<String>,

    #[serde(default)]
    pub details: ModDetails,
}

impl ModInfo {
    /// Lookup details that identify this file.
    pub fn lookup_details(&self) -> LookupDetails {
        LookupDetails {
            file_path: Some(PathBuf::from(&self.file_name)),
            file_hash: Some(self.file_hash.clone()),
            file_size: Some(self.file_size_bytes),
            game_id: Some(self.game_id.clone()),
        }
    }
}

/// A single lookup hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResult {
    /// Key the result is stored under.
    pub key: String,
    pub value: ModInfo,
}

/// Reference to a mod by content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModReference {
    pub file_hash: String,
}
