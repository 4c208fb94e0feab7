//! Configuration file loading and management
//!
//! This module handles loading and parsing the daemon configuration from
//! `$XDG_CONFIG_HOME/modhost/config.toml`. If the configuration file doesn't
//! exist, a default configuration is created with documented comments.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Protocols the metadata store knows how to query.
pub const SUPPORTED_PROTOCOLS: &[&str] = &["nexus"];

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Daemon-specific configuration
    pub daemon: DaemonConfig,
    /// Extension locations and state
    #[serde(default)]
    pub extensions: ExtensionsConfig,
    /// Mod metadata database
    #[serde(default)]
    pub metadb: MetaDbConfig,
    /// Active session
    #[serde(default)]
    pub session: SessionConfig,
    /// Executable launching
    #[serde(default)]
    pub runner: RunnerConfig,
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// Log level (trace, debug, info, warn, error)
    /// Default: "info"
    pub log_level: String,
    /// Directory for daemon data
    /// If None, uses XDG_DATA_HOME/modhost
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

/// Extension locations
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtensionsConfig {
    /// User-installed extensions. Searched first.
    /// If None, uses <data_dir>/plugins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_dir: Option<PathBuf>,
    /// Extensions shipped with the host.
    /// If None, uses <data_dir>/bundled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundled_dir: Option<PathBuf>,
    /// Persisted enable/disable state.
    /// If None, uses <data_dir>/extensions.json
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
    /// Directory scanned for `__disable_<name>` markers.
    /// If None, uses the user extension directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_marker_dir: Option<PathBuf>,
}

/// Mod metadata database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetaDbConfig {
    /// Path to the metadata database (SQLite)
    /// If None, uses <data_dir>/metadb.db
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Remote metadata servers, queried in order on a local miss
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// A remote metadata server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Server protocol. Only "nexus" is supported.
    pub protocol: String,
    /// Base URL of the server API
    pub base_url: String,
    /// API key sent in the `apikey` header
    #[serde(default)]
    pub api_key: String,
    /// How long fetched metadata stays valid, in seconds
    /// Default: 86400
    #[serde(default = "default_cache_duration")]
    pub cache_duration_sec: u64,
}

fn default_cache_duration() -> u64 {
    86400
}

/// Active session
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Game being managed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
}

/// Executable launching configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerConfig {
    /// Command prefix used to retry a launch with elevated privileges.
    /// Empty disables elevation.
    /// Default: ["pkexec"]
    #[serde(default = "default_elevation_command")]
    pub elevation_command: Vec<String>,
    /// Deploy automatically instead of asking before launching tools
    /// Default: false
    #[serde(default)]
    pub auto_deploy: bool,
}

fn default_elevation_command() -> Vec<String> {
    vec!["pkexec".to_string()]
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_dir: None,
        }
    }
}

impl Default for MetaDbConfig {
    fn default() -> Self {
        Self {
            path: None,
            servers: vec![ServerConfig::default()],
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: "nexus".to_string(),
            base_url: "https://api.nexusmods.com/v1".to_string(),
            api_key: String::new(),
            cache_duration_sec: default_cache_duration(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            elevation_command: default_elevation_command(),
            auto_deploy: false,
        }
    }
}

impl Config {
    /// Load configuration from the specified path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default XDG config location
    ///
    /// If the configuration file doesn't exist, creates a default configuration
    /// file with documented comments.
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_file(&config_path)?;
        }

        Self::load(&config_path)
    }

    /// Get the default configuration file path
    ///
    /// Returns `$XDG_CONFIG_HOME/modhost/config.toml`
    pub fn default_config_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join("config.toml"))
    }

    /// Create a default configuration file with documented comments
    fn create_default_file(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, Self::default_config_content())
            .with_context(|| format!("Failed to write default config file: {}", path.display()))?;

        tracing::info!("Created default configuration file at: {}", path.display());
        Ok(())
    }

    /// Generate the default configuration file content with comments
    fn default_config_content() -> String {
        r#"# modhost Daemon Configuration

[daemon]
# Log level: trace, debug, info, warn, error
# RUST_LOG overrides this when set.
# Default: "info"
log_level = "info"

# Directory for daemon data (extension state, metadata database)
# If not specified, defaults to $XDG_DATA_HOME/modhost
# data_dir = "/path/to/data"

[extensions]
# User-installed extensions. A user extension hides a bundled one of the
# same name.
# user_dir = "/path/to/plugins"

# Extensions shipped with the host
# bundled_dir = "/path/to/bundled"

# Persisted enable/disable state
# state_file = "/path/to/extensions.json"

# Directory scanned for __disable_<name> marker files
# disable_marker_dir = "/path/to/plugins"

[metadb]
# Path to the SQLite metadata database
# path = "/path/to/metadb.db"

# Remote servers queried when a file is not known locally
[[metadb.servers]]
protocol = "nexus"
base_url = "https://api.nexusmods.com/v1"
api_key = ""
cache_duration_sec = 86400

[session]
# Game being managed. Metadata lookups are scoped to it.
# game_id = "skyrimse"

[runner]
# Command prefix used to retry a launch that failed with a permission error.
# An empty list disables elevation.
elevation_command = ["pkexec"]

# Deploy automatically before launching tools instead of asking
auto_deploy = false
"#
        .to_string()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.daemon.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log_level: {}. Must be one of: {}",
                self.daemon.log_level,
                valid_log_levels.join(", ")
            );
        }

        for server in &self.metadb.servers {
            if !server.base_url.starts_with("http://") && !server.base_url.starts_with("https://")
            {
                anyhow::bail!("Invalid metadb server base_url: {}", server.base_url);
            }
            if server.cache_duration_sec == 0 {
                anyhow::bail!(
                    "metadb server '{}': cache_duration_sec must be greater than 0",
                    server.base_url
                );
            }
        }

        if matches!(&self.session.game_id, Some(id) if id.trim().is_empty()) {
            anyhow::bail!("session.game_id must not be empty");
        }

        Ok(())
    }

    /// Directory for daemon data
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.daemon.data_dir {
            return Ok(dir.clone());
        }
        Ok(project_dirs()?.data_dir().to_path_buf())
    }

    /// Directory of user-installed extensions
    pub fn user_extensions_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.extensions.user_dir {
            return Ok(dir.clone());
        }
        if self.daemon.data_dir.is_none() {
            if let Some(dir) = modhost_runtime::discovery::user_extensions_dir() {
                return Ok(dir);
            }
        }
        Ok(self.data_dir()?.join("plugins"))
    }

    /// Directory of bundled extensions
    pub fn bundled_extensions_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.extensions.bundled_dir {
            return Ok(dir.clone());
        }
        Ok(self.data_dir()?.join("bundled"))
    }

    /// Extension search roots, in priority order
    pub fn search_roots(&self) -> Result<Vec<PathBuf>> {
        Ok(vec![
            self.user_extensions_dir()?,
            self.bundled_extensions_dir()?,
        ])
    }

    /// Path of the persisted extension state
    pub fn state_file(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.extensions.state_file {
            return Ok(path.clone());
        }
        Ok(self.data_dir()?.join("extensions.json"))
    }

    /// Directory scanned for disable markers
    pub fn disable_marker_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.extensions.disable_marker_dir {
            return Ok(dir.clone());
        }
        self.user_extensions_dir()
    }

    /// Path of the metadata database
    pub fn metadb_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.metadb.path {
            return Ok(path.clone());
        }
        Ok(self.data_dir()?.join("metadb.db"))
    }

    /// API key of the first configured server, used to tag the metadata
    /// database.
    pub fn api_key(&self) -> String {
        self.metadb
            .servers
            .first()
            .map(|server| server.api_key.clone())
            .unwrap_or_default()
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "modhost", "modhost").context("Failed to determine project directories")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.daemon.log_level, "info");
        assert!(config.daemon.data_dir.is_none());
        assert_eq!(config.metadb.servers.len(), 1);
        assert_eq!(config.metadb.servers[0].protocol, "nexus");
        assert_eq!(config.metadb.servers[0].cache_duration_sec, 86400);
        assert_eq!(config.runner.elevation_command, vec!["pkexec"]);
        assert!(!config.runner.auto_deploy);
        assert!(config.session.game_id.is_none());
    }

    #[test]
    fn test_default_content_parses_to_default() {
        let config: Config = toml::from_str(&Config::default_config_content()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_valid_config() {
        let config_content = r#"
[daemon]
log_level = "debug"
data_dir = "/var/lib/modhost"

[extensions]
user_dir = "/home/user/plugins"

[[metadb.servers]]
protocol = "nexus"
base_url = "https://api.example.com/v1"
api_key = "secret"

[session]
game_id = "skyrimse"

[runner]
elevation_command = []
auto_deploy = true
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(config_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.api_key(), "secret");
        assert_eq!(config.metadb.servers[0].cache_duration_sec, 86400);
        assert_eq!(config.session.game_id.as_deref(), Some("skyrimse"));
        assert!(config.runner.elevation_command.is_empty());
        assert!(config.runner.auto_deploy);

        assert_eq!(
            config.user_extensions_dir().unwrap(),
            PathBuf::from("/home/user/plugins")
        );
        assert_eq!(
            config.bundled_extensions_dir().unwrap(),
            PathBuf::from("/var/lib/modhost/bundled")
        );
        assert_eq!(
            config.disable_marker_dir().unwrap(),
            PathBuf::from("/home/user/plugins")
        );
        assert_eq!(
            config.metadb_path().unwrap(),
            PathBuf::from("/var/lib/modhost/metadb.db")
        );
    }

    #[test]
    fn test_load_minimal_config() {
        let config_content = r#"
[daemon]
log_level = "info"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(config_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.metadb.servers.len(), 1);
        assert_eq!(config.runner, RunnerConfig::default());
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.daemon.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_server() {
        let mut config = Config::default();
        config.metadb.servers[0].base_url = "ftp://mods".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.metadb.servers[0].cache_duration_sec = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_game_id() {
        let mut config = Config::default();
        config.session.game_id = Some("  ".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_state_file_under_data_dir() {
        let mut config = Config::default();
        config.daemon.data_dir = Some(PathBuf::from("/data"));
        assert_eq!(config.state_file().unwrap(), PathBuf::from("/data/extensions.json"));
        assert_eq!(
            config.search_roots().unwrap(),
            vec![PathBuf::from("/data/plugins"), PathBuf::from("/data/bundled")]
        );
    }

    #[test]
    fn test_full_config_roundtrip() {
        let mut config = Config::default();
        config.daemon.log_level = "debug".to_string();
        config.session.game_id = Some("fallout4".to_string());
        config.runner.auto_deploy = true;

        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config, deserialized);
    }
}
