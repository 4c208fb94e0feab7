//! Remote metadata servers.
//!
//! Queried by the SQLite store when a file is not known locally. A server
//! that fails is logged and skipped; the next one is tried.

use super::{MetaDbError, MetaDbResult, StoreQuery};
use crate::config::{ServerConfig, SUPPORTED_PROTOCOLS};
use modhost_extension_api::{ModDetails, ModInfo};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

/// A configured server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteServer {
    pub protocol: String,
    pub base_url: String,
    pub api_key: String,
    pub cache_duration_sec: u64,
}

impl From<&ServerConfig> for RemoteServer {
    fn from(config: &ServerConfig) -> Self {
        Self {
            protocol: config.protocol.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            cache_duration_sec: config.cache_duration_sec,
        }
    }
}

/// Metadata fetched from a server, valid for `cache_duration_sec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHit {
    pub info: ModInfo,
    pub cache_duration_sec: u64,
}

/// Client for the configured servers.
#[derive(Debug, Clone)]
pub struct RemoteSource {
    client: Client,
    servers: Vec<RemoteServer>,
}

impl RemoteSource {
    pub fn new(servers: Vec<RemoteServer>) -> Self {
        Self {
            client: Client::new(),
            servers,
        }
    }

    /// Use `api_key` for the first server, the one the active tag's key
    /// belongs to. The other servers keep their configured keys.
    pub fn with_api_key(mut self, api_key: &str) -> Self {
        if let Some(primary) = self.servers.first_mut() {
            primary.api_key = api_key.to_string();
        }
        self
    }

    pub fn servers(&self) -> &[RemoteServer] {
        &self.servers
    }

    /// Ask the servers, in order, until one knows the file.
    pub async fn fetch(&self, query: &StoreQuery, game_id: &str) -> Vec<RemoteHit> {
        for server in &self.servers {
            if !SUPPORTED_PROTOCOLS.contains(&server.protocol.as_str()) {
                warn!(protocol = %server.protocol, "Unsupported metadata server protocol, skipping");
                continue;
            }

            match self.fetch_nexus(server, query, game_id).await {
                Ok(found) if !found.is_empty() => {
                    return found
                        .into_iter()
                        .map(|info| RemoteHit {
                            info,
                            cache_duration_sec: server.cache_duration_sec,
                        })
                        .collect();
                }
                Ok(_) => debug!(server = %server.base_url, hash = %query.file_hash, "Not known to server"),
                Err(e) => warn!(server = %server.base_url, "Metadata server query failed: {}", e),
            }
        }
        Vec::new()
    }

    async fn fetch_nexus(
        &self,
        server: &RemoteServer,
        query: &StoreQuery,
        game_id: &str,
    ) -> MetaDbResult<Vec<ModInfo>> {
        let url = search_url(server, game_id, &query.file_hash);
        debug!(url = %url, "Querying metadata server");

        let response = self
            .client
            .get(&url)
            .header("apikey", &server.api_key)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(MetaDbError::Status {
                server: server.base_url.clone(),
                status: response.status().as_u16(),
            });
        }

        let body = response.text().await?;
        parse_nexus_search(&body, &query.file_hash, game_id)
    }
}

fn search_url(server: &RemoteServer, game_id: &str, md5: &str) -> String {
    format!("{}/games/{}/mods/md5_search/{}.json", server.base_url, game_id, md5)
}

// ============================================================================
// Nexus response format
// ============================================================================

#[derive(Debug, Deserialize)]
struct NexusSearchHit {
    #[serde(rename = "mod")]
    mod_entry: NexusMod,
    file_details: NexusFile,
}

#[derive(Debug, Deserialize)]
struct NexusMod {
    mod_id: u64,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    category_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct NexusFile {
    file_id: u64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    file_name: String,
    #[serde(default)]
    size_in_bytes: Option<u64>,
    #[serde(default)]
    size_kb: Option<u64>,
}

fn parse_nexus_search(body: &str, file_hash: &str, game_id: &str) -> MetaDbResult<Vec<ModInfo>> {
    let hits: Vec<NexusSearchHit> = serde_json::from_str(body)?;

    Ok(hits
        .into_iter()
        .map(|hit| {
            let mod_id = hit.mod_entry.mod_id;
            let file = hit.file_details;
            ModInfo {
                file_name: file.file_name,
                file_size_bytes: file
                    .size_in_bytes
                    .or(file.size_kb.map(|kb| kb * 1024))
                    .unwrap_or_default(),
                game_id: game_id.to_string(),
                file_hash: file_hash.to_string(),
                file_version: file.version.unwrap_or_default(),
                logical_file_name: file.name,
                source: Some("nexus".to_string()),
                source_uri: Some(format!(
                    "nxm://{game_id}/mods/{mod_id}/files/{}",
                    file.file_id
                )),
                details: ModDetails {
                    homepage: Some(format!("https://www.nexusmods.com/{game_id}/mods/{mod_id}")),
                    category: hit.mod_entry.category_id.map(|id| id.to_string()),
                    description: hit.mod_entry.summary,
                    author: hit.mod_entry.author,
                },
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH_RESPONSE: &str = r#"[
      {
        "mod": { "mod_id": 266, "summary": "Better skies", "author": "Someone", "category_id": 7 },
        "file_details": {
          "file_id": 1000,
          "name": "Better Skies Main",
          "version": "2.1",
          "file_name": "Better Skies-266-2-1.zip",
          "size_kb": 2
        }
      }
    ]"#;

    #[test]
    fn test_parse_search_response() {
        let found = parse_nexus_search(SEARCH_RESPONSE, "abc", "skyrim").unwrap();
        assert_eq!(found.len(), 1);

        let info = &found[0];
        assert_eq!(info.file_name, "Better Skies-266-2-1.zip");
        assert_eq!(info.file_size_bytes, 2048);
        assert_eq!(info.file_hash, "abc");
        assert_eq!(info.file_version, "2.1");
        assert_eq!(info.logical_file_name.as_deref(), Some("Better Skies Main"));
        assert_eq!(info.source_uri.as_deref(), Some("nxm://skyrim/mods/266/files/1000"));
        assert_eq!(info.details.author.as_deref(), Some("Someone"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_nexus_search("{\"error\": true}", "abc", "skyrim").is_err());
    }

    #[tokio::test]
    async fn test_unsupported_protocol_is_skipped() {
        let source = RemoteSource::new(vec![RemoteServer {
            protocol: "metaserver".to_string(),
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: String::new(),
            cache_duration_sec: 60,
        }]);
        let query = StoreQuery {
            file_path: None,
            file_hash: "abc".to_string(),
            file_size: None,
            game_id: Some("skyrim".to_string()),
        };

        assert!(source.fetch(&query, "skyrim").await.is_empty());
    }

    #[test]
    fn test_api_key_replaces_primary_server_key_only() {
        let primary = ServerConfig {
            api_key: "configured".to_string(),
            ..ServerConfig::default()
        };
        let mirror = ServerConfig {
            base_url: "https://mirror.example.com/v1".to_string(),
            api_key: "mirror-key".to_string(),
            ..ServerConfig::default()
        };

        let source = RemoteSource::new(vec![(&primary).into(), (&mirror).into()]).with_api_key("k");
        assert_eq!(source.servers()[0].api_key, "k");
        assert_eq!(source.servers()[1].api_key, "mirror-key");
    }

    #[tokio::test]
    async fn test_search_url_uses_file_md5() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("hello.zip");
        std::fs::write(&path, b"hello").unwrap();
        let (hash, _) = super::super::hash_file(&path).await.unwrap();

        let server = RemoteServer::from(&ServerConfig::default());
        assert_eq!(
            search_url(&server, "skyrim", &hash),
            "https://api.nexusmods.com/v1/games/skyrim/mods/md5_search/5d41402abc4b2a76b9719d911017c592.json"
        );
    }
}
