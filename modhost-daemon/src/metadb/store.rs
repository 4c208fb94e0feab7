//! SQLite-backed metadata store
//!
//! Rows are keyed by content hash and game. Metadata saved by the host
//! never expires; metadata fetched from a remote server expires after the
//! server's `cache_duration_sec`.
//!
//! # Database Schema
//!
//! - `mod_meta`: one row per (hash, game), the metadata as JSON
//! - `schema_version`: Migration tracking

use super::remote::{RemoteHit, RemoteSource};
use super::{MetaDbError, MetaDbResult, MetaDbTag, MetaStore, MetaStoreFactory, StoreQuery};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use modhost_extension_api::{LookupResult, ModInfo};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Upper bound on remote expiry, about a hundred years.
const MAX_CACHE_DURATION_SEC: u64 = 100 * 365 * 24 * 60 * 60;

/// Fixed-width timestamps so stored values compare as text.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// SQLite metadata store with an optional remote fallback.
pub struct SqliteMetaStore {
    conn: Mutex<Option<Connection>>,
    remote: Option<RemoteSource>,
    /// Game used for remote queries that don't name one.
    game_id: String,
}

impl SqliteMetaStore {
    /// Open the database at a specific path, creating it if it doesn't
    /// exist.
    pub fn open_at(path: &Path) -> MetaDbResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening metadata database at: {:?}", path);
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> MetaDbResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> MetaDbResult<Self> {
        let store = Self {
            conn: Mutex::new(Some(conn)),
            remote: None,
            game_id: String::new(),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// Ask `remote` when a file is not known locally.
    pub fn with_remote(mut self, remote: RemoteSource) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_game(mut self, game_id: impl Into<String>) -> Self {
        self.game_id = game_id.into();
        self
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> MetaDbResult<T>) -> MetaDbResult<T> {
        let mut guard: MutexGuard<'_, Option<Connection>> =
            self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(MetaDbError::Closed),
        }
    }

    /// Run database migrations to set up the schema.
    fn run_migrations(&self) -> MetaDbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS schema_version (
                    version INTEGER PRIMARY KEY
                )",
                [],
            )?;

            let current_version: i32 = conn
                .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
                    row.get(0)
                })
                .unwrap_or(0);

            debug!("Current metadata schema version: {}", current_version);

            if current_version < 1 {
                migrate_to_v1(conn)?;
            }

            Ok(())
        })
    }

    fn select(&self, query: &StoreQuery, now: DateTime<Utc>) -> MetaDbResult<Vec<LookupResult>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, data FROM mod_meta
                 WHERE key = ?1
                   AND (?2 IS NULL OR game_id = ?2)
                   AND (?3 IS NULL OR file_size = ?3)
                   AND (expires_at IS NULL OR expires_at > ?4)
                 ORDER BY updated_at DESC",
            )?;

            let size = query.file_size.map(|size| size as i64);
            let rows = stmt.query_map(
                params![query.file_hash, query.game_id, size, timestamp(now)],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )?;

            let mut results = Vec::new();
            for row in rows {
                let (key, data) = row?;
                results.push(LookupResult {
                    key,
                    value: serde_json::from_str(&data)?,
                });
            }
            Ok(results)
        })
    }

    fn upsert(&self, info: &ModInfo, expires_at: Option<DateTime<Utc>>) -> MetaDbResult<()> {
        let data = serde_json::to_string(info)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO mod_meta
                    (key, game_id, file_size, file_name, data, expires_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    info.file_hash,
                    info.game_id,
                    info.file_size_bytes as i64,
                    info.file_name,
                    data,
                    expires_at.map(timestamp),
                    timestamp(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    /// Delete rows whose expiry has passed. Returns the number removed.
    pub fn purge_expired(&self) -> MetaDbResult<usize> {
        let now = timestamp(Utc::now());
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM mod_meta WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )?)
        })
    }

    fn store_remote(&self, hits: &[RemoteHit]) -> MetaDbResult<()> {
        for hit in hits {
            let ttl = Duration::seconds(hit.cache_duration_sec.min(MAX_CACHE_DURATION_SEC) as i64);
            self.upsert(&hit.info, Some(Utc::now() + ttl))?;
        }
        Ok(())
    }
}

/// Migration to version 1: Initial schema.
fn migrate_to_v1(conn: &mut Connection) -> MetaDbResult<()> {
    info!("Running metadata migration to schema version 1");

    let tx = conn.transaction()?;

    tx.execute(
        "CREATE TABLE IF NOT EXISTS mod_meta (
            key TEXT NOT NULL,
            game_id TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            file_name TEXT NOT NULL,
            data TEXT NOT NULL,
            expires_at TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (key, game_id)
        )",
        [],
    )?;

    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_mod_meta_expires ON mod_meta(expires_at)",
        [],
    )?;

    tx.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    tx.commit()?;

    info!("Metadata migration to version 1 complete");
    Ok(())
}

#[async_trait]
impl MetaStore for SqliteMetaStore {
    async fn lookup(&self, query: &StoreQuery) -> MetaDbResult<Vec<LookupResult>> {
        let local = self.select(query, Utc::now())?;
        if !local.is_empty() {
            return Ok(local);
        }

        let Some(remote) = &self.remote else {
            return Ok(local);
        };
        let game_id = query.game_id.as_deref().unwrap_or(&self.game_id);
        if game_id.is_empty() {
            debug!(hash = %query.file_hash, "No game to query remote servers for");
            return Ok(local);
        }

        let hits = remote.fetch(query, game_id).await;
        self.store_remote(&hits)?;
        Ok(hits
            .into_iter()
            .map(|hit| LookupResult {
                key: hit.info.file_hash.clone(),
                value: hit.info,
            })
            .collect())
    }

    async fn get_by_key(&self, key: &str) -> MetaDbResult<Vec<LookupResult>> {
        self.select(
            &StoreQuery {
                file_path: None,
                file_hash: key.to_string(),
                file_size: None,
                game_id: None,
            },
            Utc::now(),
        )
    }

    async fn insert(&self, info: &ModInfo) -> MetaDbResult<()> {
        self.upsert(info, None)
    }

    async fn close(&self) -> MetaDbResult<()> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| MetaDbError::Sqlite(e))?;
            debug!("Metadata database closed");
        }
        Ok(())
    }
}

/// Opens the SQLite store for a tag.
pub struct SqliteStoreFactory {
    path: PathBuf,
    remote: RemoteSource,
}

impl SqliteStoreFactory {
    pub fn new(path: impl Into<PathBuf>, remote: RemoteSource) -> Self {
        Self {
            path: path.into(),
            remote,
        }
    }
}

#[async_trait]
impl MetaStoreFactory for SqliteStoreFactory {
    async fn open(&self, tag: &MetaDbTag) -> MetaDbResult<Arc<dyn MetaStore>> {
        let path = self.path.clone();
        let opened = tokio::task::spawn_blocking(move || {
            let store = SqliteMetaStore::open_at(&path)?;
            let purged = store.purge_expired()?;
            if purged > 0 {
                debug!("Purged {} expired metadata row(s)", purged);
            }
            Ok::<_, MetaDbError>(store)
        })
        .await
        .map_err(|e| MetaDbError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        let store = opened
            .with_game(tag.game_id.clone())
            .with_remote(self.remote.clone().with_api_key(&tag.api_key));
        Ok(Arc::new(store))
    }
}
