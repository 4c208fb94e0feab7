//! Mod metadata lookup with a per-fingerprint result cache.
//!
//! [`MetaLookupCache`] fronts a backing [`MetaStore`]. The store is opened
//! lazily for the active [`MetaDbTag`] (game id and API key) and reopened
//! when the tag changes. Opening is single-flight: callers arriving while
//! the store is being opened or closed wait for that to finish.
//!
//! ```text
//!   Uninitialized ──open──▶ Constructing ──ok──▶ Ready(tag, store)
//!     ▲     ▲                   │                    │ tag changed
//!     │     └────── failed ─────┘                    ▼
//!     └─────────────── closed ─────────────────── Closing
//! ```

pub mod remote;
pub mod store;

pub use remote::{RemoteServer, RemoteSource};
pub use store::{SqliteMetaStore, SqliteStoreFactory};

use async_trait::async_trait;
use md5::{Digest, Md5};
use modhost_extension_api::{
    HostEvent, LookupDetails, LookupFingerprint, LookupResult, MetaLookup, ModInfo, ModReference,
};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info, warn};

/// Errors from the metadata database.
#[derive(Error, Debug)]
pub enum MetaDbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Server {server} answered with status {status}")]
    Status { server: String, status: u16 },

    #[error("Failed to hash {path}: {reason}")]
    Hash { path: PathBuf, reason: String },

    #[error("Metadata store was closed")]
    Closed,
}

pub type MetaDbResult<T> = Result<T, MetaDbError>;

/// Identifies which backing store is wanted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MetaDbTag {
    pub game_id: String,
    pub api_key: String,
}

impl MetaDbTag {
    pub fn new(game_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            game_id: game_id.into(),
            api_key: api_key.into(),
        }
    }
}

// ============================================================================
// Backing store
// ============================================================================

/// Query against the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreQuery {
    pub file_path: Option<PathBuf>,
    pub file_hash: String,
    pub file_size: Option<u64>,
    pub game_id: Option<String>,
}

/// A metadata database.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Metadata of the file described by `query`.
    async fn lookup(&self, query: &StoreQuery) -> MetaDbResult<Vec<LookupResult>>;

    /// Metadata stored under `key`.
    async fn get_by_key(&self, key: &str) -> MetaDbResult<Vec<LookupResult>>;

    /// Store metadata, replacing what is stored for the same file.
    async fn insert(&self, info: &ModInfo) -> MetaDbResult<()>;

    /// Release the store. Further calls fail with [`MetaDbError::Closed`].
    async fn close(&self) -> MetaDbResult<()>;
}

/// Opens backing stores.
#[async_trait]
pub trait MetaStoreFactory: Send + Sync {
    async fn open(&self, tag: &MetaDbTag) -> MetaDbResult<Arc<dyn MetaStore>>;
}

// ============================================================================
// Hashing
// ============================================================================

/// MD5 and size of a file. Metadata servers key files by MD5.
pub async fn hash_file(path: &Path) -> MetaDbResult<(String, u64)> {
    let owned = path.to_path_buf();
    let hashed = tokio::task::spawn_blocking(move || -> std::io::Result<(String, u64)> {
        let mut file = std::fs::File::open(&owned)?;
        let mut hasher = Md5::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            size += read as u64;
        }
        Ok((format!("{:x}", hasher.finalize()), size))
    })
    .await
    .map_err(|e| MetaDbError::Hash {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    Ok(hashed?)
}

// ============================================================================
// MetaLookupCache
// ============================================================================

enum StoreState {
    Uninitialized,
    Constructing,
    Ready {
        tag: MetaDbTag,
        store: Arc<dyn MetaStore>,
    },
    Closing,
}

enum Step {
    Wait,
    Open,
    Reopen(Arc<dyn MetaStore>, MetaDbTag),
}

#[derive(Default)]
struct ResultCache {
    entries: HashMap<LookupFingerprint, Vec<LookupResult>>,
    /// Bumped by every save so lookups started before it don't store
    /// their results.
    generation: u64,
}

/// Store state, shared with detached close tasks.
struct Shared {
    state: Mutex<StoreState>,
    state_changed: Notify,
}

/// Caching front of the metadata database.
pub struct MetaLookupCache {
    factory: Arc<dyn MetaStoreFactory>,
    tag: watch::Receiver<MetaDbTag>,
    shared: Arc<Shared>,
    results: Mutex<ResultCache>,
    events: Option<broadcast::Sender<HostEvent>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Puts the state back to `Uninitialized` unless finished with a store.
struct ConstructionGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl<'a> ConstructionGuard<'a> {
    fn new(shared: &'a Shared) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    fn finish(mut self, tag: MetaDbTag, store: Arc<dyn MetaStore>) {
        *lock(&self.shared.state) = StoreState::Ready { tag, store };
        self.armed = false;
        self.shared.state_changed.notify_waiters();
    }
}

impl Drop for ConstructionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *lock(&self.shared.state) = StoreState::Uninitialized;
            self.shared.state_changed.notify_waiters();
        }
    }
}

impl MetaLookupCache {
    /// Create a cache opening stores with `factory` for the tag published
    /// on `tag`.
    pub fn new(factory: Arc<dyn MetaStoreFactory>, tag: watch::Receiver<MetaDbTag>) -> Self {
        Self {
            factory,
            tag,
            shared: Arc::new(Shared {
                state: Mutex::new(StoreState::Uninitialized),
                state_changed: Notify::new(),
            }),
            results: Mutex::new(ResultCache::default()),
            events: None,
        }
    }

    /// Publish `FileHashCalculated` events on `events`.
    pub fn with_events(mut self, events: broadcast::Sender<HostEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// The store for the active tag, opening it if needed.
    async fn store(&self) -> MetaDbResult<Arc<dyn MetaStore>> {
        loop {
            let changed = self.shared.state_changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let wanted = self.tag.borrow().clone();
            let step = {
                let mut state = lock(&self.shared.state);
                match std::mem::replace(&mut *state, StoreState::Constructing) {
                    StoreState::Ready { tag, store } if tag == wanted => {
                        *state = StoreState::Ready {
                            tag,
                            store: Arc::clone(&store),
                        };
                        return Ok(store);
                    }
                    StoreState::Ready { tag, store } => {
                        *state = StoreState::Closing;
                        Step::Reopen(store, tag)
                    }
                    StoreState::Uninitialized => Step::Open,
                    busy @ (StoreState::Constructing | StoreState::Closing) => {
                        *state = busy;
                        Step::Wait
                    }
                }
            };

            let guard = match step {
                Step::Wait => {
                    changed.await;
                    continue;
                }
                Step::Open => ConstructionGuard::new(&self.shared),
                Step::Reopen(old, old_tag) => {
                    info!(
                        from = %old_tag.game_id,
                        to = %wanted.game_id,
                        "Metadata tag changed, reopening store"
                    );
                    // The close finishes even if this caller goes away; the
                    // state stays `Closing` until it has.
                    let shared = Arc::clone(&self.shared);
                    let closing = tokio::spawn(async move {
                        let _reset = ConstructionGuard::new(&shared);
                        if let Err(e) = old.close().await {
                            warn!("Failed to close metadata store: {}", e);
                        }
                    });
                    if let Err(e) = closing.await {
                        warn!("Metadata store close task failed: {}", e);
                    }
                    continue;
                }
            };

            debug!(game = %wanted.game_id, "Opening metadata store");
            let store = self.factory.open(&wanted).await?;
            guard.finish(wanted, Arc::clone(&store));
            return Ok(store);
        }
    }

    /// Look up metadata for a file.
    pub async fn lookup(&self, details: &LookupDetails) -> MetaDbResult<Vec<LookupResult>> {
        let fingerprint = details.fingerprint();
        let generation = {
            let results = lock(&self.results);
            if let Some(hit) = results.entries.get(&fingerprint) {
                debug!(fingerprint = %fingerprint, "Metadata cache hit");
                return Ok(hit.clone());
            }
            results.generation
        };

        let (file_hash, file_size) = match (&details.file_hash, &details.file_path) {
            (Some(hash), _) => (hash.clone(), details.file_size),
            (None, Some(path)) => {
                let (hash, size) = hash_file(path).await?;
                debug!(path = %path.display(), hash = %hash, "Hashed file for lookup");
                self.emit(HostEvent::FileHashCalculated {
                    path: path.clone(),
                    hash: hash.clone(),
                    size,
                });
                (hash, Some(size))
            }
            (None, None) => return Ok(Vec::new()),
        };

        let query = StoreQuery {
            file_path: details.file_path.clone(),
            file_hash,
            file_size,
            game_id: details.game_id.clone(),
        };
        let found = self.store().await?.lookup(&query).await?;

        let mut results = lock(&self.results);
        if results.generation == generation {
            results.entries.insert(fingerprint, found.clone());
        }
        Ok(found)
    }

    /// Look up metadata by reference.
    pub async fn lookup_reference(&self, reference: &ModReference) -> MetaDbResult<Vec<LookupResult>> {
        self.store().await?.get_by_key(&reference.file_hash).await
    }

    /// Store metadata, dropping the cached lookup for the same file.
    pub async fn save(&self, info: &ModInfo) -> MetaDbResult<()> {
        let fingerprint = info.lookup_details().fingerprint();
        {
            let mut results = lock(&self.results);
            results.entries.remove(&fingerprint);
            results.generation += 1;
        }
        self.store().await?.insert(info).await
    }

    /// Close the store if one is open.
    pub async fn close(&self) -> MetaDbResult<()> {
        let open = {
            let mut state = lock(&self.shared.state);
            match std::mem::replace(&mut *state, StoreState::Uninitialized) {
                StoreState::Ready { store, .. } => Some(store),
                other => {
                    *state = other;
                    None
                }
            }
        };
        self.shared.state_changed.notify_waiters();

        match open {
            Some(store) => store.close().await,
            None => Ok(()),
        }
    }

    fn emit(&self, event: HostEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                debug!("Host event dropped, no subscribers");
            }
        }
    }
}

#[async_trait]
impl MetaLookup for MetaLookupCache {
    async fn lookup_mod_meta(&self, details: &LookupDetails) -> anyhow::Result<Vec<LookupResult>> {
        Ok(self.lookup(details).await?)
    }

    async fn save_mod_meta(&self, info: &ModInfo) -> anyhow::Result<()> {
        Ok(self.save(info).await?)
    }

    async fn lookup_mod_reference(
        &self,
        reference: &ModReference,
    ) -> anyhow::Result<Vec<LookupResult>> {
        Ok(self.lookup_reference(reference).await?)
    }
}
