//! Replay detection for received envelopes.
//!
//! Each account keeps a bounded LRU map from `scope|fingerprint` to the
//! last message id that carried it. The same envelope showing up under a
//! different message id is a replay.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use rg_crypto::encoding::b64_encode;
use rg_crypto::envelope::Envelope;

use crate::store::StoreError;

pub const DEFAULT_REPLAY_CAPACITY: usize = 256;

/// Default fingerprint for an envelope: its ciphertext hash.
pub fn envelope_fingerprint(env: &Envelope) -> String {
    b64_encode(&env.ciphertext_sha256)
}

// ============================================================================
// Persistence
// ============================================================================

/// One persisted record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub k: String,
    pub v: i64,
}

/// Backing storage for replay caches. Records are ordered least to most
/// recently used.
#[async_trait]
pub trait ReplayPersistence: Send + Sync {
    async fn load(&self, account: &str) -> Result<Vec<ReplayRecord>, StoreError>;

    async fn save(&self, account: &str, records: &[ReplayRecord]) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryReplayPersistence {
    accounts: RwLock<HashMap<String, Vec<ReplayRecord>>>,
}

impl InMemoryReplayPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReplayPersistence for InMemoryReplayPersistence {
    async fn load(&self, account: &str) -> Result<Vec<ReplayRecord>, StoreError> {
        Ok(self
            .accounts
            .read()
            .await
            .get(account)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, account: &str, records: &[ReplayRecord]) -> Result<(), StoreError> {
        self.accounts
            .write()
            .await
            .insert(account.to_string(), records.to_vec());
        Ok(())
    }
}

/// JSON array of `{k, v}` per account in `<dir>/replay-<account>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileReplayPersistence {
    dir: PathBuf,
}

impl JsonFileReplayPersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, account: &str) -> Result<PathBuf, StoreError> {
        let valid = !account.is_empty()
            && account
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::OperationFailed(format!(
                "invalid account name: {:?}",
                account
            )));
        }
        Ok(self.dir.join(format!("replay-{}.json", account)))
    }
}

#[async_trait]
impl ReplayPersistence for JsonFileReplayPersistence {
    async fn load(&self, account: &str) -> Result<Vec<ReplayRecord>, StoreError> {
        let path = self.path_for(account)?;
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::OperationFailed(e.to_string())),
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&text).map_err(|e| StoreError::DataCorruption(e.to_string()))
    }

    async fn save(&self, account: &str, records: &[ReplayRecord]) -> Result<(), StoreError> {
        let path = self.path_for(account)?;
        let json =
            serde_json::to_vec(records).map_err(|e| StoreError::Serialization(e.to_string()))?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::OperationFailed(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::OperationFailed(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::OperationFailed(e.to_string()))
    }
}

// ============================================================================
// Cache
// ============================================================================

pub struct ReplayCache {
    capacity: NonZeroUsize,
    persistence: Arc<dyn ReplayPersistence>,
    accounts: Mutex<HashMap<String, LruCache<String, i64>>>,
}

impl ReplayCache {
    /// A zero capacity falls back to [`DEFAULT_REPLAY_CAPACITY`].
    pub fn new(capacity: usize, persistence: Arc<dyn ReplayPersistence>) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or_else(|| NonZeroUsize::new(DEFAULT_REPLAY_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            capacity,
            persistence,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory(capacity: usize) -> Self {
        Self::new(capacity, Arc::new(InMemoryReplayPersistence::new()))
    }

    /// Record `message_id` for `(scope, fingerprint)` and report whether it
    /// is a replay.
    ///
    /// First sighting and a repeat under the same id are not replays. A
    /// different id is, and becomes the remembered id. Persistence failures
    /// are logged; the in-memory answer stands.
    pub async fn mark_seen(
        &self,
        account: &str,
        scope: &str,
        fingerprint: &str,
        message_id: i64,
    ) -> bool {
        let key = format!("{}|{}", scope, fingerprint);
        let mut accounts = self.accounts.lock().await;
        if !accounts.contains_key(account) {
            let cache = self.load_account(account).await;
            accounts.insert(account.to_string(), cache);
        }
        let Some(cache) = accounts.get_mut(account) else {
            return false;
        };

        let (replay, changed) = match cache.get(&key).copied() {
            None => {
                cache.put(key, message_id);
                (false, true)
            }
            Some(seen) if seen == message_id => (false, false),
            Some(seen) => {
                warn!(scope, seen, message_id, "replayed envelope detected");
                cache.put(key, message_id);
                (true, true)
            }
        };

        if changed {
            let records = snapshot(cache);
            if let Err(e) = self.persistence.save(account, &records).await {
                warn!(account, error = %e, "failed to persist replay cache");
            }
        }
        replay
    }

    /// Number of remembered entries for a loaded account.
    pub async fn len(&self, account: &str) -> usize {
        self.accounts
            .lock()
            .await
            .get(account)
            .map_or(0, |c| c.len())
    }

    async fn load_account(&self, account: &str) -> LruCache<String, i64> {
        let mut cache = LruCache::new(self.capacity);
        match self.persistence.load(account).await {
            Ok(records) => {
                for r in records {
                    cache.put(r.k, r.v);
                }
                debug!(account, entries = cache.len(), "replay cache loaded");
            }
            Err(e) => warn!(account, error = %e, "replay cache unreadable; starting empty"),
        }
        cache
    }
}

/// Least recently used first.
fn snapshot(cache: &LruCache<String, i64>) -> Vec<ReplayRecord> {
    let mut records: Vec<ReplayRecord> = cache
        .iter()
        .map(|(k, v)| ReplayRecord { k: k.clone(), v: *v })
        .collect();
    records.reverse();
    records
}
