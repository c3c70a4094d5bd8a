//! In-memory projection of the keyring for hot-path lookups.
//!
//! Rebuilds run on one background task per cache, so refreshes for the same
//! peer apply in submission order and the later one wins. Readers take an
//! `Arc` snapshot of all indexes, which are swapped together.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use rg_crypto::ids::normalize_peer_id;
use rg_crypto::keys::{EncryptionPublicKey, VerifyKey};

use crate::keyring::{recipient_keys, KeyringStore};
use crate::store::{KeyringEntry, SignatureState, TrustState};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("keyring cache task has stopped")]
    Closed,
}

#[derive(Clone, Debug, Default)]
struct Indexes {
    recipients: HashMap<String, Vec<EncryptionPublicKey>>,
    /// (peer, signing kid) -> verification key
    signing: HashMap<(String, String), VerifyKey>,
    signing_kids: HashMap<String, HashSet<String>>,
    /// signing kid -> peers that presented it
    peers_by_kid: HashMap<String, HashSet<String>>,
    /// (peer, signing kid, encryption kid) -> trust
    trust: HashMap<(String, String, String), TrustState>,
}

impl Indexes {
    fn replace_peer(&mut self, peer: &str, rows: &[KeyringEntry]) {
        self.recipients
            .insert(peer.to_string(), recipient_keys(rows.iter()));

        self.signing.retain(|(p, _), _| p != peer);
        self.trust.retain(|(p, _, _), _| p != peer);

        let mut kids = HashSet::new();
        for row in rows {
            kids.insert(row.signing_kid.clone());
            self.trust.insert(
                (
                    peer.to_string(),
                    row.signing_kid.clone(),
                    row.encryption_kid.clone(),
                ),
                row.trust_state,
            );
            if row.signature_state != SignatureState::Valid
                || row.trust_state == TrustState::Revoked
            {
                continue;
            }
            let slot = (peer.to_string(), row.signing_kid.clone());
            if self.signing.contains_key(&slot) {
                // rows arrive newest first
                continue;
            }
            match VerifyKey::from_base64(&row.signing_keyset) {
                Ok(key) => {
                    self.signing.insert(slot, key);
                }
                Err(e) => warn!(key = %row.key, error = %e, "stored signing keyset unreadable"),
            }
        }

        if let Some(old) = self.signing_kids.insert(peer.to_string(), kids.clone()) {
            for kid in old {
                if let Some(peers) = self.peers_by_kid.get_mut(&kid) {
                    peers.remove(peer);
                    if peers.is_empty() {
                        self.peers_by_kid.remove(&kid);
                    }
                }
            }
        }
        for kid in kids {
            self.peers_by_kid
                .entry(kid)
                .or_default()
                .insert(peer.to_string());
        }
    }
}

enum Command {
    Refresh {
        peers: Vec<String>,
        done: Option<oneshot::Sender<()>>,
    },
    Clear {
        done: Option<oneshot::Sender<()>>,
    },
}

type Snapshot = Arc<RwLock<Arc<Indexes>>>;

/// Eventually consistent keyring view.
///
/// Must be created inside a Tokio runtime.
pub struct KeyringCache {
    tx: mpsc::UnboundedSender<Command>,
    snapshot: Snapshot,
}

impl KeyringCache {
    pub fn new(store: Arc<KeyringStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let snapshot: Snapshot = Arc::new(RwLock::new(Arc::new(Indexes::default())));
        tokio::spawn(run(store, rx, Arc::clone(&snapshot)));
        Self { tx, snapshot }
    }

    /// Queue a rebuild of the given peers and return immediately.
    pub fn refresh_for_peers(&self, peer_ids: &[String]) {
        if peer_ids.is_empty() {
            return;
        }
        let cmd = Command::Refresh {
            peers: peer_ids.to_vec(),
            done: None,
        };
        if self.tx.send(cmd).is_err() {
            warn!("keyring cache task has stopped; refresh dropped");
        }
    }

    /// Queue a rebuild and wait until it has been applied.
    pub async fn refresh_for_peers_and_wait(&self, peer_ids: &[String]) -> Result<(), CacheError> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Command::Refresh {
                peers: peer_ids.to_vec(),
                done: Some(done),
            })
            .map_err(|_| CacheError::Closed)?;
        wait.await.map_err(|_| CacheError::Closed)
    }

    /// Drop every index. Applied in order with pending refreshes.
    pub fn clear_all(&self) {
        if self.tx.send(Command::Clear { done: None }).is_err() {
            warn!("keyring cache task has stopped; clear dropped");
        }
    }

    pub async fn clear_all_and_wait(&self) -> Result<(), CacheError> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Command::Clear { done: Some(done) })
            .map_err(|_| CacheError::Closed)?;
        wait.await.map_err(|_| CacheError::Closed)
    }

    fn current(&self) -> Arc<Indexes> {
        let guard = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn recipients_for_peer(&self, peer_id: &str) -> Vec<EncryptionPublicKey> {
        let Ok(peer) = normalize_peer_id(peer_id) else {
            return Vec::new();
        };
        self.current()
            .recipients
            .get(&peer)
            .cloned()
            .unwrap_or_default()
    }

    pub fn recipients_for_peers(&self, peer_ids: &[String]) -> Vec<EncryptionPublicKey> {
        let idx = self.current();
        peer_ids
            .iter()
            .filter_map(|p| normalize_peer_id(p).ok())
            .filter_map(|p| idx.recipients.get(&p))
            .flatten()
            .cloned()
            .collect()
    }

    pub fn signing_key_for(&self, peer_id: &str, signing_kid: &str) -> Option<VerifyKey> {
        let peer = normalize_peer_id(peer_id).ok()?;
        self.current()
            .signing
            .get(&(peer, signing_kid.to_string()))
            .cloned()
    }

    pub fn has_any_signing_keys(&self, peer_id: &str) -> bool {
        let Ok(peer) = normalize_peer_id(peer_id) else {
            return false;
        };
        self.current()
            .signing_kids
            .get(&peer)
            .is_some_and(|kids| !kids.is_empty())
    }

    pub fn has_signing_kid(&self, peer_id: &str, signing_kid: &str) -> bool {
        let Ok(peer) = normalize_peer_id(peer_id) else {
            return false;
        };
        self.current()
            .signing_kids
            .get(&peer)
            .is_some_and(|kids| kids.contains(signing_kid))
    }

    /// Trust of one key pair, UNKNOWN when never seen.
    pub fn trust_state_for(&self, peer_id: &str, signing_kid: &str, encryption_kid: &str) -> TrustState {
        let Ok(peer) = normalize_peer_id(peer_id) else {
            return TrustState::Unknown;
        };
        self.current()
            .trust
            .get(&(peer, signing_kid.to_string(), encryption_kid.to_string()))
            .copied()
            .unwrap_or(TrustState::Unknown)
    }

    /// True when `signing_kid` is also held by a peer other than `peer_id`.
    /// Without a peer, any holder counts.
    pub fn is_signing_kid_reused_by_other_peer(&self, peer_id: Option<&str>, signing_kid: &str) -> bool {
        let idx = self.current();
        let Some(peers) = idx.peers_by_kid.get(signing_kid) else {
            return false;
        };
        match peer_id.and_then(|p| normalize_peer_id(p).ok()) {
            Some(peer) => peers.len() > 1 || !peers.contains(&peer),
            None => !peers.is_empty(),
        }
    }
}

async fn run(store: Arc<KeyringStore>, mut rx: mpsc::UnboundedReceiver<Command>, snapshot: Snapshot) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Refresh { peers, done } => {
                let mut next = {
                    let guard = snapshot.read().unwrap_or_else(|e| e.into_inner());
                    Indexes::clone(&guard)
                };
                for raw in &peers {
                    let Ok(peer) = normalize_peer_id(raw) else {
                        continue;
                    };
                    match store.get_by_peer(&peer).await {
                        Ok(rows) => next.replace_peer(&peer, &rows),
                        Err(e) => warn!(peer = %peer, error = %e, "keyring cache refresh failed"),
                    }
                }
                *snapshot.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
                debug!(peers = peers.len(), "keyring cache refreshed");
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Command::Clear { done } => {
                *snapshot.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(Indexes::default());
                debug!("keyring cache cleared");
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
        }
    }
}
