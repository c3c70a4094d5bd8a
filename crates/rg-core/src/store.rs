//! Keyring persistence: the row model, the repository trait every backend
//! implements, and an in-memory backend.
//!
//! One row exists per (peer, device, signing key id, encryption key id).
//! Trust and signature validity are independent axes on each row.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during keyring store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("trust transition {from} -> {to} not allowed")]
    InvalidTransition { from: TrustState, to: TrustState },
}

// ============================================================================
// Data Models
// ============================================================================

/// User/policy trust decision for one key pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustState {
    Unknown,
    Untrusted,
    Trusted,
    /// Terminal for the key pair it is set on.
    Revoked,
}

impl TrustState {
    pub fn as_i32(self) -> i32 {
        match self {
            TrustState::Unknown => 0,
            TrustState::Untrusted => 1,
            TrustState::Trusted => 2,
            TrustState::Revoked => 3,
        }
    }

    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(TrustState::Unknown),
            1 => Some(TrustState::Untrusted),
            2 => Some(TrustState::Trusted),
            3 => Some(TrustState::Revoked),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrustState::Unknown => "UNKNOWN",
            TrustState::Untrusted => "UNTRUSTED",
            TrustState::Trusted => "TRUSTED",
            TrustState::Revoked => "REVOKED",
        }
    }
}

impl fmt::Display for TrustState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UNKNOWN" => Ok(TrustState::Unknown),
            "UNTRUSTED" => Ok(TrustState::Untrusted),
            "TRUSTED" => Ok(TrustState::Trusted),
            "REVOKED" => Ok(TrustState::Revoked),
            other => Err(format!("unknown trust state: {}", other)),
        }
    }
}

/// Whether the key card a row came from carried a valid self-signature.
/// Fixed at import.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignatureState {
    Unknown,
    Valid,
    Invalid,
}

impl SignatureState {
    pub fn as_i32(self) -> i32 {
        match self {
            SignatureState::Unknown => 0,
            SignatureState::Valid => 1,
            SignatureState::Invalid => 2,
        }
    }

    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(SignatureState::Unknown),
            1 => Some(SignatureState::Valid),
            2 => Some(SignatureState::Invalid),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignatureState::Unknown => "UNKNOWN",
            SignatureState::Valid => "VALID",
            SignatureState::Invalid => "INVALID",
        }
    }
}

impl fmt::Display for SignatureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite row key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    pub peer_id: String,
    pub device_id: String,
    pub signing_key_id: u32,
    pub encryption_key_id: u32,
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.peer_id, self.device_id, self.signing_key_id, self.encryption_key_id
        )
    }
}

/// One imported key card for one peer device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyringEntry {
    pub key: EntryKey,
    pub signing_kid: String,
    pub encryption_kid: String,
    /// Base64 public signing keyset.
    pub signing_keyset: String,
    /// Base64 public encryption keyset.
    pub encryption_keyset: String,
    pub trust_state: TrustState,
    pub signature_state: SignatureState,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl KeyringEntry {
    /// Only trusted rows from validly signed cards may receive envelopes.
    pub fn is_recipient_eligible(&self) -> bool {
        self.trust_state == TrustState::Trusted && self.signature_state == SignatureState::Valid
    }

    pub fn has_kids(&self, signing_kid: &str, encryption_kid: &str) -> bool {
        self.signing_kid == signing_kid && self.encryption_kid == encryption_kid
    }
}

/// Newest first, key order as tie-break.
pub(crate) fn sort_newest_first(rows: &mut [KeyringEntry]) {
    rows.sort_by(|a, b| {
        b.updated_at_ms
            .cmp(&a.updated_at_ms)
            .then_with(|| a.key.cmp(&b.key))
    });
}

// ============================================================================
// Repository Trait
// ============================================================================

/// Storage abstraction for keyring rows.
///
/// Every method is atomic: a concurrent reader never sees a half-applied
/// upsert or revocation sweep.
#[async_trait]
pub trait KeyringRepository: Send + Sync {
    /// Retrieve one row.
    ///
    /// # Returns
    /// * `Ok(Some(entry))` if found
    /// * `Ok(None)` if not found
    async fn get(&self, key: &EntryKey) -> Result<Option<KeyringEntry>, StoreError>;

    /// Insert or replace `entry`, then mark REVOKED every other non-revoked
    /// row for the same peer and device whose (signing kid, encryption kid)
    /// differs. Both steps happen in one atomic unit.
    ///
    /// # Returns
    /// * `Ok(keys)` - rows that were revoked by the sweep
    async fn upsert_superseding(&self, entry: KeyringEntry) -> Result<Vec<EntryKey>, StoreError>;

    /// All rows for a peer, newest `updated_at_ms` first.
    async fn list_for_peer(&self, peer_id: &str) -> Result<Vec<KeyringEntry>, StoreError>;

    /// Rows for a peer whose signing kid matches.
    async fn find_by_signing_kid(
        &self,
        peer_id: &str,
        signing_kid: &str,
    ) -> Result<Vec<KeyringEntry>, StoreError>;

    /// Rows for a peer whose signing key id matches.
    async fn find_by_signing_key_id(
        &self,
        peer_id: &str,
        signing_key_id: u32,
    ) -> Result<Vec<KeyringEntry>, StoreError>;

    /// Rows for a peer matching both kids.
    async fn find_by_kids(
        &self,
        peer_id: &str,
        signing_kid: &str,
        encryption_kid: &str,
    ) -> Result<Vec<KeyringEntry>, StoreError>;

    /// Set the trust state of one row. A REVOKED row is never changed, even
    /// when it was revoked after the caller last read it.
    ///
    /// # Returns
    /// * `Err(StoreError::NotFound)` if the row does not exist
    /// * `Err(StoreError::InvalidTransition)` if the row is REVOKED and `state` is not
    async fn update_trust_state(
        &self,
        key: &EntryKey,
        state: TrustState,
        now_ms: i64,
    ) -> Result<(), StoreError>;

    /// Set the signature state of one row.
    async fn update_signature_state(
        &self,
        key: &EntryKey,
        state: SignatureState,
        now_ms: i64,
    ) -> Result<(), StoreError>;

    /// Delete one row.
    ///
    /// # Returns
    /// * `Ok(true)` if a row was removed
    async fn delete(&self, key: &EntryKey) -> Result<bool, StoreError>;

    /// Delete every row for a peer and return how many were removed.
    async fn delete_peer(&self, peer_id: &str) -> Result<usize, StoreError>;

    /// Remove all rows.
    async fn clear(&self) -> Result<(), StoreError>;

    /// Distinct peer ids with at least one row.
    async fn list_peers(&self) -> Result<Vec<String>, StoreError>;
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

/// In-memory keyring for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct InMemoryKeyringRepository {
    rows: Arc<RwLock<BTreeMap<EntryKey, KeyringEntry>>>,
}

impl InMemoryKeyringRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    async fn filter_peer<F>(&self, peer_id: &str, pred: F) -> Vec<KeyringEntry>
    where
        F: Fn(&KeyringEntry) -> bool,
    {
        let rows = self.rows.read().await;
        let mut out: Vec<KeyringEntry> = rows
            .values()
            .filter(|e| e.key.peer_id == peer_id && pred(e))
            .cloned()
            .collect();
        sort_newest_first(&mut out);
        out
    }
}

#[async_trait]
impl KeyringRepository for InMemoryKeyringRepository {
    async fn get(&self, key: &EntryKey) -> Result<Option<KeyringEntry>, StoreError> {
        Ok(self.rows.read().await.get(key).cloned())
    }

    async fn upsert_superseding(&self, entry: KeyringEntry) -> Result<Vec<EntryKey>, StoreError> {
        let mut rows = self.rows.write().await;
        let now = entry.updated_at_ms;
        let mut revoked = Vec::new();
        for row in rows.values_mut() {
            if row.key.peer_id == entry.key.peer_id
                && row.key.device_id == entry.key.device_id
                && row.key != entry.key
                && !row.has_kids(&entry.signing_kid, &entry.encryption_kid)
                && row.trust_state != TrustState::Revoked
            {
                row.trust_state = TrustState::Revoked;
                row.updated_at_ms = now;
                revoked.push(row.key.clone());
            }
        }
        rows.insert(entry.key.clone(), entry);
        Ok(revoked)
    }

    async fn list_for_peer(&self, peer_id: &str) -> Result<Vec<KeyringEntry>, StoreError> {
        Ok(self.filter_peer(peer_id, |_| true).await)
    }

    async fn find_by_signing_kid(
        &self,
        peer_id: &str,
        signing_kid: &str,
    ) -> Result<Vec<KeyringEntry>, StoreError> {
        Ok(self.filter_peer(peer_id, |e| e.signing_kid == signing_kid).await)
    }

    async fn find_by_signing_key_id(
        &self,
        peer_id: &str,
        signing_key_id: u32,
    ) -> Result<Vec<KeyringEntry>, StoreError> {
        Ok(self
            .filter_peer(peer_id, |e| e.key.signing_key_id == signing_key_id)
            .await)
    }

    async fn find_by_kids(
        &self,
        peer_id: &str,
        signing_kid: &str,
        encryption_kid: &str,
    ) -> Result<Vec<KeyringEntry>, StoreError> {
        Ok(self
            .filter_peer(peer_id, |e| e.has_kids(signing_kid, encryption_kid))
            .await)
    }

    async fn update_trust_state(
        &self,
        key: &EntryKey,
        state: TrustState,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if row.trust_state == TrustState::Revoked && state != TrustState::Revoked {
            return Err(StoreError::InvalidTransition {
                from: TrustState::Revoked,
                to: state,
            });
        }
        row.trust_state = state;
        row.updated_at_ms = now_ms;
        Ok(())
    }

    async fn update_signature_state(
        &self,
        key: &EntryKey,
        state: SignatureState,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        row.signature_state = state;
        row.updated_at_ms = now_ms;
        Ok(())
    }

    async fn delete(&self, key: &EntryKey) -> Result<bool, StoreError> {
        Ok(self.rows.write().await.remove(key).is_some())
    }

    async fn delete_peer(&self, peer_id: &str) -> Result<usize, StoreError> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|k, _| k.peer_id != peer_id);
        Ok(before - rows.len())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.rows.write().await.clear();
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<String>, StoreError> {
        let rows = self.rows.read().await;
        let mut peers: Vec<String> = rows.keys().map(|k| k.peer_id.clone()).collect();
        peers.dedup();
        Ok(peers)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn make_test_entry(peer: &str, device: &str, skid: &str, ekid: &str) -> KeyringEntry {
        let sid = skid.bytes().map(u32::from).sum::<u32>();
        let eid = ekid.bytes().map(u32::from).sum::<u32>() + 10_000;
        KeyringEntry {
            key: EntryKey {
                peer_id: peer.to_string(),
                device_id: device.to_string(),
                signing_key_id: sid,
                encryption_key_id: eid,
            },
            signing_kid: skid.to_string(),
            encryption_kid: ekid.to_string(),
            signing_keyset: format!("ks-{}", skid),
            encryption_keyset: format!("ks-{}", ekid),
            trust_state: TrustState::Trusted,
            signature_state: SignatureState::Valid,
            created_at_ms: 1,
            updated_at_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let repo = InMemoryKeyringRepository::new();
        let e = make_test_entry("p1", "default", "s1", "e1");
        assert!(repo.upsert_superseding(e.clone()).await.unwrap().is_empty());
        assert_eq!(repo.get(&e.key).await.unwrap(), Some(e));
    }

    #[tokio::test]
    async fn test_superseding_revokes_same_device_only() {
        let repo = InMemoryKeyringRepository::new();
        let old = make_test_entry("p1", "default", "s1", "e1");
        let other_device = make_test_entry("p1", "tablet", "s9", "e9");
        let other_peer = make_test_entry("p2", "default", "s5", "e5");
        repo.upsert_superseding(old.clone()).await.unwrap();
        repo.upsert_superseding(other_device.clone()).await.unwrap();
        repo.upsert_superseding(other_peer.clone()).await.unwrap();

        let mut new = make_test_entry("p1", "default", "s2", "e2");
        new.updated_at_ms = 50;
        let revoked = repo.upsert_superseding(new).await.unwrap();
        assert_eq!(revoked, vec![old.key.clone()]);

        let old_row = repo.get(&old.key).await.unwrap().unwrap();
        assert_eq!(old_row.trust_state, TrustState::Revoked);
        assert_eq!(old_row.updated_at_ms, 50);
        assert_eq!(
            repo.get(&other_device.key).await.unwrap().unwrap().trust_state,
            TrustState::Trusted
        );
        assert_eq!(
            repo.get(&other_peer.key).await.unwrap().unwrap().trust_state,
            TrustState::Trusted
        );
    }

    #[tokio::test]
    async fn test_reimport_same_kids_does_not_revoke() {
        let repo = InMemoryKeyringRepository::new();
        let e = make_test_entry("p1", "default", "s1", "e1");
        repo.upsert_superseding(e.clone()).await.unwrap();
        assert!(repo.upsert_superseding(e).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queries() {
        let repo = InMemoryKeyringRepository::new();
        let mut a = make_test_entry("p1", "default", "s1", "e1");
        a.updated_at_ms = 10;
        let mut b = make_test_entry("p1", "phone", "s2", "e2");
        b.updated_at_ms = 20;
        repo.upsert_superseding(a.clone()).await.unwrap();
        repo.upsert_superseding(b.clone()).await.unwrap();

        let listed = repo.list_for_peer("p1").await.unwrap();
        assert_eq!(listed, vec![b.clone(), a.clone()]);
        assert_eq!(repo.find_by_signing_kid("p1", "s1").await.unwrap(), vec![a.clone()]);
        assert_eq!(
            repo.find_by_signing_key_id("p1", b.key.signing_key_id).await.unwrap(),
            vec![b.clone()]
        );
        assert_eq!(repo.find_by_kids("p1", "s2", "e2").await.unwrap(), vec![b]);
        assert!(repo.find_by_kids("p1", "s1", "e2").await.unwrap().is_empty());
        assert!(repo.list_for_peer("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_states() {
        let repo = InMemoryKeyringRepository::new();
        let e = make_test_entry("p1", "default", "s1", "e1");
        repo.upsert_superseding(e.clone()).await.unwrap();

        repo.update_trust_state(&e.key, TrustState::Untrusted, 7).await.unwrap();
        repo.update_signature_state(&e.key, SignatureState::Invalid, 8).await.unwrap();
        let row = repo.get(&e.key).await.unwrap().unwrap();
        assert_eq!(row.trust_state, TrustState::Untrusted);
        assert_eq!(row.signature_state, SignatureState::Invalid);
        assert_eq!(row.updated_at_ms, 8);

        let missing = make_test_entry("p9", "default", "x", "y");
        assert!(matches!(
            repo.update_trust_state(&missing.key, TrustState::Trusted, 1).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_revoked_row_rejects_trust_update() {
        let repo = InMemoryKeyringRepository::new();
        let e = make_test_entry("p1", "default", "s1", "e1");
        repo.upsert_superseding(e.clone()).await.unwrap();
        repo.upsert_superseding(make_test_entry("p1", "default", "s2", "e2"))
            .await
            .unwrap();

        assert!(matches!(
            repo.update_trust_state(&e.key, TrustState::Trusted, 9).await,
            Err(StoreError::InvalidTransition {
                from: TrustState::Revoked,
                to: TrustState::Trusted
            })
        ));
        repo.update_trust_state(&e.key, TrustState::Revoked, 9).await.unwrap();
        assert_eq!(
            repo.get(&e.key).await.unwrap().unwrap().trust_state,
            TrustState::Revoked
        );
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let repo = InMemoryKeyringRepository::new();
        let a = make_test_entry("p1", "default", "s1", "e1");
        let b = make_test_entry("p1", "phone", "s2", "e2");
        let c = make_test_entry("p2", "default", "s3", "e3");
        for e in [&a, &b, &c] {
            repo.upsert_superseding(e.clone()).await.unwrap();
        }
        assert_eq!(repo.list_peers().await.unwrap(), vec!["p1".to_string(), "p2".to_string()]);

        assert!(repo.delete(&a.key).await.unwrap());
        assert!(!repo.delete(&a.key).await.unwrap());
        assert_eq!(repo.delete_peer("p1").await.unwrap(), 1);
        repo.clear().await.unwrap();
        assert!(repo.list_peers().await.unwrap().is_empty());
    }

    #[test]
    fn test_state_codes_round_trip() {
        for s in [TrustState::Unknown, TrustState::Untrusted, TrustState::Trusted, TrustState::Revoked] {
            assert_eq!(TrustState::from_i32(s.as_i32()), Some(s));
            assert_eq!(s.as_str().parse::<TrustState>().unwrap(), s);
        }
        for s in [SignatureState::Unknown, SignatureState::Valid, SignatureState::Invalid] {
            assert_eq!(SignatureState::from_i32(s.as_i32()), Some(s));
        }
        assert_eq!(TrustState::from_i32(9), None);
        assert!("trusted".parse::<TrustState>().is_ok());
        assert!("bogus".parse::<TrustState>().is_err());
    }

    #[test]
    fn test_recipient_eligibility() {
        let mut e = make_test_entry("p", "d", "s", "e");
        assert!(e.is_recipient_eligible());
        e.signature_state = SignatureState::Invalid;
        assert!(!e.is_recipient_eligible());
        e.signature_state = SignatureState::Valid;
        e.trust_state = TrustState::Unknown;
        assert!(!e.is_recipient_eligible());
    }
}
