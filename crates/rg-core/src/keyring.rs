//! Keyring trust machine on top of a [`KeyringRepository`].
//!
//! Trust transitions:
//! - UNKNOWN -> TRUSTED / UNTRUSTED by explicit decision
//! - any -> REVOKED when a newer card for the same device is imported
//! - REVOKED is terminal for that key pair
//!
//! Signature validity is fixed when the card is imported.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use rg_crypto::ids::{normalize_device_id, normalize_peer_id};
use rg_crypto::keycard::{KeyCard, KeyCardError};
use rg_crypto::keys::{EncryptionPublicKey, VerifyKey};

use crate::now_ms;
use crate::store::{
    EntryKey, KeyringEntry, KeyringRepository, SignatureState, StoreError, TrustState,
};

/// Errors from keyring operations.
#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("peer id must not be empty")]
    EmptyPeerId,

    #[error("key card rejected: {0}")]
    Card(#[from] KeyCardError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of [`KeyringStore::import_key_card`].
#[derive(Debug, Clone)]
pub struct ImportResult {
    pub entry: KeyringEntry,
    pub signature_valid: bool,
    /// Rows of the same device revoked by this import.
    pub revoked: Vec<EntryKey>,
}

/// Serialized access to the keyring. Every read-check-write sequence runs
/// under `write_lock`.
pub struct KeyringStore {
    repo: Arc<dyn KeyringRepository>,
    write_lock: Mutex<()>,
}

impl KeyringStore {
    pub fn new(repo: Arc<dyn KeyringRepository>) -> Self {
        Self {
            repo,
            write_lock: Mutex::new(()),
        }
    }

    pub fn repository(&self) -> &Arc<dyn KeyringRepository> {
        &self.repo
    }

    /// Import a key card received from `peer_id`.
    ///
    /// A card with a bad self-signature is still stored, flagged INVALID, so
    /// the UI can show it; it never becomes a recipient. With
    /// `keep_trust_if_exists` an existing row keeps its trust state.
    pub async fn import_key_card(
        &self,
        peer_id: &str,
        card_json: &str,
        default_trust: TrustState,
        keep_trust_if_exists: bool,
    ) -> Result<ImportResult, KeyringError> {
        let card = KeyCard::from_json(card_json)?;
        self.import_card(peer_id, &card, default_trust, keep_trust_if_exists)
            .await
    }

    /// Import an already parsed card.
    pub async fn import_card(
        &self,
        peer_id: &str,
        card: &KeyCard,
        default_trust: TrustState,
        keep_trust_if_exists: bool,
    ) -> Result<ImportResult, KeyringError> {
        let peer = normalize_peer(peer_id)?;
        let device = card.normalized_device_id();

        let signing = card.signing_public()?;
        let encryption = card.encryption_public()?;
        let signature_valid = match card.verify() {
            Ok(()) => true,
            Err(e) => {
                warn!(peer = %peer, device = %device, error = %e, "key card failed verification");
                false
            }
        };

        let key = EntryKey {
            peer_id: peer.clone(),
            device_id: device.clone(),
            signing_key_id: card.signing_key_id,
            encryption_key_id: encryption.key_id(),
        };

        let _guard = self.write_lock.lock().await;
        let now = now_ms();
        let existing = self.repo.get(&key).await?;

        if let Some(row) = existing.as_ref().filter(|r| r.trust_state == TrustState::Revoked) {
            // A revoked pair is never revived and never supersedes newer keys.
            debug!(peer = %peer, device = %device, "ignoring re-import of revoked key card");
            return Ok(ImportResult {
                entry: row.clone(),
                signature_valid,
                revoked: Vec::new(),
            });
        }

        let trust_state = match &existing {
            Some(row) if keep_trust_if_exists => row.trust_state,
            _ => default_trust,
        };

        let entry = KeyringEntry {
            key,
            signing_kid: signing.kid().to_string(),
            encryption_kid: encryption.kid().to_string(),
            signing_keyset: card.signing_keyset.clone(),
            encryption_keyset: card.encryption_keyset.clone(),
            trust_state,
            signature_state: if signature_valid {
                SignatureState::Valid
            } else {
                SignatureState::Invalid
            },
            created_at_ms: existing.as_ref().map_or(now, |row| row.created_at_ms),
            updated_at_ms: now,
        };

        let revoked = self.repo.upsert_superseding(entry.clone()).await?;
        if !revoked.is_empty() {
            info!(
                peer = %peer,
                device = %device,
                revoked = revoked.len(),
                "superseded older device keys"
            );
        }
        info!(
            peer = %peer,
            device = %device,
            signing_kid = %entry.signing_kid,
            trust = %entry.trust_state,
            signature_valid,
            "imported key card"
        );

        Ok(ImportResult {
            entry,
            signature_valid,
            revoked,
        })
    }

    pub async fn get_by_peer(&self, peer_id: &str) -> Result<Vec<KeyringEntry>, KeyringError> {
        let peer = normalize_peer(peer_id)?;
        Ok(self.repo.list_for_peer(&peer).await?)
    }

    pub async fn get_by_key_ids(
        &self,
        peer_id: &str,
        device_id: Option<&str>,
        signing_key_id: u32,
        encryption_key_id: u32,
    ) -> Result<Option<KeyringEntry>, KeyringError> {
        let key = entry_key(peer_id, device_id, signing_key_id, encryption_key_id)?;
        Ok(self.repo.get(&key).await?)
    }

    pub async fn get_by_kids(
        &self,
        peer_id: &str,
        device_id: Option<&str>,
        signing_kid: &str,
        encryption_kid: &str,
    ) -> Result<Option<KeyringEntry>, KeyringError> {
        let peer = normalize_peer(peer_id)?;
        let device = normalize_device_id(device_id);
        Ok(self
            .repo
            .find_by_kids(&peer, signing_kid, encryption_kid)
            .await?
            .into_iter()
            .find(|e| e.key.device_id == device))
    }

    pub async fn find_by_signing_kid(
        &self,
        peer_id: &str,
        signing_kid: &str,
    ) -> Result<Vec<KeyringEntry>, KeyringError> {
        let peer = normalize_peer(peer_id)?;
        Ok(self.repo.find_by_signing_kid(&peer, signing_kid).await?)
    }

    pub async fn find_by_signing_key_id(
        &self,
        peer_id: &str,
        signing_key_id: u32,
    ) -> Result<Vec<KeyringEntry>, KeyringError> {
        let peer = normalize_peer(peer_id)?;
        Ok(self.repo.find_by_signing_key_id(&peer, signing_key_id).await?)
    }

    /// Verification key for `(peer, signing_kid)`, taken from the newest row
    /// with a valid card signature that is not revoked.
    pub async fn signing_key(
        &self,
        peer_id: &str,
        signing_kid: &str,
    ) -> Result<Option<VerifyKey>, KeyringError> {
        let rows = self.find_by_signing_kid(peer_id, signing_kid).await?;
        for row in rows {
            if row.signature_state != SignatureState::Valid
                || row.trust_state == TrustState::Revoked
            {
                continue;
            }
            match VerifyKey::from_base64(&row.signing_keyset) {
                Ok(key) => return Ok(Some(key)),
                Err(e) => warn!(key = %row.key, error = %e, "stored signing keyset unreadable"),
            }
        }
        Ok(None)
    }

    /// Apply an explicit trust decision.
    ///
    /// REVOKED cannot be left and nothing moves back to UNKNOWN.
    pub async fn set_trust_state(
        &self,
        key: &EntryKey,
        state: TrustState,
    ) -> Result<(), KeyringError> {
        let key = normalize_key(key)?;
        let _guard = self.write_lock.lock().await;
        let row = self
            .repo
            .get(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        check_transition(row.trust_state, state)?;
        if row.trust_state == state {
            return Ok(());
        }
        self.repo.update_trust_state(&key, state, now_ms()).await?;
        info!(key = %key, from = %row.trust_state, to = %state, "trust state changed");
        Ok(())
    }

    pub async fn update_signature_state(
        &self,
        key: &EntryKey,
        state: SignatureState,
    ) -> Result<(), KeyringError> {
        let key = normalize_key(key)?;
        let _guard = self.write_lock.lock().await;
        self.repo
            .update_signature_state(&key, state, now_ms())
            .await?;
        debug!(key = %key, state = %state, "signature state updated");
        Ok(())
    }

    pub async fn delete_entry(&self, key: &EntryKey) -> Result<bool, KeyringError> {
        let key = normalize_key(key)?;
        let _guard = self.write_lock.lock().await;
        Ok(self.repo.delete(&key).await?)
    }

    pub async fn delete_peer(&self, peer_id: &str) -> Result<usize, KeyringError> {
        let peer = normalize_peer(peer_id)?;
        let _guard = self.write_lock.lock().await;
        let removed = self.repo.delete_peer(&peer).await?;
        info!(peer = %peer, removed, "deleted peer keys");
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<(), KeyringError> {
        let _guard = self.write_lock.lock().await;
        self.repo.clear().await?;
        info!("keyring cleared");
        Ok(())
    }

    pub async fn list_peers(&self) -> Result<Vec<String>, KeyringError> {
        Ok(self.repo.list_peers().await?)
    }

    /// Encryption keys that may receive envelopes for `peer_id`.
    pub async fn trusted_recipients(
        &self,
        peer_id: &str,
    ) -> Result<Vec<EncryptionPublicKey>, KeyringError> {
        let rows = self.get_by_peer(peer_id).await?;
        Ok(recipient_keys(rows.iter()))
    }

    pub async fn trusted_recipients_for_peers(
        &self,
        peer_ids: &[String],
    ) -> Result<Vec<EncryptionPublicKey>, KeyringError> {
        let mut out = Vec::new();
        for peer in peer_ids {
            out.extend(self.trusted_recipients(peer).await?);
        }
        Ok(out)
    }
}

/// Parse the encryption keys of recipient-eligible rows. Unreadable rows are
/// skipped.
pub(crate) fn recipient_keys<'a, I>(rows: I) -> Vec<EncryptionPublicKey>
where
    I: IntoIterator<Item = &'a KeyringEntry>,
{
    rows.into_iter()
        .filter(|row| row.is_recipient_eligible())
        .filter_map(|row| match EncryptionPublicKey::from_base64(&row.encryption_keyset) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(key = %row.key, error = %e, "stored encryption keyset unreadable");
                None
            }
        })
        .collect()
}

fn check_transition(from: TrustState, to: TrustState) -> Result<(), StoreError> {
    let allowed = match (from, to) {
        (a, b) if a == b => true,
        (TrustState::Revoked, _) => false,
        (_, TrustState::Unknown) => false,
        _ => true,
    };
    if allowed {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition { from, to })
    }
}

fn normalize_peer(peer_id: &str) -> Result<String, KeyringError> {
    normalize_peer_id(peer_id).map_err(|_| KeyringError::EmptyPeerId)
}

fn entry_key(
    peer_id: &str,
    device_id: Option<&str>,
    signing_key_id: u32,
    encryption_key_id: u32,
) -> Result<EntryKey, KeyringError> {
    Ok(EntryKey {
        peer_id: normalize_peer(peer_id)?,
        device_id: normalize_device_id(device_id),
        signing_key_id,
        encryption_key_id,
    })
}

fn normalize_key(key: &EntryKey) -> Result<EntryKey, KeyringError> {
    entry_key(
        &key.peer_id,
        Some(&key.device_id),
        key.signing_key_id,
        key.encryption_key_id,
    )
}
