//! Integration tests for RG core flows.
//!
//! These tests drive two parties end to end:
//! - Key card exchange through the keyring and its cache
//! - Text, file and stream messages with signer verification
//! - Key rotation superseding older device keys
//! - Replay detection on received envelopes

use std::io::Cursor;
use std::sync::Arc;

use rg_core::codec::{self, MAX_FILE_BYTES, MAX_STREAM_HEADER_BYTES};
use rg_core::decrypt::{
    decrypt_file, decrypt_stream, decrypt_text, DecryptContext, DecryptStatus, SignatureStatus,
};
use rg_core::keyring::KeyringStore;
use rg_core::keyring_cache::KeyringCache;
use rg_core::messages::{encrypt_file, encrypt_stream, encrypt_text, Outgoing};
use rg_core::replay_cache::{envelope_fingerprint, ReplayCache};
use rg_core::scope::user_scope;
use rg_core::store::{InMemoryKeyringRepository, TrustState};
use rg_crypto::keycard::KeyCard;
use rg_crypto::keys::{EncryptionKeypair, SigningKeypair};
use rg_crypto::streaming::DEFAULT_SEGMENT_SIZE;

struct Party {
    id: &'static str,
    signing: SigningKeypair,
    encryption: EncryptionKeypair,
    keyring: Arc<KeyringStore>,
    cache: KeyringCache,
}

impl Party {
    fn new(id: &'static str) -> Self {
        let keyring = Arc::new(KeyringStore::new(InMemoryKeyringRepository::new_shared()));
        let cache = KeyringCache::new(keyring.clone());
        Self {
            id,
            signing: SigningKeypair::generate(),
            encryption: EncryptionKeypair::generate(),
            keyring,
            cache,
        }
    }

    fn card_text(&self) -> String {
        let card = KeyCard::create(&self.signing, &self.encryption, None).unwrap();
        codec::encode_key_card(&card).unwrap()
    }

    async fn import_from(&self, other: &Party, trust: TrustState) {
        let card = codec::decode_key_card(&other.card_text()).unwrap();
        let result = self
            .keyring
            .import_card(other.id, &card, trust, false)
            .await
            .unwrap();
        assert!(result.signature_valid);
        self.cache
            .refresh_for_peers_and_wait(&[other.id.to_string()])
            .await
            .unwrap();
    }

    fn ctx<'a>(&'a self, scope: &'a str) -> DecryptContext<'a> {
        DecryptContext {
            expected_scope: Some(scope),
            recipient: &self.encryption,
            resolver: Some(&self.cache),
        }
    }
}

async fn paired() -> (Party, Party) {
    let alice = Party::new("100");
    let bob = Party::new("200");
    alice.import_from(&bob, TrustState::Trusted).await;
    bob.import_from(&alice, TrustState::Trusted).await;
    (alice, bob)
}

/// Test: a text message from a known sender decrypts and verifies
#[tokio::test]
async fn integration_text_verified() {
    let (alice, bob) = paired().await;
    let scope = user_scope(Some(100), 200);

    let mut recipients = alice.cache.recipients_for_peer(bob.id);
    assert_eq!(recipients.len(), 1);
    recipients.push(alice.encryption.public_key());

    let to = Outgoing {
        dialog_scope: &scope,
        sender_id: alice.id,
        signer: &alice.signing,
        recipients: &recipients,
        embed_sender_keyset: true,
    };
    let text = encrypt_text("hello bob", &to).unwrap();
    assert!(codec::is_envelope_text(&text));

    let res = decrypt_text(&text, &bob.ctx(&scope)).await;
    assert_eq!(res.status, DecryptStatus::Ok);
    assert_eq!(res.signature, SignatureStatus::Verified);
    assert_eq!(res.text(), Some("hello bob"));

    // The sender can read its own message too.
    let own = decrypt_text(&text, &alice.ctx(&scope)).await;
    assert_eq!(own.text(), Some("hello bob"));
}

/// Test: a sender outside the keyring decrypts with UNKNOWN signature
#[tokio::test]
async fn integration_unknown_sender() {
    let bob = Party::new("200");
    let stranger = Party::new("300");
    let recipients = [bob.encryption.public_key()];
    let to = Outgoing {
        dialog_scope: "g:5",
        sender_id: stranger.id,
        signer: &stranger.signing,
        recipients: &recipients,
        embed_sender_keyset: false,
    };
    let text = encrypt_text("hi", &to).unwrap();
    let res = decrypt_text(&text, &bob.ctx("g:5")).await;
    assert_eq!(res.status, DecryptStatus::Ok);
    assert_eq!(res.signature, SignatureStatus::Unknown);
}

/// Test: a message signed by an impostor claiming a known signing kid fails
#[tokio::test]
async fn integration_impostor_bad_signature() {
    let (alice, bob) = paired().await;
    let impostor = SigningKeypair::generate();
    let recipients = [bob.encryption.public_key()];
    let to = Outgoing {
        dialog_scope: "g:5",
        sender_id: alice.id,
        signer: &impostor,
        recipients: &recipients,
        embed_sender_keyset: false,
    };
    let mut env = to.pack("TEXT", b"trust me").unwrap();
    env.sender_signing_kid = alice.signing.kid();
    env.sender_signing_key_id = alice.signing.key_id();
    let text = codec::encode_envelope(&env).unwrap();

    let res = decrypt_text(&text, &bob.ctx("g:5")).await;
    assert_eq!(res.status, DecryptStatus::BadSignature);
    assert!(res.plaintext.is_none());
}

/// Test: rotating device keys revokes the old pair and stops sends to it
#[tokio::test]
async fn integration_key_rotation() {
    let (alice, mut bob) = paired().await;
    let old_encryption = std::mem::replace(&mut bob.encryption, EncryptionKeypair::generate());
    bob.signing = SigningKeypair::generate();
    alice.import_from(&bob, TrustState::Trusted).await;

    let rows = alice.keyring.get_by_peer(bob.id).await.unwrap();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        let expected = if row.signing_kid == bob.signing.kid() {
            TrustState::Trusted
        } else {
            TrustState::Revoked
        };
        assert_eq!(row.trust_state, expected);
    }

    let recipients = alice.cache.recipients_for_peer(bob.id);
    assert_eq!(recipients, vec![bob.encryption.public_key()]);

    let to = Outgoing {
        dialog_scope: "g:5",
        sender_id: alice.id,
        signer: &alice.signing,
        recipients: &recipients,
        embed_sender_keyset: false,
    };
    let text = encrypt_text("new keys only", &to).unwrap();
    let stale = DecryptContext {
        expected_scope: Some("g:5"),
        recipient: &old_encryption,
        resolver: Some(&bob.cache),
    };
    let res = decrypt_text(&text, &stale).await;
    assert_eq!(res.status, DecryptStatus::NeedKey);
    assert_eq!(res.missing_kid, Some(old_encryption.kid()));
}

/// Test: an untrusted peer is not offered as a recipient
#[tokio::test]
async fn integration_untrusted_not_recipient() {
    let alice = Party::new("100");
    let bob = Party::new("200");
    alice.import_from(&bob, TrustState::Untrusted).await;
    assert!(alice.cache.recipients_for_peer(bob.id).is_empty());
    assert!(alice.cache.has_signing_kid(bob.id, &bob.signing.kid()));
}

/// Test: file and stream containers round trip between parties
#[tokio::test]
async fn integration_file_and_stream() {
    let (alice, bob) = paired().await;
    let recipients = alice.cache.recipients_for_peer(bob.id);
    let to = Outgoing {
        dialog_scope: "g:9",
        sender_id: alice.id,
        signer: &alice.signing,
        recipients: &recipients,
        embed_sender_keyset: false,
    };

    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let file = encrypt_file(&data, MAX_FILE_BYTES, &to).unwrap();
    let res = decrypt_file(&file, MAX_FILE_BYTES, &bob.ctx("g:9")).await;
    assert_eq!(res.status, DecryptStatus::Ok);
    assert_eq!(res.signature, SignatureStatus::Verified);
    assert_eq!(res.plaintext.as_deref(), Some(&data[..]));

    let big: Vec<u8> = (0..(3 * DEFAULT_SEGMENT_SIZE + 17)).map(|i| (i % 7) as u8).collect();
    let (_, sealed) = encrypt_stream(
        Cursor::new(&big),
        Vec::new(),
        Some("big.bin".into()),
        Some("application/octet-stream".into()),
        DEFAULT_SEGMENT_SIZE,
        &to,
    )
    .unwrap();
    assert!(codec::is_streaming_file(&sealed));

    let mut out = Vec::new();
    let outcome = decrypt_stream(
        Cursor::new(&sealed),
        &mut out,
        MAX_STREAM_HEADER_BYTES,
        DEFAULT_SEGMENT_SIZE,
        &bob.ctx("g:9"),
    )
    .await;
    assert_eq!(outcome.result.status, DecryptStatus::Ok);
    assert_eq!(outcome.name.as_deref(), Some("big.bin"));
    assert_eq!(outcome.bytes_written, big.len() as u64);
    assert_eq!(out, big);
}

/// Test: the same envelope under a new message id is flagged as a replay
#[tokio::test]
async fn integration_replay_detection() {
    let (alice, bob) = paired().await;
    let recipients = alice.cache.recipients_for_peer(bob.id);
    let to = Outgoing {
        dialog_scope: "g:1",
        sender_id: alice.id,
        signer: &alice.signing,
        recipients: &recipients,
        embed_sender_keyset: false,
    };
    let env = to.pack("TEXT", b"once").unwrap();
    let fp = envelope_fingerprint(&env);

    let replay = ReplayCache::in_memory(16);
    assert!(!replay.mark_seen("bob", "g:1", &fp, 41).await);
    assert!(!replay.mark_seen("bob", "g:1", &fp, 41).await);
    assert!(replay.mark_seen("bob", "g:1", &fp, 42).await);
    // Another scope is a separate dialog.
    assert!(!replay.mark_seen("bob", "g:2", &fp, 42).await);
}
