//! Signed multi-recipient envelope.
//!
//! One fresh 32-byte message key encrypts the payload and is wrapped
//! separately for every recipient. The sender signs a canonical header
//! that covers the recipient list, scope, algorithms and the ciphertext
//! hash; the payload AEAD is bound to the same header minus the hash.

use rand_core::{CryptoRng, OsRng, RngCore};
use zeroize::Zeroizing;

use crate::aead::{self, AEAD_ALG, KEY_LEN};
use crate::encoding::EncodingError;
use crate::hash::sha256;
use crate::hybrid::{self, wrap_context, HPKE_ALG};
use crate::keys::{EncryptionKeypair, EncryptionPublicKey, KeyError, SigningKeypair, VerifyKey};
use crate::utils::constant_time_compare;
use crate::wire::{TlvWriter, WireError};

pub const ENVELOPE_VERSION: i32 = 1;
pub const MSG_NONCE_LEN: usize = 16;

/// Field tags shared by the signed header and the binary form.
pub mod tags {
    pub const VERSION: u32 = 1;
    pub const TYPE: u32 = 2;
    pub const SENDER_SIGNING_KEY_ID: u32 = 3;
    pub const RECIPIENT: u32 = 4;
    pub const AEAD_ALG: u32 = 5;
    pub const HPKE_ALG: u32 = 6;
    pub const CIPHERTEXT_SHA256: u32 = 7;
    pub const DIALOG_SCOPE: u32 = 8;
    pub const SENDER_ID: u32 = 9;
    pub const SENDER_SIGNING_KID: u32 = 10;
    pub const MSG_NONCE: u32 = 11;
    pub const CREATED_AT_MS: u32 = 12;
    pub const CIPHERTEXT: u32 = 13;
    pub const SIGNATURE: u32 = 14;
    pub const SENDER_SIGNING_KEYSET: u32 = 15;

    // Nested inside RECIPIENT.
    pub const RECIPIENT_KEY_ID: u32 = 1;
    pub const RECIPIENT_WRAPPED: u32 = 2;
    pub const RECIPIENT_KID: u32 = 3;
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unsupported {field}: {value}")]
    Unsupported { field: &'static str, value: String },
    #[error("ciphertext hash mismatch")]
    HashMismatch,
    #[error("signature verification failed")]
    BadSignature,
    #[error("recipient not found: {kid}")]
    RecipientNotFound { kid: String },
    #[error("decryption failed")]
    DecryptFailed,
    #[error("encryption failed")]
    EncryptFailed,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// The message key sealed to one recipient.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecipientEntry {
    pub key_id: u32,
    /// Empty for entries written before kids were carried.
    pub kid: String,
    pub wrapped: Vec<u8>,
}

impl RecipientEntry {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut w = TlvWriter::new();
        w.put_int32(tags::RECIPIENT_KEY_ID, self.key_id as i32)
            .put_bytes(tags::RECIPIENT_WRAPPED, &self.wrapped)
            .put_string_opt(tags::RECIPIENT_KID, &self.kid);
        w.into_vec()
    }
}

/// A packed envelope. String and byte fields are "absent" when empty, and
/// `created_at_ms` when zero; absent fields are left out of every encoding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Envelope {
    pub version: i32,
    pub msg_type: String,
    pub dialog_scope: String,
    pub sender_id: String,
    pub sender_signing_key_id: u32,
    pub sender_signing_kid: String,
    /// Sender's public signing keyset. Not signed; only a hint for key discovery.
    pub sender_signing_keyset: Option<String>,
    /// Sorted ascending by `key_id`.
    pub recipients: Vec<RecipientEntry>,
    pub aead_alg: String,
    pub hpke_alg: String,
    pub ciphertext: Vec<u8>,
    pub msg_nonce: Vec<u8>,
    pub created_at_ms: i64,
    pub ciphertext_sha256: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Envelope {
    /// Bytes covered by the sender signature.
    pub fn header_bytes(&self) -> Vec<u8> {
        self.encode_header(true)
    }

    /// Associated data for the payload AEAD: the header without the hash.
    pub fn aad_bytes(&self) -> Vec<u8> {
        self.encode_header(false)
    }

    fn encode_header(&self, include_hash: bool) -> Vec<u8> {
        let mut w = TlvWriter::new();
        w.put_int32(tags::VERSION, self.version)
            .put_string(tags::TYPE, &self.msg_type)
            .put_int32(tags::SENDER_SIGNING_KEY_ID, self.sender_signing_key_id as i32);
        for r in &self.recipients {
            w.put_bytes(tags::RECIPIENT, &r.encode());
        }
        w.put_string_opt(tags::SENDER_SIGNING_KID, &self.sender_signing_kid)
            .put_string_opt(tags::DIALOG_SCOPE, &self.dialog_scope)
            .put_string_opt(tags::SENDER_ID, &self.sender_id)
            .put_string_opt(tags::AEAD_ALG, &self.aead_alg)
            .put_string_opt(tags::HPKE_ALG, &self.hpke_alg)
            .put_bytes_opt(tags::MSG_NONCE, &self.msg_nonce);
        if self.created_at_ms != 0 {
            w.put_int64(tags::CREATED_AT_MS, self.created_at_ms);
        }
        if include_hash {
            w.put_bytes_opt(tags::CIPHERTEXT_SHA256, &self.ciphertext_sha256);
        }
        w.into_vec()
    }

    /// Reject versions and algorithm identifiers this build cannot process.
    pub fn check_supported(&self) -> Result<(), EnvelopeError> {
        if self.version != ENVELOPE_VERSION {
            return Err(EnvelopeError::Unsupported {
                field: "version",
                value: self.version.to_string(),
            });
        }
        if !self.aead_alg.is_empty() && self.aead_alg != AEAD_ALG {
            return Err(EnvelopeError::Unsupported { field: "aead_alg", value: self.aead_alg.clone() });
        }
        if !self.hpke_alg.is_empty() && self.hpke_alg != HPKE_ALG {
            return Err(EnvelopeError::Unsupported { field: "hpke_alg", value: self.hpke_alg.clone() });
        }
        Ok(())
    }

    pub fn verify_ciphertext_hash(&self) -> Result<(), EnvelopeError> {
        let actual = sha256(&self.ciphertext);
        if constant_time_compare(&actual, &self.ciphertext_sha256) {
            Ok(())
        } else {
            Err(EnvelopeError::HashMismatch)
        }
    }

    /// Verify the header signature. The key must be the one the envelope claims.
    pub fn verify_signature(&self, key: &VerifyKey) -> Result<(), EnvelopeError> {
        if !self.sender_signing_kid.is_empty() && key.kid() != self.sender_signing_kid {
            return Err(EnvelopeError::BadSignature);
        }
        key.verify(&self.header_bytes(), &self.signature)
            .map_err(|_| EnvelopeError::BadSignature)
    }

    /// Entry addressed to `kid`; kid-less legacy entries match on `key_id`.
    pub fn find_recipient(&self, kid: &str, key_id: u32) -> Option<&RecipientEntry> {
        self.recipients
            .iter()
            .find(|r| r.kid == kid)
            .or_else(|| self.recipients.iter().find(|r| r.kid.is_empty() && r.key_id == key_id))
    }

    /// Unwrap the message key and decrypt the payload. Does not check the
    /// hash or signature; see [`open`].
    pub fn decrypt_payload(&self, recipient: &EncryptionKeypair) -> Result<Vec<u8>, EnvelopeError> {
        let kid = recipient.kid();
        let entry = self
            .find_recipient(&kid, recipient.key_id())
            .ok_or_else(|| EnvelopeError::RecipientNotFound { kid: kid.clone() })?;

        let context = wrap_context(&kid, &self.sender_signing_kid);
        let key = hybrid::open(recipient, &entry.wrapped, &context)
            .map_err(|_| EnvelopeError::DecryptFailed)?;
        let key: Zeroizing<[u8; KEY_LEN]> = Zeroizing::new(
            key.as_slice().try_into().map_err(|_| EnvelopeError::DecryptFailed)?,
        );

        aead::open(&key, &self.ciphertext, &self.aad_bytes())
            .map_err(|_| EnvelopeError::DecryptFailed)
    }
}

/// Inputs to [`pack`].
#[derive(Clone, Copy)]
pub struct PackRequest<'a> {
    pub msg_type: &'a str,
    pub payload: &'a [u8],
    pub dialog_scope: &'a str,
    pub sender_id: &'a str,
    pub sender: &'a SigningKeypair,
    pub recipients: &'a [EncryptionPublicKey],
    /// Carry the sender's public signing keyset alongside the envelope.
    pub embed_sender_keyset: bool,
}

/// Pack with the OS random source.
pub fn pack(req: &PackRequest<'_>, created_at_ms: i64) -> Result<Envelope, EnvelopeError> {
    pack_with(req, &mut OsRng, created_at_ms)
}

/// Pack with an explicit random source.
///
/// Randomness is drawn in a fixed order (message key, message nonce, one
/// ephemeral key per recipient in sorted order, payload nonce), so the same
/// rng state yields the same envelope whatever order recipients are given in.
pub fn pack_with<R: RngCore + CryptoRng>(
    req: &PackRequest<'_>,
    rng: &mut R,
    created_at_ms: i64,
) -> Result<Envelope, EnvelopeError> {
    if req.msg_type.is_empty() {
        return Err(EnvelopeError::InvalidArgument("type"));
    }
    if req.payload.is_empty() {
        return Err(EnvelopeError::InvalidArgument("payload"));
    }
    if req.recipients.is_empty() {
        return Err(EnvelopeError::InvalidArgument("recipients"));
    }

    let mut sorted: Vec<&EncryptionPublicKey> = req.recipients.iter().collect();
    sorted.sort_by(|a, b| a.key_id().cmp(&b.key_id()).then_with(|| a.kid().cmp(b.kid())));
    sorted.dedup_by(|a, b| a.kid() == b.kid());

    let mut msg_key = Zeroizing::new([0u8; KEY_LEN]);
    rng.try_fill_bytes(&mut msg_key[..])
        .map_err(|_| EnvelopeError::EncryptFailed)?;
    let mut msg_nonce = vec![0u8; MSG_NONCE_LEN];
    rng.try_fill_bytes(&mut msg_nonce)
        .map_err(|_| EnvelopeError::EncryptFailed)?;

    let sender_kid = req.sender.kid();
    let mut recipients = Vec::with_capacity(sorted.len());
    for r in sorted {
        let context = wrap_context(r.kid(), &sender_kid);
        let wrapped = hybrid::seal(rng, r, &msg_key[..], &context)
            .map_err(|_| EnvelopeError::EncryptFailed)?;
        recipients.push(RecipientEntry {
            key_id: r.key_id(),
            kid: r.kid().to_string(),
            wrapped,
        });
    }

    let mut env = Envelope {
        version: ENVELOPE_VERSION,
        msg_type: req.msg_type.to_string(),
        dialog_scope: req.dialog_scope.to_string(),
        sender_id: req.sender_id.to_string(),
        sender_signing_key_id: req.sender.key_id(),
        sender_signing_kid: sender_kid,
        sender_signing_keyset: req
            .embed_sender_keyset
            .then(|| req.sender.public_keyset().to_base64()),
        recipients,
        aead_alg: AEAD_ALG.to_string(),
        hpke_alg: HPKE_ALG.to_string(),
        msg_nonce,
        created_at_ms,
        ..Envelope::default()
    };

    let aad = env.aad_bytes();
    env.ciphertext = aead::seal(rng, &msg_key, req.payload, &aad)
        .map_err(|_| EnvelopeError::EncryptFailed)?;
    env.ciphertext_sha256 = sha256(&env.ciphertext).to_vec();
    env.signature = req.sender.sign(&env.header_bytes()).to_vec();
    Ok(env)
}

/// Outcome of the signature step in [`open`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureCheck {
    Verified,
    /// No verification key was supplied; the payload was still decrypted.
    NoKey,
}

#[derive(Debug)]
pub struct Opened {
    pub plaintext: Vec<u8>,
    pub signature: SignatureCheck,
}

/// Verify and decrypt.
///
/// Order: supported version/algorithms, ciphertext hash, header signature
/// (when a key is given), recipient lookup, unwrap, payload decrypt.
pub fn open(
    env: &Envelope,
    recipient: &EncryptionKeypair,
    sender_key: Option<&VerifyKey>,
) -> Result<Opened, EnvelopeError> {
    env.check_supported()?;
    env.verify_ciphertext_hash()?;
    let signature = match sender_key {
        Some(key) => {
            env.verify_signature(key)?;
            SignatureCheck::Verified
        }
        None => SignatureCheck::NoKey,
    };
    let plaintext = env.decrypt_payload(recipient)?;
    Ok(Opened { plaintext, signature })
}
