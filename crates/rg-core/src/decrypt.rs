//! Receive-side flow: parse, scope check, integrity, signer lookup and
//! decryption, reported as a [`DecryptResult`] instead of an error.

use std::fmt;
use std::io::{self, Read, Write};

use async_trait::async_trait;
use tracing::{debug, warn};

use rg_crypto::envelope::{Envelope, EnvelopeError};
use rg_crypto::keys::{EncryptionKeypair, VerifyKey};
use rg_crypto::streaming::{StreamDecryptor, StreamingMeta};

use crate::codec;
use crate::errors::CryptoError;
use crate::keyring::KeyringStore;
use crate::keyring_cache::KeyringCache;
use crate::scope::scope_matches;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DecryptStatus {
    Ok,
    /// The local key is not a recipient; send a key request.
    NeedKey,
    BadSignature,
    BadHash,
    DecryptFail,
    ParseFail,
}

impl DecryptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DecryptStatus::Ok => "OK",
            DecryptStatus::NeedKey => "NEED_KEY",
            DecryptStatus::BadSignature => "BAD_SIGNATURE",
            DecryptStatus::BadHash => "BAD_HASH",
            DecryptStatus::DecryptFail => "DECRYPT_FAIL",
            DecryptStatus::ParseFail => "PARSE_FAIL",
        }
    }
}

impl fmt::Display for DecryptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&CryptoError> for DecryptStatus {
    fn from(e: &CryptoError) -> Self {
        match e {
            CryptoError::InvalidArgument(_) | CryptoError::ParseFailure(_) => DecryptStatus::ParseFail,
            CryptoError::IntegrityFailure => DecryptStatus::BadHash,
            CryptoError::BadSignature => DecryptStatus::BadSignature,
            CryptoError::RecipientNotFound { .. } => DecryptStatus::NeedKey,
            CryptoError::DecryptFailure(_) => DecryptStatus::DecryptFail,
        }
    }
}

/// What is known about the sender signature. UNKNOWN is not an error: the
/// sender's key simply is not in the keyring yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignatureStatus {
    Verified,
    Unverified,
    Unknown,
}

impl fmt::Display for SignatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignatureStatus::Verified => "VERIFIED",
            SignatureStatus::Unverified => "UNVERIFIED",
            SignatureStatus::Unknown => "UNKNOWN",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecryptResult {
    pub status: DecryptStatus,
    pub signature: SignatureStatus,
    pub plaintext: Option<Vec<u8>>,
    pub sender_id: Option<String>,
    /// Local encryption kid, set with [`DecryptStatus::NeedKey`].
    pub missing_kid: Option<String>,
}

impl DecryptResult {
    fn ok(plaintext: Vec<u8>, sender_id: Option<String>, signature: SignatureStatus) -> Self {
        Self {
            status: DecryptStatus::Ok,
            signature,
            plaintext: Some(plaintext),
            sender_id,
            missing_kid: None,
        }
    }

    fn need_key(missing_kid: String, sender_id: Option<String>, signature: SignatureStatus) -> Self {
        Self {
            status: DecryptStatus::NeedKey,
            signature,
            plaintext: None,
            sender_id,
            missing_kid: Some(missing_kid),
        }
    }

    fn error(status: DecryptStatus, sender_id: Option<String>, signature: SignatureStatus) -> Self {
        Self {
            status,
            signature,
            plaintext: None,
            sender_id,
            missing_kid: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == DecryptStatus::Ok
    }

    /// Plaintext as UTF-8, if decryption succeeded and it is valid text.
    pub fn text(&self) -> Option<&str> {
        self.plaintext
            .as_deref()
            .and_then(|p| std::str::from_utf8(p).ok())
    }
}

// ============================================================================
// Sender Key Resolution
// ============================================================================

/// Looks up the verification key a sender claims to have signed with.
#[async_trait]
pub trait SenderKeyResolver: Send + Sync {
    async fn signing_key(&self, sender_id: &str, signing_kid: &str) -> Option<VerifyKey>;
}

#[async_trait]
impl SenderKeyResolver for KeyringCache {
    async fn signing_key(&self, sender_id: &str, signing_kid: &str) -> Option<VerifyKey> {
        self.signing_key_for(sender_id, signing_kid)
    }
}

#[async_trait]
impl SenderKeyResolver for KeyringStore {
    async fn signing_key(&self, sender_id: &str, signing_kid: &str) -> Option<VerifyKey> {
        match KeyringStore::signing_key(self, sender_id, signing_kid).await {
            Ok(key) => key,
            Err(e) => {
                warn!(sender = sender_id, error = %e, "signer lookup failed");
                None
            }
        }
    }
}

/// Local state needed to open an envelope.
#[derive(Clone, Copy)]
pub struct DecryptContext<'a> {
    /// Scope of the local conversation. `None` skips the scope check.
    pub expected_scope: Option<&'a str>,
    pub recipient: &'a EncryptionKeypair,
    pub resolver: Option<&'a dyn SenderKeyResolver>,
}

// ============================================================================
// Flows
// ============================================================================

/// Open a parsed envelope.
///
/// Order: version/algorithms, scope, ciphertext hash, signer (when the
/// resolver knows the key), recipient lookup, payload decrypt.
pub async fn decrypt_envelope(env: &Envelope, ctx: &DecryptContext<'_>) -> DecryptResult {
    let sender = (!env.sender_id.is_empty()).then(|| env.sender_id.clone());

    if let Err(e) = env.check_supported() {
        debug!(error = %e, "unsupported envelope");
        return DecryptResult::error(DecryptStatus::ParseFail, sender, SignatureStatus::Unknown);
    }

    if let Some(expected) = ctx.expected_scope {
        if !scope_matches(expected, &env.dialog_scope, &env.sender_id) {
            debug!(expected, found = %env.dialog_scope, "envelope scope mismatch");
            return DecryptResult::error(DecryptStatus::ParseFail, sender, SignatureStatus::Unknown);
        }
    }

    if env.verify_ciphertext_hash().is_err() {
        warn!(sender = %env.sender_id, "ciphertext hash mismatch");
        return DecryptResult::error(DecryptStatus::BadHash, sender, SignatureStatus::Unknown);
    }

    let mut signature = SignatureStatus::Unknown;
    if let Some(resolver) = ctx.resolver {
        if !env.sender_id.is_empty() && !env.sender_signing_kid.is_empty() {
            if let Some(key) = resolver
                .signing_key(&env.sender_id, &env.sender_signing_kid)
                .await
            {
                if env.verify_signature(&key).is_err() {
                    warn!(sender = %env.sender_id, kid = %env.sender_signing_kid, "envelope signature invalid");
                    return DecryptResult::error(
                        DecryptStatus::BadSignature,
                        sender,
                        SignatureStatus::Unverified,
                    );
                }
                signature = SignatureStatus::Verified;
            }
        }
    }

    match env.decrypt_payload(ctx.recipient) {
        Ok(plaintext) => {
            debug!(sender = %env.sender_id, %signature, "envelope decrypted");
            DecryptResult::ok(plaintext, sender, signature)
        }
        Err(EnvelopeError::RecipientNotFound { kid }) => {
            debug!(sender = %env.sender_id, "not a recipient; key request needed");
            DecryptResult::need_key(kid, sender, signature)
        }
        Err(e) => {
            warn!(sender = %env.sender_id, error = %e, "envelope decryption failed");
            DecryptResult::error(DecryptStatus::DecryptFail, sender, signature)
        }
    }
}

/// Decode `RGCRYPT:` text and open it.
pub async fn decrypt_text(text: &str, ctx: &DecryptContext<'_>) -> DecryptResult {
    match codec::decode_envelope(text) {
        Ok(env) => decrypt_envelope(&env, ctx).await,
        Err(e) => {
            debug!(error = %e, "envelope text unreadable");
            DecryptResult::error(DecryptStatus::ParseFail, None, SignatureStatus::Unknown)
        }
    }
}

/// Decode a v2 file and open it.
pub async fn decrypt_file(data: &[u8], max_bytes: usize, ctx: &DecryptContext<'_>) -> DecryptResult {
    match codec::decode_file(data, max_bytes) {
        Ok(env) => decrypt_envelope(&env, ctx).await,
        Err(e) => {
            debug!(error = %e, "encrypted file unreadable");
            DecryptResult::error(DecryptStatus::ParseFail, None, SignatureStatus::Unknown)
        }
    }
}

/// Result of [`decrypt_stream`].
#[derive(Debug)]
pub struct StreamDecryptOutcome {
    /// Status of the header envelope, downgraded when the body fails.
    pub result: DecryptResult,
    pub name: Option<String>,
    pub mime: Option<String>,
    pub bytes_written: u64,
}

/// Decrypt a v3 streaming file from `input` into `output`.
///
/// The header envelope is opened first; the body is only touched when it
/// succeeds. I/O on `input` and `output` is blocking.
pub async fn decrypt_stream<R: Read, W: Write>(
    mut input: R,
    output: &mut W,
    max_header_bytes: usize,
    segment_size: usize,
    ctx: &DecryptContext<'_>,
) -> StreamDecryptOutcome {
    let outcome = |result| StreamDecryptOutcome {
        result,
        name: None,
        mime: None,
        bytes_written: 0,
    };

    let env = match codec::read_stream_header(&mut input, max_header_bytes) {
        Ok(env) => env,
        Err(e) => {
            debug!(error = %e, "stream header unreadable");
            return outcome(DecryptResult::error(
                DecryptStatus::ParseFail,
                None,
                SignatureStatus::Unknown,
            ));
        }
    };

    let mut result = decrypt_envelope(&env, ctx).await;
    let Some(payload) = result.plaintext.take().filter(|_| result.is_ok()) else {
        return outcome(result);
    };

    match decrypt_stream_body(&env, &payload, input, output, segment_size) {
        Ok((meta, bytes_written)) => StreamDecryptOutcome {
            result,
            name: meta.name,
            mime: meta.mime,
            bytes_written,
        },
        Err(e) => {
            warn!(error = %e, "stream body failed");
            result.status = DecryptStatus::from(&e);
            outcome(result)
        }
    }
}

/// Decrypt the segment stream that follows a v3 header, given the opened
/// header payload.
pub fn decrypt_stream_body<R: Read, W: Write>(
    header: &Envelope,
    header_payload: &[u8],
    input: R,
    output: &mut W,
    segment_size: usize,
) -> Result<(StreamingMeta, u64), CryptoError> {
    let meta = StreamingMeta::from_payload_or_legacy(header_payload)?;
    if meta.is_legacy() {
        debug!("legacy streaming header without metadata");
    }
    let mut reader =
        StreamDecryptor::with_segment_size(&meta.key, &header.ciphertext_sha256, input, segment_size)?;
    let written = io::copy(&mut reader, output)?;
    output.flush()?;
    Ok((meta, written))
}
