//! Error taxonomy surfaced to callers of the envelope and framing APIs.
//!
//! Primitive failures from `rg-crypto` are folded into these kinds so a
//! caller can decide what to do (request a key, warn, drop) without
//! matching on low-level error types.

use thiserror::Error;

use rg_crypto::envelope::EnvelopeError;
use rg_crypto::keycard::KeyCardError;
use rg_crypto::streaming::StreamError;

// ============================================================================
// Crypto Errors
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Malformed input or a missing required field. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Framing, magic, version or encoding could not be read.
    #[error("cannot read container: {0}")]
    ParseFailure(String),

    /// Ciphertext hash does not match; treated as tampering.
    #[error("integrity check failed")]
    IntegrityFailure,

    /// A verification key was available and the signature did not verify.
    #[error("bad signature")]
    BadSignature,

    /// The local key is not among the recipients; triggers a key request.
    #[error("recipient not found: {kid}")]
    RecipientNotFound { kid: String },

    /// AEAD failure on either side, including a failed key wrap or unwrap.
    #[error("decryption failed: {0}")]
    DecryptFailure(String),
}

impl From<EnvelopeError> for CryptoError {
    fn from(e: EnvelopeError) -> Self {
        match e {
            EnvelopeError::InvalidArgument(what) => CryptoError::InvalidArgument(what.to_string()),
            EnvelopeError::HashMismatch => CryptoError::IntegrityFailure,
            EnvelopeError::BadSignature => CryptoError::BadSignature,
            EnvelopeError::RecipientNotFound { kid } => CryptoError::RecipientNotFound { kid },
            EnvelopeError::DecryptFailed => CryptoError::DecryptFailure("payload".into()),
            EnvelopeError::EncryptFailed => CryptoError::DecryptFailure("seal".into()),
            EnvelopeError::Key(k) => CryptoError::InvalidArgument(k.to_string()),
            other @ (EnvelopeError::Malformed(_)
            | EnvelopeError::Unsupported { .. }
            | EnvelopeError::Wire(_)
            | EnvelopeError::Encoding(_)) => CryptoError::ParseFailure(other.to_string()),
        }
    }
}

impl From<KeyCardError> for CryptoError {
    fn from(e: KeyCardError) -> Self {
        match e {
            KeyCardError::BadSignature | KeyCardError::KidMismatch { .. } => CryptoError::BadSignature,
            other => CryptoError::ParseFailure(other.to_string()),
        }
    }
}

impl From<StreamError> for CryptoError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::SegmentAuth { segment } => {
                CryptoError::DecryptFailure(format!("segment {}", segment))
            }
            StreamError::Truncated => CryptoError::IntegrityFailure,
            other @ (StreamError::InvalidKey | StreamError::InvalidSegmentSize(_)) => {
                CryptoError::InvalidArgument(other.to_string())
            }
            other => CryptoError::ParseFailure(other.to_string()),
        }
    }
}

impl From<std::io::Error> for CryptoError {
    fn from(e: std::io::Error) -> Self {
        if e.get_ref().is_some_and(|inner| inner.is::<StreamError>()) {
            if let Some(Ok(stream)) = e.into_inner().map(|inner| inner.downcast::<StreamError>()) {
                return CryptoError::from(*stream);
            }
            return CryptoError::DecryptFailure("stream".into());
        }
        CryptoError::ParseFailure(e.to_string())
    }
}
