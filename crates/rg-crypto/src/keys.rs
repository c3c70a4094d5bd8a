//! Key material: Ed25519 signing keypairs, X25519 encryption keypairs and
//! their exported public keysets.
//!
//! A public keyset is a tiny TLV record `{key_id, algorithm, key}` carried
//! as base64 text. Its `kid` is the base64 SHA-256 of the serialized record,
//! so two parties holding the same keyset text always agree on the kid.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::{CryptoRng, OsRng, RngCore};
use x25519_dalek::{PublicKey as X25519PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::encoding::{b64_decode, b64_encode};
use crate::hash::{derive_key_id, sha256};
use crate::wire::{TlvReader, TlvWriter, WireError};

pub const SIGNING_ALG: &str = "ED25519";
pub const ENCRYPTION_ALG: &str = "X25519";

const KEYSET_KEY_ID: u32 = 1;
const KEYSET_ALGORITHM: u32 = 2;
const KEYSET_KEY: u32 = 3;

/// Error type for key handling.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("malformed keyset: {0}")]
    Malformed(#[from] WireError),
    #[error("keyset is not valid base64")]
    Encoding,
}

/// Exported public half of a keypair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKeyset {
    pub key_id: u32,
    pub algorithm: String,
    pub key: Vec<u8>,
}

impl PublicKeyset {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = TlvWriter::new();
        w.put_int32(KEYSET_KEY_ID, self.key_id as i32)
            .put_string(KEYSET_ALGORITHM, &self.algorithm)
            .put_bytes(KEYSET_KEY, &self.key);
        w.into_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let mut key_id = 0u32;
        let mut algorithm = None;
        let mut key = None;

        let mut r = TlvReader::new(bytes);
        while let Some((tag, value)) = r.next_field()? {
            match tag {
                KEYSET_KEY_ID => key_id = value.as_i32(tag)? as u32,
                KEYSET_ALGORITHM => algorithm = Some(value.as_string(tag)?),
                KEYSET_KEY => key = Some(value.as_bytes(tag)?.to_vec()),
                _ => {}
            }
        }

        Ok(Self {
            key_id,
            algorithm: algorithm.ok_or(WireError::Missing("keyset.algorithm"))?,
            key: key.ok_or(WireError::Missing("keyset.key"))?,
        })
    }

    pub fn to_base64(&self) -> String {
        b64_encode(&self.to_bytes())
    }

    pub fn from_base64(text: &str) -> Result<Self, KeyError> {
        let raw = b64_decode(text).map_err(|_| KeyError::Encoding)?;
        Self::from_bytes(&raw)
    }

    pub fn kid(&self) -> String {
        kid_from_bytes(&self.to_bytes())
    }
}

/// kid = base64(SHA-256(serialized keyset)).
pub fn kid_from_bytes(keyset_bytes: &[u8]) -> String {
    b64_encode(&sha256(keyset_bytes))
}

/// kid of a base64 keyset, computed over the bytes exactly as received.
pub fn kid_from_base64_keyset(text: &str) -> Result<String, KeyError> {
    let raw = b64_decode(text).map_err(|_| KeyError::Encoding)?;
    PublicKeyset::from_bytes(&raw)?;
    Ok(kid_from_bytes(&raw))
}

fn decode_keyset(text: &str) -> Result<(PublicKeyset, String), KeyError> {
    let raw = b64_decode(text).map_err(|_| KeyError::Encoding)?;
    let keyset = PublicKeyset::from_bytes(&raw)?;
    Ok((keyset, kid_from_bytes(&raw)))
}

fn key_array(keyset: &PublicKeyset, algorithm: &str) -> Result<[u8; 32], KeyError> {
    if keyset.algorithm != algorithm {
        return Err(KeyError::UnsupportedAlgorithm(keyset.algorithm.clone()));
    }
    keyset
        .key
        .as_slice()
        .try_into()
        .map_err(|_| KeyError::InvalidKeyLength { expected: 32, got: keyset.key.len() })
}

// ============================================================================
// Signing
// ============================================================================

/// Ed25519 signing keypair. Secret material is zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SigningKeypair {
    key_id: u32,
    #[zeroize(skip)] // SigningKey zeroizes itself
    secret: SigningKey,
}

impl SigningKeypair {
    pub fn generate() -> Self {
        Self::generate_with(&mut OsRng)
    }

    pub fn generate_with<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::from_signing_key(SigningKey::generate(rng))
    }

    /// Rebuild from a stored 32-byte Ed25519 seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    fn from_signing_key(secret: SigningKey) -> Self {
        let key_id = derive_key_id(secret.verifying_key().as_bytes());
        Self { key_id, secret }
    }

    pub fn seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    pub fn public_keyset(&self) -> PublicKeyset {
        PublicKeyset {
            key_id: self.key_id,
            algorithm: SIGNING_ALG.to_string(),
            key: self.secret.verifying_key().to_bytes().to_vec(),
        }
    }

    pub fn kid(&self) -> String {
        self.public_keyset().kid()
    }

    pub fn verify_key(&self) -> VerifyKey {
        let keyset = self.public_keyset();
        VerifyKey {
            kid: keyset.kid(),
            keyset,
            key: self.secret.verifying_key(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let signature: Signature = self.secret.sign(message);
        signature.to_bytes()
    }
}

/// Public Ed25519 key resolved from a keyset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyKey {
    keyset: PublicKeyset,
    kid: String,
    key: VerifyingKey,
}

impl VerifyKey {
    pub fn from_keyset(keyset: PublicKeyset) -> Result<Self, KeyError> {
        let bytes = key_array(&keyset, SIGNING_ALG)?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { kid: keyset.kid(), keyset, key })
    }

    pub fn from_base64(text: &str) -> Result<Self, KeyError> {
        let (keyset, kid) = decode_keyset(text)?;
        let bytes = key_array(&keyset, SIGNING_ALG)?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { keyset, kid, key })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn key_id(&self) -> u32 {
        self.keyset.key_id
    }

    pub fn keyset(&self) -> &PublicKeyset {
        &self.keyset
    }

    /// Strict Ed25519 verification.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), KeyError> {
        let sig_bytes: [u8; 64] = signature.try_into().map_err(|_| KeyError::InvalidSignature)?;
        let sig = Signature::from_bytes(&sig_bytes);
        self.key
            .verify_strict(message, &sig)
            .map_err(|_| KeyError::InvalidSignature)
    }
}

// ============================================================================
// Encryption
// ============================================================================

/// X25519 keypair used to unwrap message keys.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKeypair {
    key_id: u32,
    #[zeroize(skip)] // StaticSecret zeroizes itself
    secret: StaticSecret,
}

impl EncryptionKeypair {
    pub fn generate() -> Self {
        Self::generate_with(&mut OsRng)
    }

    pub fn generate_with<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::from_static(StaticSecret::random_from_rng(rng))
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self::from_static(StaticSecret::from(*secret))
    }

    fn from_static(secret: StaticSecret) -> Self {
        let key_id = derive_key_id(X25519PublicKey::from(&secret).as_bytes());
        Self { key_id, secret }
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    pub fn public_keyset(&self) -> PublicKeyset {
        PublicKeyset {
            key_id: self.key_id,
            algorithm: ENCRYPTION_ALG.to_string(),
            key: X25519PublicKey::from(&self.secret).as_bytes().to_vec(),
        }
    }

    pub fn kid(&self) -> String {
        self.public_keyset().kid()
    }

    pub fn public_key(&self) -> EncryptionPublicKey {
        let keyset = self.public_keyset();
        EncryptionPublicKey {
            kid: keyset.kid(),
            keyset,
            key: X25519PublicKey::from(&self.secret),
        }
    }

    pub(crate) fn diffie_hellman(&self, peer: &X25519PublicKey) -> SharedSecret {
        self.secret.diffie_hellman(peer)
    }
}

/// A recipient's public X25519 key resolved from a keyset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptionPublicKey {
    keyset: PublicKeyset,
    kid: String,
    key: X25519PublicKey,
}

impl EncryptionPublicKey {
    pub fn from_keyset(keyset: PublicKeyset) -> Result<Self, KeyError> {
        let bytes = key_array(&keyset, ENCRYPTION_ALG)?;
        Ok(Self { kid: keyset.kid(), keyset, key: X25519PublicKey::from(bytes) })
    }

    pub fn from_base64(text: &str) -> Result<Self, KeyError> {
        let (keyset, kid) = decode_keyset(text)?;
        let bytes = key_array(&keyset, ENCRYPTION_ALG)?;
        Ok(Self { keyset, kid, key: X25519PublicKey::from(bytes) })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn key_id(&self) -> u32 {
        self.keyset.key_id
    }

    pub fn keyset(&self) -> &PublicKeyset {
        &self.keyset
    }

    pub(crate) fn x25519(&self) -> &X25519PublicKey {
        &self.key
    }
}
