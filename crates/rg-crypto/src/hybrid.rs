//! Per-recipient key wrapping: an HPKE-style sealed box built from an
//! ephemeral X25519 exchange, HKDF-SHA256 and ChaCha20Poly1305.
//!
//! Output layout is `ephemeral_public (32) || ciphertext || tag (16)`.
//! Every wrap is bound to a context string so a wrapped key only opens for
//! the recipient kid and sender kid it was produced for.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand_core::{CryptoRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};
use zeroize::Zeroizing;

use crate::hash::sha256_parts;
use crate::keys::{EncryptionKeypair, EncryptionPublicKey};

pub const HPKE_ALG: &str = "DHKEM_X25519_HKDF_SHA256_CHACHA20_POLY1305";

const CONTEXT_DOMAIN: &[u8] = b"rg-crypto/v1";
const CONTEXT_SEPARATOR: u8 = 0x1f;
const EPH_LEN: usize = 32;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HybridError {
    #[error("wrapped key too short")]
    Truncated,
    #[error("key agreement produced a low-order shared secret")]
    NonContributory,
    #[error("key derivation failed")]
    Kdf,
    #[error("seal failed")]
    SealFailed,
    #[error("open failed")]
    OpenFailed,
}

/// Wrap context: SHA-256("rg-crypto/v1" || recipient_kid || 0x1F || sender_signing_kid).
pub fn wrap_context(recipient_kid: &str, sender_signing_kid: &str) -> [u8; 32] {
    sha256_parts(&[
        CONTEXT_DOMAIN,
        recipient_kid.as_bytes(),
        &[CONTEXT_SEPARATOR],
        sender_signing_kid.as_bytes(),
    ])
}

fn kdf_key_nonce(
    shared_secret: &[u8; 32],
    eph_pub: &[u8; 32],
    recipient_pub: &[u8; 32],
    context: &[u8],
) -> Result<(Zeroizing<[u8; 32]>, [u8; 12]), HybridError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(eph_pub);
    salt[32..].copy_from_slice(recipient_pub);
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared_secret);

    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand_multi_info(&[&b"rg_wrap_v1_key"[..], context], &mut key[..])
        .map_err(|_| HybridError::Kdf)?;

    let mut nonce = [0u8; 12];
    hk.expand_multi_info(&[&b"rg_wrap_v1_nonce"[..], context], &mut nonce)
        .map_err(|_| HybridError::Kdf)?;

    Ok((key, nonce))
}

/// Seal `plaintext` to `recipient` under `context`.
pub fn seal<R: RngCore + CryptoRng>(
    rng: &mut R,
    recipient: &EncryptionPublicKey,
    plaintext: &[u8],
    context: &[u8],
) -> Result<Vec<u8>, HybridError> {
    let eph = EphemeralSecret::random_from_rng(rng);
    let eph_pub = X25519PublicKey::from(&eph);

    let shared = eph.diffie_hellman(recipient.x25519());
    if !shared.was_contributory() {
        return Err(HybridError::NonContributory);
    }

    let (key, nonce) = kdf_key_nonce(
        shared.as_bytes(),
        eph_pub.as_bytes(),
        recipient.x25519().as_bytes(),
        context,
    )?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: context })
        .map_err(|_| HybridError::SealFailed)?;

    let mut out = Vec::with_capacity(EPH_LEN + ct.len());
    out.extend_from_slice(eph_pub.as_bytes());
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Open a value produced by [`seal`] with the recipient's private key.
pub fn open(
    recipient: &EncryptionKeypair,
    sealed: &[u8],
    context: &[u8],
) -> Result<Zeroizing<Vec<u8>>, HybridError> {
    if sealed.len() < EPH_LEN + TAG_LEN {
        return Err(HybridError::Truncated);
    }
    let (eph_bytes, ct) = sealed.split_at(EPH_LEN);
    let mut eph_arr = [0u8; 32];
    eph_arr.copy_from_slice(eph_bytes);
    let eph_pub = X25519PublicKey::from(eph_arr);

    let shared = recipient.diffie_hellman(&eph_pub);
    if !shared.was_contributory() {
        return Err(HybridError::NonContributory);
    }

    let recipient_pub = recipient.public_key();
    let (key, nonce) = kdf_key_nonce(
        shared.as_bytes(),
        eph_pub.as_bytes(),
        recipient_pub.x25519().as_bytes(),
        context,
    )?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
    cipher
        .decrypt(Nonce::from_slice(&nonce), Payload { msg: ct, aad: context })
        .map(Zeroizing::new)
        .map_err(|_| HybridError::OpenFailed)
}
