//! Self-signed identity card.
//!
//! A card publishes a device's signing and encryption keysets. The
//! signature covers the sorted-key JSON of every other field and is made
//! with the signing key the card itself carries.

use serde::{Deserialize, Serialize};

use crate::encoding::{b64_decode, b64_encode, canonical_json, EncodingError};
use crate::hash::sha256;
use crate::ids::normalize_device_id;
use crate::keys::{EncryptionKeypair, EncryptionPublicKey, KeyError, SigningKeypair, VerifyKey};

pub const KEYCARD_VERSION: i32 = 1;

const SAFETY_DIGITS: usize = 60;
const SAFETY_GROUP: usize = 10;
const SAFETY_GROUPS_PER_LINE: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum KeyCardError {
    #[error("malformed key card: {0}")]
    Malformed(String),
    #[error("unsupported key card version {0}")]
    UnsupportedVersion(i32),
    #[error("key card {field} does not match its keyset")]
    KidMismatch { field: &'static str },
    #[error("key card signature invalid")]
    BadSignature,
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCard {
    #[serde(rename = "v")]
    pub version: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub signing_key_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_kid: Option<String>,
    /// Base64 public signing keyset.
    pub signing_keyset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_kid: Option<String>,
    /// Base64 public encryption keyset.
    pub encryption_keyset: String,
    #[serde(default)]
    pub signature: String,
}

/// Signature input: the card minus `signature`.
#[derive(Serialize)]
struct UnsignedCard<'a> {
    v: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<&'a str>,
    signing_key_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    signing_kid: Option<&'a str>,
    signing_keyset: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    encryption_kid: Option<&'a str>,
    encryption_keyset: &'a str,
}

impl KeyCard {
    pub fn create(
        signing: &SigningKeypair,
        encryption: &EncryptionKeypair,
        device_id: Option<&str>,
    ) -> Result<Self, KeyCardError> {
        let mut card = KeyCard {
            version: KEYCARD_VERSION,
            device_id: Some(normalize_device_id(device_id)),
            signing_key_id: signing.key_id(),
            signing_kid: Some(signing.kid()),
            signing_keyset: signing.public_keyset().to_base64(),
            encryption_kid: Some(encryption.kid()),
            encryption_keyset: encryption.public_keyset().to_base64(),
            signature: String::new(),
        };
        card.signature = b64_encode(&signing.sign(&card.signature_input()?));
        Ok(card)
    }

    pub fn signature_input(&self) -> Result<Vec<u8>, KeyCardError> {
        let unsigned = UnsignedCard {
            v: self.version,
            device_id: self.device_id.as_deref(),
            signing_key_id: self.signing_key_id,
            signing_kid: self.signing_kid.as_deref(),
            signing_keyset: &self.signing_keyset,
            encryption_kid: self.encryption_kid.as_deref(),
            encryption_keyset: &self.encryption_keyset,
        };
        Ok(canonical_json(&unsigned)?)
    }

    /// Check declared kids against the keysets and the self-signature.
    pub fn verify(&self) -> Result<(), KeyCardError> {
        let signer = self.signing_public()?;
        if let Some(kid) = &self.signing_kid {
            if kid != signer.kid() {
                return Err(KeyCardError::KidMismatch { field: "signing_kid" });
            }
        }
        let encryption = self.encryption_public()?;
        if let Some(kid) = &self.encryption_kid {
            if kid != encryption.kid() {
                return Err(KeyCardError::KidMismatch { field: "encryption_kid" });
            }
        }
        let signature = b64_decode(&self.signature)?;
        signer
            .verify(&self.signature_input()?, &signature)
            .map_err(|_| KeyCardError::BadSignature)
    }

    pub fn verify_self(&self) -> bool {
        self.verify().is_ok()
    }

    pub fn signing_public(&self) -> Result<VerifyKey, KeyCardError> {
        Ok(VerifyKey::from_base64(&self.signing_keyset)?)
    }

    pub fn encryption_public(&self) -> Result<EncryptionPublicKey, KeyCardError> {
        Ok(EncryptionPublicKey::from_base64(&self.encryption_keyset)?)
    }

    pub fn normalized_device_id(&self) -> String {
        normalize_device_id(self.device_id.as_deref())
    }

    pub fn to_json(&self) -> Result<String, KeyCardError> {
        let bytes = canonical_json(self)?;
        String::from_utf8(bytes).map_err(|e| KeyCardError::Malformed(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, KeyCardError> {
        let card: KeyCard =
            serde_json::from_str(text).map_err(|e| KeyCardError::Malformed(e.to_string()))?;
        if card.version != KEYCARD_VERSION {
            return Err(KeyCardError::UnsupportedVersion(card.version));
        }
        if card.signing_keyset.is_empty() || card.encryption_keyset.is_empty() {
            return Err(KeyCardError::Malformed("missing keyset".into()));
        }
        Ok(card)
    }

    fn fingerprint_bytes(&self) -> [u8; 32] {
        let joined = format!("{}|{}", self.signing_keyset, self.encryption_keyset);
        sha256(joined.as_bytes())
    }

    /// Base64 SHA-256 over `signing_keyset|encryption_keyset`.
    pub fn fingerprint_sha256(&self) -> String {
        b64_encode(&self.fingerprint_bytes())
    }

    /// 60-digit comparison code: the fingerprint as a big-endian integer
    /// mod 10^60, zero-padded, in groups of ten with three groups per line.
    pub fn safety_number(&self) -> String {
        format_safety_digits(&decimal_mod_1e60(&self.fingerprint_bytes()))
    }
}

/// The 256-bit big-endian value of `hash` mod 10^60, as 60 decimal digits.
fn decimal_mod_1e60(hash: &[u8; 32]) -> String {
    const BASE: u64 = 1_000_000_000;

    let mut limbs = [0u32; 8];
    for (limb, c) in limbs.iter_mut().zip(hash.chunks_exact(4)) {
        *limb = u32::from_be_bytes([c[0], c[1], c[2], c[3]]);
    }

    // Seven base-1e9 digits cover the low 63 decimal digits.
    let mut chunks = [0u64; 7];
    for chunk in chunks.iter_mut() {
        let mut rem = 0u64;
        for limb in limbs.iter_mut() {
            let cur = (rem << 32) | u64::from(*limb);
            *limb = (cur / BASE) as u32;
            rem = cur % BASE;
        }
        *chunk = rem;
    }

    let mut digits = String::with_capacity(63);
    for chunk in chunks.iter().rev() {
        digits.push_str(&format!("{:09}", chunk));
    }
    digits.split_off(63 - SAFETY_DIGITS)
}

fn format_safety_digits(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / SAFETY_GROUP);
    for (i, group) in digits.as_bytes().chunks(SAFETY_GROUP).enumerate() {
        if i > 0 {
            out.push(if i % SAFETY_GROUPS_PER_LINE == 0 { '\n' } else { ' ' });
        }
        out.push_str(&String::from_utf8_lossy(group));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_card() -> (KeyCard, SigningKeypair, EncryptionKeypair) {
        let s = SigningKeypair::generate();
        let e = EncryptionKeypair::generate();
        let card = KeyCard::create(&s, &e, Some("phone")).unwrap();
        (card, s, e)
    }

    #[test]
    fn test_create_and_verify() {
        let (card, s, e) = make_card();
        assert!(card.verify_self());
        assert_eq!(card.signing_kid.as_deref(), Some(s.kid().as_str()));
        assert_eq!(card.encryption_kid.as_deref(), Some(e.kid().as_str()));
        assert_eq!(card.signing_key_id, s.key_id());
        assert_eq!(card.device_id.as_deref(), Some("phone"));
    }

    #[test]
    fn test_default_device_id() {
        let card = KeyCard::create(&SigningKeypair::generate(), &EncryptionKeypair::generate(), None)
            .unwrap();
        assert_eq!(card.device_id.as_deref(), Some("default"));
    }

    #[test]
    fn test_json_round_trip_still_verifies() {
        let (card, _, _) = make_card();
        let json = card.to_json().unwrap();
        assert!(json.starts_with(r#"{"device_id":"phone","encryption_keyset":"#));
        let parsed = KeyCard::from_json(&json).unwrap();
        assert_eq!(parsed, card);
        assert!(parsed.verify_self());
    }

    #[test]
    fn test_signature_input_excludes_signature() {
        let (card, _, _) = make_card();
        let input = String::from_utf8(card.signature_input().unwrap()).unwrap();
        assert!(!input.contains("signature"));
        assert!(input.starts_with(r#"{"device_id":"phone","encryption_keyset":"#));
    }

    #[test]
    fn test_tampered_fields_fail() {
        let (card, _, _) = make_card();

        let mut c = card.clone();
        c.device_id = Some("laptop".into());
        assert!(matches!(c.verify(), Err(KeyCardError::BadSignature)));

        let mut c = card.clone();
        c.encryption_keyset = EncryptionKeypair::generate().public_keyset().to_base64();
        assert!(matches!(c.verify(), Err(KeyCardError::KidMismatch { .. })));

        let mut c = card.clone();
        c.encryption_keyset = EncryptionKeypair::generate().public_keyset().to_base64();
        c.encryption_kid = None;
        assert!(matches!(c.verify(), Err(KeyCardError::BadSignature)));

        let mut c = card;
        c.signature = b64_encode(&[0u8; 64]);
        assert!(!c.verify_self());
    }

    #[test]
    fn test_card_signed_by_other_key_rejected() {
        let (mut card, _, _) = make_card();
        let other = SigningKeypair::generate();
        card.signature = b64_encode(&other.sign(&card.signature_input().unwrap()));
        assert!(!card.verify_self());
    }

    #[test]
    fn test_from_json_rejects_bad_input() {
        assert!(KeyCard::from_json("not json").is_err());
        assert!(matches!(
            KeyCard::from_json(
                r#"{"v":2,"signing_key_id":1,"signing_keyset":"a","encryption_keyset":"b"}"#
            ),
            Err(KeyCardError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_decimal_mod_known_values() {
        assert_eq!(
            decimal_mod_1e60(&[0xff; 32]),
            "423570985008687907853269984665640564039457584007913129639935"
        );
        let mut seq = [0u8; 32];
        for (i, b) in seq.iter_mut().enumerate() {
            *b = i as u8;
        }
        assert_eq!(
            decimal_mod_1e60(&seq),
            "700044960722568376592200742329637303199754547598369979440671"
        );
        assert_eq!(decimal_mod_1e60(&[0u8; 32]), "0".repeat(60));
    }

    #[test]
    fn test_safety_number_layout() {
        let digits: String = (0..60).map(|i| char::from(b'0' + (i % 10) as u8)).collect();
        let formatted = format_safety_digits(&digits);
        let lines: Vec<&str> = formatted.split('\n').collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let groups: Vec<&str> = line.split(' ').collect();
            assert_eq!(groups.len(), 3);
            assert!(groups.iter().all(|g| *g == "0123456789"));
        }
    }

    #[test]
    fn test_safety_number_deterministic() {
        let (card, _, _) = make_card();
        let a = card.safety_number();
        assert_eq!(a, card.safety_number());
        assert_eq!(a.len(), 60 + 4 + 1);
        let reparsed = KeyCard::from_json(&card.to_json().unwrap()).unwrap();
        assert_eq!(reparsed.safety_number(), a);
        assert_eq!(reparsed.fingerprint_sha256(), card.fingerprint_sha256());
    }
}
