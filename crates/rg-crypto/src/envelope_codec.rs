//! Binary (TLV) and JSON forms of [`Envelope`].
//!
//! The binary form writes every field in ascending tag order using the same
//! tags as the signed header, plus ciphertext (13), signature (14) and the
//! optional sender keyset (15). Unknown tags are skipped on read.

use serde::{Deserialize, Serialize};

use crate::encoding::{b64_decode, b64_encode, canonical_json};
use crate::envelope::{tags, Envelope, EnvelopeError, RecipientEntry};
use crate::wire::{TlvReader, TlvWriter};

impl Envelope {
    pub fn to_binary(&self) -> Vec<u8> {
        let mut w = TlvWriter::new();
        w.put_int32(tags::VERSION, self.version)
            .put_string(tags::TYPE, &self.msg_type)
            .put_int32(tags::SENDER_SIGNING_KEY_ID, self.sender_signing_key_id as i32);
        for r in &self.recipients {
            w.put_bytes(tags::RECIPIENT, &r.encode());
        }
        w.put_string_opt(tags::AEAD_ALG, &self.aead_alg)
            .put_string_opt(tags::HPKE_ALG, &self.hpke_alg)
            .put_bytes_opt(tags::CIPHERTEXT_SHA256, &self.ciphertext_sha256)
            .put_string_opt(tags::DIALOG_SCOPE, &self.dialog_scope)
            .put_string_opt(tags::SENDER_ID, &self.sender_id)
            .put_string_opt(tags::SENDER_SIGNING_KID, &self.sender_signing_kid)
            .put_bytes_opt(tags::MSG_NONCE, &self.msg_nonce);
        if self.created_at_ms != 0 {
            w.put_int64(tags::CREATED_AT_MS, self.created_at_ms);
        }
        w.put_bytes_opt(tags::CIPHERTEXT, &self.ciphertext)
            .put_bytes_opt(tags::SIGNATURE, &self.signature);
        if let Some(keyset) = &self.sender_signing_keyset {
            w.put_string_opt(tags::SENDER_SIGNING_KEYSET, keyset);
        }
        w.into_vec()
    }

    pub fn from_binary(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let mut env = Envelope::default();
        let mut r = TlvReader::new(bytes);
        while let Some((tag, value)) = r.next_field()? {
            match tag {
                tags::VERSION => env.version = value.as_i32(tag)?,
                tags::TYPE => env.msg_type = value.as_string(tag)?,
                tags::SENDER_SIGNING_KEY_ID => env.sender_signing_key_id = value.as_i32(tag)? as u32,
                tags::RECIPIENT => env.recipients.push(decode_recipient(value.as_bytes(tag)?)?),
                tags::AEAD_ALG => env.aead_alg = value.as_string(tag)?,
                tags::HPKE_ALG => env.hpke_alg = value.as_string(tag)?,
                tags::CIPHERTEXT_SHA256 => env.ciphertext_sha256 = value.as_bytes(tag)?.to_vec(),
                tags::DIALOG_SCOPE => env.dialog_scope = value.as_string(tag)?,
                tags::SENDER_ID => env.sender_id = value.as_string(tag)?,
                tags::SENDER_SIGNING_KID => env.sender_signing_kid = value.as_string(tag)?,
                tags::MSG_NONCE => env.msg_nonce = value.as_bytes(tag)?.to_vec(),
                tags::CREATED_AT_MS => env.created_at_ms = value.as_i64(tag)?,
                tags::CIPHERTEXT => env.ciphertext = value.as_bytes(tag)?.to_vec(),
                tags::SIGNATURE => env.signature = value.as_bytes(tag)?.to_vec(),
                tags::SENDER_SIGNING_KEYSET => {
                    env.sender_signing_keyset = Some(value.as_string(tag)?)
                }
                _ => {}
            }
        }
        env.require_core_fields()?;
        Ok(env)
    }

    /// Sorted-key JSON; binary fields as URL-safe base64.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        let json = EnvelopeJson::from(self);
        let bytes = canonical_json(&json)?;
        String::from_utf8(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, EnvelopeError> {
        let json: EnvelopeJson = serde_json::from_str(text)
            .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        let env = json.into_envelope()?;
        env.require_core_fields()?;
        Ok(env)
    }

    fn require_core_fields(&self) -> Result<(), EnvelopeError> {
        if self.msg_type.is_empty() {
            return Err(EnvelopeError::Malformed("missing type".into()));
        }
        if self.ciphertext.is_empty() {
            return Err(EnvelopeError::Malformed("missing ciphertext".into()));
        }
        if self.recipients.is_empty() {
            return Err(EnvelopeError::Malformed("no recipients".into()));
        }
        Ok(())
    }
}

fn decode_recipient(bytes: &[u8]) -> Result<RecipientEntry, EnvelopeError> {
    let mut entry = RecipientEntry::default();
    let mut r = TlvReader::new(bytes);
    while let Some((tag, value)) = r.next_field()? {
        match tag {
            tags::RECIPIENT_KEY_ID => entry.key_id = value.as_i32(tag)? as u32,
            tags::RECIPIENT_WRAPPED => entry.wrapped = value.as_bytes(tag)?.to_vec(),
            tags::RECIPIENT_KID => entry.kid = value.as_string(tag)?,
            _ => {}
        }
    }
    Ok(entry)
}

// ============================================================================
// JSON shape
// ============================================================================

#[derive(Serialize, Deserialize)]
struct RecipientJson {
    #[serde(rename = "recipient_key_id")]
    key_id: u32,
    #[serde(rename = "recipient_kid", default, skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
    #[serde(rename = "wrapped_key")]
    wrapped: String,
}

#[derive(Serialize, Deserialize)]
struct EnvelopeJson {
    v: i32,
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dialog_scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender_id: Option<String>,
    #[serde(default)]
    sender_signing_key_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender_signing_kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender_signing_keyset: Option<String>,
    #[serde(default)]
    recipients: Vec<RecipientJson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    aead_alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hpke_alg: Option<String>,
    ciphertext: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    msg_nonce: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    created_at_ms: i64,
    #[serde(default)]
    ciphertext_sha256: String,
    #[serde(default)]
    signature: String,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn non_empty_b64(b: &[u8]) -> Option<String> {
    (!b.is_empty()).then(|| b64_encode(b))
}

fn b64_field(text: &str) -> Result<Vec<u8>, EnvelopeError> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    Ok(b64_decode(text)?)
}

impl From<&Envelope> for EnvelopeJson {
    fn from(env: &Envelope) -> Self {
        Self {
            v: env.version,
            msg_type: env.msg_type.clone(),
            dialog_scope: non_empty(&env.dialog_scope),
            sender_id: non_empty(&env.sender_id),
            sender_signing_key_id: env.sender_signing_key_id,
            sender_signing_kid: non_empty(&env.sender_signing_kid),
            sender_signing_keyset: env.sender_signing_keyset.clone(),
            recipients: env
                .recipients
                .iter()
                .map(|r| RecipientJson {
                    key_id: r.key_id,
                    kid: non_empty(&r.kid),
                    wrapped: b64_encode(&r.wrapped),
                })
                .collect(),
            aead_alg: non_empty(&env.aead_alg),
            hpke_alg: non_empty(&env.hpke_alg),
            ciphertext: b64_encode(&env.ciphertext),
            msg_nonce: non_empty_b64(&env.msg_nonce),
            created_at_ms: env.created_at_ms,
            ciphertext_sha256: b64_encode(&env.ciphertext_sha256),
            signature: b64_encode(&env.signature),
        }
    }
}

impl EnvelopeJson {
    fn into_envelope(self) -> Result<Envelope, EnvelopeError> {
        let mut recipients = Vec::with_capacity(self.recipients.len());
        for r in self.recipients {
            recipients.push(RecipientEntry {
                key_id: r.key_id,
                kid: r.kid.unwrap_or_default(),
                wrapped: b64_field(&r.wrapped)?,
            });
        }
        Ok(Envelope {
            version: self.v,
            msg_type: self.msg_type,
            dialog_scope: self.dialog_scope.unwrap_or_default(),
            sender_id: self.sender_id.unwrap_or_default(),
            sender_signing_key_id: self.sender_signing_key_id,
            sender_signing_kid: self.sender_signing_kid.unwrap_or_default(),
            sender_signing_keyset: self.sender_signing_keyset.filter(|s| !s.is_empty()),
            recipients,
            aead_alg: self.aead_alg.unwrap_or_default(),
            hpke_alg: self.hpke_alg.unwrap_or_default(),
            ciphertext: b64_field(&self.ciphertext)?,
            msg_nonce: b64_field(self.msg_nonce.as_deref().unwrap_or_default())?,
            created_at_ms: self.created_at_ms,
            ciphertext_sha256: b64_field(&self.ciphertext_sha256)?,
            signature: b64_field(&self.signature)?,
        })
    }
}
