//! Text encodings shared by every transport form: URL-safe base64 and
//! canonical (sorted-key) JSON.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use serde::Serialize;
use serde_json::{Map, Value};

/// URL-safe alphabet, padded on encode, padding optional on decode.
const B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn b64_encode(data: &[u8]) -> String {
    B64.encode(data)
}

/// Decode URL-safe or standard base64, padded or not, ignoring whitespace.
pub fn b64_decode(text: &str) -> Result<Vec<u8>, EncodingError> {
    match B64.decode(text.trim()) {
        Ok(v) => Ok(v),
        Err(first) => {
            let cleaned: String = text
                .chars()
                .filter(|c| !c.is_whitespace())
                .map(|c| match c {
                    '+' => '-',
                    '/' => '_',
                    other => other,
                })
                .collect();
            B64.decode(cleaned).map_err(|_| EncodingError::Base64(first))
        }
    }
}

/// Serialize with object keys sorted at every depth.
///
/// Used as signature input, so the output must not depend on struct field
/// order or on which serde_json map backend is compiled in.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&sorted(v))?)
}

fn sorted(v: Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let out: Map<String, Value> =
                entries.into_iter().map(|(k, v)| (k, sorted(v))).collect();
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}
