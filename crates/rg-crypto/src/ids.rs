//! Peer, device and storage identifiers.

use crate::hash::sha256_parts;

pub const DEFAULT_DEVICE_ID: &str = "default";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("peer id is empty")]
pub struct EmptyPeerId;

/// Trim a peer id; blank ids are rejected.
pub fn normalize_peer_id(peer_id: &str) -> Result<String, EmptyPeerId> {
    let trimmed = peer_id.trim();
    if trimmed.is_empty() {
        return Err(EmptyPeerId);
    }
    Ok(trimmed.to_string())
}

/// Trim a device id; missing or blank ids become [`DEFAULT_DEVICE_ID`].
pub fn normalize_device_id(device_id: Option<&str>) -> String {
    match device_id.map(str::trim) {
        Some(d) if !d.is_empty() => d.to_string(),
        _ => DEFAULT_DEVICE_ID.to_string(),
    }
}

/// Opaque per-account storage key: "k" + hex(SHA-256(user_id BE || ':' || salt)).
///
/// Keeps the numeric account id out of file names and database keys.
pub fn storage_id(user_id: i64, salt: &[u8]) -> String {
    let digest = sha256_parts(&[&user_id.to_be_bytes()[..], b":", salt]);
    let mut out = String::with_capacity(1 + digest.len() * 2);
    out.push('k');
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
