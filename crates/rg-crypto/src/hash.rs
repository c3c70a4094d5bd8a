use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

/// SHA-256 over several parts without concatenating them first.
pub fn sha256_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut h = Sha256::new();
    for part in parts {
        h.update(part);
    }
    h.finalize().into()
}

/// Small positive key identifier: first four hash bytes, big-endian, top bit cleared.
/// Never zero, since zero means "absent" on the wire.
pub fn derive_key_id(pubkey_bytes: &[u8]) -> u32 {
    let h = sha256(pubkey_bytes);
    let id = u32::from_be_bytes([h[0], h[1], h[2], h[3]]) & 0x7fff_ffff;
    if id == 0 {
        1
    } else {
        id
    }
}
