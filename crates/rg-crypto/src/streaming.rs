//! Segmented streaming AEAD for payloads too large to hold in memory, and
//! the small metadata record that carries the stream key inside a normal
//! envelope.
//!
//! Stream layout: `header_len (1) || salt (32) || nonce_prefix (7)` followed
//! by ciphertext segments of `segment_size` bytes (the first one shortened
//! by the header). Each segment is ChaCha20Poly1305 under a key derived
//! with HKDF from the stream key, the salt and the associated data. The
//! nonce is `nonce_prefix || segment_index (u32 BE) || last_flag`, so
//! dropping, reordering or appending segments fails authentication.

use std::fmt;
use std::io::{self, Read, Write};

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand_core::{CryptoRng, OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::encoding::{b64_decode, b64_encode, canonical_json};

pub const STREAM_ALG: &str = "CHACHA20_POLY1305_HKDF_4KB";
pub const DEFAULT_SEGMENT_SIZE: usize = 4096;
pub const STREAM_KEY_LEN: usize = 32;
pub const STREAMING_META_VERSION: i32 = 1;

const SALT_LEN: usize = 32;
const NONCE_PREFIX_LEN: usize = 7;
pub const HEADER_LEN: usize = 1 + SALT_LEN + NONCE_PREFIX_LEN;
const TAG_LEN: usize = 16;
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("invalid stream header")]
    InvalidHeader,
    #[error("stream key must be {STREAM_KEY_LEN} bytes")]
    InvalidKey,
    #[error("segment size {0} too small")]
    InvalidSegmentSize(usize),
    #[error("segment {segment} failed authentication")]
    SegmentAuth { segment: u32 },
    #[error("stream truncated")]
    Truncated,
    #[error("too many segments")]
    TooManySegments,
    #[error("key derivation failed")]
    Kdf,
    #[error("encryption failed")]
    EncryptFailed,
    #[error("invalid streaming metadata: {0}")]
    Meta(String),
}

impl From<StreamError> for io::Error {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Io(inner) => inner,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// 32-byte stream key. Zeroized on drop and never printed.
#[derive(Clone)]
pub struct StreamKey(Zeroizing<[u8; STREAM_KEY_LEN]>);

impl StreamKey {
    pub fn generate() -> Self {
        Self::generate_with(&mut OsRng)
    }

    pub fn generate_with<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut key = Zeroizing::new([0u8; STREAM_KEY_LEN]);
        rng.fill_bytes(&mut key[..]);
        Self(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StreamError> {
        let arr: [u8; STREAM_KEY_LEN] = bytes.try_into().map_err(|_| StreamError::InvalidKey)?;
        Ok(Self(Zeroizing::new(arr)))
    }

    pub fn as_bytes(&self) -> &[u8; STREAM_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamKey(..)")
    }
}

fn segment_cipher(key: &StreamKey, salt: &[u8], aad: &[u8]) -> Result<ChaCha20Poly1305, StreamError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), key.as_bytes());
    let mut seg_key = Zeroizing::new([0u8; 32]);
    hk.expand_multi_info(&[&b"rg_stream_v1"[..], aad], &mut seg_key[..])
        .map_err(|_| StreamError::Kdf)?;
    Ok(ChaCha20Poly1305::new(Key::from_slice(&seg_key[..])))
}

fn segment_nonce(prefix: &[u8; NONCE_PREFIX_LEN], segment: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..11].copy_from_slice(&segment.to_be_bytes());
    nonce[11] = u8::from(last);
    nonce
}

fn check_segment_size(segment_size: usize) -> Result<(), StreamError> {
    if segment_size <= HEADER_LEN + TAG_LEN || segment_size > u32::MAX as usize {
        return Err(StreamError::InvalidSegmentSize(segment_size));
    }
    Ok(())
}

// ============================================================================
// Writer
// ============================================================================

/// Encrypting writer. Call [`StreamEncryptor::finish`] to emit the final
/// segment; dropping the encryptor without finishing leaves a stream that
/// will fail to decrypt.
pub struct StreamEncryptor<W: Write> {
    inner: W,
    cipher: ChaCha20Poly1305,
    prefix: [u8; NONCE_PREFIX_LEN],
    segment: u32,
    segment_size: usize,
    buf: Vec<u8>,
}

impl<W: Write> StreamEncryptor<W> {
    pub fn new(key: &StreamKey, aad: &[u8], inner: W) -> Result<Self, StreamError> {
        Self::with_rng(key, aad, inner, DEFAULT_SEGMENT_SIZE, &mut OsRng)
    }

    pub fn with_rng<R: RngCore + CryptoRng>(
        key: &StreamKey,
        aad: &[u8],
        mut inner: W,
        segment_size: usize,
        rng: &mut R,
    ) -> Result<Self, StreamError> {
        check_segment_size(segment_size)?;

        let mut salt = [0u8; SALT_LEN];
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        rng.try_fill_bytes(&mut salt).map_err(|_| StreamError::EncryptFailed)?;
        rng.try_fill_bytes(&mut prefix).map_err(|_| StreamError::EncryptFailed)?;

        inner.write_all(&[HEADER_LEN as u8])?;
        inner.write_all(&salt)?;
        inner.write_all(&prefix)?;

        Ok(Self {
            inner,
            cipher: segment_cipher(key, &salt, aad)?,
            prefix,
            segment: 0,
            segment_size,
            buf: Vec::with_capacity(segment_size),
        })
    }

    fn plaintext_limit(&self) -> usize {
        let ct = if self.segment == 0 { self.segment_size - HEADER_LEN } else { self.segment_size };
        ct - TAG_LEN
    }

    fn emit(&mut self, len: usize, last: bool) -> Result<(), StreamError> {
        let nonce = segment_nonce(&self.prefix, self.segment, last);
        let ct = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: &self.buf[..len], aad: &[] })
            .map_err(|_| StreamError::EncryptFailed)?;
        self.inner.write_all(&ct)?;
        self.buf.drain(..len);
        self.segment = self.segment.checked_add(1).ok_or(StreamError::TooManySegments)?;
        Ok(())
    }

    // Keep at least one byte buffered so the final segment is never empty
    // unless the whole stream is.
    fn emit_full_segments(&mut self) -> Result<(), StreamError> {
        while self.buf.len() > self.plaintext_limit() {
            let limit = self.plaintext_limit();
            self.emit(limit, false)?;
        }
        Ok(())
    }

    /// Encrypt the buffered tail as the last segment and return the sink.
    pub fn finish(mut self) -> Result<W, StreamError> {
        let len = self.buf.len();
        self.emit(len, true)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for StreamEncryptor<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        self.emit_full_segments()?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Decrypting reader. Yields plaintext only after each segment authenticates.
pub struct StreamDecryptor<R: Read> {
    inner: R,
    cipher: ChaCha20Poly1305,
    prefix: [u8; NONCE_PREFIX_LEN],
    segment: u32,
    segment_size: usize,
    pending: Vec<u8>,
    out: Zeroizing<Vec<u8>>,
    out_pos: usize,
    eof: bool,
    done: bool,
}

impl<R: Read> StreamDecryptor<R> {
    pub fn new(key: &StreamKey, aad: &[u8], inner: R) -> Result<Self, StreamError> {
        Self::with_segment_size(key, aad, inner, DEFAULT_SEGMENT_SIZE)
    }

    pub fn with_segment_size(
        key: &StreamKey,
        aad: &[u8],
        mut inner: R,
        segment_size: usize,
    ) -> Result<Self, StreamError> {
        check_segment_size(segment_size)?;

        let mut header = [0u8; HEADER_LEN];
        inner.read_exact(&mut header).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => StreamError::Truncated,
            _ => StreamError::Io(e),
        })?;
        if header[0] as usize != HEADER_LEN {
            return Err(StreamError::InvalidHeader);
        }
        let salt = &header[1..1 + SALT_LEN];
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        prefix.copy_from_slice(&header[1 + SALT_LEN..]);

        Ok(Self {
            inner,
            cipher: segment_cipher(key, salt, aad)?,
            prefix,
            segment: 0,
            segment_size,
            pending: Vec::with_capacity(segment_size + 1),
            out: Zeroizing::new(Vec::new()),
            out_pos: 0,
            eof: false,
            done: false,
        })
    }

    fn fill(&mut self, want: usize) -> Result<(), StreamError> {
        let mut chunk = [0u8; READ_CHUNK];
        while self.pending.len() < want && !self.eof {
            let n = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                self.eof = true;
            } else {
                self.pending.extend_from_slice(&chunk[..n]);
            }
        }
        Ok(())
    }

    fn next_segment(&mut self) -> Result<(), StreamError> {
        let limit = if self.segment == 0 { self.segment_size - HEADER_LEN } else { self.segment_size };
        // One byte of lookahead tells a full middle segment from a full last one.
        self.fill(limit + 1)?;

        let last = self.pending.len() <= limit;
        let take = if last { self.pending.len() } else { limit };
        if take < TAG_LEN {
            return Err(StreamError::Truncated);
        }

        let nonce = segment_nonce(&self.prefix, self.segment, last);
        let pt = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: &self.pending[..take], aad: &[] })
            .map_err(|_| StreamError::SegmentAuth { segment: self.segment })?;
        self.pending.drain(..take);

        self.out = Zeroizing::new(pt);
        self.out_pos = 0;
        self.done = last;
        self.segment = self.segment.checked_add(1).ok_or(StreamError::TooManySegments)?;
        Ok(())
    }
}

impl<R: Read> Read for StreamDecryptor<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.out_pos < self.out.len() {
                let n = buf.len().min(self.out.len() - self.out_pos);
                buf[..n].copy_from_slice(&self.out[self.out_pos..self.out_pos + n]);
                self.out_pos += n;
                return Ok(n);
            }
            if self.done || buf.is_empty() {
                return Ok(0);
            }
            self.next_segment()?;
        }
    }
}

/// Encrypt a whole buffer.
pub fn encrypt_to_vec(key: &StreamKey, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, StreamError> {
    let mut enc = StreamEncryptor::new(key, aad, Vec::new())?;
    enc.write_all(plaintext)?;
    enc.finish()
}

/// Decrypt a whole buffer.
pub fn decrypt_to_vec(key: &StreamKey, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, StreamError> {
    let mut dec = StreamDecryptor::new(key, aad, ciphertext)?;
    let mut out = Vec::new();
    dec.read_to_end(&mut out)?;
    Ok(out)
}

// ============================================================================
// Metadata
// ============================================================================

/// Stream key plus display hints, carried as an envelope payload.
/// `version` 0 marks a legacy payload that held only the key.
#[derive(Clone, Debug)]
pub struct StreamingMeta {
    pub version: i32,
    pub key: StreamKey,
    pub name: Option<String>,
    pub mime: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct MetaJson {
    #[serde(default)]
    v: i32,
    #[serde(default)]
    keyset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mime: Option<String>,
}

impl StreamingMeta {
    pub fn new(key: StreamKey, name: Option<String>, mime: Option<String>) -> Self {
        Self { version: STREAMING_META_VERSION, key, name, mime }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, StreamError> {
        let json = MetaJson {
            v: STREAMING_META_VERSION,
            keyset: b64_encode(self.key.as_bytes()),
            name: self.name.clone(),
            mime: self.mime.clone(),
        };
        canonical_json(&json).map_err(|e| StreamError::Meta(e.to_string()))
    }

    /// Parse a metadata payload, falling back to the legacy form where the
    /// payload is the bare key (raw bytes or base64 text).
    ///
    /// JSON with `v < 1` or without a keyset is not metadata; such a payload
    /// is tried as a legacy key like any other bytes.
    pub fn from_payload_or_legacy(payload: &[u8]) -> Result<Self, StreamError> {
        let meta = serde_json::from_slice::<MetaJson>(payload)
            .ok()
            .filter(|json| json.v >= STREAMING_META_VERSION && !json.keyset.is_empty());
        if let Some(json) = meta {
            let raw = Zeroizing::new(
                b64_decode(&json.keyset).map_err(|e| StreamError::Meta(e.to_string()))?,
            );
            return Ok(Self {
                version: json.v,
                key: StreamKey::from_bytes(&raw)?,
                name: json.name.filter(|s| !s.is_empty()),
                mime: json.mime.filter(|s| !s.is_empty()),
            });
        }

        let key = match StreamKey::from_bytes(payload) {
            Ok(k) => k,
            Err(_) => {
                let text = std::str::from_utf8(payload).map_err(|_| StreamError::InvalidKey)?;
                let raw = Zeroizing::new(b64_decode(text).map_err(|_| StreamError::InvalidKey)?);
                StreamKey::from_bytes(&raw)?
            }
        };
        Ok(Self { version: 0, key, name: None, mime: None })
    }

    pub fn is_legacy(&self) -> bool {
        self.version == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: usize = 128;

    fn encrypt_small(key: &StreamKey, aad: &[u8], data: &[u8]) -> Vec<u8> {
        let mut enc = StreamEncryptor::with_rng(key, aad, Vec::new(), SMALL, &mut OsRng).unwrap();
        // Odd write sizes exercise buffering across segment boundaries.
        for chunk in data.chunks(37) {
            enc.write_all(chunk).unwrap();
        }
        enc.finish().unwrap()
    }

    fn decrypt_small(key: &StreamKey, aad: &[u8], data: &[u8]) -> Result<Vec<u8>, io::Error> {
        let mut dec = StreamDecryptor::with_segment_size(key, aad, data, SMALL).map_err(io::Error::from)?;
        let mut out = Vec::new();
        dec.read_to_end(&mut out)?;
        Ok(out)
    }

    fn pattern(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_round_trip_various_sizes() {
        let key = StreamKey::generate();
        let first = SMALL - HEADER_LEN - TAG_LEN;
        let rest = SMALL - TAG_LEN;
        for n in [0, 1, first - 1, first, first + 1, first + rest, first + rest + 1, 5000] {
            let data = pattern(n);
            let ct = encrypt_small(&key, b"aad", &data);
            assert_eq!(decrypt_small(&key, b"aad", &ct).unwrap(), data, "size {}", n);
        }
    }

    #[test]
    fn test_default_segment_size_helpers() {
        let key = StreamKey::generate();
        let data = pattern(20_000);
        let ct = encrypt_to_vec(&key, b"file", &data).unwrap();
        assert_eq!(ct[0] as usize, HEADER_LEN);
        assert_eq!(decrypt_to_vec(&key, b"file", &ct).unwrap(), data);
    }

    #[test]
    fn test_wrong_aad_or_key_fails() {
        let key = StreamKey::generate();
        let ct = encrypt_small(&key, b"aad", &pattern(300));
        assert!(decrypt_small(&key, b"other", &ct).is_err());
        assert!(decrypt_small(&StreamKey::generate(), b"aad", &ct).is_err());
    }

    #[test]
    fn test_truncation_at_segment_boundary_detected() {
        let key = StreamKey::generate();
        let ct = encrypt_small(&key, b"", &pattern(1000));
        // Header-shortened first segment plus one full segment.
        let cut = HEADER_LEN + (SMALL - HEADER_LEN) + SMALL;
        assert!(decrypt_small(&key, b"", &ct[..cut]).is_err());
        assert!(decrypt_small(&key, b"", &ct[..ct.len() - 1]).is_err());
        assert!(decrypt_small(&key, b"", &ct[..10]).is_err());
    }

    #[test]
    fn test_trailing_data_detected() {
        let key = StreamKey::generate();
        let mut ct = encrypt_small(&key, b"", &pattern(500));
        ct.extend_from_slice(&[0u8; 20]);
        assert!(decrypt_small(&key, b"", &ct).is_err());
    }

    #[test]
    fn test_reordered_segments_detected() {
        let key = StreamKey::generate();
        let mut ct = encrypt_small(&key, b"", &pattern(1000));
        let a = SMALL;
        let b = 2 * SMALL;
        let seg_a: Vec<u8> = ct[a..a + SMALL].to_vec();
        let seg_b: Vec<u8> = ct[b..b + SMALL].to_vec();
        ct[a..a + SMALL].copy_from_slice(&seg_b);
        ct[b..b + SMALL].copy_from_slice(&seg_a);
        assert!(decrypt_small(&key, b"", &ct).is_err());
    }

    #[test]
    fn test_bad_header_length_byte() {
        let key = StreamKey::generate();
        let mut ct = encrypt_small(&key, b"", b"abc");
        ct[0] = 12;
        assert!(matches!(
            StreamDecryptor::with_segment_size(&key, b"", ct.as_slice(), SMALL),
            Err(StreamError::InvalidHeader)
        ));
    }

    #[test]
    fn test_segment_size_validated() {
        let key = StreamKey::generate();
        assert!(matches!(
            StreamEncryptor::with_rng(&key, b"", Vec::new(), HEADER_LEN + TAG_LEN, &mut OsRng),
            Err(StreamError::InvalidSegmentSize(_))
        ));
    }

    #[test]
    fn test_meta_round_trip() {
        let key = StreamKey::generate();
        let meta = StreamingMeta::new(key.clone(), Some("photo.jpg".into()), Some("image/jpeg".into()));
        let payload = meta.to_payload().unwrap();
        assert!(payload.starts_with(br#"{"keyset":"#));
        let parsed = StreamingMeta::from_payload_or_legacy(&payload).unwrap();
        assert_eq!(parsed.version, 1);
        assert!(!parsed.is_legacy());
        assert_eq!(parsed.key.as_bytes(), key.as_bytes());
        assert_eq!(parsed.name.as_deref(), Some("photo.jpg"));
        assert_eq!(parsed.mime.as_deref(), Some("image/jpeg"));
    }

    #[test]
    fn test_meta_legacy_raw_and_base64_key() {
        let key = StreamKey::generate();
        let raw = StreamingMeta::from_payload_or_legacy(key.as_bytes()).unwrap();
        assert!(raw.is_legacy());
        assert_eq!(raw.key.as_bytes(), key.as_bytes());
        assert!(raw.name.is_none());

        let text = b64_encode(key.as_bytes());
        let b64 = StreamingMeta::from_payload_or_legacy(text.as_bytes()).unwrap();
        assert!(b64.is_legacy());
        assert_eq!(b64.key.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_meta_json_without_v1_keyset_falls_back_to_legacy() {
        let heads: [&[u8]; 3] = [br#"{"v":0,"keyset":"AAAA"}"#, br#"{"v":1,"keyset":""}"#, br#"{"v":2}"#];
        for head in heads {
            let mut payload = head.to_vec();
            payload.resize(STREAM_KEY_LEN, b' ');
            let meta = StreamingMeta::from_payload_or_legacy(&payload).unwrap();
            assert!(meta.is_legacy());
            assert_eq!(&meta.key.as_bytes()[..], &payload[..]);
        }

        assert!(matches!(
            StreamingMeta::from_payload_or_legacy(br#"{"v":0,"keyset":"AAAA"}"#),
            Err(StreamError::InvalidKey)
        ));
    }

    #[test]
    fn test_meta_garbage_rejected() {
        assert!(StreamingMeta::from_payload_or_legacy(b"short").is_err());
        assert!(StreamingMeta::from_payload_or_legacy(br#"{"v":1,"keyset":"AAAA"}"#).is_err());
    }

    #[test]
    fn test_key_debug_redacted() {
        assert_eq!(format!("{:?}", StreamKey::generate()), "StreamKey(..)");
    }
}
