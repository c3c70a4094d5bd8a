//! Transport framing: prefixed base64 text for chat messages and the
//! `RGCF` container for files.
//!
//! File layouts:
//! - v2: `"RGCF" | 0x02 | binary envelope`
//! - v3: `"RGCF" | 0x03 | u32 BE header length | binary envelope | stream`

use std::io::{Read, Write};

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

use rg_crypto::encoding::{b64_decode, b64_encode};
use rg_crypto::envelope::Envelope;
use rg_crypto::keycard::KeyCard;

use crate::errors::CryptoError;

pub const ENVELOPE_PREFIX: &str = "RGCRYPT:";
pub const KEY_CARD_PREFIX: &str = "RGKEY:";
pub const KEY_REQUEST_PREFIX: &str = "RGKEYREQ:";

pub const FILE_EXT: &str = ".rgcrypt";
pub const FILE_MIME: &str = "application/octet-stream";
pub const FILE_MAGIC: &[u8; 4] = b"RGCF";
pub const FILE_VERSION: u8 = 2;
pub const STREAM_FILE_VERSION: u8 = 3;
pub const MAX_FILE_BYTES: usize = 1024 * 1024;
pub const MAX_STREAM_HEADER_BYTES: usize = 1024 * 1024;

pub const KEY_REQUEST_VERSION: i32 = 1;
const KEY_REQUEST_NONCE_LEN: usize = 16;

// ============================================================================
// Text
// ============================================================================

pub fn encode_envelope(env: &Envelope) -> Result<String, CryptoError> {
    let json = env.to_json()?;
    Ok(format!("{}{}", ENVELOPE_PREFIX, b64_encode(json.as_bytes())))
}

/// Decode the first `RGCRYPT:` payload found in `text`.
pub fn decode_envelope(text: &str) -> Result<Envelope, CryptoError> {
    let trimmed = text.trim();
    let idx = trimmed
        .find(ENVELOPE_PREFIX)
        .ok_or_else(|| CryptoError::ParseFailure("missing RGCRYPT prefix".into()))?;
    let json = decode_json_text(&trimmed[idx + ENVELOPE_PREFIX.len()..])?;
    Ok(Envelope::from_json(&json)?)
}

pub fn encode_key_card(card: &KeyCard) -> Result<String, CryptoError> {
    let json = card.to_json()?;
    Ok(format!("{}{}", KEY_CARD_PREFIX, b64_encode(json.as_bytes())))
}

pub fn decode_key_card(text: &str) -> Result<KeyCard, CryptoError> {
    let body = text
        .trim()
        .strip_prefix(KEY_CARD_PREFIX)
        .ok_or_else(|| CryptoError::ParseFailure("missing RGKEY prefix".into()))?;
    let json = decode_json_text(body)?;
    Ok(KeyCard::from_json(&json)?)
}

pub fn is_envelope_text(text: &str) -> bool {
    text.contains(ENVELOPE_PREFIX)
}

pub fn is_key_card_text(text: &str) -> bool {
    text.trim_start().starts_with(KEY_CARD_PREFIX)
}

pub fn is_key_request_text(text: &str) -> bool {
    text.trim_start().starts_with(KEY_REQUEST_PREFIX)
}

fn decode_json_text(body: &str) -> Result<String, CryptoError> {
    let bytes = b64_decode(body).map_err(|e| CryptoError::ParseFailure(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| CryptoError::ParseFailure(e.to_string()))
}

// ============================================================================
// Key Requests
// ============================================================================

/// Ask a peer to (re)send their key card.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRequest {
    #[serde(rename = "v")]
    pub version: i32,
    pub requester_id: String,
    /// Base64 random bytes; makes each request text unique.
    pub nonce: String,
}

impl KeyRequest {
    pub fn new(requester_id: &str) -> Result<Self, CryptoError> {
        let requester_id = requester_id.trim();
        if requester_id.is_empty() {
            return Err(CryptoError::InvalidArgument("requester id is empty".into()));
        }
        let mut nonce = [0u8; KEY_REQUEST_NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| CryptoError::InvalidArgument(e.to_string()))?;
        Ok(Self {
            version: KEY_REQUEST_VERSION,
            requester_id: requester_id.to_string(),
            nonce: b64_encode(&nonce),
        })
    }

    pub fn encode(&self) -> Result<String, CryptoError> {
        let json =
            serde_json::to_vec(self).map_err(|e| CryptoError::InvalidArgument(e.to_string()))?;
        Ok(format!("{}{}", KEY_REQUEST_PREFIX, b64_encode(&json)))
    }

    pub fn decode(text: &str) -> Result<Self, CryptoError> {
        let body = text
            .trim()
            .strip_prefix(KEY_REQUEST_PREFIX)
            .ok_or_else(|| CryptoError::ParseFailure("missing RGKEYREQ prefix".into()))?;
        let json = decode_json_text(body)?;
        let req: KeyRequest =
            serde_json::from_str(&json).map_err(|e| CryptoError::ParseFailure(e.to_string()))?;
        if req.version != KEY_REQUEST_VERSION {
            return Err(CryptoError::ParseFailure(format!(
                "unsupported key request version {}",
                req.version
            )));
        }
        if req.requester_id.trim().is_empty() {
            return Err(CryptoError::ParseFailure("key request without requester".into()));
        }
        Ok(req)
    }
}

// ============================================================================
// Files
// ============================================================================

pub fn encode_file(env: &Envelope) -> Vec<u8> {
    let body = env.to_binary();
    let mut out = Vec::with_capacity(FILE_MAGIC.len() + 1 + body.len());
    out.extend_from_slice(FILE_MAGIC);
    out.push(FILE_VERSION);
    out.extend_from_slice(&body);
    out
}

/// Decode a v2 file held in memory. Files above `max_bytes` are refused.
pub fn decode_file(data: &[u8], max_bytes: usize) -> Result<Envelope, CryptoError> {
    if data.len() > max_bytes {
        return Err(CryptoError::InvalidArgument(format!(
            "file of {} bytes exceeds limit of {}",
            data.len(),
            max_bytes
        )));
    }
    let body = check_preamble(data, FILE_VERSION)?;
    if body.is_empty() {
        return Err(CryptoError::ParseFailure("empty file body".into()));
    }
    Ok(Envelope::from_binary(body)?)
}

/// True when `data` starts like a v3 streaming file.
pub fn is_streaming_file(data: &[u8]) -> bool {
    data.len() > FILE_MAGIC.len()
        && data.starts_with(FILE_MAGIC)
        && data[FILE_MAGIC.len()] == STREAM_FILE_VERSION
}

/// Container version of a file preamble, after checking the magic.
pub fn file_version(data: &[u8]) -> Result<u8, CryptoError> {
    if data.len() <= FILE_MAGIC.len() || !data.starts_with(FILE_MAGIC) {
        return Err(CryptoError::ParseFailure("invalid magic".into()));
    }
    Ok(data[FILE_MAGIC.len()])
}

fn check_preamble(data: &[u8], version: u8) -> Result<&[u8], CryptoError> {
    let found = file_version(data)?;
    if found != version {
        return Err(CryptoError::ParseFailure(format!("unsupported file version {}", found)));
    }
    Ok(&data[FILE_MAGIC.len() + 1..])
}

/// Write the v3 preamble and header envelope. The encrypted stream follows.
pub fn write_stream_header<W: Write>(out: &mut W, env: &Envelope) -> std::io::Result<()> {
    let body = env.to_binary();
    let len = u32::try_from(body.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "header envelope too large")
    })?;
    out.write_all(FILE_MAGIC)?;
    out.write_all(&[STREAM_FILE_VERSION])?;
    out.write_all(&len.to_be_bytes())?;
    out.write_all(&body)?;
    out.flush()
}

/// Read the v3 preamble and header envelope, leaving `input` at the start
/// of the encrypted stream.
pub fn read_stream_header<R: Read>(input: &mut R, max_header_bytes: usize) -> Result<Envelope, CryptoError> {
    let mut preamble = [0u8; 5];
    input.read_exact(&mut preamble)?;
    check_preamble(&preamble, STREAM_FILE_VERSION)?;

    let mut len = [0u8; 4];
    input.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len == 0 || len > max_header_bytes {
        return Err(CryptoError::ParseFailure(format!("invalid header size {}", len)));
    }
    let mut body = vec![0u8; len];
    input.read_exact(&mut body)?;
    Ok(Envelope::from_binary(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rg_crypto::envelope::{pack, PackRequest};
    use rg_crypto::keys::{EncryptionKeypair, SigningKeypair};

    fn sample() -> Envelope {
        let s = SigningKeypair::generate();
        let r = EncryptionKeypair::generate();
        let pubs = [r.public_key()];
        pack(
            &PackRequest {
                msg_type: "TEXT",
                payload: b"hello",
                dialog_scope: "u:1:2",
                sender_id: "1",
                sender: &s,
                recipients: &pubs,
                embed_sender_keyset: false,
            },
            1_700_000_000_000,
        )
        .unwrap()
    }

    #[test]
    fn test_envelope_text_round_trip() {
        let env = sample();
        let text = encode_envelope(&env).unwrap();
        assert!(text.starts_with(ENVELOPE_PREFIX));
        assert!(is_envelope_text(&text));
        assert_eq!(decode_envelope(&text).unwrap(), env);

        let wrapped = format!("  quoted: {}\n", text);
        assert_eq!(decode_envelope(&wrapped).unwrap(), env);
    }

    #[test]
    fn test_envelope_text_errors() {
        assert!(matches!(decode_envelope("hello"), Err(CryptoError::ParseFailure(_))));
        assert!(matches!(decode_envelope("RGCRYPT:!!!"), Err(CryptoError::ParseFailure(_))));
        let not_json = format!("{}{}", ENVELOPE_PREFIX, b64_encode(b"[1,2]"));
        assert!(matches!(decode_envelope(&not_json), Err(CryptoError::ParseFailure(_))));
    }

    #[test]
    fn test_key_card_text() {
        let card = KeyCard::create(&SigningKeypair::generate(), &EncryptionKeypair::generate(), None).unwrap();
        let text = encode_key_card(&card).unwrap();
        assert!(is_key_card_text(&text));
        assert!(!is_key_request_text(&text));
        assert_eq!(decode_key_card(&text).unwrap(), card);
        assert!(decode_key_card("RGKEYREQ:abc").is_err());
    }

    #[test]
    fn test_key_request() {
        let req = KeyRequest::new(" 77 ").unwrap();
        assert_eq!(req.requester_id, "77");
        assert_eq!(b64_decode(&req.nonce).unwrap().len(), 16);
        let text = req.encode().unwrap();
        assert!(is_key_request_text(&text));
        assert!(!is_key_card_text(&text));
        assert_eq!(KeyRequest::decode(&text).unwrap(), req);

        assert!(KeyRequest::new("  ").is_err());
        let bad = KeyRequest { version: 2, ..req.clone() };
        let bad_text = format!("{}{}", KEY_REQUEST_PREFIX, b64_encode(&serde_json::to_vec(&bad).unwrap()));
        assert!(KeyRequest::decode(&bad_text).is_err());
        let empty = KeyRequest { requester_id: String::new(), ..req };
        let empty_text = format!("{}{}", KEY_REQUEST_PREFIX, b64_encode(&serde_json::to_vec(&empty).unwrap()));
        assert!(KeyRequest::decode(&empty_text).is_err());
    }

    #[test]
    fn test_file_v2() {
        let env = sample();
        let data = encode_file(&env);
        assert_eq!(&data[..4], FILE_MAGIC);
        assert_eq!(data[4], FILE_VERSION);
        assert!(!is_streaming_file(&data));
        assert_eq!(decode_file(&data, MAX_FILE_BYTES).unwrap(), env);

        assert!(matches!(decode_file(&data, 10), Err(CryptoError::InvalidArgument(_))));
        assert!(matches!(decode_file(b"RGCF\x02", MAX_FILE_BYTES), Err(CryptoError::ParseFailure(_))));
        assert!(matches!(decode_file(b"XXXX\x02abc", MAX_FILE_BYTES), Err(CryptoError::ParseFailure(_))));
        assert!(matches!(decode_file(b"RGCF\x09abc", MAX_FILE_BYTES), Err(CryptoError::ParseFailure(_))));
        assert!(decode_file(b"RG", MAX_FILE_BYTES).is_err());
    }

    #[test]
    fn test_stream_header() {
        let env = sample();
        let mut out = Vec::new();
        write_stream_header(&mut out, &env).unwrap();
        out.extend_from_slice(b"stream-bytes");
        assert!(is_streaming_file(&out));
        assert_eq!(file_version(&out).unwrap(), STREAM_FILE_VERSION);

        let mut input = &out[..];
        let decoded = read_stream_header(&mut input, MAX_STREAM_HEADER_BYTES).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(input, b"stream-bytes");
    }

    #[test]
    fn test_stream_header_limits() {
        let env = sample();
        let mut out = Vec::new();
        write_stream_header(&mut out, &env).unwrap();
        assert!(read_stream_header(&mut &out[..], 8).is_err());

        let zero = b"RGCF\x03\x00\x00\x00\x00";
        assert!(read_stream_header(&mut &zero[..], MAX_STREAM_HEADER_BYTES).is_err());
        let short = b"RGCF\x03\x00\x00\x00\x10abc";
        assert!(matches!(
            read_stream_header(&mut &short[..], MAX_STREAM_HEADER_BYTES),
            Err(CryptoError::ParseFailure(_))
        ));
        let v2 = encode_file(&env);
        assert!(read_stream_header(&mut &v2[..], MAX_STREAM_HEADER_BYTES).is_err());
    }
}
