//! Send-side helpers: pack a payload for a set of recipients and frame it
//! for text, file or streaming transport.

use std::io::{self, Read, Write};

use rand_core::OsRng;
use tracing::debug;

use rg_crypto::envelope::{pack, Envelope, PackRequest};
use rg_crypto::keys::{EncryptionPublicKey, SigningKeypair};
use rg_crypto::streaming::{StreamEncryptor, StreamKey, StreamingMeta};

use crate::codec;
use crate::errors::CryptoError;
use crate::now_ms;

pub const TYPE_TEXT: &str = "TEXT";
pub const TYPE_FILE: &str = "FILE";
pub const TYPE_FILE_STREAM: &str = "FILE_STREAM";

/// Who is sending, where, and to whom.
#[derive(Clone, Copy)]
pub struct Outgoing<'a> {
    pub dialog_scope: &'a str,
    pub sender_id: &'a str,
    pub signer: &'a SigningKeypair,
    pub recipients: &'a [EncryptionPublicKey],
    pub embed_sender_keyset: bool,
}

impl Outgoing<'_> {
    pub fn pack(&self, msg_type: &str, payload: &[u8]) -> Result<Envelope, CryptoError> {
        let req = PackRequest {
            msg_type,
            payload,
            dialog_scope: self.dialog_scope,
            sender_id: self.sender_id,
            sender: self.signer,
            recipients: self.recipients,
            embed_sender_keyset: self.embed_sender_keyset,
        };
        let env = pack(&req, now_ms())?;
        debug!(
            msg_type,
            recipients = env.recipients.len(),
            bytes = payload.len(),
            "packed envelope"
        );
        Ok(env)
    }
}

/// Pack `text` and return the `RGCRYPT:` string.
pub fn encrypt_text(text: &str, to: &Outgoing<'_>) -> Result<String, CryptoError> {
    let env = to.pack(TYPE_TEXT, text.as_bytes())?;
    codec::encode_envelope(&env)
}

/// Pack a small file into the v2 container.
pub fn encrypt_file(data: &[u8], max_bytes: usize, to: &Outgoing<'_>) -> Result<Vec<u8>, CryptoError> {
    if data.len() > max_bytes {
        return Err(CryptoError::InvalidArgument(format!(
            "file of {} bytes exceeds limit of {}",
            data.len(),
            max_bytes
        )));
    }
    let env = to.pack(TYPE_FILE, data)?;
    Ok(codec::encode_file(&env))
}

/// Write a v3 streaming file: a header envelope carrying a fresh stream key
/// and display hints, then the segmented stream of `input`. Blocking I/O.
pub fn encrypt_stream<R: Read, W: Write>(
    mut input: R,
    mut output: W,
    name: Option<String>,
    mime: Option<String>,
    segment_size: usize,
    to: &Outgoing<'_>,
) -> Result<(Envelope, W), CryptoError> {
    let meta = StreamingMeta::new(StreamKey::generate(), name, mime);
    let env = to.pack(TYPE_FILE_STREAM, &meta.to_payload()?)?;
    codec::write_stream_header(&mut output, &env)?;

    let mut writer = StreamEncryptor::with_rng(
        &meta.key,
        &env.ciphertext_sha256,
        output,
        segment_size,
        &mut OsRng,
    )?;
    let copied = io::copy(&mut input, &mut writer)?;
    let output = writer.finish()?;
    debug!(bytes = copied, "stream encrypted");
    Ok((env, output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decrypt::{decrypt_file, decrypt_stream, decrypt_text, DecryptContext, DecryptStatus};
    use rg_crypto::keys::EncryptionKeypair;
    use rg_crypto::streaming::DEFAULT_SEGMENT_SIZE;

    #[tokio::test]
    async fn test_text_round_trip() {
        let s = SigningKeypair::generate();
        let r = EncryptionKeypair::generate();
        let pubs = [r.public_key()];
        let to = Outgoing {
            dialog_scope: "g:1",
            sender_id: "5",
            signer: &s,
            recipients: &pubs,
            embed_sender_keyset: false,
        };
        let text = encrypt_text("hi there", &to).unwrap();
        let ctx = DecryptContext { expected_scope: Some("g:1"), recipient: &r, resolver: None };
        let res = decrypt_text(&text, &ctx).await;
        assert_eq!(res.text(), Some("hi there"));
    }

    #[tokio::test]
    async fn test_file_round_trip_and_limit() {
        let s = SigningKeypair::generate();
        let r = EncryptionKeypair::generate();
        let pubs = [r.public_key()];
        let to = Outgoing {
            dialog_scope: "",
            sender_id: "5",
            signer: &s,
            recipients: &pubs,
            embed_sender_keyset: true,
        };
        let data = vec![7u8; 5000];
        let file = encrypt_file(&data, codec::MAX_FILE_BYTES, &to).unwrap();
        let ctx = DecryptContext { expected_scope: None, recipient: &r, resolver: None };
        let res = decrypt_file(&file, codec::MAX_FILE_BYTES, &ctx).await;
        assert_eq!(res.plaintext, Some(data.clone()));
        assert!(matches!(encrypt_file(&data, 100, &to), Err(CryptoError::InvalidArgument(_))));
        assert!(matches!(
            encrypt_file(&data, codec::MAX_FILE_BYTES, &Outgoing { recipients: &[], ..to }),
            Err(CryptoError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let s = SigningKeypair::generate();
        let r = EncryptionKeypair::generate();
        let pubs = [r.public_key()];
        let to = Outgoing {
            dialog_scope: "g:1",
            sender_id: "5",
            signer: &s,
            recipients: &pubs,
            embed_sender_keyset: false,
        };
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let (_, file) = encrypt_stream(
            &data[..],
            Vec::new(),
            Some("photo.jpg".into()),
            Some("image/jpeg".into()),
            DEFAULT_SEGMENT_SIZE,
            &to,
        )
        .unwrap();
        assert!(codec::is_streaming_file(&file));

        let ctx = DecryptContext { expected_scope: Some("g:1"), recipient: &r, resolver: None };
        let mut out = Vec::new();
        let outcome = decrypt_stream(
            &file[..],
            &mut out,
            codec::MAX_STREAM_HEADER_BYTES,
            DEFAULT_SEGMENT_SIZE,
            &ctx,
        )
        .await;
        assert_eq!(outcome.result.status, DecryptStatus::Ok);
        assert_eq!(outcome.name.as_deref(), Some("photo.jpg"));
        assert_eq!(outcome.mime.as_deref(), Some("image/jpeg"));
        assert_eq!(outcome.bytes_written, data.len() as u64);
        assert_eq!(out, data);

        let truncated = &file[..file.len() - 10];
        let mut sink = Vec::new();
        let outcome = decrypt_stream(
            truncated,
            &mut sink,
            codec::MAX_STREAM_HEADER_BYTES,
            DEFAULT_SEGMENT_SIZE,
            &ctx,
        )
        .await;
        assert_ne!(outcome.result.status, DecryptStatus::Ok);
    }
}
