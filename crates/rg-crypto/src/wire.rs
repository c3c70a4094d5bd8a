//! Tag/length/value codec for canonical header bytes and binary envelopes.
//!
//! Fields use the protobuf wire layout (varint keys, varint integers,
//! length-delimited bytes and strings) so any protobuf reader can inspect
//! them, but field order is chosen by the caller and never reordered. That
//! property is what makes the output usable as signature input.

use bytes::{BufMut, BytesMut};
use prost::encoding::{decode_key, decode_varint, encode_key, encode_varint, WireType};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed varint or key: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("length-delimited field {tag} runs past end of input")]
    Truncated { tag: u32 },
    #[error("unsupported wire type for field {tag}")]
    UnsupportedWireType { tag: u32 },
    #[error("field {tag} has unexpected wire type")]
    WrongType { tag: u32 },
    #[error("field {tag} is not valid UTF-8")]
    InvalidUtf8 { tag: u32 },
    #[error("missing field: {0}")]
    Missing(&'static str),
}

/// Append-only TLV builder.
#[derive(Clone, Debug, Default)]
pub struct TlvWriter {
    buf: BytesMut,
}

impl TlvWriter {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(256) }
    }

    /// Append an int32 field. Negative values are sign-extended like protobuf does.
    pub fn put_int32(&mut self, tag: u32, v: i32) -> &mut Self {
        encode_key(tag, WireType::Varint, &mut self.buf);
        encode_varint(v as i64 as u64, &mut self.buf);
        self
    }

    pub fn put_int64(&mut self, tag: u32, v: i64) -> &mut Self {
        encode_key(tag, WireType::Varint, &mut self.buf);
        encode_varint(v as u64, &mut self.buf);
        self
    }

    pub fn put_bytes(&mut self, tag: u32, data: &[u8]) -> &mut Self {
        encode_key(tag, WireType::LengthDelimited, &mut self.buf);
        encode_varint(data.len() as u64, &mut self.buf);
        self.buf.put_slice(data);
        self
    }

    pub fn put_string(&mut self, tag: u32, s: &str) -> &mut Self {
        self.put_bytes(tag, s.as_bytes())
    }

    /// Append a string only when it is non-empty.
    pub fn put_string_opt(&mut self, tag: u32, s: &str) -> &mut Self {
        if !s.is_empty() {
            self.put_string(tag, s);
        }
        self
    }

    /// Append bytes only when they are non-empty.
    pub fn put_bytes_opt(&mut self, tag: u32, data: &[u8]) -> &mut Self {
        if !data.is_empty() {
            self.put_bytes(tag, data);
        }
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// A decoded field value borrowed from the input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
}

impl<'a> FieldValue<'a> {
    pub fn as_i32(self, tag: u32) -> Result<i32, WireError> {
        match self {
            FieldValue::Varint(v) => Ok(v as i32),
            FieldValue::Bytes(_) => Err(WireError::WrongType { tag }),
        }
    }

    pub fn as_i64(self, tag: u32) -> Result<i64, WireError> {
        match self {
            FieldValue::Varint(v) => Ok(v as i64),
            FieldValue::Bytes(_) => Err(WireError::WrongType { tag }),
        }
    }

    pub fn as_bytes(self, tag: u32) -> Result<&'a [u8], WireError> {
        match self {
            FieldValue::Bytes(b) => Ok(b),
            FieldValue::Varint(_) => Err(WireError::WrongType { tag }),
        }
    }

    pub fn as_string(self, tag: u32) -> Result<String, WireError> {
        let b = self.as_bytes(tag)?;
        std::str::from_utf8(b)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidUtf8 { tag })
    }
}

/// Forward-only field iterator. Fixed-width fields are skipped since no
/// message in this crate uses them; groups are rejected.
#[derive(Clone, Debug)]
pub struct TlvReader<'a> {
    buf: &'a [u8],
}

impl<'a> TlvReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn next_field(&mut self) -> Result<Option<(u32, FieldValue<'a>)>, WireError> {
        loop {
            if self.buf.is_empty() {
                return Ok(None);
            }
            let (tag, wire_type) = decode_key(&mut self.buf)?;
            match wire_type {
                WireType::Varint => {
                    let v = decode_varint(&mut self.buf)?;
                    return Ok(Some((tag, FieldValue::Varint(v))));
                }
                WireType::LengthDelimited => {
                    let len = decode_varint(&mut self.buf)?;
                    let len = usize::try_from(len).map_err(|_| WireError::Truncated { tag })?;
                    if len > self.buf.len() {
                        return Err(WireError::Truncated { tag });
                    }
                    let (head, rest) = self.buf.split_at(len);
                    self.buf = rest;
                    return Ok(Some((tag, FieldValue::Bytes(head))));
                }
                WireType::SixtyFourBit => self.skip(tag, 8)?,
                WireType::ThirtyTwoBit => self.skip(tag, 4)?,
                WireType::StartGroup | WireType::EndGroup => {
                    return Err(WireError::UnsupportedWireType { tag });
                }
            }
        }
    }

    fn skip(&mut self, tag: u32, n: usize) -> Result<(), WireError> {
        if self.buf.len() < n {
            return Err(WireError::Truncated { tag });
        }
        self.buf = &self.buf[n..];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_matches_protobuf_layout() {
        let mut w = TlvWriter::new();
        w.put_int32(1, 1).put_string(2, "hi");
        // key(1, varint)=0x08, 1 ; key(2, len)=0x12, len 2, "hi"
        assert_eq!(w.as_bytes(), &[0x08, 0x01, 0x12, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_negative_int32_sign_extended() {
        let mut w = TlvWriter::new();
        w.put_int32(1, -1);
        // key + ten-byte varint
        assert_eq!(w.len(), 11);
        let mut r = TlvReader::new(w.as_bytes());
        let (tag, v) = r.next_field().unwrap().unwrap();
        assert_eq!(tag, 1);
        assert_eq!(v.as_i32(1).unwrap(), -1);
    }

    #[test]
    fn test_optional_fields_skipped_when_empty() {
        let mut w = TlvWriter::new();
        w.put_string_opt(3, "").put_bytes_opt(4, &[]);
        assert!(w.is_empty());
    }

    #[test]
    fn test_reader_skips_fixed_width_fields() {
        let mut w = TlvWriter::new();
        w.put_int32(1, 5);
        let mut bytes = w.into_vec();
        // field 9, fixed64
        bytes.push((9 << 3) | 1);
        bytes.extend_from_slice(&[0u8; 8]);
        bytes.extend_from_slice(&[0x10, 0x07]);

        let mut r = TlvReader::new(&bytes);
        assert_eq!(r.next_field().unwrap(), Some((1, FieldValue::Varint(5))));
        assert_eq!(r.next_field().unwrap(), Some((2, FieldValue::Varint(7))));
        assert_eq!(r.next_field().unwrap(), None);
    }

    #[test]
    fn test_reader_rejects_truncated_length() {
        let bytes = [0x12, 0x05, b'a'];
        let mut r = TlvReader::new(&bytes);
        assert!(matches!(r.next_field(), Err(WireError::Truncated { tag: 2 })));
    }

    #[test]
    fn test_wrong_type_reported() {
        let bytes = [0x08, 0x01];
        let mut r = TlvReader::new(&bytes);
        let (tag, v) = r.next_field().unwrap().unwrap();
        assert!(matches!(v.as_bytes(tag), Err(WireError::WrongType { tag: 1 })));
    }
}
