#![forbid(unsafe_code)]

pub mod hash;
pub mod wire;
pub mod encoding;
pub mod ids;
pub mod keys;

pub mod aead;
pub mod hybrid;
pub mod envelope;
pub mod envelope_codec;
pub mod keycard;
pub mod streaming;

pub mod utils;

#[cfg(test)]
mod proptests;
