//! Codecs - serialization of headers and bodies after the handshake.
//!
//! A connection negotiates its codec by name in the option handshake;
//! [`CodecType::from_name`] is the lookup the server uses to accept or
//! reject the connection. Two codecs are built in:
//!
//! - [`CodecType::Binary`] - the default self-describing binary
//!   encoding, MessagePack in struct-as-map form (`to_vec_named`). It
//!   keeps the wire name `"application/gob"` of the protocol it speaks.
//! - [`CodecType::Json`] - plain JSON, mostly useful for eyeballing
//!   traffic.
//!
//! Codecs operate on byte slices; the record framing in
//! [`crate::protocol`] decides where a value starts and ends, so typed
//! decoding can happen wherever the concrete type is known.

mod stream;

pub use stream::{CodecReader, CodecWriter};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Payload encoding negotiated for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecType {
    /// Self-describing binary encoding (MessagePack, struct-as-map).
    Binary,
    /// JSON encoding.
    Json,
}

impl CodecType {
    /// Wire name the codec registers under.
    pub const fn name(self) -> &'static str {
        match self {
            CodecType::Binary => "application/gob",
            CodecType::Json => "application/json",
        }
    }

    /// Look a codec up by its wire name.
    pub fn from_name(name: &str) -> Option<CodecType> {
        match name {
            "application/gob" => Some(CodecType::Binary),
            "application/json" => Some(CodecType::Json),
            _ => None,
        }
    }

    /// Encode a value to bytes.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            // to_vec_named keeps struct fields by name, so both ends can
            // evolve independently of field order.
            CodecType::Binary => Ok(rmp_serde::to_vec_named(value)?),
            CodecType::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Decode a value from bytes.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            CodecType::Binary => Ok(rmp_serde::from_slice(bytes)?),
            CodecType::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}
