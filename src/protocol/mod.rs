//! Wire protocol: handshake options, the per-call header, and the
//! length-prefixed record framing both sides speak.
//!
//! One connection carries, in order:
//!
//! ```text
//! | Options as one line of JSON |  Header | Body |  Header | Body | ...
//! | <---- fixed encoding ---->  |  <- negotiated codec, framed ->
//! ```
//!
//! The option line is always JSON so the two ends can negotiate the
//! codec that everything after it is encoded with. Requests and
//! responses interleave freely; a response is matched to its request by
//! `seq` alone.

mod options;
mod record;

pub use options::Options;
pub(crate) use options::{read_options, write_options};
pub(crate) use record::{read_record, write_record};
pub use record::DEFAULT_MAX_RECORD_SIZE;

use serde::{Deserialize, Serialize};

/// First field of every option handshake; connections carrying anything
/// else are not speaking this protocol and are dropped on the spot.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Header preceding every request body and every response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Header {
    /// Qualified method name, formatted `"Service.Method"`.
    pub service_method: String,
    /// Client-chosen sequence number identifying the call.
    pub seq: u64,
    /// Empty on success; otherwise the error the callee produced.
    pub error: String,
}

impl Header {
    /// Header for an outgoing request.
    pub(crate) fn request(service_method: &str, seq: u64) -> Self {
        Self {
            service_method: service_method.to_string(),
            seq,
            error: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_has_no_error() {
        let h = Header::request("Foo.Sum", 7);
        assert_eq!(h.service_method, "Foo.Sum");
        assert_eq!(h.seq, 7);
        assert!(h.error.is_empty());
    }

    #[test]
    fn header_serializes_with_wire_field_names() {
        let h = Header::request("Foo.Sum", 1);
        let json = serde_json::to_string(&h).unwrap();
        assert!(json.contains("\"ServiceMethod\""));
        assert!(json.contains("\"Seq\""));
        assert!(json.contains("\"Error\""));
    }
}
