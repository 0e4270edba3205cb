// omsp-protocol: OMSP wire types and codecs.
//
// Everything both peers must agree on lives here: the scalar value model,
// the schema grammar, the header-block grammar, and the text and binary
// sample framings.  The client and the collector link this crate and
// nothing else protocol-related.

pub mod binary;
pub mod header;
pub mod schema;
pub mod text;
pub mod value;

pub use header::ContentMode;
pub use schema::{FieldDef, Schema, SchemaError, valid_name};
pub use value::{Value, ValueKind};

/// Protocol version emitted by clients.
pub const PROTOCOL_VERSION: u32 = 4;

/// Oldest protocol version the collector accepts.
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Newest protocol version the collector accepts.
pub const MAX_PROTOCOL_VERSION: u32 = 4;

/// Default TCP service for collection when the URI names none.
pub const DEFAULT_COLLECT_PORT: u16 = 3003;

/// Errors raised while encoding or decoding sample frames (either framing).
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("truncated frame")]
    Truncated,
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
    #[error("unknown value marker 0x{0:02x}")]
    UnknownMarker(u8),
    #[error("value is not valid UTF-8")]
    BadUtf8,
    #[error("cannot parse '{input}' as {kind}")]
    BadField { kind: ValueKind, input: String },
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}
