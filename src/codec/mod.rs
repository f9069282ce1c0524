//! Pluggable envelope serialization.
//!
//! Transports are generic over any [`Codec`]: the adapter encodes whole
//! envelopes on publish and decodes inbound frames before routing. Producer
//! and consumer must agree on a format; cross-codec interoperability is not
//! provided.

use std::sync::Arc;

use serde::Deserialize;

use crate::message::Message;

mod binary;
mod json;
mod msgpack;

pub use binary::BinaryCodec;
pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors from envelope serialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}

/// Envelope serializer contract.
///
/// `encode` must not transmit `parts` or `future`; `decode` must leave
/// `future` unset. All other fields round-trip exactly. Implementations are
/// stateless and safe for concurrent use.
pub trait Codec: Send + Sync {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Message>;
}

/// Clone an envelope for the wire, dropping the fields that never cross the
/// codec boundary.
fn for_wire(msg: &Message) -> Message {
    let mut wire = msg.clone();
    wire.parts.clear();
    wire.future = None;
    wire.delivery_mark = None;
    wire
}

/// Codec discriminator for configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// JSON text encoding.
    #[default]
    Json,
    /// MessagePack binary encoding.
    Msgpack,
    /// Compact binary encoding.
    Binary,
}

/// Initialize a codec from configuration.
pub fn init_codec(kind: CodecKind) -> Arc<dyn Codec> {
    match kind {
        CodecKind::Json => Arc::new(JsonCodec),
        CodecKind::Msgpack => Arc::new(MsgPackCodec),
        CodecKind::Binary => Arc::new(BinaryCodec),
    }
}

#[cfg(test)]
mod tests;
