//! JSON envelope codec.

use super::{for_wire, Codec, CodecError, Result};
use crate::message::Message;

/// JSON codec. Human-readable; binary bodies serialize as byte arrays.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>> {
        serde_json::to_vec(&for_wire(msg)).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        let mut msg: Message =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        msg.future = None;
        Ok(msg)
    }
}
