//! Compact binary envelope codec.

use super::{for_wire, Codec, CodecError, Result};
use crate::message::Message;

/// Compact binary codec over bincode. Smallest frames of the three; not
/// self-describing, so both ends must run compatible envelope versions.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl Codec for BinaryCodec {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>> {
        bincode::serialize(&for_wire(msg)).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        let mut msg: Message =
            bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        msg.future = None;
        Ok(msg)
    }
}
