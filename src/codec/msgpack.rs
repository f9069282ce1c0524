//! MessagePack envelope codec.

use super::{for_wire, Codec, CodecError, Result};
use crate::message::Message;

/// MessagePack codec. Field-named maps so envelopes tolerate field
/// reordering across versions.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(&for_wire(msg)).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        let mut msg: Message =
            rmp_serde::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        msg.future = None;
        Ok(msg)
    }
}
