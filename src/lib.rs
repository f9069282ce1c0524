//! Relaybus - multi-transport message bus
//!
//! Brokers topic-addressed messages among in-process subscribers and across
//! external transports. Local fan-out runs through per-topic [`Mailbox`]es;
//! remote delivery goes through a Redis adapter in two shapes (broadcast over
//! Pub/Sub, competing consumers over Streams) or through a resumable SSE
//! streaming client. All transports share the [`Message`] envelope and the
//! pluggable [`Codec`] contract.

pub mod bus;
pub mod codec;
pub mod message;
pub mod sse;
pub mod utils;

// Re-export common types for library usage
pub use bus::mailbox::{Channel, DispatchOutcome, Mailbox, OverflowPolicy};
pub use bus::redis::{RedisBus, RedisBusConfig};
pub use bus::{init_bus, Bus, BusConfig, BusError, BusHandle, BusVariant};
pub use bus::{HandlerError, MessageHandler, Transport};
pub use codec::{init_codec, BinaryCodec, Codec, CodecError, CodecKind, JsonCodec, MsgPackCodec};
pub use message::{Message, Part, ReplyFuture, Topic, REPLY_SUFFIX};
pub use sse::{SseClient, SseConfig, SseConnector, SseError, SseHandler};
pub use utils::retry::{RetryConfig, RetryFunc};
