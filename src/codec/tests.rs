use super::*;
use crate::message::{Message, Part, ReplyFuture};

fn codecs() -> Vec<(&'static str, Arc<dyn Codec>)> {
    vec![
        ("json", init_codec(CodecKind::Json)),
        ("msgpack", init_codec(CodecKind::Msgpack)),
        ("binary", init_codec(CodecKind::Binary)),
    ]
}

fn sample_message() -> Message {
    Message::new("why", "me", Vec::new())
        .with_bytes("yes")
        .with_reply_group("*")
        .with_metadata("trace", "abc-123")
}

#[test]
fn test_round_trip_all_fields() {
    for (name, codec) in codecs() {
        let msg = sample_message();
        let bytes = codec.encode(&msg).unwrap();
        let decoded = codec.decode(&bytes).unwrap();

        assert_eq!(decoded, msg, "codec {name}");
        assert_eq!(decoded.id, msg.id, "codec {name}");
        assert_eq!(decoded.topic.as_str(), "why", "codec {name}");
        assert_eq!(decoded.from_addr, "me", "codec {name}");
        assert_eq!(decoded.bytes, b"yes", "codec {name}");
        assert_eq!(decoded.reply_group, "*", "codec {name}");
    }
}

#[test]
fn test_parts_and_future_are_stripped() {
    for (name, codec) in codecs() {
        let mut msg = sample_message();
        msg.parts.push(Part {
            name: "upload".to_string(),
            content_type: "application/octet-stream".to_string(),
            data: vec![0xDE, 0xAD],
        });
        msg.future = Some(ReplyFuture::new());
        msg.delivery_mark = Some("1-1".to_string());

        let bytes = codec.encode(&msg).unwrap();
        let decoded = codec.decode(&bytes).unwrap();

        assert!(decoded.parts.is_empty(), "codec {name}");
        assert!(decoded.future.is_none(), "codec {name}");
        assert!(decoded.delivery_mark.is_none(), "codec {name}");
        assert_eq!(decoded.id, msg.id, "codec {name}");
    }
}

#[test]
fn test_encode_does_not_mutate_original() {
    let codec = JsonCodec;
    let mut msg = sample_message();
    msg.parts.push(Part::default());
    msg.future = Some(ReplyFuture::new());

    codec.encode(&msg).unwrap();

    assert_eq!(msg.parts.len(), 1);
    assert!(msg.future.is_some());
}

#[test]
fn test_decode_garbage_errors() {
    for (name, codec) in codecs() {
        let result = codec.decode(b"\xFF\xFEnot an envelope");
        assert!(
            matches!(result, Err(CodecError::Decode(_))),
            "codec {name}"
        );
    }
}
