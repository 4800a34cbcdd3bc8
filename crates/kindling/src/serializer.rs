//! Wire-level encoding and decoding of multiplexed messages.
//!
//! Object messages travel as a JSON array `[join_ref, ref, topic, event,
//! payload]` in a text frame. Binary messages travel in a length-prefixed
//! binary frame: one kind byte, one unsigned length byte per header segment,
//! the raw segment bytes, then the payload.
//!
//! Compatibility is bit-exact: header segments are limited to 255 bytes by
//! the one-byte length prefix, and oversized segments are an encode error.

use crate::error::{DecodeError, EncodeError};
use crate::message::{events, Message, Payload, RawMessage};
use serde_json::{json, Value};

/// Binary frame kind: a push with no expected reply.
const KIND_PUSH: u8 = 0;
/// Binary frame kind: a reply correlated to a previous push.
const KIND_REPLY: u8 = 1;
/// Binary frame kind: a broadcast with no join generation.
const KIND_BROADCAST: u8 = 2;

/// Encode a message into its wire form.
///
/// Object messages become text frames, binary messages become binary
/// frames. The input is never mutated.
pub fn encode(message: &Message) -> Result<RawMessage, EncodeError> {
    match &message.payload {
        Payload::Json(value) => {
            let array = json!([
                message.join_ref,
                message.msg_ref,
                message.topic,
                message.event,
                value,
            ]);
            Ok(RawMessage::Text(serde_json::to_string(&array)?))
        }
        Payload::Binary(_) => Ok(RawMessage::Binary(binary_encode(message)?)),
        Payload::BinaryReply { .. } => Err(EncodeError::UnencodablePayload),
    }
}

/// Decode a wire frame into a message.
///
/// Decoded messages own their data; no reference into the source frame is
/// retained.
pub fn decode(raw: &RawMessage) -> Result<Message, DecodeError> {
    match raw {
        RawMessage::Text(text) => decode_text(text),
        RawMessage::Binary(bytes) => binary_decode(bytes),
    }
}

fn decode_text(text: &str) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_str(text)?;
    let parts = value
        .as_array()
        .filter(|parts| parts.len() == 5)
        .ok_or(DecodeError::MalformedText)?;
    let topic = parts[2].as_str().ok_or(DecodeError::MalformedText)?;
    let event = parts[3].as_str().ok_or(DecodeError::MalformedText)?;
    Ok(Message {
        join_ref: parts[0].as_str().map(String::from),
        msg_ref: parts[1].as_str().map(String::from),
        topic: topic.to_string(),
        event: event.to_string(),
        payload: Payload::Json(parts[4].clone()),
    })
}

/// Encode a binary message using the push-kind framing.
///
/// Binary pushes carry no ref on the wire; `msg_ref` is ignored and decodes
/// back as `None`.
pub fn binary_encode(message: &Message) -> Result<Vec<u8>, EncodeError> {
    let Payload::Binary(payload) = &message.payload else {
        return Err(EncodeError::UnencodablePayload);
    };
    let join_ref = message.join_ref.as_deref().unwrap_or("");
    check_meta("join_ref", join_ref)?;
    check_meta("topic", &message.topic)?;
    check_meta("event", &message.event)?;

    let meta_len = join_ref.len() + message.topic.len() + message.event.len();
    let mut buffer = Vec::with_capacity(4 + meta_len + payload.len());
    buffer.push(KIND_PUSH);
    buffer.push(join_ref.len() as u8);
    buffer.push(message.topic.len() as u8);
    buffer.push(message.event.len() as u8);
    buffer.extend_from_slice(join_ref.as_bytes());
    buffer.extend_from_slice(message.topic.as_bytes());
    buffer.extend_from_slice(message.event.as_bytes());
    buffer.extend_from_slice(payload);
    Ok(buffer)
}

/// Decode a binary frame by its leading kind byte.
pub fn binary_decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let (&kind, mut rest) = bytes.split_first().ok_or(DecodeError::Truncated("kind"))?;
    match kind {
        KIND_PUSH => decode_push(&mut rest),
        KIND_REPLY => decode_reply(&mut rest),
        KIND_BROADCAST => decode_broadcast(&mut rest),
        other => Err(DecodeError::UnknownKind(other)),
    }
}

fn decode_push(rest: &mut &[u8]) -> Result<Message, DecodeError> {
    let lengths = take(rest, 3, "push header")?;
    let (join_ref_len, topic_len, event_len) = (lengths[0], lengths[1], lengths[2]);
    let join_ref = take_str(rest, join_ref_len as usize, "join_ref")?;
    let topic = take_str(rest, topic_len as usize, "topic")?;
    let event = take_str(rest, event_len as usize, "event")?;
    Ok(Message {
        join_ref: non_empty(join_ref),
        msg_ref: None,
        topic,
        event,
        payload: Payload::Binary(rest.to_vec()),
    })
}

fn decode_reply(rest: &mut &[u8]) -> Result<Message, DecodeError> {
    let lengths = take(rest, 4, "reply header")?;
    let (join_ref_len, ref_len, topic_len, event_len) =
        (lengths[0], lengths[1], lengths[2], lengths[3]);
    let join_ref = take_str(rest, join_ref_len as usize, "join_ref")?;
    let msg_ref = take_str(rest, ref_len as usize, "ref")?;
    let topic = take_str(rest, topic_len as usize, "topic")?;
    let status = take_str(rest, event_len as usize, "event")?;
    Ok(Message {
        join_ref: non_empty(join_ref),
        msg_ref: non_empty(msg_ref),
        topic,
        event: events::REPLY.to_string(),
        payload: Payload::BinaryReply {
            status,
            response: rest.to_vec(),
        },
    })
}

fn decode_broadcast(rest: &mut &[u8]) -> Result<Message, DecodeError> {
    let lengths = take(rest, 2, "broadcast header")?;
    let (topic_len, event_len) = (lengths[0], lengths[1]);
    let topic = take_str(rest, topic_len as usize, "topic")?;
    let event = take_str(rest, event_len as usize, "event")?;
    Ok(Message {
        join_ref: None,
        msg_ref: None,
        topic,
        event,
        payload: Payload::Binary(rest.to_vec()),
    })
}

fn check_meta(field: &'static str, value: &str) -> Result<(), EncodeError> {
    if value.len() > u8::MAX as usize {
        return Err(EncodeError::MetaTooLong {
            field,
            len: value.len(),
        });
    }
    Ok(())
}

fn take<'a>(bytes: &mut &'a [u8], len: usize, what: &'static str) -> Result<&'a [u8], DecodeError> {
    if bytes.len() < len {
        return Err(DecodeError::Truncated(what));
    }
    let (head, tail) = bytes.split_at(len);
    *bytes = tail;
    Ok(head)
}

fn take_str(bytes: &mut &[u8], len: usize, what: &'static str) -> Result<String, DecodeError> {
    let raw = take(bytes, len, what)?;
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|_| DecodeError::InvalidUtf8(what))
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
