//! Error types for the client runtime.

use thiserror::Error;

/// Programmer errors surfaced synchronously by channel operations.
///
/// These are never recovered internally: they indicate a misuse of the API,
/// not a transport failure.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// `join` was called more than once on the same channel instance.
    #[error("tried to join multiple times; `join` can only be called once per channel")]
    AlreadyJoined,

    /// A push was attempted before the channel was ever joined.
    #[error("tried to push `{event}` to `{topic}` before joining; call `join` first")]
    NotJoined {
        /// The channel topic.
        topic: String,
        /// The event that was pushed.
        event: String,
    },
}

/// Errors produced while encoding an outbound message.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// A binary header segment exceeded the one-byte length prefix.
    #[error("{field} is {len} bytes, exceeding the 255 byte framing limit")]
    MetaTooLong {
        /// Which header segment overflowed.
        field: &'static str,
        /// The segment's byte length.
        len: usize,
    },

    /// The payload cannot be expressed in the requested wire form.
    #[error("synthesized reply payloads are inbound-only and cannot be encoded")]
    UnencodablePayload,

    /// JSON serialization failed.
    #[error("json encode failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors produced while decoding an inbound wire message.
///
/// Malformed wire data is out of contract for this runtime; the socket logs
/// the failure and drops the message rather than attempting recovery.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The text frame was not valid JSON.
    #[error("json decode failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The text frame was not a 5-element message array.
    #[error("expected a 5 element message array")]
    MalformedText,

    /// The binary frame's kind byte was not a known kind.
    #[error("unknown binary message kind: {0}")]
    UnknownKind(u8),

    /// The binary frame ended before a declared segment.
    #[error("binary message truncated reading {0}")]
    Truncated(&'static str),

    /// A header segment was not valid UTF-8.
    #[error("invalid utf8 in {0}")]
    InvalidUtf8(&'static str),
}

/// Transport-level failures.
///
/// These are recovered automatically via reconnect backoff and surfaced to
/// the application only through the socket's lifecycle callbacks.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying websocket failed.
    #[cfg(feature = "websocket")]
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The transport is no longer able to send or receive.
    #[error("transport closed")]
    Closed,

    /// Establishing the connection failed.
    #[error("connect failed: {0}")]
    Connect(String),
}
