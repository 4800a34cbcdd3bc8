//! # Kindling: multiplexed, reconnecting channels client
//!
//! Kindling is a client runtime for a request/reply-capable pub/sub
//! protocol multiplexed over one persistent transport connection. An
//! application opens many logical channels (topics) over a single
//! [`Socket`], exchanges JSON or binary-framed messages with matched
//! request/reply semantics, and recovers transparently from connection
//! loss with bounded backoff.
//!
//! # Architecture
//!
//! - [`Socket`]: owns the transport lifecycle, heartbeats, the reconnect
//!   timer, the socket-scoped ref counter, and the channel routing table
//! - [`Channel`]: per-topic join/leave state machine with a push buffer
//!   and a rejoin backoff timer
//! - [`Push`]: one outstanding request, matching its reply by ref and
//!   fanning it out to status-keyed callbacks
//! - [`Presence`]: reconciles per-key metadata lists against snapshots and
//!   diffs received over a channel
//! - [`serializer`]: the bit-exact text and binary wire codecs
//!
//! All state transitions are atomic with respect to each other, and event
//! dispatch is snapshot-then-iterate, so callbacks may freely rebind, push,
//! join, or leave.
//!
//! # Example
//!
//! ```ignore
//! use kindling::{Socket, SocketOptions, Payload};
//! use serde_json::json;
//!
//! let socket = Socket::new("wss://example.com/socket", SocketOptions::default());
//! socket.connect();
//!
//! let room = socket.channel("room:lobby", Payload::Json(json!({"token": "..."})));
//! room.on("new_msg", |payload, _ref, _join_ref| {
//!     println!("message: {payload:?}");
//! });
//! room.join(None)?
//!     .receive("ok", |_resp| println!("joined"))
//!     .receive("error", |resp| println!("join refused: {resp:?}"));
//!
//! room.push("new_msg", Payload::Json(json!({"body": "hi"})), None)?
//!     .receive("ok", |_resp| println!("acked"));
//! ```

#![deny(missing_docs)]

pub mod channel;
pub mod error;
pub mod message;
pub mod presence;
pub mod push;
pub mod serializer;
pub mod socket;
pub mod timer;
pub mod transport;

pub use channel::{Channel, ChannelState};
pub use error::{ChannelError, DecodeError, EncodeError, TransportError};
pub use message::{
    events, payload_provider, Message, Payload, PayloadProvider, RawMessage, Reply,
    HEARTBEAT_TOPIC,
};
pub use presence::{
    sync_diff, sync_state, Presence, PresenceDiff, PresenceEntry, PresenceMap, PresenceOptions,
};
pub use push::Push;
pub use socket::{CloseEvent, ConnectionState, Socket, SocketOptions};
pub use timer::{Backoff, Timer};
pub use transport::{BoxTransport, ConnectFuture, Transport, TransportConnector};
