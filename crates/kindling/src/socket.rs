//! Connection supervisor.
//!
//! The [`Socket`] owns the transport lifecycle for one endpoint: the
//! connection task, the heartbeat, the reconnect backoff timer, the
//! monotonic ref counter refs are drawn from, and the table of live
//! channels inbound messages are routed to. Transport failures are never
//! surfaced as errors to callers; they flow through the lifecycle callbacks
//! and the reconnect schedule.

use crate::channel::Channel;
use crate::error::TransportError;
use crate::message::{events, payload_provider, Message, Payload, PayloadProvider, RawMessage};
use crate::serializer;
use crate::timer::{Backoff, Timer};
use crate::transport::TransportConnector;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Configuration for a [`Socket`].
#[derive(Clone)]
pub struct SocketOptions {
    /// Default timeout for joins and pushes.
    pub timeout: Duration,
    /// Interval between heartbeats on the system topic.
    pub heartbeat_interval: Duration,
    /// Backoff schedule for reconnect attempts.
    pub reconnect_after: Backoff,
    /// Backoff schedule channels use for rejoin attempts.
    pub rejoin_after: Backoff,
    /// Connection params appended to the endpoint URL as query pairs.
    /// Values are appended verbatim and must be URL-safe.
    pub params: Vec<(String, String)>,
    /// Transport factory. Defaults to the WebSocket connector when the
    /// `websocket` feature is enabled.
    pub connector: Option<TransportConnector>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_after: Backoff::default_reconnect(),
            rejoin_after: Backoff::default_rejoin(),
            params: Vec::new(),
            connector: None,
        }
    }
}

impl SocketOptions {
    /// Set the default join/push timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the reconnect backoff schedule.
    pub fn reconnect_after(mut self, backoff: Backoff) -> Self {
        self.reconnect_after = backoff;
        self
    }

    /// Set the rejoin backoff schedule.
    pub fn rejoin_after(mut self, backoff: Backoff) -> Self {
        self.rejoin_after = backoff;
        self
    }

    /// Append a connection param.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Replace the transport connector.
    pub fn connector(mut self, connector: TransportConnector) -> Self {
        self.connector = Some(connector);
        self
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none in flight.
    Closed,
    /// A connection attempt is in flight.
    Connecting,
    /// The transport is open.
    Open,
}

/// Details delivered to close lifecycle callbacks.
#[derive(Debug, Clone)]
pub struct CloseEvent {
    /// Whether the close was an intentional client-initiated disconnect.
    pub was_clean: bool,
    /// Human-readable close reason.
    pub reason: String,
}

type OpenCallback = Arc<Mutex<dyn FnMut() + Send>>;
type CloseCallback = Arc<Mutex<dyn FnMut(&CloseEvent) + Send>>;
type ErrorCallback = Arc<Mutex<dyn FnMut(&TransportError) + Send>>;
type MessageCallback = Arc<Mutex<dyn FnMut(&Message) + Send>>;

#[derive(Default)]
struct SocketCallbacks {
    open: Vec<(u64, OpenCallback)>,
    close: Vec<(u64, CloseCallback)>,
    error: Vec<(u64, ErrorCallback)>,
    message: Vec<(u64, MessageCallback)>,
}

struct Conn {
    tx: mpsc::UnboundedSender<RawMessage>,
    heartbeat: Option<JoinHandle<()>>,
    open: bool,
}

impl Drop for Conn {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

#[derive(Default)]
struct SocketShared {
    channels: Vec<Channel>,
    conn: Option<Conn>,
    conn_id: u64,
    closed_reported: u64,
    pending_heartbeat_ref: Option<String>,
}

/// A handle to one socket. Clones share the same underlying connection.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

pub(crate) struct SocketInner {
    endpoint: String,
    timeout: Duration,
    heartbeat_interval: Duration,
    rejoin_after: Backoff,
    params: Vec<(String, String)>,
    connector: Option<TransportConnector>,
    ref_counter: AtomicU64,
    callback_ref: AtomicU64,
    closing_cleanly: AtomicBool,
    reconnect_timer: Timer,
    state: Mutex<SocketShared>,
    callbacks: Mutex<SocketCallbacks>,
}

impl Socket {
    /// Create a socket for an endpoint. Nothing connects until
    /// [`Socket::connect`].
    pub fn new(endpoint: impl Into<String>, options: SocketOptions) -> Socket {
        let SocketOptions {
            timeout,
            heartbeat_interval,
            reconnect_after,
            rejoin_after,
            params,
            connector,
        } = options;
        let connector = connector.or_else(default_connector);
        let inner = Arc::new_cyclic(|weak: &Weak<SocketInner>| {
            let reconnect_timer = Timer::new(reconnect_after, {
                let weak = weak.clone();
                move || {
                    if let Some(socket) = Socket::from_weak(&weak) {
                        socket.connect();
                    }
                }
            });
            SocketInner {
                endpoint: endpoint.into(),
                timeout,
                heartbeat_interval,
                rejoin_after,
                params,
                connector,
                ref_counter: AtomicU64::new(0),
                callback_ref: AtomicU64::new(0),
                closing_cleanly: AtomicBool::new(false),
                reconnect_timer,
                state: Mutex::new(SocketShared::default()),
                callbacks: Mutex::new(SocketCallbacks::default()),
            }
        });
        Socket { inner }
    }

    pub(crate) fn from_weak(weak: &Weak<SocketInner>) -> Option<Socket> {
        weak.upgrade().map(|inner| Socket { inner })
    }

    /// The configured endpoint.
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// The resolved URL dialed on connect: the endpoint with any `http`
    /// scheme mapped to `ws`, plus the protocol version and connection
    /// params as query pairs.
    pub fn endpoint_url(&self) -> String {
        let mut url = self.inner.endpoint.clone();
        if let Some(rest) = url.strip_prefix("http") {
            url = format!("ws{rest}");
        }
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str("vsn=2.0.0");
        for (key, value) in &self.inner.params {
            url.push('&');
            url.push_str(key);
            url.push('=');
            url.push_str(value);
        }
        url
    }

    /// The default join/push timeout channels inherit.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub(crate) fn rejoin_after(&self) -> Backoff {
        self.inner.rejoin_after.clone()
    }

    /// Whether the transport is open.
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Open
    }

    /// The current connection lifecycle state.
    pub fn connection_state(&self) -> ConnectionState {
        match self.inner.state.lock().conn.as_ref() {
            None => ConnectionState::Closed,
            Some(conn) if conn.open => ConnectionState::Open,
            Some(_) => ConnectionState::Connecting,
        }
    }

    /// Draw the next ref from the socket's monotonic counter.
    ///
    /// Refs are unique for the lifetime of the socket and shared across all
    /// of its channels, so stale refs from a previous join generation can
    /// never match replies from a newer one.
    pub fn make_ref(&self) -> String {
        (self.inner.ref_counter.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    /// Open the transport. Idempotent while a connection exists or is in
    /// flight.
    pub fn connect(&self) {
        let Some(connector) = self.inner.connector.clone() else {
            tracing::error!(
                "no transport connector configured; enable the `websocket` feature or provide one"
            );
            return;
        };
        let url = self.endpoint_url();
        let mut state = self.inner.state.lock();
        if state.conn.is_some() {
            return;
        }
        self.inner.closing_cleanly.store(false, Ordering::SeqCst);
        state.conn_id += 1;
        let conn_id = state.conn_id;
        let (tx, rx) = mpsc::unbounded_channel();
        state.conn = Some(Conn {
            tx,
            heartbeat: None,
            open: false,
        });
        tracing::debug!(url = %url, "connecting");
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(run_connection(weak, conn_id, connector, url, rx));
    }

    /// Close the transport intentionally. No reconnect is scheduled.
    pub fn disconnect(&self) {
        self.inner.closing_cleanly.store(true, Ordering::SeqCst);
        self.inner.reconnect_timer.reset();
        let conn_id = self.inner.state.lock().conn_id;
        self.conn_closed(
            conn_id,
            CloseEvent {
                was_clean: true,
                reason: "client disconnect".to_string(),
            },
        );
    }

    /// Encode and transmit a message if connected, else drop it.
    ///
    /// The socket never buffers; pushes issued while disconnected are held
    /// at the channel level and replayed after the join resolves.
    pub fn push(&self, message: Message) {
        tracing::debug!(
            topic = %message.topic,
            event = %message.event,
            msg_ref = ?message.msg_ref,
            join_ref = ?message.join_ref,
            "push"
        );
        let raw = match serializer::encode(&message) {
            Ok(raw) => raw,
            Err(error) => {
                tracing::warn!(error = %error, "failed to encode message; dropping");
                return;
            }
        };
        let state = self.inner.state.lock();
        match state.conn.as_ref() {
            Some(conn) if conn.open => {
                let _ = conn.tx.send(raw);
            }
            _ => tracing::debug!(
                topic = %message.topic,
                event = %message.event,
                "not connected; message dropped"
            ),
        }
    }

    /// Return the live channel for a topic, or create and register one.
    ///
    /// An existing non-closed instance is reused in place so mid-flight
    /// rejoins keep their state.
    pub fn channel(&self, topic: &str, params: Payload) -> Channel {
        self.channel_provider(topic, payload_provider(params))
    }

    /// Like [`Socket::channel`], with join params provided lazily at each
    /// (re)join.
    pub fn channel_with(
        &self,
        topic: &str,
        params: impl Fn() -> Payload + Send + Sync + 'static,
    ) -> Channel {
        self.channel_provider(topic, Arc::new(params))
    }

    fn channel_provider(&self, topic: &str, params: PayloadProvider) -> Channel {
        let mut state = self.inner.state.lock();
        if let Some(existing) = state
            .channels
            .iter()
            .find(|channel| channel.topic() == topic && !channel.is_closed())
        {
            return existing.clone();
        }
        let channel = Channel::new(self, topic, params);
        state.channels.push(channel.clone());
        channel
    }

    /// Leave any other joined or joining instance of a topic, so a new join
    /// can take the topic over.
    pub(crate) fn leave_open_topic(&self, topic: &str, joining: &Channel) {
        let duplicate = {
            let state = self.inner.state.lock();
            state
                .channels
                .iter()
                .find(|channel| {
                    channel.topic() == topic
                        && (channel.is_joined() || channel.is_joining())
                        && !Channel::ptr_eq(channel, joining)
                })
                .cloned()
        };
        if let Some(duplicate) = duplicate {
            tracing::warn!(topic = %topic, "leaving duplicate topic");
            duplicate.leave(None);
        }
    }

    /// Drop a channel from the routing table and its socket subscriptions.
    pub(crate) fn remove(&self, channel: &Channel) {
        let refs = channel.take_socket_refs();
        self.off(&refs);
        self.inner
            .state
            .lock()
            .channels
            .retain(|other| !Channel::ptr_eq(other, channel));
    }

    /// Register a callback invoked when the transport opens.
    pub fn on_open(&self, callback: impl FnMut() + Send + 'static) -> u64 {
        let callback: OpenCallback = Arc::new(Mutex::new(callback));
        let id = self.next_callback_ref();
        self.inner.callbacks.lock().open.push((id, callback));
        id
    }

    /// Register a callback invoked when the transport closes.
    pub fn on_close(&self, callback: impl FnMut(&CloseEvent) + Send + 'static) -> u64 {
        let callback: CloseCallback = Arc::new(Mutex::new(callback));
        let id = self.next_callback_ref();
        self.inner.callbacks.lock().close.push((id, callback));
        id
    }

    /// Register a callback invoked on transport errors.
    pub fn on_error(&self, callback: impl FnMut(&TransportError) + Send + 'static) -> u64 {
        let callback: ErrorCallback = Arc::new(Mutex::new(callback));
        let id = self.next_callback_ref();
        self.inner.callbacks.lock().error.push((id, callback));
        id
    }

    /// Register a callback invoked for every decoded inbound message, after
    /// channel routing.
    pub fn on_message(&self, callback: impl FnMut(&Message) + Send + 'static) -> u64 {
        let callback: MessageCallback = Arc::new(Mutex::new(callback));
        let id = self.next_callback_ref();
        self.inner.callbacks.lock().message.push((id, callback));
        id
    }

    /// Remove lifecycle callbacks by the refs their registrations returned.
    pub fn off(&self, refs: &[u64]) {
        let mut callbacks = self.inner.callbacks.lock();
        callbacks.open.retain(|(id, _)| !refs.contains(id));
        callbacks.close.retain(|(id, _)| !refs.contains(id));
        callbacks.error.retain(|(id, _)| !refs.contains(id));
        callbacks.message.retain(|(id, _)| !refs.contains(id));
    }

    fn next_callback_ref(&self) -> u64 {
        self.inner.callback_ref.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn conn_opened(&self, conn_id: u64) {
        {
            let mut state = self.inner.state.lock();
            if conn_id != state.conn_id {
                return;
            }
            if state.conn.is_none() {
                return;
            }
            state.pending_heartbeat_ref = None;
            let conn = state.conn.as_mut().unwrap();
            conn.open = true;
            let weak = Arc::downgrade(&self.inner);
            conn.heartbeat = Some(tokio::spawn(run_heartbeat(
                weak,
                conn_id,
                self.inner.heartbeat_interval,
            )));
        }
        tracing::debug!(endpoint = %self.inner.endpoint, "connected");
        self.inner.reconnect_timer.reset();
        let hooks: Vec<OpenCallback> = {
            let callbacks = self.inner.callbacks.lock();
            callbacks.open.iter().map(|(_, hook)| hook.clone()).collect()
        };
        for hook in hooks {
            (&mut *hook.lock())();
        }
    }

    fn conn_closed(&self, conn_id: u64, event: CloseEvent) {
        {
            let mut state = self.inner.state.lock();
            if conn_id != state.conn_id || state.closed_reported == conn_id {
                return;
            }
            state.closed_reported = conn_id;
            state.pending_heartbeat_ref = None;
            // dropping the writer winds the connection task down
            state.conn = None;
        }
        tracing::debug!(clean = event.was_clean, reason = %event.reason, "connection closed");
        let hooks: Vec<CloseCallback> = {
            let callbacks = self.inner.callbacks.lock();
            callbacks.close.iter().map(|(_, hook)| hook.clone()).collect()
        };
        for hook in hooks {
            (&mut *hook.lock())(&event);
        }
        self.trigger_chan_error(&event.reason);
        if !self.inner.closing_cleanly.load(Ordering::SeqCst) {
            self.inner.reconnect_timer.schedule_timeout();
        }
    }

    fn conn_error(&self, conn_id: u64, error: &TransportError) {
        {
            let state = self.inner.state.lock();
            if conn_id != state.conn_id {
                return;
            }
        }
        tracing::warn!(error = %error, "transport error");
        let hooks: Vec<ErrorCallback> = {
            let callbacks = self.inner.callbacks.lock();
            callbacks.error.iter().map(|(_, hook)| hook.clone()).collect()
        };
        for hook in hooks {
            (&mut *hook.lock())(error);
        }
        self.trigger_chan_error(&error.to_string());
    }

    fn conn_message(&self, raw: RawMessage) {
        let message = match serializer::decode(&raw) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(error = %error, "failed to decode message; dropping");
                return;
            }
        };
        {
            let mut state = self.inner.state.lock();
            if message.msg_ref.is_some() && message.msg_ref == state.pending_heartbeat_ref {
                state.pending_heartbeat_ref = None;
            }
        }
        tracing::debug!(
            topic = %message.topic,
            event = %message.event,
            msg_ref = ?message.msg_ref,
            "receive"
        );
        let channels = { self.inner.state.lock().channels.clone() };
        for channel in channels
            .iter()
            .filter(|channel| channel.is_member(&message))
        {
            channel.trigger(
                &message.event,
                message.payload.clone(),
                message.msg_ref.as_deref(),
                message.join_ref.as_deref(),
            );
        }
        let hooks: Vec<MessageCallback> = {
            let callbacks = self.inner.callbacks.lock();
            callbacks
                .message
                .iter()
                .map(|(_, hook)| hook.clone())
                .collect()
        };
        for hook in hooks {
            (&mut *hook.lock())(&message);
        }
    }

    /// Move every channel that is not already errored, leaving, or closed
    /// into `errored` so it schedules its own recovery.
    fn trigger_chan_error(&self, reason: &str) {
        let channels = { self.inner.state.lock().channels.clone() };
        for channel in channels {
            if !(channel.is_errored() || channel.is_leaving() || channel.is_closed()) {
                channel.trigger(
                    events::ERROR,
                    Payload::Json(Value::String(reason.to_string())),
                    None,
                    None,
                );
            }
        }
    }

    /// One heartbeat tick. Returns false when the loop should stop.
    fn send_heartbeat(&self, conn_id: u64) -> bool {
        enum Beat {
            Stop,
            Stale,
            Send(String),
        }
        let action = {
            let mut state = self.inner.state.lock();
            if conn_id != state.conn_id || !state.conn.as_ref().is_some_and(|conn| conn.open) {
                Beat::Stop
            } else if state.pending_heartbeat_ref.is_some() {
                state.pending_heartbeat_ref = None;
                Beat::Stale
            } else {
                let msg_ref = self.make_ref();
                state.pending_heartbeat_ref = Some(msg_ref.clone());
                Beat::Send(msg_ref)
            }
        };
        match action {
            Beat::Stop => false,
            Beat::Stale => {
                tracing::warn!("heartbeat reply never arrived; closing connection");
                self.conn_closed(
                    conn_id,
                    CloseEvent {
                        was_clean: false,
                        reason: "heartbeat timeout".to_string(),
                    },
                );
                false
            }
            Beat::Send(msg_ref) => {
                self.push(Message::heartbeat(msg_ref));
                true
            }
        }
    }
}

#[cfg(feature = "websocket")]
fn default_connector() -> Option<TransportConnector> {
    Some(crate::transport::websocket::connector())
}

#[cfg(not(feature = "websocket"))]
fn default_connector() -> Option<TransportConnector> {
    None
}

async fn run_heartbeat(weak: Weak<SocketInner>, conn_id: u64, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(socket) = Socket::from_weak(&weak) else {
            return;
        };
        if !socket.send_heartbeat(conn_id) {
            return;
        }
    }
}

async fn run_connection(
    weak: Weak<SocketInner>,
    conn_id: u64,
    connector: TransportConnector,
    url: String,
    mut outgoing: mpsc::UnboundedReceiver<RawMessage>,
) {
    let mut transport = match connector(url).await {
        Ok(transport) => transport,
        Err(error) => {
            if let Some(socket) = Socket::from_weak(&weak) {
                socket.conn_error(conn_id, &error);
                socket.conn_closed(
                    conn_id,
                    CloseEvent {
                        was_clean: false,
                        reason: error.to_string(),
                    },
                );
            }
            return;
        }
    };
    match Socket::from_weak(&weak) {
        Some(socket) => socket.conn_opened(conn_id),
        None => return,
    }
    loop {
        tokio::select! {
            outbound = outgoing.recv() => match outbound {
                Some(raw) => {
                    if let Err(error) = transport.send(raw).await {
                        if let Some(socket) = Socket::from_weak(&weak) {
                            socket.conn_error(conn_id, &error);
                            socket.conn_closed(conn_id, CloseEvent {
                                was_clean: false,
                                reason: error.to_string(),
                            });
                        }
                        return;
                    }
                }
                // writer dropped: the socket discarded this connection
                None => {
                    transport.close().await;
                    return;
                }
            },
            inbound = transport.recv() => match inbound {
                Ok(Some(raw)) => {
                    let Some(socket) = Socket::from_weak(&weak) else {
                        return;
                    };
                    socket.conn_message(raw);
                }
                Ok(None) => {
                    if let Some(socket) = Socket::from_weak(&weak) {
                        socket.conn_closed(conn_id, CloseEvent {
                            was_clean: false,
                            reason: "connection closed by server".to_string(),
                        });
                    }
                    return;
                }
                Err(error) => {
                    if let Some(socket) = Socket::from_weak(&weak) {
                        socket.conn_error(conn_id, &error);
                        socket.conn_closed(conn_id, CloseEvent {
                            was_clean: false,
                            reason: error.to_string(),
                        });
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoint_url_carries_the_protocol_version() {
        let socket = Socket::new("ws://example.com/socket", SocketOptions::default());
        assert_eq!(socket.endpoint_url(), "ws://example.com/socket?vsn=2.0.0");
    }

    #[test]
    fn endpoint_url_maps_http_schemes_and_appends_params() {
        let socket = Socket::new(
            "https://example.com/socket",
            SocketOptions::default()
                .param("token", "abc")
                .param("room", "7"),
        );
        assert_eq!(
            socket.endpoint_url(),
            "wss://example.com/socket?vsn=2.0.0&token=abc&room=7"
        );
    }

    #[test]
    fn refs_are_monotonic_and_socket_scoped() {
        let socket = Socket::new("ws://example.com/socket", SocketOptions::default());
        assert_eq!(socket.make_ref(), "1");
        assert_eq!(socket.make_ref(), "2");

        // a second socket owns an independent sequence
        let other = Socket::new("ws://example.com/socket", SocketOptions::default());
        assert_eq!(other.make_ref(), "1");
        assert_eq!(socket.make_ref(), "3");
    }

    #[tokio::test]
    async fn channel_reuses_the_live_instance_for_a_topic() {
        let socket = Socket::new("ws://example.com/socket", SocketOptions::default());
        let first = socket.channel("room:lobby", Payload::Json(json!({})));
        let again = socket.channel("room:lobby", Payload::Json(json!({})));
        assert!(Channel::ptr_eq(&first, &again));

        let other = socket.channel("room:other", Payload::Json(json!({})));
        assert!(!Channel::ptr_eq(&first, &other));
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let socket = Socket::new("ws://example.com/socket", SocketOptions::default());
        assert_eq!(socket.connection_state(), ConnectionState::Closed);
        assert!(!socket.is_connected());
    }
}
