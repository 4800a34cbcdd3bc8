//! Per-topic join/leave state machine.
//!
//! A channel multiplexes one logical topic over the socket's transport
//! connection. It owns the join [`Push`], a buffer of pushes issued before
//! the join resolved, a rejoin backoff timer, and the ordered list of event
//! bindings inbound messages dispatch to.
//!
//! State machine: `closed → joining → joined → leaving → closed`, with
//! `errored` reachable from `joining`/`joined` on connection or reply
//! failure and `errored → joining` on a rejoin attempt. A channel is joined
//! at most once from the application's perspective; rejoins after `errored`
//! re-send the same join push under a fresh ref.

use crate::error::ChannelError;
use crate::message::{events, payload_provider, Message, Payload, PayloadProvider};
use crate::push::Push;
use crate::socket::Socket;
use crate::timer::Timer;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not joined; the initial and final state.
    Closed,
    /// A join or rejoin failed; a rejoin may be scheduled.
    Errored,
    /// The join was acknowledged; pushes flow freely.
    Joined,
    /// A join is in flight.
    Joining,
    /// A leave is in flight.
    Leaving,
}

type EventCallback = Arc<Mutex<dyn FnMut(&Payload, Option<&str>, Option<&str>) + Send>>;

struct Binding {
    event: String,
    id: u64,
    callback: EventCallback,
}

/// A handle to one channel. Clones share the same underlying channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

pub(crate) struct ChannelInner {
    topic: String,
    socket: Socket,
    join_push: Push,
    rejoin_timer: Timer,
    state: Mutex<ChannelShared>,
}

struct ChannelShared {
    state: ChannelState,
    timeout: Duration,
    joined_once: bool,
    binding_ref: u64,
    bindings: Vec<Binding>,
    push_buffer: Vec<Push>,
    socket_refs: Vec<u64>,
}

impl Channel {
    pub(crate) fn new(socket: &Socket, topic: &str, params: PayloadProvider) -> Channel {
        let timeout = socket.timeout();
        let inner = Arc::new_cyclic(|weak: &Weak<ChannelInner>| {
            let join_push = Push::new(weak.clone(), events::JOIN, params, timeout);
            let rejoin_timer = Timer::new(socket.rejoin_after(), {
                let weak = weak.clone();
                move || {
                    if let Some(channel) = Channel::from_weak(&weak) {
                        if channel.socket().is_connected() {
                            channel.rejoin(None);
                        }
                    }
                }
            });
            ChannelInner {
                topic: topic.to_string(),
                socket: socket.clone(),
                join_push,
                rejoin_timer,
                state: Mutex::new(ChannelShared {
                    state: ChannelState::Closed,
                    timeout,
                    joined_once: false,
                    binding_ref: 0,
                    bindings: Vec::new(),
                    push_buffer: Vec::new(),
                    socket_refs: Vec::new(),
                }),
            }
        });
        let channel = Channel { inner };
        channel.wire_lifecycle();
        channel
    }

    pub(crate) fn from_inner(inner: Arc<ChannelInner>) -> Channel {
        Channel { inner }
    }

    pub(crate) fn from_weak(weak: &Weak<ChannelInner>) -> Option<Channel> {
        weak.upgrade().map(Channel::from_inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<ChannelInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn ptr_eq(a: &Channel, b: &Channel) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// The topic this channel is multiplexed on.
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// The socket that owns this channel.
    pub fn socket(&self) -> &Socket {
        &self.inner.socket
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.inner.state.lock().state
    }

    /// Whether the channel is `closed`.
    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Whether the channel is `errored`.
    pub fn is_errored(&self) -> bool {
        self.state() == ChannelState::Errored
    }

    /// Whether the channel is `joined`.
    pub fn is_joined(&self) -> bool {
        self.state() == ChannelState::Joined
    }

    /// Whether a join is in flight.
    pub fn is_joining(&self) -> bool {
        self.state() == ChannelState::Joining
    }

    /// Whether a leave is in flight.
    pub fn is_leaving(&self) -> bool {
        self.state() == ChannelState::Leaving
    }

    /// The ref of the current join generation, assigned when the join push
    /// is sent and changed on every rejoin.
    pub fn join_ref(&self) -> Option<String> {
        self.inner.join_push.msg_ref()
    }

    /// Whether the channel was ever joined by the application.
    pub fn joined_once(&self) -> bool {
        self.inner.state.lock().joined_once
    }

    /// The timeout applied to joins and pushes without an explicit one.
    pub fn timeout(&self) -> Duration {
        self.inner.state.lock().timeout
    }

    /// Whether a push would transmit immediately rather than buffer.
    pub fn can_push(&self) -> bool {
        self.inner.socket.is_connected() && self.is_joined()
    }

    /// Join the channel's topic.
    ///
    /// A channel may be joined at most once per instance; later recoveries
    /// are internal rejoins of the same join push. Returns the join push so
    /// reply callbacks can be chained.
    pub fn join(&self, timeout: Option<Duration>) -> Result<Push, ChannelError> {
        {
            let mut state = self.inner.state.lock();
            if state.joined_once {
                return Err(ChannelError::AlreadyJoined);
            }
            if let Some(timeout) = timeout {
                state.timeout = timeout;
            }
            state.joined_once = true;
        }
        self.rejoin(timeout);
        Ok(self.inner.join_push.clone())
    }

    /// Push an event to the server.
    ///
    /// Fails if the channel was never joined. When the channel cannot push
    /// yet, the push is buffered with its timeout running and replayed in
    /// order once the join succeeds.
    pub fn push(
        &self,
        event: &str,
        payload: Payload,
        timeout: Option<Duration>,
    ) -> Result<Push, ChannelError> {
        self.push_provider(event, payload_provider(payload), timeout)
    }

    /// Like [`Channel::push`], with a payload provider re-invoked at each
    /// send, so the transmitted payload reflects changes made after the
    /// push was created.
    pub fn push_with(
        &self,
        event: &str,
        payload: impl Fn() -> Payload + Send + Sync + 'static,
        timeout: Option<Duration>,
    ) -> Result<Push, ChannelError> {
        self.push_provider(event, Arc::new(payload), timeout)
    }

    fn push_provider(
        &self,
        event: &str,
        payload: PayloadProvider,
        timeout: Option<Duration>,
    ) -> Result<Push, ChannelError> {
        if !self.inner.state.lock().joined_once {
            return Err(ChannelError::NotJoined {
                topic: self.inner.topic.clone(),
                event: event.to_string(),
            });
        }
        let timeout = timeout.unwrap_or_else(|| self.timeout());
        let push = Push::new(self.downgrade(), event, payload, timeout);
        if self.can_push() {
            push.send();
        } else {
            push.start_timeout();
            self.inner.state.lock().push_buffer.push(push.clone());
        }
        Ok(push)
    }

    /// Leave the topic.
    ///
    /// Sends `phx_leave` and closes the channel on the server's ack or,
    /// as a forced-close backstop, when the leave push times out. With the
    /// socket disconnected there is nothing to await, so the channel closes
    /// immediately. Returns the leave push.
    pub fn leave(&self, timeout: Option<Duration>) -> Push {
        self.inner.rejoin_timer.reset();
        self.inner.join_push.cancel_timeout();
        self.inner.state.lock().state = ChannelState::Leaving;
        tracing::debug!(topic = %self.inner.topic, "leave");

        let timeout = timeout.unwrap_or_else(|| self.timeout());
        let leave_push = Push::new(
            self.downgrade(),
            events::LEAVE,
            payload_provider(Payload::default()),
            timeout,
        );
        leave_push.receive("ok", close_callback(self.downgrade()));
        leave_push.receive("timeout", close_callback(self.downgrade()));
        leave_push.send();
        if !self.inner.socket.is_connected() {
            leave_push.trigger("ok", Payload::default());
        }
        leave_push
    }

    /// Register a callback for an event. Returns a per-channel binding ref
    /// for [`Channel::off_binding`].
    ///
    /// Callbacks receive the payload, the message ref, and the join ref.
    pub fn on(
        &self,
        event: &str,
        callback: impl FnMut(&Payload, Option<&str>, Option<&str>) + Send + 'static,
    ) -> u64 {
        let callback: EventCallback = Arc::new(Mutex::new(callback));
        let mut state = self.inner.state.lock();
        state.binding_ref += 1;
        let id = state.binding_ref;
        state.bindings.push(Binding {
            event: event.to_string(),
            id,
            callback,
        });
        id
    }

    /// Remove all bindings for an event.
    pub fn off(&self, event: &str) {
        self.inner
            .state
            .lock()
            .bindings
            .retain(|binding| binding.event != event);
    }

    /// Remove a single binding by its ref.
    pub fn off_binding(&self, event: &str, id: u64) {
        self.inner
            .state
            .lock()
            .bindings
            .retain(|binding| !(binding.event == event && binding.id == id));
    }

    /// Register a callback for the channel closing.
    pub fn on_close(&self, mut callback: impl FnMut(&Payload) + Send + 'static) -> u64 {
        self.on(events::CLOSE, move |payload, _msg_ref, _join_ref| {
            callback(payload)
        })
    }

    /// Register a callback for the channel erroring.
    pub fn on_error(&self, mut callback: impl FnMut(&Payload) + Send + 'static) -> u64 {
        self.on(events::ERROR, move |payload, _msg_ref, _join_ref| {
            callback(payload)
        })
    }

    /// Dispatch an event to the bindings registered for it.
    ///
    /// Dispatch iterates a snapshot of the matching bindings, so callbacks
    /// that add or remove bindings affect subsequent dispatches, never the
    /// one in flight.
    pub fn trigger(
        &self,
        event: &str,
        payload: Payload,
        msg_ref: Option<&str>,
        join_ref: Option<&str>,
    ) {
        let handlers: Vec<EventCallback> = {
            let state = self.inner.state.lock();
            state
                .bindings
                .iter()
                .filter(|binding| binding.event == event)
                .map(|binding| binding.callback.clone())
                .collect()
        };
        let join_ref = join_ref.map(str::to_string).or_else(|| self.join_ref());
        for handler in handlers {
            (&mut *handler.lock())(&payload, msg_ref, join_ref.as_deref());
        }
    }

    /// Whether an inbound message belongs to this channel instance.
    ///
    /// Lifecycle events carrying an outdated join ref are dropped; they
    /// belong to a previous join generation.
    pub(crate) fn is_member(&self, message: &Message) -> bool {
        if self.inner.topic != message.topic {
            return false;
        }
        if let Some(join_ref) = &message.join_ref {
            if events::is_lifecycle(&message.event)
                && Some(join_ref.as_str()) != self.join_ref().as_deref()
            {
                tracing::debug!(
                    topic = %message.topic,
                    event = %message.event,
                    join_ref = %join_ref,
                    "dropping outdated message"
                );
                return false;
            }
        }
        true
    }

    /// Re-send the join push and move to `joining`. No-op while leaving.
    pub(crate) fn rejoin(&self, timeout: Option<Duration>) {
        if self.is_leaving() {
            return;
        }
        self.inner.socket.leave_open_topic(&self.inner.topic, self);
        let timeout = timeout.unwrap_or_else(|| self.timeout());
        self.inner.state.lock().state = ChannelState::Joining;
        self.inner.join_push.resend(timeout);
    }

    pub(crate) fn reply_event_name(msg_ref: &str) -> String {
        format!("chan_reply_{msg_ref}")
    }

    pub(crate) fn take_socket_refs(&self) -> Vec<u64> {
        std::mem::take(&mut self.inner.state.lock().socket_refs)
    }

    /// Wire the join push, lifecycle bindings, and socket subscriptions that
    /// drive the state machine.
    fn wire_lifecycle(&self) {
        let weak = self.downgrade();

        // reconnects reset the rejoin backoff; a fresh connection rejoins an
        // errored channel immediately
        let error_ref = self.inner.socket.on_error({
            let weak = weak.clone();
            move |_error| {
                if let Some(channel) = Channel::from_weak(&weak) {
                    channel.inner.rejoin_timer.reset();
                }
            }
        });
        let open_ref = self.inner.socket.on_open({
            let weak = weak.clone();
            move || {
                if let Some(channel) = Channel::from_weak(&weak) {
                    channel.inner.rejoin_timer.reset();
                    if channel.is_errored() {
                        channel.rejoin(None);
                    }
                }
            }
        });
        self.inner.state.lock().socket_refs = vec![error_ref, open_ref];

        self.inner.join_push.receive("ok", {
            let weak = weak.clone();
            move |_response| {
                let Some(channel) = Channel::from_weak(&weak) else {
                    return;
                };
                let buffered = {
                    let mut state = channel.inner.state.lock();
                    state.state = ChannelState::Joined;
                    std::mem::take(&mut state.push_buffer)
                };
                channel.inner.rejoin_timer.reset();
                for push in buffered {
                    push.send();
                }
            }
        });

        self.inner.join_push.receive("error", {
            let weak = weak.clone();
            move |_response| {
                let Some(channel) = Channel::from_weak(&weak) else {
                    return;
                };
                channel.inner.state.lock().state = ChannelState::Errored;
                if channel.socket().is_connected() {
                    channel.inner.rejoin_timer.schedule_timeout();
                }
            }
        });

        self.inner.join_push.receive("timeout", {
            let weak = weak.clone();
            move |_response| {
                let Some(channel) = Channel::from_weak(&weak) else {
                    return;
                };
                tracing::debug!(
                    topic = %channel.inner.topic,
                    timeout = ?channel.timeout(),
                    "join timed out"
                );
                if channel.socket().is_connected() {
                    // best-effort notification so the server can clean up
                    // the half-open join
                    let leave = Push::new(
                        channel.downgrade(),
                        events::LEAVE,
                        payload_provider(Payload::default()),
                        channel.timeout(),
                    );
                    leave.send();
                }
                channel.inner.state.lock().state = ChannelState::Errored;
                channel.inner.join_push.reset();
                if channel.socket().is_connected() {
                    channel.inner.rejoin_timer.schedule_timeout();
                }
            }
        });

        self.on_close({
            let weak = weak.clone();
            move |_payload| {
                let Some(channel) = Channel::from_weak(&weak) else {
                    return;
                };
                channel.inner.rejoin_timer.reset();
                tracing::debug!(
                    topic = %channel.inner.topic,
                    join_ref = ?channel.join_ref(),
                    "channel closed"
                );
                channel.inner.state.lock().state = ChannelState::Closed;
                channel.inner.socket.remove(&channel);
            }
        });

        self.on_error({
            let weak = weak.clone();
            move |payload| {
                let Some(channel) = Channel::from_weak(&weak) else {
                    return;
                };
                if channel.is_leaving() || channel.is_closed() {
                    return;
                }
                tracing::debug!(
                    topic = %channel.inner.topic,
                    reason = ?payload,
                    "channel errored"
                );
                if channel.is_joining() {
                    channel.inner.join_push.reset();
                }
                channel.inner.state.lock().state = ChannelState::Errored;
                if channel.socket().is_connected() {
                    channel.inner.rejoin_timer.schedule_timeout();
                }
            }
        });

        // replies re-dispatch to the one-shot binding registered under the
        // originating push's ref
        self.on(events::REPLY, move |payload, msg_ref, _join_ref| {
            if let (Some(channel), Some(msg_ref)) = (Channel::from_weak(&weak), msg_ref) {
                channel.trigger(
                    &Channel::reply_event_name(msg_ref),
                    payload.clone(),
                    None,
                    None,
                );
            }
        });
    }
}

fn close_callback(weak: Weak<ChannelInner>) -> impl FnMut(&Payload) + Send + 'static {
    move |_response| {
        if let Some(channel) = Channel::from_weak(&weak) {
            channel.trigger(events::CLOSE, Payload::Json(json!("leave")), None, None);
        }
    }
}
