//! One outstanding request on a channel.
//!
//! A [`Push`] owns the timeout timer for a single send, matches its reply by
//! ref, and fans the reply out to status-keyed callbacks. The ref is
//! assigned at send time, not at construction, so a push can be re-sent
//! under a fresh ref after a rejoin.

use crate::channel::{Channel, ChannelInner};
use crate::message::{Message, Payload, PayloadProvider, Reply};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

type ReplyCallback = Arc<Mutex<dyn FnMut(&Payload) + Send>>;

struct RecHook {
    status: String,
    callback: ReplyCallback,
    fired: bool,
}

/// One outstanding request on a channel.
#[derive(Clone)]
pub struct Push {
    inner: Arc<PushInner>,
}

pub(crate) struct PushInner {
    channel: Weak<ChannelInner>,
    event: String,
    payload: PayloadProvider,
    state: Mutex<PushState>,
}

struct PushState {
    timeout: Duration,
    msg_ref: Option<String>,
    ref_event: Option<String>,
    received: Option<Reply>,
    sent: bool,
    timeout_task: Option<JoinHandle<()>>,
    rec_hooks: Vec<RecHook>,
}

impl Push {
    pub(crate) fn new(
        channel: Weak<ChannelInner>,
        event: impl Into<String>,
        payload: PayloadProvider,
        timeout: Duration,
    ) -> Push {
        Push {
            inner: Arc::new(PushInner {
                channel,
                event: event.into(),
                payload,
                state: Mutex::new(PushState {
                    timeout,
                    msg_ref: None,
                    ref_event: None,
                    received: None,
                    sent: false,
                    timeout_task: None,
                    rec_hooks: Vec::new(),
                }),
            }),
        }
    }

    /// The event this push sends.
    pub fn event(&self) -> &str {
        &self.inner.event
    }

    /// The ref assigned at send time, if the push has been sent.
    pub fn msg_ref(&self) -> Option<String> {
        self.inner.state.lock().msg_ref.clone()
    }

    /// Whether the push has been transmitted since its last reset.
    pub fn is_sent(&self) -> bool {
        self.inner.state.lock().sent
    }

    /// Whether a reply with the given status has been received.
    pub fn has_received(&self, status: &str) -> bool {
        matches!(&self.inner.state.lock().received, Some(reply) if reply.status == status)
    }

    /// Register a callback for a reply status.
    ///
    /// Each registration fires exactly once per resolution; registering
    /// after the matching reply already arrived invokes the callback
    /// immediately.
    pub fn receive(&self, status: &str, callback: impl FnMut(&Payload) + Send + 'static) -> &Self {
        let hook: ReplyCallback = Arc::new(Mutex::new(callback));
        let immediate = {
            let mut state = self.inner.state.lock();
            let resolved = matches!(&state.received, Some(reply) if reply.status == status);
            state.rec_hooks.push(RecHook {
                status: status.to_string(),
                callback: hook.clone(),
                fired: resolved,
            });
            if resolved {
                state.received.clone()
            } else {
                None
            }
        };
        if let Some(reply) = immediate {
            (&mut *hook.lock())(&reply.response);
        }
        self
    }

    /// Assign a fresh ref, start the timeout timer, and transmit through the
    /// owning channel's socket.
    ///
    /// The socket drops the message when not connected; buffering happens at
    /// the channel level. A push that already resolved with `timeout` is not
    /// re-sent.
    pub fn send(&self) {
        if self.has_received("timeout") {
            return;
        }
        self.start_timeout();
        let Some(channel) = self.channel() else {
            return;
        };
        let msg_ref = {
            let mut state = self.inner.state.lock();
            state.sent = true;
            state.msg_ref.clone()
        };
        let payload = (self.inner.payload)();
        channel.socket().push(Message {
            join_ref: channel.join_ref(),
            msg_ref,
            topic: channel.topic().to_string(),
            event: self.inner.event.clone(),
            payload,
        });
    }

    /// Reset the ref and received reply, then re-send under the new timeout.
    pub fn resend(&self, timeout: Duration) {
        self.inner.state.lock().timeout = timeout;
        self.reset();
        self.send();
    }

    /// Resolve this push with a reply, as if it arrived from the wire.
    pub fn trigger(&self, status: &str, response: Payload) {
        let payload = Reply {
            status: status.to_string(),
            response,
        }
        .into_payload();
        let ref_event = self.inner.state.lock().ref_event.clone();
        match (ref_event, self.channel()) {
            (Some(event), Some(channel)) => channel.trigger(&event, payload, None, None),
            _ => self.handle_reply(&payload),
        }
    }

    fn channel(&self) -> Option<Channel> {
        self.inner.channel.upgrade().map(Channel::from_inner)
    }

    /// Record the reply, cancel the timeout, and invoke the matching
    /// callbacks that have not fired for this resolution.
    pub(crate) fn handle_reply(&self, payload: &Payload) {
        let Some(reply) = payload.as_reply() else {
            tracing::warn!(event = %self.inner.event, "reply payload missing status");
            return;
        };
        let (ref_event, hooks) = {
            let mut state = self.inner.state.lock();
            if let Some(task) = state.timeout_task.take() {
                task.abort();
            }
            state.received = Some(reply.clone());
            let hooks: Vec<ReplyCallback> = state
                .rec_hooks
                .iter_mut()
                .filter(|hook| hook.status == reply.status && !hook.fired)
                .map(|hook| {
                    hook.fired = true;
                    hook.callback.clone()
                })
                .collect();
            (state.ref_event.clone(), hooks)
        };
        if let (Some(event), Some(channel)) = (ref_event, self.channel()) {
            channel.off(&event);
        }
        for hook in hooks {
            (&mut *hook.lock())(&reply.response);
        }
    }

    /// Assign a fresh ref, register the one-shot reply binding, and arm the
    /// timeout timer.
    pub(crate) fn start_timeout(&self) {
        self.cancel_timeout();
        let Some(channel) = self.channel() else {
            return;
        };
        // a previous incarnation's reply binding is stale once we re-ref
        let previous = self.inner.state.lock().ref_event.take();
        if let Some(event) = previous {
            channel.off(&event);
        }

        let msg_ref = channel.socket().make_ref();
        let ref_event = Channel::reply_event_name(&msg_ref);
        let timeout = {
            let mut state = self.inner.state.lock();
            state.msg_ref = Some(msg_ref);
            state.ref_event = Some(ref_event.clone());
            state.timeout
        };

        // the binding owns the push until the reply resolves or the ref is
        // reset, so in-flight pushes outlive dropped application handles
        let reply_handle = self.clone();
        channel.on(&ref_event, move |payload, _msg_ref, _join_ref| {
            reply_handle.handle_reply(payload);
        });

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                Push { inner }.trigger("timeout", Payload::Json(json!({})));
            }
        });
        self.inner.state.lock().timeout_task = Some(task);
    }

    /// Cancel the timeout timer without touching the received reply.
    pub(crate) fn cancel_timeout(&self) {
        if let Some(task) = self.inner.state.lock().timeout_task.take() {
            task.abort();
        }
    }

    /// Clear the ref, reply binding, and received reply so the push can be
    /// sent again as a fresh request.
    pub(crate) fn reset(&self) {
        let ref_event = {
            let mut state = self.inner.state.lock();
            state.msg_ref = None;
            state.received = None;
            state.sent = false;
            for hook in &mut state.rec_hooks {
                hook.fired = false;
            }
            state.ref_event.take()
        };
        if let (Some(event), Some(channel)) = (ref_event, self.channel()) {
            channel.off(&event);
        }
    }
}
