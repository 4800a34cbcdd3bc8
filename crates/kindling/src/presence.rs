//! Presence state reconciliation.
//!
//! Presence state is a map from key to a list of metadata records, one per
//! simultaneous occupant of that key (e.g. multiple tabs for one user).
//! Each meta carries a per-connection unique `phx_ref` tag; an updated meta
//! links back to the one it replaced via `phx_ref_prev`.
//!
//! The pure [`sync_state`]/[`sync_diff`] functions reconcile a local map
//! against full snapshots and incremental diffs; the stateful [`Presence`]
//! wrapper subscribes them to a channel's event stream and queues diffs
//! that race ahead of the first snapshot of a join generation.

use crate::channel::Channel;
use crate::message::Payload;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// All metadata records for one presence key.
///
/// An entry with no metas is absent: reconciliation deletes the key rather
/// than retaining an empty entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// Distinct simultaneous metadata records for the key, each tagged with
    /// a unique `phx_ref`.
    pub metas: Vec<Value>,
}

/// Presence state: key to entry.
pub type PresenceMap = HashMap<String, PresenceEntry>;

/// An incremental presence change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceDiff {
    /// Keys with newly joined metas.
    #[serde(default)]
    pub joins: PresenceMap,
    /// Keys with departed metas.
    #[serde(default)]
    pub leaves: PresenceMap,
}

fn phx_ref(meta: &Value) -> Option<&str> {
    meta.get("phx_ref").and_then(Value::as_str)
}

/// Reconcile `current` against a full `new_state` snapshot and return the
/// new authoritative map.
///
/// Keys only in `new_state` are joins; keys only in `current` are leaves
/// (reported with a synthesized empty remaining entry); keys in both are
/// diffed meta-by-meta by whole-record equality. `on_join`/`on_leave` fire
/// once per affected key with `(key, current_entry, joined_or_left_entry)`.
/// Inputs are never mutated.
pub fn sync_state<J, L>(
    current: &PresenceMap,
    new_state: &PresenceMap,
    mut on_join: J,
    mut on_leave: L,
) -> PresenceMap
where
    J: FnMut(&str, Option<&PresenceEntry>, &PresenceEntry),
    L: FnMut(&str, Option<&PresenceEntry>, &PresenceEntry),
{
    let mut joins = PresenceMap::new();
    let mut leaves = PresenceMap::new();

    for (key, presence) in current {
        if !new_state.contains_key(key) {
            leaves.insert(key.clone(), presence.clone());
        }
    }
    for (key, new_presence) in new_state {
        match current.get(key) {
            Some(current_presence) => {
                let joined: Vec<Value> = new_presence
                    .metas
                    .iter()
                    .filter(|meta| !current_presence.metas.contains(meta))
                    .cloned()
                    .collect();
                let left: Vec<Value> = current_presence
                    .metas
                    .iter()
                    .filter(|meta| !new_presence.metas.contains(meta))
                    .cloned()
                    .collect();
                if !joined.is_empty() {
                    joins.insert(key.clone(), PresenceEntry { metas: joined });
                }
                if !left.is_empty() {
                    leaves.insert(key.clone(), PresenceEntry { metas: left });
                }
            }
            None => {
                joins.insert(key.clone(), new_presence.clone());
            }
        }
    }
    sync_diff(
        current,
        &PresenceDiff { joins, leaves },
        &mut on_join,
        &mut on_leave,
    )
}

/// Apply an incremental `{joins, leaves}` diff to `state` and return the
/// new map.
///
/// Joined metas merge into their key, after any metas already present.
/// Left metas are removed by their `phx_ref` tag; a key whose metas empty
/// out is deleted entirely. Inputs are never mutated.
pub fn sync_diff<J, L>(
    state: &PresenceMap,
    diff: &PresenceDiff,
    mut on_join: J,
    mut on_leave: L,
) -> PresenceMap
where
    J: FnMut(&str, Option<&PresenceEntry>, &PresenceEntry),
    L: FnMut(&str, Option<&PresenceEntry>, &PresenceEntry),
{
    let mut state = state.clone();

    for (key, new_presence) in &diff.joins {
        let current = state.get(key).cloned();
        let mut merged = new_presence.clone();
        if let Some(current_presence) = &current {
            // metas already present keep their position ahead of the joiners
            let joined_refs: Vec<Option<String>> = merged
                .metas
                .iter()
                .map(|meta| phx_ref(meta).map(str::to_string))
                .collect();
            let mut metas: Vec<Value> = current_presence
                .metas
                .iter()
                .filter(|meta| !joined_refs.contains(&phx_ref(meta).map(str::to_string)))
                .cloned()
                .collect();
            metas.append(&mut merged.metas);
            merged.metas = metas;
        }
        state.insert(key.clone(), merged);
        on_join(key, current.as_ref(), new_presence);
    }

    for (key, left_presence) in &diff.leaves {
        let Some(mut current_presence) = state.get(key).cloned() else {
            continue;
        };
        let left_refs: Vec<Option<&str>> = left_presence.metas.iter().map(phx_ref).collect();
        current_presence
            .metas
            .retain(|meta| !left_refs.contains(&phx_ref(meta)));
        on_leave(key, Some(&current_presence), left_presence);
        if current_presence.metas.is_empty() {
            state.remove(key);
        } else {
            state.insert(key.clone(), current_presence);
        }
    }

    state
}

/// Event names the stateful tracker subscribes to.
#[derive(Debug, Clone)]
pub struct PresenceOptions {
    /// Event carrying a full state snapshot.
    pub state_event: String,
    /// Event carrying an incremental diff.
    pub diff_event: String,
}

impl Default for PresenceOptions {
    fn default() -> Self {
        Self {
            state_event: "presence_state".to_string(),
            diff_event: "presence_diff".to_string(),
        }
    }
}

type PresenceCallback = Arc<Mutex<dyn FnMut(&str, Option<&PresenceEntry>, &PresenceEntry) + Send>>;
type SyncCallback = Arc<Mutex<dyn FnMut() + Send>>;

#[derive(Default)]
struct PresenceShared {
    map: PresenceMap,
    pending_diffs: Vec<PresenceDiff>,
    join_ref: Option<String>,
}

#[derive(Default)]
struct PresenceCallbacks {
    on_join: Option<PresenceCallback>,
    on_leave: Option<PresenceCallback>,
    on_sync: Option<SyncCallback>,
}

/// Stateful presence tracker bound to one channel.
///
/// Diffs that arrive before the first snapshot of the current join
/// generation are queued and replayed, in arrival order, once that
/// snapshot lands. A reconnect starts a new join generation and re-enters
/// the pending state until a fresh snapshot arrives.
#[derive(Clone)]
pub struct Presence {
    inner: Arc<PresenceInner>,
}

struct PresenceInner {
    channel: Channel,
    state: Mutex<PresenceShared>,
    callbacks: Mutex<PresenceCallbacks>,
}

impl Presence {
    /// Subscribe a tracker to a channel's presence events.
    pub fn new(channel: &Channel, options: PresenceOptions) -> Presence {
        let inner = Arc::new(PresenceInner {
            channel: channel.clone(),
            state: Mutex::new(PresenceShared::default()),
            callbacks: Mutex::new(PresenceCallbacks::default()),
        });
        let weak = Arc::downgrade(&inner);
        channel.on(&options.state_event, {
            let weak = weak.clone();
            move |payload, _msg_ref, _join_ref| {
                if let Some(inner) = weak.upgrade() {
                    Presence { inner }.handle_state(payload);
                }
            }
        });
        channel.on(&options.diff_event, move |payload, _msg_ref, _join_ref| {
            if let Some(inner) = weak.upgrade() {
                Presence { inner }.handle_diff(payload);
            }
        });
        Presence { inner }
    }

    /// Replace the callback fired for each joined key.
    pub fn on_join(
        &self,
        callback: impl FnMut(&str, Option<&PresenceEntry>, &PresenceEntry) + Send + 'static,
    ) {
        let callback: PresenceCallback = Arc::new(Mutex::new(callback));
        self.inner.callbacks.lock().on_join = Some(callback);
    }

    /// Replace the callback fired for each left key.
    pub fn on_leave(
        &self,
        callback: impl FnMut(&str, Option<&PresenceEntry>, &PresenceEntry) + Send + 'static,
    ) {
        let callback: PresenceCallback = Arc::new(Mutex::new(callback));
        self.inner.callbacks.lock().on_leave = Some(callback);
    }

    /// Replace the callback fired after each applied snapshot or diff.
    pub fn on_sync(&self, callback: impl FnMut() + Send + 'static) {
        let callback: SyncCallback = Arc::new(Mutex::new(callback));
        self.inner.callbacks.lock().on_sync = Some(callback);
    }

    /// A snapshot of the current presence map.
    pub fn state(&self) -> PresenceMap {
        self.inner.state.lock().map.clone()
    }

    /// List the current presences as `(key, entry)` pairs.
    pub fn list(&self) -> Vec<(String, PresenceEntry)> {
        self.state().into_iter().collect()
    }

    /// List the current presences through a chooser.
    pub fn list_by<T>(&self, mut chooser: impl FnMut(&str, &PresenceEntry) -> T) -> Vec<T> {
        let map = self.state();
        map.iter().map(|(key, entry)| chooser(key, entry)).collect()
    }

    /// Whether a diff arriving now would be queued rather than applied:
    /// true until the first snapshot of the current join generation.
    pub fn in_pending_sync_state(&self) -> bool {
        let join_ref = self.inner.state.lock().join_ref.clone();
        join_ref.is_none() || join_ref != self.inner.channel.join_ref()
    }

    fn handle_state(&self, payload: &Payload) {
        let Some(new_state) = decode_map(payload) else {
            return;
        };
        let join_ref = self.inner.channel.join_ref();
        let (current, pending) = {
            let mut shared = self.inner.state.lock();
            (shared.map.clone(), std::mem::take(&mut shared.pending_diffs))
        };
        let (on_join, on_leave, on_sync) = self.callback_snapshot();
        let mut map = sync_state(
            &current,
            &new_state,
            |key, current, joined| fire(&on_join, key, current, joined),
            |key, current, left| fire(&on_leave, key, current, left),
        );
        for diff in &pending {
            map = sync_diff(
                &map,
                diff,
                |key, current, joined| fire(&on_join, key, current, joined),
                |key, current, left| fire(&on_leave, key, current, left),
            );
        }
        {
            let mut shared = self.inner.state.lock();
            shared.map = map;
            shared.join_ref = join_ref;
        }
        if let Some(on_sync) = on_sync {
            (&mut *on_sync.lock())();
        }
    }

    fn handle_diff(&self, payload: &Payload) {
        let Some(diff) = decode_diff(payload) else {
            return;
        };
        if self.in_pending_sync_state() {
            self.inner.state.lock().pending_diffs.push(diff);
            return;
        }
        let current = { self.inner.state.lock().map.clone() };
        let (on_join, on_leave, on_sync) = self.callback_snapshot();
        let map = sync_diff(
            &current,
            &diff,
            |key, current, joined| fire(&on_join, key, current, joined),
            |key, current, left| fire(&on_leave, key, current, left),
        );
        self.inner.state.lock().map = map;
        if let Some(on_sync) = on_sync {
            (&mut *on_sync.lock())();
        }
    }

    fn callback_snapshot(
        &self,
    ) -> (
        Option<PresenceCallback>,
        Option<PresenceCallback>,
        Option<SyncCallback>,
    ) {
        let callbacks = self.inner.callbacks.lock();
        (
            callbacks.on_join.clone(),
            callbacks.on_leave.clone(),
            callbacks.on_sync.clone(),
        )
    }
}

fn fire(
    callback: &Option<PresenceCallback>,
    key: &str,
    current: Option<&PresenceEntry>,
    new_or_left: &PresenceEntry,
) {
    if let Some(callback) = callback {
        (&mut *callback.lock())(key, current, new_or_left);
    }
}

fn decode_map(payload: &Payload) -> Option<PresenceMap> {
    let value = payload.as_json()?;
    match serde_json::from_value(value.clone()) {
        Ok(map) => Some(map),
        Err(error) => {
            tracing::warn!(error = %error, "malformed presence state payload");
            None
        }
    }
}

fn decode_diff(payload: &Payload) -> Option<PresenceDiff> {
    let value = payload.as_json()?;
    match serde_json::from_value(value.clone()) {
        Ok(diff) => Some(diff),
        Err(error) => {
            tracing::warn!(error = %error, "malformed presence diff payload");
            None
        }
    }
}
