//! Presence tracking.
//!
//! The server describes who is present on a topic as a map from key (usually
//! a user id) to an entry holding one meta per connection. A full
//! `presence_state` snapshot arrives after each join and `presence_diff`
//! messages follow. [`sync_state`] and [`sync_diff`] merge those into local
//! state and report joins and leaves per key; [`Presence`] wires them to a
//! channel.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};
use tether_protocol::Payload;
use tracing::{debug, warn};

use crate::channel::Channel;

/// Presence state keyed by presence key.
pub type PresenceMap = BTreeMap<String, PresenceEntry>;

/// Everything known about one presence key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// One meta per connection, each carrying a unique `phx_ref`.
    #[serde(default)]
    pub metas: Vec<Value>,

    /// Any other fields the server attached to the key.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PresenceEntry {
    fn refs(&self) -> Vec<&str> {
        self.metas.iter().filter_map(phx_ref).collect()
    }

    fn metas_without(&self, refs: &[&str]) -> Vec<Value> {
        self.metas
            .iter()
            .filter(|meta| phx_ref(meta).map_or(true, |r| !refs.contains(&r)))
            .cloned()
            .collect()
    }
}

fn phx_ref(meta: &Value) -> Option<&str> {
    meta.get("phx_ref").and_then(Value::as_str)
}

/// Keys that joined and left since the last update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceDiff {
    /// Keys with new metas.
    #[serde(default)]
    pub joins: PresenceMap,
    /// Keys with removed metas.
    #[serde(default)]
    pub leaves: PresenceMap,
}

/// Merge a full snapshot into `state`.
///
/// Keys missing from `new_state` leave, new keys join, and for keys present in
/// both only the metas whose `phx_ref` changed are reported.
pub fn sync_state<J, L>(
    state: &PresenceMap,
    new_state: &PresenceMap,
    on_join: J,
    on_leave: L,
) -> PresenceMap
where
    J: FnMut(&str, Option<&PresenceEntry>, &PresenceEntry),
    L: FnMut(&str, &PresenceEntry, &PresenceEntry),
{
    let mut diff = PresenceDiff::default();

    for (key, current) in state {
        if !new_state.contains_key(key) {
            diff.leaves.insert(key.clone(), current.clone());
        }
    }

    for (key, incoming) in new_state {
        let Some(current) = state.get(key) else {
            diff.joins.insert(key.clone(), incoming.clone());
            continue;
        };

        let joined = incoming.metas_without(&current.refs());
        let left = current.metas_without(&incoming.refs());
        if !joined.is_empty() {
            diff.joins.insert(
                key.clone(),
                PresenceEntry {
                    metas: joined,
                    extra: incoming.extra.clone(),
                },
            );
        }
        if !left.is_empty() {
            diff.leaves.insert(
                key.clone(),
                PresenceEntry {
                    metas: left,
                    extra: current.extra.clone(),
                },
            );
        }
    }

    sync_diff(state, &diff, on_join, on_leave)
}

/// Apply a diff to `state`.
///
/// Joined metas are appended after the metas already held for the key. A key
/// whose last meta leaves is removed.
pub fn sync_diff<J, L>(
    state: &PresenceMap,
    diff: &PresenceDiff,
    mut on_join: J,
    mut on_leave: L,
) -> PresenceMap
where
    J: FnMut(&str, Option<&PresenceEntry>, &PresenceEntry),
    L: FnMut(&str, &PresenceEntry, &PresenceEntry),
{
    let mut state = state.clone();

    for (key, joined) in &diff.joins {
        let current = state.get(key).cloned();
        let mut entry = joined.clone();
        if let Some(current) = &current {
            let mut metas = current.metas_without(&joined.refs());
            metas.append(&mut entry.metas);
            entry.metas = metas;
        }
        state.insert(key.clone(), entry);
        on_join(key, current.as_ref(), joined);
    }

    for (key, left) in &diff.leaves {
        let Some(current) = state.get_mut(key) else {
            continue;
        };
        current.metas = current.metas_without(&left.refs());
        let remaining = current.clone();
        on_leave(key, &remaining, left);
        if remaining.metas.is_empty() {
            state.remove(key);
        }
    }

    state
}

/// Map every entry through `chooser`.
pub fn list<T>(state: &PresenceMap, mut chooser: impl FnMut(&str, &PresenceEntry) -> T) -> Vec<T> {
    state
        .iter()
        .map(|(key, entry)| chooser(key, entry))
        .collect()
}

/// Channel events carrying presence updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvents {
    /// Full snapshot event.
    pub state: String,
    /// Incremental diff event.
    pub diff: String,
}

impl Default for PresenceEvents {
    fn default() -> Self {
        Self {
            state: "presence_state".to_string(),
            diff: "presence_diff".to_string(),
        }
    }
}

type JoinCallback = Rc<dyn Fn(&str, Option<&PresenceEntry>, &PresenceEntry)>;
type LeaveCallback = Rc<dyn Fn(&str, &PresenceEntry, &PresenceEntry)>;
type SyncCallback = Rc<dyn Fn()>;

struct PresenceInner {
    channel: Channel,
    events: PresenceEvents,
    bindings: RefCell<Vec<(String, u64)>>,
    state: RefCell<PresenceMap>,
    pending_diffs: RefCell<Vec<PresenceDiff>>,
    join_ref: RefCell<Option<String>>,
    on_join: RefCell<Option<JoinCallback>>,
    on_leave: RefCell<Option<LeaveCallback>>,
    on_sync: RefCell<Option<SyncCallback>>,
}

impl Drop for PresenceInner {
    fn drop(&mut self) {
        for (event, id) in self.bindings.get_mut().drain(..) {
            self.channel.off(&event, Some(id));
        }
    }
}

/// Presence state for one channel.
///
/// Diffs that arrive before the snapshot for the current join are held back
/// and applied right after it, so a rejoin never mixes state from two joins.
#[derive(Clone)]
pub struct Presence {
    inner: Rc<PresenceInner>,
}

impl Presence {
    /// Track presence on `channel`.
    #[must_use]
    pub fn new(channel: &Channel, events: PresenceEvents) -> Self {
        let inner = Rc::new(PresenceInner {
            channel: channel.clone(),
            events,
            bindings: RefCell::new(Vec::new()),
            state: RefCell::new(PresenceMap::new()),
            pending_diffs: RefCell::new(Vec::new()),
            join_ref: RefCell::new(None),
            on_join: RefCell::new(None),
            on_leave: RefCell::new(None),
            on_sync: RefCell::new(None),
        });

        let state_event = inner.events.state.clone();
        let diff_event = inner.events.diff.clone();

        let weak = Rc::downgrade(&inner);
        let state_id = channel.on(&state_event, move |payload, _| {
            if let Some(inner) = weak.upgrade() {
                Presence { inner }.handle_state(payload);
            }
        });
        let weak: Weak<PresenceInner> = Rc::downgrade(&inner);
        let diff_id = channel.on(&diff_event, move |payload, _| {
            if let Some(inner) = weak.upgrade() {
                Presence { inner }.handle_diff(payload);
            }
        });

        inner
            .bindings
            .borrow_mut()
            .extend([(state_event, state_id), (diff_event, diff_id)]);

        Self { inner }
    }

    /// Run `callback` for every key that joins or gains a meta.
    pub fn on_join(
        &self,
        callback: impl Fn(&str, Option<&PresenceEntry>, &PresenceEntry) + 'static,
    ) {
        *self.inner.on_join.borrow_mut() = Some(Rc::new(callback));
    }

    /// Run `callback` for every key that leaves or loses a meta.
    pub fn on_leave(&self, callback: impl Fn(&str, &PresenceEntry, &PresenceEntry) + 'static) {
        *self.inner.on_leave.borrow_mut() = Some(Rc::new(callback));
    }

    /// Run `callback` after each applied update.
    pub fn on_sync(&self, callback: impl Fn() + 'static) {
        *self.inner.on_sync.borrow_mut() = Some(Rc::new(callback));
    }

    /// Map every entry through `chooser`.
    pub fn list<T>(&self, chooser: impl FnMut(&str, &PresenceEntry) -> T) -> Vec<T> {
        let state = self.inner.state.borrow().clone();
        list(&state, chooser)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> PresenceMap {
        self.inner.state.borrow().clone()
    }

    /// Whether diffs are being held until a snapshot for the current join.
    #[must_use]
    pub fn in_pending_sync_state(&self) -> bool {
        let join_ref = self.inner.join_ref.borrow();
        join_ref.is_none() || *join_ref != self.inner.channel.join_ref()
    }

    fn handle_state(&self, payload: &Payload) {
        let Some(new_state) = decode::<PresenceMap>(payload, &self.inner.events.state) else {
            return;
        };
        *self.inner.join_ref.borrow_mut() = self.inner.channel.join_ref();

        let (on_join, on_leave) = self.callbacks();
        let current = self.state();
        let mut state = sync_state(&current, &new_state, &on_join, &on_leave);

        let pending = std::mem::take(&mut *self.inner.pending_diffs.borrow_mut());
        for diff in &pending {
            state = sync_diff(&state, diff, &on_join, &on_leave);
        }

        debug!(
            topic = %self.inner.channel.topic(),
            keys = state.len(),
            replayed = pending.len(),
            "Presence synced"
        );
        *self.inner.state.borrow_mut() = state;
        self.notify_sync();
    }

    fn handle_diff(&self, payload: &Payload) {
        let Some(diff) = decode::<PresenceDiff>(payload, &self.inner.events.diff) else {
            return;
        };
        if self.in_pending_sync_state() {
            self.inner.pending_diffs.borrow_mut().push(diff);
            return;
        }

        let (on_join, on_leave) = self.callbacks();
        let current = self.state();
        let state = sync_diff(&current, &diff, &on_join, &on_leave);
        *self.inner.state.borrow_mut() = state;
        self.notify_sync();
    }

    fn callbacks(
        &self,
    ) -> (
        impl Fn(&str, Option<&PresenceEntry>, &PresenceEntry),
        impl Fn(&str, &PresenceEntry, &PresenceEntry),
    ) {
        let join = self.inner.on_join.borrow().clone();
        let leave = self.inner.on_leave.borrow().clone();
        (
            move |key: &str, current: Option<&PresenceEntry>, joined: &PresenceEntry| {
                if let Some(join) = &join {
                    join(key, current, joined);
                }
            },
            move |key: &str, current: &PresenceEntry, left: &PresenceEntry| {
                if let Some(leave) = &leave {
                    leave(key, current, left);
                }
            },
        )
    }

    fn notify_sync(&self) {
        let on_sync = self.inner.on_sync.borrow().clone();
        if let Some(on_sync) = on_sync {
            on_sync();
        }
    }
}

impl fmt::Debug for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Presence")
            .field("topic", &self.inner.channel.topic())
            .field("keys", &self.inner.state.borrow().len())
            .field("pending_diffs", &self.inner.pending_diffs.borrow().len())
            .finish_non_exhaustive()
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: &Payload, event: &str) -> Option<T> {
    let Some(value) = payload.as_json() else {
        warn!(event = %event, "Ignoring binary presence payload");
        return None;
    };
    match serde_json::from_value(value.clone()) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            warn!(event = %event, error = %e, "Ignoring malformed presence payload");
            None
        }
    }
}
