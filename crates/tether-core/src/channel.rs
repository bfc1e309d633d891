//! Channel abstraction for Tether.
//!
//! A channel is one topic multiplexed over the socket. It owns the join
//! request, the event bindings for its topic, a buffer of pushes made while
//! it could not send, and a rejoin timer that retries the join after errors.
//!
//! ```text
//!  Closed ──join()──▶ Joining ──ok──▶ Joined
//!                       │ ▲             │
//!           error/timeout │ │ rejoin      │ error
//!                       ▼ │             ▼
//!                     Errored ◀─────────┘
//!
//!  any ──leave()──▶ Leaving ──ok/timeout──▶ Closed
//! ```

use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tether_protocol::events::{
    is_lifecycle_event, reply_event_name, PHX_CLOSE, PHX_ERROR, PHX_JOIN, PHX_LEAVE, PHX_REPLY,
};
use tether_protocol::{Payload, ReplyStatus};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::backoff::BackoffTimer;
use crate::config::Params;
use crate::metrics;
use crate::push::{PayloadFn, Push};
use crate::socket::{CallbackRef, Socket, WeakSocket};
use crate::timer::Scheduler;

/// Channel errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// `join` was called more than once.
    #[error("tried to join multiple times. 'join' can only be called a single time per channel instance")]
    JoinedTwice,

    /// `push` was called before `join`.
    #[error("tried to push '{event}' to '{topic}' before joining. Use channel.join() before pushing events")]
    PushBeforeJoin {
        /// Event that was pushed.
        event: String,
        /// Channel topic.
        topic: String,
    },
}

/// Channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Not joined, or closed after leaving.
    Closed,
    /// The last join failed; a rejoin may be pending.
    Errored,
    /// Join sent, waiting for the reply.
    Joining,
    /// Joined.
    Joined,
    /// Leave sent, waiting for the reply.
    Leaving,
}

impl ChannelState {
    /// Lowercase state name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Closed => "closed",
            ChannelState::Errored => "errored",
            ChannelState::Joining => "joining",
            ChannelState::Joined => "joined",
            ChannelState::Leaving => "leaving",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback bound to a channel event. Receives the payload and the ref of
/// the message, if any.
pub type BindingCallback = Rc<dyn Fn(&Payload, Option<&str>)>;

struct Binding {
    event: String,
    callback: BindingCallback,
}

pub(crate) struct ChannelInner {
    topic: String,
    socket: WeakSocket,
    scheduler: Rc<dyn Scheduler>,
    state: Cell<ChannelState>,
    joined_once: Cell<bool>,
    timeout: Cell<Duration>,
    join_push: Push,
    push_buffer: RefCell<Vec<Push>>,
    bindings: RefCell<BTreeMap<u64, Binding>>,
    binding_ref: Cell<u64>,
    rejoin_timer: BackoffTimer,
    state_change_refs: RefCell<Vec<CallbackRef>>,
}

/// A channel on a socket.
///
/// Cloning yields another handle to the same channel. Channels are created
/// with [`Socket::channel`].
#[derive(Clone)]
pub struct Channel {
    inner: Rc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(topic: &str, params: Params, socket: &Socket) -> Self {
        let scheduler = socket.scheduler();
        let timeout = socket.default_timeout();
        let rejoin_calc = socket.rejoin_backoff();

        let inner = Rc::new_cyclic(|weak: &Weak<ChannelInner>| {
            let payload: PayloadFn = Rc::new(move || Payload::Json(params.resolve()));
            let join_push = Push::new(weak.clone(), PHX_JOIN, payload, timeout);

            let rejoin_timer = BackoffTimer::new(scheduler.clone(), rejoin_calc, {
                let weak = weak.clone();
                move || {
                    let Some(channel) = weak.upgrade().map(Channel::from_inner) else {
                        return;
                    };
                    if channel.socket_connected() {
                        channel.rejoin(None);
                    }
                }
            });

            ChannelInner {
                topic: topic.to_string(),
                socket: socket.downgrade(),
                scheduler,
                state: Cell::new(ChannelState::Closed),
                joined_once: Cell::new(false),
                timeout: Cell::new(timeout),
                join_push,
                push_buffer: RefCell::new(Vec::new()),
                bindings: RefCell::new(BTreeMap::new()),
                binding_ref: Cell::new(0),
                rejoin_timer,
                state_change_refs: RefCell::new(Vec::new()),
            }
        });

        let channel = Self { inner };
        channel.bind_defaults(socket);
        channel
    }

    pub(crate) fn from_inner(inner: Rc<ChannelInner>) -> Self {
        Self { inner }
    }

    fn weak(&self) -> Weak<ChannelInner> {
        Rc::downgrade(&self.inner)
    }

    /// Wire up the built-in lifecycle handling.
    fn bind_defaults(&self, socket: &Socket) {
        let on_socket_error = socket.on_error({
            let weak = self.weak();
            move |_, _, _| {
                if let Some(inner) = weak.upgrade() {
                    inner.rejoin_timer.reset();
                }
            }
        });
        let on_socket_open = socket.on_open({
            let weak = self.weak();
            move || {
                let Some(channel) = weak.upgrade().map(Channel::from_inner) else {
                    return;
                };
                channel.inner.rejoin_timer.reset();
                if channel.is_errored() {
                    channel.rejoin(None);
                }
            }
        });
        self.inner
            .state_change_refs
            .borrow_mut()
            .extend([on_socket_error, on_socket_open]);

        let join_push = &self.inner.join_push;

        join_push.receive(ReplyStatus::Ok, {
            let weak = self.weak();
            move |_| {
                let Some(channel) = weak.upgrade().map(Channel::from_inner) else {
                    return;
                };
                debug!(
                    topic = %channel.inner.topic,
                    join_ref = ?channel.join_ref(),
                    "Joined channel"
                );
                metrics::record_join(ReplyStatus::Ok.as_str());
                channel.inner.state.set(ChannelState::Joined);
                channel.inner.rejoin_timer.reset();
                let buffered = std::mem::take(&mut *channel.inner.push_buffer.borrow_mut());
                for push in buffered {
                    push.send();
                }
            }
        });

        join_push.receive(ReplyStatus::Error, {
            let weak = self.weak();
            move |response| {
                let Some(channel) = weak.upgrade().map(Channel::from_inner) else {
                    return;
                };
                warn!(topic = %channel.inner.topic, response = ?response, "Join rejected");
                metrics::record_join(ReplyStatus::Error.as_str());
                channel.inner.state.set(ChannelState::Errored);
                if channel.socket_connected() {
                    channel.inner.rejoin_timer.schedule_timeout();
                }
            }
        });

        join_push.receive(ReplyStatus::Timeout, {
            let weak = self.weak();
            move |_| {
                let Some(channel) = weak.upgrade().map(Channel::from_inner) else {
                    return;
                };
                debug!(
                    topic = %channel.inner.topic,
                    join_ref = ?channel.join_ref(),
                    timeout_ms = channel.inner.join_push.timeout().as_millis() as u64,
                    "Join timed out"
                );
                metrics::record_join(ReplyStatus::Timeout.as_str());

                // Drop whatever join state the server may still hold.
                let leave = Push::new(
                    channel.weak(),
                    PHX_LEAVE,
                    empty_payload(),
                    channel.inner.timeout.get(),
                );
                leave.send();

                channel.inner.state.set(ChannelState::Errored);
                channel.inner.join_push.reset();
                if channel.socket_connected() {
                    channel.inner.rejoin_timer.schedule_timeout();
                }
            }
        });

        self.on_close({
            let weak = self.weak();
            move |_, _| {
                let Some(channel) = weak.upgrade().map(Channel::from_inner) else {
                    return;
                };
                debug!(
                    topic = %channel.inner.topic,
                    join_ref = ?channel.join_ref(),
                    "Channel closed"
                );
                channel.inner.rejoin_timer.reset();
                channel.inner.state.set(ChannelState::Closed);
                if let Some(socket) = channel.socket() {
                    socket.remove(&channel);
                }
            }
        });

        self.on_error({
            let weak = self.weak();
            move |payload, _| {
                let Some(channel) = weak.upgrade().map(Channel::from_inner) else {
                    return;
                };
                if channel.is_leaving() || channel.is_closed() {
                    return;
                }
                debug!(topic = %channel.inner.topic, reason = ?payload, "Channel errored");
                if channel.is_joining() {
                    channel.inner.join_push.reset();
                }
                channel.inner.state.set(ChannelState::Errored);
                if channel.socket_connected() {
                    channel.inner.rejoin_timer.schedule_timeout();
                }
            }
        });

        self.on(PHX_REPLY, {
            let weak = self.weak();
            move |payload, msg_ref| {
                let (Some(inner), Some(msg_ref)) = (weak.upgrade(), msg_ref) else {
                    return;
                };
                Channel::from_inner(inner).trigger(&reply_event_name(msg_ref), payload, None, None);
            }
        });
    }

    /// Channel topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.inner.state.get()
    }

    /// Ref of the current join attempt.
    #[must_use]
    pub fn join_ref(&self) -> Option<String> {
        self.inner.join_push.msg_ref()
    }

    /// The join request.
    #[must_use]
    pub fn join_push(&self) -> &Push {
        &self.inner.join_push
    }

    /// Whether the channel is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Whether the last join failed.
    #[must_use]
    pub fn is_errored(&self) -> bool {
        self.state() == ChannelState::Errored
    }

    /// Whether the channel is joined.
    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.state() == ChannelState::Joined
    }

    /// Whether a join is in flight.
    #[must_use]
    pub fn is_joining(&self) -> bool {
        self.state() == ChannelState::Joining
    }

    /// Whether a leave is in flight.
    #[must_use]
    pub fn is_leaving(&self) -> bool {
        self.state() == ChannelState::Leaving
    }

    /// Whether pushes go out immediately instead of being buffered.
    #[must_use]
    pub fn can_push(&self) -> bool {
        self.socket_connected() && self.is_joined()
    }

    /// Name of the event carrying the reply to `msg_ref`.
    #[must_use]
    pub fn reply_event_name(&self, msg_ref: &str) -> String {
        reply_event_name(msg_ref)
    }

    /// Join the channel.
    ///
    /// Returns the join request so reply hooks can be chained on it.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::JoinedTwice`] if `join` was already called
    /// on this channel.
    pub fn join(&self, timeout: Option<Duration>) -> Result<Push, ChannelError> {
        if self.inner.joined_once.get() {
            return Err(ChannelError::JoinedTwice);
        }
        if let Some(timeout) = timeout {
            self.inner.timeout.set(timeout);
        }
        self.inner.joined_once.set(true);
        self.rejoin(None);
        Ok(self.inner.join_push.clone())
    }

    /// Send `event` to the server.
    ///
    /// The push goes out immediately if the channel is joined and the socket
    /// is connected, otherwise it is buffered until the next successful join.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PushBeforeJoin`] if the channel was never
    /// joined.
    pub fn push(
        &self,
        event: &str,
        payload: impl Into<Payload>,
        timeout: Option<Duration>,
    ) -> Result<Push, ChannelError> {
        if !self.inner.joined_once.get() {
            return Err(ChannelError::PushBeforeJoin {
                event: event.to_string(),
                topic: self.inner.topic.clone(),
            });
        }

        let payload = payload.into();
        let push = Push::new(
            self.weak(),
            event,
            Rc::new(move || payload.clone()),
            timeout.unwrap_or_else(|| self.inner.timeout.get()),
        );

        if self.can_push() {
            push.send();
        } else {
            trace!(topic = %self.inner.topic, event = %event, "Buffering push until joined");
            push.start_timeout();
            self.inner.push_buffer.borrow_mut().push(push.clone());
        }
        Ok(push)
    }

    /// Leave the channel.
    ///
    /// The channel closes once the server acknowledges the leave or the
    /// leave times out. If the channel cannot currently send, the leave is
    /// acknowledged locally right away.
    pub fn leave(&self, timeout: Option<Duration>) -> Push {
        self.inner.rejoin_timer.reset();
        self.inner.join_push.cancel_timeout();

        let could_push = self.can_push();
        self.inner.state.set(ChannelState::Leaving);
        debug!(topic = %self.inner.topic, "Leaving channel");

        let on_close = {
            let weak = self.weak();
            move |_: &Payload| {
                if let Some(inner) = weak.upgrade() {
                    Channel::from_inner(inner).trigger(
                        PHX_CLOSE,
                        &Payload::Json(Value::String("leave".into())),
                        None,
                        None,
                    );
                }
            }
        };
        let on_close = Rc::new(on_close);

        let leave = Push::new(
            self.weak(),
            PHX_LEAVE,
            empty_payload(),
            timeout.unwrap_or_else(|| self.inner.timeout.get()),
        );
        leave
            .receive(ReplyStatus::Ok, {
                let on_close = on_close.clone();
                move |payload| on_close(payload)
            })
            .receive(ReplyStatus::Timeout, move |payload| on_close(payload));
        leave.send();

        if !could_push {
            leave.trigger(ReplyStatus::Ok, json!({}));
        }
        leave
    }

    /// Bind `callback` to `event`. Returns a ref for [`off`](Self::off).
    pub fn on(&self, event: &str, callback: impl Fn(&Payload, Option<&str>) + 'static) -> u64 {
        let binding_ref = self.inner.binding_ref.get() + 1;
        self.inner.binding_ref.set(binding_ref);
        self.inner.bindings.borrow_mut().insert(
            binding_ref,
            Binding {
                event: event.to_string(),
                callback: Rc::new(callback),
            },
        );
        binding_ref
    }

    /// Remove the bindings for `event`, or only the one with `binding_ref`.
    pub fn off(&self, event: &str, binding_ref: Option<u64>) {
        // Dropped callbacks may own pushes, so drop them outside the borrow.
        let removed: Vec<Binding> = {
            let mut bindings = self.inner.bindings.borrow_mut();
            let keys: Vec<u64> = bindings
                .iter()
                .filter(|(key, binding)| {
                    binding.event == event && binding_ref.map_or(true, |r| r == **key)
                })
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|key| bindings.remove(&key))
                .collect()
        };
        drop(removed);
    }

    /// Run `callback` when the channel closes.
    pub fn on_close(&self, callback: impl Fn(&Payload, Option<&str>) + 'static) -> u64 {
        self.on(PHX_CLOSE, callback)
    }

    /// Run `callback` when the channel errors.
    pub fn on_error(&self, callback: impl Fn(&Payload, Option<&str>) + 'static) -> u64 {
        self.on(PHX_ERROR, callback)
    }

    /// Dispatch an inbound event to the bindings for `event`.
    ///
    /// Events carrying a join ref from an earlier join attempt are dropped,
    /// except replies and lifecycle events.
    pub fn trigger(
        &self,
        event: &str,
        payload: &Payload,
        msg_ref: Option<&str>,
        join_ref: Option<&str>,
    ) {
        if let Some(join_ref) = join_ref.filter(|join_ref| !join_ref.is_empty()) {
            if self.join_ref().as_deref() != Some(join_ref) && !is_lifecycle_event(event) {
                trace!(
                    topic = %self.inner.topic,
                    event = %event,
                    join_ref = %join_ref,
                    "Dropping outdated message"
                );
                return;
            }
        }

        let callbacks: Vec<BindingCallback> = self
            .inner
            .bindings
            .borrow()
            .values()
            .filter(|binding| binding.event == event)
            .map(|binding| binding.callback.clone())
            .collect();
        for callback in callbacks {
            callback(payload, msg_ref);
        }
    }

    /// Whether both handles point at the same channel.
    #[must_use]
    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn rejoin(&self, timeout: Option<Duration>) {
        if self.is_leaving() {
            return;
        }
        if let Some(socket) = self.socket() {
            socket.leave_open_topic(self);
        }
        self.inner.state.set(ChannelState::Joining);
        self.inner
            .join_push
            .resend(timeout.unwrap_or_else(|| self.inner.timeout.get()));
    }

    pub(crate) fn socket(&self) -> Option<Socket> {
        self.inner.socket.upgrade()
    }

    pub(crate) fn scheduler(&self) -> Rc<dyn Scheduler> {
        self.inner.scheduler.clone()
    }

    pub(crate) fn state_change_refs(&self) -> Vec<CallbackRef> {
        self.inner.state_change_refs.borrow().clone()
    }

    fn socket_connected(&self) -> bool {
        self.socket().is_some_and(|socket| socket.is_connected())
    }
}

fn empty_payload() -> PayloadFn {
    Rc::new(Payload::empty)
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.inner.topic)
            .field("state", &self.state())
            .field("join_ref", &self.join_ref())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{connected_socket, join_ok, reply, socket_with};
    use tether_protocol::Message;

    #[test]
    fn test_join_twice_fails() {
        let (socket, _factory, _scheduler) = connected_socket();
        let channel = socket.channel("room:lobby", json!({}));

        assert!(channel.join(None).is_ok());
        let err = channel.join(None).unwrap_err();
        assert_eq!(err, ChannelError::JoinedTwice);
        assert!(err.to_string().contains("tried to join multiple times"));

        channel.leave(None);
        assert_eq!(channel.join(None).unwrap_err(), ChannelError::JoinedTwice);
    }

    #[test]
    fn test_push_before_join_fails() {
        let (socket, _factory, _scheduler) = connected_socket();
        let channel = socket.channel("room:lobby", json!({}));

        let err = channel.push("new_msg", json!({}), None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "tried to push 'new_msg' to 'room:lobby' before joining. Use channel.join() before pushing events"
        );
    }

    #[test]
    fn test_join_sends_params_and_joins_on_ok() {
        let (socket, factory, _scheduler) = connected_socket();
        let channel = socket.channel("room:lobby", json!({"token": "abc"}));
        assert!(channel.is_closed());

        channel.join(None).unwrap();
        assert!(channel.is_joining());
        let sent = factory.last().unwrap().sent_messages();
        assert_eq!(sent[0].payload, Payload::Json(json!({"token": "abc"})));

        join_ok(&factory, &channel);
        assert_eq!(channel.state(), ChannelState::Joined);
        assert!(channel.can_push());
    }

    #[test]
    fn test_stale_join_ref_is_dropped() {
        let (socket, factory, scheduler) = connected_socket();
        let channel = socket.channel("room:lobby", json!({}));
        channel.join(Some(Duration::from_millis(100))).unwrap();
        let stale_ref = channel.join_ref().unwrap();

        // Time out and rejoin to get a new join ref.
        scheduler.advance(Duration::from_millis(100));
        scheduler.advance(Duration::from_millis(1000));
        let current_ref = channel.join_ref().unwrap();
        assert_ne!(stale_ref, current_ref);

        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        channel.on("new_msg", move |_, _| counter.set(counter.get() + 1));

        let conn = factory.last().unwrap();
        conn.server_send_message(
            &Message::new("room:lobby", "new_msg", json!({})).with_join_ref(stale_ref.clone()),
        );
        assert_eq!(hits.get(), 0);

        conn.server_send_message(
            &Message::new("room:lobby", "new_msg", json!({})).with_join_ref(current_ref),
        );
        conn.server_send_message(&Message::new("room:lobby", "new_msg", json!({})));
        assert_eq!(hits.get(), 2);

        // Lifecycle events bypass the check.
        channel.trigger(PHX_ERROR, &Payload::empty(), None, Some(&stale_ref));
        assert!(channel.is_errored());
    }

    #[test]
    fn test_join_timeout_then_rejoin_flushes_buffer() {
        let (socket, factory, scheduler) = connected_socket();
        let channel = socket.channel("room:lobby", json!({}));
        let conn = factory.last().unwrap();

        let timeouts = Rc::new(Cell::new(0));
        let counter = timeouts.clone();
        channel
            .join(Some(Duration::from_millis(10_000)))
            .unwrap()
            .receive(ReplyStatus::Timeout, move |_| counter.set(counter.get() + 1));
        assert_eq!(conn.sent().len(), 1);

        scheduler.advance(Duration::from_millis(10_000));
        assert_eq!(timeouts.get(), 1);
        let sent = conn.sent_messages();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].event, PHX_LEAVE);
        assert!(channel.is_errored());

        scheduler.advance(Duration::from_millis(1_000));
        let sent = conn.sent_messages();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2].event, PHX_JOIN);
        assert!(channel.is_joining());
        assert_eq!(timeouts.get(), 1);

        channel.push("new_msg", json!({"body": "hi"}), None).unwrap();
        assert_eq!(conn.sent().len(), 3);

        join_ok(&factory, &channel);
        assert!(channel.is_joined());
        let sent = conn.sent_messages();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[3].event, "new_msg");
        assert_eq!(sent[3].join_ref, channel.join_ref());
    }

    #[test]
    fn test_join_error_schedules_rejoin() {
        let (socket, factory, scheduler) = connected_socket();
        let channel = socket.channel("room:lobby", json!({}));
        channel.join(None).unwrap();
        let join_ref = channel.join_ref().unwrap();

        factory.last().unwrap().server_send_message(&reply(
            "room:lobby",
            &join_ref,
            &join_ref,
            "error",
            json!({"reason": "unauthorized"}),
        ));
        assert!(channel.is_errored());

        scheduler.advance(Duration::from_millis(999));
        assert!(channel.is_errored());
        scheduler.advance(Duration::from_millis(1));
        assert!(channel.is_joining());
    }

    #[test]
    fn test_error_ignored_while_leaving() {
        let (socket, factory, _scheduler) = connected_socket();
        let channel = socket.channel("room:lobby", json!({}));
        channel.join(None).unwrap();
        join_ok(&factory, &channel);

        channel.leave(None);
        assert!(channel.is_leaving());
        channel.trigger(PHX_ERROR, &Payload::empty(), None, None);
        assert!(channel.is_leaving());
    }

    #[test]
    fn test_leave_awaits_ack_when_joined() {
        let (socket, factory, _scheduler) = connected_socket();
        let channel = socket.channel("room:lobby", json!({}));
        channel.join(None).unwrap();
        join_ok(&factory, &channel);

        let closed = Rc::new(Cell::new(false));
        let flag = closed.clone();
        channel.on_close(move |payload, _| {
            assert_eq!(payload.as_json(), Some(&json!("leave")));
            flag.set(true);
        });

        let leave = channel.leave(None);
        assert!(channel.is_leaving());
        assert!(!closed.get());

        let leave_ref = leave.msg_ref().unwrap();
        let join_ref = channel.join_ref().unwrap();
        factory
            .last()
            .unwrap()
            .server_send_message(&reply("room:lobby", &join_ref, &leave_ref, "ok", json!({})));

        assert!(closed.get());
        assert!(channel.is_closed());
        assert!(socket.channels().is_empty());
    }

    #[test]
    fn test_leave_times_out_to_closed() {
        let (socket, factory, scheduler) = connected_socket();
        let channel = socket.channel("room:lobby", json!({}));
        channel.join(None).unwrap();
        join_ok(&factory, &channel);

        channel.leave(Some(Duration::from_millis(200)));
        scheduler.advance(Duration::from_millis(200));
        assert!(channel.is_closed());
    }

    #[test]
    fn test_leave_while_disconnected_closes_immediately() {
        let (socket, _factory, _scheduler) = socket_with(Default::default());
        let channel = socket.channel("room:lobby", json!({}));
        channel.join(None).unwrap();

        let leave = channel.leave(None);
        assert!(leave.has_received(ReplyStatus::Ok));
        assert!(channel.is_closed());
    }

    #[test]
    fn test_bindings_snapshot_and_off() {
        let (socket, _factory, _scheduler) = connected_socket();
        let channel = socket.channel("room:lobby", json!({}));
        let log = Rc::new(RefCell::new(Vec::new()));

        let first = channel.on("evt", {
            let log = log.clone();
            let channel = channel.clone();
            move |_, _| {
                log.borrow_mut().push("first");
                let log = log.clone();
                channel.on("evt", move |_, _| log.borrow_mut().push("late"));
            }
        });
        channel.on("evt", {
            let log = log.clone();
            move |_, _| log.borrow_mut().push("second")
        });

        channel.trigger("evt", &Payload::empty(), None, None);
        assert_eq!(*log.borrow(), vec!["first", "second"]);

        channel.off("evt", Some(first));
        log.borrow_mut().clear();
        channel.trigger("evt", &Payload::empty(), None, None);
        assert_eq!(*log.borrow(), vec!["second", "late"]);

        channel.off("evt", None);
        log.borrow_mut().clear();
        channel.trigger("evt", &Payload::empty(), None, None);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_server_close_removes_channel() {
        let (socket, factory, _scheduler) = connected_socket();
        let channel = socket.channel("room:lobby", json!({}));
        channel.join(None).unwrap();
        join_ok(&factory, &channel);
        let join_ref = channel.join_ref().unwrap();

        factory.last().unwrap().server_send_message(
            &Message::new("room:lobby", PHX_CLOSE, json!({})).with_join_ref(join_ref),
        );
        assert!(channel.is_closed());
        assert!(socket.channels().is_empty());
    }
}
