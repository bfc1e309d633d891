//! Request tracking.
//!
//! A [`Push`] is one request sent on a channel. It mints a fresh ref each
//! time it is sent, listens on the channel for the reply addressed to that
//! ref, and arms a timeout that synthesizes a `timeout` reply through the
//! same path. Reply hooks registered with [`Push::receive`] run at most once
//! per attempt, in registration order.

use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tether_protocol::events::reply_event_name;
use tether_protocol::{Message, Payload, Reply, ReplyStatus};
use tracing::trace;

use crate::channel::{Channel, ChannelInner};
use crate::timer::TimerId;

/// Produces the payload of a push each time it is sent.
pub type PayloadFn = Rc<dyn Fn() -> Payload>;

/// Callback run with the response of a matching reply.
pub type ReplyHook = Rc<dyn Fn(&Payload)>;

pub(crate) struct PushInner {
    channel: Weak<ChannelInner>,
    event: String,
    payload: PayloadFn,
    timeout: Cell<Duration>,
    timeout_timer: Cell<Option<TimerId>>,
    received: RefCell<Option<Reply>>,
    hooks: RefCell<Vec<(String, ReplyHook)>>,
    sent: Cell<bool>,
    msg_ref: RefCell<Option<String>>,
    ref_event: RefCell<Option<String>>,
}

/// A request sent on a channel.
///
/// Cloning yields another handle to the same request.
#[derive(Clone)]
pub struct Push {
    inner: Rc<PushInner>,
}

impl Push {
    pub(crate) fn new(
        channel: Weak<ChannelInner>,
        event: impl Into<String>,
        payload: PayloadFn,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Rc::new(PushInner {
                channel,
                event: event.into(),
                payload,
                timeout: Cell::new(timeout),
                timeout_timer: Cell::new(None),
                received: RefCell::new(None),
                hooks: RefCell::new(Vec::new()),
                sent: Cell::new(false),
                msg_ref: RefCell::new(None),
                ref_event: RefCell::new(None),
            }),
        }
    }

    /// Event name.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.inner.event
    }

    /// Ref of the current attempt, if one was minted.
    #[must_use]
    pub fn msg_ref(&self) -> Option<String> {
        self.inner.msg_ref.borrow().clone()
    }

    /// Current timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.timeout.get()
    }

    /// Whether the current attempt was handed to the socket.
    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.inner.sent.get()
    }

    /// Reply received for the current attempt.
    #[must_use]
    pub fn received(&self) -> Option<Reply> {
        self.inner.received.borrow().clone()
    }

    /// Whether the current attempt resolved with `status`.
    #[must_use]
    pub fn has_received(&self, status: ReplyStatus) -> bool {
        self.inner
            .received
            .borrow()
            .as_ref()
            .is_some_and(|reply| reply.is(status))
    }

    /// Send the request.
    ///
    /// Does nothing if the current attempt already timed out; use
    /// [`resend`](Self::resend) to start over.
    pub fn send(&self) {
        if self.has_received(ReplyStatus::Timeout) {
            return;
        }
        let Some(channel) = self.channel() else {
            return;
        };
        let Some(socket) = channel.socket() else {
            return;
        };

        self.start_timeout();
        self.inner.sent.set(true);

        let message = Message {
            join_ref: channel.join_ref(),
            msg_ref: self.msg_ref(),
            topic: channel.topic().to_string(),
            event: self.inner.event.clone(),
            payload: (self.inner.payload)(),
        };
        socket.push(message);
    }

    /// Discard the current attempt and send again with a new timeout.
    pub fn resend(&self, timeout: Duration) {
        self.inner.timeout.set(timeout);
        self.reset();
        self.send();
    }

    /// Register `callback` for replies with `status`.
    ///
    /// If a matching reply already arrived, `callback` also runs right away.
    pub fn receive(&self, status: ReplyStatus, callback: impl Fn(&Payload) + 'static) -> Push {
        let callback: ReplyHook = Rc::new(callback);

        let already = self
            .inner
            .received
            .borrow()
            .as_ref()
            .filter(|reply| reply.is(status))
            .map(|reply| reply.response.clone());
        if let Some(response) = already {
            callback(&response);
        }

        self.inner
            .hooks
            .borrow_mut()
            .push((status.as_str().to_string(), callback));
        self.clone()
    }

    /// Clear all per-attempt state: the reply listener, the ref, the cached
    /// reply, the sent flag, and the timeout.
    pub fn reset(&self) {
        self.cancel_ref_event();
        self.cancel_timeout();
        *self.inner.msg_ref.borrow_mut() = None;
        *self.inner.ref_event.borrow_mut() = None;
        *self.inner.received.borrow_mut() = None;
        self.inner.sent.set(false);
    }

    /// Cancel the pending timeout, if any.
    pub fn cancel_timeout(&self) {
        if let Some(id) = self.inner.timeout_timer.take() {
            if let Some(channel) = self.channel() {
                channel.scheduler().clear_timeout(id);
            }
        }
    }

    /// Mint a new ref, listen for its reply, and arm the timeout.
    pub(crate) fn start_timeout(&self) {
        self.cancel_timeout();
        let Some(channel) = self.channel() else {
            return;
        };
        let Some(socket) = channel.socket() else {
            return;
        };

        let msg_ref = socket.make_ref();
        let ref_event = reply_event_name(&msg_ref);
        *self.inner.msg_ref.borrow_mut() = Some(msg_ref);
        *self.inner.ref_event.borrow_mut() = Some(ref_event.clone());

        let push = self.clone();
        channel.on(&ref_event, move |payload, _| {
            push.cancel_ref_event();
            push.cancel_timeout();
            let reply = Reply::from_payload(payload).unwrap_or_else(|| Reply {
                status: String::new(),
                response: payload.clone(),
            });
            push.handle_reply(reply);
        });

        let weak = Rc::downgrade(&self.inner);
        let id = channel.scheduler().set_timeout(
            self.timeout(),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let push = Push { inner };
                    push.inner.timeout_timer.set(None);
                    push.trigger(ReplyStatus::Timeout, json!({}));
                }
            }),
        );
        self.inner.timeout_timer.set(Some(id));
    }

    /// Deliver a locally synthesized reply through the channel.
    pub(crate) fn trigger(&self, status: ReplyStatus, response: Value) {
        let Some(ref_event) = self.inner.ref_event.borrow().clone() else {
            return;
        };
        let Some(channel) = self.channel() else {
            return;
        };
        let payload = Payload::Json(json!({"status": status.as_str(), "response": response}));
        channel.trigger(&ref_event, &payload, None, None);
    }

    fn handle_reply(&self, reply: Reply) {
        trace!(
            event = %self.inner.event,
            msg_ref = ?self.msg_ref(),
            status = %reply.status,
            "Reply received"
        );
        *self.inner.received.borrow_mut() = Some(reply.clone());

        let hooks: Vec<ReplyHook> = self
            .inner
            .hooks
            .borrow()
            .iter()
            .filter(|(status, _)| *status == reply.status)
            .map(|(_, hook)| hook.clone())
            .collect();
        for hook in hooks {
            hook(&reply.response);
        }
    }

    fn cancel_ref_event(&self) {
        let ref_event = self.inner.ref_event.borrow().clone();
        if let (Some(ref_event), Some(channel)) = (ref_event, self.channel()) {
            channel.off(&ref_event, None);
        }
    }

    fn channel(&self) -> Option<Channel> {
        self.inner.channel.upgrade().map(Channel::from_inner)
    }
}

impl fmt::Debug for Push {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Push")
            .field("event", &self.inner.event)
            .field("msg_ref", &self.msg_ref())
            .field("sent", &self.is_sent())
            .field("received", &self.received())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{connected_socket, join_ok, reply};
    use std::cell::Cell;

    #[test]
    fn test_send_mints_ref_and_transmits() {
        let (socket, factory, _scheduler) = connected_socket();
        let channel = socket.channel("room:1", json!({}));
        channel.join(None).unwrap();

        let conn = factory.last().unwrap();
        let sent = conn.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, "phx_join");
        assert_eq!(sent[0].msg_ref.as_deref(), Some("1"));
        assert_eq!(sent[0].join_ref.as_deref(), Some("1"));
    }

    #[test]
    fn test_reply_runs_matching_hooks_in_order() {
        let (socket, factory, _scheduler) = connected_socket();
        let channel = socket.channel("room:1", json!({}));
        let order = Rc::new(RefCell::new(Vec::new()));

        let push = channel.join(None).unwrap();
        for name in ["first", "second"] {
            let order = order.clone();
            push.receive(ReplyStatus::Ok, move |_| order.borrow_mut().push(name));
        }
        let errors = order.clone();
        push.receive(ReplyStatus::Error, move |_| errors.borrow_mut().push("error"));

        factory
            .last()
            .unwrap()
            .server_send_message(&reply("room:1", "1", "1", "ok", json!({})));

        assert_eq!(*order.borrow(), vec!["first", "second"]);
        assert!(push.has_received(ReplyStatus::Ok));
    }

    #[test]
    fn test_late_receive_runs_immediately() {
        let (socket, factory, _scheduler) = connected_socket();
        let channel = socket.channel("room:1", json!({}));
        let push = channel.join(None).unwrap();

        factory
            .last()
            .unwrap()
            .server_send_message(&reply("room:1", "1", "1", "ok", json!({"user": 7})));

        let seen = Rc::new(RefCell::new(None));
        let slot = seen.clone();
        push.receive(ReplyStatus::Ok, move |response| {
            *slot.borrow_mut() = response.as_json().cloned();
        });
        assert_eq!(*seen.borrow(), Some(json!({"user": 7})));
    }

    #[test]
    fn test_reply_dispatched_once() {
        let (socket, factory, _scheduler) = connected_socket();
        let channel = socket.channel("room:1", json!({}));
        let push = channel.join(None).unwrap();

        let count = Rc::new(Cell::new(0));
        let counter = count.clone();
        push.receive(ReplyStatus::Ok, move |_| counter.set(counter.get() + 1));

        let conn = factory.last().unwrap();
        let ok = reply("room:1", "1", "1", "ok", json!({}));
        conn.server_send_message(&ok);
        conn.server_send_message(&ok);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_timeout_synthesized_once() {
        let (socket, factory, scheduler) = connected_socket();
        let channel = socket.channel("room:1", json!({}));
        channel.join(None).unwrap();
        join_ok(&factory, &channel);

        let push = channel
            .push("new_msg", json!({"body": "hi"}), Some(Duration::from_millis(500)))
            .unwrap();
        let count = Rc::new(Cell::new(0));
        let counter = count.clone();
        push.receive(ReplyStatus::Timeout, move |response| {
            assert_eq!(response.as_json(), Some(&json!({})));
            counter.set(counter.get() + 1);
        });

        scheduler.advance(Duration::from_millis(499));
        assert_eq!(count.get(), 0);
        scheduler.advance(Duration::from_millis(1));
        assert_eq!(count.get(), 1);
        scheduler.advance(Duration::from_secs(5));
        assert_eq!(count.get(), 1);
        assert!(push.has_received(ReplyStatus::Timeout));

        // A timed out push stays resolved until resent.
        push.send();
        assert!(push.has_received(ReplyStatus::Timeout));
    }

    #[test]
    fn test_resend_resets_attempt() {
        let (socket, factory, scheduler) = connected_socket();
        let channel = socket.channel("room:1", json!({}));
        channel.join(None).unwrap();
        join_ok(&factory, &channel);

        let push = channel
            .push("new_msg", json!({}), Some(Duration::from_millis(100)))
            .unwrap();
        let first_ref = push.msg_ref();
        scheduler.advance(Duration::from_millis(100));
        assert!(push.has_received(ReplyStatus::Timeout));

        push.resend(Duration::from_millis(200));
        assert!(push.received().is_none());
        assert!(push.is_sent());
        assert_ne!(push.msg_ref(), first_ref);
        assert_eq!(push.timeout(), Duration::from_millis(200));

        let pushes = factory
            .last()
            .unwrap()
            .sent_messages()
            .into_iter()
            .filter(|m| m.event == "new_msg")
            .count();
        assert_eq!(pushes, 2);
    }
}
