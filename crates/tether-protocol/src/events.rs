//! Reserved event and topic names.

/// Sent by the client to join a topic.
pub const PHX_JOIN: &str = "phx_join";

/// Sent by the client to leave a topic.
pub const PHX_LEAVE: &str = "phx_leave";

/// Server reply to any request carrying a ref.
pub const PHX_REPLY: &str = "phx_reply";

/// The channel was closed.
pub const PHX_CLOSE: &str = "phx_close";

/// The channel crashed or the connection dropped.
pub const PHX_ERROR: &str = "phx_error";

/// Topic used by the connection-level heartbeat.
pub const SYSTEM_TOPIC: &str = "phoenix";

/// Event used by the connection-level heartbeat.
pub const HEARTBEAT: &str = "heartbeat";

/// Prefix of the per-request reply events a channel dispatches internally.
pub const REPLY_EVENT_PREFIX: &str = "chan_reply_";

/// Lifecycle events that bypass the stale join ref check.
pub const LIFECYCLE_EVENTS: [&str; 4] = [PHX_CLOSE, PHX_ERROR, PHX_JOIN, PHX_LEAVE];

/// Returns `true` for events that must be delivered regardless of join ref.
#[must_use]
pub fn is_lifecycle_event(event: &str) -> bool {
    event == PHX_REPLY || LIFECYCLE_EVENTS.contains(&event)
}

/// Name of the event a channel uses to route the reply for `msg_ref`.
#[must_use]
pub fn reply_event_name(msg_ref: &str) -> String {
    format!("{REPLY_EVENT_PREFIX}{msg_ref}")
}
