//! # tether-core
//!
//! Client engine for Phoenix-style channels.
//!
//! This crate provides the pieces an application talks to:
//!
//! - **Socket** - one connection, heartbeats, reconnect with backoff, and the
//!   send buffer used while disconnected
//! - **Channel** - a topic joined over the socket, with event bindings and
//!   automatic rejoin
//! - **Push** - one outbound message and the callbacks waiting on its reply
//! - **Presence** - client-side presence state synced from the server
//!
//! Everything runs on one thread. Timers go through a [`Scheduler`]: tokio
//! timers inside a `LocalSet` in production, virtual time in tests.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│   Socket    │────▶│  Channel    │──▶ bindings
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            ▲                   │
//!                            │                   ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │  Scheduler  │     │    Push     │
//!                     └─────────────┘     └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::rc::Rc;
//! use serde_json::json;
//! use tether_core::{Environment, Socket, SocketOptions};
//! use tether_transport::MemoryTransportFactory;
//!
//! let (env, _scheduler) = Environment::manual();
//! let factory = Rc::new(MemoryTransportFactory::new());
//! let options = SocketOptions::default();
//! let socket = Socket::new("ws://localhost:4000/socket", factory.clone(), env, options);
//!
//! let channel = socket.channel("room:lobby", json!({"token": "abc"}));
//! channel.on("new_msg", |payload, _| println!("{payload:?}"));
//! channel.join(None).unwrap();
//!
//! socket.connect().unwrap();
//! factory.last().unwrap().server_open();
//! assert!(channel.is_joining());
//! ```

pub mod backoff;
pub mod channel;
pub mod config;
pub mod env;
pub mod metrics;
pub mod presence;
pub mod push;
pub mod socket;
pub mod timer;

#[cfg(test)]
pub(crate) mod test_support;

pub use backoff::{BackoffFn, BackoffTimer};
pub use channel::{Channel, ChannelError, ChannelState};
pub use config::{Params, SocketConfig, SocketOptions};
pub use env::{Environment, Location};
pub use presence::{Presence, PresenceDiff, PresenceEntry, PresenceEvents, PresenceMap};
pub use push::Push;
pub use socket::{CallbackRef, Socket, SocketError, WeakSocket};
pub use timer::{ManualScheduler, Scheduler, TimerId, TokioScheduler};

pub use tether_protocol::{Message, Payload, Reply, ReplyStatus};
