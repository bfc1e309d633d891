//! # tether-protocol
//!
//! Wire protocol definitions for the Tether channels client.
//!
//! This crate defines the message envelope exchanged with the server, the
//! reserved event names, and the serializer that turns envelopes into text
//! or binary frames.
//!
//! ## Encodings
//!
//! - JSON payloads travel as text frames: `[join_ref, ref, topic, event, payload]`
//! - Binary payloads travel as tagged binary frames (push, reply, broadcast)
//!
//! ## Example
//!
//! ```rust
//! use tether_protocol::{codec, Message};
//!
//! let msg = Message::new("room:lobby", "new_msg", serde_json::json!({"body": "hi"}))
//!     .with_join_ref("1")
//!     .with_ref("2");
//!
//! let frame = codec::encode(&msg).unwrap();
//! let decoded = codec::decode(&frame).unwrap();
//! assert_eq!(msg, decoded);
//! ```

pub mod codec;
pub mod events;
pub mod frames;
pub mod message;
pub mod version;

pub use codec::{decode, encode, ProtocolError, Serializer};
pub use frames::{BinaryKind, Frame};
pub use message::{Message, Payload, Reply, ReplyStatus};
pub use version::{Version, PROTOCOL_VERSION, VSN_PARAM};
