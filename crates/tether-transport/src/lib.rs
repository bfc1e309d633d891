//! # tether-transport
//!
//! Transport abstraction layer for the Tether channels client.
//!
//! The socket never talks to the network directly. It opens connections
//! through a [`TransportFactory`] and receives their events through
//! [`TransportEvents`]:
//!
//! - **WebSocket** - tokio-tungstenite client, the default
//! - **Memory** - scripted connections for tests and custom I/O loops
//!
//! ## Transport Abstraction
//!
//! ```rust
//! use tether_transport::{MemoryTransportFactory, TransportEvents, TransportFactory};
//!
//! let factory = MemoryTransportFactory::new();
//! let conn = factory.open("ws://localhost/socket/websocket", TransportEvents::new(|event| {
//!     println!("{event:?}");
//! }));
//! factory.last().unwrap().server_open();
//! assert!(conn.send("[]".to_string().into()).is_ok());
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryTransport, MemoryTransportFactory};
pub use traits::{
    CloseEvent, ReadyState, Transport, TransportError, TransportEvent, TransportEvents,
    TransportFactory, WS_CLOSE_ABNORMAL, WS_CLOSE_NORMAL,
};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};
