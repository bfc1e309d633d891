//! Transport abstraction traits for Tether.
//!
//! The socket consumes transports only through these traits: a factory that
//! opens a connection to a URL and a connection handle that can send, close,
//! and report its ready state. Connection events flow back through
//! [`TransportEvents`].

use std::fmt;
use std::rc::Rc;
use tether_protocol::Frame;
use thiserror::Error;

/// Normal closure code.
pub const WS_CLOSE_NORMAL: u16 = 1000;

/// Close code reported when a connection dropped without a close frame.
pub const WS_CLOSE_ABNORMAL: u16 = 1006;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Failed to establish the connection.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] tether_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Connection ready state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadyState {
    /// Opening handshake in progress.
    Connecting,
    /// Open and able to send.
    Open,
    /// Closing handshake in progress.
    Closing,
    /// Closed.
    Closed,
}

impl From<u8> for ReadyState {
    fn from(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

impl From<ReadyState> for u8 {
    fn from(state: ReadyState) -> u8 {
        match state {
            ReadyState::Connecting => 0,
            ReadyState::Open => 1,
            ReadyState::Closing => 2,
            ReadyState::Closed => 3,
        }
    }
}

/// Details of a closed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// Close code.
    pub code: u16,
    /// Close reason.
    pub reason: String,
    /// Whether the closing handshake completed.
    pub was_clean: bool,
}

impl CloseEvent {
    /// Create a close event.
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean: code == WS_CLOSE_NORMAL,
        }
    }

    /// Whether this is a normal closure.
    #[must_use]
    pub fn is_normal(&self) -> bool {
        self.code == WS_CLOSE_NORMAL
    }
}

/// An event emitted by a connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// The connection opened.
    Open,
    /// The connection closed.
    Close(CloseEvent),
    /// The connection failed.
    Error(TransportError),
    /// A frame arrived.
    Message(Frame),
}

/// Sink through which a connection reports its events.
///
/// Cloning the sink is cheap. Events must be delivered on the thread that
/// owns the socket, and never from inside [`TransportFactory::open`].
#[derive(Clone)]
pub struct TransportEvents {
    sink: Rc<dyn Fn(TransportEvent)>,
}

impl TransportEvents {
    /// Create a sink from a handler.
    pub fn new(handler: impl Fn(TransportEvent) + 'static) -> Self {
        Self {
            sink: Rc::new(handler),
        }
    }

    /// Report an event.
    pub fn emit(&self, event: TransportEvent) {
        (self.sink)(event);
    }

    /// Report that the connection opened.
    pub fn open(&self) {
        self.emit(TransportEvent::Open);
    }

    /// Report that the connection closed.
    pub fn close(&self, event: CloseEvent) {
        self.emit(TransportEvent::Close(event));
    }

    /// Report a connection failure.
    pub fn error(&self, error: TransportError) {
        self.emit(TransportEvent::Error(error));
    }

    /// Report an inbound frame.
    pub fn message(&self, frame: Frame) {
        self.emit(TransportEvent::Message(frame));
    }
}

impl fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEvents").finish_non_exhaustive()
    }
}

/// An open (or opening) connection.
pub trait Transport {
    /// Send a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot accept the frame.
    fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Start closing the connection.
    fn close(&self, code: Option<u16>, reason: Option<&str>);

    /// Current ready state.
    fn ready_state(&self) -> ReadyState;

    /// Bytes queued but not yet written.
    fn buffered_amount(&self) -> usize {
        0
    }

    /// Whether the socket should skip its heartbeat on this connection.
    fn skip_heartbeat(&self) -> bool {
        false
    }
}

/// Opens connections of one transport kind.
pub trait TransportFactory {
    /// Transport name (e.g., "websocket", "longpoll").
    fn name(&self) -> &'static str;

    /// Open a connection to `url`, reporting events through `events`.
    fn open(&self, url: &str, events: TransportEvents) -> Rc<dyn Transport>;

    /// Rewrite a socket endpoint URL for this transport.
    fn normalize_endpoint(&self, url: &str) -> String {
        url.to_string()
    }

    /// Whether caller-supplied encoders may be used on this transport.
    fn supports_custom_encoding(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_ready_state_from_u8() {
        assert_eq!(ReadyState::from(0), ReadyState::Connecting);
        assert_eq!(ReadyState::from(1), ReadyState::Open);
        assert_eq!(ReadyState::from(2), ReadyState::Closing);
        assert_eq!(ReadyState::from(3), ReadyState::Closed);
        assert_eq!(ReadyState::from(42), ReadyState::Closed);
        assert_eq!(u8::from(ReadyState::Open), 1);
    }

    #[test]
    fn test_close_event() {
        assert!(CloseEvent::new(WS_CLOSE_NORMAL, "bye").is_normal());
        let abnormal = CloseEvent::new(WS_CLOSE_ABNORMAL, "");
        assert!(!abnormal.is_normal());
        assert!(!abnormal.was_clean);
    }

    #[test]
    fn test_events_sink() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let events = TransportEvents::new({
            let seen = seen.clone();
            move |event| seen.borrow_mut().push(format!("{event:?}"))
        });

        events.open();
        events.message(Frame::Text("[]".into()));
        events.close(CloseEvent::new(WS_CLOSE_NORMAL, ""));

        assert_eq!(seen.borrow().len(), 3);
        assert_eq!(seen.borrow()[0], "Open");
    }
}
