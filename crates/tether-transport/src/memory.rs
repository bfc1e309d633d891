//! In-memory transport.
//!
//! Records every frame the socket sends and lets the caller play the server
//! side: open the connection, deliver frames, fail, or drop it. Useful for
//! tests and for embedding the socket on top of a custom I/O loop.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tether_protocol::{codec, Frame, Message};
use tracing::trace;

use crate::traits::{
    CloseEvent, ReadyState, Transport, TransportError, TransportEvents, TransportFactory,
    WS_CLOSE_NORMAL,
};

/// A scripted connection.
#[derive(Debug)]
pub struct MemoryTransport {
    url: String,
    events: TransportEvents,
    state: Cell<ReadyState>,
    sent: RefCell<Vec<Frame>>,
    closed_with: RefCell<Option<(Option<u16>, Option<String>)>>,
    buffered: Cell<usize>,
    skip_heartbeat: Cell<bool>,
    deferred_close: Cell<bool>,
}

impl MemoryTransport {
    fn new(url: &str, events: TransportEvents) -> Self {
        Self {
            url: url.to_string(),
            events,
            state: Cell::new(ReadyState::Connecting),
            sent: RefCell::new(Vec::new()),
            closed_with: RefCell::new(None),
            buffered: Cell::new(0),
            skip_heartbeat: Cell::new(false),
            deferred_close: Cell::new(false),
        }
    }

    /// URL the connection was opened with.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Frames sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<Frame> {
        self.sent.borrow().clone()
    }

    /// Frames sent so far, decoded. Frames that fail to decode are skipped.
    #[must_use]
    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent
            .borrow()
            .iter()
            .filter_map(|frame| codec::decode(frame).ok())
            .collect()
    }

    /// Drain the recorded frames.
    pub fn take_sent(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.sent.borrow_mut())
    }

    /// Code and reason passed to the first [`Transport::close`] call.
    #[must_use]
    pub fn closed_with(&self) -> Option<(Option<u16>, Option<String>)> {
        self.closed_with.borrow().clone()
    }

    /// Complete the opening handshake.
    pub fn server_open(&self) {
        self.state.set(ReadyState::Open);
        self.events.open();
    }

    /// Deliver a frame to the socket.
    pub fn server_send(&self, frame: Frame) {
        self.events.message(frame);
    }

    /// Encode and deliver a message to the socket.
    ///
    /// # Panics
    ///
    /// Panics if the message cannot be encoded.
    pub fn server_send_message(&self, message: &Message) {
        let frame = codec::encode(message).expect("message must encode");
        self.server_send(frame);
    }

    /// Report a connection failure.
    pub fn server_error(&self, error: TransportError) {
        self.events.error(error);
    }

    /// Drop the connection from the remote side.
    pub fn server_close(&self, code: u16, reason: &str) {
        self.state.set(ReadyState::Closed);
        self.events.close(CloseEvent::new(code, reason));
    }

    /// Override the ready state without emitting events.
    pub fn set_ready_state(&self, state: ReadyState) {
        self.state.set(state);
    }

    /// Pretend `amount` bytes are still queued.
    pub fn set_buffered_amount(&self, amount: usize) {
        self.buffered.set(amount);
    }

    /// Ask the socket not to heartbeat on this connection.
    pub fn set_skip_heartbeat(&self, skip: bool) {
        self.skip_heartbeat.set(skip);
    }

    /// Leave [`Transport::close`] waiting for the server's answer.
    ///
    /// The connection stays [`ReadyState::Closing`] until
    /// [`finish_close`](Self::finish_close) is called, like a WebSocket
    /// whose peer has not acknowledged the close frame yet.
    pub fn set_deferred_close(&self, deferred: bool) {
        self.deferred_close.set(deferred);
    }

    /// Complete a deferred close with the code and reason it was requested
    /// with. Does nothing unless the connection is closing.
    pub fn finish_close(&self) {
        if self.state.get() != ReadyState::Closing {
            return;
        }
        let (code, reason) = self.closed_with().unwrap_or((None, None));
        self.state.set(ReadyState::Closed);
        self.events.close(CloseEvent::new(
            code.unwrap_or(WS_CLOSE_NORMAL),
            reason.unwrap_or_default(),
        ));
    }
}

impl Transport for MemoryTransport {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.state.get() != ReadyState::Open {
            return Err(TransportError::ConnectionClosed);
        }
        trace!(url = %self.url, len = frame.len(), "Memory transport send");
        self.sent.borrow_mut().push(frame);
        Ok(())
    }

    fn close(&self, code: Option<u16>, reason: Option<&str>) {
        {
            let mut closed_with = self.closed_with.borrow_mut();
            if closed_with.is_none() {
                *closed_with = Some((code, reason.map(str::to_string)));
            }
        }
        match self.state.get() {
            ReadyState::Closing | ReadyState::Closed => return,
            ReadyState::Connecting | ReadyState::Open => {}
        }
        if self.deferred_close.get() {
            self.state.set(ReadyState::Closing);
            return;
        }
        self.state.set(ReadyState::Closed);
        self.events.close(CloseEvent::new(
            code.unwrap_or(WS_CLOSE_NORMAL),
            reason.unwrap_or(""),
        ));
    }

    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.get()
    }

    fn skip_heartbeat(&self) -> bool {
        self.skip_heartbeat.get()
    }
}

/// Factory handing out [`MemoryTransport`] connections.
#[derive(Debug)]
pub struct MemoryTransportFactory {
    name: &'static str,
    custom_encoding: bool,
    connections: RefCell<Vec<Rc<MemoryTransport>>>,
}

impl MemoryTransportFactory {
    /// Create a factory named "memory".
    #[must_use]
    pub fn new() -> Self {
        Self::named("memory")
    }

    /// Create a factory with a custom transport name.
    #[must_use]
    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            custom_encoding: true,
            connections: RefCell::new(Vec::new()),
        }
    }

    /// Report that custom encoders are not supported, like a polling transport.
    #[must_use]
    pub fn without_custom_encoding(mut self) -> Self {
        self.custom_encoding = false;
        self
    }

    /// Every connection opened so far.
    #[must_use]
    pub fn connections(&self) -> Vec<Rc<MemoryTransport>> {
        self.connections.borrow().clone()
    }

    /// The most recently opened connection.
    #[must_use]
    pub fn last(&self) -> Option<Rc<MemoryTransport>> {
        self.connections.borrow().last().cloned()
    }

    /// Number of connections opened so far.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.connections.borrow().len()
    }
}

impl Default for MemoryTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn name(&self) -> &'static str {
        self.name
    }

    fn open(&self, url: &str, events: TransportEvents) -> Rc<dyn Transport> {
        let conn = Rc::new(MemoryTransport::new(url, events));
        self.connections.borrow_mut().push(conn.clone());
        conn
    }

    fn supports_custom_encoding(&self) -> bool {
        self.custom_encoding
    }
}
