//! Connection manager.
//!
//! The [`Socket`] owns the transport connection and everything multiplexed
//! over it: channels, the outbound buffer used while disconnected, the ref
//! counter, heartbeats, and reconnection with backoff. All state lives on a
//! single thread; transport events and timer callbacks re-enter the socket
//! through weak references.

use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tether_protocol::events::{HEARTBEAT, PHX_ERROR, SYSTEM_TOPIC};
use tether_protocol::{codec, Frame, Message, Payload, ProtocolError, VSN_PARAM};
use tether_transport::{
    CloseEvent, ReadyState, Transport, TransportError, TransportEvent, TransportEvents,
    TransportFactory, WS_CLOSE_NORMAL,
};
use thiserror::Error;
use tracing::{debug, error, trace, warn};
use url::Url;

use crate::backoff::{BackoffFn, BackoffTimer};
use crate::channel::Channel;
use crate::config::{Params, SocketOptions};
use crate::env::Environment;
use crate::metrics;
use crate::timer::{Scheduler, TimerId};

/// Close code used when a heartbeat goes unanswered.
pub const WS_CLOSE_HEARTBEAT_TIMEOUT: u16 = 3008;

/// Largest ref before the counter wraps back to zero.
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Teardown polls the connection at most this many times per stage.
const TEARDOWN_MAX_TRIES: u32 = 5;

/// Teardown polling step, multiplied by the attempt number.
const TEARDOWN_STEP: Duration = Duration::from_millis(150);

/// Socket errors.
#[derive(Debug, Error)]
pub enum SocketError {
    /// A relative endpoint was given but the environment has no location.
    #[error("Relative endpoint '{0}' needs a host location")]
    RelativeEndpoint(String),

    /// The endpoint is not a valid URL.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
}

/// Handle returned by the `on_*` registration methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackRef(u64);

/// Runs when the connection opens.
pub type OpenCallback = Rc<dyn Fn()>;

/// Runs when the connection closes.
pub type CloseCallback = Rc<dyn Fn(&CloseEvent)>;

/// Runs when the connection fails. Receives the error, the name of the
/// transport in use when it happened, and how many connections had been
/// established before it.
pub type ErrorCallback = Rc<dyn Fn(&TransportError, &str, u32)>;

/// Runs for every decoded inbound message.
pub type MessageCallback = Rc<dyn Fn(&Message)>;

struct Conn {
    transport: Rc<dyn Transport>,
    detached: Rc<Cell<bool>>,
}

impl Conn {
    /// Stop delivering events from this connection.
    fn detach(&self) {
        self.detached.set(true);
    }
}

pub(crate) struct SocketInner {
    endpoint: String,
    env: Environment,
    options: SocketOptions,
    transport: RefCell<Rc<dyn TransportFactory>>,
    transport_generation: Cell<u64>,
    fallback_used: Cell<bool>,
    conn: RefCell<Option<Conn>>,
    channels: RefCell<Vec<Channel>>,
    send_buffer: RefCell<Vec<Message>>,
    msg_ref: Cell<u64>,
    callback_ref: Cell<u64>,
    open_callbacks: RefCell<Vec<(CallbackRef, OpenCallback)>>,
    close_callbacks: RefCell<Vec<(CallbackRef, CloseCallback)>>,
    error_callbacks: RefCell<Vec<(CallbackRef, ErrorCallback)>>,
    message_callbacks: RefCell<Vec<(CallbackRef, MessageCallback)>>,
    close_was_clean: Cell<bool>,
    disconnecting: Cell<bool>,
    connect_clock: Cell<u64>,
    established_connections: Cell<u32>,
    pending_heartbeat_ref: RefCell<Option<String>>,
    heartbeat_timer: Cell<Option<TimerId>>,
    reconnect_timer: BackoffTimer,
    fallback_timer: Cell<Option<TimerId>>,
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        for id in [self.heartbeat_timer.take(), self.fallback_timer.take()]
            .into_iter()
            .flatten()
        {
            self.env.scheduler.clear_timeout(id);
        }
        if let Some(conn) = self.conn.get_mut().take() {
            conn.detach();
        }
        for _ in self.channels.get_mut().drain(..) {
            metrics::record_channel_removed();
        }
    }
}

/// A weak handle to a [`Socket`].
#[derive(Clone, Default)]
pub struct WeakSocket {
    inner: Weak<SocketInner>,
}

impl WeakSocket {
    /// Upgrade to a strong handle if the socket is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Socket> {
        self.inner.upgrade().map(|inner| Socket { inner })
    }
}

impl fmt::Debug for WeakSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakSocket").finish_non_exhaustive()
    }
}

/// The connection manager.
///
/// Cloning yields another handle to the same socket.
#[derive(Clone)]
pub struct Socket {
    inner: Rc<SocketInner>,
}

impl Socket {
    /// Create a socket for `endpoint`, e.g. `wss://example.com/socket`.
    ///
    /// Nothing is opened until [`connect`](Self::connect) is called.
    #[must_use]
    pub fn new(
        endpoint: &str,
        transport: Rc<dyn TransportFactory>,
        env: Environment,
        options: SocketOptions,
    ) -> Self {
        let reconnect_calc = options.reconnect_backoff();
        let scheduler = env.scheduler.clone();

        let inner = Rc::new_cyclic(|weak: &Weak<SocketInner>| {
            let reconnect_timer = BackoffTimer::new(scheduler, reconnect_calc, {
                let weak = weak.clone();
                move || {
                    let Some(socket) = weak.upgrade().map(|inner| Socket { inner }) else {
                        return;
                    };
                    metrics::record_reconnect();
                    let weak = socket.downgrade();
                    socket.teardown(
                        Box::new(move |finished| {
                            if !finished {
                                return;
                            }
                            if let Some(socket) = weak.upgrade() {
                                if let Err(e) = socket.connect() {
                                    error!(error = %e, "Reconnect failed");
                                }
                            }
                        }),
                        None,
                        None,
                    );
                }
            });

            SocketInner {
                endpoint: format!("{endpoint}/websocket"),
                env,
                options,
                transport: RefCell::new(transport),
                transport_generation: Cell::new(0),
                fallback_used: Cell::new(false),
                conn: RefCell::new(None),
                channels: RefCell::new(Vec::new()),
                send_buffer: RefCell::new(Vec::new()),
                msg_ref: Cell::new(0),
                callback_ref: Cell::new(0),
                open_callbacks: RefCell::new(Vec::new()),
                close_callbacks: RefCell::new(Vec::new()),
                error_callbacks: RefCell::new(Vec::new()),
                message_callbacks: RefCell::new(Vec::new()),
                close_was_clean: Cell::new(false),
                disconnecting: Cell::new(false),
                connect_clock: Cell::new(1),
                established_connections: Cell::new(0),
                pending_heartbeat_ref: RefCell::new(None),
                heartbeat_timer: Cell::new(None),
                reconnect_timer,
                fallback_timer: Cell::new(None),
            }
        });

        Self { inner }
    }

    /// A weak handle to this socket.
    #[must_use]
    pub fn downgrade(&self) -> WeakSocket {
        WeakSocket {
            inner: Rc::downgrade(&self.inner),
        }
    }

    // ---------------------------------------------------------------------
    // Connection lifecycle
    // ---------------------------------------------------------------------

    /// Open the connection.
    ///
    /// Does nothing if a connection already exists and no disconnect is in
    /// progress. A connection still being torn down by
    /// [`disconnect`](Self::disconnect) is closed and replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be turned into a URL.
    pub fn connect(&self) -> Result<(), SocketError> {
        if self.inner.conn.borrow().is_some() && !self.inner.disconnecting.get() {
            return Ok(());
        }
        self.inner.disconnecting.set(false);

        if let (Some(_), Some(after)) = (
            self.inner.options.fallback.as_ref(),
            self.inner.options.config.fallback_after(),
        ) {
            if !self.inner.fallback_used.get() {
                self.clear_fallback_timer();
                let weak = self.downgrade();
                let id = self.scheduler().set_timeout(
                    after,
                    Box::new(move || {
                        if let Some(socket) = weak.upgrade() {
                            socket.inner.fallback_timer.set(None);
                            socket.fall_back("primary transport did not open in time");
                        }
                    }),
                );
                self.inner.fallback_timer.set(Some(id));
            }
        }

        self.transport_connect()
    }

    /// Close the connection and stop reconnecting.
    ///
    /// `callback` runs once the connection has been torn down, or once a
    /// later [`connect`](Self::connect) has replaced it.
    pub fn disconnect(
        &self,
        callback: Option<Box<dyn FnOnce()>>,
        code: Option<u16>,
        reason: Option<&str>,
    ) {
        debug!(code = ?code, reason = ?reason, "Disconnecting");
        self.bump_connect_clock();
        self.inner.disconnecting.set(true);
        self.inner.close_was_clean.set(true);
        self.clear_fallback_timer();
        self.inner.reconnect_timer.reset();

        let weak = self.downgrade();
        self.teardown(
            Box::new(move |finished| {
                if finished {
                    if let Some(socket) = weak.upgrade() {
                        socket.inner.disconnecting.set(false);
                    }
                }
                if let Some(callback) = callback {
                    callback();
                }
            }),
            code,
            reason.map(str::to_string),
        );
    }

    /// Use `factory` for every later connect.
    ///
    /// The current connection, if any, is closed without reporting its
    /// close event. Channels that were live on it are errored so they rejoin
    /// once the new transport opens.
    pub fn replace_transport(&self, factory: Rc<dyn TransportFactory>) {
        debug!(
            from = self.transport_name(),
            to = factory.name(),
            "Replacing transport"
        );
        self.bump_connect_clock();
        self.inner.close_was_clean.set(true);
        self.clear_fallback_timer();
        self.inner.reconnect_timer.reset();

        let conn = self.inner.conn.borrow_mut().take();
        if let Some(conn) = conn {
            let was_open = conn.transport.ready_state() == ReadyState::Open;
            conn.detach();
            conn.transport.close(None, None);
            self.clear_heartbeats();
            if was_open {
                self.trigger_chan_error();
            }
        }

        *self.inner.transport.borrow_mut() = factory;
        self.inner
            .transport_generation
            .set(self.inner.transport_generation.get() + 1);
    }

    /// Ready state of the current connection.
    #[must_use]
    pub fn connection_state(&self) -> ReadyState {
        self.current_transport()
            .map_or(ReadyState::Closed, |transport| transport.ready_state())
    }

    /// Whether the connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ReadyState::Open
    }

    /// Name of the transport used for the next connect.
    #[must_use]
    pub fn transport_name(&self) -> &'static str {
        self.inner.transport.borrow().name()
    }

    /// Full connection URL for the current transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is relative and the environment has
    /// no location, or if the result is not a valid URL.
    pub fn endpoint_url(&self) -> Result<String, SocketError> {
        let factory = self.inner.transport.borrow().clone();
        self.endpoint_url_for(factory.as_ref())
    }

    fn endpoint_url_for(&self, factory: &dyn TransportFactory) -> Result<String, SocketError> {
        let endpoint = &self.inner.endpoint;
        let location = self.inner.env.location.as_ref();

        let absolute = if endpoint.starts_with("//") {
            let protocol = location.map_or("ws", |location| location.socket_protocol());
            format!("{protocol}:{endpoint}")
        } else if endpoint.starts_with('/') {
            let location =
                location.ok_or_else(|| SocketError::RelativeEndpoint(endpoint.clone()))?;
            format!(
                "{}://{}{}",
                location.socket_protocol(),
                location.host,
                endpoint
            )
        } else {
            endpoint.clone()
        };

        let mut url = Url::parse(&absolute)?;
        let mut params = Vec::new();
        flatten_params(None, &self.inner.options.params.resolve(), &mut params);
        url.query_pairs_mut()
            .extend_pairs(params)
            .append_pair(VSN_PARAM, &self.inner.options.config.vsn);

        Ok(factory.normalize_endpoint(url.as_str()))
    }

    fn transport_connect(&self) -> Result<(), SocketError> {
        self.bump_connect_clock();
        self.inner.close_was_clean.set(false);

        let factory = self.inner.transport.borrow().clone();
        let url = self.endpoint_url_for(factory.as_ref())?;
        debug!(transport = factory.name(), url = %url, "Connecting");

        let detached = Rc::new(Cell::new(false));
        let events = {
            let weak = self.downgrade();
            let detached = detached.clone();
            TransportEvents::new(move |event| {
                if detached.get() {
                    return;
                }
                let Some(socket) = weak.upgrade() else {
                    return;
                };
                match event {
                    TransportEvent::Open => socket.on_conn_open(),
                    TransportEvent::Close(close) => socket.on_conn_close(&close),
                    TransportEvent::Error(error) => socket.on_conn_error(&error),
                    TransportEvent::Message(frame) => socket.on_conn_message(&frame),
                }
            })
        };

        // Events from the previous handle must not reach the new connection.
        let previous = self.inner.conn.borrow_mut().take();
        if let Some(previous) = previous {
            debug!("Closing previous connection");
            previous.detach();
            previous.transport.close(None, None);
            self.clear_heartbeats();
        }

        let transport = factory.open(&url, events);
        *self.inner.conn.borrow_mut() = Some(Conn {
            transport,
            detached,
        });
        Ok(())
    }

    fn fall_back(&self, reason: &str) {
        let Some(fallback) = self.inner.options.fallback.clone() else {
            return;
        };
        if self.inner.fallback_used.replace(true) {
            return;
        }
        warn!(
            from = self.transport_name(),
            to = fallback.name(),
            reason = %reason,
            "Falling back to secondary transport"
        );
        self.replace_transport(fallback);
        if let Err(e) = self.transport_connect() {
            error!(error = %e, "Fallback connect failed");
        }
    }

    /// Drain, close and detach the current connection.
    ///
    /// `callback` receives `true` once the teardown completed, or `false` if
    /// a later connect, disconnect or transport switch superseded it.
    fn teardown(
        &self,
        callback: Box<dyn FnOnce(bool)>,
        code: Option<u16>,
        reason: Option<String>,
    ) {
        if self.inner.conn.borrow().is_none() {
            callback(true);
            return;
        }

        let clock = self.inner.connect_clock.get();
        let weak = self.downgrade();
        self.wait_for_buffer_done(
            1,
            Box::new(move || {
                let Some(socket) = weak.upgrade() else {
                    return;
                };
                if clock != socket.inner.connect_clock.get() {
                    callback(false);
                    return;
                }
                if let Some(transport) = socket.current_transport() {
                    transport.close(code, reason.as_deref());
                }

                let weak = socket.downgrade();
                socket.wait_for_socket_closed(
                    1,
                    Box::new(move || {
                        let Some(socket) = weak.upgrade() else {
                            return;
                        };
                        if clock != socket.inner.connect_clock.get() {
                            callback(false);
                            return;
                        }
                        let conn = socket.inner.conn.borrow_mut().take();
                        if let Some(conn) = conn {
                            conn.detach();
                        }
                        callback(true);
                    }),
                );
            }),
        );
    }

    fn wait_for_buffer_done(&self, tries: u32, callback: Box<dyn FnOnce()>) {
        let buffered = self
            .current_transport()
            .map_or(0, |transport| transport.buffered_amount());
        if tries == TEARDOWN_MAX_TRIES || buffered == 0 {
            callback();
            return;
        }
        trace!(tries, buffered, "Waiting for send buffer to drain");
        let weak = self.downgrade();
        self.scheduler().set_timeout(
            TEARDOWN_STEP * tries,
            Box::new(move || {
                if let Some(socket) = weak.upgrade() {
                    socket.wait_for_buffer_done(tries + 1, callback);
                }
            }),
        );
    }

    fn wait_for_socket_closed(&self, tries: u32, callback: Box<dyn FnOnce()>) {
        let state = self
            .current_transport()
            .map(|transport| transport.ready_state());
        if tries == TEARDOWN_MAX_TRIES || matches!(state, None | Some(ReadyState::Closed)) {
            callback();
            return;
        }
        let weak = self.downgrade();
        self.scheduler().set_timeout(
            TEARDOWN_STEP * tries,
            Box::new(move || {
                if let Some(socket) = weak.upgrade() {
                    socket.wait_for_socket_closed(tries + 1, callback);
                }
            }),
        );
    }

    // ---------------------------------------------------------------------
    // Transport events
    // ---------------------------------------------------------------------

    fn on_conn_open(&self) {
        debug!(transport = self.transport_name(), "Connected");
        self.inner.close_was_clean.set(false);
        self.inner.disconnecting.set(false);
        self.inner
            .established_connections
            .set(self.inner.established_connections.get() + 1);
        self.clear_fallback_timer();
        self.flush_send_buffer();
        self.inner.reconnect_timer.reset();
        self.reset_heartbeat();

        let callbacks: Vec<OpenCallback> = snapshot(&self.inner.open_callbacks);
        for callback in callbacks {
            callback();
        }
    }

    fn on_conn_close(&self, event: &CloseEvent) {
        debug!(code = event.code, reason = %event.reason, "Connection closed");
        self.trigger_chan_error();
        self.clear_heartbeats();
        if !self.inner.close_was_clean.get() && event.code != WS_CLOSE_NORMAL {
            self.inner.reconnect_timer.schedule_timeout();
        }

        let callbacks: Vec<CloseCallback> = snapshot(&self.inner.close_callbacks);
        for callback in callbacks {
            callback(event);
        }
    }

    fn on_conn_error(&self, error: &TransportError) {
        let transport = self.transport_name();
        let generation = self.inner.transport_generation.get();
        let established_before = self.inner.established_connections.get();
        warn!(transport, error = %error, "Connection error");

        let callbacks: Vec<ErrorCallback> = snapshot(&self.inner.error_callbacks);
        for callback in callbacks {
            callback(error, transport, established_before);
        }

        if established_before == 0 && generation == self.inner.transport_generation.get() {
            self.clear_fallback_timer();
            self.fall_back("primary transport failed before opening");
        }

        if generation == self.inner.transport_generation.get() || established_before > 0 {
            self.trigger_chan_error();
        }
    }

    fn on_conn_message(&self, frame: &Frame) {
        metrics::record_frame(frame.len(), "inbound");
        let message = match self.decode(frame) {
            Ok(message) => message,
            Err(e) => {
                metrics::record_decode_error();
                error!(error = %e, len = frame.len(), "Dropping undecodable frame");
                return;
            }
        };
        trace!(
            topic = %message.topic,
            event = %message.event,
            msg_ref = ?message.msg_ref,
            join_ref = ?message.join_ref,
            "Received message"
        );

        let is_heartbeat_ack = message.msg_ref.is_some()
            && *self.inner.pending_heartbeat_ref.borrow() == message.msg_ref;
        if is_heartbeat_ack {
            self.clear_heartbeats();
            *self.inner.pending_heartbeat_ref.borrow_mut() = None;
            self.schedule_heartbeat();
        }

        let channels: Vec<Channel> = self
            .inner
            .channels
            .borrow()
            .iter()
            .filter(|channel| channel.topic() == message.topic)
            .cloned()
            .collect();
        for channel in channels {
            channel.trigger(
                &message.event,
                &message.payload,
                message.msg_ref.as_deref(),
                message.join_ref.as_deref(),
            );
        }

        let callbacks: Vec<MessageCallback> = snapshot(&self.inner.message_callbacks);
        for callback in callbacks {
            callback(&message);
        }
    }

    fn trigger_chan_error(&self) {
        let channels = self.channels();
        for channel in channels {
            if channel.is_joining() || channel.is_joined() {
                channel.trigger(PHX_ERROR, &Payload::empty(), None, None);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Outbound
    // ---------------------------------------------------------------------

    /// Send `message` now if connected, otherwise queue it for the next open.
    pub fn push(&self, message: Message) {
        trace!(
            topic = %message.topic,
            event = %message.event,
            msg_ref = ?message.msg_ref,
            join_ref = ?message.join_ref,
            "Push"
        );
        if self.is_connected() {
            self.transmit(&message);
        } else {
            self.inner.send_buffer.borrow_mut().push(message);
        }
    }

    fn transmit(&self, message: &Message) {
        let frame = match self.encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                error!(
                    topic = %message.topic,
                    event = %message.event,
                    error = %e,
                    "Failed to encode message"
                );
                return;
            }
        };
        let Some(transport) = self.current_transport() else {
            return;
        };
        let len = frame.len();
        match transport.send(frame) {
            Ok(()) => metrics::record_frame(len, "outbound"),
            Err(e) => warn!(
                topic = %message.topic,
                event = %message.event,
                error = %e,
                "Send failed"
            ),
        }
    }

    fn flush_send_buffer(&self) {
        if !self.is_connected() {
            return;
        }
        let buffered = std::mem::take(&mut *self.inner.send_buffer.borrow_mut());
        if !buffered.is_empty() {
            debug!(count = buffered.len(), "Flushing send buffer");
        }
        for message in &buffered {
            self.transmit(message);
        }
    }

    /// Number of messages waiting for the connection to open.
    #[must_use]
    pub fn buffered_count(&self) -> usize {
        self.inner.send_buffer.borrow().len()
    }

    /// Encode with the custom encoder if the transport allows it.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded.
    pub fn encode(&self, message: &Message) -> Result<Frame, ProtocolError> {
        match self.custom_codec(|options| options.encode.clone()) {
            Some(encode) => encode(message),
            None => codec::encode(message),
        }
    }

    /// Decode with the custom decoder if the transport allows it.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is malformed.
    pub fn decode(&self, frame: &Frame) -> Result<Message, ProtocolError> {
        match self.custom_codec(|options| options.decode.clone()) {
            Some(decode) => decode(frame),
            None => codec::decode(frame),
        }
    }

    fn custom_codec<T>(&self, pick: impl Fn(&SocketOptions) -> Option<T>) -> Option<T> {
        let supported = self.inner.transport.borrow().supports_custom_encoding();
        if supported {
            pick(&self.inner.options)
        } else {
            None
        }
    }

    // ---------------------------------------------------------------------
    // Heartbeat
    // ---------------------------------------------------------------------

    /// Send a heartbeat, or close the connection if the previous one was
    /// never acknowledged.
    pub fn send_heartbeat(&self) {
        if !self.is_connected() {
            return;
        }

        let timed_out = self.inner.pending_heartbeat_ref.borrow_mut().take().is_some();
        if timed_out {
            warn!("Heartbeat timeout, closing connection");
            metrics::record_heartbeat_timeout();
            self.abnormal_close("heartbeat timeout");
            return;
        }

        let msg_ref = self.make_ref();
        *self.inner.pending_heartbeat_ref.borrow_mut() = Some(msg_ref.clone());
        self.push(Message::new(SYSTEM_TOPIC, HEARTBEAT, Payload::empty()).with_ref(msg_ref));
        self.schedule_heartbeat();
    }

    /// Drop the connection without waiting for the peer.
    ///
    /// The handle is detached before it is asked to close, and the close is
    /// handled here, so an unresponsive peer cannot stall the reconnect.
    fn abnormal_close(&self, reason: &str) {
        self.bump_connect_clock();
        self.inner.close_was_clean.set(false);
        let conn = self.inner.conn.borrow_mut().take();
        if let Some(conn) = conn {
            conn.detach();
            conn.transport.close(Some(WS_CLOSE_HEARTBEAT_TIMEOUT), Some(reason));
        }
        self.on_conn_close(&CloseEvent::new(WS_CLOSE_HEARTBEAT_TIMEOUT, reason));
    }

    fn reset_heartbeat(&self) {
        if self
            .current_transport()
            .is_some_and(|transport| transport.skip_heartbeat())
        {
            return;
        }
        *self.inner.pending_heartbeat_ref.borrow_mut() = None;
        self.clear_heartbeats();
        self.schedule_heartbeat();
    }

    fn schedule_heartbeat(&self) {
        self.clear_heartbeats();
        let weak = self.downgrade();
        let id = self.scheduler().set_timeout(
            self.inner.options.config.heartbeat_interval(),
            Box::new(move || {
                if let Some(socket) = weak.upgrade() {
                    socket.inner.heartbeat_timer.set(None);
                    socket.send_heartbeat();
                }
            }),
        );
        self.inner.heartbeat_timer.set(Some(id));
    }

    fn clear_heartbeats(&self) {
        if let Some(id) = self.inner.heartbeat_timer.take() {
            self.scheduler().clear_timeout(id);
        }
    }

    /// Measure the round trip to the server.
    ///
    /// Returns `false` without sending anything if not connected.
    pub fn ping(&self, callback: impl FnOnce(Duration) + 'static) -> bool {
        if !self.is_connected() {
            return false;
        }

        let msg_ref = self.make_ref();
        let started = self.scheduler().now();
        self.push(
            Message::new(SYSTEM_TOPIC, HEARTBEAT, Payload::empty()).with_ref(msg_ref.clone()),
        );

        let registration = Rc::new(Cell::new(None));
        let callback = RefCell::new(Some(callback));
        let id = self.on_message({
            let weak = self.downgrade();
            let registration = registration.clone();
            move |message| {
                if message.msg_ref.as_deref() != Some(msg_ref.as_str()) {
                    return;
                }
                let Some(socket) = weak.upgrade() else {
                    return;
                };
                if let Some(id) = registration.get() {
                    socket.off(&[id]);
                }
                let callback = callback.borrow_mut().take();
                if let Some(callback) = callback {
                    callback(socket.scheduler().now().saturating_sub(started));
                }
            }
        });
        registration.set(Some(id));
        true
    }

    // ---------------------------------------------------------------------
    // Refs, channels, callbacks
    // ---------------------------------------------------------------------

    /// Next message ref.
    ///
    /// Counts up from "1" and wraps to "0" once past [`MAX_SAFE_INTEGER`].
    pub fn make_ref(&self) -> String {
        let current = self.inner.msg_ref.get();
        let next = if current > MAX_SAFE_INTEGER {
            0
        } else {
            current + 1
        };
        self.inner.msg_ref.set(next);
        next.to_string()
    }

    /// Create and register a channel for `topic`.
    pub fn channel(&self, topic: &str, params: impl Into<Params>) -> Channel {
        let channel = Channel::new(topic, params.into(), self);
        self.inner.channels.borrow_mut().push(channel.clone());
        metrics::record_channel_added();
        debug!(topic = %topic, "Channel created");
        channel
    }

    /// Registered channels, in creation order.
    #[must_use]
    pub fn channels(&self) -> Vec<Channel> {
        self.inner.channels.borrow().clone()
    }

    /// Unregister `channel` and its socket callbacks.
    pub fn remove(&self, channel: &Channel) {
        self.off(&channel.state_change_refs());
        // Dropped outside the borrow; a channel's bindings may own other channels.
        let removed: Vec<Channel> = {
            let mut channels = self.inner.channels.borrow_mut();
            let (removed, kept) = std::mem::take(&mut *channels)
                .into_iter()
                .partition(|c| c.ptr_eq(channel));
            *channels = kept;
            removed
        };
        for _ in &removed {
            metrics::record_channel_removed();
        }
    }

    /// Leave every other channel on the same topic that is joined or joining.
    pub(crate) fn leave_open_topic(&self, channel: &Channel) {
        let duplicate = self
            .inner
            .channels
            .borrow()
            .iter()
            .find(|c| {
                !c.ptr_eq(channel)
                    && c.topic() == channel.topic()
                    && (c.is_joined() || c.is_joining())
            })
            .cloned();
        if let Some(duplicate) = duplicate {
            debug!(topic = %channel.topic(), "Leaving duplicate channel");
            duplicate.leave(None);
        }
    }

    /// Run `callback` whenever the connection opens.
    pub fn on_open(&self, callback: impl Fn() + 'static) -> CallbackRef {
        let id = self.next_callback_ref();
        self.inner
            .open_callbacks
            .borrow_mut()
            .push((id, Rc::new(callback)));
        id
    }

    /// Run `callback` whenever the connection closes.
    pub fn on_close(&self, callback: impl Fn(&CloseEvent) + 'static) -> CallbackRef {
        let id = self.next_callback_ref();
        self.inner
            .close_callbacks
            .borrow_mut()
            .push((id, Rc::new(callback)));
        id
    }

    /// Run `callback` whenever the connection fails.
    pub fn on_error(
        &self,
        callback: impl Fn(&TransportError, &str, u32) + 'static,
    ) -> CallbackRef {
        let id = self.next_callback_ref();
        self.inner
            .error_callbacks
            .borrow_mut()
            .push((id, Rc::new(callback)));
        id
    }

    /// Run `callback` for every decoded inbound message.
    pub fn on_message(&self, callback: impl Fn(&Message) + 'static) -> CallbackRef {
        let id = self.next_callback_ref();
        self.inner
            .message_callbacks
            .borrow_mut()
            .push((id, Rc::new(callback)));
        id
    }

    /// Remove the callbacks registered under `refs`.
    pub fn off(&self, refs: &[CallbackRef]) {
        // Dropped callbacks may own channels, so drop them outside the borrows.
        let mut removed_open = Vec::new();
        let mut removed_close = Vec::new();
        let mut removed_error = Vec::new();
        let mut removed_message = Vec::new();
        drain_refs(&self.inner.open_callbacks, refs, &mut removed_open);
        drain_refs(&self.inner.close_callbacks, refs, &mut removed_close);
        drain_refs(&self.inner.error_callbacks, refs, &mut removed_error);
        drain_refs(&self.inner.message_callbacks, refs, &mut removed_message);
    }

    fn next_callback_ref(&self) -> CallbackRef {
        let id = self.inner.callback_ref.get() + 1;
        self.inner.callback_ref.set(id);
        CallbackRef(id)
    }

    // ---------------------------------------------------------------------
    // Internals shared with channels
    // ---------------------------------------------------------------------

    pub(crate) fn scheduler(&self) -> Rc<dyn Scheduler> {
        self.inner.env.scheduler.clone()
    }

    pub(crate) fn default_timeout(&self) -> Duration {
        self.inner.options.config.timeout()
    }

    pub(crate) fn rejoin_backoff(&self) -> BackoffFn {
        self.inner.options.rejoin_backoff()
    }

    fn current_transport(&self) -> Option<Rc<dyn Transport>> {
        self.inner
            .conn
            .borrow()
            .as_ref()
            .map(|conn| conn.transport.clone())
    }

    fn bump_connect_clock(&self) {
        self.inner
            .connect_clock
            .set(self.inner.connect_clock.get() + 1);
    }

    fn clear_fallback_timer(&self) {
        if let Some(id) = self.inner.fallback_timer.take() {
            self.scheduler().clear_timeout(id);
        }
    }

    #[cfg(test)]
    pub(crate) fn set_ref_counter(&self, value: u64) {
        self.inner.msg_ref.set(value);
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("endpoint", &self.inner.endpoint)
            .field("transport", &self.transport_name())
            .field("state", &self.connection_state())
            .field("channels", &self.inner.channels.borrow().len())
            .finish_non_exhaustive()
    }
}

fn snapshot<T: Clone>(callbacks: &RefCell<Vec<(CallbackRef, T)>>) -> Vec<T> {
    callbacks
        .borrow()
        .iter()
        .map(|(_, callback)| callback.clone())
        .collect()
}

fn drain_refs<T>(
    callbacks: &RefCell<Vec<(CallbackRef, T)>>,
    refs: &[CallbackRef],
    removed: &mut Vec<(CallbackRef, T)>,
) {
    let mut callbacks = callbacks.borrow_mut();
    let mut index = 0;
    while index < callbacks.len() {
        if refs.contains(&callbacks[index].0) {
            removed.push(callbacks.remove(index));
        } else {
            index += 1;
        }
    }
}

/// Flatten socket params into query pairs. Nested objects and arrays become
/// `key[sub]` keys; nulls are skipped.
fn flatten_params(prefix: Option<&str>, value: &Value, out: &mut Vec<(String, String)>) {
    let key_for = |key: &str| match prefix {
        Some(prefix) => format!("{prefix}[{key}]"),
        None => key.to_string(),
    };

    match value {
        Value::Object(map) => {
            for (key, value) in map {
                flatten_value(&key_for(key), value, out);
            }
        }
        Value::Array(items) => {
            for (index, value) in items.iter().enumerate() {
                flatten_value(&key_for(&index.to_string()), value, out);
            }
        }
        _ => {}
    }
}

fn flatten_value(key: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Null => {}
        Value::String(s) => out.push((key.to_string(), s.clone())),
        Value::Bool(_) | Value::Number(_) => out.push((key.to_string(), value.to_string())),
        Value::Object(_) | Value::Array(_) => flatten_params(Some(key), value, out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Location;
    use crate::test_support::{connected_socket, join_ok, socket_with, socket_with_env};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use serde_json::json;
    use tether_transport::{MemoryTransportFactory, WS_CLOSE_ABNORMAL};

    #[test]
    fn test_make_ref_sequence_and_wrap() {
        let (socket, _factory, _scheduler) = socket_with(SocketOptions::default());
        assert_eq!(socket.make_ref(), "1");
        assert_eq!(socket.make_ref(), "2");
        assert_eq!(socket.make_ref(), "3");

        socket.set_ref_counter(MAX_SAFE_INTEGER);
        assert_eq!(socket.make_ref(), "9007199254740992");
        assert_eq!(socket.make_ref(), "0");
        assert_eq!(socket.make_ref(), "1");
    }

    #[test]
    fn test_endpoint_url_absolute() {
        let options = SocketOptions::default().with_params(json!({
            "token": "abc",
            "user": {"id": 7, "tags": ["a", "b"]},
            "skip": null
        }));
        let (socket, _factory, _scheduler) = socket_with(options);

        let url = Url::parse(&socket.endpoint_url().unwrap()).unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/socket/websocket");

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("token".to_string(), "abc".to_string()),
                ("user[id]".to_string(), "7".to_string()),
                ("user[tags][0]".to_string(), "a".to_string()),
                ("user[tags][1]".to_string(), "b".to_string()),
                ("vsn".to_string(), "2.0.0".to_string()),
            ]
        );
    }

    #[test]
    fn test_endpoint_url_relative() {
        let (env, _scheduler) = Environment::manual();
        let factory = Rc::new(MemoryTransportFactory::new());

        let socket = Socket::new("/socket", factory.clone(), env.clone(), SocketOptions::default());
        assert!(matches!(
            socket.endpoint_url(),
            Err(SocketError::RelativeEndpoint(_))
        ));
        assert!(socket.connect().is_err());

        let env = env.with_location(Location::new("https:", "example.com"));
        let socket = Socket::new("/socket", factory.clone(), env.clone(), SocketOptions::default());
        assert_eq!(
            socket.endpoint_url().unwrap(),
            "wss://example.com/socket/websocket?vsn=2.0.0"
        );

        let socket = Socket::new("//other.com/socket", factory, env, SocketOptions::default());
        assert_eq!(
            socket.endpoint_url().unwrap(),
            "wss://other.com/socket/websocket?vsn=2.0.0"
        );
    }

    #[test]
    fn test_params_reevaluated_on_connect() {
        let counter = Rc::new(Cell::new(0));
        let options = SocketOptions::default().with_params(Params::from_fn({
            let counter = counter.clone();
            move || {
                counter.set(counter.get() + 1);
                json!({"token": counter.get()})
            }
        }));
        let (socket, factory, _scheduler) = socket_with(options);

        socket.connect().unwrap();
        assert!(factory.last().unwrap().url().contains("token=1"));
        socket.disconnect(None, None, None);
        socket.connect().unwrap();
        assert!(factory.last().unwrap().url().contains("token=2"));
    }

    #[test]
    fn test_connect_is_idempotent() {
        let (socket, factory, _scheduler) = socket_with(SocketOptions::default());
        socket.connect().unwrap();
        socket.connect().unwrap();
        assert_eq!(factory.open_count(), 1);
        assert_eq!(socket.connection_state(), ReadyState::Connecting);

        factory.last().unwrap().server_open();
        assert!(socket.is_connected());
    }

    #[test]
    fn test_send_buffer_flushes_on_open() {
        let (socket, factory, _scheduler) = socket_with(SocketOptions::default());
        socket.push(Message::new("room:1", "a", json!({})));
        socket.push(Message::new("room:1", "b", json!({})));
        assert_eq!(socket.buffered_count(), 2);

        socket.connect().unwrap();
        let conn = factory.last().unwrap();
        conn.server_open();

        let events: Vec<String> = conn.sent_messages().into_iter().map(|m| m.event).collect();
        assert_eq!(events, vec!["a", "b"]);
        assert_eq!(socket.buffered_count(), 0);
    }

    #[test]
    fn test_heartbeat_timeout_closes_and_reconnects() {
        let (socket, factory, scheduler) = connected_socket();
        let conn = factory.last().unwrap();

        scheduler.advance(Duration::from_millis(30_000));
        let sent = conn.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, SYSTEM_TOPIC);
        assert_eq!(sent[0].event, HEARTBEAT);

        scheduler.advance(Duration::from_millis(30_000));
        assert_eq!(
            conn.closed_with(),
            Some((
                Some(WS_CLOSE_HEARTBEAT_TIMEOUT),
                Some("heartbeat timeout".to_string())
            ))
        );
        assert!(!socket.is_connected());

        // First reconnect step is 10ms.
        scheduler.advance(Duration::from_millis(10));
        assert_eq!(factory.open_count(), 2);
    }

    #[test]
    fn test_heartbeat_ack_keeps_connection() {
        let (socket, factory, scheduler) = connected_socket();
        let conn = factory.last().unwrap();

        for _ in 0..3 {
            scheduler.advance(Duration::from_millis(30_000));
            let heartbeat = conn.sent_messages().pop().unwrap();
            assert_eq!(heartbeat.event, HEARTBEAT);
            conn.server_send_message(
                &Message::new(SYSTEM_TOPIC, "phx_reply", json!({"status": "ok", "response": {}}))
                    .with_ref(heartbeat.msg_ref.unwrap()),
            );
        }
        assert!(socket.is_connected());
        assert_eq!(conn.closed_with(), None);
    }

    #[test]
    fn test_skip_heartbeat() {
        let (socket, factory, scheduler) = socket_with(SocketOptions::default());
        socket.connect().unwrap();
        let conn = factory.last().unwrap();
        conn.set_skip_heartbeat(true);
        conn.server_open();

        scheduler.advance(Duration::from_millis(90_000));
        assert!(conn.sent().is_empty());
    }

    #[test]
    fn test_normal_close_does_not_reconnect() {
        let (_socket, factory, scheduler) = connected_socket();
        factory.last().unwrap().server_close(WS_CLOSE_NORMAL, "bye");

        scheduler.advance(Duration::from_secs(10));
        assert_eq!(factory.open_count(), 1);
    }

    #[test]
    fn test_abnormal_close_reconnects_with_backoff() {
        let (socket, factory, scheduler) = connected_socket();
        let closes = Rc::new(Cell::new(0));
        let counter = closes.clone();
        socket.on_close(move |event| {
            assert_eq!(event.code, WS_CLOSE_ABNORMAL);
            counter.set(counter.get() + 1);
        });

        factory.last().unwrap().server_close(WS_CLOSE_ABNORMAL, "");
        assert_eq!(closes.get(), 1);

        scheduler.advance(Duration::from_millis(9));
        assert_eq!(factory.open_count(), 1);
        scheduler.advance(Duration::from_millis(1));
        assert_eq!(factory.open_count(), 2);

        // The second attempt waits for the second step.
        factory.last().unwrap().server_close(WS_CLOSE_ABNORMAL, "");
        scheduler.advance(Duration::from_millis(49));
        assert_eq!(factory.open_count(), 2);
        scheduler.advance(Duration::from_millis(1));
        assert_eq!(factory.open_count(), 3);

        // Opening resets the schedule.
        factory.last().unwrap().server_open();
        factory.last().unwrap().server_close(WS_CLOSE_ABNORMAL, "");
        scheduler.advance(Duration::from_millis(10));
        assert_eq!(factory.open_count(), 4);
    }

    #[test]
    fn test_disconnect_stops_reconnect_and_runs_callback() {
        let (socket, factory, scheduler) = connected_socket();
        let done = Rc::new(Cell::new(false));
        let flag = done.clone();

        socket.disconnect(Some(Box::new(move || flag.set(true))), Some(4000), Some("done"));
        assert!(done.get());
        assert_eq!(
            factory.last().unwrap().closed_with(),
            Some((Some(4000), Some("done".to_string())))
        );
        assert_eq!(socket.connection_state(), ReadyState::Closed);

        scheduler.advance(Duration::from_secs(60));
        assert_eq!(factory.open_count(), 1);
    }

    #[test]
    fn test_disconnect_waits_for_buffer() {
        let (socket, factory, scheduler) = connected_socket();
        let conn = factory.last().unwrap();
        conn.set_buffered_amount(128);

        let done = Rc::new(Cell::new(false));
        let flag = done.clone();
        socket.disconnect(Some(Box::new(move || flag.set(true))), None, None);
        assert!(!done.get());
        assert_eq!(conn.closed_with(), None);

        conn.set_buffered_amount(0);
        scheduler.advance(Duration::from_millis(150));
        assert!(done.get());
        assert!(conn.closed_with().is_some());
    }

    #[test]
    fn test_connect_during_disconnect_replaces_closing_connection() {
        let (socket, factory, scheduler) = connected_socket();
        let old = factory.last().unwrap();
        old.set_deferred_close(true);

        let done = Rc::new(Cell::new(false));
        let flag = done.clone();
        socket.disconnect(Some(Box::new(move || flag.set(true))), None, None);
        assert_eq!(old.ready_state(), ReadyState::Closing);
        assert!(!done.get());

        socket.connect().unwrap();
        assert_eq!(factory.open_count(), 2);
        let current = factory.last().unwrap();
        current.server_open();
        assert!(socket.is_connected());

        let seen = Rc::new(Cell::new(0));
        let counter = seen.clone();
        socket.on_message(move |_| counter.set(counter.get() + 1));
        let closes = Rc::new(Cell::new(0));
        let counter = closes.clone();
        socket.on_close(move |_| counter.set(counter.get() + 1));

        // The old handle no longer reaches the socket.
        old.server_send_message(&Message::new("room:1", "evt", json!({})));
        old.finish_close();
        assert_eq!(seen.get(), 0);
        assert_eq!(closes.get(), 0);

        scheduler.advance(Duration::from_secs(5));
        assert!(done.get());
        assert!(socket.is_connected());
        assert_eq!(factory.open_count(), 2);
        assert_eq!(current.closed_with(), None);
    }

    #[test]
    fn test_heartbeat_timeout_does_not_wait_for_close_handshake() {
        let (socket, factory, scheduler) = connected_socket();
        let channel = socket.channel("room:1", json!({}));
        channel.join(None).unwrap();
        join_ok(&factory, &channel);

        let conn = factory.last().unwrap();
        conn.set_deferred_close(true);
        let codes = Rc::new(RefCell::new(Vec::new()));
        let log = codes.clone();
        socket.on_close(move |event| log.borrow_mut().push(event.code));

        scheduler.advance(Duration::from_millis(60_000));
        assert_eq!(conn.ready_state(), ReadyState::Closing);
        assert_eq!(socket.connection_state(), ReadyState::Closed);
        assert_eq!(*codes.borrow(), vec![WS_CLOSE_HEARTBEAT_TIMEOUT]);
        assert!(channel.is_errored());

        scheduler.advance(Duration::from_millis(10));
        assert_eq!(factory.open_count(), 2);

        // A late answer from the dead connection is ignored.
        conn.finish_close();
        assert_eq!(codes.borrow().len(), 1);

        factory.last().unwrap().server_open();
        assert!(socket.is_connected());
        assert!(channel.is_joining());
    }

    #[test]
    fn test_connection_error_errors_live_channels() {
        let (socket, factory, _scheduler) = connected_socket();
        let joined = socket.channel("room:1", json!({}));
        joined.join(None).unwrap();
        join_ok(&factory, &joined);
        let joining = socket.channel("room:2", json!({}));
        joining.join(None).unwrap();
        let idle = socket.channel("room:3", json!({}));

        let errors = Rc::new(RefCell::new(Vec::new()));
        let log = errors.clone();
        socket.on_error(move |_, transport, established| {
            log.borrow_mut().push((transport.to_string(), established));
        });

        factory
            .last()
            .unwrap()
            .server_error(TransportError::ReceiveFailed("reset".into()));

        assert_eq!(*errors.borrow(), vec![("memory".to_string(), 1)]);
        assert!(joined.is_errored());
        assert!(joining.is_errored());
        assert!(idle.is_closed());
    }

    #[test]
    fn test_close_leaves_leaving_and_closed_channels() {
        let (socket, factory, _scheduler) = connected_socket();
        let leaving = socket.channel("room:1", json!({}));
        leaving.join(None).unwrap();
        join_ok(&factory, &leaving);
        leaving.leave(None);
        assert!(leaving.is_leaving());
        let closed = socket.channel("room:2", json!({}));

        factory.last().unwrap().server_close(WS_CLOSE_ABNORMAL, "");
        assert!(leaving.is_leaving());
        assert!(closed.is_closed());
    }

    #[test]
    fn test_channels_active_gauge_follows_socket() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let active = || {
            handle
                .render()
                .lines()
                .find(|line| line.starts_with(crate::metrics::names::CHANNELS_ACTIVE))
                .and_then(|line| line.rsplit(' ').next())
                .and_then(|value| value.parse::<f64>().ok())
        };

        ::metrics::with_local_recorder(&recorder, || {
            let (socket, _factory, _scheduler) = socket_with(SocketOptions::default());
            let first = socket.channel("room:1", json!({}));
            socket.channel("room:2", json!({}));
            socket.channel("room:3", json!({}));
            assert_eq!(active(), Some(3.0));

            socket.remove(&first);
            assert_eq!(active(), Some(2.0));

            drop(socket);
            assert_eq!(active(), Some(0.0));
        });
    }

    #[test]
    fn test_close_errors_live_channels() {
        let (socket, factory, _scheduler) = connected_socket();
        let joined = socket.channel("room:1", json!({}));
        joined.join(None).unwrap();
        join_ok(&factory, &joined);
        let idle = socket.channel("room:2", json!({}));

        factory.last().unwrap().server_close(WS_CLOSE_ABNORMAL, "");
        assert!(joined.is_errored());
        assert!(idle.is_closed());
    }

    #[test]
    fn test_channels_rejoin_after_reconnect() {
        let (socket, factory, scheduler) = connected_socket();
        let channel = socket.channel("room:1", json!({}));
        channel.join(None).unwrap();
        join_ok(&factory, &channel);

        factory.last().unwrap().server_close(WS_CLOSE_ABNORMAL, "");
        assert!(channel.is_errored());

        scheduler.advance(Duration::from_millis(10));
        let conn = factory.last().unwrap();
        conn.server_open();
        assert!(channel.is_joining());
        assert_eq!(conn.sent_messages()[0].event, "phx_join");

        join_ok(&factory, &channel);
        assert!(channel.is_joined());
    }

    #[test]
    fn test_routes_by_topic_and_runs_message_callbacks() {
        let (socket, factory, _scheduler) = connected_socket();
        let lobby = socket.channel("room:lobby", json!({}));
        let other = socket.channel("room:other", json!({}));
        let hits = Rc::new(RefCell::new(Vec::new()));

        for (channel, name) in [(&lobby, "lobby"), (&other, "other")] {
            let hits = hits.clone();
            channel.on("new_msg", move |_, _| hits.borrow_mut().push(name));
        }
        let seen = Rc::new(Cell::new(0));
        let counter = seen.clone();
        socket.on_message(move |_| counter.set(counter.get() + 1));

        factory
            .last()
            .unwrap()
            .server_send_message(&Message::new("room:lobby", "new_msg", json!({})));

        assert_eq!(*hits.borrow(), vec!["lobby"]);
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let (socket, factory, _scheduler) = connected_socket();
        let seen = Rc::new(Cell::new(0));
        let counter = seen.clone();
        socket.on_message(move |_| counter.set(counter.get() + 1));

        let conn = factory.last().unwrap();
        conn.server_send(Frame::Text("{not json".into()));
        conn.server_send(Frame::Binary(bytes::Bytes::from_static(&[9, 1, 2])));
        assert_eq!(seen.get(), 0);
        assert!(socket.is_connected());

        assert!(socket.decode(&Frame::Text("[".into())).is_err());
    }

    #[test]
    fn test_ping_reports_round_trip() {
        let (socket, factory, scheduler) = connected_socket();
        let rtt = Rc::new(Cell::new(None));
        let slot = rtt.clone();

        assert!(socket.ping(move |elapsed| slot.set(Some(elapsed))));
        let ping = factory.last().unwrap().sent_messages().pop().unwrap();
        assert_eq!(ping.event, HEARTBEAT);

        scheduler.advance(Duration::from_millis(42));
        factory.last().unwrap().server_send_message(
            &Message::new(SYSTEM_TOPIC, "phx_reply", json!({"status": "ok", "response": {}}))
                .with_ref(ping.msg_ref.unwrap()),
        );
        assert_eq!(rtt.get(), Some(Duration::from_millis(42)));

        let (offline, _factory, _scheduler) = socket_with(SocketOptions::default());
        assert!(!offline.ping(|_| {}));
    }

    #[test]
    fn test_off_removes_callbacks() {
        let (socket, factory, _scheduler) = socket_with(SocketOptions::default());
        let opens = Rc::new(Cell::new(0));
        let counter = opens.clone();
        let id = socket.on_open(move || counter.set(counter.get() + 1));
        socket.off(&[id]);

        socket.connect().unwrap();
        factory.last().unwrap().server_open();
        assert_eq!(opens.get(), 0);
    }

    #[test]
    fn test_custom_codec_only_when_supported() {
        let encode: crate::config::EncodeFn = Rc::new(|message: &Message| {
            Ok::<_, ProtocolError>(Frame::Text(format!("custom:{}", message.event)))
        });

        let options = SocketOptions::default().with_encode(encode.clone());
        let (socket, _factory, _scheduler) = socket_with(options.clone());
        let message = Message::new("room:1", "evt", json!({}));
        assert_eq!(socket.encode(&message).unwrap(), Frame::Text("custom:evt".into()));

        let (env, _scheduler) = Environment::manual();
        let polling = Rc::new(MemoryTransportFactory::named("longpoll").without_custom_encoding());
        let socket = Socket::new("ws://localhost/socket", polling, env, options);
        assert!(matches!(
            socket.encode(&message).unwrap(),
            Frame::Text(text) if text.starts_with('[')
        ));
    }

    #[test]
    fn test_fallback_after_timeout() {
        let fallback = Rc::new(MemoryTransportFactory::named("longpoll"));
        let options = SocketOptions::default()
            .with_fallback(fallback.clone(), Duration::from_millis(2_500));
        let (socket, primary, scheduler) = socket_with(options);

        socket.connect().unwrap();
        assert_eq!(socket.transport_name(), "memory");

        scheduler.advance(Duration::from_millis(2_500));
        assert_eq!(socket.transport_name(), "longpoll");
        assert_eq!(fallback.open_count(), 1);
        assert!(primary.last().unwrap().closed_with().is_some());

        fallback.last().unwrap().server_open();
        assert!(socket.is_connected());

        // The switch is permanent.
        socket.disconnect(None, None, None);
        socket.connect().unwrap();
        assert_eq!(primary.open_count(), 1);
        assert_eq!(fallback.open_count(), 2);
    }

    #[test]
    fn test_fallback_on_error_before_open() {
        let fallback = Rc::new(MemoryTransportFactory::named("longpoll"));
        let options = SocketOptions::default()
            .with_fallback(fallback.clone(), Duration::from_millis(2_500));
        let (socket, primary, scheduler) = socket_with(options);

        let errors = Rc::new(RefCell::new(Vec::new()));
        let log = errors.clone();
        socket.on_error(move |_, transport, established| {
            log.borrow_mut().push((transport.to_string(), established));
        });

        socket.connect().unwrap();
        primary
            .last()
            .unwrap()
            .server_error(TransportError::ConnectFailed("refused".into()));

        assert_eq!(*errors.borrow(), vec![("memory".to_string(), 0)]);
        assert_eq!(socket.transport_name(), "longpoll");
        assert_eq!(fallback.open_count(), 1);

        // The fallback timer was cleared.
        scheduler.advance(Duration::from_secs(10));
        assert_eq!(fallback.open_count(), 1);
    }

    #[test]
    fn test_primary_open_cancels_fallback() {
        let fallback = Rc::new(MemoryTransportFactory::named("longpoll"));
        let options = SocketOptions::default()
            .with_fallback(fallback.clone(), Duration::from_millis(2_500));
        let (socket, primary, scheduler) = socket_with(options);

        socket.connect().unwrap();
        primary.last().unwrap().server_open();
        scheduler.advance(Duration::from_secs(5));

        assert_eq!(socket.transport_name(), "memory");
        assert_eq!(fallback.open_count(), 0);
    }

    #[test]
    fn test_replace_transport() {
        let (socket, primary, _scheduler) = connected_socket();
        let channel = socket.channel("room:1", json!({}));
        channel.join(None).unwrap();
        join_ok(&primary, &channel);

        let next = Rc::new(MemoryTransportFactory::named("next"));
        socket.replace_transport(next.clone());
        assert!(primary.last().unwrap().closed_with().is_some());
        assert_eq!(socket.connection_state(), ReadyState::Closed);
        assert!(channel.is_errored());

        socket.connect().unwrap();
        next.last().unwrap().server_open();
        assert!(channel.is_joining());
    }

    #[test]
    fn test_duplicate_topic_is_left_on_join() {
        let (socket, factory, _scheduler) = connected_socket();
        let first = socket.channel("room:1", json!({}));
        first.join(None).unwrap();
        join_ok(&factory, &first);

        let second = socket.channel("room:1", json!({}));
        second.join(None).unwrap();

        assert!(first.is_leaving());
        assert!(second.is_joining());
    }

    #[test]
    fn test_socket_environment_location() {
        let (env, _scheduler) = Environment::manual();
        let env = env.with_location(Location::new("http:", "localhost:4000"));
        let (socket, factory) = socket_with_env("/socket", env);

        socket.connect().unwrap();
        assert_eq!(
            factory.last().unwrap().url(),
            "ws://localhost:4000/socket/websocket?vsn=2.0.0"
        );
    }
}
