//! WebSocket transport implementation.
//!
//! Client connections over tokio-tungstenite. Each connection drives its I/O
//! on a local task, so [`WebSocketTransport::open`] must be called from
//! inside a `tokio::task::LocalSet`.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;
use tether_protocol::Frame;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame, WebSocketConfig as WsConfig},
        Message,
    },
};
use tracing::{debug, error, trace, warn};

use crate::traits::{
    CloseEvent, ReadyState, Transport, TransportError, TransportEvents, TransportFactory,
    WS_CLOSE_ABNORMAL, WS_CLOSE_NORMAL,
};

/// Close code used when the peer sent a close frame without a status.
const WS_CLOSE_NO_STATUS: u16 = 1005;

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Disable Nagle's algorithm on the underlying TCP stream.
    pub disable_nagle: bool,
    /// How long a requested close waits for the peer's close frame before
    /// the connection is dropped.
    pub close_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 8 * 1024 * 1024, // 8 MiB
            disable_nagle: true,
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// WebSocket transport.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn open(&self, url: &str, events: TransportEvents) -> Rc<dyn Transport> {
        let shared = Rc::new(Shared {
            state: Cell::new(ReadyState::Connecting),
            buffered: Cell::new(0),
        });
        let (outbound, rx) = mpsc::unbounded_channel();

        tokio::task::spawn_local(run_connection(
            url.to_string(),
            self.config.clone(),
            shared.clone(),
            rx,
            events,
        ));

        Rc::new(WebSocketConnection { shared, outbound })
    }
}

struct Shared {
    state: Cell<ReadyState>,
    buffered: Cell<usize>,
}

enum Outbound {
    Frame(Frame),
    Close(Option<u16>, Option<String>),
}

/// A WebSocket connection handle.
pub struct WebSocketConnection {
    shared: Rc<Shared>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Transport for WebSocketConnection {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.shared.state.get() != ReadyState::Open {
            return Err(TransportError::ConnectionClosed);
        }

        let len = frame.len();
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::ConnectionClosed)?;
        self.shared.buffered.set(self.shared.buffered.get() + len);
        Ok(())
    }

    fn close(&self, code: Option<u16>, reason: Option<&str>) {
        match self.shared.state.get() {
            ReadyState::Closing | ReadyState::Closed => return,
            ReadyState::Connecting | ReadyState::Open => {}
        }
        self.shared.state.set(ReadyState::Closing);
        // The task is gone if this fails, and it reports its own close.
        let _ = self
            .outbound
            .send(Outbound::Close(code, reason.map(str::to_string)));
    }

    fn ready_state(&self) -> ReadyState {
        self.shared.state.get()
    }

    fn buffered_amount(&self) -> usize {
        self.shared.buffered.get()
    }
}

fn to_ws_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(bytes) => Message::Binary(bytes.to_vec()),
    }
}

async fn run_connection(
    url: String,
    config: WebSocketConfig,
    shared: Rc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: TransportEvents,
) {
    let mut ws_config = WsConfig::default();
    ws_config.max_message_size = Some(config.max_message_size);

    let handshake = connect_async_with_config(url.as_str(), Some(ws_config), config.disable_nagle);
    let connected = tokio::select! {
        result = handshake => Some(result),
        // Only a close request can arrive while connecting.
        _ = outbound.recv() => None,
    };

    let stream = match connected {
        Some(Ok((stream, _response))) => stream,
        Some(Err(e)) => {
            error!(url = %url, error = %e, "WebSocket connect failed");
            shared.state.set(ReadyState::Closed);
            events.error(TransportError::ConnectFailed(e.to_string()));
            events.close(CloseEvent::new(WS_CLOSE_ABNORMAL, ""));
            return;
        }
        None => {
            debug!(url = %url, "WebSocket closed before handshake completed");
            shared.state.set(ReadyState::Closed);
            events.close(CloseEvent::new(WS_CLOSE_NORMAL, ""));
            return;
        }
    };

    debug!(url = %url, "WebSocket handshake completed");
    shared.state.set(ReadyState::Open);
    events.open();

    let (mut sink, mut stream) = stream.split();
    let mut close_deadline: Option<Instant> = None;

    let close_event = loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Frame(frame)) => {
                    let len = frame.len();
                    let result = sink.send(to_ws_message(frame)).await;
                    shared.buffered.set(shared.buffered.get().saturating_sub(len));
                    if let Err(e) = result {
                        warn!(url = %url, error = %e, "WebSocket send failed");
                        events.error(TransportError::SendFailed(e.to_string()));
                        break CloseEvent::new(WS_CLOSE_ABNORMAL, "");
                    }
                }
                Some(Outbound::Close(code, reason)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code.unwrap_or(WS_CLOSE_NORMAL)),
                        reason: reason.unwrap_or_default().into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        debug!(url = %url, error = %e, "Failed to send close frame");
                        break CloseEvent::new(WS_CLOSE_ABNORMAL, "");
                    }
                    // Keep reading until the server answers the close.
                    close_deadline = Some(Instant::now() + config.close_timeout);
                }
                None => {
                    // Connection handle dropped.
                    let _ = sink.close().await;
                    break CloseEvent::new(WS_CLOSE_NORMAL, "");
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    trace!(url = %url, len = text.len(), "WebSocket text frame");
                    events.message(Frame::Text(text));
                }
                Some(Ok(Message::Binary(data))) => {
                    trace!(url = %url, len = data.len(), "WebSocket binary frame");
                    events.message(Frame::Binary(Bytes::from(data)));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(url = %url, "Received close frame");
                    break match frame {
                        Some(frame) => {
                            CloseEvent::new(u16::from(frame.code), frame.reason.to_string())
                        }
                        None => CloseEvent::new(WS_CLOSE_NO_STATUS, ""),
                    };
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                    // Pings are answered by tungstenite.
                }
                Some(Err(e)) => {
                    error!(url = %url, error = %e, "WebSocket error");
                    events.error(TransportError::ReceiveFailed(e.to_string()));
                    break CloseEvent::new(WS_CLOSE_ABNORMAL, "");
                }
                None => {
                    debug!(url = %url, "WebSocket stream ended");
                    break CloseEvent::new(WS_CLOSE_ABNORMAL, "");
                }
            },
            _ = sleep_until(close_deadline.unwrap_or_else(Instant::now)),
                if close_deadline.is_some() =>
            {
                warn!(
                    url = %url,
                    timeout = ?config.close_timeout,
                    "Peer did not answer close, dropping connection"
                );
                break CloseEvent::new(WS_CLOSE_ABNORMAL, "");
            }
        }
    };

    shared.state.set(ReadyState::Closed);
    events.close(close_event);
}
