//! # Tether
//!
//! Command-line channels client: connects to a server, joins the configured
//! topics, and logs everything that arrives.
//!
//! ## Usage
//!
//! ```bash
//! # Run with tether.toml from the working directory
//! tether
//!
//! # Point at another server
//! TETHER_ENDPOINT=wss://example.com/socket tether
//!
//! # More detail
//! RUST_LOG=tether=trace tether
//! ```

mod config;
mod metrics;

use anyhow::Result;
use serde_json::Value;
use std::rc::Rc;
use std::time::Duration;
use tether_core::{Environment, Presence, PresenceEvents, ReplyStatus, Socket, SocketOptions};
use tether_transport::WebSocketTransport;
use tokio::sync::oneshot;
use tokio::task::LocalSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long shutdown waits for the connection to close.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    info!(endpoint = %config.endpoint, topics = config.topics.len(), "Starting Tether client");

    // Initialize metrics
    metrics::install(&config)?;

    // The socket is single-threaded; everything runs on one local set.
    LocalSet::new().run_until(run(config)).await
}

async fn run(config: config::Config) -> Result<()> {
    let transport = Rc::new(WebSocketTransport::new(config.websocket()));
    let options =
        SocketOptions::new(config.socket.clone()).with_params(Value::Object(config.params.clone()));
    let socket = Socket::new(&config.endpoint, transport, Environment::tokio(), options);

    socket.on_open(|| info!("Socket connected"));
    socket.on_close(|event| info!(code = event.code, reason = %event.reason, "Socket closed"));
    socket.on_error(|error, transport, established| {
        warn!(error = %error, transport = %transport, established, "Socket error");
    });
    socket.on_message(|message| {
        info!(
            topic = %message.topic,
            event = %message.event,
            msg_ref = ?message.msg_ref,
            payload = ?message.payload,
            "Message"
        );
    });

    let mut presences = Vec::new();
    for topic in &config.topics {
        let channel = socket.channel(&topic.topic, Value::Object(topic.params.clone()));

        if topic.presence {
            let presence = Presence::new(&channel, PresenceEvents::default());
            let name = topic.topic.clone();
            presence.on_join(move |key, current, _| {
                if current.is_none() {
                    info!(topic = %name, key = %key, "Presence joined");
                }
            });
            let name = topic.topic.clone();
            presence.on_leave(move |key, current, _| {
                if current.metas.is_empty() {
                    info!(topic = %name, key = %key, "Presence left");
                }
            });
            presences.push(presence);
        }

        let name = topic.topic.clone();
        channel.on_error(move |_, _| warn!(topic = %name, "Channel errored"));

        let joined = topic.topic.clone();
        let rejected = topic.topic.clone();
        let timed_out = topic.topic.clone();
        channel
            .join(None)?
            .receive(ReplyStatus::Ok, move |response| {
                info!(topic = %joined, response = ?response, "Joined");
            })
            .receive(ReplyStatus::Error, move |response| {
                error!(topic = %rejected, response = ?response, "Join rejected");
            })
            .receive(ReplyStatus::Timeout, move |_| {
                warn!(topic = %timed_out, "Join timed out, retrying");
            });
    }

    socket.connect()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    let (tx, rx) = oneshot::channel();
    socket.disconnect(
        Some(Box::new(move || {
            let _ = tx.send(());
        })),
        None,
        Some("client shutdown"),
    );
    if tokio::time::timeout(SHUTDOWN_GRACE, rx).await.is_err() {
        warn!("Connection did not close in time");
    }

    drop(presences);
    debug!("Client stopped");
    Ok(())
}
