//! Helpers for unit tests: sockets over the in-memory transport on virtual
//! time.

use serde_json::{json, Value};
use std::rc::Rc;
use tether_protocol::events::PHX_REPLY;
use tether_protocol::Message;
use tether_transport::MemoryTransportFactory;

use crate::channel::Channel;
use crate::config::SocketOptions;
use crate::env::Environment;
use crate::socket::Socket;
use crate::timer::ManualScheduler;

pub(crate) const TEST_ENDPOINT: &str = "ws://localhost/socket";

/// A socket that has not connected yet.
pub(crate) fn socket_with(
    options: SocketOptions,
) -> (Socket, Rc<MemoryTransportFactory>, Rc<ManualScheduler>) {
    let (env, scheduler) = Environment::manual();
    let factory = Rc::new(MemoryTransportFactory::new());
    let socket = Socket::new(TEST_ENDPOINT, factory.clone(), env, options);
    (socket, factory, scheduler)
}

/// A socket on `endpoint` in a caller-built environment.
pub(crate) fn socket_with_env(
    endpoint: &str,
    env: Environment,
) -> (Socket, Rc<MemoryTransportFactory>) {
    let factory = Rc::new(MemoryTransportFactory::new());
    let socket = Socket::new(endpoint, factory.clone(), env, SocketOptions::default());
    (socket, factory)
}

/// A socket with an open connection and default options.
pub(crate) fn connected_socket() -> (Socket, Rc<MemoryTransportFactory>, Rc<ManualScheduler>) {
    let (socket, factory, scheduler) = socket_with(SocketOptions::default());
    socket.connect().unwrap();
    factory.last().unwrap().server_open();
    (socket, factory, scheduler)
}

/// A server reply to the push with `msg_ref`.
pub(crate) fn reply(
    topic: &str,
    join_ref: &str,
    msg_ref: &str,
    status: &str,
    response: Value,
) -> Message {
    Message::new(topic, PHX_REPLY, json!({"status": status, "response": response}))
        .with_join_ref(join_ref)
        .with_ref(msg_ref)
}

/// Acknowledge the current join of `channel`.
pub(crate) fn join_ok(factory: &MemoryTransportFactory, channel: &Channel) {
    let join_ref = channel.join_ref().unwrap();
    factory
        .last()
        .unwrap()
        .server_send_message(&reply(channel.topic(), &join_ref, &join_ref, "ok", json!({})));
}
