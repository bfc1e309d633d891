//! Socket configuration.
//!
//! [`SocketConfig`] holds the plain values and can be deserialized from a
//! config file. [`SocketOptions`] wraps it together with the pieces that
//! can only be supplied in code: parameter providers, custom backoff
//! schedules, custom codecs, and a fallback transport.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;
use tether_protocol::{Frame, Message, ProtocolError};
use tether_transport::TransportFactory;

use crate::backoff::{self, BackoffFn};

/// Socket configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Default request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Reconnect delays in milliseconds, one per attempt.
    #[serde(default = "default_reconnect_after_ms")]
    pub reconnect_after_ms: Vec<u64>,

    /// Reconnect delay once the steps are exhausted.
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Rejoin delays in milliseconds, one per attempt.
    #[serde(default = "default_rejoin_after_ms")]
    pub rejoin_after_ms: Vec<u64>,

    /// Rejoin delay once the steps are exhausted.
    #[serde(default = "default_rejoin_max_ms")]
    pub rejoin_max_ms: u64,

    /// Switch to the fallback transport if the primary has not opened
    /// within this many milliseconds.
    #[serde(default)]
    pub fallback_after_ms: Option<u64>,

    /// Protocol version sent as the `vsn` query parameter.
    #[serde(default = "default_vsn")]
    pub vsn: String,
}

// Default value functions
fn default_timeout_ms() -> u64 {
    10_000 // 10 seconds
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_reconnect_after_ms() -> Vec<u64> {
    vec![10, 50, 100, 150, 200, 250, 500, 1_000, 2_000]
}

fn default_reconnect_max_ms() -> u64 {
    5_000
}

fn default_rejoin_after_ms() -> Vec<u64> {
    vec![1_000, 2_000, 5_000]
}

fn default_rejoin_max_ms() -> u64 {
    10_000
}

fn default_vsn() -> String {
    tether_protocol::PROTOCOL_VERSION.to_string()
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            reconnect_after_ms: default_reconnect_after_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            rejoin_after_ms: default_rejoin_after_ms(),
            rejoin_max_ms: default_rejoin_max_ms(),
            fallback_after_ms: None,
            vsn: default_vsn(),
        }
    }
}

impl SocketConfig {
    /// Default request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Heartbeat interval.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Fallback grace period, if configured.
    #[must_use]
    pub fn fallback_after(&self) -> Option<Duration> {
        self.fallback_after_ms.map(Duration::from_millis)
    }

    /// Reconnect schedule built from the configured steps.
    #[must_use]
    pub fn reconnect_backoff(&self) -> BackoffFn {
        backoff::stepped(&self.reconnect_after_ms, self.reconnect_max_ms)
    }

    /// Rejoin schedule built from the configured steps.
    #[must_use]
    pub fn rejoin_backoff(&self) -> BackoffFn {
        backoff::stepped(&self.rejoin_after_ms, self.rejoin_max_ms)
    }
}

/// Parameter provider, re-evaluated every time parameters are sent.
#[derive(Clone)]
pub struct Params(Rc<dyn Fn() -> Value>);

impl Params {
    /// Parameters computed on demand, e.g. a freshly minted token.
    pub fn from_fn(provider: impl Fn() -> Value + 'static) -> Self {
        Self(Rc::new(provider))
    }

    /// An empty object.
    #[must_use]
    pub fn empty() -> Self {
        Self::from(Value::Object(Map::new()))
    }

    /// Current parameter value.
    #[must_use]
    pub fn resolve(&self) -> Value {
        (self.0)()
    }
}

impl Default for Params {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Value> for Params {
    fn from(value: Value) -> Self {
        Self::from_fn(move || value.clone())
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Params").field(&self.resolve()).finish()
    }
}

/// Custom message encoder.
pub type EncodeFn = Rc<dyn Fn(&Message) -> Result<Frame, ProtocolError>>;

/// Custom frame decoder.
pub type DecodeFn = Rc<dyn Fn(&Frame) -> Result<Message, ProtocolError>>;

/// Everything a socket is built from besides its endpoint and transport.
#[derive(Clone, Default)]
pub struct SocketOptions {
    /// Plain configuration values.
    pub config: SocketConfig,
    /// Socket parameters, sent as query pairs on every connect.
    pub params: Params,
    /// Overrides the configured reconnect schedule.
    pub reconnect_after: Option<BackoffFn>,
    /// Overrides the configured rejoin schedule.
    pub rejoin_after: Option<BackoffFn>,
    /// Custom encoder, used only on transports that allow it.
    pub encode: Option<EncodeFn>,
    /// Custom decoder, used only on transports that allow it.
    pub decode: Option<DecodeFn>,
    /// Transport to switch to if the primary never opens.
    pub fallback: Option<Rc<dyn TransportFactory>>,
}

impl SocketOptions {
    /// Options from a config.
    #[must_use]
    pub fn new(config: SocketConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Set the socket parameters.
    #[must_use]
    pub fn with_params(mut self, params: impl Into<Params>) -> Self {
        self.params = params.into();
        self
    }

    /// Set a custom reconnect schedule.
    #[must_use]
    pub fn with_reconnect_after(mut self, calc: BackoffFn) -> Self {
        self.reconnect_after = Some(calc);
        self
    }

    /// Set a custom rejoin schedule.
    #[must_use]
    pub fn with_rejoin_after(mut self, calc: BackoffFn) -> Self {
        self.rejoin_after = Some(calc);
        self
    }

    /// Set a custom encoder.
    #[must_use]
    pub fn with_encode(mut self, encode: EncodeFn) -> Self {
        self.encode = Some(encode);
        self
    }

    /// Set a custom decoder.
    #[must_use]
    pub fn with_decode(mut self, decode: DecodeFn) -> Self {
        self.decode = Some(decode);
        self
    }

    /// Switch to `factory` if the primary transport has not opened after
    /// `after`.
    #[must_use]
    pub fn with_fallback(mut self, factory: Rc<dyn TransportFactory>, after: Duration) -> Self {
        self.fallback = Some(factory);
        self.config.fallback_after_ms = Some(after.as_millis() as u64);
        self
    }

    pub(crate) fn reconnect_backoff(&self) -> BackoffFn {
        self.reconnect_after
            .clone()
            .unwrap_or_else(|| self.config.reconnect_backoff())
    }

    pub(crate) fn rejoin_backoff(&self) -> BackoffFn {
        self.rejoin_after
            .clone()
            .unwrap_or_else(|| self.config.rejoin_backoff())
    }
}

impl fmt::Debug for SocketOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketOptions")
            .field("config", &self.config)
            .field("params", &self.params)
            .field("custom_encode", &self.encode.is_some())
            .field("custom_decode", &self.decode.is_some())
            .field("fallback", &self.fallback.as_ref().map(|f| f.name()))
            .finish_non_exhaustive()
    }
}
