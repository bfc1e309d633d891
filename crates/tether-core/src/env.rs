//! Host environment handed to the socket.

use std::fmt;
use std::rc::Rc;

use crate::timer::{ManualScheduler, Scheduler, TokioScheduler};

/// Location of the page or host the client runs under.
///
/// Used to resolve relative endpoints such as `/socket` or `//host/socket`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Scheme including the trailing colon, e.g. `https:`.
    pub protocol: String,
    /// Host with optional port, e.g. `example.com:4000`.
    pub host: String,
}

impl Location {
    /// Create a location.
    #[must_use]
    pub fn new(protocol: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
        }
    }

    /// Whether the host page is served over TLS.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.protocol.starts_with("https")
    }

    /// WebSocket scheme matching the page scheme.
    #[must_use]
    pub fn socket_protocol(&self) -> &'static str {
        if self.is_secure() {
            "wss"
        } else {
            "ws"
        }
    }
}

/// Scheduler and location shared by a socket and its channels.
#[derive(Clone)]
pub struct Environment {
    /// Timer source.
    pub scheduler: Rc<dyn Scheduler>,
    /// Host location, if any.
    pub location: Option<Location>,
}

impl Environment {
    /// Create an environment with no location.
    #[must_use]
    pub fn new(scheduler: Rc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            location: None,
        }
    }

    /// Environment backed by tokio timers. Requires a `LocalSet`.
    #[must_use]
    pub fn tokio() -> Self {
        Self::new(Rc::new(TokioScheduler::new()))
    }

    /// Environment on virtual time, returning the scheduler to drive it.
    #[must_use]
    pub fn manual() -> (Self, Rc<ManualScheduler>) {
        let scheduler = Rc::new(ManualScheduler::new());
        (Self::new(scheduler.clone()), scheduler)
    }

    /// Set the host location.
    #[must_use]
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}
