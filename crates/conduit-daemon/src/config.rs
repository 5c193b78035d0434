//! Server configuration.

use std::time::Duration;

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:7171";

/// Maximum concurrent connections.
const MAX_CONNECTIONS: usize = 100;

/// Default deadline for the unauthenticated phase of a connection.
///
/// A peer that connects but never completes handshake and authentication
/// is cut off so it cannot pin a connection slot.
const AUTH_DEADLINE: Duration = Duration::from_secs(10);

/// Configuration for the channel server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds, `host:port`.
    pub bind_addr: String,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Server info string for the handshake.
    pub server_info: String,

    /// Deadline for completing handshake and authentication.
    pub auth_deadline: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            max_connections: MAX_CONNECTIONS,
            server_info: format!("conduit-daemon/{}", env!("CARGO_PKG_VERSION")),
            auth_deadline: AUTH_DEADLINE,
        }
    }
}

impl ServerConfig {
    /// Create a config listening on the given address.
    #[must_use]
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Default::default()
        }
    }

    /// Set the maximum concurrent connections.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the server info string.
    #[must_use]
    pub fn with_server_info(mut self, info: impl Into<String>) -> Self {
        self.server_info = info.into();
        self
    }

    /// Set the unauthenticated-phase deadline.
    #[must_use]
    pub const fn with_auth_deadline(mut self, deadline: Duration) -> Self {
        self.auth_deadline = deadline;
        self
    }
}
