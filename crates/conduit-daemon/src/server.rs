//! The channel server: listener, connection limits, accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use conduit_core::identity::KeyPair;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::auth::AuthorizedKeys;
use crate::config::ServerConfig;
use crate::dispatch;
use crate::registry::CommandRegistry;

/// Server lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The configured bind address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Accepting a connection failed fatally.
    #[error("accept failed: {source}")]
    Accept {
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// State shared by every connection of one server.
pub(crate) struct ServerShared {
    pub(crate) config: ServerConfig,
    pub(crate) keypair: KeyPair,
    pub(crate) keys: AuthorizedKeys,
    pub(crate) registry: CommandRegistry,
}

/// The listening side of the channel.
///
/// Owns the server identity key, the registered client keys, and the
/// operation registry. Each accepted connection is handled on its own task;
/// concurrent connections are limited by a semaphore whose permits live for
/// the lifetime of the connection.
pub struct Server {
    listener: TcpListener,
    shared: Arc<ServerShared>,
    connection_sem: Arc<Semaphore>,
}

impl Server {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the configured address cannot be
    /// bound.
    pub async fn bind(
        config: ServerConfig,
        keypair: KeyPair,
        keys: AuthorizedKeys,
        registry: CommandRegistry,
    ) -> Result<Self, ServerError> {
        let listener =
            TcpListener::bind(&config.bind_addr)
                .await
                .map_err(|source| ServerError::Bind {
                    addr: config.bind_addr.clone(),
                    source,
                })?;
        info!(
            addr = %config.bind_addr,
            identity = %keypair.public_key(),
            registered_keys = keys.len(),
            operations = registry.len(),
            "server listening"
        );

        let connection_sem = Arc::new(Semaphore::new(config.max_connections));
        Ok(Self {
            listener,
            shared: Arc::new(ServerShared {
                config,
                keypair,
                keys,
                registry,
            }),
            connection_sem,
        })
    }

    /// The bound local address; useful when binding port 0.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the socket is gone.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The server's identity key.
    #[must_use]
    pub fn identity(&self) -> conduit_core::identity::PublicKey {
        self.shared.keypair.public_key()
    }

    /// Accept and serve connections until a fatal accept error.
    ///
    /// Connection tasks are owned by the returned future: dropping it
    /// (or aborting the task running it) tears every live connection down.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Accept`] if the listener fails; callers
    /// decide whether to rebind.
    pub async fn run(self) -> Result<(), ServerError> {
        let mut connections: JoinSet<()> = JoinSet::new();

        loop {
            // Reap finished connection tasks.
            while connections.try_join_next().is_some() {}

            let permit = Arc::clone(&self.connection_sem)
                .acquire_owned()
                .await
                .expect("connection semaphore closed");

            let (stream, peer_addr) = self
                .listener
                .accept()
                .await
                .map_err(|source| ServerError::Accept { source })?;
            let _ = stream.set_nodelay(true);
            debug!(%peer_addr, "connection accepted");

            let shared = Arc::clone(&self.shared);
            connections.spawn(async move {
                let _permit = permit;
                if let Err(e) = dispatch::handle_connection(stream, peer_addr, shared).await {
                    warn!(%peer_addr, error = %e, "connection ended with error");
                }
            });
        }
    }
}
