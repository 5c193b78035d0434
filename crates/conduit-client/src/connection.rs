//! Transport connection and authentication.
//!
//! [`Connection::open`] establishes the TCP transport and performs the
//! mandatory Hello/HelloAck handshake. The connection is then single-purpose:
//! [`Connection::authenticate`] proves the local identity and, on success,
//! hands the transport over to a [`Channel`].
//!
//! No retries happen at this layer; retry policy is a caller concern.

use std::time::Duration;

use conduit_core::ProtocolError;
use conduit_core::framing::FrameCodec;
use conduit_core::handshake::{
    ClientHandshake, parse_handshake_message, serialize_handshake_message,
};
use conduit_core::identity::{KeyPair, generate_nonce};
use conduit_core::wire::{AuthRequest, AuthResponse, WireMessage, decode_message, encode_message};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info};

use crate::channel::Channel;
use crate::error::{AuthError, ConnectError};

/// Client version string for the handshake.
const CLIENT_INFO: &str = concat!("conduit-client/", env!("CARGO_PKG_VERSION"));

/// Default timeout for connection establishment.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// An open but not yet authenticated connection to a server endpoint.
///
/// Closing is idempotent by construction: [`close`](Self::close) consumes
/// the connection, and dropping it releases the transport either way, so
/// error paths need no special handling.
#[derive(Debug)]
pub struct Connection {
    framed: Framed<TcpStream, FrameCodec>,
    server_info: String,
}

impl Connection {
    /// Connect to `endpoint` (a `host:port` address) and perform the
    /// protocol handshake.
    ///
    /// # Errors
    ///
    /// - [`ConnectError::Unreachable`] if the endpoint cannot be reached or
    ///   refuses the connection
    /// - [`ConnectError::Timeout`] if setup exceeds
    ///   [`DEFAULT_CONNECT_TIMEOUT`]
    /// - [`ConnectError::Refused`] if the server rejects the handshake
    pub async fn open(endpoint: &str) -> Result<Self, ConnectError> {
        Self::open_with_timeout(endpoint, DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Connect with a custom setup timeout.
    ///
    /// # Errors
    ///
    /// As [`open`](Self::open).
    pub async fn open_with_timeout(
        endpoint: &str,
        timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| ConnectError::Timeout(timeout))?
            .map_err(ConnectError::Unreachable)?;
        let _ = stream.set_nodelay(true);

        let mut framed = Framed::new(stream, FrameCodec::new());
        let server_info = Self::perform_handshake(&mut framed, timeout).await?;
        info!(endpoint, server_info, "connection established");

        Ok(Self {
            framed,
            server_info,
        })
    }

    /// Performs the Hello/HelloAck handshake.
    async fn perform_handshake(
        framed: &mut Framed<TcpStream, FrameCodec>,
        timeout: Duration,
    ) -> Result<String, ConnectError> {
        let mut handshake = ClientHandshake::new(CLIENT_INFO);

        let hello_bytes = serialize_handshake_message(&handshake.create_hello().into())?;
        tokio::time::timeout(timeout, framed.send(hello_bytes))
            .await
            .map_err(|_| ConnectError::Timeout(timeout))??;

        let response_frame = tokio::time::timeout(timeout, framed.next())
            .await
            .map_err(|_| ConnectError::Timeout(timeout))?
            .ok_or(ConnectError::Protocol(ProtocolError::ConnectionClosed))??;

        let response = parse_handshake_message(&response_frame)?;
        handshake.process_response(response).map_err(|e| match e {
            ProtocolError::HandshakeFailed { reason } => ConnectError::Refused { reason },
            other => ConnectError::Protocol(other),
        })?;

        Ok(handshake.server_info().unwrap_or("unknown").to_string())
    }

    /// Returns the server's info string from the handshake.
    #[must_use]
    pub fn server_info(&self) -> &str {
        &self.server_info
    }

    /// Prove the local identity and open the channel.
    ///
    /// The client signs a locally generated random nonce; the server
    /// verifies the signature against its registered keys and answers with
    /// its own public key, which becomes the channel's
    /// [`server_identity`](Channel::server_identity). Whether to compare
    /// that identity against a pinned value is left to the caller.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Rejected`] if the server rejects the proof
    /// - [`AuthError::ConnectionClosed`] if the server hangs up first
    pub async fn authenticate(mut self, keypair: &KeyPair) -> Result<Channel, AuthError> {
        let nonce = generate_nonce().to_vec();
        let signature = keypair.sign(&nonce);
        let request = WireMessage::AuthRequest(AuthRequest {
            public_key: keypair.public_key(),
            nonce,
            signature,
        });

        self.framed.send(encode_message(&request)?).await?;

        let frame = self
            .framed
            .next()
            .await
            .ok_or(AuthError::ConnectionClosed)??;

        match decode_message(&frame)? {
            WireMessage::AuthResponse(AuthResponse::Accepted { server_public_key }) => {
                // Authenticated traffic may carry full-size frames.
                self.framed.codec_mut().lift_frame_limit();
                info!(server = %server_public_key, "authenticated");
                Ok(Channel::start(self.framed, server_public_key))
            },
            WireMessage::AuthResponse(AuthResponse::Rejected { reason }) => {
                debug!(reason, "authentication rejected");
                Err(AuthError::Rejected { reason })
            },
            _ => Err(AuthError::Protocol(ProtocolError::invalid_frame(
                "expected AuthResponse",
            ))),
        }
    }

    /// Close the connection without authenticating.
    ///
    /// Consumes the connection; the transport is released. Dropping the
    /// connection has the same effect.
    pub async fn close(mut self) {
        let _ = self.framed.close().await;
    }
}
