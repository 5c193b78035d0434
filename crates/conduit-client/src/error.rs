//! Client-side error types.
//!
//! Each phase of the channel lifecycle fails with its own type so callers
//! can branch without string matching:
//!
//! - [`ConnectError`]: the transport could not be established
//! - [`AuthError`]: the server rejected the identity proof
//! - [`UpgradeError`]: elevation was denied (the channel stays usable)
//! - [`CallError`]: a remote call failed, with the remote operation's own
//!   declared failure propagated verbatim
//! - [`RemotingError`]: the machinery itself failed — serialization faults
//!   and channel loss
//!
//! Key material problems surface earlier as
//! [`conduit_core::identity::KeyLoadError`], before the network is touched.

use std::io;
use std::time::Duration;

use conduit_core::ProtocolError;
use conduit_core::pipe::PipeError;
use conduit_core::wire::CallFailure;
use thiserror::Error;

/// Failure to establish a connection to the server endpoint.
///
/// Fatal to the attempted session. The core never retries; retry policy is
/// a caller concern.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The endpoint could not be reached or refused the TCP connection.
    #[error("endpoint unreachable: {0}")]
    Unreachable(#[source] io::Error),

    /// The connection attempt did not complete in time.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered the handshake with a rejection.
    #[error("server refused connection: {reason}")]
    Refused {
        /// Rejection reason from the server.
        reason: String,
    },

    /// A wire-level fault during connection setup.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// The server rejected the client's identity proof.
///
/// Fatal to the session. Distinct from [`conduit_core::identity::KeyLoadError`]:
/// an `AuthError` means the key material was usable but the server said no.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Identity rejected: unknown key, bad signature, or revoked identity.
    #[error("server rejected authentication: {reason}")]
    Rejected {
        /// Rejection reason from the server; deliberately generic.
        reason: String,
    },

    /// The connection closed before authentication completed.
    #[error("connection closed during authentication")]
    ConnectionClosed,

    /// A wire-level fault during authentication.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A fault in the remoting machinery itself.
///
/// Surfaced to the specific pending call or pipe it affects; channel-fatal
/// conditions surface it to every outstanding call and pipe at once.
#[derive(Debug, Clone, Error)]
pub enum RemotingError {
    /// The channel was closed or the transport was lost mid-flight.
    #[error("channel closed")]
    ChannelClosed,

    /// A payload could not be serialized or deserialized.
    #[error("serialization failed: {reason}")]
    Serialization {
        /// Description of the serialization failure.
        reason: String,
    },

    /// The server could not dispatch the call
    /// (unknown operation, undecodable arguments).
    #[error("remote dispatch fault: {reason}")]
    Dispatch {
        /// Fault description from the server.
        reason: String,
    },
}

impl From<ProtocolError> for RemotingError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Serialization { reason } => Self::Serialization { reason },
            // Everything else reaching a call path means the channel is
            // unusable for that call.
            _ => Self::ChannelClosed,
        }
    }
}

impl From<RemotingError> for PipeError {
    fn from(err: RemotingError) -> Self {
        match err {
            RemotingError::ChannelClosed => Self::ChannelClosed,
            RemotingError::Serialization { reason } | RemotingError::Dispatch { reason } => {
                Self::Protocol(ProtocolError::serialization(reason))
            },
        }
    }
}

/// Capability elevation was not granted.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// The authenticated identity lacks elevation rights.
    ///
    /// The channel remains open and usable at restricted capability.
    #[error("upgrade denied: {reason}")]
    Denied {
        /// Denial reason from the server.
        reason: String,
    },

    /// The machinery failed before a verdict arrived.
    #[error(transparent)]
    Remoting(#[from] RemotingError),
}

/// A remote call did not produce its value.
#[derive(Debug, Error)]
pub enum CallError {
    /// The operation raised its declared failure type.
    ///
    /// Kind and payload arrive exactly as the server-side handler produced
    /// them.
    #[error("remote operation failed: {0}")]
    Remote(CallFailure),

    /// The operation requires a capability level the channel does not hold.
    #[error("operation not permitted at current capability level: {reason}")]
    Unauthorized {
        /// Denial reason from the server.
        reason: String,
    },

    /// The remoting machinery failed.
    #[error(transparent)]
    Remoting(#[from] RemotingError),

    /// The local wait was abandoned.
    ///
    /// Says nothing about the remote execution, which continues; the handle
    /// may be awaited again.
    #[error("timed out waiting for completion after {timeout:?}")]
    Timeout {
        /// How long the caller waited.
        timeout: Duration,
    },
}
