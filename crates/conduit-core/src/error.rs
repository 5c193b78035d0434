//! Wire-layer errors and protocol constants.
//!
//! [`ProtocolError`] covers everything that can go wrong between the socket
//! and a decoded message: framing faults, handshake failures, serialization
//! problems, and transport I/O. The channel-level taxonomy the caller sees
//! (connect, auth, call, pipe failures) lives in the client and daemon
//! crates; those types wrap a `ProtocolError` when a wire fault is the root
//! cause.

use std::io;

use thiserror::Error;

/// Protocol version spoken by this implementation.
///
/// Negotiated during the Hello/HelloAck handshake; an incompatible peer is
/// turned away with [`ProtocolError::VersionMismatch`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Hard ceiling on frame payload size: 16 MiB.
///
/// The length prefix is checked against the ceiling before any buffer is
/// reserved, so an absurd prefix costs nothing.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame ceiling while the peer is not yet authenticated: 64 KiB.
///
/// Handshake and authentication traffic is small; keeping the limit tight
/// until the proof checks out bounds what an anonymous peer can make the
/// other side buffer and parse. Authenticated channels lift the limit to
/// [`MAX_FRAME_SIZE`].
pub const MAX_UNAUTHENTICATED_FRAME_SIZE: usize = 64 * 1024;

/// Anything that can go wrong at the wire layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A length prefix (or outbound payload) exceeds the active frame
    /// limit. Raised before allocating for the frame.
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Size claimed by the prefix or carried by the payload.
        size: usize,
        /// The limit in force when the frame was seen.
        max: usize,
    },

    /// The frame arrived intact but its contents make no sense.
    #[error("malformed frame: {reason}")]
    InvalidFrame {
        /// What failed to parse or validate.
        reason: String,
    },

    /// The peer speaks a protocol version this build does not.
    #[error("protocol version mismatch: peer speaks {peer_version}, local supports {local_version}")]
    VersionMismatch {
        /// Version announced by the peer.
        peer_version: u32,
        /// Version this implementation speaks.
        local_version: u32,
    },

    /// The Hello exchange did not complete.
    #[error("handshake failed: {reason}")]
    HandshakeFailed {
        /// Why the exchange broke down.
        reason: String,
    },

    /// The peer hung up mid-operation.
    #[error("connection closed")]
    ConnectionClosed,

    /// A wire operation did not finish in time.
    #[error("timed out after {duration_ms}ms")]
    Timeout {
        /// How long the operation waited, in milliseconds.
        duration_ms: u64,
    },

    /// Transport-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A message payload would not encode or decode.
    #[error("serialization failed: {reason}")]
    Serialization {
        /// What the codec choked on.
        reason: String,
    },
}

impl ProtocolError {
    /// A frame rejected by the active size limit.
    #[must_use]
    pub const fn frame_too_large(size: usize, max: usize) -> Self {
        Self::FrameTooLarge { size, max }
    }

    /// A frame whose contents failed to parse or validate.
    #[must_use]
    pub fn invalid_frame(reason: impl Into<String>) -> Self {
        Self::InvalidFrame {
            reason: reason.into(),
        }
    }

    /// A broken-down handshake.
    #[must_use]
    pub fn handshake_failed(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            reason: reason.into(),
        }
    }

    /// A payload the codec could not handle.
    #[must_use]
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Whether the peer broke the protocol.
    ///
    /// A violation means the other side is buggy or hostile; the connection
    /// should be dropped, not retried.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        match self {
            Self::FrameTooLarge { .. }
            | Self::InvalidFrame { .. }
            | Self::VersionMismatch { .. }
            | Self::HandshakeFailed { .. } => true,
            Self::ConnectionClosed | Self::Timeout { .. } | Self::Io(_) | Self::Serialization { .. } => {
                false
            },
        }
    }

    /// Whether a fresh connection attempt might fare better.
    ///
    /// Only advisory; the core itself never retries.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Timeout { .. })
    }
}

/// Shorthand for wire-layer results.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    // An anonymous peer must never be allowed a bigger frame than an
    // authenticated one.
    const _: () = assert!(MAX_UNAUTHENTICATED_FRAME_SIZE < MAX_FRAME_SIZE);

    #[test]
    fn test_oversized_frame_is_a_violation() {
        let err = ProtocolError::frame_too_large(MAX_FRAME_SIZE + 1, MAX_FRAME_SIZE);
        assert!(err.is_protocol_violation());
        assert!(!err.is_recoverable());

        let rendered = err.to_string();
        assert!(rendered.contains(&(MAX_FRAME_SIZE + 1).to_string()));
        assert!(rendered.contains(&MAX_FRAME_SIZE.to_string()));
    }

    #[test]
    fn test_version_mismatch_names_both_versions() {
        let err = ProtocolError::VersionMismatch {
            peer_version: 7,
            local_version: PROTOCOL_VERSION,
        };
        assert!(err.is_protocol_violation());
        let rendered = err.to_string();
        assert!(rendered.contains("peer speaks 7"));
        assert!(rendered.contains(&PROTOCOL_VERSION.to_string()));
    }

    #[test]
    fn test_disconnect_and_timeout_are_recoverable() {
        assert!(ProtocolError::ConnectionClosed.is_recoverable());
        assert!(ProtocolError::Timeout { duration_ms: 250 }.is_recoverable());
        assert!(!ProtocolError::ConnectionClosed.is_protocol_violation());
    }

    #[test]
    fn test_io_error_is_neither() {
        let err = ProtocolError::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert!(!err.is_protocol_violation());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_helper_constructors_carry_reason() {
        let err = ProtocolError::invalid_frame("truncated header");
        assert_eq!(err.to_string(), "malformed frame: truncated header");

        let err = ProtocolError::serialization("not json");
        assert_eq!(err.to_string(), "serialization failed: not json");
    }
}
