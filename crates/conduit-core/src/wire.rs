//! Channel wire messages.
//!
//! Everything that crosses the connection after the handshake is a
//! [`WireMessage`], serialized as an internally tagged JSON object inside a
//! length-prefixed frame (see [`crate::framing`]).
//!
//! # Message Flow
//!
//! ```text
//! Client                                           Server
//!   |  -- AuthRequest { key, nonce, signature } -->  |
//!   |  <-- AuthResponse { server key | reject } ---  |
//!   |                                                |
//!   |  -- UpgradeRequest { call_id } ------------->  |
//!   |  <-- UpgradeResponse { call_id, outcome } ---  |
//!   |                                                |
//!   |  -- CallRequest { call_id, command } ------->  |
//!   |  <-- CallResponse { call_id, outcome } ------  |
//!   |                                                |
//!   |  <-- PipeOpen / PipeData / PipeClose ------->  |  (either direction)
//!   |                                                |
//!   |  -- Goodbye ------------------------------->   |
//! ```
//!
//! Responses are correlated to requests by `call_id`; upgrade traffic shares
//! the same correlation space as calls so one dispatch path serves both.
//! Pipe frames are correlated by `pipe_id` and are independent of any call.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::error::{ProtocolError, ProtocolResult};
use crate::identity::PublicKey;

/// Correlation identifier for calls and upgrades, unique per channel.
pub type CallId = u64;

/// Identifier for a pipe, unique per channel.
pub type PipeId = u64;

/// Serde helper for base64 encoding of raw byte fields.
///
/// Keeps nonce, signature, and pipe payloads compact and unambiguous inside
/// JSON frames.
pub mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Privilege tier of a channel.
///
/// A channel starts `Restricted` and may transition to `Full` exactly once
/// per session via a granted upgrade. There is no downgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityLevel {
    /// Only operations registered as restricted-safe may be invoked.
    Restricted,
    /// All registered operations may be invoked.
    Full,
}

impl fmt::Display for CapabilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Restricted => write!(f, "restricted"),
            Self::Full => write!(f, "full"),
        }
    }
}

/// Direction of a pipe, fixed at creation.
///
/// Names the side that writes: a `LocalToRemote` pipe is written by the
/// client and read by server-side operations, and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeDirection {
    /// Client writes, server-side operation reads.
    LocalToRemote,
    /// Server-side operation writes, client reads.
    RemoteToLocal,
}

/// Authentication proof sent by the client.
///
/// The nonce is generated client-side; the signature covers exactly the
/// nonce bytes and is verified against the server's record of registered
/// public keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AuthRequest {
    /// The public half of the client's key pair.
    pub public_key: PublicKey,

    /// Random nonce the signature covers.
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,

    /// Detached Ed25519 signature over the nonce.
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

/// Server verdict on an authentication proof.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AuthResponse {
    /// Proof accepted; the server identifies itself with its public key.
    Accepted {
        /// The server's identity key.
        server_public_key: PublicKey,
    },
    /// Proof rejected. The connection is closed after this message.
    Rejected {
        /// Human-readable rejection reason; deliberately generic.
        reason: String,
    },
}

/// Server verdict on a capability upgrade request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum UpgradeOutcome {
    /// The channel now runs at full capability.
    Granted,
    /// The authenticated identity lacks elevation rights. The channel
    /// remains usable at restricted capability.
    Denied {
        /// Human-readable denial reason.
        reason: String,
    },
}

/// A failure produced by the remote operation itself.
///
/// This is the operation's declared failure type crossing the wire: the kind
/// and payload arrive at the caller exactly as the handler produced them,
/// indistinguishable from a local failure of the same shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallFailure {
    /// Machine-readable failure kind, scoped by the operation.
    pub kind: String,

    /// Human-readable message.
    pub message: String,

    /// Structured failure payload; `null` when the kind says it all.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl CallFailure {
    /// Create a failure with no structured payload.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Attach a structured payload.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CallFailure {}

/// Terminal outcome of a remote call, as reported by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    /// The operation completed and produced a value.
    Success {
        /// The operation's result, JSON-encoded.
        value: serde_json::Value,
    },
    /// The operation raised its declared failure type.
    Failure {
        /// The propagated failure.
        failure: CallFailure,
    },
    /// The operation requires a capability level the channel does not hold.
    Denied {
        /// Human-readable denial reason.
        reason: String,
    },
    /// The server could not dispatch the call at all
    /// (unknown operation, undecodable arguments).
    Error {
        /// Human-readable fault description.
        reason: String,
    },
}

/// Everything that crosses the connection after the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Client authentication proof.
    AuthRequest(AuthRequest),

    /// Server authentication verdict.
    AuthResponse(AuthResponse),

    /// Request to elevate the channel to full capability.
    UpgradeRequest {
        /// Correlation id, shared with the call id space.
        call_id: CallId,
    },

    /// Verdict on an upgrade request.
    UpgradeResponse {
        /// Correlation id from the request.
        call_id: CallId,
        /// Grant or denial.
        outcome: UpgradeOutcome,
    },

    /// Invoke a named operation on the server.
    CallRequest {
        /// Fresh correlation id, unique within the channel's lifetime.
        call_id: CallId,
        /// The unit of work to execute.
        command: Command,
    },

    /// Terminal response to a call.
    CallResponse {
        /// Correlation id from the request.
        call_id: CallId,
        /// The call's outcome.
        outcome: CallOutcome,
    },

    /// Announce a new pipe.
    PipeOpen {
        /// Fresh pipe id, unique within the channel's lifetime.
        pipe_id: PipeId,
        /// Which side writes.
        direction: PipeDirection,
    },

    /// A chunk of pipe payload, in stream order.
    PipeData {
        /// The pipe this chunk belongs to.
        pipe_id: PipeId,
        /// Payload bytes.
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },

    /// End-of-stream: the writer closed its end.
    ///
    /// The reader observes ordinary stream exhaustion after draining any
    /// buffered chunks, not an error.
    PipeClose {
        /// The pipe being closed.
        pipe_id: PipeId,
    },

    /// Orderly channel shutdown notice.
    Goodbye,
}

/// Serialize a wire message to frame bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::Serialization`] if encoding fails.
pub fn encode_message(msg: &WireMessage) -> ProtocolResult<Bytes> {
    serde_json::to_vec(msg)
        .map(Bytes::from)
        .map_err(|e| ProtocolError::serialization(format!("failed to encode message: {e}")))
}

/// Parse a wire message from frame bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::Serialization`] if the frame is not a valid
/// wire message.
pub fn decode_message(frame: &Bytes) -> ProtocolResult<WireMessage> {
    serde_json::from_slice(frame)
        .map_err(|e| ProtocolError::serialization(format!("invalid message: {e}")))
}
