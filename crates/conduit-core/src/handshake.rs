//! Hello/HelloAck version negotiation.
//!
//! The first frames on a fresh connection, before authentication and before
//! any channel traffic:
//!
//! ```text
//! Client                                           Server
//!   |  -- Hello { version, client_info } ------->   |
//!   |  <-- HelloAck { version, server_info } -----  |   accepted
//!   |  <-- HelloNack { code, message } -----------  |   or turned away
//! ```
//!
//! Both sides track progress with a small state machine
//! ([`ClientHandshake`], [`ServerHandshake`]) so a repeated or out-of-place
//! Hello is caught as a protocol violation rather than silently tolerated.
//! All handshake frames are parsed under the unauthenticated size limit.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{
    MAX_UNAUTHENTICATED_FRAME_SIZE, PROTOCOL_VERSION, ProtocolError, ProtocolResult,
};

/// Opening message of every connection, sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Hello {
    /// Protocol version the client speaks.
    pub protocol_version: u32,

    /// Free-form client identifier for the server's logs,
    /// e.g. "conduit-client/0.1.0".
    pub client_info: String,
}

impl Hello {
    /// A Hello announcing the local protocol version.
    #[must_use]
    pub fn new(client_info: impl Into<String>) -> Self {
        Self::with_version(PROTOCOL_VERSION, client_info)
    }

    /// A Hello announcing an arbitrary version; tests use this to provoke
    /// rejections.
    #[must_use]
    pub fn with_version(protocol_version: u32, client_info: impl Into<String>) -> Self {
        Self {
            protocol_version,
            client_info: client_info.into(),
        }
    }
}

/// The server's acceptance of a Hello.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HelloAck {
    /// Version the session will speak.
    pub protocol_version: u32,

    /// Free-form server identifier for the client's logs,
    /// e.g. "conduit-daemon/0.1.0".
    pub server_info: String,
}

impl HelloAck {
    /// An acceptance at the local protocol version.
    #[must_use]
    pub fn new(server_info: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            server_info: server_info.into(),
        }
    }
}

/// The server turning a client away. The connection ends here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HelloNack {
    /// Machine-readable rejection category.
    pub error_code: HandshakeErrorCode,

    /// Human-readable explanation.
    pub message: String,

    /// The server's own version, included for mismatch diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<u32>,
}

impl HelloNack {
    /// Turn away a client whose version this server does not speak.
    #[must_use]
    pub fn version_mismatch(requested: u32) -> Self {
        Self {
            error_code: HandshakeErrorCode::VersionMismatch,
            message: format!(
                "unsupported protocol version {requested}; this server speaks {PROTOCOL_VERSION}"
            ),
            server_version: Some(PROTOCOL_VERSION),
        }
    }

    /// Turn away a client for any other reason.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            error_code: HandshakeErrorCode::Rejected,
            message: message.into(),
            server_version: None,
        }
    }
}

/// Why a Hello was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeErrorCode {
    /// The requested protocol version is not spoken here.
    VersionMismatch,

    /// Any other rejection; the message says more.
    Rejected,
}

/// Envelope distinguishing the three handshake frames on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    /// Client opening.
    Hello(Hello),

    /// Server acceptance.
    HelloAck(HelloAck),

    /// Server rejection.
    HelloNack(HelloNack),
}

impl From<Hello> for HandshakeMessage {
    fn from(msg: Hello) -> Self {
        Self::Hello(msg)
    }
}

impl From<HelloAck> for HandshakeMessage {
    fn from(msg: HelloAck) -> Self {
        Self::HelloAck(msg)
    }
}

impl From<HelloNack> for HandshakeMessage {
    fn from(msg: HelloNack) -> Self {
        Self::HelloNack(msg)
    }
}

/// Decode a handshake frame, enforcing the unauthenticated size limit.
///
/// The limit check duplicates the codec's, so the parser stays safe even
/// when fed frames from a differently configured source.
///
/// # Errors
///
/// [`ProtocolError::FrameTooLarge`] for frames over the unauthenticated
/// limit; [`ProtocolError::Serialization`] for anything that is not a
/// handshake message.
pub fn parse_handshake_message(frame: &Bytes) -> ProtocolResult<HandshakeMessage> {
    if frame.len() > MAX_UNAUTHENTICATED_FRAME_SIZE {
        return Err(ProtocolError::frame_too_large(
            frame.len(),
            MAX_UNAUTHENTICATED_FRAME_SIZE,
        ));
    }
    serde_json::from_slice(frame)
        .map_err(|e| ProtocolError::serialization(format!("invalid handshake message: {e}")))
}

/// Decode a frame that must be a client Hello.
///
/// # Errors
///
/// As [`parse_handshake_message`], plus [`ProtocolError::HandshakeFailed`]
/// for any other handshake message in the frame.
pub fn parse_hello(frame: &Bytes) -> ProtocolResult<Hello> {
    match parse_handshake_message(frame)? {
        HandshakeMessage::Hello(hello) => Ok(hello),
        _ => Err(ProtocolError::handshake_failed("expected Hello message")),
    }
}

/// Encode a handshake message into frame bytes.
///
/// # Errors
///
/// [`ProtocolError::Serialization`] if encoding fails.
pub fn serialize_handshake_message(msg: &HandshakeMessage) -> ProtocolResult<Bytes> {
    serde_json::to_vec(msg).map(Bytes::from).map_err(|e| {
        ProtocolError::serialization(format!("failed to serialize handshake message: {e}"))
    })
}

/// Where a handshake stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// Nothing exchanged yet.
    #[default]
    AwaitingHello,

    /// Versions agreed; the connection may proceed.
    Completed,

    /// The exchange broke down; the connection must not proceed.
    Failed,
}

/// Server half of the handshake: judges one Hello.
#[derive(Debug)]
pub struct ServerHandshake {
    server_info: String,
    state: HandshakeState,
    negotiated_version: Option<u32>,
}

impl ServerHandshake {
    /// A fresh server-side handshake announcing `server_info` on success.
    #[must_use]
    pub fn new(server_info: impl Into<String>) -> Self {
        Self {
            server_info: server_info.into(),
            state: HandshakeState::AwaitingHello,
            negotiated_version: None,
        }
    }

    /// Judge a client Hello and produce the frame to answer with.
    ///
    /// A well-formed Hello at the wrong version gets a `HelloNack` answer;
    /// that is a normal outcome, not an `Err`.
    ///
    /// # Errors
    ///
    /// Only when a Hello arrives into a handshake that already completed or
    /// failed.
    pub fn process_hello(&mut self, hello: &Hello) -> ProtocolResult<HandshakeMessage> {
        match self.state {
            HandshakeState::AwaitingHello => {},
            HandshakeState::Completed | HandshakeState::Failed => {
                self.state = HandshakeState::Failed;
                return Err(ProtocolError::handshake_failed("duplicate Hello"));
            },
        }

        if hello.protocol_version != PROTOCOL_VERSION {
            self.state = HandshakeState::Failed;
            return Ok(HelloNack::version_mismatch(hello.protocol_version).into());
        }

        self.state = HandshakeState::Completed;
        self.negotiated_version = Some(PROTOCOL_VERSION);
        Ok(HelloAck::new(&self.server_info).into())
    }

    /// Where this handshake stands.
    #[must_use]
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// The agreed version, once completed.
    #[must_use]
    pub const fn negotiated_version(&self) -> Option<u32> {
        self.negotiated_version
    }

    /// Whether the connection may proceed past the handshake.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == HandshakeState::Completed
    }
}

/// Client half of the handshake: sends the Hello, judges the answer.
#[derive(Debug)]
pub struct ClientHandshake {
    client_info: String,
    state: HandshakeState,
    server_info: Option<String>,
}

impl ClientHandshake {
    /// A fresh client-side handshake announcing `client_info`.
    #[must_use]
    pub fn new(client_info: impl Into<String>) -> Self {
        Self {
            client_info: client_info.into(),
            state: HandshakeState::AwaitingHello,
            server_info: None,
        }
    }

    /// The Hello to open the connection with.
    #[must_use]
    pub fn create_hello(&self) -> Hello {
        Hello::new(&self.client_info)
    }

    /// Judge the server's answer to our Hello.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::VersionMismatch`] when the server nacked over
    ///   versions
    /// - [`ProtocolError::HandshakeFailed`] for any other nack, or for a
    ///   server that answered with a Hello of its own
    pub fn process_response(&mut self, response: HandshakeMessage) -> ProtocolResult<()> {
        match response {
            HandshakeMessage::HelloAck(ack) => {
                self.state = HandshakeState::Completed;
                self.server_info = Some(ack.server_info);
                Ok(())
            },
            HandshakeMessage::HelloNack(nack) => {
                self.state = HandshakeState::Failed;
                if nack.error_code == HandshakeErrorCode::VersionMismatch {
                    Err(ProtocolError::VersionMismatch {
                        peer_version: nack.server_version.unwrap_or_default(),
                        local_version: PROTOCOL_VERSION,
                    })
                } else {
                    Err(ProtocolError::handshake_failed(nack.message))
                }
            },
            HandshakeMessage::Hello(_) => {
                self.state = HandshakeState::Failed;
                Err(ProtocolError::handshake_failed(
                    "peer answered Hello with Hello",
                ))
            },
        }
    }

    /// Where this handshake stands.
    #[must_use]
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// The server's info string, once completed.
    #[must_use]
    pub fn server_info(&self) -> Option<&str> {
        self.server_info.as_deref()
    }

    /// Whether the connection may proceed past the handshake.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == HandshakeState::Completed
    }
}
