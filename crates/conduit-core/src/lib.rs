//! conduit-core - Shared protocol substrate for the Conduit channel
//!
//! Conduit is a bidirectional remote-execution channel: a client
//! authenticates to a long-running daemon with an Ed25519 key, optionally
//! upgrades the session to full capability, and then invokes named
//! operations — synchronously or asynchronously — while streaming bytes over
//! pipes multiplexed on the same connection. This crate holds everything
//! both ends agree on.
//!
//! # Protocol Stack
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Channel traffic (calls, pipes)         │  wire::WireMessage (JSON)
//! ├─────────────────────────────────────────┤
//! │  Authentication                         │  identity + wire::AuthRequest
//! ├─────────────────────────────────────────┤
//! │  Handshake                              │  Hello/HelloAck
//! ├─────────────────────────────────────────┤
//! │  Framing                                │  4-byte BE length prefix
//! ├─────────────────────────────────────────┤
//! │  Transport                              │  TCP
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`command`]: the unit of work — a named operation plus captured
//!   arguments
//! - [`error`]: protocol error types ([`ProtocolError`], [`ProtocolResult`])
//!   and frame-size constants
//! - [`framing`]: length-prefixed frame codec ([`FrameCodec`])
//! - [`handshake`]: version negotiation ([`Hello`], [`HelloAck`],
//!   [`ClientHandshake`], [`ServerHandshake`])
//! - [`identity`]: Ed25519 key pairs, public keys, and key files
//! - [`pipe`]: bounded byte-queue pipe endpoints with explicit close
//!   propagation
//! - [`wire`]: post-handshake wire messages and payload types

pub mod command;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod identity;
pub mod pipe;
pub mod wire;

pub use command::Command;
pub use error::{
    MAX_FRAME_SIZE, MAX_UNAUTHENTICATED_FRAME_SIZE, PROTOCOL_VERSION, ProtocolError,
    ProtocolResult,
};
pub use framing::FrameCodec;
pub use handshake::{
    ClientHandshake, HandshakeErrorCode, HandshakeMessage, HandshakeState, Hello, HelloAck,
    HelloNack, ServerHandshake, parse_handshake_message, parse_hello, serialize_handshake_message,
};
pub use identity::{KeyLoadError, KeyPair, NONCE_LEN, PublicKey, generate_nonce};
pub use pipe::{
    OUTBOUND_QUEUE_DEPTH, Outbound, PIPE_CHUNK_SIZE, PIPE_QUEUE_DEPTH, PipeError, PipeReader,
    PipeTable, PipeWriter, drive_outbound,
};
pub use wire::{
    AuthRequest, AuthResponse, CallFailure, CallId, CallOutcome, CapabilityLevel, PipeDirection,
    PipeId, UpgradeOutcome, WireMessage, decode_message, encode_message,
};
