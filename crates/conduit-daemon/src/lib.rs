//! conduit-daemon - Server side of the Conduit remote-execution channel
//!
//! The daemon listens for client connections, walks each one through
//! handshake and key-based authentication, and then serves a multiplexed
//! session: named operations dispatched against a [`CommandRegistry`],
//! capability upgrades gated by per-key operator rights, and byte pipes
//! routed independently of call lifecycles.
//!
//! # Connection Lifecycle
//!
//! ```text
//! accept ──▶ Hello/HelloAck ──▶ AuthRequest/AuthResponse ──▶ session loop
//!             (64 KiB frames, deadline-bounded)               (16 MiB frames)
//! ```
//!
//! # Capability Gating
//!
//! Every registered operation declares the capability level it requires.
//! Channels start restricted; a key registered with operator rights may
//! upgrade its channel to full capability, once, for the rest of the
//! session. Dispatch is fail-closed: unknown operations error, privileged
//! operations on restricted channels are denied without reaching the
//! handler.
//!
//! # Modules
//!
//! - [`auth`]: registered client keys and proof verification
//! - [`config`]: server configuration
//! - `dispatch`: per-connection phases and the session frame loop
//! - [`registry`]: operation registry, handler trait, and handler context
//! - [`server`]: listener and accept loop

pub mod auth;
pub mod config;
mod dispatch;
pub mod registry;
pub mod server;

pub use auth::{AuthorizedKeys, KeyRights};
pub use config::{DEFAULT_BIND_ADDR, ServerConfig};
pub use registry::{CommandContext, CommandHandler, CommandRegistry, ConnectionPipes};
pub use server::{Server, ServerError};
