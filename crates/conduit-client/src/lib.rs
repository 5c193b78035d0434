//! conduit-client - Client side of the Conduit remote-execution channel
//!
//! The client establishes a connection to a Conduit daemon, proves its
//! identity with an Ed25519 key, optionally upgrades the session to full
//! capability, and then invokes named operations on the server —
//! synchronously or asynchronously — while streaming bytes over pipes
//! multiplexed on the same connection.
//!
//! # Session Lifecycle
//!
//! ```text
//! Connection::open ──▶ authenticate ──▶ [upgrade] ──▶ call / call_async / pipes
//!                                                          │
//!                                                    Channel::close
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use conduit_client::Connection;
//! use conduit_core::{Command, KeyPair};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let keypair = KeyPair::load("./id_ed25519.json")?;
//!
//! let connection = Connection::open("127.0.0.1:7171").await?;
//! let channel = connection.authenticate(&keypair).await?;
//!
//! // Optional: compare against a pinned server identity.
//! println!("server key is {}", channel.server_identity());
//!
//! // Restricted sessions may only invoke restricted-safe operations;
//! // upgrading requires operator rights on the authenticated key.
//! channel.upgrade().await?;
//!
//! // Synchronous call: suspends until the result arrives.
//! let jobs: u64 = channel.call(&Command::new("jobs.count")).await?;
//! println!("the server has {jobs} jobs");
//!
//! // Asynchronous call with a pipe: stream bytes to the server-side
//! // operation, close the writer, then collect the result.
//! let mut pipe = channel.create_local_to_remote().await?;
//! let mut handle = channel
//!     .call_async::<u64>(
//!         &Command::new("sink.copy").with_args(&serde_json::json!({
//!             "pipe_id": pipe.id(),
//!         }))?,
//!     )
//!     .await?;
//!
//! let mut writer = pipe.take_writer().expect("local-to-remote pipe writes");
//! writer.write(b"Hello, world!\n").await?;
//! writer.close().await?;
//!
//! let copied = handle.get().await?;
//! println!("server received {copied} bytes");
//!
//! channel.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`call`]: result handles for asynchronously dispatched calls
//! - [`channel`]: the multiplexed session and its dispatch machinery
//! - [`connection`]: transport setup, handshake, and authentication
//! - [`error`]: client-side error taxonomy
//! - [`pipe`]: the client-facing pipe endpoint

pub mod call;
pub mod channel;
pub mod connection;
pub mod error;
pub mod pipe;

pub use call::CallHandle;
pub use channel::Channel;
pub use connection::{Connection, DEFAULT_CONNECT_TIMEOUT};
pub use error::{AuthError, CallError, ConnectError, RemotingError, UpgradeError};
pub use pipe::Pipe;
