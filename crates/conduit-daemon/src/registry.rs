//! The operation registry: named units of work the daemon can execute.
//!
//! Remote calls carry no code, only an operation name and captured
//! arguments; the registry maps names to [`CommandHandler`] implementations
//! and records the capability level each operation requires. Dispatch is
//! fail-closed: an unregistered name is an error, and an operation above
//! the channel's capability level is denied without touching the handler.
//!
//! Handlers receive a [`CommandContext`] carrying the authenticated peer
//! identity, the capability level at dispatch time, and access to the
//! connection's pipe endpoints.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use conduit_core::identity::PublicKey;
use conduit_core::pipe::{Outbound, PipeReader, PipeTable, PipeWriter};
use conduit_core::wire::{CallFailure, CallOutcome, CapabilityLevel, PipeId};
use tokio::sync::mpsc;

/// Server-side pipe endpoints of one connection.
///
/// The dispatch loop fills this as `PipeOpen` frames arrive; handlers claim
/// endpoints through their [`CommandContext`]. Reading ends are parked until
/// exactly one handler takes them; writing ends are minted on demand for
/// announced remote-to-local pipes.
#[derive(Debug)]
pub struct ConnectionPipes {
    /// Reading ends, filled from inbound `PipeData` frames.
    table: PipeTable,

    /// Reading ends not yet claimed by a handler.
    parked: Mutex<HashMap<PipeId, PipeReader>>,

    /// Pipes announced remote-to-local, i.e. writable from this side.
    writable: Mutex<HashSet<PipeId>>,

    /// The connection's outbound queue, for minting writers.
    outbound: mpsc::Sender<Outbound>,
}

impl ConnectionPipes {
    /// Create the pipe registry for one connection.
    #[must_use]
    pub fn new(outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            table: PipeTable::new(),
            parked: Mutex::new(HashMap::new()),
            writable: Mutex::new(HashSet::new()),
            outbound,
        }
    }

    /// Register the reading end of a client-to-server pipe and park it for
    /// a handler to claim.
    pub fn open_inbound(&self, pipe_id: PipeId) {
        let reader = self.table.register(pipe_id);
        self.parked
            .lock()
            .expect("parked pipes lock poisoned")
            .insert(pipe_id, reader);
    }

    /// Record a server-to-client pipe as writable.
    pub fn open_outbound(&self, pipe_id: PipeId) {
        self.writable
            .lock()
            .expect("writable pipes lock poisoned")
            .insert(pipe_id);
    }

    /// The reader-side table the dispatch loop delivers into.
    #[must_use]
    pub const fn table(&self) -> &PipeTable {
        &self.table
    }

    /// Claim the reading end of a client-to-server pipe.
    #[must_use]
    pub fn take_reader(&self, pipe_id: PipeId) -> Option<PipeReader> {
        self.parked
            .lock()
            .expect("parked pipes lock poisoned")
            .remove(&pipe_id)
    }

    /// Mint the writing end of an announced server-to-client pipe.
    #[must_use]
    pub fn writer(&self, pipe_id: PipeId) -> Option<PipeWriter> {
        let known = self
            .writable
            .lock()
            .expect("writable pipes lock poisoned")
            .contains(&pipe_id);
        known.then(|| PipeWriter::new(pipe_id, self.outbound.clone()))
    }

    /// Tear down every endpoint: unclaimed readers are poisoned, announced
    /// writables forgotten.
    pub fn poison(&self) {
        self.table.poison();
        self.parked
            .lock()
            .expect("parked pipes lock poisoned")
            .clear();
        self.writable
            .lock()
            .expect("writable pipes lock poisoned")
            .clear();
    }
}

/// Execution context handed to a handler for one call.
#[derive(Debug, Clone)]
pub struct CommandContext {
    peer: PublicKey,
    capability: CapabilityLevel,
    pipes: Arc<ConnectionPipes>,
}

impl CommandContext {
    /// Build a context snapshot for one dispatch.
    #[must_use]
    pub fn new(peer: PublicKey, capability: CapabilityLevel, pipes: Arc<ConnectionPipes>) -> Self {
        Self {
            peer,
            capability,
            pipes,
        }
    }

    /// The authenticated identity of the calling client.
    #[must_use]
    pub fn peer(&self) -> &PublicKey {
        &self.peer
    }

    /// The channel's capability level at dispatch time.
    #[must_use]
    pub const fn capability_level(&self) -> CapabilityLevel {
        self.capability
    }

    /// Claim the reading end of a client-to-server pipe referenced in the
    /// call's arguments.
    ///
    /// `None` if the pipe was never announced or another handler already
    /// claimed it.
    #[must_use]
    pub fn take_pipe_reader(&self, pipe_id: PipeId) -> Option<PipeReader> {
        self.pipes.take_reader(pipe_id)
    }

    /// Obtain the writing end of a server-to-client pipe referenced in the
    /// call's arguments.
    ///
    /// `None` if the pipe was never announced.
    #[must_use]
    pub fn pipe_writer(&self, pipe_id: PipeId) -> Option<PipeWriter> {
        self.pipes.writer(pipe_id)
    }
}

/// A server-side unit-of-work implementation.
///
/// Returning `Err` propagates the operation's declared failure to the
/// caller with kind and payload intact; machinery-level faults (unknown
/// operation, undecodable arguments) never reach a handler.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Execute one call.
    async fn handle(
        &self,
        ctx: CommandContext,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, CallFailure>;
}

/// Adapter implementing [`CommandHandler`] for plain async functions.
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(CommandContext, serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, CallFailure>> + Send,
{
    async fn handle(
        &self,
        ctx: CommandContext,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, CallFailure> {
        (self.0)(ctx, args).await
    }
}

/// One registered operation.
struct Registration {
    required: CapabilityLevel,
    handler: Arc<dyn CommandHandler>,
}

/// The daemon's table of executable operations.
#[derive(Default)]
pub struct CommandRegistry {
    ops: HashMap<String, Registration>,
}

impl CommandRegistry {
    /// Create an empty registry. Every call is an error until operations
    /// are registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation.
    ///
    /// A duplicate name replaces the earlier registration.
    pub fn register(
        &mut self,
        op: impl Into<String>,
        required: CapabilityLevel,
        handler: impl CommandHandler + 'static,
    ) -> &mut Self {
        self.ops.insert(
            op.into(),
            Registration {
                required,
                handler: Arc::new(handler),
            },
        );
        self
    }

    /// Register a plain async function as an operation.
    pub fn register_fn<F, Fut>(
        &mut self,
        op: impl Into<String>,
        required: CapabilityLevel,
        f: F,
    ) -> &mut Self
    where
        F: Fn(CommandContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, CallFailure>> + Send + 'static,
    {
        self.register(op, required, FnHandler(f))
    }

    /// Returns `true` if an operation is registered under `op`.
    #[must_use]
    pub fn contains(&self, op: &str) -> bool {
        self.ops.contains_key(op)
    }

    /// Number of registered operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns `true` if no operations are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Resolve an operation for dispatch at the given capability level.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`CallOutcome`] to answer with: `Error` for an
    /// unknown operation, `Denied` when the channel's capability is below
    /// what the operation requires.
    pub fn resolve(
        &self,
        op: &str,
        level: CapabilityLevel,
    ) -> Result<Arc<dyn CommandHandler>, CallOutcome> {
        let Some(registration) = self.ops.get(op) else {
            return Err(CallOutcome::Error {
                reason: format!("unknown operation: {op}"),
            });
        };
        if level < registration.required {
            return Err(CallOutcome::Denied {
                reason: format!("operation {op} requires {} capability", registration.required),
            });
        }
        Ok(Arc::clone(&registration.handler))
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("ops", &self.ops.keys().collect::<Vec<_>>())
            .finish()
    }
}
