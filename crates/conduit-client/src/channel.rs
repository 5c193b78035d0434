//! The channel: a multiplexed, full-duplex session.
//!
//! A [`Channel`] is created by successful authentication and owns two
//! background tasks:
//!
//! - the **dispatch task** reads inbound frames and routes them — call and
//!   upgrade responses to their pending correlation slots, pipe frames into
//!   the pipe table;
//! - the **writer task** is the single owner of the outbound sink; every
//!   transmitting party (calls, upgrades, pipe writers, close) goes through
//!   its queue.
//!
//! Arbitrarily many caller tasks may issue calls concurrently; responses are
//! delivered to the correct waiter by correlation id regardless of arrival
//! order, and no ordering is guaranteed between distinct calls.
//!
//! Channel close — explicit or from transport loss — is a poison event:
//! every pending call slot is dropped (waiters observe channel loss) and
//! every open pipe end is torn down. Nothing is left hanging.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use conduit_core::command::Command;
use conduit_core::framing::FrameCodec;
use conduit_core::identity::PublicKey;
use conduit_core::pipe::{
    OUTBOUND_QUEUE_DEPTH, Outbound, PipeError, PipeTable, PipeWriter, drive_outbound,
};
use conduit_core::wire::{
    CallId, CapabilityLevel, PipeDirection, PipeId, UpgradeOutcome, WireMessage, decode_message,
    encode_message,
};
use futures::StreamExt;
use futures::stream::SplitStream;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::call::{CallHandle, ReplyFrame};
use crate::error::{CallError, RemotingError, UpgradeError};
use crate::pipe::Pipe;

/// State shared between the channel face and its dispatch task.
#[derive(Debug, Default)]
struct Shared {
    /// In-flight correlation slots (calls and upgrades).
    pending: Mutex<HashMap<CallId, oneshot::Sender<ReplyFrame>>>,

    /// Local reading ends of open pipes.
    pipes: PipeTable,

    /// Set once, before any teardown of the tables.
    closed: AtomicBool,
}

impl Shared {
    /// Poison the channel: fail every waiter and pipe end.
    ///
    /// The flag is set before the tables are cleared so concurrent
    /// registrations observe either the flag or the cleared table.
    fn poison(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending
            .lock()
            .expect("pending table lock poisoned")
            .clear();
        self.pipes.poison();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct ChannelInner {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Outbound>,
    server_identity: PublicKey,
    upgraded: AtomicBool,
    next_call_id: AtomicU64,
    next_pipe_id: AtomicU64,
    dispatch_task: JoinHandle<()>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        self.dispatch_task.abort();
        if let Ok(mut writer) = self.writer_task.lock() {
            if let Some(task) = writer.take() {
                task.abort();
            }
        }
    }
}

/// The live session over which calls and pipes are multiplexed.
///
/// Cheap to clone; all clones share one session. Created by
/// [`Connection::authenticate`](crate::Connection::authenticate).
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Take ownership of an authenticated transport and start the session
    /// tasks.
    pub(crate) fn start(
        framed: Framed<TcpStream, FrameCodec>,
        server_identity: PublicKey,
    ) -> Self {
        let (sink, stream) = framed.split();
        let shared = Arc::new(Shared::default());
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);

        let writer_task = tokio::spawn(drive_outbound(sink, outbound_rx));
        let dispatch_task = tokio::spawn(run_dispatch(stream, Arc::clone(&shared)));

        Self {
            inner: Arc::new(ChannelInner {
                shared,
                outbound,
                server_identity,
                upgraded: AtomicBool::new(false),
                next_call_id: AtomicU64::new(1),
                next_pipe_id: AtomicU64::new(1),
                dispatch_task,
                writer_task: Mutex::new(Some(writer_task)),
            }),
        }
    }

    /// The server's public key, proven during authentication.
    ///
    /// Comparing it against a pinned value is a caller policy decision.
    #[must_use]
    pub fn server_identity(&self) -> &PublicKey {
        &self.inner.server_identity
    }

    /// Current capability level of the session.
    #[must_use]
    pub fn capability_level(&self) -> CapabilityLevel {
        if self.inner.upgraded.load(Ordering::SeqCst) {
            CapabilityLevel::Full
        } else {
            CapabilityLevel::Restricted
        }
    }

    /// Returns `true` once the channel is closed or the transport is lost.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.shared.is_closed()
    }

    /// Request elevation to full capability.
    ///
    /// One-way: a granted upgrade holds for the rest of the session, and
    /// upgrading an already-upgraded channel is a no-op returning success.
    ///
    /// # Errors
    ///
    /// - [`UpgradeError::Denied`] if the authenticated identity lacks
    ///   elevation rights; the channel stays usable at restricted level
    /// - [`UpgradeError::Remoting`] if the channel fails first
    pub async fn upgrade(&self) -> Result<(), UpgradeError> {
        if self.inner.upgraded.load(Ordering::SeqCst) {
            return Ok(());
        }

        let call_id = self.fresh_call_id();
        let rx = self.register_pending(call_id)?;
        self.send_frame(&WireMessage::UpgradeRequest { call_id })
            .await
            .inspect_err(|_| self.forget_pending(call_id))?;

        match rx.await {
            Ok(ReplyFrame::Upgrade(UpgradeOutcome::Granted)) => {
                self.inner.upgraded.store(true, Ordering::SeqCst);
                debug!("channel upgraded to full capability");
                Ok(())
            },
            Ok(ReplyFrame::Upgrade(UpgradeOutcome::Denied { reason })) => {
                Err(UpgradeError::Denied { reason })
            },
            Ok(ReplyFrame::Call(_)) => Err(UpgradeError::Remoting(RemotingError::Dispatch {
                reason: "mismatched response kind for upgrade".to_string(),
            })),
            Err(_) => Err(UpgradeError::Remoting(RemotingError::ChannelClosed)),
        }
    }

    /// Dispatch a unit of work and return a handle for its result.
    ///
    /// Suspends only for serialization and transmission; the handle
    /// resolves when the server-side execution completes, in server
    /// completion order, not submission order.
    ///
    /// # Errors
    ///
    /// Returns [`RemotingError`] if the command cannot be serialized or the
    /// channel is closed.
    pub async fn call_async<T: DeserializeOwned>(
        &self,
        command: &Command,
    ) -> Result<CallHandle<T>, RemotingError> {
        let call_id = self.fresh_call_id();
        let rx = self.register_pending(call_id)?;
        self.send_frame(&WireMessage::CallRequest {
            call_id,
            command: command.clone(),
        })
        .await
        .inspect_err(|_| self.forget_pending(call_id))?;

        Ok(CallHandle::new(call_id, rx))
    }

    /// Execute a unit of work and wait for its result.
    ///
    /// Exactly [`call_async`](Self::call_async) followed by an untimed
    /// [`CallHandle::get`] — one dispatch mechanism, two consumption
    /// styles.
    ///
    /// # Errors
    ///
    /// As [`CallHandle::get`].
    pub async fn call<T: DeserializeOwned>(&self, command: &Command) -> Result<T, CallError> {
        let mut handle = self.call_async::<T>(command).await?;
        handle.get().await
    }

    /// Create a pipe whose write end is local.
    ///
    /// Bytes written locally become readable, in write order, by the
    /// server-side operation that receives this pipe's id inside its
    /// command arguments. Close the writer to propagate end-of-stream.
    ///
    /// # Errors
    ///
    /// Returns [`PipeError::ChannelClosed`] if the channel is closed.
    pub async fn create_local_to_remote(&self) -> Result<Pipe, PipeError> {
        let pipe_id = self.fresh_pipe_id();
        self.announce_pipe(pipe_id, PipeDirection::LocalToRemote)
            .await?;
        let writer = PipeWriter::new(pipe_id, self.inner.outbound.clone());
        Ok(Pipe::local_writer(pipe_id, writer))
    }

    /// Create a pipe whose read end is local.
    ///
    /// The symmetric twin of
    /// [`create_local_to_remote`](Self::create_local_to_remote): the
    /// server-side operation writes, the local reader drains.
    ///
    /// # Errors
    ///
    /// Returns [`PipeError::ChannelClosed`] if the channel is closed.
    pub async fn create_remote_to_local(&self) -> Result<Pipe, PipeError> {
        let pipe_id = self.fresh_pipe_id();
        let reader = self.inner.shared.pipes.register(pipe_id);
        if let Err(e) = self.announce_pipe(pipe_id, PipeDirection::RemoteToLocal).await {
            self.inner.shared.pipes.remove(pipe_id);
            return Err(e);
        }
        Ok(Pipe::local_reader(pipe_id, reader))
    }

    /// Close the channel.
    ///
    /// Idempotent. Sends a best-effort goodbye, drains and stops the
    /// writer, and poisons the session: every outstanding call and open
    /// pipe end observes a terminal failure rather than hanging, and
    /// further sends fail immediately.
    pub async fn close(&self) {
        if self.inner.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing channel");

        if let Ok(frame) = encode_message(&WireMessage::Goodbye) {
            let _ = self.inner.outbound.send(Outbound::Frame(frame)).await;
        }
        let _ = self.inner.outbound.send(Outbound::Shutdown).await;

        // Wait for the writer to flush and exit so the outbound queue is
        // observably closed before close() returns.
        let writer = self
            .inner
            .writer_task
            .lock()
            .expect("writer task lock poisoned")
            .take();
        if let Some(task) = writer {
            let _ = task.await;
        }

        self.inner.shared.poison();
        self.inner.dispatch_task.abort();
    }

    fn fresh_call_id(&self) -> CallId {
        self.inner.next_call_id.fetch_add(1, Ordering::Relaxed)
    }

    fn fresh_pipe_id(&self) -> PipeId {
        self.inner.next_pipe_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a correlation slot, refusing on a closed channel.
    ///
    /// The post-insert re-check closes the race with a concurrent poison:
    /// whichever order the two take, the slot either errors out here or is
    /// cleared by the poison.
    fn register_pending(
        &self,
        call_id: CallId,
    ) -> Result<oneshot::Receiver<ReplyFrame>, RemotingError> {
        let shared = &self.inner.shared;
        if shared.is_closed() {
            return Err(RemotingError::ChannelClosed);
        }
        let (tx, rx) = oneshot::channel();
        shared
            .pending
            .lock()
            .expect("pending table lock poisoned")
            .insert(call_id, tx);
        if shared.is_closed() {
            self.forget_pending(call_id);
            return Err(RemotingError::ChannelClosed);
        }
        Ok(rx)
    }

    fn forget_pending(&self, call_id: CallId) {
        self.inner
            .shared
            .pending
            .lock()
            .expect("pending table lock poisoned")
            .remove(&call_id);
    }

    async fn send_frame(&self, message: &WireMessage) -> Result<(), RemotingError> {
        if self.inner.shared.is_closed() {
            return Err(RemotingError::ChannelClosed);
        }
        let frame = encode_message(message).map_err(RemotingError::from)?;
        self.inner
            .outbound
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| RemotingError::ChannelClosed)
    }

    async fn announce_pipe(
        &self,
        pipe_id: PipeId,
        direction: PipeDirection,
    ) -> Result<(), PipeError> {
        self.send_frame(&WireMessage::PipeOpen { pipe_id, direction })
            .await
            .map_err(PipeError::from)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("server_identity", &self.inner.server_identity.fingerprint())
            .field("capability_level", &self.capability_level())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Dispatch task: routes inbound frames to waiters and pipes.
///
/// Exits — poisoning the channel — on transport loss, an undecodable frame,
/// a peer goodbye, or a message kind the server has no business sending.
async fn run_dispatch(
    mut stream: SplitStream<Framed<TcpStream, FrameCodec>>,
    shared: Arc<Shared>,
) {
    while let Some(next) = stream.next().await {
        let frame = match next {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "transport error, closing channel");
                break;
            },
        };
        let message = match decode_message(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "undecodable frame, closing channel");
                break;
            },
        };

        match message {
            WireMessage::CallResponse { call_id, outcome } => {
                deliver_reply(&shared, call_id, ReplyFrame::Call(outcome));
            },
            WireMessage::UpgradeResponse { call_id, outcome } => {
                deliver_reply(&shared, call_id, ReplyFrame::Upgrade(outcome));
            },
            WireMessage::PipeData { pipe_id, bytes } => {
                shared.pipes.deliver_data(pipe_id, Bytes::from(bytes)).await;
            },
            WireMessage::PipeClose { pipe_id } => {
                shared.pipes.deliver_eof(pipe_id).await;
            },
            WireMessage::Goodbye => {
                debug!("server closed the channel");
                break;
            },
            other => {
                warn!(message = message_kind(&other), "unexpected message, closing channel");
                break;
            },
        }
    }

    shared.poison();
}

fn deliver_reply(shared: &Shared, call_id: CallId, reply: ReplyFrame) {
    let slot = shared
        .pending
        .lock()
        .expect("pending table lock poisoned")
        .remove(&call_id);
    match slot {
        // A failed send means the waiter gave up (dropped its handle);
        // the outcome is discarded.
        Some(tx) => {
            let _ = tx.send(reply);
        },
        None => warn!(call_id, "response for unknown call"),
    }
}

/// Short tag for logging unexpected inbound messages.
fn message_kind(message: &WireMessage) -> &'static str {
    match message {
        WireMessage::AuthRequest(_) => "auth_request",
        WireMessage::AuthResponse(_) => "auth_response",
        WireMessage::UpgradeRequest { .. } => "upgrade_request",
        WireMessage::UpgradeResponse { .. } => "upgrade_response",
        WireMessage::CallRequest { .. } => "call_request",
        WireMessage::CallResponse { .. } => "call_response",
        WireMessage::PipeOpen { .. } => "pipe_open",
        WireMessage::PipeData { .. } => "pipe_data",
        WireMessage::PipeClose { .. } => "pipe_close",
        WireMessage::Goodbye => "goodbye",
    }
}
