//! Result handles for asynchronously dispatched calls.
//!
//! A [`CallHandle`] represents one in-flight remote call. It is backed by a
//! one-shot completion signal: when the server-side execution completes and
//! its response frame is routed by the channel's dispatch task, the handle
//! becomes observable — that routing is the happens-before edge between
//! "server execution completed" and "handle resolves".
//!
//! A handle makes exactly one terminal transition. Querying again after
//! completion returns the stored outcome; abandoning a wait with
//! [`CallHandle::get_timeout`] does not consume the handle and does not
//! cancel the remote execution.

use std::marker::PhantomData;
use std::time::Duration;

use conduit_core::wire::{CallId, CallOutcome, UpgradeOutcome};
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::error::{CallError, RemotingError};

/// A response frame routed to a pending correlation slot.
///
/// Calls and upgrades share one correlation space, so the dispatch task
/// delivers both through the same table.
#[derive(Debug)]
pub(crate) enum ReplyFrame {
    /// Terminal outcome of a remote call.
    Call(CallOutcome),
    /// Verdict on an upgrade request.
    Upgrade(UpgradeOutcome),
}

/// Resolution state of a handle.
#[derive(Debug)]
enum HandleState {
    /// No response routed yet.
    Pending(oneshot::Receiver<ReplyFrame>),
    /// Terminal outcome, stored for repeated queries.
    Resolved(CallOutcome),
    /// The channel died before a response arrived.
    Failed(RemotingError),
}

/// Handle for a call dispatched with `call_async`.
///
/// `T` is the call's declared result type; the stored outcome is decoded
/// into it on every successful query.
#[derive(Debug)]
pub struct CallHandle<T> {
    call_id: CallId,
    state: HandleState,
    _result: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> CallHandle<T> {
    pub(crate) fn new(call_id: CallId, rx: oneshot::Receiver<ReplyFrame>) -> Self {
        Self {
            call_id,
            state: HandleState::Pending(rx),
            _result: PhantomData,
        }
    }

    /// Returns the call's correlation id.
    #[must_use]
    pub const fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Returns `true` once a terminal outcome (or channel loss) is stored.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        !matches!(self.state, HandleState::Pending(_))
    }

    /// Wait for the call to resolve and return its value.
    ///
    /// Suspends the caller until the response frame arrives. After
    /// resolution, repeated calls return the stored outcome.
    ///
    /// # Errors
    ///
    /// - [`CallError::Remote`]: the operation raised its declared failure,
    ///   propagated with kind and payload intact
    /// - [`CallError::Unauthorized`]: capability level too low
    /// - [`CallError::Remoting`]: dispatch fault or channel loss
    pub async fn get(&mut self) -> Result<T, CallError> {
        self.wait().await;
        self.interpret()
    }

    /// As [`get`](Self::get), but abandon the local wait after `timeout`.
    ///
    /// A timeout does not cancel the in-flight remote execution and does
    /// not consume the handle: the call may still resolve, and a later
    /// `get` observes it. Wrapping a possibly never-completing remote
    /// execution with a timeout is the caller's responsibility.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get), plus [`CallError::Timeout`] when the wait is
    /// abandoned.
    pub async fn get_timeout(&mut self, timeout: Duration) -> Result<T, CallError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(()) => self.interpret(),
            Err(_) => Err(CallError::Timeout { timeout }),
        }
    }

    /// Drive the handle to a terminal state.
    async fn wait(&mut self) {
        if let HandleState::Pending(rx) = &mut self.state {
            self.state = match rx.await {
                Ok(ReplyFrame::Call(outcome)) => HandleState::Resolved(outcome),
                Ok(ReplyFrame::Upgrade(_)) => HandleState::Failed(RemotingError::Dispatch {
                    reason: "mismatched response kind for call".to_string(),
                }),
                // Sender dropped: the channel was poisoned.
                Err(_) => HandleState::Failed(RemotingError::ChannelClosed),
            };
        }
    }

    /// Decode the stored terminal outcome.
    fn interpret(&self) -> Result<T, CallError> {
        match &self.state {
            HandleState::Resolved(CallOutcome::Success { value }) => {
                serde_json::from_value(value.clone()).map_err(|e| {
                    CallError::Remoting(RemotingError::Serialization {
                        reason: format!("failed to decode call result: {e}"),
                    })
                })
            },
            HandleState::Resolved(CallOutcome::Failure { failure }) => {
                Err(CallError::Remote(failure.clone()))
            },
            HandleState::Resolved(CallOutcome::Denied { reason }) => Err(CallError::Unauthorized {
                reason: reason.clone(),
            }),
            HandleState::Resolved(CallOutcome::Error { reason }) => {
                Err(CallError::Remoting(RemotingError::Dispatch {
                    reason: reason.clone(),
                }))
            },
            HandleState::Failed(err) => Err(CallError::Remoting(err.clone())),
            // `wait` always leaves a terminal state before `interpret` runs.
            HandleState::Pending(_) => Err(CallError::Remoting(RemotingError::ChannelClosed)),
        }
    }
}
