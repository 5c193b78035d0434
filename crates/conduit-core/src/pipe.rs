//! Pipe plumbing: bounded byte queues with explicit close propagation.
//!
//! A pipe is a pair of endpoints on opposite ends of the channel. The local
//! endpoint here is either a [`PipeReader`] (a bounded queue the connection's
//! dispatch task fills from inbound `PipeData` frames) or a [`PipeWriter`]
//! (which chunks writes into outbound `PipeData` frames). Pipes are modeled
//! as byte queues rather than OS streams so close propagation and channel
//! poisoning behave identically on every transport.
//!
//! Close semantics:
//!
//! - Writer close enqueues an end-of-stream marker BEHIND any buffered
//!   chunks; the reader drains buffered bytes, then observes ordinary
//!   exhaustion (`Ok(None)`). Nothing buffered is ever dropped by a close.
//! - Channel teardown poisons the queue instead: after draining, the reader
//!   observes [`PipeError::ChannelClosed`], a terminal failure.
//!
//! Backpressure: queues are bounded. A fast writer suspends when the
//! transport or the consuming end is slow.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use futures::{Sink, SinkExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ProtocolError;
use crate::wire::{PipeId, WireMessage, encode_message};

/// Maximum payload bytes per `PipeData` frame.
///
/// Large writes are split so a single pipe cannot monopolize the connection
/// or approach the frame size limit.
pub const PIPE_CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered per pipe before the producing side suspends.
pub const PIPE_QUEUE_DEPTH: usize = 32;

/// Frames queued to a connection's writer task before senders suspend.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Control messages consumed by a connection's writer task.
///
/// The writer task is the single owner of the outbound sink; everything
/// that transmits (calls, upgrades, pipes, shutdown) goes through this
/// queue.
#[derive(Debug)]
pub enum Outbound {
    /// A pre-encoded frame to transmit.
    Frame(Bytes),
    /// Flush and close the sink, ending the writer task.
    Shutdown,
}

/// Drive a connection's outbound sink from its queue.
///
/// This is the writer task body for both ends of the channel: the single
/// owner of the sink, draining [`Outbound`] items until a
/// [`Outbound::Shutdown`] arrives, the queue's senders are all dropped, or
/// the sink fails.
pub async fn drive_outbound<S>(mut sink: S, mut outbound: mpsc::Receiver<Outbound>)
where
    S: Sink<Bytes, Error = ProtocolError> + Unpin,
{
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(frame) => {
                if let Err(e) = sink.send(frame).await {
                    debug!(error = %e, "outbound sink failed, writer stopping");
                    break;
                }
            },
            Outbound::Shutdown => {
                let _ = sink.close().await;
                break;
            },
        }
    }
}

/// Pipe failure modes.
#[derive(Debug, Error)]
pub enum PipeError {
    /// The channel carrying this pipe was closed or lost.
    ///
    /// Terminal: distinct from ordinary end-of-stream.
    #[error("channel closed")]
    ChannelClosed,

    /// The writer end was already closed by an earlier call.
    #[error("pipe writer already closed")]
    WriterClosed,

    /// A wire-level fault while encoding pipe traffic.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Events delivered into a pipe's queue by the dispatch task.
#[derive(Debug)]
enum PipeEvent {
    /// A chunk of payload, in stream order.
    Data(Bytes),
    /// The remote writer closed its end.
    Eof,
}

/// The reading end of a pipe.
///
/// Filled by the connection's dispatch task; drained by exactly one
/// consumer.
#[derive(Debug)]
pub struct PipeReader {
    pipe_id: PipeId,
    rx: mpsc::Receiver<PipeEvent>,
    finished: bool,
}

impl PipeReader {
    /// Returns the pipe id this endpoint belongs to.
    #[must_use]
    pub const fn id(&self) -> PipeId {
        self.pipe_id
    }

    /// Receive the next chunk.
    ///
    /// Suspends until bytes, end-of-stream, or channel teardown arrive.
    /// `Ok(None)` is ordinary exhaustion after the remote writer closed;
    /// every call after that keeps returning `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`PipeError::ChannelClosed`] if the channel was torn down
    /// before the writer closed this pipe. Chunks buffered before the
    /// teardown are still delivered first.
    pub async fn read(&mut self) -> Result<Option<Bytes>, PipeError> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(PipeEvent::Data(bytes)) => Ok(Some(bytes)),
            Some(PipeEvent::Eof) => {
                self.finished = true;
                Ok(None)
            },
            None => Err(PipeError::ChannelClosed),
        }
    }

    /// Drain the pipe to completion and return all bytes in stream order.
    ///
    /// # Errors
    ///
    /// Returns [`PipeError::ChannelClosed`] if the channel dies before
    /// end-of-stream.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, PipeError> {
        let mut collected = Vec::new();
        while let Some(chunk) = self.read().await? {
            collected.extend_from_slice(&chunk);
        }
        Ok(collected)
    }
}

/// The writing end of a pipe.
///
/// Writes are chunked into `PipeData` frames and pushed through the
/// connection's writer queue, so a slow transport suspends the writer.
#[derive(Debug)]
pub struct PipeWriter {
    pipe_id: PipeId,
    outbound: mpsc::Sender<Outbound>,
    closed: bool,
}

impl PipeWriter {
    /// Create a writer for `pipe_id` that transmits through `outbound`.
    #[must_use]
    pub const fn new(pipe_id: PipeId, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            pipe_id,
            outbound,
            closed: false,
        }
    }

    /// Returns the pipe id this endpoint belongs to.
    #[must_use]
    pub const fn id(&self) -> PipeId {
        self.pipe_id
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Write `buf` to the pipe, preserving byte order.
    ///
    /// Empty writes are a no-op. Large buffers are split into
    /// [`PIPE_CHUNK_SIZE`] frames.
    ///
    /// # Errors
    ///
    /// - [`PipeError::WriterClosed`] after [`close`](Self::close)
    /// - [`PipeError::ChannelClosed`] if the channel was torn down
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), PipeError> {
        if self.closed {
            return Err(PipeError::WriterClosed);
        }
        for chunk in buf.chunks(PIPE_CHUNK_SIZE) {
            let frame = encode_message(&WireMessage::PipeData {
                pipe_id: self.pipe_id,
                bytes: chunk.to_vec(),
            })?;
            self.outbound
                .send(Outbound::Frame(frame))
                .await
                .map_err(|_| PipeError::ChannelClosed)?;
        }
        Ok(())
    }

    /// Close the writing end, propagating end-of-stream to the reader.
    ///
    /// Idempotent, and safe to call from error paths: if the channel is
    /// already gone the close is a no-op, since teardown poisons the remote
    /// reader anyway.
    ///
    /// # Errors
    ///
    /// Returns [`PipeError::Protocol`] only for encoding faults.
    pub async fn close(&mut self) -> Result<(), PipeError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let frame = encode_message(&WireMessage::PipeClose {
            pipe_id: self.pipe_id,
        })?;
        if self.outbound.send(Outbound::Frame(frame)).await.is_err() {
            debug!(pipe_id = self.pipe_id, "pipe close after channel teardown");
        }
        Ok(())
    }
}

/// Per-channel registry of local pipe reading ends.
///
/// The dispatch task is the only producer; pipe ids are registered by the
/// end that created the pipe. Dropping the table's senders without an `Eof`
/// poisons every registered reader.
#[derive(Debug, Default)]
pub struct PipeTable {
    entries: Mutex<HashMap<PipeId, mpsc::Sender<PipeEvent>>>,
}

impl PipeTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pipe and hand back its local reading end.
    ///
    /// A duplicate id replaces the previous entry, poisoning the old
    /// reader; callers allocate ids from a per-channel counter so this only
    /// happens with a misbehaving peer.
    #[must_use]
    pub fn register(&self, pipe_id: PipeId) -> PipeReader {
        let (tx, rx) = mpsc::channel(PIPE_QUEUE_DEPTH);
        self.entries
            .lock()
            .expect("pipe table lock poisoned")
            .insert(pipe_id, tx);
        PipeReader {
            pipe_id,
            rx,
            finished: false,
        }
    }

    /// Deliver a payload chunk, suspending under reader backpressure.
    ///
    /// Returns `false` if the pipe is unknown or its reader is gone; the
    /// chunk is dropped and the stale entry removed.
    pub async fn deliver_data(&self, pipe_id: PipeId, bytes: Bytes) -> bool {
        let sender = {
            let entries = self.entries.lock().expect("pipe table lock poisoned");
            entries.get(&pipe_id).cloned()
        };
        let Some(sender) = sender else {
            debug!(pipe_id, "dropping data for unknown pipe");
            return false;
        };
        if sender.send(PipeEvent::Data(bytes)).await.is_err() {
            self.remove(pipe_id);
            return false;
        }
        true
    }

    /// Deliver end-of-stream and retire the pipe.
    ///
    /// Returns `false` if the pipe is unknown or its reader is gone.
    pub async fn deliver_eof(&self, pipe_id: PipeId) -> bool {
        let sender = {
            let mut entries = self.entries.lock().expect("pipe table lock poisoned");
            entries.remove(&pipe_id)
        };
        let Some(sender) = sender else {
            debug!(pipe_id, "dropping close for unknown pipe");
            return false;
        };
        sender.send(PipeEvent::Eof).await.is_ok()
    }

    /// Remove a pipe without delivering end-of-stream.
    ///
    /// The reader drains buffered chunks and then observes
    /// [`PipeError::ChannelClosed`].
    pub fn remove(&self, pipe_id: PipeId) {
        self.entries
            .lock()
            .expect("pipe table lock poisoned")
            .remove(&pipe_id);
    }

    /// Poison every registered reader: used on channel teardown.
    ///
    /// Buffered chunks are still delivered; after draining, readers observe
    /// [`PipeError::ChannelClosed`] rather than end-of-stream.
    pub fn poison(&self) {
        self.entries
            .lock()
            .expect("pipe table lock poisoned")
            .clear();
    }

    /// Number of live pipes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("pipe table lock poisoned").len()
    }

    /// Returns `true` if no pipes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode_message;

    #[tokio::test]
    async fn test_data_then_eof_in_order() {
        let table = PipeTable::new();
        let mut reader = table.register(1);

        assert!(table.deliver_data(1, Bytes::from_static(b"ab")).await);
        assert!(table.deliver_data(1, Bytes::from_static(b"cd")).await);
        assert!(table.deliver_eof(1).await);

        assert_eq!(reader.read().await.unwrap().unwrap(), &b"ab"[..]);
        assert_eq!(reader.read().await.unwrap().unwrap(), &b"cd"[..]);
        assert!(reader.read().await.unwrap().is_none());
        // Exhaustion is sticky.
        assert!(reader.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_to_end_collects_stream() {
        let table = PipeTable::new();
        let mut reader = table.register(1);

        table.deliver_data(1, Bytes::from_static(b"Hello, ")).await;
        table.deliver_data(1, Bytes::from_static(b"world!\n")).await;
        table.deliver_eof(1).await;

        let collected = reader.read_to_end().await.unwrap();
        assert_eq!(collected, b"Hello, world!\n");
    }

    #[tokio::test]
    async fn test_poison_drains_buffer_then_fails() {
        let table = PipeTable::new();
        let mut reader = table.register(1);

        table.deliver_data(1, Bytes::from_static(b"buffered")).await;
        table.poison();

        // Already-buffered bytes are not lost by teardown.
        assert_eq!(reader.read().await.unwrap().unwrap(), &b"buffered"[..]);
        assert!(matches!(
            reader.read().await,
            Err(PipeError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_deliver_to_unknown_pipe() {
        let table = PipeTable::new();
        assert!(!table.deliver_data(42, Bytes::from_static(b"x")).await);
        assert!(!table.deliver_eof(42).await);
    }

    #[tokio::test]
    async fn test_dropped_reader_is_pruned() {
        let table = PipeTable::new();
        let reader = table.register(7);
        drop(reader);

        assert!(!table.deliver_data(7, Bytes::from_static(b"x")).await);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_writer_chunks_large_payload() {
        let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let mut writer = PipeWriter::new(3, tx);

        let payload = vec![0xA5u8; PIPE_CHUNK_SIZE + 100];
        writer.write(&payload).await.unwrap();

        let mut seen = Vec::new();
        for expected_len in [PIPE_CHUNK_SIZE, 100] {
            let Some(Outbound::Frame(frame)) = rx.recv().await else {
                panic!("expected a data frame");
            };
            match decode_message(&frame).unwrap() {
                WireMessage::PipeData { pipe_id, bytes } => {
                    assert_eq!(pipe_id, 3);
                    assert_eq!(bytes.len(), expected_len);
                    seen.extend_from_slice(&bytes);
                },
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert_eq!(seen, payload);
    }

    #[tokio::test]
    async fn test_writer_empty_write_sends_nothing() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut writer = PipeWriter::new(3, tx);

        writer.write(b"").await.unwrap();
        writer.close().await.unwrap();

        // The only frame is the close.
        let Some(Outbound::Frame(frame)) = rx.recv().await else {
            panic!("expected the close frame");
        };
        assert!(matches!(
            decode_message(&frame).unwrap(),
            WireMessage::PipeClose { pipe_id: 3 }
        ));
    }

    #[tokio::test]
    async fn test_writer_close_idempotent() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut writer = PipeWriter::new(3, tx);

        writer.close().await.unwrap();
        writer.close().await.unwrap();
        assert!(writer.is_closed());

        assert!(matches!(rx.recv().await, Some(Outbound::Frame(_))));
        // No second close frame was queued; the queue is now idle.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (tx, _rx) = mpsc::channel(4);
        let mut writer = PipeWriter::new(3, tx);

        writer.close().await.unwrap();
        assert!(matches!(
            writer.write(b"late").await,
            Err(PipeError::WriterClosed)
        ));
    }

    #[tokio::test]
    async fn test_write_after_channel_teardown_fails() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let mut writer = PipeWriter::new(3, tx);

        assert!(matches!(
            writer.write(b"x").await,
            Err(PipeError::ChannelClosed)
        ));
        // Close stays safe on a dead channel.
        writer.close().await.unwrap();
    }
}
