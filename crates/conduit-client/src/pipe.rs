//! The client-facing pipe: one local endpoint of a cross-channel byte
//! stream.
//!
//! A [`Pipe`] is created on a channel with a fixed direction and carries
//! exactly one local endpoint: the writer of a local-to-remote pipe or the
//! reader of a remote-to-local pipe. The opposite endpoint materializes on
//! the server side when an operation receives the pipe's id inside its
//! command arguments — a pipe that is never referenced by a unit of work
//! connects to nothing.
//!
//! Pipes are independent of call lifecycles: an async call that drains a
//! pipe resolves only after the local writer closes, an ordering the caller
//! must respect (close the writer before awaiting such a call).

use conduit_core::pipe::{PipeReader, PipeWriter};
use conduit_core::wire::{PipeDirection, PipeId};

/// One local endpoint of a cross-channel byte stream.
#[derive(Debug)]
pub struct Pipe {
    id: PipeId,
    direction: PipeDirection,
    writer: Option<PipeWriter>,
    reader: Option<PipeReader>,
}

impl Pipe {
    /// A local-to-remote pipe: the local endpoint writes.
    pub(crate) fn local_writer(id: PipeId, writer: PipeWriter) -> Self {
        Self {
            id,
            direction: PipeDirection::LocalToRemote,
            writer: Some(writer),
            reader: None,
        }
    }

    /// A remote-to-local pipe: the local endpoint reads.
    pub(crate) fn local_reader(id: PipeId, reader: PipeReader) -> Self {
        Self {
            id,
            direction: PipeDirection::RemoteToLocal,
            writer: None,
            reader: Some(reader),
        }
    }

    /// The pipe id, as referenced inside command arguments.
    #[must_use]
    pub const fn id(&self) -> PipeId {
        self.id
    }

    /// The direction fixed at creation.
    #[must_use]
    pub const fn direction(&self) -> PipeDirection {
        self.direction
    }

    /// Take the local writing end.
    ///
    /// `Some` exactly once, and only for local-to-remote pipes.
    #[must_use]
    pub fn take_writer(&mut self) -> Option<PipeWriter> {
        self.writer.take()
    }

    /// Take the local reading end.
    ///
    /// `Some` exactly once, and only for remote-to-local pipes.
    #[must_use]
    pub fn take_reader(&mut self) -> Option<PipeReader> {
        self.reader.take()
    }
}
