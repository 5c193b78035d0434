//! The unit of work: a named operation plus captured arguments.
//!
//! A [`Command`] is deliberately not mobile code. It names an operation the
//! server already knows how to execute and carries the arguments captured at
//! the call site as a JSON payload, so remote execution needs no shared
//! runtime between client and server. The server resolves the name against
//! its operation registry and decodes the arguments into whatever shape the
//! handler declares.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

/// A self-contained description of one remote operation invocation.
///
/// Everything the server needs travels inside: the operation name and the
/// captured argument payload. Pipes are captured by id inside the arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Command {
    /// Registered operation name, e.g. `"jobs.count"`.
    pub op: String,

    /// Captured arguments, JSON-encoded. `null` for argument-less
    /// operations.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub args: serde_json::Value,
}

impl Command {
    /// Create an argument-less command.
    #[must_use]
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            args: serde_json::Value::Null,
        }
    }

    /// Capture arguments into the command.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Serialization`] if the arguments cannot be
    /// JSON-encoded; the failure surfaces before anything is transmitted.
    pub fn with_args<T: Serialize>(mut self, args: &T) -> ProtocolResult<Self> {
        self.args = serde_json::to_value(args).map_err(|e| {
            ProtocolError::serialization(format!("failed to encode command arguments: {e}"))
        })?;
        Ok(self)
    }

    /// Decode the captured arguments into the shape a handler declares.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Serialization`] if the payload does not
    /// match `T`.
    pub fn parse_args<T: DeserializeOwned>(&self) -> ProtocolResult<T> {
        serde_json::from_value(self.args.clone()).map_err(|e| {
            ProtocolError::serialization(format!("failed to decode command arguments: {e}"))
        })
    }
}
