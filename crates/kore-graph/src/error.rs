//! Error types for command buffer recording, patching and driver calls.

use crate::command_buffer::{Mode, NodeKind, State};
use crate::driver::Platform;

/// Error reported by a graph driver call.
///
/// The message is whatever the driver said; the core never rewrites it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{op} failed: {msg}")]
pub struct DriverError {
    /// Driver entry point that failed (e.g. `cuGraphInstantiateWithFlags`).
    pub op: String,
    /// Driver-provided description.
    pub msg: String,
}

impl DriverError {
    pub fn new(op: impl Into<String>, msg: impl Into<String>) -> Self {
        Self { op: op.into(), msg: msg.into() }
    }
}

/// Coarse classification of a [`GraphError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Operation not legal in the current state.
    InvalidState,
    /// Operation requires the other command buffer mode.
    InvalidMode,
    /// Deliberately unimplemented operation.
    Unsupported,
    /// Arguments of the wrong kind.
    BadArgument,
    /// Internal invariant broken (e.g. a finalized primary without executable).
    InvariantViolation,
    /// Underlying driver call failed.
    Driver,
    /// Invalid configuration.
    Config,
}

/// Command buffer errors.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("command buffer in {state} state can't {op}")]
    InvalidState { op: &'static str, state: State },

    #[error("update pass consumed {consumed} of {expected} recorded commands")]
    UpdateMismatch { consumed: usize, expected: usize },

    #[error("update pass issued a {requested} command at position {index}, recorded a {recorded}")]
    PatchMismatch { index: usize, recorded: NodeKind, requested: NodeKind },

    #[error("update pass issued command #{index} but only {len} were recorded")]
    PatchOutOfRange { index: usize, len: usize },

    #[error("{op} is not allowed on a {mode} command buffer")]
    InvalidMode { op: &'static str, mode: Mode },

    #[error("command buffer belongs to {found} driver, expected {expected}")]
    BackendMismatch { expected: Platform, found: Platform },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("primary command buffers are expected to have executable graphs")]
    MissingExecutable,

    #[error("failed to capture gpu graph: {0}")]
    TraceFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid graph config: {0}")]
    Config(String),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl GraphError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphError::InvalidState { .. }
            | GraphError::UpdateMismatch { .. }
            | GraphError::PatchMismatch { .. }
            | GraphError::PatchOutOfRange { .. } => ErrorKind::InvalidState,
            GraphError::InvalidMode { .. } | GraphError::BackendMismatch { .. } => {
                ErrorKind::InvalidMode
            }
            GraphError::Unsupported(_) => ErrorKind::Unsupported,
            GraphError::BadArgument(_) => ErrorKind::BadArgument,
            GraphError::MissingExecutable => ErrorKind::InvariantViolation,
            GraphError::TraceFailed(_) | GraphError::Driver(_) => ErrorKind::Driver,
            GraphError::Config(_) => ErrorKind::Config,
        }
    }
}
