//! Error taxonomy shared by controller and agent

use thiserror::Error;

/// Result alias used across the APE crates
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the transport, the handshake and the batch API
#[derive(Debug, Error)]
pub enum Error {
    /// Caller violated the locate → query → fetch ordering (never reaches the wire)
    #[error("protocol sequence error: {0}")]
    ProtocolSequence(&'static str),

    /// A shared region or the event could not be created or opened
    #[error("channel {name} unavailable: {reason}")]
    ChannelUnavailable {
        /// Kernel object name that failed
        name: String,
        /// OS or validation failure text
        reason: String,
    },

    /// The peer process exited while we were waiting on it
    #[error("peer process {pid} exited")]
    PeerExited {
        /// Process id of the peer
        pid: u32,
    },

    /// A handler on the agent side failed; the whole batch was abandoned
    #[error("{type_name}: {message}")]
    RemoteExecution {
        /// Name of the remote error type
        type_name: String,
        /// Remote error message
        message: String,
        /// Remote stack or cause chain
        stack: String,
    },

    /// A tag, member kind or action value without a handler
    #[error("unsupported operand: {0}")]
    UnsupportedOperand(String),

    /// Payload does not fit in the remaining string arena
    #[error("string arena overflow: need {needed} bytes, {available} available")]
    ArenaOverflow {
        /// Bytes the write required
        needed: usize,
        /// Bytes left in the arena
        available: usize,
    },

    /// The batch already holds the maximum number of commands
    #[error("batch is full ({capacity} commands)")]
    BatchCapacity {
        /// Maximum commands per batch
        capacity: usize,
    },

    /// A record in shared memory is inconsistent with its own fields
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

impl Error {
    /// Build a [`Error::ChannelUnavailable`] from anything displayable
    pub fn unavailable(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::ChannelUnavailable {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the channel can no longer be used
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::PeerExited { .. } | Error::ChannelUnavailable { .. })
    }
}
