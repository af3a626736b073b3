//! Handler failures, reported to the controller as the batch's failure record

use ape_shared::{MemberKind, ObjectSlot, TypeTag};
use thiserror::Error;

/// Why a command could not be carried out
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Locate or relocate found nothing before the timeout
    #[error("Failed to find control")]
    ControlNotFound,

    /// Command is not allowed here (ordering within the batch, agent state)
    #[error("{0}")]
    InvalidOperation(String),

    /// A polling wait ran out of time
    #[error("{0}")]
    Timeout(String),

    /// No registered member matches the request
    #[error("{type_name} has no {kind:?} member {name:?} taking {params:?}")]
    MissingMember {
        /// Registered (or Rust) name of the target type
        type_name: String,
        /// Requested member kind
        kind: MemberKind,
        /// Requested member name
        name: String,
        /// Parameter tags of the request
        params: Vec<TypeTag>,
    },

    /// No registered constructor matches the request
    #[error("{type_name} has no constructor taking {params:?}")]
    MissingConstructor {
        /// Requested type
        type_name: String,
        /// Parameter tags of the request
        params: Vec<TypeTag>,
    },

    /// A command read a slot nothing was stored in
    #[error("{0} is empty")]
    EmptySlot(ObjectSlot),

    /// An operand had the wrong shape
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        /// What the handler needed
        expected: String,
        /// What it got
        found: String,
    },

    /// Text criterion is not a valid regular expression
    #[error("invalid text pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Error raised by host code, under the host's own type name
    #[error("{message}")]
    Raised {
        /// Host error type
        type_name: String,
        /// Host error message
        message: String,
    },

    /// A handler or host callback panicked
    #[error("{0}")]
    Panic(String),

    /// The UI thread no longer accepts work
    #[error("UI thread is not running")]
    DispatcherGone,

    /// The controller exited while the agent was blocked for it
    #[error("controller process exited")]
    PeerGone,

    /// Wire-level decoding problem
    #[error(transparent)]
    Protocol(#[from] ape_shared::Error),
}

impl HandlerError {
    /// Error raised by host code
    pub fn raised(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerError::Raised {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    pub(crate) fn mismatch(expected: impl Into<String>, found: impl std::fmt::Debug) -> Self {
        HandlerError::TypeMismatch {
            expected: expected.into(),
            found: format!("{found:?}"),
        }
    }

    /// Type name reported in the failure record
    pub fn type_name(&self) -> &str {
        match self {
            HandlerError::ControlNotFound => "ControlNotFound",
            HandlerError::InvalidOperation(_) => "InvalidOperation",
            HandlerError::Timeout(_) => "Timeout",
            HandlerError::MissingMember { .. } => "MissingMember",
            HandlerError::MissingConstructor { .. } => "MissingConstructor",
            HandlerError::EmptySlot(_) => "EmptySlot",
            HandlerError::TypeMismatch { .. } => "TypeMismatch",
            HandlerError::Pattern(_) => "InvalidPattern",
            HandlerError::Raised { type_name, .. } => type_name,
            HandlerError::Panic(_) => "panic",
            HandlerError::DispatcherGone => "DispatcherGone",
            HandlerError::PeerGone => "PeerExited",
            HandlerError::Protocol(_) => "ProtocolError",
        }
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_text() {
        let err = HandlerError::ControlNotFound;
        assert_eq!(err.type_name(), "ControlNotFound");
        assert_eq!(err.to_string(), "Failed to find control");
    }

    #[test]
    fn test_raised_keeps_host_type() {
        let err = HandlerError::raised("ArgumentOutOfRange", "index 7");
        assert_eq!(err.type_name(), "ArgumentOutOfRange");
        assert_eq!(err.to_string(), "index 7");
    }

    #[test]
    fn test_panic_payloads() {
        let caught = std::panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(caught), "boom 1");
        let caught = std::panic::catch_unwind(|| std::panic::panic_any(5u8)).unwrap_err();
        assert_eq!(panic_message(caught), "<non-string panic payload>");
    }
}
