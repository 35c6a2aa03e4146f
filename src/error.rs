//! # Error Types
//!
//! Fault taxonomy for the remote-object protocol.
//!
//! Every failure a caller can observe is a [`Fault`]. Faults raised while
//! serving a request are recovered at the dispatcher boundary and shipped back
//! to the caller as structured replies, so the classification survives the
//! round trip: a client can always tell "no such attribute" apart from "the
//! attribute exists but raised".
//!
//! ## Fault Categories
//! - **Protocol**: malformed label, payload shape or frame; scoped to one decode
//! - **Attribute**: the requested name does not exist (or is refused)
//! - **Execution**: resolving or invoking the name raised
//! - **Timeout**: the call exceeded the configured duration
//! - **Connection**: the transport closed or is unreachable
//! - **Redirection**: stream redirection nesting/restoration invariant broken
//!
//! ## Example Usage
//! ```rust
//! use remote_object::error::{Fault, Phase};
//!
//! let fault = Fault::raised(Phase::Call, "ZeroDivisionError", "division by zero");
//! assert!(fault.is_execution());
//! assert_eq!(fault.phase(), Some(Phase::Call));
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_CONNECTION_LOST: &str = "Connection lost while waiting for reply";
    pub const ERR_NOT_CONNECTED: &str = "Client is not connected";

    /// Protocol validation errors
    pub const ERR_INVALID_HEADER: &str = "Invalid protocol header";
    pub const ERR_UNKNOWN_LABEL: &str = "Unrecognized boxing label";
    pub const ERR_LABEL_SHAPE: &str = "Boxing label does not match payload shape";
    pub const ERR_UNKNOWN_LOCAL_REF: &str = "Local reference does not name a live object";
    pub const ERR_UNEXPECTED_REPLY: &str = "Reply does not match any pending request";
    pub const ERR_NO_ROOT: &str = "Peer does not host a root object";

    /// Synchronization errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Redirection errors
    pub const ERR_REDIRECT_UNDERFLOW: &str = "Redirection depth underflow";

    /// Hosted code errors
    pub const ERR_NOT_CALLABLE: &str = "object is not callable";
    pub const ERR_PANICKED: &str = "hosted call panicked";
}

/// Which step of resolving an operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Resolving the name (a getter or resolution hook raised)
    Lookup,
    /// Invoking the resolved callable raised
    Call,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Lookup => f.write_str("lookup"),
            Phase::Call => f.write_str("call"),
        }
    }
}

// Fault is the primary error type for all protocol operations
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum Fault {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("'{type_name}' object has no attribute '{name}'")]
    Attribute { type_name: String, name: String },

    #[error("{kind} during {phase}: {message}")]
    Execution {
        phase: Phase,
        kind: String,
        message: String,
    },

    #[error("Call timed out after {0} ms")]
    Timeout(u64),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Redirection state error: {0}")]
    Redirection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Serialization(#[from] bincode::Error),
}

/// Type alias for Results using Fault
pub type Result<T> = std::result::Result<T, Fault>;

impl Fault {
    /// "No such attribute" on an object of the given type.
    pub fn attribute(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Fault::Attribute {
            type_name: type_name.into(),
            name: name.into(),
        }
    }

    /// Hosted code raised while being resolved or invoked.
    pub fn raised(phase: Phase, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Fault::Execution {
            phase,
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a failure raised by hosted code while it was being called.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::raised(Phase::Call, "RuntimeError", message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Fault::Protocol(message.into())
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Fault::Connection(message.into())
    }

    pub fn is_attribute(&self) -> bool {
        matches!(self, Fault::Attribute { .. })
    }

    pub fn is_execution(&self) -> bool {
        matches!(self, Fault::Execution { .. })
    }

    /// Faults that leave the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Fault::Connection(_) | Fault::Io(_) | Fault::Redirection(_)
        )
    }

    /// Which phase failed: `Lookup` for missing names and raising getters,
    /// `Call` for invocations that raised. `None` for transport-level faults.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Fault::Attribute { .. } => Some(Phase::Lookup),
            Fault::Execution { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Re-tag an execution fault with the phase the dispatcher observed it in.
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            Fault::Execution { kind, message, .. } => Fault::Execution {
                phase,
                kind,
                message,
            },
            other => other,
        }
    }

    /// Classify a fault that escaped the body of an existing getter or
    /// callable running in `phase`. A missing name reported from inside the
    /// body means the body raised, not that the outer name is missing.
    pub fn raised_in(self, phase: Phase) -> Self {
        match self {
            Fault::Attribute { .. } => Fault::Execution {
                phase,
                kind: String::from("AttributeError"),
                message: self.to_string(),
            },
            other => other.in_phase(phase),
        }
    }

    /// Convert into a form that can cross the wire. Local-only variants
    /// (`Io`, `Serialization`) are mapped onto their serializable siblings.
    pub fn into_wire(self) -> Self {
        match self {
            Fault::Io(e) => Fault::Connection(e.to_string()),
            Fault::Serialization(e) => Fault::Protocol(e.to_string()),
            other => other,
        }
    }
}

impl Clone for Fault {
    fn clone(&self) -> Self {
        match self {
            Fault::Protocol(m) => Fault::Protocol(m.clone()),
            Fault::Attribute { type_name, name } => Fault::Attribute {
                type_name: type_name.clone(),
                name: name.clone(),
            },
            Fault::Execution {
                phase,
                kind,
                message,
            } => Fault::Execution {
                phase: *phase,
                kind: kind.clone(),
                message: message.clone(),
            },
            Fault::Timeout(ms) => Fault::Timeout(*ms),
            Fault::Connection(m) => Fault::Connection(m.clone()),
            Fault::Redirection(m) => Fault::Redirection(m.clone()),
            Fault::Config(m) => Fault::Config(m.clone()),
            Fault::Io(e) => Fault::Io(io::Error::new(e.kind(), e.to_string())),
            Fault::Serialization(e) => Fault::Protocol(e.to_string()),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Fault {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Fault::Connection(constants::ERR_LOCK_POISONED.to_string())
    }
}
