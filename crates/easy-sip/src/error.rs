//! Error types for the easy-sip session layer
//!
//! Errors fall into the categories the session layer reports on:
//!
//! - **Configuration** - malformed credentials or addresses, detected before any I/O
//! - **Transport / registration** - delivered through delegates, never thrown by `register`
//! - **Renegotiation** - hold/unhold rejected by the peer
//! - **Unsupported capability** - e.g. audio sink selection on a runtime without it
//! - **Invalid target** - unparseable transfer targets, expired invitations, unknown sessions
//!
//! Native stack failures are carried through as [`StackError`].

use thiserror::Error;

use crate::stack::StackError;

/// Result type for session layer operations
pub type SipResult<T> = Result<T, SipError>;

/// Errors that can occur in the session layer
#[derive(Debug, Clone, Error)]
pub enum SipError {
    /// Malformed credentials or address
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    /// Operation needs a registered user agent
    #[error("Not registered: call register() first")]
    NotRegistered,

    /// Transport connect failure or disconnect
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// Registrar refused the registration
    #[error("Registration rejected ({status:?}): {reason}")]
    RegistrationRejected { status: Option<u16>, reason: String },

    /// Peer rejected a hold/unhold renegotiation
    #[error("Renegotiation failed: {reason}")]
    RenegotiationFailed { reason: String },

    /// Operation not valid in the session's current phase
    #[error("Cannot {operation} while session is {phase}")]
    InvalidState { operation: String, phase: String },

    /// Transfer target or destination could not be used
    #[error("Invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    /// Invitation was cancelled or terminated before it could be answered
    #[error("Invitation no longer valid")]
    InvitationExpired,

    /// Runtime lacks a capability; the operation was skipped
    #[error("Unsupported capability: {capability}")]
    Unsupported { capability: String },

    /// No tracked session with this id
    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    /// Native stack failure
    #[error("Signaling stack error: {0}")]
    Stack(#[from] StackError),

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SipError {
    /// Create a configuration error
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a transport error
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(operation: impl Into<String>, phase: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            phase: phase.to_string(),
        }
    }

    /// Create an invalid target error
    pub fn invalid_target(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create an unsupported capability error
    pub fn unsupported(capability: impl Into<String>) -> Self {
        Self::Unsupported {
            capability: capability.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a caller could reasonably retry the same operation later
    ///
    /// The session layer never retries on its own; this only classifies.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SipError::Transport { .. } | SipError::RenegotiationFailed { .. } => true,
            SipError::RegistrationRejected { status, .. } => {
                matches!(status, Some(408) | Some(480) | Some(503) | Some(504))
            }
            SipError::Stack(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Short category label used in structured logs
    pub fn category(&self) -> &'static str {
        match self {
            SipError::InvalidConfiguration { .. } => "configuration",
            SipError::NotRegistered | SipError::InvalidState { .. } => "state",
            SipError::Transport { .. } | SipError::RegistrationRejected { .. } => "transport",
            SipError::RenegotiationFailed { .. } => "renegotiation",
            SipError::InvalidTarget { .. }
            | SipError::InvitationExpired
            | SipError::SessionNotFound { .. } => "target",
            SipError::Unsupported { .. } => "capability",
            SipError::Stack(_) => "stack",
            SipError::Internal { .. } => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(SipError::config("domain", "empty").category(), "configuration");
        assert_eq!(SipError::InvitationExpired.category(), "target");
        assert_eq!(
            SipError::RenegotiationFailed { reason: "488".into() }.category(),
            "renegotiation"
        );
    }

    #[test]
    fn test_recoverable_registration_statuses() {
        let busy = SipError::RegistrationRejected {
            status: Some(503),
            reason: "Service Unavailable".into(),
        };
        let forbidden = SipError::RegistrationRejected {
            status: Some(403),
            reason: "Forbidden".into(),
        };
        assert!(busy.is_recoverable());
        assert!(!forbidden.is_recoverable());
        assert!(!SipError::config("server", "bad url").is_recoverable());
    }

    #[test]
    fn test_display_mentions_invitation() {
        assert_eq!(SipError::InvitationExpired.to_string(), "Invitation no longer valid");
    }
}
