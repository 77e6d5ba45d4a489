//! Native signaling stack contracts
//!
//! The session layer drives a signaling stack through one of two narrow
//! contracts, each modelled on a different native object model:
//!
//! - [`dialog`] - user agent + registerer, inviter/invitation objects with
//!   explicit state-change events; the adapter manipulates local tracks itself
//! - [`rtc`] - an event-emitting user agent whose RTC sessions expose native
//!   mute/hold/refer/DTMF calls and report progress as named events
//!
//! Message grammar, transactions and SDP negotiation stay inside the stack.
//! [`loopback`] implements both contracts in-process.

pub mod dialog;
pub mod loopback;
pub mod rtc;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Trace category for raw transport send/receive lines
pub const CATEGORY_TRANSPORT: &str = "sip.Transport";
/// Trace category for user agent lifecycle lines
pub const CATEGORY_USER_AGENT: &str = "sip.UserAgent";
/// Trace category for registerer lines
pub const CATEGORY_REGISTERER: &str = "sip.Registerer";

/// Errors reported by a native stack
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackError {
    /// Peer or registrar answered with a final failure response
    #[error("rejected with {status} {reason}")]
    Rejected { status: u16, reason: String },

    /// Socket level failure
    #[error("transport failure: {0}")]
    Transport(String),

    /// Request not allowed in the native object's current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Malformed request target
    #[error("invalid uri: {0}")]
    InvalidUri(String),

    /// Native object already closed
    #[error("closed")]
    Closed,
}

impl StackError {
    pub fn rejected(status: u16, reason: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            reason: reason.into(),
        }
    }

    /// Timeouts, unavailability and transport drops
    pub fn is_transient(&self) -> bool {
        match self {
            StackError::Transport(_) => true,
            StackError::Rejected { status, .. } => matches!(status, 408 | 480 | 491 | 503 | 504),
            _ => false,
        }
    }
}

/// Severity of a raw trace line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    Debug,
    Log,
    Warn,
    Error,
}

impl fmt::Display for TraceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TraceLevel::Debug => "debug",
            TraceLevel::Log => "log",
            TraceLevel::Warn => "warn",
            TraceLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// One raw signaling trace line, forwarded verbatim to the log sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceLine {
    pub level: TraceLevel,
    pub category: String,
    pub label: String,
    pub content: String,
}

impl TraceLine {
    pub fn new(
        level: TraceLevel,
        category: impl Into<String>,
        label: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            level,
            category: category.into(),
            label: label.into(),
            content: content.into(),
        }
    }
}

/// Media requested for a call or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn with_video(video: bool) -> Self {
        Self { audio: true, video }
    }
}

/// Identity of the remote party of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIdentity {
    /// User part of the remote URI
    pub user: String,
    /// Display name, when the peer sent one
    pub display_name: Option<String>,
    /// Full remote URI
    pub uri: String,
}

impl RemoteIdentity {
    /// Display name, falling back to the user part
    pub fn label(&self) -> &str {
        match self.display_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.user,
        }
    }
}

/// Stack-independent registration parameters handed to a native user agent
#[derive(Debug, Clone)]
pub struct UserAgentOptions {
    /// Address of record
    pub uri: String,
    pub display_name: String,
    pub auth_username: String,
    pub auth_password: String,
    /// WebSocket server, when the stack needs one
    pub server: Option<String>,
    pub user_agent: String,
    /// REGISTER expiry in seconds
    pub register_expires: u32,
    /// Extra headers added to REGISTER
    pub extra_headers: Vec<String>,
    /// Emit raw transport trace lines
    pub trace_sip: bool,
}
