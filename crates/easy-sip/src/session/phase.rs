//! Per-session lifecycle

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle phase of one call session
///
/// ```text
/// Initial ──► Establishing ──► Established{on_hold} ──► Terminated
///    │              │                                      ▲
///    └──────────────┴──────────────────────────────────────┘
/// ```
///
/// `on_hold` only toggles inside `Established`; `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPhase {
    Initial,
    Establishing,
    Established { on_hold: bool },
    Terminated,
}

/// Something that happened to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// INVITE sent or accept started
    Start,
    /// Remote answer received or local accept completed
    Establish,
    Hold,
    Unhold,
    /// Cancel, reject, BYE or remote hangup
    Terminate,
}

impl SessionPhase {
    pub fn is_established(&self) -> bool {
        matches!(self, SessionPhase::Established { .. })
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, SessionPhase::Terminated)
    }

    pub fn is_on_hold(&self) -> bool {
        matches!(self, SessionPhase::Established { on_hold: true })
    }

    /// Next phase for `event`, or `None` when the event does not apply
    pub fn next(self, event: PhaseEvent) -> Option<SessionPhase> {
        use SessionPhase::*;
        match (self, event) {
            (Terminated, _) => None,
            (_, PhaseEvent::Terminate) => Some(Terminated),
            (Initial, PhaseEvent::Start) => Some(Establishing),
            (Initial | Establishing, PhaseEvent::Establish) => Some(Established { on_hold: false }),
            (Established { .. }, PhaseEvent::Hold) => Some(Established { on_hold: true }),
            (Established { .. }, PhaseEvent::Unhold) => Some(Established { on_hold: false }),
            _ => None,
        }
    }
}

impl Default for SessionPhase {
    fn default() -> Self {
        SessionPhase::Initial
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Initial => write!(f, "initial"),
            SessionPhase::Establishing => write!(f, "establishing"),
            SessionPhase::Established { on_hold: false } => write!(f, "established"),
            SessionPhase::Established { on_hold: true } => write!(f, "established (on hold)"),
            SessionPhase::Terminated => write!(f, "terminated"),
        }
    }
}
