//! Call sessions
//!
//! [`SessionHandle`] is the uniform interface every layer above works with.
//! Each supported stack model has one adapter mapping its native session
//! object onto it; both share the lifecycle in [`SessionPhase`].

mod shared;
pub mod dialog;
pub mod handle;
pub mod phase;
pub mod rtc;

pub use dialog::DialogSessionAdapter;
pub use handle::{SessionDelegate, SessionHandle, TransferTarget};
pub use phase::{PhaseEvent, SessionPhase};
pub use rtc::RtcSessionAdapter;
