//! Uniform session interface

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::phase::SessionPhase;
use crate::error::SipResult;
use crate::media::MediaBindings;
use crate::stack::RemoteIdentity;
use crate::types::{Direction, DtmfTone, SessionId};

/// Receives notifications from one session
///
/// Callbacks run on the session's event task and must not block. Events
/// raised before a delegate is installed are replayed on installation.
pub trait SessionDelegate: Send + Sync {
    /// Remote answer received or local accept completed
    fn on_established(&self) {}

    /// Session ended; called exactly once
    fn on_terminate(&self) {}

    /// One DTMF tone received from the peer
    fn on_dtmf(&self, _tone: DtmfTone) {}
}

/// Where a call is transferred to
#[derive(Clone)]
pub enum TransferTarget {
    /// New destination (URI, `user@host` or bare extension)
    Address(String),
    /// Current peer of another session (attended transfer)
    Session(Arc<dyn SessionHandle>),
}

impl fmt::Debug for TransferTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferTarget::Address(address) => f.debug_tuple("Address").field(address).finish(),
            TransferTarget::Session(session) => f.debug_tuple("Session").field(session.id()).finish(),
        }
    }
}

impl From<&str> for TransferTarget {
    fn from(address: &str) -> Self {
        TransferTarget::Address(address.to_string())
    }
}

/// One call session, independent of the signaling stack behind it
///
/// Mutating operations other than [`terminate`](SessionHandle::terminate)
/// need an established call and report
/// [`SipError::InvalidState`](crate::SipError::InvalidState) otherwise.
/// `terminate` is idempotent.
#[async_trait]
pub trait SessionHandle: Send + Sync + fmt::Debug {
    fn id(&self) -> &SessionId;

    fn direction(&self) -> Direction;

    fn remote_identity(&self) -> RemoteIdentity;

    /// URI of the current peer, used as REFER target by other sessions
    fn remote_target(&self) -> String;

    fn phase(&self) -> SessionPhase;

    /// Whether the session carries video
    fn has_video(&self) -> bool;

    /// Local audio muted through [`mute`](SessionHandle::mute)
    fn is_muted(&self) -> bool;

    /// Local video muted through [`mute_video`](SessionHandle::mute_video)
    fn is_video_muted(&self) -> bool;

    /// Install the delegate, replaying buffered events
    fn set_delegate(&self, delegate: Arc<dyn SessionDelegate>);

    /// Swap the bound media elements, re-attaching current streams
    fn bind_media(&self, media: MediaBindings);

    /// End the call (CANCEL, reject or BYE depending on state)
    async fn terminate(&self) -> SipResult<()>;

    fn mute(&self);

    fn unmute(&self);

    fn mute_video(&self);

    fn unmute_video(&self);

    async fn hold(&self) -> SipResult<()>;

    async fn unhold(&self) -> SipResult<()>;

    async fn transfer(&self, target: TransferTarget) -> SipResult<()>;

    /// Route remote audio to `device_id`; warns and succeeds when the bound
    /// element cannot select a sink
    async fn set_audio_output(&self, device_id: &str) -> SipResult<()>;

    async fn send_dtmf(&self, tone: DtmfTone) -> SipResult<()>;
}
