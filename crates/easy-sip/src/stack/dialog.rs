//! Dialog-model stack contract
//!
//! A user agent owns the transport and a registerer; calls are inviter
//! (outbound) or invitation (inbound) objects that report progress through
//! explicit [`DialogState`] transitions. Hold is a re-INVITE with hold
//! modifiers and DTMF travels as SIP INFO. Local tracks are exposed so the
//! adapter can mute them itself.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rvoip_sip_core::Uri;
use tokio::sync::{broadcast, mpsc};

use super::{MediaConstraints, RemoteIdentity, StackError, TraceLine, UserAgentOptions};
use crate::media::MediaStream;
use crate::types::DtmfTone;

/// Native lifecycle of one dialog-model session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialogState {
    Initial,
    Establishing,
    Established,
    Terminating,
    Terminated,
}

/// Events raised by a dialog-model user agent
#[derive(Debug, Clone)]
pub enum UserAgentEvent {
    /// Transport connected
    Connected,
    /// Transport closed, with the failure when it was not a clean stop
    Disconnected { error: Option<StackError> },
    /// Inbound INVITE
    Invite(Arc<dyn DialogSession>),
    /// Out-of-dialog MESSAGE
    Message { from: String, body: String },
    /// NOTIFY outside a subscription we own
    Notify { event: String, body: String },
    /// REFER received
    Refer { refer_to: String, referred_by: Option<String> },
    /// REGISTER received (stack acting as registrar)
    Register { contact: String },
    /// SUBSCRIBE received
    Subscribe { event: String, from: String },
    /// Raw trace line
    Trace(TraceLine),
}

/// Progress of one REGISTER transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterResponse {
    Trying,
    Accepted { expires: u32 },
    Rejected { status: u16, reason: String },
    Redirected { contact: String },
}

/// Events raised by a dialog-model session
#[derive(Debug, Clone)]
pub enum DialogEvent {
    StateChanged(DialogState),
    /// DTMF received through INFO
    Info { tone: DtmfTone },
    /// Remote media arrived on the peer connection
    TrackAdded(MediaStream),
}

/// Factory for dialog-model user agents
#[async_trait]
pub trait DialogStack: Send + Sync {
    async fn create_user_agent(
        &self,
        options: UserAgentOptions,
    ) -> Result<Arc<dyn DialogUserAgent>, StackError>;
}

/// One user agent: transport, registerer and call factory
#[async_trait]
pub trait DialogUserAgent: Send + Sync {
    /// Hand out the event receiver; `None` once taken
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<UserAgentEvent>>;

    /// Connect the transport
    async fn start(&self) -> Result<(), StackError>;

    /// Close the transport and every session still open
    async fn stop(&self) -> Result<(), StackError>;

    /// Send REGISTER; responses arrive on the returned channel
    async fn register(&self) -> Result<mpsc::UnboundedReceiver<RegisterResponse>, StackError>;

    /// Send REGISTER with Expires: 0
    async fn unregister(&self) -> Result<(), StackError>;

    /// Build an outbound session in [`DialogState::Initial`]
    fn inviter(
        &self,
        target: &Uri,
        constraints: MediaConstraints,
    ) -> Result<Arc<dyn DialogSession>, StackError>;
}

/// One inviter or invitation
#[async_trait]
pub trait DialogSession: Send + Sync + fmt::Debug {
    fn remote_identity(&self) -> RemoteIdentity;

    /// Media in the remote offer (inbound) or the local request (outbound)
    fn offered_media(&self) -> MediaConstraints;

    fn state(&self) -> DialogState;

    fn subscribe(&self) -> broadcast::Receiver<DialogEvent>;

    fn local_stream(&self) -> Option<MediaStream>;

    fn remote_stream(&self) -> Option<MediaStream>;

    /// Send the initial INVITE (inviter only)
    async fn invite(&self) -> Result<(), StackError>;

    /// Answer with 200 OK (invitation only)
    async fn accept(&self, constraints: MediaConstraints) -> Result<(), StackError>;

    /// Decline an unanswered invitation
    async fn reject(&self) -> Result<(), StackError>;

    /// CANCEL an unanswered inviter
    async fn cancel(&self) -> Result<(), StackError>;

    /// BYE an established session
    async fn bye(&self) -> Result<(), StackError>;

    /// re-INVITE with (`hold = true`) or without hold modifiers
    async fn reinvite(&self, hold: bool) -> Result<(), StackError>;

    async fn refer(&self, target: &Uri) -> Result<(), StackError>;

    async fn info_dtmf(&self, tone: DtmfTone) -> Result<(), StackError>;
}
