//! Inbound call offers

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use super::ProviderId;
use crate::error::{SipError, SipResult};
use crate::session::{DialogSessionAdapter, RtcSessionAdapter, SessionHandle};
use crate::stack::dialog::{DialogEvent, DialogSession, DialogState};
use crate::stack::rtc::{RtcSession, RtcSessionEvent, TerminateOptions};
use crate::stack::{MediaConstraints, RemoteIdentity, StackError};
use crate::types::{AnswerOptions, Direction};

/// Native object behind an invitation
#[derive(Clone)]
pub enum NativeInvitation {
    Dialog(Arc<dyn DialogSession>),
    Rtc(Arc<dyn RtcSession>),
}

impl fmt::Debug for NativeInvitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeInvitation::Dialog(native) => f.debug_tuple("Dialog").field(native).finish(),
            NativeInvitation::Rtc(native) => f.debug_tuple("Rtc").field(native).finish(),
        }
    }
}

/// An inbound call that has not been accepted or rejected yet
///
/// Cheap to clone; every clone observes the same termination flag.
#[derive(Debug, Clone)]
pub struct Invitation {
    id: String,
    remote: RemoteIdentity,
    offers_video: bool,
    native: NativeInvitation,
    origin: ProviderId,
    domain: Option<String>,
    terminated: watch::Receiver<bool>,
}

impl Invitation {
    pub(crate) fn from_dialog(native: Arc<dyn DialogSession>, origin: ProviderId, domain: Option<String>) -> Self {
        let (tx, rx) = watch::channel(native.state() == DialogState::Terminated);
        let mut events = native.subscribe();
        let watched = native.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DialogEvent::StateChanged(DialogState::Terminated)) | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        if watched.state() == DialogState::Terminated {
                            break;
                        }
                    }
                }
            }
            let _ = tx.send(true);
        });
        Self {
            id: Uuid::new_v4().to_string(),
            remote: native.remote_identity(),
            offers_video: native.offered_media().video,
            native: NativeInvitation::Dialog(native),
            origin,
            domain,
            terminated: rx,
        }
    }

    pub(crate) fn from_rtc(native: Arc<dyn RtcSession>, origin: ProviderId, domain: Option<String>) -> Self {
        let (tx, rx) = watch::channel(native.is_ended());
        let mut events = native.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RtcSessionEvent::Ended { .. })
                    | Ok(RtcSessionEvent::Failed { .. })
                    | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
            let _ = tx.send(true);
        });
        Self {
            id: Uuid::new_v4().to_string(),
            remote: native.remote_identity(),
            offers_video: native.offered_media().video,
            native: NativeInvitation::Rtc(native),
            origin,
            domain,
            terminated: rx,
        }
    }

    /// Unique per received INVITE
    pub fn id(&self) -> &str {
        &self.id
    }

    /// User part of the caller's URI
    pub fn remote_user(&self) -> &str {
        &self.remote.user
    }

    /// Caller's display name, falling back to the user part
    pub fn display_name(&self) -> &str {
        self.remote.label()
    }

    pub fn remote_identity(&self) -> &RemoteIdentity {
        &self.remote
    }

    /// Whether the offer includes video
    pub fn has_video(&self) -> bool {
        self.offers_video
    }

    pub fn native(&self) -> &NativeInvitation {
        &self.native
    }

    pub(crate) fn origin(&self) -> ProviderId {
        self.origin
    }

    /// Cancelled by the caller, rejected, or ended after being answered
    pub fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    /// Resolves once the invitation has terminated
    pub async fn terminated(&self) {
        let mut rx = self.terminated.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Accept the call and wrap it in a session
    ///
    /// The session's video flag follows `options.video`, whatever the offer
    /// contained.
    pub async fn accept(&self, options: AnswerOptions) -> SipResult<Arc<dyn SessionHandle>> {
        if self.is_terminated() {
            return Err(SipError::InvitationExpired);
        }
        let constraints = MediaConstraints::with_video(options.video);
        let session: Arc<dyn SessionHandle> = match &self.native {
            NativeInvitation::Dialog(native) => {
                let adapter = DialogSessionAdapter::new(
                    native.clone(),
                    Direction::Incoming,
                    options.video,
                    self.domain.clone(),
                    options.media,
                );
                adapter
                    .accept(constraints)
                    .await
                    .map_err(|e| self.expired_or(e))?;
                adapter
            }
            NativeInvitation::Rtc(native) => {
                let adapter = RtcSessionAdapter::new(native.clone(), options.video, self.domain.clone(), options.media);
                adapter
                    .answer(constraints)
                    .await
                    .map_err(|e| self.expired_or(e))?;
                adapter
            }
        };
        info!(
            session_id = %session.id(),
            remote = %self.remote.uri,
            video = options.video,
            "Invitation accepted"
        );
        Ok(session)
    }

    /// Decline the call
    pub async fn reject(&self) -> SipResult<()> {
        if self.is_terminated() {
            return Err(SipError::InvitationExpired);
        }
        let result = match &self.native {
            NativeInvitation::Dialog(native) => native.reject().await,
            NativeInvitation::Rtc(native) => native.terminate(TerminateOptions::reject(603, "Decline")).await,
        };
        result.map_err(|e| self.expired_or(e.into()))?;
        debug!(remote = %self.remote.uri, "Invitation rejected");
        Ok(())
    }

    fn native_ended(&self) -> bool {
        match &self.native {
            NativeInvitation::Dialog(native) => native.state() == DialogState::Terminated,
            NativeInvitation::Rtc(native) => native.is_ended(),
        }
    }

    fn expired_or(&self, error: SipError) -> SipError {
        if self.native_ended() || matches!(error, SipError::Stack(StackError::Closed)) {
            SipError::InvitationExpired
        } else {
            error
        }
    }
}
