//! Session adapter for dialog-model stacks
//!
//! The native inviter/invitation reports explicit state changes; the
//! adapter maps them onto [`SessionPhase`] and handles mute itself by
//! flipping local tracks. Hold is a re-INVITE with hold modifiers.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::handle::{SessionDelegate, SessionHandle, TransferTarget};
use super::phase::{PhaseEvent, SessionPhase};
use super::shared::SessionCore;
use crate::error::{SipError, SipResult};
use crate::media::{MediaBindings, MediaKind};
use crate::stack::dialog::{DialogEvent, DialogSession, DialogState};
use crate::stack::{MediaConstraints, RemoteIdentity};
use crate::types::{Direction, DtmfTone, SessionId};

/// [`SessionHandle`] over a native [`DialogSession`]
#[derive(Debug)]
pub struct DialogSessionAdapter {
    core: Arc<SessionCore>,
    native: Arc<dyn DialogSession>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl DialogSessionAdapter {
    /// Wrap a native session; events are observed from this point on
    pub(crate) fn new(
        native: Arc<dyn DialogSession>,
        direction: Direction,
        video: bool,
        domain: Option<String>,
        media: MediaBindings,
    ) -> Arc<Self> {
        let core = Arc::new(SessionCore::new(
            direction,
            native.remote_identity(),
            video,
            domain,
            media,
        ));
        let events = native.subscribe();
        let pump = tokio::spawn(pump_events(core.clone(), events));
        Arc::new(Self {
            core,
            native,
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Send the initial INVITE
    pub(crate) async fn invite(&self) -> SipResult<()> {
        self.core.apply(PhaseEvent::Start);
        if let Err(e) = self.native.invite().await {
            warn!(session_id = %self.core.id(), error = %e, "INVITE failed");
            self.core.mark_terminated();
            return Err(e.into());
        }
        self.core.attach_local(self.native.local_stream());
        Ok(())
    }

    /// Accept the wrapped invitation
    pub(crate) async fn accept(&self, constraints: MediaConstraints) -> SipResult<()> {
        self.core.apply(PhaseEvent::Start);
        self.native.accept(constraints).await?;
        self.core.attach_local(self.native.local_stream());
        if self.native.state() == DialogState::Established {
            self.core.mark_established();
        }
        Ok(())
    }

    pub fn native(&self) -> &Arc<dyn DialogSession> {
        &self.native
    }

    async fn renegotiate(&self, hold: bool) -> SipResult<()> {
        let operation = if hold { "hold" } else { "unhold" };
        self.core.require_established(operation)?;
        let _guard = self.core.renegotiation().lock().await;
        self.core.require_established(operation)?;

        if let Err(e) = self.native.reinvite(hold).await {
            warn!(session_id = %self.core.id(), operation, error = %e, "Renegotiation rejected");
            return Err(SipError::RenegotiationFailed {
                reason: e.to_string(),
            });
        }
        self.core
            .apply(if hold { PhaseEvent::Hold } else { PhaseEvent::Unhold });
        self.core.hold_audio(hold);
        info!(session_id = %self.core.id(), operation, "Renegotiation complete");
        Ok(())
    }
}

impl Drop for DialogSessionAdapter {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

async fn pump_events(core: Arc<SessionCore>, mut events: broadcast::Receiver<DialogEvent>) {
    loop {
        match events.recv().await {
            Ok(DialogEvent::StateChanged(state)) => match state {
                DialogState::Initial | DialogState::Terminating => {}
                DialogState::Establishing => {
                    core.apply(PhaseEvent::Start);
                }
                DialogState::Established => core.mark_established(),
                DialogState::Terminated => {
                    core.mark_terminated();
                    break;
                }
            },
            Ok(DialogEvent::Info { tone }) => core.dtmf_received(tone),
            Ok(DialogEvent::TrackAdded(stream)) => core.attach_remote(stream),
            Err(RecvError::Lagged(skipped)) => {
                warn!(session_id = %core.id(), skipped, "Session event stream lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!(session_id = %core.id(), "Session event pump finished");
}

#[async_trait]
impl SessionHandle for DialogSessionAdapter {
    fn id(&self) -> &SessionId {
        self.core.id()
    }

    fn direction(&self) -> Direction {
        self.core.direction()
    }

    fn remote_identity(&self) -> RemoteIdentity {
        self.core.remote().clone()
    }

    fn remote_target(&self) -> String {
        self.core.remote().uri.clone()
    }

    fn phase(&self) -> SessionPhase {
        self.core.phase()
    }

    fn has_video(&self) -> bool {
        self.core.has_video()
    }

    fn is_muted(&self) -> bool {
        self.core.is_muted()
    }

    fn is_video_muted(&self) -> bool {
        self.core.is_video_muted()
    }

    fn set_delegate(&self, delegate: Arc<dyn SessionDelegate>) {
        self.core.set_delegate(delegate);
    }

    fn bind_media(&self, media: MediaBindings) {
        self.core.bind_media(media);
    }

    async fn terminate(&self) -> SipResult<()> {
        let phase = self.core.phase();
        let result = match phase {
            SessionPhase::Terminated => {
                debug!(session_id = %self.core.id(), "Terminate on ended session ignored");
                return Ok(());
            }
            SessionPhase::Established { .. } => self.native.bye().await,
            _ => match self.core.direction() {
                Direction::Outgoing => self.native.cancel().await,
                Direction::Incoming => self.native.reject().await,
            },
        };
        match result {
            Ok(()) => {}
            Err(_) if self.native.state() == DialogState::Terminated => {}
            Err(e) => {
                warn!(session_id = %self.core.id(), %phase, error = %e, "Terminate failed");
                return Err(e.into());
            }
        }
        self.core.mark_terminated();
        Ok(())
    }

    fn mute(&self) {
        self.core.set_muted(MediaKind::Audio, true);
    }

    fn unmute(&self) {
        self.core.set_muted(MediaKind::Audio, false);
        if self.core.phase().is_on_hold() {
            self.core.hold_audio(true);
        }
    }

    fn mute_video(&self) {
        self.core.set_muted(MediaKind::Video, true);
    }

    fn unmute_video(&self) {
        self.core.set_muted(MediaKind::Video, false);
    }

    async fn hold(&self) -> SipResult<()> {
        self.renegotiate(true).await
    }

    async fn unhold(&self) -> SipResult<()> {
        self.renegotiate(false).await
    }

    async fn transfer(&self, target: TransferTarget) -> SipResult<()> {
        self.core.require_established("transfer")?;
        let uri = self.core.transfer_uri(&target)?;
        self.native.refer(&uri).await?;
        info!(session_id = %self.core.id(), target = %uri, "Transfer requested");
        Ok(())
    }

    async fn set_audio_output(&self, device_id: &str) -> SipResult<()> {
        self.core.set_audio_output(device_id).await
    }

    async fn send_dtmf(&self, tone: DtmfTone) -> SipResult<()> {
        self.core.require_established("send DTMF")?;
        self.native.info_dtmf(tone).await?;
        debug!(session_id = %self.core.id(), tone = %tone, "DTMF sent");
        Ok(())
    }
}
