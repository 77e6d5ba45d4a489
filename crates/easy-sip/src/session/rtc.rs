//! Session adapter for emitter-model stacks
//!
//! RTC sessions start signaling on creation and carry native mute, hold,
//! refer and DTMF calls; the adapter translates their named events
//! (`accepted`, `confirmed`, `ended`, `failed`, `newDTMF`, `track`).

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
use crate::stack::rtc::{MuteOptions, Originator, RtcSession, RtcSessionEvent, TerminateOptions};
use crate::stack::{MediaConstraints, RemoteIdentity};
use crate::types::{Direction, DtmfTone, SessionId};

/// Status used when declining an unanswered inbound call
const DECLINE_STATUS: u16 = 603;

/// [`SessionHandle`] over a native [`RtcSession`]
#[derive(Debug)]
pub struct RtcSessionAdapter {
    core: Arc<SessionCore>,
    native: Arc<dyn RtcSession>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RtcSessionAdapter {
    pub(crate) fn new(
        native: Arc<dyn RtcSession>,
        video: bool,
        domain: Option<String>,
        media: MediaBindings,
    ) -> Arc<Self> {
        let direction = match native.originator() {
            Originator::Remote => Direction::Incoming,
            Originator::Local | Originator::System => Direction::Outgoing,
        };
        let core = Arc::new(SessionCore::new(
            direction,
            native.remote_identity(),
            video,
            domain,
            media,
        ));
        if direction == Direction::Outgoing {
            core.apply(PhaseEvent::Start);
            core.attach_local(native.local_stream());
        }
        if native.is_ended() {
            core.mark_terminated();
        } else if native.is_established() {
            core.mark_established();
        }
        let events = native.subscribe();
        let pump = tokio::spawn(pump_events(core.clone(), events));
        Arc::new(Self {
            core,
            native,
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Answer the wrapped inbound session
    pub(crate) async fn answer(&self, constraints: MediaConstraints) -> SipResult<()> {
        self.core.apply(PhaseEvent::Start);
        self.native.answer(constraints).await?;
        self.core.attach_local(self.native.local_stream());
        if self.native.is_established() {
            self.core.mark_established();
        }
        Ok(())
    }

    pub fn native(&self) -> &Arc<dyn RtcSession> {
        &self.native
    }

    async fn renegotiate(&self, hold: bool) -> SipResult<()> {
        let operation = if hold { "hold" } else { "unhold" };
        self.core.require_established(operation)?;
        let _guard = self.core.renegotiation().lock().await;
        self.core.require_established(operation)?;

        let result = if hold {
            self.native.hold().await
        } else {
            self.native.unhold().await
        };
        if let Err(e) = result {
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

impl Drop for RtcSessionAdapter {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

async fn pump_events(core: Arc<SessionCore>, mut events: broadcast::Receiver<RtcSessionEvent>) {
    loop {
        match events.recv().await {
            Ok(RtcSessionEvent::Progress) => debug!(session_id = %core.id(), "Remote ringing"),
            Ok(RtcSessionEvent::Accepted) | Ok(RtcSessionEvent::Confirmed) => core.mark_established(),
            Ok(RtcSessionEvent::Ended { originator, cause })
            | Ok(RtcSessionEvent::Failed { originator, cause }) => {
                debug!(session_id = %core.id(), ?originator, %cause, "Session ended");
                core.mark_terminated();
                break;
            }
            Ok(RtcSessionEvent::NewDtmf { originator, tone }) => {
                if originator == Originator::Remote {
                    core.dtmf_received(tone);
                }
            }
            Ok(RtcSessionEvent::Track(stream)) => core.attach_remote(stream),
            Ok(RtcSessionEvent::Hold { originator }) | Ok(RtcSessionEvent::Unhold { originator }) => {
                debug!(session_id = %core.id(), ?originator, "Hold state reported");
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(session_id = %core.id(), skipped, "Session event stream lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!(session_id = %core.id(), "Session event pump finished");
}

#[async_trait]
impl SessionHandle for RtcSessionAdapter {
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
        if phase.is_terminated() || self.native.is_ended() {
            debug!(session_id = %self.core.id(), "Terminate on ended session ignored");
            self.core.mark_terminated();
            return Ok(());
        }
        let options = match (phase, self.core.direction()) {
            (SessionPhase::Established { .. }, _) | (_, Direction::Outgoing) => TerminateOptions::default(),
            (_, Direction::Incoming) => TerminateOptions::reject(DECLINE_STATUS, "Decline"),
        };
        if let Err(e) = self.native.terminate(options).await {
            if !self.native.is_ended() {
                warn!(session_id = %self.core.id(), %phase, error = %e, "Terminate failed");
                return Err(e.into());
            }
        }
        self.core.mark_terminated();
        Ok(())
    }

    fn mute(&self) {
        self.native.mute(MuteOptions::audio());
        self.core.record_muted(MediaKind::Audio, true);
    }

    fn unmute(&self) {
        self.native.unmute(MuteOptions::audio());
        self.core.record_muted(MediaKind::Audio, false);
        if self.core.phase().is_on_hold() {
            self.core.hold_audio(true);
        }
    }

    fn mute_video(&self) {
        self.native.mute(MuteOptions::video());
        self.core.record_muted(MediaKind::Video, true);
    }

    fn unmute_video(&self) {
        self.native.unmute(MuteOptions::video());
        self.core.record_muted(MediaKind::Video, false);
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
        self.native.send_dtmf(tone).await?;
        debug!(session_id = %self.core.id(), tone = %tone, "DTMF sent");
        Ok(())
    }
}
