//! State shared by every session adapter
//!
//! Both adapters embed a [`SessionCore`]: it owns the phase, the delegate
//! slot (with buffering for events raised before a delegate exists), the
//! media bindings and the renegotiation lock. Native-specific code only
//! decides *when* to call into it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rvoip_sip_core::Uri;
use tracing::{debug, info, warn};

use super::handle::{SessionDelegate, TransferTarget};
use super::phase::{PhaseEvent, SessionPhase};
use crate::error::{SipError, SipResult};
use crate::media::{MediaBindings, MediaKind, MediaStream};
use crate::stack::RemoteIdentity;
use crate::types::{normalize_target, Direction, DtmfTone, SessionId};

#[derive(Debug, Clone, Copy)]
enum CoreEvent {
    Established,
    Terminated,
    Dtmf(DtmfTone),
}

#[derive(Default)]
struct DelegateSlot {
    delegate: Option<Arc<dyn SessionDelegate>>,
    pending: Vec<CoreEvent>,
}

#[derive(Default)]
struct MediaState {
    bindings: MediaBindings,
    local: Option<MediaStream>,
    remote: Option<MediaStream>,
}

pub(crate) struct SessionCore {
    id: SessionId,
    direction: Direction,
    remote: RemoteIdentity,
    video: bool,
    domain: Option<String>,
    phase: Mutex<SessionPhase>,
    terminate_notified: AtomicBool,
    delegate: Mutex<DelegateSlot>,
    media: Mutex<MediaState>,
    muted: AtomicBool,
    video_muted: AtomicBool,
    renegotiation: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCore")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("remote", &self.remote.uri)
            .field("phase", &*self.phase.lock())
            .finish()
    }
}

impl SessionCore {
    pub(crate) fn new(
        direction: Direction,
        remote: RemoteIdentity,
        video: bool,
        domain: Option<String>,
        media: MediaBindings,
    ) -> Self {
        Self {
            id: SessionId::new(),
            direction,
            remote,
            video,
            domain,
            phase: Mutex::new(SessionPhase::Initial),
            terminate_notified: AtomicBool::new(false),
            delegate: Mutex::new(DelegateSlot::default()),
            media: Mutex::new(MediaState {
                bindings: media,
                ..Default::default()
            }),
            muted: AtomicBool::new(false),
            video_muted: AtomicBool::new(false),
            renegotiation: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn id(&self) -> &SessionId {
        &self.id
    }

    pub(crate) fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn remote(&self) -> &RemoteIdentity {
        &self.remote
    }

    pub(crate) fn has_video(&self) -> bool {
        self.video
    }

    pub(crate) fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    pub(crate) fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub(crate) fn is_video_muted(&self) -> bool {
        self.video_muted.load(Ordering::SeqCst)
    }

    /// Apply `event`, returning whether the phase changed
    pub(crate) fn apply(&self, event: PhaseEvent) -> bool {
        let mut phase = self.phase.lock();
        match phase.next(event) {
            Some(next) => {
                debug!(session_id = %self.id, from = %*phase, to = %next, "Session phase change");
                *phase = next;
                true
            }
            None => false,
        }
    }

    pub(crate) fn require_established(&self, operation: &str) -> SipResult<()> {
        let phase = self.phase();
        if phase.is_established() {
            Ok(())
        } else {
            debug!(session_id = %self.id, operation, %phase, "Operation needs an established call");
            Err(SipError::invalid_state(operation, phase))
        }
    }

    // ===== EVENTS =====

    pub(crate) fn mark_established(&self) {
        if self.apply(PhaseEvent::Establish) {
            info!(session_id = %self.id, remote = %self.remote.uri, "Session established");
            self.dispatch(CoreEvent::Established);
        }
    }

    /// Move to `Terminated`; the delegate hears about it once
    pub(crate) fn mark_terminated(&self) {
        self.apply(PhaseEvent::Terminate);
        if !self.terminate_notified.swap(true, Ordering::SeqCst) {
            info!(session_id = %self.id, remote = %self.remote.uri, "Session terminated");
            self.dispatch(CoreEvent::Terminated);
        }
    }

    pub(crate) fn dtmf_received(&self, tone: DtmfTone) {
        debug!(session_id = %self.id, tone = %tone, "DTMF received");
        self.dispatch(CoreEvent::Dtmf(tone));
    }

    pub(crate) fn set_delegate(&self, delegate: Arc<dyn SessionDelegate>) {
        let pending = {
            let mut slot = self.delegate.lock();
            slot.delegate = Some(delegate.clone());
            std::mem::take(&mut slot.pending)
        };
        for event in pending {
            deliver(delegate.as_ref(), event);
        }
    }

    fn dispatch(&self, event: CoreEvent) {
        let delegate = {
            let mut slot = self.delegate.lock();
            match slot.delegate.clone() {
                Some(delegate) => delegate,
                None => {
                    slot.pending.push(event);
                    return;
                }
            }
        };
        deliver(delegate.as_ref(), event);
    }

    // ===== MEDIA =====

    pub(crate) fn bind_media(&self, bindings: MediaBindings) {
        let mut media = self.media.lock();
        if let (Some(element), Some(stream)) = (bindings.remote.as_ref(), media.remote.as_ref()) {
            element.attach(stream);
        }
        if self.video {
            if let (Some(element), Some(stream)) = (bindings.local.as_ref(), media.local.as_ref()) {
                element.attach(stream);
            }
        }
        media.bindings = bindings;
    }

    pub(crate) fn attach_remote(&self, stream: MediaStream) {
        let mut media = self.media.lock();
        if let Some(element) = media.bindings.remote.as_ref() {
            element.attach(&stream);
        }
        media.remote = Some(stream);
    }

    /// Record the local stream; video sessions also preview it
    pub(crate) fn attach_local(&self, stream: Option<MediaStream>) {
        let Some(stream) = stream else { return };
        let mut media = self.media.lock();
        if self.video {
            if let Some(element) = media.bindings.local.as_ref() {
                element.attach(&stream);
            }
        }
        if self.is_muted() {
            stream.set_enabled(MediaKind::Audio, false);
        }
        if self.is_video_muted() {
            stream.set_enabled(MediaKind::Video, false);
        }
        media.local = Some(stream);
    }

    pub(crate) fn local_stream(&self) -> Option<MediaStream> {
        self.media.lock().local.clone()
    }

    /// Flip the user-facing mute flag and the local tracks of `kind`
    pub(crate) fn set_muted(&self, kind: MediaKind, muted: bool) {
        match kind {
            MediaKind::Audio => self.muted.store(muted, Ordering::SeqCst),
            MediaKind::Video => self.video_muted.store(muted, Ordering::SeqCst),
        }
        match self.local_stream() {
            Some(stream) => {
                stream.set_enabled(kind, !muted);
            }
            None => debug!(session_id = %self.id, ?kind, "No local stream to (un)mute"),
        }
    }

    /// Only record the mute flag (stack mutes natively)
    pub(crate) fn record_muted(&self, kind: MediaKind, muted: bool) {
        match kind {
            MediaKind::Audio => self.muted.store(muted, Ordering::SeqCst),
            MediaKind::Video => self.video_muted.store(muted, Ordering::SeqCst),
        }
    }

    /// Disable local audio while held; restore it on resume unless muted
    pub(crate) fn hold_audio(&self, held: bool) {
        if let Some(stream) = self.local_stream() {
            stream.set_enabled(MediaKind::Audio, !held && !self.is_muted());
        }
    }

    pub(crate) async fn set_audio_output(&self, device_id: &str) -> SipResult<()> {
        let element = self.media.lock().bindings.remote.clone();
        let Some(element) = element else {
            debug!(session_id = %self.id, device_id, "No remote element bound; output unchanged");
            return Ok(());
        };
        if !element.supports_sink_selection() {
            warn!(session_id = %self.id, device_id, "Audio output selection not supported by this element");
            return Ok(());
        }
        match element.set_sink_id(device_id).await {
            Ok(()) => {
                info!(session_id = %self.id, device_id, "Audio output changed");
                Ok(())
            }
            Err(SipError::Unsupported { capability }) => {
                warn!(session_id = %self.id, device_id, %capability, "Audio output selection not supported");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ===== SIGNALING HELPERS =====

    pub(crate) fn renegotiation(&self) -> &tokio::sync::Mutex<()> {
        &self.renegotiation
    }

    /// REFER target for `target`
    pub(crate) fn transfer_uri(&self, target: &TransferTarget) -> SipResult<Uri> {
        match target {
            TransferTarget::Address(address) => normalize_target(address, self.domain.as_deref()),
            TransferTarget::Session(other) => {
                if other.id() == &self.id {
                    return Err(SipError::invalid_target(
                        other.id().as_str(),
                        "cannot transfer a session to itself",
                    ));
                }
                let uri = other.remote_target();
                uri.parse::<Uri>()
                    .map_err(|e| SipError::invalid_target(uri.clone(), e.to_string()))
            }
        }
    }
}

fn deliver(delegate: &dyn SessionDelegate, event: CoreEvent) {
    match event {
        CoreEvent::Established => delegate.on_established(),
        CoreEvent::Terminated => delegate.on_terminate(),
        CoreEvent::Dtmf(tone) => delegate.on_dtmf(tone),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        established: AtomicUsize,
        terminated: AtomicUsize,
        tones: Mutex<Vec<DtmfTone>>,
    }

    impl SessionDelegate for Counting {
        fn on_established(&self) {
            self.established.fetch_add(1, Ordering::SeqCst);
        }

        fn on_terminate(&self) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }

        fn on_dtmf(&self, tone: DtmfTone) {
            self.tones.lock().push(tone);
        }
    }

    fn core() -> SessionCore {
        let remote = RemoteIdentity {
            user: "200".into(),
            display_name: None,
            uri: "sip:200@example.com".into(),
        };
        SessionCore::new(
            Direction::Outgoing,
            remote,
            false,
            Some("example.com".into()),
            MediaBindings::default(),
        )
    }

    #[test]
    fn test_events_before_delegate_are_replayed() {
        let core = core();
        core.apply(PhaseEvent::Start);
        core.mark_established();
        core.dtmf_received(DtmfTone::Digit5);

        let delegate = Arc::new(Counting::default());
        core.set_delegate(delegate.clone());
        assert_eq!(delegate.established.load(Ordering::SeqCst), 1);
        assert_eq!(*delegate.tones.lock(), vec![DtmfTone::Digit5]);

        core.dtmf_received(DtmfTone::Star);
        assert_eq!(delegate.tones.lock().len(), 2);
    }

    #[test]
    fn test_terminate_notifies_once() {
        let core = core();
        let delegate = Arc::new(Counting::default());
        core.set_delegate(delegate.clone());
        core.mark_terminated();
        core.mark_terminated();
        assert_eq!(delegate.terminated.load(Ordering::SeqCst), 1);
        assert!(core.phase().is_terminated());
        assert!(core.require_established("hold").is_err());
    }

    #[test]
    fn test_mute_survives_late_local_stream() {
        let core = core();
        core.set_muted(MediaKind::Audio, true);
        let stream = MediaStream::capture(false);
        core.attach_local(Some(stream.clone()));
        assert!(!stream.all_enabled(MediaKind::Audio));

        core.hold_audio(false);
        assert!(!stream.all_enabled(MediaKind::Audio));
        core.set_muted(MediaKind::Audio, false);
        assert!(stream.all_enabled(MediaKind::Audio));
    }

    #[test]
    fn test_transfer_uri_uses_session_domain() {
        let core = core();
        let uri = core.transfer_uri(&TransferTarget::from("300")).unwrap();
        assert_eq!(uri.user.as_deref(), Some("300"));
        assert!(core.transfer_uri(&TransferTarget::from("not valid")).is_err());
    }
}
