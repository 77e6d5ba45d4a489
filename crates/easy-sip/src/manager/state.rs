//! UI-facing manager state

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::media::AudioOutputDevice;
use crate::types::{ConnectionState, Direction, DtmfTone, SessionId, SessionStatus};

/// Last N DTMF tones of one session, oldest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtmfHistory {
    tones: VecDeque<DtmfTone>,
    limit: usize,
}

impl DtmfHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            tones: VecDeque::with_capacity(limit),
            limit: limit.max(1),
        }
    }

    /// Append, dropping the oldest tone beyond the limit
    pub fn push(&mut self, tone: DtmfTone) {
        while self.tones.len() >= self.limit {
            self.tones.pop_front();
        }
        self.tones.push_back(tone);
    }

    pub fn len(&self) -> usize {
        self.tones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tones.is_empty()
    }

    pub fn tones(&self) -> Vec<DtmfTone> {
        self.tones.iter().copied().collect()
    }

    /// Keypad characters, e.g. `"12#"`
    pub fn as_keys(&self) -> String {
        self.tones.iter().map(|t| t.to_char()).collect()
    }
}

/// One call as shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedSession {
    pub id: SessionId,
    /// Dialed destination (outbound) or caller user part (inbound)
    pub remote_user: String,
    pub status: SessionStatus,
    pub with_video: bool,
    pub direction: Direction,
    pub dtmf_history: DtmfHistory,
    /// Local audio muted while this session was active
    pub muted: bool,
    pub video_muted: bool,
}

impl ManagedSession {
    pub fn new(
        id: SessionId,
        remote_user: impl Into<String>,
        status: SessionStatus,
        with_video: bool,
        direction: Direction,
        dtmf_limit: usize,
    ) -> Self {
        Self {
            id,
            remote_user: remote_user.into(),
            status,
            with_video,
            direction,
            dtmf_history: DtmfHistory::new(dtmf_limit),
            muted: false,
            video_muted: false,
        }
    }
}

/// Pending inbound call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCall {
    pub invitation_id: String,
    pub remote_user: String,
    pub display_name: String,
    pub video: bool,
}

/// Everything a UI needs to render the manager
///
/// Published as a whole on every change, so observers never see a
/// half-applied update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerSnapshot {
    pub state: ConnectionState,
    /// Calls in creation order
    pub sessions: Vec<ManagedSession>,
    pub active_session_id: Option<SessionId>,
    pub incoming: Option<IncomingCall>,
    pub is_muted: bool,
    pub is_muted_video: bool,
    pub is_on_hold: bool,
    pub audio_outputs: Vec<AudioOutputDevice>,
    pub selected_output_device_id: String,
    /// At least one call exists
    pub call_active: bool,
}

impl Default for ManagerSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            sessions: Vec::new(),
            active_session_id: None,
            incoming: None,
            is_muted: false,
            is_muted_video: false,
            is_on_hold: false,
            audio_outputs: Vec::new(),
            selected_output_device_id: "default".to_string(),
            call_active: false,
        }
    }
}

impl ManagerSnapshot {
    pub fn session(&self, id: &SessionId) -> Option<&ManagedSession> {
        self.sessions.iter().find(|s| &s.id == id)
    }

    pub fn session_mut(&mut self, id: &SessionId) -> Option<&mut ManagedSession> {
        self.sessions.iter_mut().find(|s| &s.id == id)
    }

    pub fn active(&self) -> Option<&ManagedSession> {
        self.active_session_id.as_ref().and_then(|id| self.session(id))
    }

    pub fn status_of(&self, id: &SessionId) -> Option<SessionStatus> {
        self.session(id).map(|s| s.status)
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Active)
            .count()
    }

    /// Reset the per-manager toggles
    pub(crate) fn reset_toggles(&mut self) {
        self.is_muted = false;
        self.is_muted_video = false;
        self.is_on_hold = false;
    }

    /// Toggles follow the active session's own flags
    pub(crate) fn derive_toggles(&mut self) {
        let (muted, video_muted, on_hold) = match self.active() {
            Some(active) => (active.muted, active.video_muted, active.status == SessionStatus::OnHold),
            None => (false, false, false),
        };
        self.is_muted = muted;
        self.is_muted_video = video_muted;
        self.is_on_hold = on_hold;
    }
}
