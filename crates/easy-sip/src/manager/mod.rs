//! Multi-session manager
//!
//! [`SessionManager`] keeps any number of calls alive at once, with at most
//! one of them active (carrying media) and every other one held. It owns a
//! [`SipClient`], installs its own delegates on it, and publishes a
//! [`ManagerSnapshot`] on a `watch` channel after every change so a UI can
//! render from a single consistent value.
//!
//! # Concurrency
//!
//! Compound operations (`call`, `answer`, `switch_session`, the toggles)
//! are serialized by an async operation lock. Delegate callbacks coming
//! from sessions and the provider only take the short synchronous state
//! lock, so they never wait on an operation in flight.
//!
//! # Examples
//!
//! ```rust
//! use rvoip_easy_sip::{CallOptions, ClientConfig, ConnectionState, Credentials, SessionManager};
//! use rvoip_easy_sip::stack::loopback::LoopbackStack;
//!
//! # tokio_test::block_on(async {
//! let stack = LoopbackStack::new();
//! let manager = SessionManager::builder(ClientConfig::new())
//!     .with_loopback(stack.clone())
//!     .build()
//!     .unwrap();
//!
//! let mut updates = manager.subscribe();
//! manager.register(Credentials::new("example.com", "1001", "secret")).await.unwrap();
//! updates.wait_for(|s| s.state == ConnectionState::Registered).await.unwrap();
//!
//! let id = manager.call(CallOptions::new("200")).await.unwrap();
//! assert_eq!(manager.snapshot().active_session_id, Some(id));
//! # })
//! ```

pub mod state;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_stream::Stream;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeEvent, EventBridge, LifecycleEvent, LogEntry};
use crate::client::SipClient;
use crate::config::{ClientConfig, PromotionPolicy};
use crate::error::{SipError, SipResult};
use crate::media::{AudioDevices, AudioOutputDevice};
use crate::provider::{
    InboundMessage, Invitation, Notification, ProviderKind, Referral, RegisterDelegate,
    RegisterRequest, SipProvider, SubscribeRequest, UserAgentDelegate,
};
use crate::session::{SessionDelegate, SessionHandle};
use crate::stack::dialog::DialogStack;
use crate::stack::loopback::LoopbackStack;
use crate::stack::rtc::RtcStack;
use crate::types::{
    AnswerOptions, CallOptions, ConnectionState, Credentials, DtmfTone, SessionId, SessionStatus,
};

pub use state::{DtmfHistory, IncomingCall, ManagedSession, ManagerSnapshot};

/// Builder for [`SessionManager`]
pub struct SessionManagerBuilder {
    config: ClientConfig,
    provider: Option<Arc<dyn SipProvider>>,
    dialog_stack: Option<Arc<dyn DialogStack>>,
    rtc_stack: Option<Arc<dyn RtcStack>>,
}

impl SessionManagerBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            provider: None,
            dialog_stack: None,
            rtc_stack: None,
        }
    }

    /// Drive this provider instead of building one per registration
    pub fn with_provider(mut self, provider: Arc<dyn SipProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_dialog_stack(mut self, stack: Arc<dyn DialogStack>) -> Self {
        self.dialog_stack = Some(stack);
        self
    }

    pub fn with_rtc_stack(mut self, stack: Arc<dyn RtcStack>) -> Self {
        self.rtc_stack = Some(stack);
        self
    }

    /// Serve both stack models from one in-process loopback stack
    pub fn with_loopback(self, stack: LoopbackStack) -> Self {
        let shared = Arc::new(stack);
        self.with_dialog_stack(shared.clone()).with_rtc_stack(shared)
    }

    pub fn build(self) -> SipResult<SessionManager> {
        self.config.validate()?;
        if self.provider.is_none() {
            let missing = match self.config.provider {
                ProviderKind::Dialog => self.dialog_stack.is_none(),
                ProviderKind::Rtc => self.rtc_stack.is_none(),
            };
            if missing {
                return Err(SipError::config(
                    "provider",
                    format!("no stack given for the {:?} provider", self.config.provider),
                ));
            }
        }

        let bridge = Arc::new(EventBridge::new(
            self.config.manager.log_capacity,
            self.config.manager.event_capacity,
        ));
        let (publisher, _) = watch::channel(ManagerSnapshot::default());
        Ok(SessionManager {
            shared: Arc::new(ManagerShared {
                config: self.config,
                provider: self.provider,
                dialog_stack: self.dialog_stack,
                rtc_stack: self.rtc_stack,
                client: RwLock::new(None),
                sessions: DashMap::new(),
                invitation: Mutex::new(None),
                state: Mutex::new(ManagerSnapshot::default()),
                publisher,
                op_lock: tokio::sync::Mutex::new(()),
                epoch: AtomicU64::new(0),
                bridge,
            }),
        })
    }
}

/// Orchestrates several concurrent calls over one registration
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<ManagerShared>,
}

impl SessionManager {
    pub fn builder(config: ClientConfig) -> SessionManagerBuilder {
        SessionManagerBuilder::new(config)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Register, replacing any previous registration
    ///
    /// Registration outcomes arrive asynchronously and move the connection
    /// state to `registered` or `error`. Malformed credentials fail here,
    /// after the state has moved to `error`.
    pub async fn register(&self, credentials: Credentials) -> SipResult<()> {
        self.shared.register(credentials).await
    }

    /// End every call and drop the registration
    pub async fn unregister(&self) -> SipResult<()> {
        let _op = self.shared.op_lock.lock().await;
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.shared.release_client().await;
        self.shared.update(|s| s.state = ConnectionState::Idle);
        self.shared.bridge.info("Unregistered");
        Ok(())
    }

    /// Place a call; every other call is put on hold
    pub async fn call(&self, options: CallOptions) -> SipResult<SessionId> {
        self.shared.call(options).await
    }

    /// Answer an inbound call; every other call is put on hold
    pub async fn answer(&self, invitation: &Invitation, options: AnswerOptions) -> SipResult<SessionId> {
        self.shared.answer(invitation, options).await
    }

    /// Decline the pending inbound call, if any
    pub async fn reject_incoming(&self) -> SipResult<()> {
        let pending = self.shared.invitation.lock().clone();
        let Some(invitation) = pending else {
            return Ok(());
        };
        self.shared.clear_invitation(invitation.id());
        match invitation.reject().await {
            Ok(()) => {
                self.shared
                    .bridge
                    .info(format!("Rejected call from {}", invitation.display_name()));
                Ok(())
            }
            Err(e) => {
                self.shared.bridge.error(format!("Failed to reject call: {}", e));
                Err(e)
            }
        }
    }

    /// Pending inbound call not yet answered or rejected
    pub fn incoming_invitation(&self) -> Option<Invitation> {
        self.shared.invitation.lock().clone()
    }

    /// Make `id` the active call
    ///
    /// The current call is held and the target resumed. Nothing happens when
    /// `id` is already active. A failed hold leaves everything as it was; a
    /// failed resume leaves the previous call held without rolling back.
    pub async fn switch_session(&self, id: &SessionId) -> SipResult<()> {
        self.shared.switch_session(id).await
    }

    /// Flip local audio mute on the active call, returning the new value
    pub async fn toggle_mute(&self) -> bool {
        let _op = self.shared.op_lock.lock().await;
        let Some((id, session)) = self.shared.active_entry() else {
            return self.snapshot().is_muted;
        };
        let muted = !session.is_muted();
        if muted {
            session.mute();
        } else {
            session.unmute();
        }
        self.shared.update(|s| {
            s.is_muted = muted;
            if let Some(entry) = s.session_mut(&id) {
                entry.muted = muted;
            }
        });
        self.shared
            .bridge
            .info(if muted { "Microphone muted" } else { "Microphone unmuted" });
        muted
    }

    /// Flip local video mute on the active call, returning the new value
    pub async fn toggle_mute_video(&self) -> bool {
        let _op = self.shared.op_lock.lock().await;
        let Some((id, session)) = self.shared.active_entry() else {
            return self.snapshot().is_muted_video;
        };
        let muted = !session.is_video_muted();
        if muted {
            session.mute_video();
        } else {
            session.unmute_video();
        }
        self.shared.update(|s| {
            s.is_muted_video = muted;
            if let Some(entry) = s.session_mut(&id) {
                entry.video_muted = muted;
            }
        });
        self.shared
            .bridge
            .info(if muted { "Camera muted" } else { "Camera unmuted" });
        muted
    }

    /// Hold or resume the active call, returning whether it is now held
    ///
    /// The hold flag and the session status only change when the peer
    /// accepted the renegotiation.
    pub async fn toggle_hold(&self) -> SipResult<bool> {
        let _op = self.shared.op_lock.lock().await;
        let Some((id, session)) = self.shared.active_entry() else {
            return Ok(false);
        };
        let hold = !session.phase().is_on_hold();
        let result = if hold { session.hold().await } else { session.unhold().await };
        if let Err(e) = result {
            let action = if hold { "hold" } else { "resume" };
            self.shared.bridge.error(format!("Failed to {} call: {}", action, e));
            return Err(e);
        }
        self.shared.update(|s| {
            s.is_on_hold = hold;
            if let Some(entry) = s.session_mut(&id) {
                entry.status = if hold { SessionStatus::OnHold } else { SessionStatus::Active };
            }
        });
        self.shared
            .bridge
            .info(if hold { "Call on hold" } else { "Call resumed" });
        Ok(hold)
    }

    /// Send one DTMF tone on the active call
    pub async fn send_dtmf(&self, tone: DtmfTone) -> SipResult<()> {
        let Some((_, session)) = self.shared.active_entry() else {
            return Ok(());
        };
        self.shared.bridge.info(format!("Sending DTMF: {}", tone));
        session.send_dtmf(tone).await.map_err(|e| {
            self.shared.bridge.error(format!("Failed to send DTMF: {}", e));
            e
        })
    }

    /// Hang up the active call
    pub async fn hangup(&self) -> SipResult<()> {
        match self.shared.active_entry() {
            Some((id, _)) => self.hangup_session(&id).await,
            None => Ok(()),
        }
    }

    /// Hang up one call; cleanup follows its termination event
    pub async fn hangup_session(&self, id: &SessionId) -> SipResult<()> {
        let session = self.session(id).ok_or_else(|| SipError::SessionNotFound { id: id.to_string() })?;
        session.terminate().await.map_err(|e| {
            self.shared.bridge.error(format!("Failed to hang up: {}", e));
            e
        })
    }

    /// Remember the output device and route the active call to it
    pub async fn set_audio_output_device(&self, device_id: &str) -> SipResult<()> {
        self.shared
            .update(|s| s.selected_output_device_id = device_id.to_string());
        let Some((_, session)) = self.shared.active_entry() else {
            return Ok(());
        };
        session.set_audio_output(device_id).await.map_err(|e| {
            self.shared
                .bridge
                .error(format!("Failed to switch audio output: {}", e));
            e
        })
    }

    /// Re-enumerate audio outputs into the snapshot
    pub async fn refresh_audio_devices(&self, devices: &dyn AudioDevices) -> SipResult<Vec<AudioOutputDevice>> {
        match devices.output_devices().await {
            Ok(outputs) => {
                debug!(count = outputs.len(), "Audio outputs enumerated");
                self.shared.update(|s| s.audio_outputs = outputs.clone());
                Ok(outputs)
            }
            Err(e) => {
                self.shared
                    .bridge
                    .error(format!("Failed to enumerate audio devices: {}", e));
                Err(e)
            }
        }
    }

    pub fn session(&self, id: &SessionId) -> Option<Arc<dyn SessionHandle>> {
        self.shared.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn active_session(&self) -> Option<Arc<dyn SessionHandle>> {
        self.shared.active_entry().map(|(_, session)| session)
    }

    /// Number of tracked calls
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Snapshot updates; the receiver starts at the current value
    pub fn subscribe(&self) -> watch::Receiver<ManagerSnapshot> {
        self.shared.publisher.subscribe()
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        self.shared.state.lock().clone()
    }

    pub fn bridge(&self) -> &Arc<EventBridge> {
        &self.shared.bridge
    }

    /// Log entries and lifecycle events from now on
    pub fn events(&self) -> impl Stream<Item = BridgeEvent> + Send + 'static {
        self.shared.bridge.stream()
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.shared.bridge.logs()
    }

    pub fn clear_logs(&self) {
        self.shared.bridge.clear_logs();
    }

    /// End every call, drop the registration and forget pending state
    pub async fn dispose(&self) {
        let _op = self.shared.op_lock.lock().await;
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.shared.release_client().await;
        self.shared.update(|s| {
            *s = ManagerSnapshot {
                audio_outputs: std::mem::take(&mut s.audio_outputs),
                selected_output_device_id: std::mem::take(&mut s.selected_output_device_id),
                ..ManagerSnapshot::default()
            };
        });
        debug!("Session manager disposed");
    }
}

struct ManagerShared {
    config: ClientConfig,
    provider: Option<Arc<dyn SipProvider>>,
    dialog_stack: Option<Arc<dyn DialogStack>>,
    rtc_stack: Option<Arc<dyn RtcStack>>,
    client: RwLock<Option<Arc<SipClient>>>,
    sessions: DashMap<SessionId, Arc<dyn SessionHandle>>,
    invitation: Mutex<Option<Invitation>>,
    state: Mutex<ManagerSnapshot>,
    publisher: watch::Sender<ManagerSnapshot>,
    op_lock: tokio::sync::Mutex<()>,
    /// Bumped per registration; delegates of older clients are ignored
    epoch: AtomicU64,
    bridge: Arc<EventBridge>,
}

impl ManagerShared {
    /// Apply `f` to the snapshot and publish the result as one update
    fn update<R>(&self, f: impl FnOnce(&mut ManagerSnapshot) -> R) -> R {
        let (result, state_change, active_change) = {
            let mut snapshot = self.state.lock();
            let state_before = snapshot.state;
            let active_before = snapshot.active_session_id.clone();
            let result = f(&mut snapshot);
            snapshot.call_active = !snapshot.sessions.is_empty();
            self.publisher.send_replace(snapshot.clone());
            let state_change = (snapshot.state != state_before).then_some(snapshot.state);
            let active_change =
                (snapshot.active_session_id != active_before).then(|| snapshot.active_session_id.clone());
            (result, state_change, active_change)
        };
        if let Some(state) = state_change {
            debug!(state = %state, "Connection state changed");
            self.bridge.emit(LifecycleEvent::StateChanged(state));
        }
        if let Some(active) = active_change {
            self.bridge.emit(LifecycleEvent::ActiveChanged(active));
        }
        result
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn client(&self) -> SipResult<Arc<SipClient>> {
        self.client.read().clone().ok_or(SipError::NotRegistered)
    }

    fn active_entry(&self) -> Option<(SessionId, Arc<dyn SessionHandle>)> {
        let id = self.state.lock().active_session_id.clone()?;
        let session = self.sessions.get(&id).map(|entry| entry.value().clone())?;
        Some((id, session))
    }

    // ===== REGISTRATION =====

    async fn register(self: &Arc<Self>, credentials: Credentials) -> SipResult<()> {
        let _op = self.op_lock.lock().await;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.release_client().await;
        self.update(|s| s.state = ConnectionState::Connecting);
        self.bridge
            .info(format!("Registering {}", credentials.address_of_record()));

        let client = match self.build_client(epoch) {
            Ok(client) => Arc::new(client),
            Err(e) => return Err(self.registration_failed(e)),
        };
        *self.client.write() = Some(client.clone());
        if let Err(e) = client.register(credentials).await {
            self.client.write().take();
            return Err(self.registration_failed(e));
        }
        Ok(())
    }

    fn registration_failed(&self, error: SipError) -> SipError {
        self.bridge.error(format!("Registration failed: {}", error));
        self.update(|s| s.state = ConnectionState::Error);
        error
    }

    fn build_client(self: &Arc<Self>, epoch: u64) -> SipResult<SipClient> {
        let mut builder = SipClient::builder(self.config.clone())
            .with_user_agent_delegate(Arc::new(ManagerUaDelegate {
                shared: Arc::downgrade(self),
                epoch,
            }))
            .with_register_delegate(Arc::new(ManagerRegisterDelegate {
                shared: Arc::downgrade(self),
                epoch,
            }))
            .with_log_sink(self.bridge.clone());
        if let Some(provider) = &self.provider {
            builder = builder.with_provider(provider.clone());
        }
        if let Some(stack) = &self.dialog_stack {
            builder = builder.with_dialog_stack(stack.clone());
        }
        if let Some(stack) = &self.rtc_stack {
            builder = builder.with_rtc_stack(stack.clone());
        }
        builder.build()
    }

    /// Terminate every call, forget the pending invitation, unregister
    async fn release_client(&self) {
        let sessions: Vec<Arc<dyn SessionHandle>> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        for session in sessions {
            if let Err(e) = session.terminate().await {
                warn!(session_id = %session.id(), error = %e, "Failed to terminate session");
            }
        }
        self.sessions.clear();
        let removed = self.update(|s| {
            s.active_session_id = None;
            s.reset_toggles();
            s.sessions.drain(..).map(|entry| entry.id).collect::<Vec<_>>()
        });
        for id in removed {
            self.bridge.emit(LifecycleEvent::SessionRemoved(id));
        }
        let pending = self.invitation.lock().take();
        if let Some(invitation) = pending {
            self.clear_incoming(invitation.id());
        }

        let client = self.client.write().take();
        if let Some(client) = client {
            if let Err(e) = client.unregister().await {
                self.bridge.error(format!("Failed to unregister: {}", e));
            }
        }
    }

    fn registration_accepted(&self, expires: u32) {
        self.bridge
            .info(format!("Registered (expires in {}s)", expires));
        self.update(|s| {
            if matches!(
                s.state,
                ConnectionState::Idle | ConnectionState::Connecting | ConnectionState::Error
            ) {
                s.state = ConnectionState::Registered;
            }
        });
    }

    fn connection_failed(&self, message: String) {
        self.bridge.error(message);
        self.update(|s| s.state = ConnectionState::Error);
    }

    // ===== INBOUND =====

    fn invitation_received(self: &Arc<Self>, invitation: Invitation) {
        let incoming = IncomingCall {
            invitation_id: invitation.id().to_string(),
            remote_user: invitation.remote_user().to_string(),
            display_name: invitation.display_name().to_string(),
            video: invitation.has_video(),
        };
        *self.invitation.lock() = Some(invitation.clone());
        self.update(|s| s.incoming = Some(incoming.clone()));
        self.bridge.info(format!(
            "Incoming {} call from {}",
            if incoming.video { "video" } else { "audio" },
            incoming.display_name
        ));
        self.bridge.emit(LifecycleEvent::IncomingCall {
            remote_user: incoming.remote_user,
            display_name: incoming.display_name,
            video: incoming.video,
        });

        let shared = Arc::downgrade(self);
        tokio::spawn(async move {
            invitation.terminated().await;
            if let Some(shared) = shared.upgrade() {
                if shared.clear_invitation(invitation.id()) {
                    shared.bridge.info("Incoming call cancelled");
                }
            }
        });
    }

    /// Forget the pending invitation if it is still `id`
    fn clear_invitation(&self, id: &str) -> bool {
        let cleared = {
            let mut slot = self.invitation.lock();
            if slot.as_ref().is_some_and(|pending| pending.id() == id) {
                slot.take();
                true
            } else {
                false
            }
        };
        if cleared {
            self.clear_incoming(id);
        }
        cleared
    }

    fn clear_incoming(&self, id: &str) {
        let cleared = self.update(|s| {
            if s.incoming.as_ref().is_some_and(|incoming| incoming.invitation_id == id) {
                s.incoming = None;
                true
            } else {
                false
            }
        });
        if cleared {
            self.bridge.emit(LifecycleEvent::IncomingCleared);
        }
    }

    // ===== CALLS =====

    async fn call(self: &Arc<Self>, options: CallOptions) -> SipResult<SessionId> {
        let _op = self.op_lock.lock().await;
        let client = self.client()?;
        let destination = options.destination.clone();
        let session = client.call(options).await.map_err(|e| {
            self.bridge
                .error(format!("Failed to call {}: {}", destination, e));
            e
        })?;
        self.bridge.info(format!("Calling {}", destination));
        Ok(self.admit(session, destination, SessionStatus::Calling).await)
    }

    async fn answer(self: &Arc<Self>, invitation: &Invitation, options: AnswerOptions) -> SipResult<SessionId> {
        let _op = self.op_lock.lock().await;
        let client = self.client()?;
        let session = match client.answer(invitation, options).await {
            Ok(session) => session,
            Err(e) => {
                self.bridge.error(format!("Failed to answer call: {}", e));
                if matches!(e, SipError::InvitationExpired) {
                    self.clear_invitation(invitation.id());
                }
                return Err(e);
            }
        };
        self.clear_invitation(invitation.id());
        self.bridge
            .info(format!("Answered call from {}", invitation.display_name()));
        Ok(self
            .admit(session, invitation.remote_user().to_string(), SessionStatus::Active)
            .await)
    }

    /// Track a new call as the active one, holding every other call
    async fn admit(self: &Arc<Self>, session: Arc<dyn SessionHandle>, remote_user: String, status: SessionStatus) -> SessionId {
        let id = session.id().clone();
        self.sessions.insert(id.clone(), session.clone());

        let others: Vec<Arc<dyn SessionHandle>> = self
            .sessions
            .iter()
            .filter(|entry| entry.key() != &id)
            .map(|entry| entry.value().clone())
            .collect();
        // Unanswered calls cannot be held yet; they are held once they connect
        let mut ringing = Vec::new();
        for other in others {
            let phase = other.phase();
            if phase.is_on_hold() || phase.is_terminated() {
                continue;
            }
            if !phase.is_established() {
                ringing.push(other.id().clone());
                continue;
            }
            if let Err(e) = other.hold().await {
                self.bridge
                    .error(format!("Failed to hold session {}: {}", other.id(), e));
            }
        }

        let entry = ManagedSession::new(
            id.clone(),
            remote_user,
            status,
            session.has_video(),
            session.direction(),
            self.config.manager.dtmf_history_limit,
        );
        self.update(|s| {
            for existing in s.sessions.iter_mut() {
                existing.status = if ringing.contains(&existing.id) {
                    SessionStatus::Calling
                } else {
                    SessionStatus::OnHold
                };
            }
            s.sessions.push(entry);
            s.active_session_id = Some(id.clone());
            s.state = if status == SessionStatus::Calling {
                ConnectionState::Calling
            } else {
                ConnectionState::InCall
            };
            s.reset_toggles();
        });
        self.bridge.emit(LifecycleEvent::SessionAdded(id.clone()));
        info!(session_id = %id, status = %status, "Session added");

        session.set_delegate(Arc::new(ManagedSessionDelegate {
            shared: Arc::downgrade(self),
            id: id.clone(),
        }));
        id
    }

    async fn switch_session(&self, id: &SessionId) -> SipResult<()> {
        let _op = self.op_lock.lock().await;
        let target = self
            .sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SipError::SessionNotFound { id: id.to_string() })?;
        let current = self.active_entry();
        if current.as_ref().is_some_and(|(current_id, _)| current_id == id) {
            return Ok(());
        }

        if let Some((current_id, session)) = current {
            let phase = session.phase();
            if phase.is_established() && !phase.is_on_hold() {
                if let Err(e) = session.hold().await {
                    self.bridge
                        .error(format!("Failed to hold session {}: {}", current_id, e));
                    return Err(e);
                }
            }
            let held = session.phase().is_on_hold();
            self.update(|s| {
                if let Some(entry) = s.session_mut(&current_id) {
                    entry.status = if held { SessionStatus::OnHold } else { SessionStatus::Calling };
                }
                s.is_on_hold = held;
            });
        }

        if target.phase().is_on_hold() {
            if let Err(e) = target.unhold().await {
                self.bridge
                    .error(format!("Failed to resume session {}: {}", id, e));
                return Err(e);
            }
        }

        let established = target.phase().is_established();
        let (muted, video_muted) = (target.is_muted(), target.is_video_muted());
        self.update(|s| {
            if let Some(entry) = s.session_mut(id) {
                entry.status = if established { SessionStatus::Active } else { SessionStatus::Calling };
                entry.muted = muted;
                entry.video_muted = video_muted;
            }
            s.active_session_id = Some(id.clone());
            s.derive_toggles();
        });
        self.bridge.info(format!("Switched to session {}", id));
        Ok(())
    }

    // ===== SESSION EVENTS =====

    fn session_established(self: &Arc<Self>, id: &SessionId) {
        let outcome = self.update(|s| {
            let active = s.active_session_id.as_ref() == Some(id);
            let entry = s.session_mut(id)?;
            if entry.status != SessionStatus::Calling {
                return None;
            }
            let remote = entry.remote_user.clone();
            if active {
                entry.status = SessionStatus::Active;
                s.state = ConnectionState::InCall;
            }
            Some((remote, active))
        });
        let Some((remote, active)) = outcome else {
            return;
        };
        self.bridge.info(format!("Call with {} established", remote));
        if !active {
            // Another call took over while this one was ringing
            let shared = self.clone();
            let id = id.clone();
            tokio::spawn(async move { shared.hold_background(id).await });
        }
    }

    /// Hold a call that connected while another call was active
    async fn hold_background(&self, id: SessionId) {
        let _op = self.op_lock.lock().await;
        if self.state.lock().active_session_id.as_ref() == Some(&id) {
            return;
        }
        let Some(session) = self.sessions.get(&id).map(|entry| entry.value().clone()) else {
            return;
        };
        let phase = session.phase();
        if !phase.is_established() || phase.is_on_hold() {
            return;
        }
        if let Err(e) = session.hold().await {
            self.bridge
                .error(format!("Failed to hold session {}: {}", id, e));
            return;
        }
        self.update(|s| {
            if let Some(entry) = s.session_mut(&id) {
                entry.status = SessionStatus::OnHold;
            }
        });
        debug!(session_id = %id, "Background call held");
    }

    fn session_terminated(self: &Arc<Self>, id: &SessionId) {
        self.sessions.remove(id);
        let outcome = self.update(|s| {
            let position = s.sessions.iter().position(|entry| &entry.id == id)?;
            let removed = s.sessions.remove(position);
            let was_active = s.active_session_id.as_ref() == Some(id);
            let mut promoted = None;
            if s.sessions.is_empty() {
                s.active_session_id = None;
                if matches!(s.state, ConnectionState::Calling | ConnectionState::InCall) {
                    s.state = ConnectionState::Registered;
                }
                s.reset_toggles();
            } else if was_active {
                let next = s.sessions[0].id.clone();
                s.active_session_id = Some(next.clone());
                s.derive_toggles();
                promoted = Some(next);
            }
            Some((removed, promoted))
        });
        let Some((removed, promoted)) = outcome else {
            return;
        };

        self.bridge
            .info(format!("Call with {} ended", removed.remote_user));
        self.bridge.emit(LifecycleEvent::SessionRemoved(id.clone()));

        if let Some(next) = promoted {
            debug!(session_id = %next, policy = ?self.config.manager.promotion_policy, "Session promoted");
            if self.config.manager.promotion_policy == PromotionPolicy::Resume {
                let shared = self.clone();
                tokio::spawn(async move { shared.resume_promoted(next).await });
            }
        }
    }

    async fn resume_promoted(&self, id: SessionId) {
        let _op = self.op_lock.lock().await;
        let Some((active_id, session)) = self.active_entry() else {
            return;
        };
        if active_id != id {
            return;
        }
        if session.phase().is_on_hold() {
            if let Err(e) = session.unhold().await {
                self.bridge
                    .error(format!("Failed to resume session {}: {}", id, e));
                return;
            }
        }
        let established = session.phase().is_established();
        self.update(|s| {
            if let Some(entry) = s.session_mut(&id) {
                entry.status = if established { SessionStatus::Active } else { SessionStatus::Calling };
            }
            s.derive_toggles();
        });
        self.bridge.info(format!("Resumed session {}", id));
    }

    fn dtmf_received(&self, id: &SessionId, tone: DtmfTone) {
        let recorded = self.update(|s| match s.session_mut(id) {
            Some(entry) => {
                entry.dtmf_history.push(tone);
                true
            }
            None => false,
        });
        if recorded {
            self.bridge.info(format!("DTMF received: {}", tone));
            self.bridge.emit(LifecycleEvent::DtmfReceived {
                session_id: id.clone(),
                tone,
            });
        }
    }
}

// ===== DELEGATES =====

struct ManagerUaDelegate {
    shared: Weak<ManagerShared>,
    epoch: u64,
}

impl ManagerUaDelegate {
    fn current(&self) -> Option<Arc<ManagerShared>> {
        self.shared.upgrade().filter(|shared| shared.is_current(self.epoch))
    }
}

impl UserAgentDelegate for ManagerUaDelegate {
    fn on_connect(&self) {
        if let Some(shared) = self.current() {
            shared.bridge.ws("Connected");
        }
    }

    fn on_disconnect(&self, error: Option<SipError>) {
        let Some(shared) = self.current() else {
            return;
        };
        match error {
            Some(e) => shared.connection_failed(format!("Disconnected: {}", e)),
            None => shared.bridge.ws("Disconnected"),
        }
    }

    fn on_invite(&self, invitation: Invitation) {
        if let Some(shared) = self.current() {
            shared.invitation_received(invitation);
        }
    }

    fn on_message(&self, message: InboundMessage) {
        if let Some(shared) = self.current() {
            shared
                .bridge
                .info(format!("Message from {}: {}", message.from, message.body));
        }
    }

    fn on_notify(&self, notification: Notification) {
        if let Some(shared) = self.current() {
            shared
                .bridge
                .info(format!("NOTIFY {}: {}", notification.event, notification.body));
        }
    }

    fn on_refer(&self, referral: Referral) {
        if let Some(shared) = self.current() {
            shared
                .bridge
                .info(format!("REFER to {}", referral.refer_to));
        }
    }

    fn on_register(&self, request: RegisterRequest) {
        if let Some(shared) = self.current() {
            shared
                .bridge
                .info(format!("REGISTER from {}", request.contact));
        }
    }

    fn on_subscribe(&self, request: SubscribeRequest) {
        if let Some(shared) = self.current() {
            shared
                .bridge
                .info(format!("SUBSCRIBE {} from {}", request.event, request.from));
        }
    }
}

struct ManagerRegisterDelegate {
    shared: Weak<ManagerShared>,
    epoch: u64,
}

impl ManagerRegisterDelegate {
    fn current(&self) -> Option<Arc<ManagerShared>> {
        self.shared.upgrade().filter(|shared| shared.is_current(self.epoch))
    }
}

impl RegisterDelegate for ManagerRegisterDelegate {
    fn on_accept(&self, expires: u32) {
        if let Some(shared) = self.current() {
            shared.registration_accepted(expires);
        }
    }

    fn on_reject(&self, error: SipError) {
        if let Some(shared) = self.current() {
            shared.connection_failed(format!("Registration rejected: {}", error));
        }
    }

    fn on_trying(&self) {
        if let Some(shared) = self.current() {
            shared.bridge.ws("Registration in progress");
        }
    }

    fn on_redirect(&self, contact: String) {
        if let Some(shared) = self.current() {
            shared.connection_failed(format!("Registration redirected to {}", contact));
        }
    }
}

struct ManagedSessionDelegate {
    shared: Weak<ManagerShared>,
    id: SessionId,
}

impl SessionDelegate for ManagedSessionDelegate {
    fn on_established(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.session_established(&self.id);
        }
    }

    fn on_terminate(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.session_terminated(&self.id);
        }
    }

    fn on_dtmf(&self, tone: DtmfTone) {
        if let Some(shared) = self.shared.upgrade() {
            shared.dtmf_received(&self.id, tone);
        }
    }
}
