//! In-process loopback stack
//!
//! Implements both native contracts without a network: REGISTER is answered
//! according to a configurable [`LoopbackBehavior`], outbound calls wait for
//! the test (or demo) to play the remote party through the `remote_*`
//! controls on [`LoopbackCall`], and every native request is recorded so
//! callers can assert on exactly what the session layer asked for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rvoip_sip_core::Uri;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

use super::dialog::{
    DialogEvent, DialogSession, DialogStack, DialogState, DialogUserAgent, RegisterResponse,
    UserAgentEvent,
};
use super::rtc::{
    MuteOptions, Originator, RtcSession, RtcSessionEvent, RtcStack, RtcUaEvent, RtcUserAgent,
    TerminateOptions,
};
use super::{
    MediaConstraints, RemoteIdentity, StackError, TraceLevel, TraceLine, UserAgentOptions,
    CATEGORY_REGISTERER, CATEGORY_TRANSPORT, CATEGORY_USER_AGENT,
};
use crate::error::{SipError, SipResult};
use crate::media::{AudioDevices, AudioOutputDevice, MediaElement, MediaKind, MediaStream};
use crate::types::DtmfTone;

const EVENT_CAPACITY: usize = 64;

/// How the loopback registrar answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationBehavior {
    Accept,
    Reject { status: u16, reason: String },
    Redirect { contact: String },
}

/// Scripted behavior for user agents created by a [`LoopbackStack`]
#[derive(Debug, Clone)]
pub struct LoopbackBehavior {
    pub registration: RegistrationBehavior,
    /// Transport connect fails
    pub fail_connect: bool,
    pub expires: u32,
}

impl Default for LoopbackBehavior {
    fn default() -> Self {
        Self {
            registration: RegistrationBehavior::Accept,
            fail_connect: false,
            expires: 3600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Dialog,
    Rtc,
}

/// Stack factory implementing both [`DialogStack`] and [`RtcStack`]
#[derive(Debug, Clone, Default)]
pub struct LoopbackStack {
    shared: Arc<StackShared>,
}

#[derive(Debug, Default)]
struct StackShared {
    behavior: Mutex<LoopbackBehavior>,
    agents: Mutex<Vec<Arc<LoopbackUserAgent>>>,
}

impl LoopbackStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: LoopbackBehavior) -> Self {
        let stack = Self::default();
        stack.set_behavior(behavior);
        stack
    }

    /// Behavior applied to user agents created from now on
    pub fn set_behavior(&self, behavior: LoopbackBehavior) {
        *self.shared.behavior.lock() = behavior;
    }

    /// Every user agent created so far, oldest first
    pub fn user_agents(&self) -> Vec<Arc<LoopbackUserAgent>> {
        self.shared.agents.lock().clone()
    }

    /// Most recently created user agent
    pub fn current(&self) -> Option<Arc<LoopbackUserAgent>> {
        self.shared.agents.lock().last().cloned()
    }

    /// Deliver an inbound call to the current user agent
    pub fn incoming_call(
        &self,
        user: &str,
        display_name: Option<&str>,
        video: bool,
    ) -> Option<Arc<LoopbackCall>> {
        self.current()
            .map(|ua| ua.incoming_call(user, display_name, video))
    }

    fn create(&self, flavor: Flavor, options: UserAgentOptions) -> Arc<LoopbackUserAgent> {
        let behavior = self.shared.behavior.lock().clone();
        let ua = Arc::new(LoopbackUserAgent::new(flavor, options, behavior));
        self.shared.agents.lock().push(ua.clone());
        ua
    }
}

#[async_trait]
impl DialogStack for LoopbackStack {
    async fn create_user_agent(
        &self,
        options: UserAgentOptions,
    ) -> Result<Arc<dyn DialogUserAgent>, StackError> {
        Ok(self.create(Flavor::Dialog, options))
    }
}

#[async_trait]
impl RtcStack for LoopbackStack {
    async fn create_ua(&self, options: UserAgentOptions) -> Result<Arc<dyn RtcUserAgent>, StackError> {
        Ok(self.create(Flavor::Rtc, options))
    }
}

#[derive(Debug)]
enum UaChannel {
    Dialog {
        tx: mpsc::UnboundedSender<UserAgentEvent>,
        rx: Mutex<Option<mpsc::UnboundedReceiver<UserAgentEvent>>>,
    },
    Rtc {
        tx: mpsc::UnboundedSender<RtcUaEvent>,
        rx: Mutex<Option<mpsc::UnboundedReceiver<RtcUaEvent>>>,
    },
}

/// Loopback user agent
#[derive(Debug)]
pub struct LoopbackUserAgent {
    flavor: Flavor,
    options: UserAgentOptions,
    behavior: LoopbackBehavior,
    channel: UaChannel,
    started: AtomicBool,
    registered: AtomicBool,
    stopped: AtomicBool,
    calls: Mutex<Vec<Arc<LoopbackCall>>>,
}

impl LoopbackUserAgent {
    fn new(flavor: Flavor, options: UserAgentOptions, behavior: LoopbackBehavior) -> Self {
        let channel = match flavor {
            Flavor::Dialog => {
                let (tx, rx) = mpsc::unbounded_channel();
                UaChannel::Dialog {
                    tx,
                    rx: Mutex::new(Some(rx)),
                }
            }
            Flavor::Rtc => {
                let (tx, rx) = mpsc::unbounded_channel();
                UaChannel::Rtc {
                    tx,
                    rx: Mutex::new(Some(rx)),
                }
            }
        };
        Self {
            flavor,
            options,
            behavior,
            channel,
            started: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Options the session layer configured this agent with
    pub fn options(&self) -> &UserAgentOptions {
        &self.options
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Every call created on this agent, oldest first
    pub fn calls(&self) -> Vec<Arc<LoopbackCall>> {
        self.calls.lock().clone()
    }

    pub fn last_call(&self) -> Option<Arc<LoopbackCall>> {
        self.calls.lock().last().cloned()
    }

    /// Play an inbound INVITE from `user`
    pub fn incoming_call(&self, user: &str, display_name: Option<&str>, video: bool) -> Arc<LoopbackCall> {
        let domain = self
            .options
            .uri
            .rsplit('@')
            .next()
            .unwrap_or("localhost")
            .to_string();
        let remote = RemoteIdentity {
            user: user.to_string(),
            display_name: display_name.map(str::to_string),
            uri: format!("sip:{}@{}", user, domain),
        };
        let call = Arc::new(LoopbackCall::new(
            self.flavor,
            Originator::Remote,
            remote,
            MediaConstraints::with_video(video),
        ));
        self.calls.lock().push(call.clone());
        self.trace(
            TraceLevel::Log,
            CATEGORY_TRANSPORT,
            format!("Received WebSocket text message:\n\nINVITE sip:{} SIP/2.0", self.options.uri),
        );
        match &self.channel {
            UaChannel::Dialog { tx, .. } => {
                let _ = tx.send(UserAgentEvent::Invite(call.clone()));
            }
            UaChannel::Rtc { tx, .. } => {
                let _ = tx.send(RtcUaEvent::NewRtcSession {
                    session: call.clone(),
                    originator: Originator::Remote,
                });
            }
        }
        call
    }

    /// Drop the transport as if the server went away
    pub fn drop_transport(&self, reason: &str) {
        self.registered.store(false, Ordering::SeqCst);
        self.emit_disconnected(Some(StackError::Transport(reason.to_string())));
    }

    /// Deliver an out-of-dialog MESSAGE
    pub fn incoming_message(&self, from: &str, body: &str) {
        match &self.channel {
            UaChannel::Dialog { tx, .. } => {
                let _ = tx.send(UserAgentEvent::Message {
                    from: from.to_string(),
                    body: body.to_string(),
                });
            }
            UaChannel::Rtc { tx, .. } => {
                let _ = tx.send(RtcUaEvent::NewMessage {
                    from: from.to_string(),
                    body: body.to_string(),
                });
            }
        }
    }

    fn trace(&self, level: TraceLevel, category: &str, content: String) {
        if !self.options.trace_sip && category == CATEGORY_TRANSPORT {
            return;
        }
        let line = TraceLine::new(level, category, "loopback", content);
        match &self.channel {
            UaChannel::Dialog { tx, .. } => {
                let _ = tx.send(UserAgentEvent::Trace(line));
            }
            UaChannel::Rtc { tx, .. } => {
                let _ = tx.send(RtcUaEvent::Trace(line));
            }
        }
    }

    fn emit_connected(&self) {
        match &self.channel {
            UaChannel::Dialog { tx, .. } => {
                let _ = tx.send(UserAgentEvent::Connected);
            }
            UaChannel::Rtc { tx, .. } => {
                let _ = tx.send(RtcUaEvent::Connected);
            }
        }
    }

    fn emit_disconnected(&self, error: Option<StackError>) {
        match &self.channel {
            UaChannel::Dialog { tx, .. } => {
                let _ = tx.send(UserAgentEvent::Disconnected { error });
            }
            UaChannel::Rtc { tx, .. } => {
                let _ = tx.send(RtcUaEvent::Disconnected { error });
            }
        }
    }

    fn connect(&self) -> Result<(), StackError> {
        if self.behavior.fail_connect {
            let error = StackError::Transport("connection refused".to_string());
            self.trace(
                TraceLevel::Error,
                CATEGORY_USER_AGENT,
                "Transport connect failed: connection refused".to_string(),
            );
            return Err(error);
        }
        self.started.store(true, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
        self.trace(TraceLevel::Log, CATEGORY_USER_AGENT, "Transport connected".to_string());
        self.emit_connected();
        Ok(())
    }

    fn register_outcome(&self) -> RegistrationBehavior {
        self.trace(
            TraceLevel::Log,
            CATEGORY_TRANSPORT,
            format!("Sending WebSocket message:\n\nREGISTER {} SIP/2.0", self.options.uri),
        );
        let outcome = self.behavior.registration.clone();
        let status_line = match &outcome {
            RegistrationBehavior::Accept => "SIP/2.0 200 OK".to_string(),
            RegistrationBehavior::Reject { status, reason } => format!("SIP/2.0 {} {}", status, reason),
            RegistrationBehavior::Redirect { .. } => "SIP/2.0 302 Moved Temporarily".to_string(),
        };
        self.trace(
            TraceLevel::Log,
            CATEGORY_TRANSPORT,
            format!("Received WebSocket text message:\n\n{}", status_line),
        );
        self.registered
            .store(outcome == RegistrationBehavior::Accept, Ordering::SeqCst);
        self.trace(
            TraceLevel::Log,
            CATEGORY_REGISTERER,
            format!("Registration outcome: {}", status_line),
        );
        outcome
    }

    fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
        self.registered.store(false, Ordering::SeqCst);
        for call in self.calls() {
            call.end_silently();
        }
        self.trace(TraceLevel::Log, CATEGORY_USER_AGENT, "Transport closed".to_string());
        self.emit_disconnected(None);
    }

    fn outbound(&self, target: &Uri, constraints: MediaConstraints) -> Result<Arc<LoopbackCall>, StackError> {
        if !self.is_started() {
            return Err(StackError::InvalidState("user agent not started".to_string()));
        }
        let remote = RemoteIdentity {
            user: target.user.clone().unwrap_or_default(),
            display_name: None,
            uri: target.to_string(),
        };
        let call = Arc::new(LoopbackCall::new(self.flavor, Originator::Local, remote, constraints));
        self.calls.lock().push(call.clone());
        Ok(call)
    }
}

#[async_trait]
impl DialogUserAgent for LoopbackUserAgent {
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<UserAgentEvent>> {
        match &self.channel {
            UaChannel::Dialog { rx, .. } => rx.lock().take(),
            UaChannel::Rtc { .. } => None,
        }
    }

    async fn start(&self) -> Result<(), StackError> {
        self.connect()
    }

    async fn stop(&self) -> Result<(), StackError> {
        self.shutdown();
        Ok(())
    }

    async fn register(&self) -> Result<mpsc::UnboundedReceiver<RegisterResponse>, StackError> {
        if !self.is_started() {
            return Err(StackError::InvalidState("user agent not started".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(RegisterResponse::Trying);
        let response = match self.register_outcome() {
            RegistrationBehavior::Accept => RegisterResponse::Accepted {
                expires: self.behavior.expires,
            },
            RegistrationBehavior::Reject { status, reason } => RegisterResponse::Rejected { status, reason },
            RegistrationBehavior::Redirect { contact } => RegisterResponse::Redirected { contact },
        };
        let _ = tx.send(response);
        Ok(rx)
    }

    async fn unregister(&self) -> Result<(), StackError> {
        self.registered.store(false, Ordering::SeqCst);
        self.trace(
            TraceLevel::Log,
            CATEGORY_TRANSPORT,
            format!("Sending WebSocket message:\n\nREGISTER {} SIP/2.0 (Expires: 0)", self.options.uri),
        );
        Ok(())
    }

    fn inviter(
        &self,
        target: &Uri,
        constraints: MediaConstraints,
    ) -> Result<Arc<dyn DialogSession>, StackError> {
        let call = self.outbound(target, constraints)?;
        Ok(call)
    }
}

#[async_trait]
impl RtcUserAgent for LoopbackUserAgent {
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RtcUaEvent>> {
        match &self.channel {
            UaChannel::Rtc { rx, .. } => rx.lock().take(),
            UaChannel::Dialog { .. } => None,
        }
    }

    async fn start(&self) -> Result<(), StackError> {
        if let UaChannel::Rtc { tx, .. } = &self.channel {
            let _ = tx.send(RtcUaEvent::Connecting);
        }
        self.connect()?;
        if let UaChannel::Rtc { tx, .. } = &self.channel {
            let _ = tx.send(RtcUaEvent::Registering);
            let event = match self.register_outcome() {
                RegistrationBehavior::Accept => RtcUaEvent::Registered {
                    expires: self.behavior.expires,
                },
                RegistrationBehavior::Reject { status, reason } => RtcUaEvent::RegistrationFailed {
                    cause: StackError::Rejected { status, reason },
                },
                RegistrationBehavior::Redirect { contact } => RtcUaEvent::RegistrationRedirected { contact },
            };
            let _ = tx.send(event);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), StackError> {
        if let UaChannel::Rtc { tx, .. } = &self.channel {
            if self.is_registered() {
                let _ = tx.send(RtcUaEvent::Unregistered);
            }
        }
        self.shutdown();
        Ok(())
    }

    fn call(
        &self,
        target: &Uri,
        constraints: MediaConstraints,
    ) -> Result<Arc<dyn RtcSession>, StackError> {
        let call = self.outbound(target, constraints)?;
        call.begin_outbound();
        Ok(call)
    }
}

/// Loopback call, usable through either session contract
#[derive(Debug)]
pub struct LoopbackCall {
    id: String,
    flavor: Flavor,
    originator: Originator,
    remote: RemoteIdentity,
    offered: MediaConstraints,
    state: Mutex<DialogState>,
    held: AtomicBool,
    reject_renegotiation: AtomicBool,
    local: Mutex<Option<MediaStream>>,
    remote_media: Mutex<Option<MediaStream>>,
    operations: Mutex<Vec<String>>,
    dialog_events: broadcast::Sender<DialogEvent>,
    rtc_events: broadcast::Sender<RtcSessionEvent>,
}

impl LoopbackCall {
    fn new(flavor: Flavor, originator: Originator, remote: RemoteIdentity, offered: MediaConstraints) -> Self {
        let (dialog_events, _) = broadcast::channel(EVENT_CAPACITY);
        let (rtc_events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            id: Uuid::new_v4().to_string(),
            flavor,
            originator,
            remote,
            offered,
            state: Mutex::new(DialogState::Initial),
            held: AtomicBool::new(false),
            reject_renegotiation: AtomicBool::new(false),
            local: Mutex::new(None),
            remote_media: Mutex::new(None),
            operations: Mutex::new(Vec::new()),
            dialog_events,
            rtc_events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn current_state(&self) -> DialogState {
        *self.state.lock()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn is_outbound(&self) -> bool {
        self.originator == Originator::Local
    }

    /// Native requests issued on this call, in order
    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().clone()
    }

    /// Number of recorded requests starting with `prefix`
    pub fn count_operations(&self, prefix: &str) -> usize {
        self.operations
            .lock()
            .iter()
            .filter(|op| op.starts_with(prefix))
            .count()
    }

    pub fn local_media(&self) -> Option<MediaStream> {
        self.local.lock().clone()
    }

    /// Make the peer refuse every following hold/unhold
    pub fn set_reject_renegotiation(&self, reject: bool) {
        self.reject_renegotiation.store(reject, Ordering::SeqCst);
    }

    // ===== REMOTE PARTY CONTROLS =====

    /// Peer answers an outbound call
    pub fn remote_answer(&self) {
        if !self.is_outbound() || !self.advance(&[DialogState::Initial, DialogState::Establishing], DialogState::Established) {
            return;
        }
        let remote = MediaStream::capture(self.offered.video);
        *self.remote_media.lock() = Some(remote.clone());
        match self.flavor {
            Flavor::Dialog => {
                self.emit_dialog(DialogEvent::TrackAdded(remote));
                self.emit_dialog(DialogEvent::StateChanged(DialogState::Established));
            }
            Flavor::Rtc => {
                self.emit_rtc(RtcSessionEvent::Accepted);
                self.emit_rtc(RtcSessionEvent::Track(remote));
                self.emit_rtc(RtcSessionEvent::Confirmed);
            }
        }
    }

    /// Peer rejects an outbound call before answering
    pub fn remote_reject(&self, status: u16) {
        if !self.is_outbound() || !self.advance(&[DialogState::Initial, DialogState::Establishing], DialogState::Terminated) {
            return;
        }
        match self.flavor {
            Flavor::Dialog => self.emit_dialog(DialogEvent::StateChanged(DialogState::Terminated)),
            Flavor::Rtc => self.emit_rtc(RtcSessionEvent::Failed {
                originator: Originator::Remote,
                cause: format!("Rejected ({})", status),
            }),
        }
    }

    /// Caller gives up on an inbound call before it is answered
    pub fn remote_cancel(&self) {
        if self.is_outbound() || !self.advance(&[DialogState::Initial, DialogState::Establishing], DialogState::Terminated) {
            return;
        }
        match self.flavor {
            Flavor::Dialog => self.emit_dialog(DialogEvent::StateChanged(DialogState::Terminated)),
            Flavor::Rtc => self.emit_rtc(RtcSessionEvent::Failed {
                originator: Originator::Remote,
                cause: "Canceled".to_string(),
            }),
        }
    }

    /// Peer sends BYE
    pub fn remote_hangup(&self) {
        if !self.advance(&[DialogState::Established], DialogState::Terminated) {
            return;
        }
        match self.flavor {
            Flavor::Dialog => {
                self.emit_dialog(DialogEvent::StateChanged(DialogState::Terminating));
                self.emit_dialog(DialogEvent::StateChanged(DialogState::Terminated));
            }
            Flavor::Rtc => self.emit_rtc(RtcSessionEvent::Ended {
                originator: Originator::Remote,
                cause: "BYE".to_string(),
            }),
        }
    }

    /// Peer sends one DTMF tone
    pub fn remote_dtmf(&self, tone: DtmfTone) {
        match self.flavor {
            Flavor::Dialog => self.emit_dialog(DialogEvent::Info { tone }),
            Flavor::Rtc => self.emit_rtc(RtcSessionEvent::NewDtmf {
                originator: Originator::Remote,
                tone,
            }),
        }
    }

    // ===== INTERNALS =====

    fn record(&self, op: impl Into<String>) {
        let op = op.into();
        debug!(call = %self.id, operation = %op, "Loopback request");
        self.operations.lock().push(op);
    }

    fn emit_dialog(&self, event: DialogEvent) {
        let _ = self.dialog_events.send(event);
    }

    fn emit_rtc(&self, event: RtcSessionEvent) {
        let _ = self.rtc_events.send(event);
    }

    fn advance(&self, from: &[DialogState], to: DialogState) -> bool {
        let mut state = self.state.lock();
        if from.contains(&*state) {
            *state = to;
            true
        } else {
            false
        }
    }

    fn require(&self, expected: DialogState, operation: &str) -> Result<(), StackError> {
        let state = self.current_state();
        if state == expected {
            Ok(())
        } else {
            Err(StackError::InvalidState(format!("{} in {:?}", operation, state)))
        }
    }

    fn begin_outbound(&self) {
        if self.advance(&[DialogState::Initial], DialogState::Establishing) {
            *self.local.lock() = Some(MediaStream::capture(self.offered.video));
            self.record("invite");
            if self.flavor == Flavor::Dialog {
                self.emit_dialog(DialogEvent::StateChanged(DialogState::Establishing));
            }
        }
    }

    fn answer_inbound(&self, constraints: MediaConstraints) -> Result<(), StackError> {
        if self.is_outbound() {
            return Err(StackError::InvalidState("cannot accept an outbound call".to_string()));
        }
        if !self.advance(&[DialogState::Initial], DialogState::Establishing) {
            return Err(StackError::InvalidState(format!("accept in {:?}", self.current_state())));
        }
        self.record("accept");
        *self.local.lock() = Some(MediaStream::capture(constraints.video));
        let remote = MediaStream::capture(self.offered.video && constraints.video);
        *self.remote_media.lock() = Some(remote.clone());
        *self.state.lock() = DialogState::Established;
        match self.flavor {
            Flavor::Dialog => {
                self.emit_dialog(DialogEvent::StateChanged(DialogState::Establishing));
                self.emit_dialog(DialogEvent::TrackAdded(remote));
                self.emit_dialog(DialogEvent::StateChanged(DialogState::Established));
            }
            Flavor::Rtc => {
                self.emit_rtc(RtcSessionEvent::Accepted);
                self.emit_rtc(RtcSessionEvent::Track(remote));
                self.emit_rtc(RtcSessionEvent::Confirmed);
            }
        }
        Ok(())
    }

    fn renegotiate(&self, hold: bool) -> Result<(), StackError> {
        self.require(DialogState::Established, if hold { "hold" } else { "unhold" })?;
        self.record(if hold { "reinvite:hold" } else { "reinvite:unhold" });
        if self.reject_renegotiation.load(Ordering::SeqCst) {
            return Err(StackError::rejected(488, "Not Acceptable Here"));
        }
        self.held.store(hold, Ordering::SeqCst);
        Ok(())
    }

    fn end_local(&self, op: &str) {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            *state = DialogState::Terminated;
            previous
        };
        if previous == DialogState::Terminated {
            return;
        }
        self.record(op);
        match self.flavor {
            Flavor::Dialog => self.emit_dialog(DialogEvent::StateChanged(DialogState::Terminated)),
            Flavor::Rtc if previous == DialogState::Established => self.emit_rtc(RtcSessionEvent::Ended {
                originator: Originator::Local,
                cause: "Terminated".to_string(),
            }),
            Flavor::Rtc => self.emit_rtc(RtcSessionEvent::Failed {
                originator: Originator::Local,
                cause: "Canceled".to_string(),
            }),
        }
    }

    fn end_silently(&self) {
        let mut state = self.state.lock();
        if *state != DialogState::Terminated {
            *state = DialogState::Terminated;
            drop(state);
            match self.flavor {
                Flavor::Dialog => self.emit_dialog(DialogEvent::StateChanged(DialogState::Terminated)),
                Flavor::Rtc => self.emit_rtc(RtcSessionEvent::Ended {
                    originator: Originator::System,
                    cause: "Transport closed".to_string(),
                }),
            }
        }
    }

    fn toggle_local(&self, options: MuteOptions, enabled: bool) {
        if let Some(stream) = self.local.lock().as_ref() {
            if options.audio {
                stream.set_enabled(MediaKind::Audio, enabled);
            }
            if options.video {
                stream.set_enabled(MediaKind::Video, enabled);
            }
        }
    }
}

#[async_trait]
impl DialogSession for LoopbackCall {
    fn remote_identity(&self) -> RemoteIdentity {
        self.remote.clone()
    }

    fn offered_media(&self) -> MediaConstraints {
        self.offered
    }

    fn state(&self) -> DialogState {
        self.current_state()
    }

    fn subscribe(&self) -> broadcast::Receiver<DialogEvent> {
        self.dialog_events.subscribe()
    }

    fn local_stream(&self) -> Option<MediaStream> {
        self.local_media()
    }

    fn remote_stream(&self) -> Option<MediaStream> {
        self.remote_media.lock().clone()
    }

    async fn invite(&self) -> Result<(), StackError> {
        self.require(DialogState::Initial, "invite")?;
        self.begin_outbound();
        Ok(())
    }

    async fn accept(&self, constraints: MediaConstraints) -> Result<(), StackError> {
        self.answer_inbound(constraints)
    }

    async fn reject(&self) -> Result<(), StackError> {
        if self.is_outbound() {
            return Err(StackError::InvalidState("cannot reject an outbound call".to_string()));
        }
        self.require(DialogState::Initial, "reject")?;
        self.end_local("reject");
        Ok(())
    }

    async fn cancel(&self) -> Result<(), StackError> {
        if !self.is_outbound() {
            return Err(StackError::InvalidState("cannot cancel an inbound call".to_string()));
        }
        match self.current_state() {
            DialogState::Initial | DialogState::Establishing => {
                self.end_local("cancel");
                Ok(())
            }
            other => Err(StackError::InvalidState(format!("cancel in {:?}", other))),
        }
    }

    async fn bye(&self) -> Result<(), StackError> {
        self.require(DialogState::Established, "bye")?;
        self.end_local("bye");
        Ok(())
    }

    async fn reinvite(&self, hold: bool) -> Result<(), StackError> {
        self.renegotiate(hold)
    }

    async fn refer(&self, target: &Uri) -> Result<(), StackError> {
        self.require(DialogState::Established, "refer")?;
        self.record(format!("refer:{}", target));
        Ok(())
    }

    async fn info_dtmf(&self, tone: DtmfTone) -> Result<(), StackError> {
        self.require(DialogState::Established, "info")?;
        self.record(format!("dtmf:{}", tone));
        Ok(())
    }
}

#[async_trait]
impl RtcSession for LoopbackCall {
    fn originator(&self) -> Originator {
        self.originator
    }

    fn remote_identity(&self) -> RemoteIdentity {
        self.remote.clone()
    }

    fn offered_media(&self) -> MediaConstraints {
        self.offered
    }

    fn is_established(&self) -> bool {
        self.current_state() == DialogState::Established
    }

    fn is_ended(&self) -> bool {
        self.current_state() == DialogState::Terminated
    }

    fn subscribe(&self) -> broadcast::Receiver<RtcSessionEvent> {
        self.rtc_events.subscribe()
    }

    fn local_stream(&self) -> Option<MediaStream> {
        self.local_media()
    }

    fn remote_stream(&self) -> Option<MediaStream> {
        self.remote_media.lock().clone()
    }

    async fn answer(&self, constraints: MediaConstraints) -> Result<(), StackError> {
        self.answer_inbound(constraints)
    }

    async fn terminate(&self, options: TerminateOptions) -> Result<(), StackError> {
        let op = match self.current_state() {
            DialogState::Terminated | DialogState::Terminating => {
                return Err(StackError::InvalidState("session already terminated".to_string()))
            }
            DialogState::Established => "bye".to_string(),
            _ if self.is_outbound() => "cancel".to_string(),
            _ => format!("reject:{}", options.status_code.unwrap_or(480)),
        };
        self.end_local(&op);
        Ok(())
    }

    fn mute(&self, options: MuteOptions) {
        self.record(format!("mute:{}", mute_label(options)));
        self.toggle_local(options, false);
    }

    fn unmute(&self, options: MuteOptions) {
        self.record(format!("unmute:{}", mute_label(options)));
        self.toggle_local(options, true);
    }

    async fn hold(&self) -> Result<(), StackError> {
        self.renegotiate(true)?;
        self.emit_rtc(RtcSessionEvent::Hold {
            originator: Originator::Local,
        });
        Ok(())
    }

    async fn unhold(&self) -> Result<(), StackError> {
        self.renegotiate(false)?;
        self.emit_rtc(RtcSessionEvent::Unhold {
            originator: Originator::Local,
        });
        Ok(())
    }

    async fn refer(&self, target: &Uri) -> Result<(), StackError> {
        self.require(DialogState::Established, "refer")?;
        self.record(format!("refer:{}", target));
        Ok(())
    }

    async fn send_dtmf(&self, tone: DtmfTone) -> Result<(), StackError> {
        self.require(DialogState::Established, "sendDTMF")?;
        self.record(format!("dtmf:{}", tone));
        Ok(())
    }
}

fn mute_label(options: MuteOptions) -> &'static str {
    match (options.audio, options.video) {
        (true, true) => "audio+video",
        (true, false) => "audio",
        (false, true) => "video",
        (false, false) => "none",
    }
}

/// Media element that records what it was asked to render
#[derive(Debug, Default)]
pub struct LoopbackElement {
    sink_selection: bool,
    attached: Mutex<Vec<MediaStream>>,
    sink_id: Mutex<Option<String>>,
}

impl LoopbackElement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Element that supports routing to a specific output device
    pub fn with_sink_selection() -> Self {
        Self {
            sink_selection: true,
            ..Self::default()
        }
    }

    /// Streams attached so far, oldest first
    pub fn attached(&self) -> Vec<MediaStream> {
        self.attached.lock().clone()
    }

    pub fn current(&self) -> Option<MediaStream> {
        self.attached.lock().last().cloned()
    }

    pub fn sink_id(&self) -> Option<String> {
        self.sink_id.lock().clone()
    }
}

#[async_trait]
impl MediaElement for LoopbackElement {
    fn attach(&self, stream: &MediaStream) {
        self.attached.lock().push(stream.clone());
    }

    fn supports_sink_selection(&self) -> bool {
        self.sink_selection
    }

    async fn set_sink_id(&self, device_id: &str) -> SipResult<()> {
        if !self.sink_selection {
            return Err(SipError::unsupported("audio output selection"));
        }
        *self.sink_id.lock() = Some(device_id.to_string());
        Ok(())
    }
}

/// Fixed list of audio outputs, or a scripted enumeration failure
#[derive(Debug, Clone, Default)]
pub struct LoopbackDevices {
    pub outputs: Vec<AudioOutputDevice>,
    pub fail: bool,
}

#[async_trait]
impl AudioDevices for LoopbackDevices {
    async fn output_devices(&self) -> SipResult<Vec<AudioOutputDevice>> {
        if self.fail {
            return Err(SipError::unsupported("device enumeration"));
        }
        Ok(self.outputs.clone())
    }
}
