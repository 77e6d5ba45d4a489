//! Providers
//!
//! A [`SipProvider`] owns one native user agent at a time and turns its
//! events into delegate callbacks. Two implementations exist, one per
//! supported stack model; which one is used is decided by configuration
//! ([`ProviderKind`]) or by injecting an instance, never by inspecting the
//! stack at runtime.

pub mod dialog;
pub mod invitation;
pub mod rtc;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rvoip_sip_core::Uri;
use serde::{Deserialize, Serialize};

use crate::error::{SipError, SipResult};
use crate::session::SessionHandle;
use crate::stack::{StackError, TraceLine, UserAgentOptions};
use crate::types::{AnswerOptions, CallOptions, Credentials, DEFAULT_USER_AGENT};

pub use dialog::DialogProvider;
pub use invitation::{Invitation, NativeInvitation};
pub use rtc::RtcProvider;

/// Which native stack model a client drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Inviter/invitation objects with explicit state changes
    #[default]
    Dialog,
    /// Event-emitting user agent with native session controls
    Rtc,
}

// ===== DELEGATE PAYLOADS =====

/// Out-of-dialog MESSAGE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: String,
    pub body: String,
}

/// NOTIFY received outside our own subscriptions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub event: String,
    pub body: String,
}

/// REFER received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Referral {
    pub refer_to: String,
    pub referred_by: Option<String>,
}

/// REGISTER received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub contact: String,
}

/// SUBSCRIBE received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub event: String,
    pub from: String,
}

// ===== DELEGATES =====

/// User agent notifications
///
/// All methods default to no-ops. Callbacks run on the provider's event
/// task and must not block.
pub trait UserAgentDelegate: Send + Sync {
    fn on_connect(&self) {}

    /// Transport closed; `error` is set when it was not a clean shutdown
    fn on_disconnect(&self, _error: Option<SipError>) {}

    fn on_invite(&self, _invitation: Invitation) {}

    fn on_message(&self, _message: InboundMessage) {}

    fn on_notify(&self, _notification: Notification) {}

    fn on_refer(&self, _referral: Referral) {}

    fn on_register(&self, _request: RegisterRequest) {}

    fn on_subscribe(&self, _request: SubscribeRequest) {}
}

/// Registration outcome notifications
pub trait RegisterDelegate: Send + Sync {
    /// Registrar accepted; `expires` in seconds
    fn on_accept(&self, _expires: u32) {}

    fn on_reject(&self, _error: SipError) {}

    fn on_trying(&self) {}

    fn on_redirect(&self, _contact: String) {}
}

/// Receives raw signaling trace lines verbatim
pub trait LogSink: Send + Sync {
    fn log(&self, line: &TraceLine);
}

impl<F> LogSink for F
where
    F: Fn(&TraceLine) + Send + Sync,
{
    fn log(&self, line: &TraceLine) {
        self(line)
    }
}

/// Delegate that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDelegates;

impl UserAgentDelegate for NoopDelegates {}
impl RegisterDelegate for NoopDelegates {}

// ===== PROVIDER =====

/// Registration and call control over one native stack
#[async_trait]
pub trait SipProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Open a user agent and register, closing any previous one first
    ///
    /// Malformed credentials fail synchronously with
    /// [`SipError::InvalidConfiguration`]; transport and registration
    /// failures are reported only through the delegates.
    async fn register(
        &self,
        credentials: &Credentials,
        ua_delegate: Arc<dyn UserAgentDelegate>,
        register_delegate: Arc<dyn RegisterDelegate>,
        log_sink: Option<Arc<dyn LogSink>>,
    ) -> SipResult<()>;

    /// Place a call; the returned session is already establishing
    async fn call(&self, options: CallOptions) -> SipResult<Arc<dyn SessionHandle>>;

    /// Accept an invitation received from this provider
    async fn answer(&self, invitation: &Invitation, options: AnswerOptions) -> SipResult<Arc<dyn SessionHandle>>;

    /// Tear down registration and transport; no-op when not registered
    async fn unregister(&self) -> SipResult<()>;

    fn is_registered(&self) -> bool;

    /// Whether the invitation's offer includes video
    fn is_video_call(&self, invitation: &Invitation) -> bool {
        invitation.has_video()
    }
}

/// User agent settings shared by both providers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOptions {
    pub user_agent: String,
    pub register_expires: u32,
    pub extra_headers: Vec<String>,
    pub trace_sip: bool,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            register_expires: 3600,
            extra_headers: Vec::new(),
            trace_sip: true,
        }
    }
}

impl ProviderOptions {
    pub(crate) fn user_agent_options(&self, credentials: &Credentials, aor: &Uri) -> UserAgentOptions {
        UserAgentOptions {
            uri: aor.to_string(),
            display_name: credentials.effective_display_name().to_string(),
            auth_username: credentials.phone.clone(),
            auth_password: credentials.secret.clone(),
            server: credentials.server.clone(),
            user_agent: credentials
                .user_agent
                .clone()
                .unwrap_or_else(|| self.user_agent.clone()),
            register_expires: self.register_expires,
            extra_headers: self.extra_headers.clone(),
            trace_sip: self.trace_sip,
        }
    }
}

/// Identifies the provider instance an invitation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ProviderId(u64);

impl ProviderId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) fn registration_error(error: StackError) -> SipError {
    match error {
        StackError::Rejected { status, reason } => SipError::RegistrationRejected {
            status: Some(status),
            reason,
        },
        other => SipError::RegistrationRejected {
            status: None,
            reason: other.to_string(),
        },
    }
}

pub(crate) fn disconnect_error(error: StackError) -> SipError {
    match error {
        StackError::Transport(reason) => SipError::transport(reason),
        other => SipError::Stack(other),
    }
}
