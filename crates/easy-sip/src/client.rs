//! Single-call client facade
//!
//! [`SipClient`] wraps one [`SipProvider`] and remembers the most recent
//! call as its *current* session. Control operations act on that session and
//! are no-ops when there is none, which keeps simple one-call applications
//! free of session bookkeeping. Applications juggling several calls use
//! [`SessionManager`](crate::SessionManager) instead.
//!
//! # Examples
//!
//! ```rust
//! use rvoip_easy_sip::{CallOptions, ClientConfig, Credentials, SipClient};
//! use rvoip_easy_sip::stack::loopback::LoopbackStack;
//!
//! # tokio_test::block_on(async {
//! let stack = LoopbackStack::new();
//! let client = SipClient::builder(ClientConfig::new())
//!     .with_loopback(stack.clone())
//!     .build()
//!     .unwrap();
//!
//! client.register(Credentials::new("example.com", "1001", "secret")).await.unwrap();
//! let session = client.call(CallOptions::new("200")).await.unwrap();
//! assert_eq!(session.remote_identity().user, "200");
//!
//! client.hangup().await.unwrap();
//! assert!(client.current_session().await.is_none());
//! # })
//! ```

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::error::{SipError, SipResult};
use crate::provider::{
    DialogProvider, Invitation, LogSink, NoopDelegates, ProviderKind, RegisterDelegate, RtcProvider,
    SipProvider, UserAgentDelegate,
};
use crate::session::{SessionHandle, TransferTarget};
use crate::stack::dialog::DialogStack;
use crate::stack::loopback::LoopbackStack;
use crate::stack::rtc::RtcStack;
use crate::types::{AnswerOptions, CallOptions, Credentials, DtmfTone};

/// Builder for [`SipClient`]
///
/// The provider is either injected with [`with_provider`](Self::with_provider)
/// or built from the configured [`ProviderKind`] and the matching stack.
pub struct SipClientBuilder {
    config: ClientConfig,
    provider: Option<Arc<dyn SipProvider>>,
    dialog_stack: Option<Arc<dyn DialogStack>>,
    rtc_stack: Option<Arc<dyn RtcStack>>,
    ua_delegate: Option<Arc<dyn UserAgentDelegate>>,
    register_delegate: Option<Arc<dyn RegisterDelegate>>,
    log_sink: Option<Arc<dyn LogSink>>,
}

impl SipClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            provider: None,
            dialog_stack: None,
            rtc_stack: None,
            ua_delegate: None,
            register_delegate: None,
            log_sink: None,
        }
    }

    /// Use this provider regardless of the configured kind
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

    pub fn with_user_agent_delegate(mut self, delegate: Arc<dyn UserAgentDelegate>) -> Self {
        self.ua_delegate = Some(delegate);
        self
    }

    pub fn with_register_delegate(mut self, delegate: Arc<dyn RegisterDelegate>) -> Self {
        self.register_delegate = Some(delegate);
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn build(self) -> SipResult<SipClient> {
        self.config.validate()?;
        let provider: Arc<dyn SipProvider> = match (self.provider, self.config.provider) {
            (Some(provider), _) => provider,
            (None, ProviderKind::Dialog) => {
                let stack = self
                    .dialog_stack
                    .ok_or_else(|| SipError::config("provider", "dialog provider selected but no dialog stack given"))?;
                Arc::new(DialogProvider::with_options(stack, self.config.provider_options()))
            }
            (None, ProviderKind::Rtc) => {
                let stack = self
                    .rtc_stack
                    .ok_or_else(|| SipError::config("provider", "rtc provider selected but no rtc stack given"))?;
                Arc::new(RtcProvider::with_options(stack, self.config.provider_options()))
            }
        };
        debug!(kind = ?provider.kind(), "Client built");
        Ok(SipClient {
            config: self.config,
            provider,
            credentials: RwLock::new(None),
            session: Mutex::new(None),
            ua_delegate: RwLock::new(self.ua_delegate.unwrap_or_else(|| Arc::new(NoopDelegates))),
            register_delegate: RwLock::new(self.register_delegate.unwrap_or_else(|| Arc::new(NoopDelegates))),
            log_sink: RwLock::new(self.log_sink),
        })
    }
}

/// Facade over one provider and one current session
pub struct SipClient {
    config: ClientConfig,
    provider: Arc<dyn SipProvider>,
    credentials: RwLock<Option<Credentials>>,
    session: Mutex<Option<Arc<dyn SessionHandle>>>,
    ua_delegate: RwLock<Arc<dyn UserAgentDelegate>>,
    register_delegate: RwLock<Arc<dyn RegisterDelegate>>,
    log_sink: RwLock<Option<Arc<dyn LogSink>>>,
}

impl SipClient {
    pub fn builder(config: ClientConfig) -> SipClientBuilder {
        SipClientBuilder::new(config)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn SipProvider> {
        &self.provider
    }

    /// Credentials of the last `register` call
    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials.read().clone()
    }

    pub fn is_registered(&self) -> bool {
        self.provider.is_registered()
    }

    /// Takes effect on the next `register`
    pub fn set_user_agent_delegate(&self, delegate: Arc<dyn UserAgentDelegate>) {
        *self.ua_delegate.write() = delegate;
    }

    /// Takes effect on the next `register`
    pub fn set_register_delegate(&self, delegate: Arc<dyn RegisterDelegate>) {
        *self.register_delegate.write() = delegate;
    }

    /// Takes effect on the next `register`
    pub fn set_log_sink(&self, sink: Option<Arc<dyn LogSink>>) {
        *self.log_sink.write() = sink;
    }

    pub async fn register(&self, credentials: Credentials) -> SipResult<()> {
        let ua_delegate = self.ua_delegate.read().clone();
        let register_delegate = self.register_delegate.read().clone();
        let log_sink = self.log_sink.read().clone();
        self.provider
            .register(&credentials, ua_delegate, register_delegate, log_sink)
            .await?;
        info!(aor = %credentials.address_of_record(), "Registration started");
        *self.credentials.write() = Some(credentials);
        Ok(())
    }

    /// Place a call and make it the current session
    pub async fn call(&self, options: CallOptions) -> SipResult<Arc<dyn SessionHandle>> {
        let session = self.provider.call(options).await?;
        *self.session.lock().await = Some(session.clone());
        Ok(session)
    }

    /// Answer an invitation and make it the current session
    pub async fn answer(&self, invitation: &Invitation, options: AnswerOptions) -> SipResult<Arc<dyn SessionHandle>> {
        let session = self.provider.answer(invitation, options).await?;
        *self.session.lock().await = Some(session.clone());
        Ok(session)
    }

    pub fn is_video_call(&self, invitation: &Invitation) -> bool {
        self.provider.is_video_call(invitation)
    }

    /// Current session, unless it has terminated
    pub async fn current_session(&self) -> Option<Arc<dyn SessionHandle>> {
        let mut slot = self.session.lock().await;
        if slot.as_ref().is_some_and(|s| s.phase().is_terminated()) {
            *slot = None;
        }
        slot.clone()
    }

    pub async fn mute(&self) {
        if let Some(session) = self.current_session().await {
            session.mute();
        }
    }

    pub async fn unmute(&self) {
        if let Some(session) = self.current_session().await {
            session.unmute();
        }
    }

    pub async fn mute_video(&self) {
        if let Some(session) = self.current_session().await {
            session.mute_video();
        }
    }

    pub async fn unmute_video(&self) {
        if let Some(session) = self.current_session().await {
            session.unmute_video();
        }
    }

    pub async fn hold(&self) -> SipResult<()> {
        match self.current_session().await {
            Some(session) => session.hold().await,
            None => Ok(()),
        }
    }

    pub async fn unhold(&self) -> SipResult<()> {
        match self.current_session().await {
            Some(session) => session.unhold().await,
            None => Ok(()),
        }
    }

    pub async fn transfer(&self, target: TransferTarget) -> SipResult<()> {
        match self.current_session().await {
            Some(session) => session.transfer(target).await,
            None => Ok(()),
        }
    }

    pub async fn set_audio_output(&self, device_id: &str) -> SipResult<()> {
        match self.current_session().await {
            Some(session) => session.set_audio_output(device_id).await,
            None => Ok(()),
        }
    }

    pub async fn send_dtmf(&self, tone: DtmfTone) -> SipResult<()> {
        match self.current_session().await {
            Some(session) => session.send_dtmf(tone).await,
            None => Ok(()),
        }
    }

    /// Terminate and forget the current session
    pub async fn hangup(&self) -> SipResult<()> {
        let session = self.session.lock().await.take();
        match session {
            Some(session) => session.terminate().await,
            None => Ok(()),
        }
    }

    pub async fn unregister(&self) -> SipResult<()> {
        self.provider.unregister().await?;
        *self.credentials.write() = None;
        Ok(())
    }
}
