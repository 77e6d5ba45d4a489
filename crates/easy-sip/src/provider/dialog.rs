//! Provider over a dialog-model stack

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    disconnect_error, registration_error, InboundMessage, Invitation, LogSink, NativeInvitation,
    Notification, ProviderId, ProviderKind, ProviderOptions, Referral, RegisterDelegate,
    RegisterRequest, SipProvider, SubscribeRequest, UserAgentDelegate,
};
use crate::error::{SipError, SipResult};
use crate::session::{DialogSessionAdapter, SessionHandle};
use crate::stack::dialog::{DialogStack, DialogUserAgent, RegisterResponse, UserAgentEvent};
use crate::stack::MediaConstraints;
use crate::types::{normalize_target, AnswerOptions, CallOptions, Credentials, Direction};

struct Registration {
    ua: Arc<dyn DialogUserAgent>,
    domain: String,
    tasks: Vec<JoinHandle<()>>,
}

impl Registration {
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// [`SipProvider`] driving a [`DialogStack`]
pub struct DialogProvider {
    id: ProviderId,
    stack: Arc<dyn DialogStack>,
    options: ProviderOptions,
    registration: Mutex<Option<Registration>>,
    registered: Arc<AtomicBool>,
}

impl DialogProvider {
    pub fn new(stack: Arc<dyn DialogStack>) -> Self {
        Self::with_options(stack, ProviderOptions::default())
    }

    pub fn with_options(stack: Arc<dyn DialogStack>, options: ProviderOptions) -> Self {
        Self {
            id: ProviderId::next(),
            stack,
            options,
            registration: Mutex::new(None),
            registered: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn close(&self, mut registration: Registration) {
        registration.abort_tasks();
        self.registered.store(false, Ordering::SeqCst);
        if let Err(e) = registration.ua.unregister().await {
            debug!(error = %e, "Unregister failed while closing user agent");
        }
        if let Err(e) = registration.ua.stop().await {
            warn!(error = %e, "Failed to stop user agent");
        }
    }
}

#[async_trait]
impl SipProvider for DialogProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Dialog
    }

    async fn register(
        &self,
        credentials: &Credentials,
        ua_delegate: Arc<dyn UserAgentDelegate>,
        register_delegate: Arc<dyn RegisterDelegate>,
        log_sink: Option<Arc<dyn LogSink>>,
    ) -> SipResult<()> {
        let aor = credentials.validate()?;
        let mut slot = self.registration.lock().await;
        if let Some(previous) = slot.take() {
            info!("Closing previous user agent before registering again");
            self.close(previous).await;
        }

        let ua_options = self.options.user_agent_options(credentials, &aor);
        info!(aor = %aor, server = ?ua_options.server, "Registering");
        let ua = match self.stack.create_user_agent(ua_options).await {
            Ok(ua) => ua,
            Err(e) => {
                warn!(error = %e, "Failed to create user agent");
                ua_delegate.on_disconnect(Some(disconnect_error(e)));
                return Ok(());
            }
        };

        let mut registration = Registration {
            ua: ua.clone(),
            domain: credentials.domain.clone(),
            tasks: Vec::new(),
        };
        match ua.take_events() {
            Some(events) => registration.tasks.push(tokio::spawn(pump_user_agent(
                events,
                self.id,
                credentials.domain.clone(),
                ua_delegate.clone(),
                log_sink,
            ))),
            None => warn!("User agent events already taken; delegate will not be notified"),
        }

        if let Err(e) = ua.start().await {
            warn!(error = %e, "Transport connect failed");
            ua_delegate.on_disconnect(Some(disconnect_error(e)));
            *slot = Some(registration);
            return Ok(());
        }

        match ua.register().await {
            Ok(responses) => registration.tasks.push(tokio::spawn(pump_register(
                responses,
                register_delegate,
                self.registered.clone(),
            ))),
            Err(e) => {
                warn!(error = %e, "REGISTER could not be sent");
                register_delegate.on_reject(registration_error(e));
            }
        }
        *slot = Some(registration);
        Ok(())
    }

    async fn call(&self, options: CallOptions) -> SipResult<Arc<dyn SessionHandle>> {
        let slot = self.registration.lock().await;
        let registration = slot.as_ref().ok_or(SipError::NotRegistered)?;
        let target = normalize_target(&options.destination, Some(&registration.domain))?;
        let native = registration
            .ua
            .inviter(&target, MediaConstraints::with_video(options.video))?;
        let domain = registration.domain.clone();
        drop(slot);

        let session = DialogSessionAdapter::new(
            native,
            Direction::Outgoing,
            options.video,
            Some(domain),
            options.media,
        );
        session.invite().await?;
        info!(session_id = %session.id(), target = %target, video = options.video, "Outbound call started");
        Ok(session)
    }

    async fn answer(&self, invitation: &Invitation, options: AnswerOptions) -> SipResult<Arc<dyn SessionHandle>> {
        if invitation.origin() != self.id || !matches!(invitation.native(), NativeInvitation::Dialog(_)) {
            return Err(SipError::invalid_target(
                invitation.remote_identity().uri.clone(),
                "invitation was not received by this provider",
            ));
        }
        invitation.accept(options).await
    }

    async fn unregister(&self) -> SipResult<()> {
        let previous = self.registration.lock().await.take();
        match previous {
            Some(registration) => {
                self.close(registration).await;
                info!("Unregistered");
            }
            None => debug!("Unregister without registration ignored"),
        }
        Ok(())
    }

    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }
}

async fn pump_user_agent(
    mut events: mpsc::UnboundedReceiver<UserAgentEvent>,
    origin: ProviderId,
    domain: String,
    delegate: Arc<dyn UserAgentDelegate>,
    log_sink: Option<Arc<dyn LogSink>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            UserAgentEvent::Connected => delegate.on_connect(),
            UserAgentEvent::Disconnected { error } => delegate.on_disconnect(error.map(disconnect_error)),
            UserAgentEvent::Invite(native) => {
                let invitation = Invitation::from_dialog(native, origin, Some(domain.clone()));
                info!(from = %invitation.remote_identity().uri, video = invitation.has_video(), "Incoming call");
                delegate.on_invite(invitation);
            }
            UserAgentEvent::Message { from, body } => delegate.on_message(InboundMessage { from, body }),
            UserAgentEvent::Notify { event, body } => delegate.on_notify(Notification { event, body }),
            UserAgentEvent::Refer { refer_to, referred_by } => {
                delegate.on_refer(Referral { refer_to, referred_by })
            }
            UserAgentEvent::Register { contact } => delegate.on_register(RegisterRequest { contact }),
            UserAgentEvent::Subscribe { event, from } => delegate.on_subscribe(SubscribeRequest { event, from }),
            UserAgentEvent::Trace(line) => {
                if let Some(sink) = &log_sink {
                    sink.log(&line);
                }
            }
        }
    }
    debug!("User agent event pump finished");
}

async fn pump_register(
    mut responses: mpsc::UnboundedReceiver<RegisterResponse>,
    delegate: Arc<dyn RegisterDelegate>,
    registered: Arc<AtomicBool>,
) {
    while let Some(response) = responses.recv().await {
        match response {
            RegisterResponse::Trying => delegate.on_trying(),
            RegisterResponse::Accepted { expires } => {
                registered.store(true, Ordering::SeqCst);
                info!(expires, "Registration accepted");
                delegate.on_accept(expires);
            }
            RegisterResponse::Rejected { status, reason } => {
                registered.store(false, Ordering::SeqCst);
                warn!(status, %reason, "Registration rejected");
                delegate.on_reject(SipError::RegistrationRejected {
                    status: Some(status),
                    reason,
                });
            }
            RegisterResponse::Redirected { contact } => {
                info!(%contact, "Registration redirected");
                delegate.on_redirect(contact);
            }
        }
    }
}
