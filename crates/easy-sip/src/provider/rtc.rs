//! Provider over an emitter-model stack
//!
//! The native user agent registers on its own when started, so both the
//! user agent delegate and the register delegate are fed from its single
//! event stream.

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
use crate::session::{RtcSessionAdapter, SessionHandle};
use crate::stack::rtc::{Originator, RtcStack, RtcUaEvent, RtcUserAgent};
use crate::stack::MediaConstraints;
use crate::types::{normalize_target, AnswerOptions, CallOptions, Credentials};

struct Registration {
    ua: Arc<dyn RtcUserAgent>,
    domain: String,
    pump: Option<JoinHandle<()>>,
}

/// [`SipProvider`] driving an [`RtcStack`]
pub struct RtcProvider {
    id: ProviderId,
    stack: Arc<dyn RtcStack>,
    options: ProviderOptions,
    registration: Mutex<Option<Registration>>,
    registered: Arc<AtomicBool>,
}

impl RtcProvider {
    pub fn new(stack: Arc<dyn RtcStack>) -> Self {
        Self::with_options(stack, ProviderOptions::default())
    }

    pub fn with_options(stack: Arc<dyn RtcStack>, options: ProviderOptions) -> Self {
        Self {
            id: ProviderId::next(),
            stack,
            options,
            registration: Mutex::new(None),
            registered: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn close(&self, mut registration: Registration) {
        if let Some(pump) = registration.pump.take() {
            pump.abort();
        }
        self.registered.store(false, Ordering::SeqCst);
        if let Err(e) = registration.ua.stop().await {
            warn!(error = %e, "Failed to stop user agent");
        }
    }
}

#[async_trait]
impl SipProvider for RtcProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Rtc
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
        let ua = match self.stack.create_ua(ua_options).await {
            Ok(ua) => ua,
            Err(e) => {
                warn!(error = %e, "Failed to create user agent");
                ua_delegate.on_disconnect(Some(disconnect_error(e)));
                return Ok(());
            }
        };

        let pump = match ua.take_events() {
            Some(events) => Some(tokio::spawn(pump_events(
                events,
                EventTargets {
                    origin: self.id,
                    domain: credentials.domain.clone(),
                    ua_delegate: ua_delegate.clone(),
                    register_delegate,
                    log_sink,
                    registered: self.registered.clone(),
                },
            ))),
            None => {
                warn!("User agent events already taken; delegates will not be notified");
                None
            }
        };

        if let Err(e) = ua.start().await {
            warn!(error = %e, "User agent start failed");
            ua_delegate.on_disconnect(Some(disconnect_error(e)));
        }
        *slot = Some(Registration {
            ua,
            domain: credentials.domain.clone(),
            pump,
        });
        Ok(())
    }

    async fn call(&self, options: CallOptions) -> SipResult<Arc<dyn SessionHandle>> {
        let slot = self.registration.lock().await;
        let registration = slot.as_ref().ok_or(SipError::NotRegistered)?;
        let target = normalize_target(&options.destination, Some(&registration.domain))?;
        let native = registration
            .ua
            .call(&target, MediaConstraints::with_video(options.video))?;
        let domain = registration.domain.clone();
        drop(slot);

        let session = RtcSessionAdapter::new(native, options.video, Some(domain), options.media);
        info!(session_id = %session.id(), target = %target, video = options.video, "Outbound call started");
        Ok(session)
    }

    async fn answer(&self, invitation: &Invitation, options: AnswerOptions) -> SipResult<Arc<dyn SessionHandle>> {
        if invitation.origin() != self.id || !matches!(invitation.native(), NativeInvitation::Rtc(_)) {
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

struct EventTargets {
    origin: ProviderId,
    domain: String,
    ua_delegate: Arc<dyn UserAgentDelegate>,
    register_delegate: Arc<dyn RegisterDelegate>,
    log_sink: Option<Arc<dyn LogSink>>,
    registered: Arc<AtomicBool>,
}

async fn pump_events(mut events: mpsc::UnboundedReceiver<RtcUaEvent>, targets: EventTargets) {
    while let Some(event) = events.recv().await {
        match event {
            RtcUaEvent::Connecting => debug!("Transport connecting"),
            RtcUaEvent::Connected => targets.ua_delegate.on_connect(),
            RtcUaEvent::Disconnected { error } => {
                targets.registered.store(false, Ordering::SeqCst);
                targets.ua_delegate.on_disconnect(error.map(disconnect_error));
            }
            RtcUaEvent::Registering => targets.register_delegate.on_trying(),
            RtcUaEvent::Registered { expires } => {
                targets.registered.store(true, Ordering::SeqCst);
                info!(expires, "Registration accepted");
                targets.register_delegate.on_accept(expires);
            }
            RtcUaEvent::Unregistered => {
                targets.registered.store(false, Ordering::SeqCst);
                debug!("Unregistered by user agent");
            }
            RtcUaEvent::RegistrationFailed { cause } => {
                targets.registered.store(false, Ordering::SeqCst);
                warn!(cause = %cause, "Registration failed");
                targets.register_delegate.on_reject(registration_error(cause));
            }
            RtcUaEvent::RegistrationRedirected { contact } => {
                info!(%contact, "Registration redirected");
                targets.register_delegate.on_redirect(contact);
            }
            RtcUaEvent::NewRtcSession { session, originator } => {
                // locally originated sessions are already owned by `call`
                if originator == Originator::Remote {
                    let invitation = Invitation::from_rtc(session, targets.origin, Some(targets.domain.clone()));
                    info!(from = %invitation.remote_identity().uri, video = invitation.has_video(), "Incoming call");
                    targets.ua_delegate.on_invite(invitation);
                }
            }
            RtcUaEvent::NewMessage { from, body } => targets.ua_delegate.on_message(InboundMessage { from, body }),
            RtcUaEvent::NewNotify { event, body } => targets.ua_delegate.on_notify(Notification { event, body }),
            RtcUaEvent::NewRefer { refer_to, referred_by } => {
                targets.ua_delegate.on_refer(Referral { refer_to, referred_by })
            }
            RtcUaEvent::NewRegister { contact } => targets.ua_delegate.on_register(RegisterRequest { contact }),
            RtcUaEvent::NewSubscribe { event, from } => {
                targets.ua_delegate.on_subscribe(SubscribeRequest { event, from })
            }
            RtcUaEvent::Trace(line) => {
                if let Some(sink) = &targets.log_sink {
                    sink.log(&line);
                }
            }
        }
    }
    debug!("User agent event pump finished");
}
