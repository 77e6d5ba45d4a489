//! Emitter-model stack contract
//!
//! The user agent is started once and registers on its own; everything it
//! observes comes out of a single event stream (`connected`, `registered`,
//! `newRTCSession`, ...). RTC sessions start signaling as soon as they are
//! created and expose mute, hold, refer and DTMF as native calls.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rvoip_sip_core::Uri;
use tokio::sync::{broadcast, mpsc};

use super::{MediaConstraints, RemoteIdentity, StackError, TraceLine, UserAgentOptions};
use crate::media::MediaStream;
use crate::types::DtmfTone;

/// Which side caused a session event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Originator {
    Local,
    Remote,
    System,
}

/// Events raised by an emitter-model user agent
#[derive(Debug, Clone)]
pub enum RtcUaEvent {
    Connecting,
    Connected,
    Disconnected { error: Option<StackError> },
    Registering,
    Registered { expires: u32 },
    Unregistered,
    RegistrationFailed { cause: StackError },
    RegistrationRedirected { contact: String },
    NewRtcSession { session: Arc<dyn RtcSession>, originator: Originator },
    NewMessage { from: String, body: String },
    NewNotify { event: String, body: String },
    NewRefer { refer_to: String, referred_by: Option<String> },
    NewRegister { contact: String },
    NewSubscribe { event: String, from: String },
    Trace(TraceLine),
}

/// Events raised by an RTC session
#[derive(Debug, Clone)]
pub enum RtcSessionEvent {
    /// Provisional response (ringing)
    Progress,
    /// 2xx sent or received
    Accepted,
    /// ACK exchanged, media flowing
    Confirmed,
    /// Established session ended
    Ended { originator: Originator, cause: String },
    /// Session ended before establishment
    Failed { originator: Originator, cause: String },
    NewDtmf { originator: Originator, tone: DtmfTone },
    /// Remote media arrived on the peer connection
    Track(MediaStream),
    Hold { originator: Originator },
    Unhold { originator: Originator },
}

/// Which local media to (un)mute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MuteOptions {
    pub audio: bool,
    pub video: bool,
}

impl MuteOptions {
    pub fn audio() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn video() -> Self {
        Self {
            audio: false,
            video: true,
        }
    }
}

/// Options for ending a session
///
/// Without a status code the stack picks CANCEL, the default rejection or
/// BYE from the session's state; a status code forces a rejection response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TerminateOptions {
    pub status_code: Option<u16>,
    pub reason_phrase: Option<String>,
}

impl TerminateOptions {
    pub fn reject(status_code: u16, reason: impl Into<String>) -> Self {
        Self {
            status_code: Some(status_code),
            reason_phrase: Some(reason.into()),
        }
    }
}

/// Factory for emitter-model user agents
#[async_trait]
pub trait RtcStack: Send + Sync {
    async fn create_ua(&self, options: UserAgentOptions) -> Result<Arc<dyn RtcUserAgent>, StackError>;
}

/// One emitter-model user agent
#[async_trait]
pub trait RtcUserAgent: Send + Sync {
    /// Hand out the event receiver; `None` once taken
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RtcUaEvent>>;

    /// Connect and register
    async fn start(&self) -> Result<(), StackError>;

    /// Unregister, close every session and the transport
    async fn stop(&self) -> Result<(), StackError>;

    /// Start an outbound call; signaling begins immediately
    fn call(
        &self,
        target: &Uri,
        constraints: MediaConstraints,
    ) -> Result<Arc<dyn RtcSession>, StackError>;
}

/// One RTC session, inbound or outbound
#[async_trait]
pub trait RtcSession: Send + Sync + fmt::Debug {
    /// `Local` for calls we placed, `Remote` for calls we received
    fn originator(&self) -> Originator;

    fn remote_identity(&self) -> RemoteIdentity;

    fn offered_media(&self) -> MediaConstraints;

    fn is_established(&self) -> bool;

    fn is_ended(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<RtcSessionEvent>;

    fn local_stream(&self) -> Option<MediaStream>;

    fn remote_stream(&self) -> Option<MediaStream>;

    async fn answer(&self, constraints: MediaConstraints) -> Result<(), StackError>;

    async fn terminate(&self, options: TerminateOptions) -> Result<(), StackError>;

    fn mute(&self, options: MuteOptions);

    fn unmute(&self, options: MuteOptions);

    /// Completes once the hold re-INVITE is answered
    async fn hold(&self) -> Result<(), StackError>;

    async fn unhold(&self) -> Result<(), StackError>;

    async fn refer(&self, target: &Uri) -> Result<(), StackError>;

    async fn send_dtmf(&self, tone: DtmfTone) -> Result<(), StackError>;
}
