//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep, timeout};

use rvoip_easy_sip::provider::{InboundMessage, Invitation, RegisterDelegate, UserAgentDelegate};
use rvoip_easy_sip::stack::loopback::LoopbackStack;
use rvoip_easy_sip::stack::TraceLine;
use rvoip_easy_sip::{
    ClientConfig, ConnectionState, Credentials, LogSink, ManagerSnapshot, ProviderKind, SessionDelegate,
    SessionManager, SipError,
};

pub const WAIT: Duration = Duration::from_secs(2);

pub fn credentials() -> Credentials {
    Credentials::new("example.com", "1001", "secret").with_server("wss://sip.example.com/ws")
}

/// Poll `condition` until it holds, panicking after [`WAIT`]
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let polled = timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

/// Wait for a snapshot matching `predicate`
pub async fn wait_snapshot<F>(manager: &SessionManager, what: &str, predicate: F) -> ManagerSnapshot
where
    F: Fn(&ManagerSnapshot) -> bool,
{
    let mut updates = manager.subscribe();
    let result = timeout(WAIT, updates.wait_for(|s| predicate(s))).await;
    match result {
        Ok(Ok(snapshot)) => snapshot.clone(),
        _ => panic!("timed out waiting for {}: {:?}", what, manager.snapshot()),
    }
}

/// Manager over a loopback stack, registered and ready
pub async fn registered_manager(kind: ProviderKind, config: ClientConfig) -> (SessionManager, LoopbackStack) {
    let stack = LoopbackStack::new();
    let manager = SessionManager::builder(config.with_provider(kind))
        .with_loopback(stack.clone())
        .build()
        .unwrap();
    manager.register(credentials()).await.unwrap();
    wait_snapshot(&manager, "registration", |s| s.state == ConnectionState::Registered).await;
    (manager, stack)
}

/// Records every delegate callback as a short label
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
    invitations: Mutex<Vec<Invitation>>,
    traces: Mutex<Vec<TraceLine>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn has(&self, label: &str) -> bool {
        self.events.lock().iter().any(|e| e == label)
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.events.lock().iter().any(|e| e.starts_with(prefix))
    }

    pub fn invitations(&self) -> Vec<Invitation> {
        self.invitations.lock().clone()
    }

    pub fn traces(&self) -> Vec<TraceLine> {
        self.traces.lock().clone()
    }

    fn push(&self, label: impl Into<String>) {
        self.events.lock().push(label.into());
    }
}

impl UserAgentDelegate for Recorder {
    fn on_connect(&self) {
        self.push("connect");
    }

    fn on_disconnect(&self, error: Option<SipError>) {
        match error {
            Some(e) => self.push(format!("disconnect:{}", e.category())),
            None => self.push("disconnect"),
        }
    }

    fn on_invite(&self, invitation: Invitation) {
        self.push(format!("invite:{}", invitation.remote_user()));
        self.invitations.lock().push(invitation);
    }

    fn on_message(&self, message: InboundMessage) {
        self.push(format!("message:{}", message.body));
    }
}

impl RegisterDelegate for Recorder {
    fn on_accept(&self, expires: u32) {
        self.push(format!("accept:{}", expires));
    }

    fn on_reject(&self, error: SipError) {
        match error {
            SipError::RegistrationRejected { status: Some(status), .. } => self.push(format!("reject:{}", status)),
            other => self.push(format!("reject:{}", other.category())),
        }
    }

    fn on_trying(&self) {
        self.push("trying");
    }

    fn on_redirect(&self, contact: String) {
        self.push(format!("redirect:{}", contact));
    }
}

impl SessionDelegate for Recorder {
    fn on_established(&self) {
        self.push("established");
    }

    fn on_terminate(&self) {
        self.push("terminate");
    }

    fn on_dtmf(&self, tone: rvoip_easy_sip::DtmfTone) {
        self.push(format!("dtmf:{}", tone));
    }
}

impl LogSink for Recorder {
    fn log(&self, line: &TraceLine) {
        self.traces.lock().push(line.clone());
    }
}
