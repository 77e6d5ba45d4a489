//! Log and lifecycle event bridge
//!
//! [`EventBridge`] is the manager's [`LogSink`]: raw signaling trace lines
//! are classified into display kinds, kept in a bounded buffer for log
//! viewers, broadcast to subscribers together with lifecycle events, and
//! mirrored to `tracing`.
//!
//! | trace category | content | kind |
//! |----------------|---------|------|
//! | `sip.Transport` | starts with `Sending` | [`LogKind::SipOut`] |
//! | `sip.Transport` | anything else | [`LogKind::SipIn`] |
//! | `sip.UserAgent`, `sip.Registerer` | `[category] content` | [`LogKind::Ws`] |
//! | other | | [`LogKind::Info`] |

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info};

use crate::provider::LogSink;
use crate::stack::{TraceLine, CATEGORY_REGISTERER, CATEGORY_TRANSPORT, CATEGORY_USER_AGENT};
use crate::types::{ConnectionState, DtmfTone, SessionId};

/// Target used when mirroring raw SIP lines to `tracing`
pub const SIP_TRACE_TARGET: &str = "rvoip_easy_sip::sip";

/// Display kind of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogKind {
    Info,
    Error,
    /// Inbound SIP message
    SipIn,
    /// Outbound SIP message
    SipOut,
    /// Transport / user agent lifecycle
    Ws,
}

/// One entry of the log buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub message: String,
    pub kind: LogKind,
}

impl LogEntry {
    pub fn new(kind: LogKind, message: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            message: message.into(),
            kind,
        }
    }

    /// `HH:MM:SS` wall-clock label
    pub fn time_label(&self) -> String {
        self.time.format("%H:%M:%S").to_string()
    }
}

/// Manager lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    StateChanged(ConnectionState),
    IncomingCall { remote_user: String, display_name: String, video: bool },
    IncomingCleared,
    SessionAdded(SessionId),
    SessionRemoved(SessionId),
    ActiveChanged(Option<SessionId>),
    DtmfReceived { session_id: SessionId, tone: DtmfTone },
}

/// Everything a bridge subscriber receives
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Log(LogEntry),
    Lifecycle(LifecycleEvent),
}

/// Bounded log buffer plus broadcast fan-out
#[derive(Debug)]
pub struct EventBridge {
    logs: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    events: broadcast::Sender<BridgeEvent>,
}

impl EventBridge {
    pub fn new(log_capacity: usize, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            logs: Mutex::new(VecDeque::with_capacity(log_capacity.min(1024))),
            capacity: log_capacity,
            events,
        }
    }

    /// Kind and display text for a raw trace line
    pub fn classify(line: &TraceLine) -> (LogKind, String) {
        match line.category.as_str() {
            CATEGORY_TRANSPORT => {
                let kind = if line.content.starts_with("Sending") {
                    LogKind::SipOut
                } else {
                    LogKind::SipIn
                };
                (kind, line.content.clone())
            }
            CATEGORY_USER_AGENT | CATEGORY_REGISTERER => {
                (LogKind::Ws, format!("[{}] {}", line.category, line.content))
            }
            _ => (LogKind::Info, line.content.clone()),
        }
    }

    pub fn push(&self, kind: LogKind, message: impl Into<String>) {
        let entry = LogEntry::new(kind, message);
        match kind {
            LogKind::SipIn | LogKind::SipOut => {
                debug!(target: SIP_TRACE_TARGET, kind = ?kind, "{}", entry.message)
            }
            LogKind::Ws => debug!(kind = ?kind, "{}", entry.message),
            LogKind::Info => info!("{}", entry.message),
            LogKind::Error => error!("{}", entry.message),
        }
        {
            let mut logs = self.logs.lock();
            if self.capacity > 0 {
                while logs.len() >= self.capacity {
                    logs.pop_front();
                }
                logs.push_back(entry.clone());
            }
        }
        let _ = self.events.send(BridgeEvent::Log(entry));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(LogKind::Info, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(LogKind::Error, message);
    }

    pub fn ws(&self, message: impl Into<String>) {
        self.push(LogKind::Ws, message);
    }

    pub fn emit(&self, event: LifecycleEvent) {
        debug!(event = ?event, "Lifecycle event");
        let _ = self.events.send(BridgeEvent::Lifecycle(event));
    }

    /// Buffered entries, oldest first
    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.lock().iter().cloned().collect()
    }

    pub fn clear_logs(&self) {
        self.logs.lock().clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Subscription as a stream; lagged gaps are skipped
    pub fn stream(&self) -> impl Stream<Item = BridgeEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| event.ok())
    }
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new(500, 256)
    }
}

impl LogSink for EventBridge {
    fn log(&self, line: &TraceLine) {
        let (kind, message) = Self::classify(line);
        self.push(kind, message);
    }
}
