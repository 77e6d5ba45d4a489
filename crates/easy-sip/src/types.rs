//! Shared data types
//!
//! Credentials, connection and session states, DTMF tones, call options and
//! SIP address helpers used by every layer of the crate.

use std::fmt;
use std::str::FromStr;

use rvoip_sip_core::Uri;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SipError, SipResult};
use crate::media::MediaBindings;

/// Default User-Agent header value
pub const DEFAULT_USER_AGENT: &str = concat!("rvoip-easy-sip/", env!("CARGO_PKG_VERSION"));

// ===== IDENTIFIERS =====

/// Unique identifier of one call leg
///
/// Generated from a random v4 UUID; uniqueness only needs to hold for the
/// lifetime of one manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ===== CREDENTIALS =====

/// Registration credentials for one endpoint
///
/// Immutable for the duration of a registration attempt. The address of
/// record is `sip:{phone}@{domain}`.
///
/// # Examples
///
/// ```rust
/// use rvoip_easy_sip::Credentials;
///
/// let creds = Credentials::new("example.com", "1001", "secret")
///     .with_server("wss://sip.example.com:8089/ws")
///     .with_display_name("Front Desk");
///
/// assert_eq!(creds.address_of_record(), "sip:1001@example.com");
/// assert_eq!(creds.effective_display_name(), "Front Desk");
/// assert!(creds.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// SIP domain of the registrar
    pub domain: String,
    /// Extension / user part
    pub phone: String,
    /// Digest authentication secret
    pub secret: String,
    /// Display name; the extension is used when absent
    #[serde(default)]
    pub display_name: Option<String>,
    /// Signaling server address (`ws://` or `wss://`)
    #[serde(default)]
    pub server: Option<String>,
    /// User-Agent header override
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Credentials {
    /// Create credentials without a server address or display name
    pub fn new(domain: impl Into<String>, phone: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            phone: phone.into(),
            secret: secret.into(),
            display_name: None,
            server: None,
            user_agent: None,
        }
    }

    /// Set the signaling server address
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    /// Set the display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Set the User-Agent header override
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// The `sip:{phone}@{domain}` address of record as text
    pub fn address_of_record(&self) -> String {
        format!("sip:{}@{}", self.phone, self.domain)
    }

    /// Display name, falling back to the extension
    pub fn effective_display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.phone)
    }

    /// Validate the credentials and parse the address of record
    ///
    /// Runs before any network I/O so malformed input fails synchronously.
    pub fn validate(&self) -> SipResult<Uri> {
        check_token("domain", &self.domain)?;
        check_token("phone", &self.phone)?;
        if self.phone.contains('@') || self.phone.contains(':') {
            return Err(SipError::config("phone", "must be a bare extension"));
        }
        if let Some(server) = &self.server {
            let parsed = url::Url::parse(server)
                .map_err(|e| SipError::config("server", format!("{}: {}", server, e)))?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                return Err(SipError::config(
                    "server",
                    format!("unsupported scheme '{}', expected ws or wss", parsed.scheme()),
                ));
            }
        }
        let aor = self.address_of_record();
        aor.parse::<Uri>()
            .map_err(|e| SipError::config("address", format!("{}: {}", aor, e)))
    }
}

fn check_token(field: &str, value: &str) -> SipResult<()> {
    if value.trim().is_empty() {
        return Err(SipError::config(field, "must not be empty"));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(SipError::config(field, "must not contain whitespace"));
    }
    Ok(())
}

/// Normalize a dialed destination into a SIP URI
///
/// - `sip:`, `sips:` and `tel:` URIs are parsed as given
/// - `user@host` gets a `sip:` prefix
/// - a bare extension is qualified with `default_domain`
///
/// # Examples
///
/// ```rust
/// use rvoip_easy_sip::types::normalize_target;
///
/// let uri = normalize_target("200", Some("example.com")).unwrap();
/// assert_eq!(uri.user.as_deref(), Some("200"));
///
/// assert!(normalize_target("200", None).is_err());
/// assert!(normalize_target("two hundred", Some("example.com")).is_err());
/// ```
pub fn normalize_target(destination: &str, default_domain: Option<&str>) -> SipResult<Uri> {
    let dest = destination.trim();
    if dest.is_empty() {
        return Err(SipError::invalid_target(destination, "empty address"));
    }
    if dest.chars().any(char::is_whitespace) {
        return Err(SipError::invalid_target(destination, "address contains whitespace"));
    }

    let lowered = dest.to_ascii_lowercase();
    let text = if lowered.starts_with("sip:") || lowered.starts_with("sips:") || lowered.starts_with("tel:") {
        dest.to_string()
    } else if dest.contains('@') {
        format!("sip:{}", dest)
    } else {
        match default_domain {
            Some(domain) if !domain.trim().is_empty() => format!("sip:{}@{}", dest, domain),
            _ => {
                return Err(SipError::invalid_target(
                    destination,
                    "bare extension needs a registered domain",
                ))
            }
        }
    };

    text.parse::<Uri>()
        .map_err(|e| SipError::invalid_target(destination, e.to_string()))
}

// ===== STATES =====

/// Connection state of one client/manager
///
/// Changed only through provider and manager events, never set by a UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// Nothing registered yet
    Idle,
    /// Transport opening / REGISTER in flight
    Connecting,
    /// Registrar accepted the endpoint
    Registered,
    /// An outbound call is ringing
    Calling,
    /// At least one call is established
    InCall,
    /// Registration rejected or transport lost
    Error,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Idle
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Registered => "registered",
            ConnectionState::Calling => "calling",
            ConnectionState::InCall => "in-call",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// UI-facing status of a tracked session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    /// Outbound call not yet answered
    Calling,
    /// The one session currently carrying media
    Active,
    /// Held, or displaced by another active session
    OnHold,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Calling => "calling",
            SessionStatus::Active => "active",
            SessionStatus::OnHold => "on-hold",
        };
        f.write_str(s)
    }
}

/// Which side originated a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Placed by this endpoint
    Outgoing,
    /// Received from a remote party
    Incoming,
}

// ===== DTMF =====

/// One DTMF key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtmfTone {
    Digit0,
    Digit1,
    Digit2,
    Digit3,
    Digit4,
    Digit5,
    Digit6,
    Digit7,
    Digit8,
    Digit9,
    Star,
    Pound,
    A,
    B,
    C,
    D,
}

impl DtmfTone {
    /// The keypad character for this tone
    pub fn to_char(self) -> char {
        match self {
            Self::Digit0 => '0',
            Self::Digit1 => '1',
            Self::Digit2 => '2',
            Self::Digit3 => '3',
            Self::Digit4 => '4',
            Self::Digit5 => '5',
            Self::Digit6 => '6',
            Self::Digit7 => '7',
            Self::Digit8 => '8',
            Self::Digit9 => '9',
            Self::Star => '*',
            Self::Pound => '#',
            Self::A => 'A',
            Self::B => 'B',
            Self::C => 'C',
            Self::D => 'D',
        }
    }

    /// Parse a keypad character
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '0' => Some(Self::Digit0),
            '1' => Some(Self::Digit1),
            '2' => Some(Self::Digit2),
            '3' => Some(Self::Digit3),
            '4' => Some(Self::Digit4),
            '5' => Some(Self::Digit5),
            '6' => Some(Self::Digit6),
            '7' => Some(Self::Digit7),
            '8' => Some(Self::Digit8),
            '9' => Some(Self::Digit9),
            '*' => Some(Self::Star),
            '#' => Some(Self::Pound),
            'A' | 'a' => Some(Self::A),
            'B' | 'b' => Some(Self::B),
            'C' | 'c' => Some(Self::C),
            'D' | 'd' => Some(Self::D),
            _ => None,
        }
    }
}

impl fmt::Display for DtmfTone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_char())
    }
}

impl FromStr for DtmfTone {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Self::from_char(c)
                .ok_or_else(|| SipError::invalid_target(s, "not a DTMF key")),
            _ => Err(SipError::invalid_target(s, "expected exactly one DTMF key")),
        }
    }
}

// ===== CALL OPTIONS =====

/// Options for placing an outbound call
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Destination address or extension
    pub destination: String,
    /// Media elements to bind
    pub media: MediaBindings,
    /// Offer video in addition to audio
    pub video: bool,
}

impl CallOptions {
    /// Audio-only call to `destination`
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            ..Default::default()
        }
    }

    /// Offer video
    pub fn with_video(mut self, video: bool) -> Self {
        self.video = video;
        self
    }

    /// Bind local/remote media elements
    pub fn with_media(mut self, media: MediaBindings) -> Self {
        self.media = media;
        self
    }
}

/// Options for answering an invitation
///
/// `video` is local policy: an offer with video answered with `video: false`
/// yields an audio-only session.
#[derive(Debug, Clone, Default)]
pub struct AnswerOptions {
    /// Media elements to bind
    pub media: MediaBindings,
    /// Accept video
    pub video: bool,
}

impl AnswerOptions {
    /// Audio-only answer
    pub fn audio_only() -> Self {
        Self::default()
    }

    /// Accept video
    pub fn with_video(mut self, video: bool) -> Self {
        self.video = video;
        self
    }

    /// Bind local/remote media elements
    pub fn with_media(mut self, media: MediaBindings) -> Self {
        self.media = media;
        self
    }
}
