//! Client and manager configuration
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐
//! │      ClientConfig        │  • provider kind, User-Agent
//! │ ┌──────────────────────┐ │  • REGISTER expiry and extra headers
//! │ │    ManagerConfig     │ │  • raw SIP tracing
//! │ └──────────────────────┘ │
//! └──────────────────────────┘  • DTMF history, log buffer, promotion
//! ```
//!
//! # Usage Examples
//!
//! ```rust
//! use rvoip_easy_sip::{ClientConfig, PromotionPolicy, ProviderKind};
//!
//! let config = ClientConfig::new()
//!     .with_provider(ProviderKind::Rtc)
//!     .with_user_agent("Desk/1.0")
//!     .with_register_expires(600)
//!     .with_promotion_policy(PromotionPolicy::Resume);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.manager.dtmf_history_limit, 10);
//! ```
//!
//! Configuration can also be loaded from JSON; missing fields take their
//! defaults:
//!
//! ```rust
//! use rvoip_easy_sip::ClientConfig;
//!
//! let config = ClientConfig::from_json(r#"{ "provider": "rtc", "trace_sip": false }"#).unwrap();
//! assert!(!config.trace_sip);
//! assert_eq!(config.register_expires, 3600);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{SipError, SipResult};
use crate::provider::{ProviderKind, ProviderOptions};
use crate::types::DEFAULT_USER_AGENT;

/// What happens to the session promoted after the active one terminates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromotionPolicy {
    /// Promoted session becomes the active id but stays held
    #[default]
    KeepOnHold,
    /// Promoted session is taken off hold
    Resume,
}

/// Multi-session manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// DTMF tones kept per session
    pub dtmf_history_limit: usize,
    /// Log entries kept by the event bridge
    pub log_capacity: usize,
    /// Buffered bridge events per subscriber
    pub event_capacity: usize,
    pub promotion_policy: PromotionPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            dtmf_history_limit: 10,
            log_capacity: 500,
            event_capacity: 256,
            promotion_policy: PromotionPolicy::default(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Native stack model to drive
    pub provider: ProviderKind,
    /// User-Agent header value
    pub user_agent: String,
    /// REGISTER expiry in seconds
    pub register_expires: u32,
    /// Extra `Name: value` headers added to REGISTER
    pub extra_headers: Vec<String>,
    /// Forward raw transport lines to the log sink
    pub trace_sip: bool,
    pub manager: ManagerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            register_expires: 3600,
            extra_headers: Vec::new(),
            trace_sip: true,
            manager: ManagerConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document and validate it
    pub fn from_json(json: &str) -> SipResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SipError::config("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_register_expires(mut self, expires: u32) -> Self {
        self.register_expires = expires;
        self
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.extra_headers.push(header.into());
        self
    }

    pub fn with_trace_sip(mut self, trace: bool) -> Self {
        self.trace_sip = trace;
        self
    }

    pub fn with_dtmf_history_limit(mut self, limit: usize) -> Self {
        self.manager.dtmf_history_limit = limit;
        self
    }

    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.manager.log_capacity = capacity;
        self
    }

    pub fn with_promotion_policy(mut self, policy: PromotionPolicy) -> Self {
        self.manager.promotion_policy = policy;
        self
    }

    /// Check values that would otherwise fail late inside the stack
    pub fn validate(&self) -> SipResult<()> {
        if self.user_agent.trim().is_empty() {
            return Err(SipError::config("user_agent", "must not be empty"));
        }
        if self.register_expires == 0 {
            return Err(SipError::config("register_expires", "must be greater than zero"));
        }
        for header in &self.extra_headers {
            match header.split_once(':') {
                Some((name, _)) if !name.trim().is_empty() && !name.contains(char::is_whitespace) => {}
                _ => {
                    return Err(SipError::config(
                        "extra_headers",
                        format!("'{}' is not a 'Name: value' header", header),
                    ))
                }
            }
        }
        if self.manager.dtmf_history_limit == 0 {
            return Err(SipError::config("dtmf_history_limit", "must be greater than zero"));
        }
        if self.manager.event_capacity == 0 {
            return Err(SipError::config("event_capacity", "must be greater than zero"));
        }
        Ok(())
    }

    pub(crate) fn provider_options(&self) -> ProviderOptions {
        ProviderOptions {
            user_agent: self.user_agent.clone(),
            register_expires: self.register_expires,
            extra_headers: self.extra_headers.clone(),
            trace_sip: self.trace_sip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.provider, ProviderKind::Dialog);
        assert_eq!(config.manager.promotion_policy, PromotionPolicy::KeepOnHold);
        assert!(config.user_agent.starts_with("rvoip-easy-sip/"));
    }

    #[test]
    fn test_rejects_bad_header() {
        let config = ClientConfig::new().with_header("not a header");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SipError::InvalidConfiguration { ref field, .. } if field == "extra_headers"));
        assert!(ClientConfig::new().with_header("X-Tenant: 42").validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_limits() {
        assert!(ClientConfig::new().with_register_expires(0).validate().is_err());
        assert!(ClientConfig::new().with_dtmf_history_limit(0).validate().is_err());
    }

    #[test]
    fn test_json_partial_document() {
        let config = ClientConfig::from_json(
            r#"{ "provider": "rtc", "manager": { "promotion_policy": "resume" } }"#,
        )
        .unwrap();
        assert_eq!(config.provider, ProviderKind::Rtc);
        assert_eq!(config.manager.promotion_policy, PromotionPolicy::Resume);
        assert_eq!(config.manager.dtmf_history_limit, 10);

        assert!(ClientConfig::from_json("{ not json").is_err());
    }

    #[test]
    fn test_provider_options_follow_config() {
        let options = ClientConfig::new()
            .with_user_agent("Desk/1.0")
            .with_trace_sip(false)
            .provider_options();
        assert_eq!(options.user_agent, "Desk/1.0");
        assert!(!options.trace_sip);
    }
}
