//! `tracing-subscriber` setup for applications and demos

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{SipError, SipResult};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    /// Include file and line information
    pub file_info: bool,
    /// Log span enter/exit
    pub log_spans: bool,
    /// Show raw SIP transport lines (target `rvoip_easy_sip::sip`)
    pub sip_trace: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_info: false,
            log_spans: false,
            sip_trace: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }

    pub fn with_sip_trace(mut self) -> Self {
        self.sip_trace = true;
        self
    }
}

/// Install a global fmt subscriber; fails if one is already installed
pub fn setup_logging(config: LoggingConfig) -> SipResult<()> {
    let mut filter = EnvFilter::from_default_env().add_directive(config.level.into());
    if !config.sip_trace {
        let directive = "rvoip_easy_sip::sip=off"
            .parse()
            .map_err(|e| SipError::internal(format!("invalid log directive: {}", e)))?;
        filter = filter.add_directive(directive);
    }

    let span_events = if config.log_spans {
        FmtSpan::ACTIVE
    } else {
        FmtSpan::NONE
    };

    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info)
        .try_init()
        .map_err(|e| SipError::internal(format!("logging already initialised: {}", e)))
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> SipResult<Level> {
    Level::from_str(level).map_err(|_| SipError::config("log_level", format!("invalid log level: {}", level)))
}
