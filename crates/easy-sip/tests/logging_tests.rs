//! Global subscriber installation; kept in its own binary since it
//! claims the process-wide default

#![cfg(feature = "logging")]

use rvoip_easy_sip::logging::{setup_logging, LoggingConfig};
use rvoip_easy_sip::SipError;
use serial_test::serial;
use tracing::Level;

#[test]
#[serial]
fn test_second_install_is_refused() {
    let _ = setup_logging(LoggingConfig::new(Level::DEBUG).with_file_info().with_sip_trace());

    let again = setup_logging(LoggingConfig::default());
    assert!(matches!(again, Err(SipError::Internal { .. })));
}

#[test]
#[serial]
fn test_quiet_sip_directive_is_accepted() {
    // Only an already-installed subscriber may fail here, never the filter
    match setup_logging(LoggingConfig::new(Level::WARN).with_spans()) {
        Ok(()) | Err(SipError::Internal { .. }) => {}
        Err(other) => panic!("unexpected error: {}", other),
    }
}
