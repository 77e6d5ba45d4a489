//! Single-call client facade tests

mod common;

use std::sync::Arc;

use common::{credentials, wait_until, Recorder};
use rvoip_easy_sip::stack::loopback::LoopbackStack;
use rvoip_easy_sip::{
    CallOptions, ClientConfig, DtmfTone, ProviderKind, SipClient, SipError, TransferTarget,
};

fn client_with(stack: &LoopbackStack, kind: ProviderKind, recorder: &Arc<Recorder>) -> SipClient {
    SipClient::builder(ClientConfig::new().with_provider(kind))
        .with_loopback(stack.clone())
        .with_user_agent_delegate(recorder.clone())
        .with_register_delegate(recorder.clone())
        .with_log_sink(recorder.clone())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_builder_requires_matching_stack() {
    let stack: Arc<LoopbackStack> = Arc::new(LoopbackStack::new());
    let result = SipClient::builder(ClientConfig::new().with_provider(ProviderKind::Rtc))
        .with_dialog_stack(stack)
        .build();
    assert!(matches!(result, Err(SipError::InvalidConfiguration { .. })));
}

#[tokio::test]
async fn test_builder_rejects_invalid_config() {
    let result = SipClient::builder(ClientConfig::new().with_register_expires(0))
        .with_loopback(LoopbackStack::new())
        .build();
    assert!(matches!(result, Err(SipError::InvalidConfiguration { .. })));
}

#[tokio::test]
async fn test_controls_without_session_are_noops() {
    let stack = LoopbackStack::new();
    let recorder = Recorder::new();
    let client = client_with(&stack, ProviderKind::Dialog, &recorder);

    client.mute().await;
    client.unmute_video().await;
    assert!(client.hold().await.is_ok());
    assert!(client.unhold().await.is_ok());
    assert!(client.send_dtmf(DtmfTone::Digit1).await.is_ok());
    assert!(client.transfer(TransferTarget::from("300")).await.is_ok());
    assert!(client.set_audio_output("default").await.is_ok());
    assert!(client.hangup().await.is_ok());
    assert!(client.current_session().await.is_none());
}

#[tokio::test]
async fn test_register_and_call_through_facade() {
    for kind in [ProviderKind::Dialog, ProviderKind::Rtc] {
        let stack = LoopbackStack::new();
        let recorder = Recorder::new();
        let client = client_with(&stack, kind, &recorder);

        client.register(credentials()).await.unwrap();
        let probe = recorder.clone();
        wait_until("registered", move || probe.has("accept:3600")).await;
        assert!(client.is_registered());
        assert_eq!(client.credentials().unwrap().phone, "1001");
        assert_eq!(client.provider().kind(), kind);

        let session = client.call(CallOptions::new("200")).await.unwrap();
        let native = stack.current().unwrap().last_call().unwrap();
        native.remote_answer();
        let probe = session.clone();
        wait_until("established", move || probe.phase().is_established()).await;

        client.mute().await;
        assert!(session.is_muted());
        client.hold().await.unwrap();
        assert!(session.phase().is_on_hold());
        client.unhold().await.unwrap();
        client.send_dtmf(DtmfTone::Digit5).await.unwrap();
        assert_eq!(native.count_operations("dtmf:5"), 1);

        client.hangup().await.unwrap();
        assert!(client.current_session().await.is_none());
        assert_eq!(native.count_operations("bye"), 1);

        client.unregister().await.unwrap();
        assert!(client.credentials().is_none());
    }
}

#[tokio::test]
async fn test_current_session_cleared_after_remote_hangup() {
    let stack = LoopbackStack::new();
    let recorder = Recorder::new();
    let client = client_with(&stack, ProviderKind::Dialog, &recorder);
    client.register(credentials()).await.unwrap();

    let session = client.call(CallOptions::new("200")).await.unwrap();
    let native = stack.current().unwrap().last_call().unwrap();
    native.remote_answer();
    let probe = session.clone();
    wait_until("established", move || probe.phase().is_established()).await;

    native.remote_hangup();
    let probe = session.clone();
    wait_until("terminated", move || probe.phase().is_terminated()).await;
    assert!(client.current_session().await.is_none());
}

#[tokio::test]
async fn test_invalid_credentials_surface_from_register() {
    let stack = LoopbackStack::new();
    let recorder = Recorder::new();
    let client = client_with(&stack, ProviderKind::Rtc, &recorder);

    let bad = credentials().with_server("http://sip.example.com");
    assert!(matches!(
        client.register(bad).await,
        Err(SipError::InvalidConfiguration { .. })
    ));
    assert!(client.credentials().is_none());
}
