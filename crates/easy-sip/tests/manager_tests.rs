//! Multi-session manager behaviour over the loopback stack

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{credentials, registered_manager, wait_snapshot, WAIT};
use rvoip_easy_sip::media::{AudioOutputDevice, MediaKind};
use rvoip_easy_sip::stack::loopback::{
    LoopbackBehavior, LoopbackCall, LoopbackDevices, LoopbackStack, RegistrationBehavior,
};
use rvoip_easy_sip::{
    AnswerOptions, BridgeEvent, CallOptions, ClientConfig, ConnectionState, Credentials, DtmfTone,
    LifecycleEvent, LogKind, PromotionPolicy, ProviderKind, SessionId, SessionManager, SessionStatus,
    SipError,
};
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tracing_test::traced_test;

async fn manager(kind: ProviderKind) -> (SessionManager, LoopbackStack) {
    registered_manager(kind, ClientConfig::new()).await
}

/// Place a call and let the remote side answer it
async fn answered_call(
    manager: &SessionManager,
    stack: &LoopbackStack,
    destination: &str,
) -> (SessionId, Arc<LoopbackCall>) {
    let id = manager.call(CallOptions::new(destination)).await.unwrap();
    let native = stack.current().unwrap().last_call().unwrap();
    native.remote_answer();
    let watched = id.clone();
    wait_snapshot(manager, "call answered", move |s| {
        s.status_of(&watched) == Some(SessionStatus::Active)
    })
    .await;
    (id, native)
}

fn status(manager: &SessionManager, id: &SessionId) -> Option<SessionStatus> {
    manager.snapshot().status_of(id)
}

#[tokio::test]
async fn test_scenario_a_second_call_holds_first() {
    for kind in [ProviderKind::Dialog, ProviderKind::Rtc] {
        let (manager, stack) = manager(kind).await;

        let first = manager.call(CallOptions::new("200")).await.unwrap();
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.sessions.len(), 1);
        assert_eq!(snapshot.sessions[0].status, SessionStatus::Calling);
        assert_eq!(snapshot.sessions[0].remote_user, "200");
        assert_eq!(snapshot.state, ConnectionState::Calling);
        assert!(snapshot.call_active);

        let first_native = stack.current().unwrap().last_call().unwrap();
        first_native.remote_answer();
        let watched = first.clone();
        let snapshot = wait_snapshot(&manager, "first answered", move |s| {
            s.status_of(&watched) == Some(SessionStatus::Active)
        })
        .await;
        assert_eq!(snapshot.state, ConnectionState::InCall);

        let second = manager.call(CallOptions::new("300")).await.unwrap();
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.sessions.len(), 2);
        assert_eq!(snapshot.status_of(&first), Some(SessionStatus::OnHold));
        assert_eq!(snapshot.active_session_id, Some(second.clone()));
        assert_eq!(first_native.count_operations("reinvite:hold"), 1);
        assert!(first_native.is_held());

        stack.current().unwrap().last_call().unwrap().remote_answer();
        let watched = second.clone();
        let snapshot = wait_snapshot(&manager, "second answered", move |s| {
            s.status_of(&watched) == Some(SessionStatus::Active)
        })
        .await;
        assert_eq!(snapshot.status_of(&first), Some(SessionStatus::OnHold));
        assert_eq!(snapshot.active_count(), 1);
    }
}

#[tokio::test]
async fn test_scenario_b_switch_session() {
    let (manager, stack) = manager(ProviderKind::Dialog).await;
    let (held, held_native) = answered_call(&manager, &stack, "200").await;
    let (active, active_native) = answered_call(&manager, &stack, "300").await;
    assert_eq!(status(&manager, &held), Some(SessionStatus::OnHold));

    manager.switch_session(&held).await.unwrap();

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.status_of(&active), Some(SessionStatus::OnHold));
    assert_eq!(snapshot.status_of(&held), Some(SessionStatus::Active));
    assert_eq!(snapshot.active_session_id, Some(held.clone()));
    assert!(!snapshot.is_on_hold);
    assert!(active_native.is_held());
    assert!(!held_native.is_held());
    assert_eq!(held_native.count_operations("reinvite:unhold"), 1);
}

#[tokio::test]
async fn test_switch_to_active_session_is_noop() {
    let (manager, stack) = manager(ProviderKind::Dialog).await;
    let (id, native) = answered_call(&manager, &stack, "200").await;
    let before = manager.snapshot();

    manager.switch_session(&id).await.unwrap();

    assert_eq!(native.count_operations("reinvite"), 0);
    assert_eq!(manager.snapshot(), before);
}

#[tokio::test]
async fn test_switch_to_unknown_session() {
    let (manager, _stack) = manager(ProviderKind::Dialog).await;
    let result = manager.switch_session(&SessionId::from("missing")).await;
    assert!(matches!(result, Err(SipError::SessionNotFound { .. })));
}

#[tokio::test]
async fn test_scenario_c_local_video_policy_wins() {
    for kind in [ProviderKind::Dialog, ProviderKind::Rtc] {
        let (manager, stack) = manager(kind).await;

        stack.incoming_call("2002", Some("Bob"), true).unwrap();
        let snapshot = wait_snapshot(&manager, "incoming call", |s| s.incoming.is_some()).await;
        let incoming = snapshot.incoming.unwrap();
        assert_eq!(incoming.display_name, "Bob");
        assert!(incoming.video);

        let invitation = manager.incoming_invitation().unwrap();
        let id = manager
            .answer(&invitation, AnswerOptions::default().with_video(false))
            .await
            .unwrap();

        let session = manager.session(&id).unwrap();
        assert!(!session.has_video());
        let snapshot = manager.snapshot();
        let entry = snapshot.session(&id).unwrap();
        assert!(!entry.with_video);
        assert_eq!(entry.status, SessionStatus::Active);
        assert_eq!(entry.remote_user, "2002");
        assert_eq!(snapshot.state, ConnectionState::InCall);
        assert!(snapshot.incoming.is_none());
        assert!(manager.incoming_invitation().is_none());

        let native = stack.current().unwrap().last_call().unwrap();
        assert!(!native.local_media().unwrap().has_video());
    }
}

#[tokio::test]
#[traced_test]
async fn test_scenario_d_rejected_hold_changes_nothing() {
    let (manager, stack) = manager(ProviderKind::Dialog).await;
    let (id, native) = answered_call(&manager, &stack, "200").await;
    native.set_reject_renegotiation(true);

    let result = manager.toggle_hold().await;
    assert!(matches!(result, Err(SipError::RenegotiationFailed { .. })));

    let snapshot = manager.snapshot();
    assert!(!snapshot.is_on_hold);
    assert_eq!(snapshot.status_of(&id), Some(SessionStatus::Active));
    assert!(native.local_media().unwrap().all_enabled(MediaKind::Audio));
    assert!(manager
        .logs()
        .iter()
        .any(|entry| entry.kind == LogKind::Error && entry.message.starts_with("Failed to hold call")));
    assert!(logs_contain("Failed to hold call"));
}

#[tokio::test]
async fn test_toggle_hold_round_trip() {
    let (manager, stack) = manager(ProviderKind::Rtc).await;
    let (id, native) = answered_call(&manager, &stack, "200").await;

    assert!(manager.toggle_hold().await.unwrap());
    let snapshot = manager.snapshot();
    assert!(snapshot.is_on_hold);
    assert_eq!(snapshot.status_of(&id), Some(SessionStatus::OnHold));
    assert!(native.is_held());

    assert!(!manager.toggle_hold().await.unwrap());
    let snapshot = manager.snapshot();
    assert!(!snapshot.is_on_hold);
    assert_eq!(snapshot.status_of(&id), Some(SessionStatus::Active));
}

#[tokio::test]
async fn test_sole_session_termination_resets_state() {
    let (manager, stack) = manager(ProviderKind::Dialog).await;
    let (_id, native) = answered_call(&manager, &stack, "200").await;

    native.remote_hangup();
    let snapshot = wait_snapshot(&manager, "call removed", |s| s.sessions.is_empty()).await;
    assert_eq!(snapshot.active_session_id, None);
    assert_eq!(snapshot.state, ConnectionState::Registered);
    assert!(!snapshot.call_active);
    assert_eq!(manager.session_count(), 0);
}

#[tokio::test]
async fn test_rejected_outbound_call_is_removed() {
    let (manager, stack) = manager(ProviderKind::Rtc).await;
    manager.call(CallOptions::new("200")).await.unwrap();

    stack.current().unwrap().last_call().unwrap().remote_reject(486);
    let snapshot = wait_snapshot(&manager, "call removed", |s| s.sessions.is_empty()).await;
    assert_eq!(snapshot.state, ConnectionState::Registered);
}

#[tokio::test]
async fn test_non_active_termination_keeps_active() {
    let (manager, stack) = manager(ProviderKind::Dialog).await;
    let (held, held_native) = answered_call(&manager, &stack, "200").await;
    let (active, _) = answered_call(&manager, &stack, "300").await;

    held_native.remote_hangup();
    let watched = held.clone();
    let snapshot = wait_snapshot(&manager, "held call removed", move |s| s.session(&watched).is_none()).await;
    assert_eq!(snapshot.active_session_id, Some(active.clone()));
    assert_eq!(snapshot.status_of(&active), Some(SessionStatus::Active));
    assert_eq!(snapshot.state, ConnectionState::InCall);
}

#[tokio::test]
async fn test_active_termination_promotes_first_remaining_on_hold() {
    let (manager, stack) = manager(ProviderKind::Dialog).await;
    let (first, first_native) = answered_call(&manager, &stack, "200").await;
    let (_second, _) = answered_call(&manager, &stack, "300").await;

    manager.hangup().await.unwrap();
    let snapshot = wait_snapshot(&manager, "second removed", |s| s.sessions.len() == 1).await;
    assert_eq!(snapshot.active_session_id, Some(first.clone()));
    assert_eq!(snapshot.status_of(&first), Some(SessionStatus::OnHold));
    assert!(snapshot.is_on_hold);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(first_native.count_operations("reinvite:unhold"), 0);
    assert!(first_native.is_held());
}

#[tokio::test]
async fn test_resume_policy_unholds_promoted_session() {
    let config = ClientConfig::new().with_promotion_policy(PromotionPolicy::Resume);
    let (manager, stack) = registered_manager(ProviderKind::Dialog, config).await;
    let (first, first_native) = answered_call(&manager, &stack, "200").await;
    let (_second, _) = answered_call(&manager, &stack, "300").await;

    manager.hangup().await.unwrap();
    let watched = first.clone();
    let snapshot = wait_snapshot(&manager, "first resumed", move |s| {
        s.status_of(&watched) == Some(SessionStatus::Active)
    })
    .await;
    assert_eq!(snapshot.active_session_id, Some(first));
    assert!(!snapshot.is_on_hold);
    assert_eq!(first_native.count_operations("reinvite:unhold"), 1);
    assert!(!first_native.is_held());
}

#[tokio::test]
async fn test_dtmf_history_is_per_session_and_capped() {
    let (manager, stack) = manager(ProviderKind::Dialog).await;
    let (held, held_native) = answered_call(&manager, &stack, "200").await;
    let (active, _) = answered_call(&manager, &stack, "300").await;

    for c in "0123456789*#".chars() {
        held_native.remote_dtmf(DtmfTone::from_char(c).unwrap());
    }
    let watched = held.clone();
    let snapshot = wait_snapshot(&manager, "dtmf recorded", move |s| {
        s.session(&watched).is_some_and(|e| e.dtmf_history.as_keys().ends_with('#'))
    })
    .await;
    let history = &snapshot.session(&held).unwrap().dtmf_history;
    assert_eq!(history.len(), 10);
    assert_eq!(history.as_keys(), "23456789*#");
    assert!(snapshot.session(&active).unwrap().dtmf_history.is_empty());
    assert_eq!(snapshot.active_session_id, Some(active));
}

#[tokio::test]
async fn test_send_dtmf_targets_active_session() {
    let (manager, stack) = manager(ProviderKind::Rtc).await;
    let (_held, held_native) = answered_call(&manager, &stack, "200").await;
    let (_active, active_native) = answered_call(&manager, &stack, "300").await;

    manager.send_dtmf(DtmfTone::Digit4).await.unwrap();
    assert_eq!(active_native.count_operations("dtmf:4"), 1);
    assert_eq!(held_native.count_operations("dtmf:"), 0);
    assert!(manager.logs().iter().any(|e| e.message == "Sending DTMF: 4"));
}

#[tokio::test]
async fn test_mute_toggles_follow_active_session() {
    let (manager, stack) = manager(ProviderKind::Dialog).await;
    let (first, _) = answered_call(&manager, &stack, "200").await;

    assert!(manager.toggle_mute().await);
    assert!(manager.snapshot().is_muted);
    assert!(manager.session(&first).unwrap().is_muted());

    let (second, _) = answered_call(&manager, &stack, "300").await;
    assert!(!manager.snapshot().is_muted, "toggles reset for a new call");
    assert!(!manager.session(&second).unwrap().is_muted());

    manager.switch_session(&first).await.unwrap();
    assert!(manager.snapshot().is_muted, "toggles re-derived from the target");

    assert!(!manager.toggle_mute().await);
    assert!(!manager.session(&first).unwrap().is_muted());
}

#[tokio::test]
async fn test_video_mute_toggle() {
    let (manager, stack) = manager(ProviderKind::Rtc).await;
    let id = manager.call(CallOptions::new("200").with_video(true)).await.unwrap();
    let native = stack.current().unwrap().last_call().unwrap();
    native.remote_answer();
    let watched = id.clone();
    wait_snapshot(&manager, "call answered", move |s| {
        s.status_of(&watched) == Some(SessionStatus::Active)
    })
    .await;

    assert!(manager.toggle_mute_video().await);
    assert!(manager.snapshot().is_muted_video);
    assert!(manager.session(&id).unwrap().is_video_muted());
    assert_eq!(native.count_operations("mute:video"), 1);
}

#[tokio::test]
async fn test_toggles_without_session() {
    let (manager, _stack) = manager(ProviderKind::Dialog).await;
    assert!(!manager.toggle_mute().await);
    assert!(!manager.toggle_hold().await.unwrap());
    assert!(manager.send_dtmf(DtmfTone::Digit1).await.is_ok());
    assert!(manager.hangup().await.is_ok());
}

#[tokio::test]
async fn test_incoming_call_cancelled_by_caller() {
    let (manager, stack) = manager(ProviderKind::Dialog).await;

    let native = stack.incoming_call("2002", None, false).unwrap();
    wait_snapshot(&manager, "incoming", |s| s.incoming.is_some()).await;

    native.remote_cancel();
    wait_snapshot(&manager, "incoming cleared", |s| s.incoming.is_none()).await;
    assert!(manager.incoming_invitation().is_none());
    assert!(manager.snapshot().sessions.is_empty());
}

#[tokio::test]
async fn test_reject_incoming() {
    let (manager, stack) = manager(ProviderKind::Rtc).await;

    let native = stack.incoming_call("2002", None, false).unwrap();
    wait_snapshot(&manager, "incoming", |s| s.incoming.is_some()).await;

    manager.reject_incoming().await.unwrap();
    assert!(manager.snapshot().incoming.is_none());
    assert_eq!(native.count_operations("reject:603"), 1);

    manager.reject_incoming().await.unwrap();
}

#[tokio::test]
async fn test_answer_expired_invitation() {
    let (manager, stack) = manager(ProviderKind::Dialog).await;

    let native = stack.incoming_call("2002", None, false).unwrap();
    wait_snapshot(&manager, "incoming", |s| s.incoming.is_some()).await;
    let invitation = manager.incoming_invitation().unwrap();
    native.remote_cancel();
    wait_snapshot(&manager, "incoming cleared", |s| s.incoming.is_none()).await;

    let result = manager.answer(&invitation, AnswerOptions::audio_only()).await;
    assert!(matches!(result, Err(SipError::InvitationExpired)));
    assert!(manager.snapshot().sessions.is_empty());
}

#[tokio::test]
async fn test_answer_holds_current_call() {
    let (manager, stack) = manager(ProviderKind::Dialog).await;
    let (outbound, outbound_native) = answered_call(&manager, &stack, "200").await;

    stack.incoming_call("2002", None, false).unwrap();
    wait_snapshot(&manager, "incoming", |s| s.incoming.is_some()).await;
    let invitation = manager.incoming_invitation().unwrap();
    let inbound = manager.answer(&invitation, AnswerOptions::audio_only()).await.unwrap();

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.status_of(&outbound), Some(SessionStatus::OnHold));
    assert_eq!(snapshot.status_of(&inbound), Some(SessionStatus::Active));
    assert_eq!(snapshot.active_count(), 1);
    assert!(outbound_native.is_held());
}

#[tokio::test]
async fn test_failed_auto_hold_is_logged_and_ignored() {
    let (manager, stack) = manager(ProviderKind::Dialog).await;
    let (first, first_native) = answered_call(&manager, &stack, "200").await;
    first_native.set_reject_renegotiation(true);

    let second = manager.call(CallOptions::new("300")).await.unwrap();
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.active_session_id, Some(second));
    assert_eq!(snapshot.status_of(&first), Some(SessionStatus::OnHold));
    assert!(manager
        .logs()
        .iter()
        .any(|e| e.kind == LogKind::Error && e.message.starts_with("Failed to hold session")));
}

#[tokio::test]
async fn test_ringing_call_is_held_once_it_connects() {
    for kind in [ProviderKind::Dialog, ProviderKind::Rtc] {
        let (manager, stack) = manager(kind).await;
        let first = manager.call(CallOptions::new("200")).await.unwrap();
        let first_native = stack.current().unwrap().last_call().unwrap();
        let (second, second_native) = answered_call(&manager, &stack, "300").await;

        assert_eq!(status(&manager, &first), Some(SessionStatus::Calling));
        assert_eq!(first_native.count_operations("reinvite"), 0);
        assert!(!manager.logs().iter().any(|e| e.kind == LogKind::Error));

        first_native.remote_answer();
        let watched = first.clone();
        let snapshot = wait_snapshot(&manager, "first call held after answer", move |s| {
            s.status_of(&watched) == Some(SessionStatus::OnHold)
        })
        .await;
        assert!(first_native.is_held());
        assert_eq!(first_native.count_operations("reinvite:hold"), 1);
        assert_eq!(snapshot.active_session_id, Some(second.clone()));
        assert_eq!(snapshot.status_of(&second), Some(SessionStatus::Active));
        assert!(!second_native.is_held());
        assert_eq!(snapshot.active_count(), 1);
        assert!(!snapshot.is_on_hold);
    }
}

#[tokio::test]
async fn test_ringing_call_that_refuses_hold_is_not_shown_held() {
    let (manager, stack) = manager(ProviderKind::Dialog).await;
    let first = manager.call(CallOptions::new("200")).await.unwrap();
    let first_native = stack.current().unwrap().last_call().unwrap();
    first_native.set_reject_renegotiation(true);
    answered_call(&manager, &stack, "300").await;

    first_native.remote_answer();
    let probe = manager.clone();
    common::wait_until("background hold failure logged", move || {
        probe
            .logs()
            .iter()
            .any(|e| e.kind == LogKind::Error && e.message.starts_with("Failed to hold session"))
    })
    .await;
    assert!(!first_native.is_held());
    assert_ne!(status(&manager, &first), Some(SessionStatus::OnHold));
    assert_eq!(manager.snapshot().active_count(), 1);
}

#[tokio::test]
async fn test_switch_away_from_ringing_call() {
    let (manager, stack) = manager(ProviderKind::Dialog).await;
    let (answered, answered_native) = answered_call(&manager, &stack, "200").await;
    let ringing = manager.call(CallOptions::new("300")).await.unwrap();
    let ringing_native = stack.current().unwrap().last_call().unwrap();

    manager.switch_session(&answered).await.unwrap();
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.status_of(&ringing), Some(SessionStatus::Calling));
    assert_eq!(snapshot.status_of(&answered), Some(SessionStatus::Active));
    assert!(!answered_native.is_held());

    ringing_native.remote_answer();
    let watched = ringing.clone();
    wait_snapshot(&manager, "switched-away call held", move |s| {
        s.status_of(&watched) == Some(SessionStatus::OnHold)
    })
    .await;
    assert!(ringing_native.is_held());
}

#[tokio::test]
async fn test_last_call_ending_after_transport_drop_keeps_error() {
    let (manager, stack) = manager(ProviderKind::Dialog).await;
    let (_id, native) = answered_call(&manager, &stack, "200").await;

    stack.current().unwrap().drop_transport("connection reset");
    wait_snapshot(&manager, "error state", |s| s.state == ConnectionState::Error).await;

    native.remote_hangup();
    let snapshot = wait_snapshot(&manager, "call removed", |s| s.sessions.is_empty()).await;
    assert_eq!(snapshot.state, ConnectionState::Error);
    assert_eq!(snapshot.active_session_id, None);
}

#[tokio::test]
async fn test_call_before_register() {
    let manager = SessionManager::builder(ClientConfig::new())
        .with_loopback(LoopbackStack::new())
        .build()
        .unwrap();
    let result = manager.call(CallOptions::new("200")).await;
    assert!(matches!(result, Err(SipError::NotRegistered)));
}

#[tokio::test]
async fn test_builder_requires_stack() {
    let result = SessionManager::builder(ClientConfig::new()).build();
    assert!(matches!(result, Err(SipError::InvalidConfiguration { .. })));
}

#[tokio::test]
async fn test_registration_rejected_sets_error() {
    let stack = LoopbackStack::with_behavior(LoopbackBehavior {
        registration: RegistrationBehavior::Reject {
            status: 403,
            reason: "Forbidden".into(),
        },
        ..LoopbackBehavior::default()
    });
    let manager = SessionManager::builder(ClientConfig::new())
        .with_loopback(stack)
        .build()
        .unwrap();

    manager.register(credentials()).await.unwrap();
    wait_snapshot(&manager, "error state", |s| s.state == ConnectionState::Error).await;
    assert!(manager
        .logs()
        .iter()
        .any(|e| e.kind == LogKind::Error && e.message.starts_with("Registration rejected")));
}

#[tokio::test]
#[traced_test]
async fn test_invalid_credentials_set_error() {
    let manager = SessionManager::builder(ClientConfig::new())
        .with_loopback(LoopbackStack::new())
        .build()
        .unwrap();

    let result = manager.register(Credentials::new("example.com", "", "pw")).await;
    assert!(matches!(result, Err(SipError::InvalidConfiguration { .. })));
    assert_eq!(manager.snapshot().state, ConnectionState::Error);
    assert!(logs_contain("Registration failed"));
}

#[tokio::test]
async fn test_transport_drop_sets_error() {
    let (manager, stack) = manager(ProviderKind::Rtc).await;
    stack.current().unwrap().drop_transport("connection reset");
    wait_snapshot(&manager, "error state", |s| s.state == ConnectionState::Error).await;
}

#[tokio::test]
async fn test_reregister_ignores_previous_user_agent() {
    let (manager, stack) = manager(ProviderKind::Dialog).await;
    manager.register(credentials()).await.unwrap();
    wait_snapshot(&manager, "registered again", |s| s.state == ConnectionState::Registered).await;

    let agents = stack.user_agents();
    assert_eq!(agents.len(), 2);
    assert!(agents[0].is_stopped());
    agents[0].drop_transport("late failure");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(manager.snapshot().state, ConnectionState::Registered);
}

#[tokio::test]
async fn test_sip_trace_reaches_log_buffer() {
    let (manager, _stack) = manager(ProviderKind::Dialog).await;
    let probe = manager.clone();
    common::wait_until("sip trace", move || {
        probe.logs().iter().any(|e| e.kind == LogKind::SipOut)
    })
    .await;
    assert!(manager.logs().iter().any(|e| e.kind == LogKind::SipIn));

    manager.clear_logs();
    assert!(manager.logs().is_empty());
}

#[tokio::test]
async fn test_lifecycle_events_stream() {
    let stack = LoopbackStack::new();
    let manager = SessionManager::builder(ClientConfig::new())
        .with_loopback(stack.clone())
        .build()
        .unwrap();
    let mut events = Box::pin(manager.events());
    manager.register(credentials()).await.unwrap();

    let registered = timeout(WAIT, async {
        while let Some(event) = events.next().await {
            if let BridgeEvent::Lifecycle(LifecycleEvent::StateChanged(ConnectionState::Registered)) = event {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(registered, Ok(true));

    let id = manager.call(CallOptions::new("200")).await.unwrap();
    let added = timeout(WAIT, async {
        while let Some(event) = events.next().await {
            if let BridgeEvent::Lifecycle(LifecycleEvent::SessionAdded(added)) = event {
                return Some(added);
            }
        }
        None
    })
    .await;
    assert_eq!(added, Ok(Some(id)));
}

#[tokio::test]
async fn test_audio_devices() {
    let (manager, stack) = manager(ProviderKind::Dialog).await;
    let devices = LoopbackDevices {
        outputs: vec![
            AudioOutputDevice {
                device_id: "default".into(),
                label: "System default".into(),
            },
            AudioOutputDevice {
                device_id: "usb-1".into(),
                label: "USB headset".into(),
            },
        ],
        fail: false,
    };
    let outputs = manager.refresh_audio_devices(&devices).await.unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(manager.snapshot().audio_outputs, outputs);

    answered_call(&manager, &stack, "200").await;
    manager.set_audio_output_device("usb-1").await.unwrap();
    assert_eq!(manager.snapshot().selected_output_device_id, "usb-1");

    let broken = LoopbackDevices {
        outputs: Vec::new(),
        fail: true,
    };
    assert!(manager.refresh_audio_devices(&broken).await.is_err());
    assert_eq!(manager.snapshot().audio_outputs.len(), 2);
    assert!(manager.logs().iter().any(|e| e.kind == LogKind::Error));
}

#[tokio::test]
async fn test_unregister_ends_calls() {
    let (manager, stack) = manager(ProviderKind::Dialog).await;
    let (_id, native) = answered_call(&manager, &stack, "200").await;

    manager.unregister().await.unwrap();
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Idle);
    assert!(snapshot.sessions.is_empty());
    assert_eq!(manager.session_count(), 0);
    assert_eq!(native.count_operations("bye"), 1);
    assert!(stack.current().unwrap().is_stopped());
}

#[tokio::test]
async fn test_dispose_resets_everything() {
    let (manager, stack) = manager(ProviderKind::Rtc).await;
    answered_call(&manager, &stack, "200").await;
    stack.incoming_call("2002", None, false).unwrap();
    wait_snapshot(&manager, "incoming", |s| s.incoming.is_some()).await;

    manager.dispose().await;
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Idle);
    assert!(snapshot.sessions.is_empty());
    assert!(snapshot.incoming.is_none());
    assert!(manager.incoming_invitation().is_none());
}

#[tokio::test]
async fn test_at_most_one_active_through_a_busy_sequence() {
    let (manager, stack) = manager(ProviderKind::Rtc).await;
    let (a, _) = answered_call(&manager, &stack, "200").await;
    let (b, _) = answered_call(&manager, &stack, "300").await;
    let (c, _) = answered_call(&manager, &stack, "400").await;
    assert!(manager.snapshot().active_count() <= 1);

    manager.switch_session(&a).await.unwrap();
    assert!(manager.snapshot().active_count() <= 1);
    manager.switch_session(&b).await.unwrap();
    assert!(manager.snapshot().active_count() <= 1);
    manager.hangup().await.unwrap();
    let snapshot = wait_snapshot(&manager, "b removed", |s| s.sessions.len() == 2).await;
    assert!(snapshot.active_count() <= 1);
    assert!(snapshot.active_session_id == Some(a) || snapshot.active_session_id == Some(c));
}
