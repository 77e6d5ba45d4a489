//! Loopback softphone walkthrough
//!
//! Drives a [`SessionManager`] against the in-process loopback stack:
//! registers, places two calls, switches between them, receives and
//! answers an inbound call, then hangs everything up.
//!
//! Run with: cargo run -p rvoip-easy-sip --example loopback_call -- --provider rtc

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use rvoip_easy_sip::logging::{parse_log_level, setup_logging, LoggingConfig};
use rvoip_easy_sip::stack::loopback::LoopbackStack;
use rvoip_easy_sip::{
    AnswerOptions, BridgeEvent, CallOptions, ClientConfig, ConnectionState, Credentials, DtmfTone,
    LifecycleEvent, ManagerSnapshot, ProviderKind, SessionManager, SessionStatus,
};
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Provider {
    Dialog,
    Rtc,
}

impl From<Provider> for ProviderKind {
    fn from(provider: Provider) -> Self {
        match provider {
            Provider::Dialog => ProviderKind::Dialog,
            Provider::Rtc => ProviderKind::Rtc,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "loopback_call")]
#[command(about = "Multi-call walkthrough against the loopback signaling stack")]
struct Args {
    /// Signaling provider to drive
    #[arg(short, long, value_enum, default_value = "dialog")]
    provider: Provider,

    /// Extension to register as
    #[arg(long, default_value = "1001")]
    phone: String,

    /// SIP domain
    #[arg(long, default_value = "example.com")]
    domain: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Print raw SIP traffic
    #[arg(long)]
    sip_trace: bool,
}

const STEP: Duration = Duration::from_secs(2);

async fn wait_for<F>(manager: &SessionManager, what: &str, predicate: F) -> Result<ManagerSnapshot>
where
    F: Fn(&ManagerSnapshot) -> bool,
{
    let mut updates = manager.subscribe();
    let snapshot = timeout(STEP, updates.wait_for(|s| predicate(s)))
        .await
        .with_context(|| format!("timed out waiting for {}", what))?
        .context("manager dropped")?;
    Ok(snapshot.clone())
}

fn print_sessions(snapshot: &ManagerSnapshot) {
    for entry in &snapshot.sessions {
        let marker = if snapshot.active_session_id.as_ref() == Some(&entry.id) { "*" } else { " " };
        println!(
            "  {} {:<8} {:<10} {:?} dtmf=[{}]",
            marker,
            entry.remote_user,
            entry.status.to_string(),
            entry.direction,
            entry.dtmf_history.as_keys()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut logging = LoggingConfig::new(parse_log_level(&args.log_level)?);
    if args.sip_trace {
        logging = logging.with_sip_trace();
    }
    setup_logging(logging)?;

    let stack = LoopbackStack::new();
    let manager = SessionManager::builder(ClientConfig::new().with_provider(args.provider.into()))
        .with_loopback(stack.clone())
        .build()?;

    let mut events = Box::pin(manager.events());
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                BridgeEvent::Lifecycle(LifecycleEvent::StateChanged(state)) => info!(%state, "Connection state"),
                BridgeEvent::Lifecycle(LifecycleEvent::DtmfReceived { session_id, tone }) => {
                    info!(%session_id, %tone, "DTMF")
                }
                BridgeEvent::Log(entry) => println!("[{}] {:?} {}", entry.time_label(), entry.kind, entry.message),
                _ => {}
            }
        }
    });

    manager
        .register(Credentials::new(&args.domain, &args.phone, "secret").with_server("wss://sip.example.com/ws"))
        .await?;
    wait_for(&manager, "registration", |s| s.state == ConnectionState::Registered).await?;

    let first = manager.call(CallOptions::new("200")).await?;
    let Some(agent) = stack.current() else {
        bail!("no user agent created");
    };
    let Some(first_call) = agent.last_call() else {
        bail!("first call did not reach the stack");
    };
    first_call.remote_answer();
    let watched = first.clone();
    wait_for(&manager, "first answer", move |s| s.status_of(&watched) == Some(SessionStatus::Active)).await?;

    let second = manager.call(CallOptions::new("300")).await?;
    let Some(second_call) = agent.last_call() else {
        bail!("second call did not reach the stack");
    };
    second_call.remote_answer();
    let watched = second.clone();
    let snapshot =
        wait_for(&manager, "second answer", move |s| s.status_of(&watched) == Some(SessionStatus::Active)).await?;
    println!("Two calls up:");
    print_sessions(&snapshot);

    first_call.remote_dtmf(DtmfTone::Digit1);
    first_call.remote_dtmf(DtmfTone::Pound);
    manager.send_dtmf(DtmfTone::Digit5).await?;

    manager.switch_session(&first).await?;
    println!("Switched back to the first call:");
    print_sessions(&manager.snapshot());

    if let Some(inbound) = stack.incoming_call("2002", Some("Bob"), true) {
        wait_for(&manager, "incoming call", |s| s.incoming.is_some()).await?;
        if let Some(invitation) = manager.incoming_invitation() {
            manager.answer(&invitation, AnswerOptions::audio_only()).await?;
            println!("Answered {} without video:", invitation.remote_user());
            print_sessions(&manager.snapshot());
            inbound.remote_hangup();
        }
    } else {
        warn!("loopback stack has no user agent for inbound calls");
    }

    for entry in manager.snapshot().sessions {
        if let Err(e) = manager.hangup_session(&entry.id).await {
            warn!(session_id = %entry.id, "Hangup skipped: {}", e);
        }
    }
    wait_for(&manager, "all calls ended", |s| s.sessions.is_empty()).await?;

    manager.unregister().await?;
    manager.dispose().await;
    println!("Done.");
    Ok(())
}
