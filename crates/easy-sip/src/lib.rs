//! # Easy SIP - Provider-agnostic call sessions
//!
//! This crate puts a uniform session layer on top of interchangeable SIP
//! signaling stacks. Applications place, answer and control calls through
//! one [`SessionHandle`] interface regardless of which native stack carries
//! the signaling:
//!
//! - **stack**: the two native object models (`dialog` and `rtc`) plus an
//!   in-process loopback implementing both
//! - **session**: adapters mapping native sessions onto [`SessionHandle`]
//! - **provider**: registration and call origination, one per stack model
//! - **client**: a single-call facade
//! - **manager**: concurrent calls with automatic hold and switching
//! - **bridge**: log classification and lifecycle event fan-out
//!
//! ## Quick Start
//!
//! ```rust
//! use rvoip_easy_sip::{AnswerOptions, ClientConfig, Credentials, SessionManager};
//! use rvoip_easy_sip::stack::loopback::LoopbackStack;
//!
//! # tokio_test::block_on(async {
//! let stack = LoopbackStack::new();
//! let manager = SessionManager::builder(ClientConfig::new())
//!     .with_loopback(stack.clone())
//!     .build()
//!     .unwrap();
//! manager.register(Credentials::new("example.com", "1001", "secret")).await.unwrap();
//!
//! // Play the remote party: ring us with a video offer
//! stack.incoming_call("2002", Some("Bob"), true).unwrap();
//! let mut updates = manager.subscribe();
//! updates.wait_for(|s| s.incoming.is_some()).await.unwrap();
//!
//! // Answer audio-only; local policy wins over the offer
//! let invitation = manager.incoming_invitation().unwrap();
//! let id = manager.answer(&invitation, AnswerOptions::audio_only()).await.unwrap();
//! assert!(!manager.session(&id).unwrap().has_video());
//! # })
//! ```
//!
//! ## Architecture
//!
//! ```text
//! SessionManager ──► SipClient ──► SipProvider ──► native stack
//!       │                               │
//!       └──── SessionHandle ◄───────────┘ (DialogSessionAdapter / RtcSessionAdapter)
//! ```
//!
//! Which provider is used is a configuration decision ([`ProviderKind`]),
//! never a runtime probe of the stack.

pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
#[cfg(feature = "logging")]
pub mod logging;
pub mod manager;
pub mod media;
pub mod provider;
pub mod session;
pub mod stack;
pub mod types;

// Re-export main types
pub use bridge::{BridgeEvent, EventBridge, LifecycleEvent, LogEntry, LogKind};
pub use client::{SipClient, SipClientBuilder};
pub use config::{ClientConfig, ManagerConfig, PromotionPolicy};
pub use error::{SipError, SipResult};
pub use manager::{ManagedSession, ManagerSnapshot, SessionManager, SessionManagerBuilder};
pub use media::{AudioDevices, AudioOutputDevice, MediaBindings, MediaElement, MediaKind, MediaStream, MediaTrack};
pub use provider::{
    DialogProvider, Invitation, LogSink, ProviderKind, ProviderOptions, RegisterDelegate, RtcProvider,
    SipProvider, UserAgentDelegate,
};
pub use session::{SessionDelegate, SessionHandle, SessionPhase, TransferTarget};
pub use types::{
    AnswerOptions, CallOptions, ConnectionState, Credentials, Direction, DtmfTone, SessionId, SessionStatus,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
