//! Media primitives
//!
//! Tracks, streams and the playback/preview elements a session binds to.
//! The session layer never touches RTP; it only flips the `enabled` flag of
//! local tracks (mute, hold) and hands remote streams to the bound element.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SipError, SipResult};

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug)]
struct TrackInner {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
}

/// One captured or received media track
///
/// Clones share the same underlying track, so disabling a clone disables
/// the track everywhere it is referenced.
#[derive(Debug, Clone)]
pub struct MediaTrack(Arc<TrackInner>);

impl MediaTrack {
    /// Create an enabled track
    pub fn new(kind: MediaKind) -> Self {
        Self(Arc::new(TrackInner {
            id: Uuid::new_v4().to_string(),
            kind,
            enabled: AtomicBool::new(true),
        }))
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn kind(&self) -> MediaKind {
        self.0.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.0.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.0.enabled.store(enabled, Ordering::SeqCst);
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A group of tracks delivered together
#[derive(Debug, Clone, PartialEq)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    /// Audio track, plus a video track when `video` is set
    pub fn capture(video: bool) -> Self {
        let mut tracks = vec![MediaTrack::new(MediaKind::Audio)];
        if video {
            tracks.push(MediaTrack::new(MediaKind::Video));
        }
        Self::new(tracks)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn has_video(&self) -> bool {
        self.tracks_of(MediaKind::Video).next().is_some()
    }

    /// Enable or disable every track of `kind`, returning how many changed
    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) -> usize {
        let mut changed = 0;
        for track in self.tracks_of(kind) {
            if track.is_enabled() != enabled {
                track.set_enabled(enabled);
                changed += 1;
            }
        }
        changed
    }

    /// True when every track of `kind` is enabled (vacuously true if none)
    pub fn all_enabled(&self, kind: MediaKind) -> bool {
        self.tracks_of(kind).all(MediaTrack::is_enabled)
    }
}

/// A playback or preview surface a session renders into
///
/// Implemented by whatever owns the actual audio/video output. Sink
/// selection is optional; elements that cannot route audio to a specific
/// device keep the default implementation.
#[async_trait]
pub trait MediaElement: Send + Sync + fmt::Debug {
    /// Render `stream`, replacing whatever was attached before
    fn attach(&self, stream: &MediaStream);

    /// Whether [`MediaElement::set_sink_id`] is available
    fn supports_sink_selection(&self) -> bool {
        false
    }

    /// Route playback to the output device `device_id`
    async fn set_sink_id(&self, _device_id: &str) -> SipResult<()> {
        Err(SipError::unsupported("audio output selection"))
    }
}

/// Elements bound to one session
#[derive(Debug, Clone, Default)]
pub struct MediaBindings {
    /// Local preview (video sessions only)
    pub local: Option<Arc<dyn MediaElement>>,
    /// Remote playback
    pub remote: Option<Arc<dyn MediaElement>>,
}

impl MediaBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local(mut self, element: Arc<dyn MediaElement>) -> Self {
        self.local = Some(element);
        self
    }

    pub fn with_remote(mut self, element: Arc<dyn MediaElement>) -> Self {
        self.remote = Some(element);
        self
    }
}

/// An audio output device as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioOutputDevice {
    pub device_id: String,
    pub label: String,
}

/// Enumerates audio output devices
///
/// Enumeration may suspend (permission prompts, device probing), hence async.
#[async_trait]
pub trait AudioDevices: Send + Sync {
    async fn output_devices(&self) -> SipResult<Vec<AudioOutputDevice>>;
}
