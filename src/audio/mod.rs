//! Audio playback primitive consumed by the lip-sync session.
//!
//! The session only needs a readable playback position, a duration (which
//! may be unknown), and lifecycle signals. Lifecycle signals are delivered
//! over a broadcast subscription rather than assigned callbacks.

pub mod simulated;

pub use simulated::SimulatedAudio;

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Lifecycle signals from an [`AudioTrack`].
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    /// Media metadata is available. `None` when the duration is unknown.
    MetadataLoaded {
        /// Media duration in seconds.
        duration: Option<f64>,
    },
    /// Audible playback began.
    Started,
    /// Playback reached the end of the media.
    Ended,
    /// Playback failed.
    Error(String),
}

/// What to load.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSource {
    /// Resolved audio URL.
    pub url: String,
    /// Playback speed multiplier (1.0 = normal).
    pub playback_rate: f64,
}

/// Loads audio tracks.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Prepare a track for playback. Does not start it.
    async fn load(&self, source: AudioSource) -> Result<Arc<dyn AudioTrack>>;
}

/// A loaded, playable track.
#[async_trait]
pub trait AudioTrack: Send + Sync {
    /// Current media position in seconds; 0 before playback starts.
    fn position(&self) -> f64;

    /// Media duration in seconds, if known.
    fn duration(&self) -> Option<f64>;

    /// Subscribe to lifecycle events emitted from now on.
    fn subscribe(&self) -> broadcast::Receiver<AudioEvent>;

    /// Start playback.
    async fn play(&self) -> Result<()>;

    /// Pause playback. Idempotent.
    fn pause(&self);
}
