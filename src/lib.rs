//! Fae lip-sync: viseme timeline scheduling for talking avatars.
//!
//! This crate turns phoneme/viseme timing into per-frame facial-control
//! weights, synchronised with audio playback:
//! Text → phonemize/TTS service → timeline → scheduler → interpolator → renderer
//!
//! # Architecture
//!
//! - **Shape table** ([`viseme::shapes`]): phoneme and group labels to control weights
//! - **Timeline builder** ([`viseme::timeline`]): grouped, flat or bare-phoneme input
//!   to an immutable event list
//! - **Playback scheduler** ([`playback`]): audio clock plus lead-in to the active
//!   event, with coarticulation blending and end detection
//! - **Frame interpolator** ([`interpolate`]): eases applied weights toward the target
//! - **Session** ([`session`]): async `speak()` / `stop()` with generation-based
//!   invalidation of superseded utterances
//!
//! The renderer is out of scope: hosts call [`LipSync::frame`] once per
//! rendered frame and apply the returned [`ShapeWeights`] however their
//! engine requires.

pub mod audio;
pub mod config;
pub mod error;
pub mod interpolate;
pub mod playback;
pub mod service;
pub mod session;
pub mod viseme;

pub use config::LipSyncConfig;
pub use error::{LipSyncError, Result};
pub use playback::{PlaybackScheduler, PlaybackState};
pub use service::{HttpPhonemeService, PhonemeService, VisemeResponse};
pub use session::{EndReason, LipSync, LipSyncEvent, SpeakOutcome};
pub use viseme::{ShapeKey, ShapeWeights, Timeline, TimelineBuilder, TimelineInput};
