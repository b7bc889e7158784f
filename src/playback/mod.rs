//! Frame-driven playback of a viseme timeline against an audio clock.
//!
//! [`PlaybackScheduler`] owns the active [`Timeline`] and its
//! [`PlaybackState`]. Each rendered frame the host passes in the audio
//! position; the scheduler derives the animation sync time, finds the
//! active event, blends toward the next event near its end, and smooths
//! the result through a [`FrameInterpolator`].
//!
//! All work here is synchronous and allocation-free per frame.

use crate::config::{InterpolatorConfig, SchedulerConfig};
use crate::interpolate::{FrameInterpolator, smoothstep};
use crate::viseme::{ShapeWeights, Timeline, TimelineSource};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Mutable per-utterance playback state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackState {
    /// Most recently matched event; search hint for the next frame.
    pub current_event_index: usize,
    /// Whether an utterance is being played.
    pub is_playing: bool,
    /// Seconds the animation clock runs ahead of the audio clock.
    pub lead_in_offset: f64,
}

/// Result of one scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    /// Target weights for this frame.
    pub target: ShapeWeights,
    /// Active event index.
    pub index: usize,
    /// Animation time in seconds, clamped to the timeline.
    pub sync_time: f64,
    /// The utterance completed on this tick; state has been reset.
    pub finished: bool,
}

/// One rendered frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    /// Smoothed weights to hand to the renderer.
    pub weights: ShapeWeights,
    /// The utterance completed on this frame.
    pub finished: bool,
}

/// Drives one utterance at a time from timeline to target weights.
#[derive(Debug)]
pub struct PlaybackScheduler {
    config: SchedulerConfig,
    timeline: Arc<Timeline>,
    state: PlaybackState,
    started_at: Option<Instant>,
    duration_ratio: f64,
    target: ShapeWeights,
    interpolator: FrameInterpolator,
}

impl PlaybackScheduler {
    /// Idle scheduler holding a resting timeline.
    pub fn new(config: &SchedulerConfig, interpolator: &InterpolatorConfig) -> Self {
        Self {
            config: config.clone(),
            timeline: Arc::new(Timeline::silence()),
            state: PlaybackState {
                current_event_index: 0,
                is_playing: false,
                lead_in_offset: config.lead_in_secs,
            },
            started_at: None,
            duration_ratio: 1.0,
            target: ShapeWeights::zero(),
            interpolator: FrameInterpolator::new(interpolator),
        }
    }

    /// Current playback state.
    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// The installed timeline.
    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    /// Target weights from the most recent tick.
    pub fn target(&self) -> ShapeWeights {
        self.target
    }

    /// Applied (smoothed) weights from the most recent frame.
    pub fn applied(&self) -> ShapeWeights {
        self.interpolator.applied()
    }

    /// Timeline-to-audio duration ratio.
    pub fn duration_ratio(&self) -> f64 {
        self.duration_ratio
    }

    /// Install a new utterance and start the wall clock at `now`.
    ///
    /// Applied weights are kept, so a preempted pose smooths into the new one.
    pub fn start(&mut self, timeline: Arc<Timeline>, now: Instant) {
        info!(
            source = ?timeline.source(),
            events = timeline.events().len(),
            duration = timeline.duration(),
            "playback started"
        );
        self.timeline = timeline;
        self.state.current_event_index = 0;
        self.state.is_playing = true;
        self.state.lead_in_offset = self.config.lead_in_secs;
        self.started_at = Some(now);
        self.duration_ratio = 1.0;
        self.target = ShapeWeights::zero();
    }

    /// Install a timeline without playing it. Target and applied weights rest.
    pub fn load_idle(&mut self, timeline: Arc<Timeline>) {
        self.reset();
        self.timeline = timeline;
    }

    /// Derive the duration ratio from the audio duration.
    ///
    /// Unknown, zero, or non-finite durations leave the ratio at 1.0.
    pub fn set_audio_duration(&mut self, duration: Option<f64>) {
        self.duration_ratio = match duration {
            Some(d) if d.is_finite() && d > 0.0 => {
                let ratio = self.timeline.duration() / d;
                if ratio.is_finite() && ratio > 0.0 { ratio } else { 1.0 }
            }
            _ => 1.0,
        };
        debug!(ratio = self.duration_ratio, ?duration, "audio duration ratio");
    }

    /// Animation time before clamping to the timeline.
    ///
    /// With audio running this is `position * ratio + lead_in`. Before audio
    /// starts it follows the wall clock, capped at `min(lead_in, end)`.
    pub fn raw_sync_time(&self, audio_position: f64, now: Instant) -> f64 {
        let end = self.timeline.duration();
        if audio_position.is_finite() && audio_position > 0.0 {
            return audio_position * self.duration_ratio + self.state.lead_in_offset;
        }
        let elapsed = self
            .started_at
            .map_or(0.0, |t| now.saturating_duration_since(t).as_secs_f64());
        elapsed.min(self.state.lead_in_offset.min(end))
    }

    /// Advance one frame's worth of scheduling without smoothing.
    pub fn tick(&mut self, audio_position: f64, now: Instant) -> Tick {
        if !self.state.is_playing {
            self.target = ShapeWeights::zero();
            return Tick {
                target: self.target,
                index: self.state.current_event_index,
                sync_time: 0.0,
                finished: false,
            };
        }

        let raw = self.raw_sync_time(audio_position, now);
        let sync_time = raw.clamp(0.0, self.timeline.duration());
        let index = self
            .timeline
            .locate(sync_time, self.state.current_event_index);
        self.state.current_event_index = index;

        if self.is_complete(index, raw) {
            info!(sync_time = raw, "playback completed");
            self.reset();
            return Tick {
                target: self.target,
                index,
                sync_time,
                finished: true,
            };
        }

        self.target = self.blended_target(index, sync_time);
        Tick {
            target: self.target,
            index,
            sync_time,
            finished: false,
        }
    }

    /// Tick, then smooth the applied pose toward the target by `delta` seconds.
    pub fn frame(&mut self, audio_position: f64, delta: f64, now: Instant) -> Frame {
        let tick = self.tick(audio_position, now);
        let weights = self.interpolator.step(&tick.target, delta);
        Frame {
            weights,
            finished: tick.finished,
        }
    }

    /// Stop playback and zero target and applied weights.
    ///
    /// Returns `true` if an utterance was playing. Calling it again is a no-op.
    pub fn stop(&mut self) -> bool {
        let was_playing = self.state.is_playing;
        self.reset();
        was_playing
    }

    /// Stop scheduling but keep the applied pose, which then eases back to rest.
    pub fn halt(&mut self) {
        self.state.current_event_index = 0;
        self.state.is_playing = false;
        self.started_at = None;
        self.duration_ratio = 1.0;
        self.target = ShapeWeights::zero();
    }

    fn reset(&mut self) {
        self.halt();
        self.interpolator.reset();
    }

    fn trailing_secs(&self) -> f64 {
        match self.timeline.source() {
            TimelineSource::Flat => self.config.flat_trailing_secs,
            _ => 0.0,
        }
    }

    fn is_complete(&self, index: usize, raw_sync_time: f64) -> bool {
        if index != self.timeline.last_index() {
            return false;
        }
        self.timeline
            .get(index)
            .is_some_and(|last| raw_sync_time > last.end + self.trailing_secs())
    }

    /// Event weights, blended toward the next event past the threshold.
    fn blended_target(&self, index: usize, sync_time: f64) -> ShapeWeights {
        let Some(event) = self.timeline.get(index) else {
            return ShapeWeights::zero();
        };
        let Some(next) = self.timeline.get(index + 1) else {
            return event.weights;
        };

        let threshold = self.config.blend_threshold.clamp(0.0, 1.0);
        let progress = event.progress(sync_time);
        if progress <= threshold || threshold >= 1.0 {
            return event.weights;
        }
        let factor = smoothstep((progress - threshold) / (1.0 - threshold));
        event.weights.lerp(&next.weights, factor as f32)
    }
}
