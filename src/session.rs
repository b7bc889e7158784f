//! Async utterance orchestration around the playback scheduler.
//!
//! [`LipSync`] is the handle a host holds: `speak()` fetches timing and
//! audio for an utterance and starts it after the lead-in, `speak_audio()`
//! does the same for a track the host already has, `stop()` ends it, and
//! `frame()` is called once per rendered frame to get the pose.
//!
//! Only one utterance is active at a time. Each `speak()` or `stop()` bumps a
//! generation counter, and any async continuation holding an older
//! generation discards its result instead of applying it.

use crate::audio::{AudioBackend, AudioEvent, AudioSource, AudioTrack};
use crate::config::LipSyncConfig;
use crate::error::{LipSyncError, Result};
use crate::playback::{PlaybackScheduler, PlaybackState};
use crate::service::PhonemeService;
use crate::viseme::{
    ShapeTable, ShapeWeights, Timeline, TimelineBuilder, TimelineInput, TimelineSource,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Why an utterance ended.
#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    /// Played to the end.
    Completed,
    /// Ended by `stop()` or preempted by a newer `speak()`.
    Stopped,
    /// Fetch, load or playback failed.
    Failed(String),
}

/// Utterance lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum LipSyncEvent {
    /// Timeline installed; audio starts after the lead-in.
    Started {
        /// Utterance generation.
        generation: u64,
        /// Input shape the timeline was built from.
        source: TimelineSource,
    },
    /// The utterance is over and the face is at rest.
    ///
    /// When the timeline runs out before the audio, the track keeps playing
    /// to its end unless a newer utterance or `stop()` cuts it off.
    Ended {
        /// Utterance generation.
        generation: u64,
        /// Why it ended.
        reason: EndReason,
    },
}

/// What `speak()` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakOutcome {
    /// Audio is playing and the timeline is driving frames.
    Playing,
    /// Nothing to say; completed immediately.
    Silent,
    /// A newer `speak()` or a `stop()` took over before playback began.
    Superseded,
}

struct Utterance {
    generation: u64,
    cancel: CancellationToken,
    track: Option<Arc<dyn AudioTrack>>,
}

struct Inner {
    config: LipSyncConfig,
    service: Arc<dyn PhonemeService>,
    audio: Arc<dyn AudioBackend>,
    builder: TimelineBuilder,
    generation: AtomicU64,
    // Lock order: `current`, then `tail`, then `scheduler`.
    current: Mutex<Option<Utterance>>,
    // Completed by frames while its audio is still playing out.
    tail: Mutex<Option<Utterance>>,
    scheduler: Mutex<PlaybackScheduler>,
    events: broadcast::Sender<LipSyncEvent>,
}

/// Lip-sync session handle. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct LipSync {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LipSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LipSync")
            .field("generation", &self.generation())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl LipSync {
    /// Create a session over a phonemize service and an audio backend.
    pub fn new(
        config: LipSyncConfig,
        service: Arc<dyn PhonemeService>,
        audio: Arc<dyn AudioBackend>,
    ) -> Self {
        let table =
            ShapeTable::builtin().with_overrides(&config.shapes.phonemes, &config.shapes.groups);
        let builder = TimelineBuilder::new(table, config.timing.clone());
        let scheduler = PlaybackScheduler::new(&config.scheduler, &config.interpolator);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                service,
                audio,
                builder,
                generation: AtomicU64::new(0),
                current: Mutex::new(None),
                tail: Mutex::new(None),
                scheduler: Mutex::new(scheduler),
                events,
            }),
        }
    }

    /// Subscribe to lifecycle events emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LipSyncEvent> {
        self.inner.events.subscribe()
    }

    /// Latest utterance generation.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Snapshot of the scheduler's playback state.
    pub fn state(&self) -> PlaybackState {
        self.scheduler().state()
    }

    /// Whether an utterance is driving frames.
    pub fn is_playing(&self) -> bool {
        self.state().is_playing
    }

    /// The most recently installed timeline.
    pub fn active_timeline(&self) -> Arc<Timeline> {
        Arc::clone(self.scheduler().timeline())
    }

    /// Current applied weights, without advancing.
    pub fn applied(&self) -> ShapeWeights {
        self.scheduler().applied()
    }

    /// Speak `text`.
    ///
    /// Returns once audio playback has been started (after the lead-in), not
    /// when it ends; watch [`LipSync::subscribe`] for the end. Any utterance
    /// already in progress is preempted.
    ///
    /// # Errors
    ///
    /// Returns the service or audio error when the fetch, load or play step
    /// fails. The session has already reset to rest and emitted
    /// [`LipSyncEvent::Ended`] with [`EndReason::Failed`] by then.
    pub async fn speak(&self, text: &str) -> Result<SpeakOutcome> {
        let cancel = CancellationToken::new();
        let generation = self.preempt(cancel.clone());

        let text = truncate_text(text, self.inner.config.scheduler.max_speech_chars);
        if text.is_empty() {
            info!(generation, "empty utterance, nothing to speak");
            {
                let current = self.current();
                if is_current(&current, generation) {
                    self.scheduler().load_idle(Arc::new(Timeline::silence()));
                }
            }
            self.finish(generation, EndReason::Completed);
            return Ok(SpeakOutcome::Silent);
        }

        info!(generation, chars = text.chars().count(), "speaking");
        let response = match self.inner.service.synthesize(&text).await {
            Ok(response) => response,
            Err(e) => return self.fail_unless_stale(generation, e),
        };
        if self.is_stale(generation) {
            debug!(generation, "discarding stale phonemize response");
            return Ok(SpeakOutcome::Superseded);
        }

        let (audio_url, input) = response.into_parts();
        let timeline = Arc::new(self.inner.builder.build(&input));
        let Some(url) = audio_url else {
            let e = LipSyncError::Service("response has no audio_url".to_owned());
            return self.fail_unless_stale(generation, e);
        };

        let source = AudioSource {
            url,
            playback_rate: self.inner.config.audio.playback_rate,
        };
        let track = match self.inner.audio.load(source).await {
            Ok(track) => track,
            Err(e) => return self.fail_unless_stale(generation, e),
        };
        self.run(generation, cancel, timeline, track).await
    }

    /// Lip-sync a track the caller has already loaded, with visemes
    /// recognised from `audio` (the same clip's encoded bytes).
    ///
    /// Behaves like [`LipSync::speak`] from the timeline onwards: preempts
    /// any utterance in progress and returns once playback has started.
    ///
    /// # Errors
    ///
    /// Returns the service or audio error when recognition or playback
    /// fails, after resetting to rest and emitting [`EndReason::Failed`].
    pub async fn speak_audio(
        &self,
        audio: Vec<u8>,
        file_name: &str,
        track: Arc<dyn AudioTrack>,
    ) -> Result<SpeakOutcome> {
        let cancel = CancellationToken::new();
        let generation = self.preempt(cancel.clone());

        info!(generation, bytes = audio.len(), "speaking recorded audio");
        let visemes = match self.inner.service.visemes_for_audio(audio, file_name).await {
            Ok(visemes) => visemes,
            Err(e) => return self.fail_unless_stale(generation, e),
        };
        if self.is_stale(generation) {
            debug!(generation, "discarding stale audio visemes");
            return Ok(SpeakOutcome::Superseded);
        }

        let timeline = Arc::new(self.inner.builder.build(&TimelineInput::Flat(visemes)));
        self.run(generation, cancel, timeline, track).await
    }

    /// Install `timeline` with `track`, wait out the lead-in, then play.
    async fn run(
        &self,
        generation: u64,
        cancel: CancellationToken,
        timeline: Arc<Timeline>,
        track: Arc<dyn AudioTrack>,
    ) -> Result<SpeakOutcome> {
        let audio_events = track.subscribe();
        if !self.install(generation, Arc::clone(&timeline), Arc::clone(&track)) {
            debug!(generation, "discarding stale audio track");
            track.pause();
            return Ok(SpeakOutcome::Superseded);
        }
        self.spawn_audio_watcher(generation, audio_events, cancel.clone());
        self.emit(LipSyncEvent::Started {
            generation,
            source: timeline.source(),
        });

        let lead_in = Duration::from_secs_f64(self.inner.config.scheduler.lead_in_secs.max(0.0));
        tokio::select! {
            () = tokio::time::sleep(lead_in) => {}
            () = cancel.cancelled() => {
                debug!(generation, "lead-in cancelled");
                return Ok(SpeakOutcome::Superseded);
            }
        }
        if self.is_stale(generation) {
            return Ok(SpeakOutcome::Superseded);
        }

        match track.play().await {
            Ok(()) => Ok(SpeakOutcome::Playing),
            Err(e) => self.fail_unless_stale(generation, e),
        }
    }

    /// Stop the current utterance and snap to rest. Idempotent.
    ///
    /// Also cuts off audio still playing out after a frame-detected end.
    pub fn stop(&self) {
        let (taken, tail) = {
            let mut current = self.current();
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            let taken = current.take();
            let tail = self.tail().take();
            self.scheduler().stop();
            (taken, tail)
        };
        if let Some(tail) = tail {
            self.release(&tail);
        }
        if let Some(utterance) = taken {
            info!(generation = utterance.generation, "stopped");
            self.release(&utterance);
            self.emit(LipSyncEvent::Ended {
                generation: utterance.generation,
                reason: EndReason::Stopped,
            });
        }
    }

    /// Advance one rendered frame by `delta` seconds and return the pose.
    pub fn frame(&self, delta: f64) -> ShapeWeights {
        let mut current = self.current();
        let position = current
            .as_ref()
            .and_then(|u| u.track.as_ref())
            .map_or(0.0, |track| track.position());
        let frame = self.scheduler().frame(position, delta, Instant::now());

        // The timeline can run out before the audio does; let the track play on.
        let completed = if frame.finished { current.take() } else { None };
        let (generation, displaced) = match completed {
            Some(utterance) => (Some(utterance.generation), self.tail().replace(utterance)),
            None => (None, None),
        };
        drop(current);

        if let Some(old) = displaced {
            self.release(&old);
        }
        if let Some(generation) = generation {
            info!(generation, "timeline finished");
            self.emit(LipSyncEvent::Ended {
                generation,
                reason: EndReason::Completed,
            });
        }
        frame.weights
    }

    fn current(&self) -> MutexGuard<'_, Option<Utterance>> {
        self.inner.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tail(&self) -> MutexGuard<'_, Option<Utterance>> {
        self.inner.tail.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forget the finishing track of `generation` once its audio is over.
    fn clear_tail(&self, generation: u64) {
        let mut tail = self.tail();
        if is_current(&tail, generation) {
            debug!(generation, "audio tail finished");
            tail.take();
        }
    }

    fn scheduler(&self) -> MutexGuard<'_, PlaybackScheduler> {
        self.inner.scheduler.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.generation() != generation
    }

    fn emit(&self, event: LipSyncEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn release(&self, utterance: &Utterance) {
        utterance.cancel.cancel();
        if let Some(track) = &utterance.track {
            track.pause();
        }
    }

    /// Replace whatever is in flight with a fresh utterance slot and return its generation.
    ///
    /// The applied pose is left alone so the face eases out of it.
    fn preempt(&self, cancel: CancellationToken) -> u64 {
        let (generation, previous, tail) = {
            let mut current = self.current();
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let previous = current.replace(Utterance {
                generation,
                cancel,
                track: None,
            });
            let tail = self.tail().take();
            self.scheduler().halt();
            (generation, previous, tail)
        };
        if let Some(tail) = tail {
            self.release(&tail);
        }
        if let Some(utterance) = previous {
            debug!(old = utterance.generation, new = generation, "preempting utterance");
            self.release(&utterance);
            self.emit(LipSyncEvent::Ended {
                generation: utterance.generation,
                reason: EndReason::Stopped,
            });
        }
        generation
    }

    /// Hand the timeline and track to the scheduler if `generation` is still current.
    fn install(
        &self,
        generation: u64,
        timeline: Arc<Timeline>,
        track: Arc<dyn AudioTrack>,
    ) -> bool {
        let mut current = self.current();
        let Some(utterance) = current.as_mut().filter(|u| u.generation == generation) else {
            return false;
        };
        let duration = track.duration();
        utterance.track = Some(track);
        let mut scheduler = self.scheduler();
        scheduler.start(timeline, Instant::now());
        scheduler.set_audio_duration(duration);
        true
    }

    /// End `generation` with `reason` if it is still current.
    fn finish(&self, generation: u64, reason: EndReason) {
        let taken = {
            let mut current = self.current();
            if !is_current(&current, generation) {
                return;
            }
            let taken = current.take();
            self.scheduler().stop();
            taken
        };
        if let Some(utterance) = taken {
            self.release(&utterance);
        }
        match &reason {
            EndReason::Failed(message) => warn!(generation, %message, "utterance failed"),
            _ => info!(generation, ?reason, "utterance ended"),
        }
        self.emit(LipSyncEvent::Ended { generation, reason });
    }

    fn fail_unless_stale(&self, generation: u64, error: LipSyncError) -> Result<SpeakOutcome> {
        if self.is_stale(generation) {
            debug!(generation, %error, "ignoring failure of stale utterance");
            return Ok(SpeakOutcome::Superseded);
        }
        self.finish(generation, EndReason::Failed(error.to_string()));
        Err(error)
    }

    fn spawn_audio_watcher(
        &self,
        generation: u64,
        mut audio_events: broadcast::Receiver<AudioEvent>,
        cancel: CancellationToken,
    ) {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = audio_events.recv() => match event {
                        Ok(AudioEvent::MetadataLoaded { duration }) => {
                            let current = session.current();
                            if is_current(&current, generation) {
                                session.scheduler().set_audio_duration(duration);
                            }
                        }
                        Ok(AudioEvent::Started) => debug!(generation, "audio started"),
                        Ok(AudioEvent::Ended) => {
                            session.finish(generation, EndReason::Completed);
                            session.clear_tail(generation);
                            break;
                        }
                        Ok(AudioEvent::Error(message)) => {
                            session.finish(generation, EndReason::Failed(message));
                            session.clear_tail(generation);
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(generation, skipped = n, "audio events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }
}

fn is_current(current: &Option<Utterance>, generation: u64) -> bool {
    current.as_ref().is_some_and(|u| u.generation == generation)
}

/// Trim `text` and cap it at `max_chars` characters, marking the cut with `…`.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_owned();
    }
    let mut truncated: String = trimmed.chars().take(max_chars).collect();
    truncated.truncate(truncated.trim_end().len());
    truncated.push('…');
    truncated
}
