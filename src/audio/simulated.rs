//! Wall-clock audio backend with no sound output.
//!
//! Tracks advance in real (tokio) time at the requested playback rate and
//! emit the same lifecycle events a real player would, with metadata
//! reported when playback starts. Used for headless
//! runs and tests.

use super::{AudioBackend, AudioEvent, AudioSource, AudioTrack};
use crate::error::{LipSyncError, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use tracing::debug;

const EVENT_CAPACITY: usize = 16;

/// Backend producing [`SimulatedTrack`]s of a fixed duration.
#[derive(Debug, Clone, Default)]
pub struct SimulatedAudio {
    duration: Option<f64>,
    fail_load: bool,
    fail_play: bool,
}

impl SimulatedAudio {
    /// Tracks last `duration` seconds of media time (`None` = unknown, never ends).
    pub fn new(duration: Option<f64>) -> Self {
        Self {
            duration,
            fail_load: false,
            fail_play: false,
        }
    }

    /// Make every `load` fail.
    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    /// Make every `play` fail.
    pub fn failing_play(mut self) -> Self {
        self.fail_play = true;
        self
    }
}

#[async_trait]
impl AudioBackend for SimulatedAudio {
    async fn load(&self, source: AudioSource) -> Result<Arc<dyn AudioTrack>> {
        if self.fail_load {
            return Err(LipSyncError::Audio(format!("cannot load {}", source.url)));
        }
        debug!(url = %source.url, rate = source.playback_rate, "loaded simulated track");
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Arc::new(SimulatedTrack {
            duration: self.duration,
            rate: if source.playback_rate > 0.0 {
                source.playback_rate
            } else {
                1.0
            },
            fail_play: self.fail_play,
            state: Arc::new(Mutex::new(TrackState::default())),
            events,
        }))
    }
}

#[derive(Debug, Default)]
struct TrackState {
    started_at: Option<Instant>,
    offset: f64,
    play_id: u64,
}

/// A simulated track.
#[derive(Debug)]
pub struct SimulatedTrack {
    duration: Option<f64>,
    rate: f64,
    fail_play: bool,
    state: Arc<Mutex<TrackState>>,
    events: broadcast::Sender<AudioEvent>,
}

impl SimulatedTrack {
    fn position_in(&self, state: &TrackState) -> f64 {
        let running = state
            .started_at
            .map_or(0.0, |t| t.elapsed().as_secs_f64() * self.rate);
        let pos = state.offset + running;
        self.duration.map_or(pos, |d| pos.min(d))
    }
}

#[async_trait]
impl AudioTrack for SimulatedTrack {
    fn position(&self) -> f64 {
        match self.state.lock() {
            Ok(state) => self.position_in(&state),
            Err(_) => 0.0,
        }
    }

    fn duration(&self) -> Option<f64> {
        self.duration
    }

    fn subscribe(&self) -> broadcast::Receiver<AudioEvent> {
        self.events.subscribe()
    }

    async fn play(&self) -> Result<()> {
        if self.fail_play {
            let message = "playback rejected".to_owned();
            let _ = self.events.send(AudioEvent::Error(message.clone()));
            return Err(LipSyncError::Audio(message));
        }

        let (play_id, remaining) = {
            let mut state = self
                .state
                .lock()
                .map_err(|e| LipSyncError::Audio(format!("track state poisoned: {e}")))?;
            if state.started_at.is_some() {
                return Ok(());
            }
            state.started_at = Some(Instant::now());
            state.play_id += 1;
            let remaining = self.duration.map(|d| (d - state.offset).max(0.0) / self.rate);
            (state.play_id, remaining)
        };
        let _ = self.events.send(AudioEvent::MetadataLoaded {
            duration: self.duration,
        });
        let _ = self.events.send(AudioEvent::Started);

        if let Some(remaining) = remaining {
            let state = Arc::clone(&self.state);
            let events = self.events.clone();
            let duration = self.duration;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(remaining)).await;
                let still_playing = match state.lock() {
                    Ok(mut s) if s.play_id == play_id && s.started_at.is_some() => {
                        s.started_at = None;
                        s.offset = duration.unwrap_or(s.offset);
                        true
                    }
                    _ => false,
                };
                if still_playing {
                    let _ = events.send(AudioEvent::Ended);
                }
            });
        }
        Ok(())
    }

    fn pause(&self) {
        if let Ok(mut state) = self.state.lock() {
            let position = self.position_in(&state);
            state.started_at = None;
            state.offset = position;
            state.play_id += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn source(rate: f64) -> AudioSource {
        AudioSource {
            url: "mem://clip.mp3".to_owned(),
            playback_rate: rate,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn position_is_zero_until_played() {
        let track = SimulatedAudio::new(Some(2.0)).load(source(1.0)).await.unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(track.position(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn position_advances_at_playback_rate() {
        let track = SimulatedAudio::new(Some(2.0)).load(source(0.5)).await.unwrap();
        track.play().await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!((track.position() - 0.5).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn emits_started_then_ended() {
        let track = SimulatedAudio::new(Some(1.0)).load(source(1.0)).await.unwrap();
        let mut events = track.subscribe();
        track.play().await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            AudioEvent::MetadataLoaded {
                duration: Some(1.0)
            }
        );
        assert_eq!(events.recv().await.unwrap(), AudioEvent::Started);
        assert_eq!(events.recv().await.unwrap(), AudioEvent::Ended);
        assert!((track.position() - 1.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_suppresses_ended() {
        let track = SimulatedAudio::new(Some(1.0)).load(source(1.0)).await.unwrap();
        let mut events = track.subscribe();
        track.play().await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), AudioEvent::MetadataLoaded { .. }));
        assert_eq!(events.recv().await.unwrap(), AudioEvent::Started);
        tokio::time::advance(Duration::from_millis(300)).await;
        track.pause();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(events.try_recv().is_err());
        assert!((track.position() - 0.3).abs() < 1e-6);
    }

    #[tokio::test]
    async fn failing_play_reports_error() {
        let track = SimulatedAudio::new(Some(1.0))
            .failing_play()
            .load(source(1.0))
            .await
            .unwrap();
        let mut events = track.subscribe();
        assert!(track.play().await.is_err());
        assert!(matches!(events.recv().await.unwrap(), AudioEvent::Error(_)));
    }

    #[tokio::test]
    async fn failing_load_is_an_audio_error() {
        let result = SimulatedAudio::new(None).failing_load().load(source(1.0)).await;
        assert!(matches!(result, Err(LipSyncError::Audio(_))));
    }
}
