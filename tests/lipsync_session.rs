//! Session-level tests: utterance lifecycle, preemption and failure handling.
//!
//! Time is paused so lead-in waits, service latency and simulated audio
//! advance deterministically.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use async_trait::async_trait;
use fae_lipsync::audio::{AudioBackend, AudioSource, AudioTrack, SimulatedAudio};
use fae_lipsync::service::{PhonemeService, VisemeResponse};
use fae_lipsync::viseme::{GroupedViseme, TimelineSource};
use fae_lipsync::{EndReason, LipSync, LipSyncConfig, LipSyncError, LipSyncEvent, SpeakOutcome};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Answers "hello" slowly and everything else quickly, with distinct shapes.
struct ScriptedService;

#[async_trait]
impl PhonemeService for ScriptedService {
    async fn synthesize(&self, text: &str) -> fae_lipsync::Result<VisemeResponse> {
        let (delay, group) = if text == "hello" {
            (Duration::from_secs(1), "OPEN")
        } else {
            (Duration::from_millis(100), "ROUND")
        };
        tokio::time::sleep(delay).await;
        Ok(VisemeResponse {
            audio_url: Some(format!("mem://{text}.mp3")),
            grouped_visemes: Some(vec![GroupedViseme {
                group: group.to_owned(),
                phonemes: Vec::new(),
                start: 0.0,
                end: 1.0,
            }]),
            ..VisemeResponse::default()
        })
    }
}

/// Simulated backend that keeps a handle on every track it hands out.
struct RecordingAudio {
    inner: SimulatedAudio,
    tracks: Mutex<Vec<Arc<dyn AudioTrack>>>,
}

impl RecordingAudio {
    fn new(inner: SimulatedAudio) -> Self {
        Self {
            inner,
            tracks: Mutex::new(Vec::new()),
        }
    }

    fn last_track(&self) -> Arc<dyn AudioTrack> {
        Arc::clone(self.tracks.lock().unwrap().last().unwrap())
    }
}

#[async_trait]
impl AudioBackend for RecordingAudio {
    async fn load(&self, source: AudioSource) -> fae_lipsync::Result<Arc<dyn AudioTrack>> {
        let track = self.inner.load(source).await?;
        self.tracks.lock().unwrap().push(Arc::clone(&track));
        Ok(track)
    }
}

/// Session whose audio plays slower than the timeline, so frames reach the
/// end of the timeline before the audio reaches its end.
fn slow_audio_session() -> (LipSync, Arc<RecordingAudio>) {
    let audio = Arc::new(RecordingAudio::new(SimulatedAudio::new(Some(1.0))));
    let mut config = LipSyncConfig::default();
    config.audio.playback_rate = 0.8;
    let backend: Arc<dyn AudioBackend> = audio.clone();
    let lipsync = LipSync::new(config, Arc::new(ScriptedService), backend);
    (lipsync, audio)
}

/// Drive 10 ms frames until the session reports the end; returns the track
/// position at that moment.
async fn frames_until_ended(
    lipsync: &LipSync,
    events: &mut broadcast::Receiver<LipSyncEvent>,
    track: &Arc<dyn AudioTrack>,
) -> f64 {
    for _ in 0..300 {
        tokio::time::advance(Duration::from_millis(10)).await;
        lipsync.frame(0.01);
        if let Ok(event) = events.try_recv() {
            assert_eq!(
                event,
                LipSyncEvent::Ended {
                    generation: 1,
                    reason: EndReason::Completed
                }
            );
            return track.position();
        }
    }
    panic!("frames never reached the end of the timeline");
}

fn session(audio: SimulatedAudio) -> LipSync {
    LipSync::new(
        LipSyncConfig::default(),
        Arc::new(ScriptedService),
        Arc::new(audio),
    )
}

fn drain(events: &mut broadcast::Receiver<LipSyncEvent>) -> Vec<LipSyncEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn superseded_response_is_never_applied() {
    let lipsync = session(SimulatedAudio::new(Some(1.0)));
    let mut events = lipsync.subscribe();

    let first = {
        let lipsync = lipsync.clone();
        tokio::spawn(async move { lipsync.speak("hello").await })
    };
    tokio::task::yield_now().await;
    assert_eq!(lipsync.generation(), 1);

    let second = lipsync.speak("world").await.unwrap();
    assert_eq!(second, SpeakOutcome::Playing);

    let first = first.await.unwrap().unwrap();
    assert_eq!(first, SpeakOutcome::Superseded);

    let timeline = lipsync.active_timeline();
    assert_eq!(timeline.events().len(), 1);
    assert_eq!(timeline.events()[0].label, "ROUND");
    assert!(lipsync.is_playing());

    assert_eq!(
        drain(&mut events),
        vec![
            LipSyncEvent::Ended {
                generation: 1,
                reason: EndReason::Stopped
            },
            LipSyncEvent::Started {
                generation: 2,
                source: TimelineSource::Grouped
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn audio_end_completes_and_rests() {
    let lipsync = session(SimulatedAudio::new(Some(1.0)));
    let mut events = lipsync.subscribe();

    assert_eq!(lipsync.speak("world").await.unwrap(), SpeakOutcome::Playing);
    assert!(matches!(events.recv().await.unwrap(), LipSyncEvent::Started { .. }));

    assert_eq!(
        events.recv().await.unwrap(),
        LipSyncEvent::Ended {
            generation: 1,
            reason: EndReason::Completed
        }
    );
    assert!(!lipsync.is_playing());
    assert!(lipsync.applied().is_silent());
    assert!(lipsync.frame(1.0 / 60.0).is_silent());
}

#[tokio::test(start_paused = true)]
async fn frames_detect_end_when_audio_length_is_unknown() {
    let lipsync = session(SimulatedAudio::new(None));
    let mut events = lipsync.subscribe();
    lipsync.speak("world").await.unwrap();
    assert!(matches!(events.recv().await.unwrap(), LipSyncEvent::Started { .. }));

    let mut peak = 0.0_f32;
    let mut ended = None;
    for _ in 0..300 {
        tokio::time::advance(Duration::from_millis(16)).await;
        let weights = lipsync.frame(0.016);
        peak = peak.max(weights.iter().map(|(_, v)| v).fold(0.0, f32::max));
        if let Ok(event) = events.try_recv() {
            ended = Some(event);
            break;
        }
    }

    assert!(peak > 0.0);
    assert!(matches!(
        ended,
        Some(LipSyncEvent::Ended {
            reason: EndReason::Completed,
            ..
        })
    ));
    assert!(!lipsync.is_playing());
}

#[tokio::test(start_paused = true)]
async fn play_failure_resets_to_rest() {
    let lipsync = session(SimulatedAudio::new(Some(1.0)).failing_play());
    let mut events = lipsync.subscribe();

    let result = lipsync.speak("world").await;
    assert!(matches!(result, Err(LipSyncError::Audio(_))));
    assert!(!lipsync.is_playing());
    assert!(lipsync.applied().is_silent());

    tokio::task::yield_now().await;
    let seen = drain(&mut events);
    assert_eq!(seen.len(), 2, "{seen:?}");
    assert!(matches!(seen[0], LipSyncEvent::Started { .. }));
    assert!(matches!(
        seen[1],
        LipSyncEvent::Ended {
            reason: EndReason::Failed(_),
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn load_failure_resets_to_rest() {
    let lipsync = session(SimulatedAudio::new(Some(1.0)).failing_load());
    let mut events = lipsync.subscribe();

    assert!(matches!(lipsync.speak("world").await, Err(LipSyncError::Audio(_))));
    assert!(matches!(
        events.recv().await.unwrap(),
        LipSyncEvent::Ended {
            reason: EndReason::Failed(_),
            ..
        }
    ));
    assert!(!lipsync.is_playing());
}

#[tokio::test(start_paused = true)]
async fn stop_during_lead_in_cancels_playback() {
    let lipsync = session(SimulatedAudio::new(Some(1.0)));
    let mut events = lipsync.subscribe();

    let speaking = {
        let lipsync = lipsync.clone();
        tokio::spawn(async move { lipsync.speak("world").await })
    };
    assert!(matches!(events.recv().await.unwrap(), LipSyncEvent::Started { .. }));

    lipsync.stop();
    assert_eq!(speaking.await.unwrap().unwrap(), SpeakOutcome::Superseded);
    assert_eq!(
        drain(&mut events),
        vec![LipSyncEvent::Ended {
            generation: 1,
            reason: EndReason::Stopped
        }]
    );
    assert!(!lipsync.is_playing());
    assert!(lipsync.frame(0.016).is_silent());
}

#[tokio::test(start_paused = true)]
async fn stop_while_fetching_discards_the_response() {
    let lipsync = session(SimulatedAudio::new(Some(1.0)));
    let mut events = lipsync.subscribe();

    let speaking = {
        let lipsync = lipsync.clone();
        tokio::spawn(async move { lipsync.speak("hello").await })
    };
    tokio::task::yield_now().await;
    lipsync.stop();

    assert_eq!(speaking.await.unwrap().unwrap(), SpeakOutcome::Superseded);
    assert!(!lipsync.is_playing());
    assert_eq!(lipsync.active_timeline().source(), TimelineSource::Silence);
    assert_eq!(
        drain(&mut events),
        vec![LipSyncEvent::Ended {
            generation: 1,
            reason: EndReason::Stopped
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn audio_plays_out_after_timeline_finishes() {
    let (lipsync, audio) = slow_audio_session();
    let mut events = lipsync.subscribe();
    lipsync.speak("world").await.unwrap();
    assert!(matches!(events.recv().await.unwrap(), LipSyncEvent::Started { .. }));
    let track = audio.last_track();

    let ended_at = frames_until_ended(&lipsync, &mut events, &track).await;
    assert!(ended_at < 0.9, "timeline ended at audio position {ended_at}");
    assert!(!lipsync.is_playing());
    assert!(lipsync.applied().is_silent());

    tokio::time::advance(Duration::from_millis(500)).await;
    tokio::task::yield_now().await;
    assert!((track.position() - 1.0).abs() < 1e-9, "{}", track.position());
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn stop_cuts_off_a_playing_audio_tail() {
    let (lipsync, audio) = slow_audio_session();
    let mut events = lipsync.subscribe();
    lipsync.speak("world").await.unwrap();
    assert!(matches!(events.recv().await.unwrap(), LipSyncEvent::Started { .. }));
    let track = audio.last_track();

    let ended_at = frames_until_ended(&lipsync, &mut events, &track).await;
    lipsync.stop();
    let stopped_at = track.position();
    assert!(stopped_at >= ended_at && stopped_at < 1.0);

    tokio::time::advance(Duration::from_millis(500)).await;
    assert!((track.position() - stopped_at).abs() < 1e-9);
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn preemption_lets_the_pose_ease_out() {
    let lipsync = session(SimulatedAudio::new(Some(1.0)));
    lipsync.speak("world").await.unwrap();
    for _ in 0..20 {
        tokio::time::advance(Duration::from_millis(16)).await;
        lipsync.frame(0.016);
    }
    let pose = lipsync.applied();
    assert!(!pose.is_silent());

    let next = {
        let lipsync = lipsync.clone();
        tokio::spawn(async move { lipsync.speak("hello").await })
    };
    tokio::task::yield_now().await;
    assert_eq!(lipsync.generation(), 2);
    assert!(!lipsync.is_playing());
    assert_eq!(lipsync.applied(), pose);
    assert!(!lipsync.frame(0.016).is_silent());

    assert_eq!(next.await.unwrap().unwrap(), SpeakOutcome::Playing);
    assert_eq!(lipsync.active_timeline().events()[0].label, "OPEN");
}
