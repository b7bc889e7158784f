//! Viseme timelines: one immutable event list per utterance.
//!
//! The [`TimelineBuilder`] accepts the three shapes a phonemize service can
//! return (grouped visemes, flat visemes, bare phonemes) and resolves every
//! event's weights once, up front. Playback only ever reads the result.

use super::shapes::{ShapeTable, ShapeWeights, VisemeCategory};
use super::timing::{clean_phonemes, group_phonemes, phoneme_duration};
use crate::config::TimingConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Slack allowed when matching a time against event boundaries.
const BOUNDARY_DRIFT: f64 = 1e-6;

/// A run of phonemes sharing one mouth shape, with authoritative timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupedViseme {
    /// Group label (`g1_OPEN`, `Open_wide`, `sil`, ...).
    pub group: String,
    /// Phonemes merged into this group.
    #[serde(default)]
    pub phonemes: Vec<String>,
    /// Start time in seconds.
    pub start: f64,
    /// End time in seconds.
    pub end: f64,
}

/// A single viseme with a start and a duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatViseme {
    /// Viseme or phoneme label.
    pub viseme: String,
    /// Start time in seconds.
    pub start: f64,
    /// Duration in seconds.
    pub duration: f64,
}

/// Raw timing input, in priority order.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineInput {
    /// Pre-grouped visemes with start/end.
    Grouped(Vec<GroupedViseme>),
    /// Visemes with start/duration.
    Flat(Vec<FlatViseme>),
    /// Bare phoneme labels; timing is synthesized.
    Phonemes(Vec<String>),
    /// Nothing to say.
    Empty,
}

impl TimelineInput {
    /// Pick the first non-empty input: grouped, then flat, then phonemes.
    pub fn select(
        grouped: Option<Vec<GroupedViseme>>,
        flat: Option<Vec<FlatViseme>>,
        phonemes: Option<Vec<String>>,
    ) -> Self {
        match (grouped, flat, phonemes) {
            (Some(g), _, _) if !g.is_empty() => TimelineInput::Grouped(g),
            (_, Some(f), _) if !f.is_empty() => TimelineInput::Flat(f),
            (_, _, Some(p)) if !p.is_empty() => TimelineInput::Phonemes(p),
            _ => TimelineInput::Empty,
        }
    }
}

/// Which input shape a timeline was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineSource {
    /// Built from grouped visemes.
    Grouped,
    /// Built from flat visemes.
    Flat,
    /// Built from bare phonemes with synthesized timing.
    Phonemes,
    /// Default resting timeline for empty or unusable input.
    Silence,
}

/// One phoneme or group's active window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEvent {
    /// Phoneme or group label.
    pub label: String,
    /// Source phonemes covered by this event.
    pub phonemes: Vec<String>,
    /// Start time in seconds.
    pub start: f64,
    /// End time in seconds (always greater than `start`).
    pub end: f64,
    /// Resolved weights for this event.
    pub weights: ShapeWeights,
}

impl TimelineEvent {
    /// Event length in seconds.
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// `true` if `t` falls in `[start, end)`, with a little slack at the start.
    pub fn contains(&self, t: f64) -> bool {
        t >= self.start - BOUNDARY_DRIFT && t < self.end
    }

    /// Fraction of the event elapsed at `t`, clamped to `[0, 1]`.
    pub fn progress(&self, t: f64) -> f64 {
        ((t - self.start) / self.duration()).clamp(0.0, 1.0)
    }
}

/// An ordered, non-empty list of events covering one utterance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timeline {
    source: TimelineSource,
    events: Vec<TimelineEvent>,
}

impl Timeline {
    /// Span of the resting timeline used for empty input.
    pub const SILENCE_SECS: f64 = 0.3;

    /// A single zero-weight event representing a resting mouth.
    pub fn silence() -> Self {
        Self {
            source: TimelineSource::Silence,
            events: vec![TimelineEvent {
                label: "sil".to_owned(),
                phonemes: Vec::new(),
                start: 0.0,
                end: Self::SILENCE_SECS,
                weights: ShapeWeights::zero(),
            }],
        }
    }

    fn from_events(source: TimelineSource, events: Vec<TimelineEvent>) -> Self {
        if events.is_empty() {
            warn!(?source, "no usable timeline events, using silence");
            return Self::silence();
        }
        Self { source, events }
    }

    /// Input shape this timeline came from.
    pub fn source(&self) -> TimelineSource {
        self.source
    }

    /// All events in time order.
    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Event at `index`, if any.
    pub fn get(&self, index: usize) -> Option<&TimelineEvent> {
        self.events.get(index)
    }

    /// Index of the final event.
    pub fn last_index(&self) -> usize {
        self.events.len().saturating_sub(1)
    }

    /// End time of the final event.
    pub fn duration(&self) -> f64 {
        self.events.last().map_or(0.0, |e| e.end)
    }

    /// Index of the event active at `t`.
    ///
    /// Scans forward from `hint`, then from the start (rewinds). Times in a
    /// gap map to the next event; times past the end map to the last event.
    pub fn locate(&self, t: f64, hint: usize) -> usize {
        let hint = hint.min(self.last_index());
        if let Some(i) = (hint..self.events.len()).find(|&i| self.events[i].contains(t)) {
            return i;
        }
        if let Some(i) = (0..hint).find(|&i| self.events[i].contains(t)) {
            return i;
        }
        self.events
            .iter()
            .position(|e| t < e.end)
            .unwrap_or_else(|| self.last_index())
    }
}

/// Converts raw timing input into a [`Timeline`].
#[derive(Debug, Clone, Default)]
pub struct TimelineBuilder {
    table: ShapeTable,
    timing: TimingConfig,
}

impl TimelineBuilder {
    /// Create a builder over a shape table and fallback timing.
    pub fn new(table: ShapeTable, timing: TimingConfig) -> Self {
        Self { table, timing }
    }

    /// The shape table used to resolve event weights.
    pub fn table(&self) -> &ShapeTable {
        &self.table
    }

    /// Build a timeline. Never fails; unusable input yields [`Timeline::silence`].
    pub fn build(&self, input: &TimelineInput) -> Timeline {
        let timeline = match input {
            TimelineInput::Grouped(groups) => self.build_grouped(groups),
            TimelineInput::Flat(visemes) => self.build_flat(visemes),
            TimelineInput::Phonemes(phonemes) => self.build_phonemes(phonemes),
            TimelineInput::Empty => Timeline::silence(),
        };
        info!(
            source = ?timeline.source(),
            events = timeline.events().len(),
            duration = timeline.duration(),
            "built viseme timeline"
        );
        timeline
    }

    fn build_grouped(&self, groups: &[GroupedViseme]) -> Timeline {
        let events: Vec<TimelineEvent> = groups
            .iter()
            .filter_map(|g| {
                if !valid_span(g.start, g.end) {
                    warn!(group = %g.group, start = g.start, end = g.end, "dropping malformed group");
                    return None;
                }
                let weights = self.table.shapes_for_group(&g.group);
                debug!(group = %g.group, phonemes = ?g.phonemes, duration = g.end - g.start, "group event");
                Some(TimelineEvent {
                    label: g.group.clone(),
                    phonemes: g.phonemes.clone(),
                    start: g.start,
                    end: g.end,
                    weights,
                })
            })
            .collect();
        Timeline::from_events(TimelineSource::Grouped, events)
    }

    fn build_flat(&self, visemes: &[FlatViseme]) -> Timeline {
        let events: Vec<TimelineEvent> = visemes
            .iter()
            .filter_map(|v| {
                let end = v.start + v.duration;
                if !valid_span(v.start, end) {
                    warn!(viseme = %v.viseme, start = v.start, duration = v.duration, "dropping malformed viseme");
                    return None;
                }
                Some(TimelineEvent {
                    label: v.viseme.clone(),
                    phonemes: vec![v.viseme.clone()],
                    start: v.start,
                    end,
                    weights: self.table.shapes_for_phoneme(&v.viseme),
                })
            })
            .collect();
        Timeline::from_events(TimelineSource::Flat, events)
    }

    fn build_phonemes(&self, raw: &[String]) -> Timeline {
        let phonemes = clean_phonemes(raw);
        let durations: Vec<f64> = phonemes
            .iter()
            .map(|p| phoneme_duration(p, &self.timing))
            .collect();

        let events: Vec<TimelineEvent> = if self.timing.merge_same_category {
            group_phonemes(&phonemes, &durations)
                .into_iter()
                .map(|g| {
                    let weights = match VisemeCategory::from_name(&g.group) {
                        Some(category) => self.table.shapes_for_category(category),
                        None => self.table.shapes_for_group(&g.group),
                    };
                    TimelineEvent {
                        label: g.group,
                        phonemes: g.phonemes,
                        start: g.start,
                        end: g.end,
                        weights,
                    }
                })
                .collect()
        } else {
            let mut cursor = 0.0;
            phonemes
                .into_iter()
                .zip(durations)
                .map(|(phoneme, duration)| {
                    let start = cursor;
                    cursor += duration;
                    TimelineEvent {
                        weights: self.table.shapes_for_phoneme(&phoneme),
                        label: phoneme.clone(),
                        phonemes: vec![phoneme],
                        start,
                        end: cursor,
                    }
                })
                .collect()
        };
        Timeline::from_events(TimelineSource::Phonemes, events)
    }
}

fn valid_span(start: f64, end: f64) -> bool {
    start.is_finite() && end.is_finite() && end > start
}
