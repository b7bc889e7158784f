//! Configuration types for lip-sync scheduling and playback.
//!
//! Every tunable constant lives here. The defaults are tuned by eye for the
//! stock avatar and carry no meaning beyond "looks natural".

use crate::viseme::ShapeWeights;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level lip-sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LipSyncConfig {
    /// Playback scheduling (lead-in, coarticulation, end detection).
    pub scheduler: SchedulerConfig,
    /// Per-frame smoothing.
    pub interpolator: InterpolatorConfig,
    /// Synthesized timing for phoneme-only input.
    pub timing: TimingConfig,
    /// Phonemize/TTS service connection.
    pub service: ServiceConfig,
    /// Audio playback settings.
    pub audio: AudioConfig,
    /// Overrides for the built-in shape tables.
    pub shapes: ShapeOverrides,
}

/// Playback scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds the animation clock runs ahead of the audio clock.
    pub lead_in_secs: f64,
    /// Progress through an event (0..1) at which blending into the next event begins.
    pub blend_threshold: f64,
    /// Extra time past the last event before flat-viseme playback is declared finished.
    pub flat_trailing_secs: f64,
    /// Utterances longer than this many characters are truncated before phonemization.
    pub max_speech_chars: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lead_in_secs: 0.2,
            blend_threshold: 0.55,
            flat_trailing_secs: 0.5,
            max_speech_chars: 1200,
        }
    }
}

/// Frame interpolator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpolatorConfig {
    /// Blend rate per second; `delta * speed` is clamped to 1 before easing.
    pub speed: f64,
    /// Values within this distance of 0 or 1 are snapped exactly.
    pub snap_epsilon: f32,
}

impl Default for InterpolatorConfig {
    fn default() -> Self {
        Self {
            speed: 20.0,
            snap_epsilon: 1e-5,
        }
    }
}

/// Durations used when the service returns bare phonemes without timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Default duration for vowels without an override.
    pub vowel_secs: f64,
    /// Default duration for consonants without an override.
    pub consonant_secs: f64,
    /// Minimum duration for phonemes in an open or rounded category.
    pub vowel_floor_secs: f64,
    /// Minimum duration for every other phoneme.
    pub consonant_floor_secs: f64,
    /// Per-phoneme durations in seconds.
    pub overrides: BTreeMap<String, f64>,
    /// Merge consecutive phonemes that share a viseme category into one event.
    pub merge_same_category: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        let overrides = [
            ("AA", 0.100),
            ("AE", 0.100),
            ("AH", 0.080),
            ("AO", 0.100),
            ("AW", 0.100),
            ("AY", 0.100),
            ("EH", 0.080),
            ("ER", 0.080),
            ("EY", 0.100),
            ("IH", 0.080),
            ("IY", 0.080),
            ("OW", 0.100),
            ("OY", 0.100),
            ("UH", 0.080),
            ("UW", 0.080),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect();

        Self {
            vowel_secs: 0.20,
            consonant_secs: 0.10,
            vowel_floor_secs: 0.08,
            consonant_floor_secs: 0.04,
            overrides,
            merge_same_category: false,
        }
    }
}

/// Phonemize/TTS service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base URL of the service; relative audio URLs are resolved against it.
    pub base_url: String,
    /// Path of the text-to-visemes endpoint.
    pub endpoint: String,
    /// Path of the audio-to-visemes endpoint (multipart upload).
    pub audio_endpoint: String,
    /// Language tag sent with each request.
    pub language: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Append a timestamp query parameter to audio URLs so stale audio is never served from cache.
    pub cache_bust: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_owned(),
            endpoint: "/api/v1/phoneme/tts-to-visemes".to_owned(),
            audio_endpoint: "/api/v1/phoneme/audio-to-visemes".to_owned(),
            language: "en-us".to_owned(),
            timeout_secs: 30,
            cache_bust: true,
        }
    }
}

/// Audio playback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Playback speed multiplier handed to the audio backend.
    pub playback_rate: f64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self { playback_rate: 0.8 }
    }
}

/// Replacement weights for individual table entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapeOverrides {
    /// Keyed by ARPABET phoneme (stress digits ignored).
    pub phonemes: BTreeMap<String, ShapeWeights>,
    /// Keyed by group name (`g1_OPEN` or `OPEN`).
    pub groups: BTreeMap<String, ShapeWeights>,
}

impl LipSyncConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::LipSyncError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::LipSyncError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/fae/lipsync.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp/fae-config"))
            .join("fae")
            .join("lipsync.toml")
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::viseme::ShapeKey;

    #[test]
    fn default_config_is_valid() {
        let config = LipSyncConfig::default();
        assert!(config.scheduler.lead_in_secs >= 0.0);
        assert!(config.scheduler.blend_threshold > 0.0 && config.scheduler.blend_threshold < 1.0);
        assert!(config.scheduler.max_speech_chars > 0);
        assert!(config.interpolator.speed > 0.0);
        assert!(config.timing.vowel_secs > config.timing.consonant_secs);
        assert!(config.audio.playback_rate > 0.0);
        assert!(!config.service.endpoint.is_empty());
        assert!(config.service.audio_endpoint.ends_with("audio-to-visemes"));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("lipsync.toml");

        let mut config = LipSyncConfig::default();
        config.scheduler.lead_in_secs = 0.35;
        config.service.base_url = "http://tts.local:9000".to_owned();
        config.shapes.phonemes.insert(
            "AA".to_owned(),
            ShapeWeights::from_pairs(&[(ShapeKey::LipsOpenWide, 0.7)]),
        );

        config.save_to_file(&path).unwrap();
        let loaded = LipSyncConfig::from_file(&path).unwrap();

        assert!((loaded.scheduler.lead_in_secs - 0.35).abs() < f64::EPSILON);
        assert_eq!(loaded.service.base_url, "http://tts.local:9000");
        let aa = loaded.shapes.phonemes.get("AA").unwrap();
        assert!((aa.get(ShapeKey::LipsOpenWide) - 0.7).abs() < 1e-6);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let config: LipSyncConfig = toml::from_str(
            r#"
            [scheduler]
            lead_in_secs = 0.5
            "#,
        )
        .unwrap();
        assert!((config.scheduler.lead_in_secs - 0.5).abs() < f64::EPSILON);
        assert!((config.scheduler.blend_threshold - 0.55).abs() < f64::EPSILON);
        assert_eq!(config.timing.overrides.get("AA"), Some(&0.100));
    }

    #[test]
    fn shape_overrides_parse_named_controls() {
        let config: LipSyncConfig = toml::from_str(
            r#"
            [shapes.groups.g1_OPEN]
            Lips_Open_Wide = 2.0
            TeethTongue_Open = 0.4
            "#,
        )
        .unwrap();
        let open = config.shapes.groups.get("g1_OPEN").unwrap();
        assert_eq!(open.get(ShapeKey::LipsOpenWide), 1.0);
        assert!((open.get(ShapeKey::TeethTongueOpen) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result = LipSyncConfig::from_file(std::path::Path::new("/nonexistent/lipsync.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();
        assert!(LipSyncConfig::from_file(&path).is_err());
    }

    #[test]
    fn default_config_path_ends_with_lipsync_toml() {
        let path = LipSyncConfig::default_config_path();
        assert!(path.to_string_lossy().ends_with("lipsync.toml"));
    }
}
