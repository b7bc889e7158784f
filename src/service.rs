//! Phonemize/TTS service client.
//!
//! The service turns an utterance into an audio URL plus timing data in one
//! of three shapes (grouped visemes, flat visemes, bare phonemes). It can
//! also recognise visemes from recorded audio, returning a flat list. Only
//! the response contract matters here; how the service computes it does not.

use crate::config::ServiceConfig;
use crate::error::{LipSyncError, Result};
use crate::viseme::{FlatViseme, GroupedViseme, TimelineInput};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Phoneme list as sent by the service: a JSON array or a space-separated string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PhonemeList {
    /// `["HH", "AH0", "L", "OW1"]`
    List(Vec<String>),
    /// `"HH AH0 L OW1"`
    Text(String),
}

impl PhonemeList {
    /// Individual labels.
    pub fn into_vec(self) -> Vec<String> {
        match self {
            PhonemeList::List(list) => list,
            PhonemeList::Text(text) => text.split_whitespace().map(str::to_owned).collect(),
        }
    }
}

/// Text-to-visemes response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisemeResponse {
    /// Where to fetch the synthesized audio.
    #[serde(default)]
    pub audio_url: Option<String>,
    /// Bare phonemes (lowest priority).
    #[serde(default)]
    pub phonemes: Option<PhonemeList>,
    /// Flat visemes with start/duration.
    #[serde(default)]
    pub visemes: Option<Vec<FlatViseme>>,
    /// Grouped visemes with start/end (highest priority).
    #[serde(default)]
    pub grouped_visemes: Option<Vec<GroupedViseme>>,
}

impl VisemeResponse {
    /// Split into the audio URL and the highest-priority timing input.
    pub fn into_parts(self) -> (Option<String>, TimelineInput) {
        let input = TimelineInput::select(
            self.grouped_visemes,
            self.visemes,
            self.phonemes.map(PhonemeList::into_vec),
        );
        (self.audio_url, input)
    }
}

/// Audio-to-visemes response: a bare array, or an object wrapping one.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum AudioVisemes {
    List(Vec<FlatViseme>),
    Wrapped { visemes: Vec<FlatViseme> },
}

impl AudioVisemes {
    fn into_vec(self) -> Vec<FlatViseme> {
        match self {
            AudioVisemes::List(visemes) | AudioVisemes::Wrapped { visemes } => visemes,
        }
    }
}

/// Produces audio and timing for an utterance.
#[async_trait]
pub trait PhonemeService: Send + Sync {
    /// Synthesize `text`.
    async fn synthesize(&self, text: &str) -> Result<VisemeResponse>;

    /// Recognise timed visemes in recorded audio (`file_name` hints the format).
    ///
    /// Services without audio recognition keep the default, which fails.
    async fn visemes_for_audio(&self, _audio: Vec<u8>, file_name: &str) -> Result<Vec<FlatViseme>> {
        Err(LipSyncError::Service(format!(
            "audio-to-visemes is not supported for {file_name}"
        )))
    }
}

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    language: &'a str,
}

/// [`PhonemeService`] over HTTP (`POST {base_url}{endpoint}` with a JSON body).
#[derive(Debug, Clone)]
pub struct HttpPhonemeService {
    client: reqwest::Client,
    base_url: Url,
    endpoint: Url,
    audio_endpoint: Url,
    language: String,
    cache_bust: bool,
}

impl HttpPhonemeService {
    /// Create a client from config.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL or endpoint is invalid.
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| LipSyncError::Config(format!("invalid service base_url: {e}")))?;
        let endpoint = base_url
            .join(&config.endpoint)
            .map_err(|e| LipSyncError::Config(format!("invalid service endpoint: {e}")))?;
        let audio_endpoint = base_url
            .join(&config.audio_endpoint)
            .map_err(|e| LipSyncError::Config(format!("invalid audio endpoint: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            base_url,
            endpoint,
            audio_endpoint,
            language: config.language.clone(),
            cache_bust: config.cache_bust,
        })
    }

    /// The full endpoint URL requests are sent to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// The full audio-to-visemes URL.
    pub fn audio_endpoint(&self) -> &Url {
        &self.audio_endpoint
    }
}

/// Map a non-2xx response to a `Service` error carrying the status and detail.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body_text = response.text().await.unwrap_or_default();
    Err(LipSyncError::Service(format!(
        "HTTP {}: {}",
        status.as_u16(),
        extract_error_detail(&body_text)
    )))
}

/// MIME type for an uploaded clip, from its extension.
fn audio_mime(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("webm") => "audio/webm",
        _ => "audio/wav",
    }
}

#[async_trait]
impl PhonemeService for HttpPhonemeService {
    async fn synthesize(&self, text: &str) -> Result<VisemeResponse> {
        let body = SynthesizeRequest {
            text,
            language: &self.language,
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| LipSyncError::Service(format!("request failed: {e}")))?;
        let response = check_status(response).await?;

        let mut payload: VisemeResponse = response
            .json()
            .await
            .map_err(|e| LipSyncError::Service(format!("malformed response: {e}")))?;

        if let Some(raw) = payload.audio_url.take() {
            let mut resolved = resolve_audio_url(&self.base_url, &raw)?;
            if self.cache_bust {
                resolved = cache_bust(&resolved, chrono::Utc::now().timestamp_millis());
            }
            debug!(audio_url = %resolved, "resolved audio url");
            payload.audio_url = Some(resolved);
        }
        Ok(payload)
    }

    async fn visemes_for_audio(&self, audio: Vec<u8>, file_name: &str) -> Result<Vec<FlatViseme>> {
        let bytes = audio.len();
        let part = Part::bytes(audio)
            .file_name(file_name.to_owned())
            .mime_str(audio_mime(file_name))?;
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(self.audio_endpoint.clone())
            .multipart(form)
            .send()
            .await
            .map_err(|e| LipSyncError::Service(format!("request failed: {e}")))?;
        let response = check_status(response).await?;

        let visemes = response
            .json::<AudioVisemes>()
            .await
            .map_err(|e| LipSyncError::Service(format!("malformed response: {e}")))?
            .into_vec();
        debug!(bytes, visemes = visemes.len(), "recognised visemes from audio");
        Ok(visemes)
    }
}

/// Error text from a `{"detail": ...}` body, or the body itself.
fn extract_error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(String::from))
        .unwrap_or_else(|| body.to_string())
}

/// Resolve a possibly relative audio URL against the service base.
///
/// # Errors
///
/// Returns an error if the URL cannot be parsed.
pub fn resolve_audio_url(base: &Url, raw: &str) -> Result<String> {
    base.join(raw)
        .map(String::from)
        .map_err(|e| LipSyncError::Service(format!("invalid audio_url `{raw}`: {e}")))
}

/// Append a `_t=<millis>` query parameter so a cached response is never replayed.
pub fn cache_bust(url: &str, millis: i64) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}_t={millis}")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn response_prefers_grouped_visemes() {
        let json = r#"{
            "audio_url": "/static/a.mp3",
            "phonemes": ["HH", "AH0"],
            "visemes": [{"viseme": "AA", "start": 0.0, "duration": 0.1, "shape_keys": {}}],
            "grouped_visemes": [{"group": "g1_OPEN", "phonemes": ["AA"], "start": 0.0, "end": 0.1}]
        }"#;
        let response: VisemeResponse = serde_json::from_str(json).unwrap();
        let (audio, input) = response.into_parts();
        assert_eq!(audio.as_deref(), Some("/static/a.mp3"));
        assert!(matches!(input, TimelineInput::Grouped(ref g) if g.len() == 1));
    }

    #[test]
    fn phonemes_accept_space_separated_string() {
        let response: VisemeResponse =
            serde_json::from_str(r#"{"phonemes": "HH AH0 L OW1"}"#).unwrap();
        let (audio, input) = response.into_parts();
        assert!(audio.is_none());
        assert_eq!(
            input,
            TimelineInput::Phonemes(vec![
                "HH".to_owned(),
                "AH0".to_owned(),
                "L".to_owned(),
                "OW1".to_owned()
            ])
        );
    }

    #[test]
    fn empty_response_selects_empty_input() {
        let response: VisemeResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(response.into_parts().1, TimelineInput::Empty);
    }

    #[test]
    fn relative_audio_urls_resolve_against_base() {
        let base = Url::parse("http://localhost:8000").unwrap();
        assert_eq!(
            resolve_audio_url(&base, "static/audio/x.mp3").unwrap(),
            "http://localhost:8000/static/audio/x.mp3"
        );
        assert_eq!(
            resolve_audio_url(&base, "https://cdn.example/x.mp3").unwrap(),
            "https://cdn.example/x.mp3"
        );
    }

    #[test]
    fn cache_bust_picks_separator() {
        assert_eq!(cache_bust("http://h/a.mp3", 42), "http://h/a.mp3?_t=42");
        assert_eq!(cache_bust("http://h/a.mp3?v=1", 42), "http://h/a.mp3?v=1&_t=42");
    }

    #[test]
    fn error_detail_is_extracted() {
        assert_eq!(
            extract_error_detail(r#"{"detail":"Text cannot be empty"}"#),
            "Text cannot be empty"
        );
        assert_eq!(extract_error_detail("boom"), "boom");
    }

    #[test]
    fn audio_visemes_accept_bare_or_wrapped_list() {
        let bare: AudioVisemes =
            serde_json::from_str(r#"[{"viseme": "AA", "start": 0.0, "duration": 0.1}]"#).unwrap();
        let wrapped: AudioVisemes = serde_json::from_str(
            r#"{"visemes": [{"viseme": "AA", "start": 0.0, "duration": 0.1}]}"#,
        )
        .unwrap();
        assert_eq!(bare.into_vec(), wrapped.into_vec());
    }

    #[test]
    fn upload_mime_follows_extension() {
        assert_eq!(audio_mime("speech.wav"), "audio/wav");
        assert_eq!(audio_mime("clip.MP3"), "audio/mpeg");
        assert_eq!(audio_mime("noext"), "audio/wav");
    }

    #[test]
    fn invalid_base_url_is_config_error() {
        let config = ServiceConfig {
            base_url: "not a url".to_owned(),
            ..ServiceConfig::default()
        };
        assert!(matches!(HttpPhonemeService::new(&config), Err(LipSyncError::Config(_))));
    }
}
