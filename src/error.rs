//! Error types for the lip-sync pipeline.

/// Top-level error type for lip-sync scheduling and playback.
#[derive(Debug, thiserror::Error)]
pub enum LipSyncError {
    /// Phonemize/TTS service error (bad status, malformed payload).
    #[error("service error: {0}")]
    Service(String),

    /// Audio load or playback error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, LipSyncError>;
