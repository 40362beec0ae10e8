//! Error types for the Dialtone voice session

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while bridging a call
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Speech-to-text session could not be established. Fatal to the call.
    #[error("STT connect error: {0}")]
    Connect(String),

    /// Inbound telephony message that could not be parsed or decoded.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Outbound frame larger than the telephony leg accepts.
    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    /// The telephony leg went away.
    #[error("Transport closed")]
    TransportClosed,

    /// The speech-to-text stream ended while the call was still live.
    #[error("Transcription stream closed: {0}")]
    TranscriptionClosed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl VoiceError {
    /// True for failures that must end the call rather than a single turn.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::Connect(_) | VoiceError::TranscriptionClosed(_)
        )
    }
}
