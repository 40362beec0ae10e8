//! Speech synthesis backends.

use crate::audio::AudioEncoding;
use crate::error::VoiceResult;
use async_trait::async_trait;

/// Backend that turns reply text into raw audio bytes in the requested encoding
/// (no container, ready to frame for the telephony leg).
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Return empty audio to skip playback for this turn.
    async fn synthesize(&self, text: &str, encoding: AudioEncoding) -> VoiceResult<Vec<u8>>;
}

/// Placeholder TTS: returns empty audio so nothing plays.
#[derive(Debug, Default)]
pub struct PlaceholderTts;

#[async_trait]
impl SpeechSynthesizer for PlaceholderTts {
    async fn synthesize(&self, _text: &str, _encoding: AudioEncoding) -> VoiceResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn placeholder_tts_returns_empty() {
        let out = PlaceholderTts
            .synthesize("hello", AudioEncoding::Mulaw8k)
            .await
            .unwrap();
        assert!(out.is_empty());
    }
}
