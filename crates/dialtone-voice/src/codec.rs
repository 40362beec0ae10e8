//! Twilio Media Streams wire format.
//!
//! Inbound: JSON text frames tagged by `event` (`connected`, `start`, `media`, `mark`,
//! `dtmf`, `stop`). Outbound: `media` (base64 mu-law tagged with the stream sid),
//! `clear` and `mark`.

use crate::audio::AudioChunk;
use crate::error::{VoiceError, VoiceResult};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

/// Largest audio payload accepted in one media frame (2 s of 8 kHz mu-law).
pub const MAX_FRAME_BYTES: usize = 16_000;

/// Stream identifier assigned by the telephony provider on `start`
pub type StreamSid = String;

// ============================================================================
// Inbound (telephony -> session)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundEvent {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        version: Option<String>,
    },
    Start {
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: Option<String>,
        start: StreamStart,
    },
    Media {
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: Option<String>,
        media: MediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        mark: MarkPayload,
    },
    Dtmf {
        #[serde(default)]
        dtmf: Option<DtmfPayload>,
    },
    Stop {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
    },
    /// Events this bridge does not act on
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamStart {
    #[serde(rename = "streamSid")]
    pub stream_sid: StreamSid,
    #[serde(rename = "callSid", default)]
    pub call_sid: Option<String>,
    #[serde(rename = "accountSid", default)]
    pub account_sid: Option<String>,
    #[serde(rename = "mediaFormat", default)]
    pub media_format: Option<MediaFormat>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaFormat {
    pub encoding: String,
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
}

fn default_channels() -> u16 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaPayload {
    #[serde(default)]
    pub track: Option<String>,
    #[serde(default)]
    pub chunk: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DtmfPayload {
    #[serde(default)]
    pub digit: Option<String>,
}

// ============================================================================
// Outbound (session -> telephony)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundEvent {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: StreamSid,
        media: OutboundMedia,
    },
    /// Purge audio buffered at the far end
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: StreamSid,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: StreamSid,
        mark: MarkPayload,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}

impl OutboundEvent {
    pub fn clear(stream_sid: &str) -> Self {
        OutboundEvent::Clear {
            stream_sid: stream_sid.to_string(),
        }
    }

    pub fn mark(stream_sid: &str, name: impl Into<String>) -> Self {
        OutboundEvent::Mark {
            stream_sid: stream_sid.to_string(),
            mark: MarkPayload { name: name.into() },
        }
    }

    /// Serialize to the JSON text frame sent over the socket
    pub fn to_wire(&self) -> VoiceResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Parse one inbound text frame.
pub fn decode_event(text: &str) -> VoiceResult<InboundEvent> {
    serde_json::from_str(text).map_err(|e| VoiceError::MalformedPayload(e.to_string()))
}

/// Decode a base64 media payload into an audio chunk.
pub fn decode_chunk(payload: &str, sequence: u64) -> VoiceResult<AudioChunk> {
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| VoiceError::MalformedPayload(format!("media payload: {}", e)))?;
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(VoiceError::MalformedPayload(format!(
            "media payload of {} bytes exceeds {}",
            bytes.len(),
            MAX_FRAME_BYTES
        )));
    }
    Ok(AudioChunk::new(bytes, sequence))
}

/// Wrap an audio chunk into an outbound `media` event for `stream_sid`.
/// Oversized chunks are rejected, never truncated.
pub fn encode_chunk(stream_sid: &str, chunk: &AudioChunk) -> VoiceResult<OutboundEvent> {
    if chunk.len() > MAX_FRAME_BYTES {
        return Err(VoiceError::FrameTooLarge {
            len: chunk.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    Ok(OutboundEvent::Media {
        stream_sid: stream_sid.to_string(),
        media: OutboundMedia {
            payload: STANDARD.encode(&chunk.payload),
        },
    })
}

/// Parse Twilio's numeric-string sequence fields.
pub fn parse_sequence(raw: Option<&str>) -> Option<u64> {
    raw.and_then(|s| s.trim().parse().ok())
}
