//! # Dialtone Voice - Telephony Voice Agent Sessions
//!
//! Bridges one phone call to a conversational pipeline: caller audio streams into a
//! live speech-to-text connection, each finalized utterance becomes one chat
//! completion plus one synthesis call, and the synthesized audio streams back to the
//! caller. Barge-in aware: if the caller starts talking while the agent is speaking,
//! the in-flight reply is cancelled and queued audio is flushed at both ends.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        CallSession                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │  │  Telephony   │→ │ Transcription│→ │    Reply     │      │
//! │  │   (codec)    │  │   Channel    │  │  Pipeline    │      │
//! │  └──────────────┘  └──────────────┘  └──────────────┘      │
//! │         ↑                 ↓ SpeechStarted    ↓ chunks       │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │  │  Telephony   │← │   Playback   │← │   Barge-in   │      │
//! │  │ (media/clear)│  │  Controller  │  │  (cancel +   │      │
//! │  └──────────────┘  └──────────────┘  │    flush)    │      │
//! │                                      └──────────────┘      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod deepgram;
pub mod error;
pub mod llm;
pub mod playback;
pub mod reply;
pub mod session;
pub mod transcription;
pub mod tts;

pub use audio::{split_frames, AudioChunk, AudioEncoding, TELEPHONY_FRAME_BYTES};
pub use codec::{decode_chunk, decode_event, encode_chunk, InboundEvent, OutboundEvent, StreamSid, MAX_FRAME_BYTES};
pub use deepgram::{DeepgramSpeech, DeepgramTranscription};
pub use error::{VoiceError, VoiceResult};
pub use llm::{ChatCompletionsGenerator, PlaceholderGenerator, ReplyGenerator, DEFAULT_CHAT_MODEL, GROQ_API_BASE};
pub use playback::{PlaybackConfig, PlaybackController, PlaybackStats};
pub use reply::{
    FailureCause, ReplyConfig, ReplyEvent, ReplyFailure, ReplyOutcome, ReplyPipeline, ReplyRequest, RunId,
    DEFAULT_SYSTEM_PROMPT,
};
pub use session::{CallServices, CallSession, CallSummary, TelephonyInput, TurnState};
pub use transcription::{
    LinkCommand, PlaceholderTranscription, TranscriptEvent, TranscriptEvents, TranscriptionBackend,
    TranscriptionChannel, TranscriptionConfig, TranscriptionLink,
};
pub use tts::{PlaceholderTts, SpeechSynthesizer};
