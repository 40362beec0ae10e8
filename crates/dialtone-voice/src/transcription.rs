//! **TranscriptionChannel** — one long-lived streaming STT connection per call.
//!
//! Backends never call back into the session. A backend's `connect` hands back a
//! [`TranscriptionLink`]: a command queue for audio going in and an event channel for
//! transcripts coming out, both driven by a task the backend owns. The session reads
//! [`TranscriptEvents`] from its own task.

use crate::audio::{AudioChunk, AudioEncoding};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long `close()` waits for the backend to drain before aborting it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Events emitted by the STT backend, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// Interim guess for the current utterance
    PartialText(String),
    /// Finalized utterance (after the end-of-utterance silence threshold)
    FinalText(String),
    /// Caller started speaking
    SpeechStarted,
    /// Backend stream ended
    Closed,
    /// Non-fatal backend error report
    Error(String),
}

/// Streaming STT session configuration
#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    /// Backend model name (e.g. nova-2)
    pub model: String,
    pub encoding: AudioEncoding,
    /// Emit `PartialText` while the caller is still talking
    pub interim_results: bool,
    /// Silence that ends an utterance (default 300ms)
    pub endpointing: Duration,
    /// Request `SpeechStarted` notifications (needed for barge-in)
    pub speech_started_events: bool,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            model: "nova-2".to_string(),
            encoding: AudioEncoding::Mulaw8k,
            interim_results: true,
            endpointing: Duration::from_millis(300),
            speech_started_events: true,
        }
    }
}

/// Commands sent into a backend connection task
#[derive(Debug)]
pub enum LinkCommand {
    Audio(AudioChunk),
    /// Flush pending audio and close gracefully
    Finish,
}

/// A live backend connection: audio in, events out, and the task driving both.
pub struct TranscriptionLink {
    pub commands: mpsc::UnboundedSender<LinkCommand>,
    pub events: mpsc::Receiver<TranscriptEvent>,
    pub task: JoinHandle<()>,
}

/// Backend for streaming speech recognition. Implement for Deepgram or any live STT.
#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    /// Open a streaming session. Errors here are fatal to the call.
    async fn connect(&self, config: &TranscriptionConfig) -> VoiceResult<TranscriptionLink>;
}

/// Receiving half of a transcription channel. Not restartable: once it yields
/// `None` the stream is over.
pub struct TranscriptEvents {
    rx: mpsc::Receiver<TranscriptEvent>,
}

impl TranscriptEvents {
    pub async fn next(&mut self) -> Option<TranscriptEvent> {
        self.rx.recv().await
    }
}

/// Sending half: owns the backend connection for the call's duration.
pub struct TranscriptionChannel {
    commands: mpsc::UnboundedSender<LinkCommand>,
    task: Option<JoinHandle<()>>,
    submitted: u64,
}

impl TranscriptionChannel {
    /// Connect through `backend`. Any failure is reported as [`VoiceError::Connect`].
    pub async fn start(
        backend: &dyn TranscriptionBackend,
        config: &TranscriptionConfig,
    ) -> VoiceResult<(Self, TranscriptEvents)> {
        let link = backend.connect(config).await.map_err(|e| match e {
            VoiceError::Connect(_) => e,
            other => VoiceError::Connect(other.to_string()),
        })?;

        info!(
            model = %config.model,
            endpointing_ms = config.endpointing.as_millis() as u64,
            "Transcription channel ready"
        );

        Ok((
            Self {
                commands: link.commands,
                task: Some(link.task),
                submitted: 0,
            },
            TranscriptEvents { rx: link.events },
        ))
    }

    /// Queue audio for the backend. Never blocks; silently dropped once closed.
    pub fn submit(&mut self, chunk: AudioChunk) {
        if self.task.is_none() {
            return;
        }
        if self.commands.send(LinkCommand::Audio(chunk)).is_ok() {
            self.submitted += 1;
        }
    }

    /// Number of chunks accepted so far
    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }

    /// Graceful shutdown. Idempotent; later calls do nothing.
    pub async fn close(&mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };

        let _ = self.commands.send(LinkCommand::Finish);

        match tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await {
            Ok(_) => debug!(submitted = self.submitted, "Transcription channel closed"),
            Err(_) => {
                warn!("Transcription backend did not finish in {:?}, aborting", CLOSE_TIMEOUT);
                task.abort();
            }
        }
    }
}

impl Drop for TranscriptionChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Placeholder STT: accepts audio and never transcribes anything. Keeps a call up
/// without credentials (the caller just hears nothing back).
#[derive(Debug, Default)]
pub struct PlaceholderTranscription;

#[async_trait]
impl TranscriptionBackend for PlaceholderTranscription {
    async fn connect(&self, _config: &TranscriptionConfig) -> VoiceResult<TranscriptionLink> {
        let (commands, mut command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::channel(16);

        let task = tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                if let LinkCommand::Finish = command {
                    break;
                }
            }
            let _ = event_tx.send(TranscriptEvent::Closed).await;
        });

        Ok(TranscriptionLink {
            commands,
            events,
            task,
        })
    }
}
