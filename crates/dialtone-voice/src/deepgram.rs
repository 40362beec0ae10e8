//! Deepgram adapters: live transcription over WebSocket and REST speech synthesis.
//!
//! # Live transcription flow
//!
//! 1. Connect to `wss://api.deepgram.com/v1/listen?...` with `Authorization: Token <key>`
//! 2. Stream raw mu-law audio as binary frames
//! 3. Receive `Results` (interim / final) and `SpeechStarted` messages
//! 4. Send `{"type":"CloseStream"}` and drain until the server closes
//!
//! Deepgram drops idle sockets after ~10s without audio, so a `KeepAlive` text frame
//! goes out whenever no audio was sent for `keepalive_interval`.

use crate::audio::AudioEncoding;
use crate::error::{VoiceError, VoiceResult};
use crate::transcription::{
    LinkCommand, TranscriptEvent, TranscriptionBackend, TranscriptionConfig, TranscriptionLink,
};
use crate::tts::SpeechSynthesizer;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, info, warn};

pub const DEEPGRAM_LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";
pub const DEEPGRAM_SPEAK_URL: &str = "https://api.deepgram.com/v1/speak";
pub const DEFAULT_SPEAK_MODEL: &str = "aura-asteria-en";

/// Connection timeout for the WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CHANNEL_SIZE: usize = 64;

// ============================================================================
// Live transcription protocol
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum LiveMessage {
    Results {
        channel: ResultsChannel,
        #[serde(default)]
        is_final: bool,
    },
    SpeechStarted {
        #[serde(default)]
        timestamp: Option<f64>,
    },
    Error {
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    /// `Metadata`, `UtteranceEnd` and anything newer
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResultsChannel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

/// Map a Deepgram message to a transcript event. Empty transcripts are skipped.
fn translate(message: LiveMessage) -> Option<TranscriptEvent> {
    match message {
        LiveMessage::Results { channel, is_final } => {
            let text = channel
                .alternatives
                .into_iter()
                .next()
                .map(|a| a.transcript.trim().to_string())
                .unwrap_or_default();
            if text.is_empty() {
                None
            } else if is_final {
                Some(TranscriptEvent::FinalText(text))
            } else {
                Some(TranscriptEvent::PartialText(text))
            }
        }
        LiveMessage::SpeechStarted { timestamp } => {
            debug!(?timestamp, "Deepgram detected speech start");
            Some(TranscriptEvent::SpeechStarted)
        }
        LiveMessage::Error {
            description,
            message,
        } => Some(TranscriptEvent::Error(
            description
                .or(message)
                .unwrap_or_else(|| "unknown Deepgram error".to_string()),
        )),
        LiveMessage::Other => None,
    }
}

/// Build the listen URL for a session config.
fn listen_url(base: &str, config: &TranscriptionConfig) -> VoiceResult<reqwest::Url> {
    let endpointing = config.endpointing.as_millis().to_string();
    let sample_rate = config.encoding.sample_rate().to_string();
    reqwest::Url::parse_with_params(
        base,
        &[
            ("model", config.model.as_str()),
            ("encoding", config.encoding.wire_name()),
            ("sample_rate", sample_rate.as_str()),
            ("channels", "1"),
            ("interim_results", bool_param(config.interim_results)),
            ("endpointing", endpointing.as_str()),
            ("vad_events", bool_param(config.speech_started_events)),
        ],
    )
    .map_err(|e| VoiceError::Config(format!("bad Deepgram URL: {}", e)))
}

fn bool_param(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Deepgram live transcription backend. Cheap to clone; one per process.
#[derive(Debug, Clone)]
pub struct DeepgramTranscription {
    api_key: String,
    base_url: String,
    keepalive_interval: Duration,
}

impl DeepgramTranscription {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into().trim().to_string(),
            base_url: DEEPGRAM_LISTEN_URL.to_string(),
            keepalive_interval: Duration::from_secs(5),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }
}

#[async_trait]
impl TranscriptionBackend for DeepgramTranscription {
    async fn connect(&self, config: &TranscriptionConfig) -> VoiceResult<TranscriptionLink> {
        let url = listen_url(&self.base_url, config)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| VoiceError::Connect(e.to_string()))?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Token {}", self.api_key))
                .map_err(|e| VoiceError::Connect(e.to_string()))?,
        );

        info!(model = %config.model, "Connecting to Deepgram live transcription...");

        let (ws_stream, _response) = timeout(CONNECTION_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| VoiceError::Connect("Deepgram connection timeout".to_string()))?
            .map_err(|e| VoiceError::Connect(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (commands, mut command_rx) = mpsc::unbounded_channel::<LinkCommand>();
        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let keepalive_interval = self.keepalive_interval;

        let task = tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(keepalive_interval);
            let mut last_sent = Instant::now();
            let mut finishing = false;

            loop {
                tokio::select! {
                    command = command_rx.recv(), if !finishing => match command {
                        Some(LinkCommand::Audio(chunk)) => {
                            if let Err(e) = write.send(Message::Binary(chunk.payload)).await {
                                warn!("Deepgram audio send failed: {}", e);
                                let _ = event_tx.send(TranscriptEvent::Error(e.to_string())).await;
                                break;
                            }
                            last_sent = Instant::now();
                        }
                        Some(LinkCommand::Finish) | None => {
                            debug!("Closing Deepgram stream");
                            finishing = true;
                            let close = r#"{"type":"CloseStream"}"#.to_string();
                            if write.send(Message::Text(close)).await.is_err() {
                                break;
                            }
                        }
                    },
                    message = read.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<LiveMessage>(&text) {
                                Ok(parsed) => {
                                    if let Some(event) = translate(parsed) {
                                        if event_tx.send(event).await.is_err() {
                                            debug!("Transcript receiver dropped");
                                            break;
                                        }
                                    }
                                }
                                Err(e) => warn!("Unparseable Deepgram message: {}", e),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Deepgram stream closed");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!("Deepgram socket error: {}", e);
                            let _ = event_tx.send(TranscriptEvent::Error(e.to_string())).await;
                            break;
                        }
                        Some(Ok(_)) => {} // ping/pong/binary
                    },
                    _ = keepalive.tick(), if !finishing => {
                        if last_sent.elapsed() >= keepalive_interval {
                            let ping = r#"{"type":"KeepAlive"}"#.to_string();
                            if write.send(Message::Text(ping)).await.is_err() {
                                break;
                            }
                            last_sent = Instant::now();
                        }
                    }
                }
            }

            let _ = write.close().await;
            let _ = event_tx.send(TranscriptEvent::Closed).await;
        });

        Ok(TranscriptionLink {
            commands,
            events,
            task,
        })
    }
}

// ============================================================================
// Speech synthesis
// ============================================================================

/// Deepgram speak (REST). Returns raw audio with no container.
#[derive(Debug, Clone)]
pub struct DeepgramSpeech {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl DeepgramSpeech {
    pub fn new(api_key: impl Into<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            api_key: api_key.into().trim().to_string(),
            base_url: DEEPGRAM_SPEAK_URL.to_string(),
            model: DEFAULT_SPEAK_MODEL.to_string(),
            client,
        })
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    fn speak_url(&self, encoding: AudioEncoding) -> VoiceResult<reqwest::Url> {
        let sample_rate = encoding.sample_rate().to_string();
        reqwest::Url::parse_with_params(
            &self.base_url,
            &[
                ("model", self.model.as_str()),
                ("encoding", encoding.wire_name()),
                ("sample_rate", sample_rate.as_str()),
                ("container", "none"),
            ],
        )
        .map_err(|e| VoiceError::Config(format!("bad Deepgram URL: {}", e)))
    }
}

#[async_trait]
impl SpeechSynthesizer for DeepgramSpeech {
    async fn synthesize(&self, text: &str, encoding: AudioEncoding) -> VoiceResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let res = self
            .client
            .post(self.speak_url(encoding)?)
            .header("Authorization", format!("Token {}", self.api_key))
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Synthesis(format!(
                "speak API error {}: {}",
                status, body
            )));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
