//! **ReplyPipeline** — finalized caller text in, framed agent audio out.
//!
//! One run = one chat completion followed by one synthesis call, executed as a single
//! cancellable task. Every event a run emits carries its [`RunId`] so the session can
//! discard anything from a run it has since abandoned.

use crate::audio::{split_frames, AudioChunk, AudioEncoding, TELEPHONY_FRAME_BYTES};
use crate::llm::ReplyGenerator;
use crate::tts::SpeechSynthesizer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identifies one reply run within a call
pub type RunId = u64;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a fast, witty, and helpful AI voice assistant named Nexus. \
    Keep your responses extremely concise (1-2 sentences). \
    You are conversational and friendly. Do not use markdown.";

/// Finalized user text plus the token that cancels this run only.
#[derive(Debug, Clone)]
pub struct ReplyRequest {
    pub run: RunId,
    pub text: String,
    pub cancel: CancellationToken,
}

/// Why an external call did not produce a result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    Timeout,
    Backend(String),
}

/// Turn-level failure. Never retried; the caller hears silence for that turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyFailure {
    GenerationFailed(FailureCause),
    SynthesisFailed(FailureCause),
}

/// What a run produced: zero or more chunks, then exactly one terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Chunk(AudioChunk),
    Done,
    Cancelled,
    Failed(ReplyFailure),
}

impl ReplyOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReplyOutcome::Chunk(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEvent {
    pub run: RunId,
    pub outcome: ReplyOutcome,
}

/// Reply settings shared by every run
#[derive(Debug, Clone)]
pub struct ReplyConfig {
    pub system_prompt: String,
    /// Upper bound on reply length in tokens (default 100)
    pub max_tokens: u32,
    pub generation_timeout: Duration,
    pub synthesis_timeout: Duration,
    /// Outbound frame size in bytes (default 160 = 20ms)
    pub frame_bytes: usize,
    pub encoding: AudioEncoding,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_tokens: 100,
            generation_timeout: Duration::from_secs(10),
            synthesis_timeout: Duration::from_secs(10),
            frame_bytes: TELEPHONY_FRAME_BYTES,
            encoding: AudioEncoding::Mulaw8k,
        }
    }
}

/// Generation + synthesis as one cancellable unit. Clones share the same clients.
#[derive(Clone)]
pub struct ReplyPipeline {
    generator: Arc<dyn ReplyGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    config: ReplyConfig,
}

impl ReplyPipeline {
    pub fn new(
        generator: Arc<dyn ReplyGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        config: ReplyConfig,
    ) -> Self {
        Self {
            generator,
            synthesizer,
            config,
        }
    }

    pub fn config(&self) -> &ReplyConfig {
        &self.config
    }

    /// Start a run on its own task; events arrive on `events` tagged with `request.run`.
    pub fn spawn(&self, request: ReplyRequest, events: mpsc::Sender<ReplyEvent>) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.run(request, events).await })
    }

    /// Run to completion: chunks in production order, then one terminal event.
    pub async fn run(&self, request: ReplyRequest, events: mpsc::Sender<ReplyEvent>) {
        let run = request.run;
        let outcome = self.produce(&request, &events).await;
        match &outcome {
            ReplyOutcome::Done => debug!(run, "Reply run done"),
            ReplyOutcome::Cancelled => debug!(run, "Reply run cancelled"),
            ReplyOutcome::Failed(failure) => warn!(run, ?failure, "Reply run failed"),
            ReplyOutcome::Chunk(_) => {}
        }
        let _ = events.send(ReplyEvent { run, outcome }).await;
    }

    async fn produce(&self, request: &ReplyRequest, events: &mpsc::Sender<ReplyEvent>) -> ReplyOutcome {
        let cancel = &request.cancel;
        if cancel.is_cancelled() {
            return ReplyOutcome::Cancelled;
        }

        info!(run = request.run, text = %request.text, "User said");

        let generated = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ReplyOutcome::Cancelled,
            result = timeout(
                self.config.generation_timeout,
                self.generator.generate(&self.config.system_prompt, &request.text, self.config.max_tokens),
            ) => result,
        };
        let reply_text = match generated {
            Err(_) => return ReplyOutcome::Failed(ReplyFailure::GenerationFailed(FailureCause::Timeout)),
            Ok(Err(e)) => {
                return ReplyOutcome::Failed(ReplyFailure::GenerationFailed(FailureCause::Backend(
                    e.to_string(),
                )))
            }
            Ok(Ok(text)) => text,
        };

        if cancel.is_cancelled() {
            return ReplyOutcome::Cancelled;
        }
        if reply_text.trim().is_empty() {
            warn!(run = request.run, "Empty reply from generator, nothing to say");
            return ReplyOutcome::Done;
        }
        info!(run = request.run, reply = %reply_text, "AI response");

        let synthesized = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ReplyOutcome::Cancelled,
            result = timeout(
                self.config.synthesis_timeout,
                self.synthesizer.synthesize(&reply_text, self.config.encoding),
            ) => result,
        };
        let audio = match synthesized {
            Err(_) => return ReplyOutcome::Failed(ReplyFailure::SynthesisFailed(FailureCause::Timeout)),
            Ok(Err(e)) => {
                return ReplyOutcome::Failed(ReplyFailure::SynthesisFailed(FailureCause::Backend(
                    e.to_string(),
                )))
            }
            Ok(Ok(audio)) => audio,
        };

        for chunk in split_frames(&audio, self.config.frame_bytes, 0) {
            if cancel.is_cancelled() {
                return ReplyOutcome::Cancelled;
            }
            let event = ReplyEvent {
                run: request.run,
                outcome: ReplyOutcome::Chunk(chunk),
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return ReplyOutcome::Cancelled,
                sent = events.send(event) => {
                    if sent.is_err() {
                        // Session is gone; nobody will play this
                        return ReplyOutcome::Cancelled;
                    }
                }
            }
        }

        ReplyOutcome::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{VoiceError, VoiceResult};
    use async_trait::async_trait;

    struct FixedGenerator {
        reply: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl ReplyGenerator for FixedGenerator {
        async fn generate(&self, _system: &str, _user_text: &str, _max_tokens: u32) -> VoiceResult<String> {
            tokio::time::sleep(self.delay).await;
            Ok(self.reply.to_string())
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl ReplyGenerator for FailingGenerator {
        async fn generate(&self, _system: &str, _user_text: &str, _max_tokens: u32) -> VoiceResult<String> {
            Err(VoiceError::Generation("503 service unavailable".to_string()))
        }
    }

    /// One byte of audio per character of text
    struct EchoSynth;

    #[async_trait]
    impl SpeechSynthesizer for EchoSynth {
        async fn synthesize(&self, text: &str, _encoding: AudioEncoding) -> VoiceResult<Vec<u8>> {
            Ok(text.bytes().collect())
        }
    }

    struct BrokenSynth;

    #[async_trait]
    impl SpeechSynthesizer for BrokenSynth {
        async fn synthesize(&self, _text: &str, _encoding: AudioEncoding) -> VoiceResult<Vec<u8>> {
            Err(VoiceError::Synthesis("voice not found".to_string()))
        }
    }

    fn pipeline(generator: impl ReplyGenerator + 'static, synth: impl SpeechSynthesizer + 'static) -> ReplyPipeline {
        ReplyPipeline::new(
            Arc::new(generator),
            Arc::new(synth),
            ReplyConfig {
                frame_bytes: 4,
                generation_timeout: Duration::from_millis(500),
                ..Default::default()
            },
        )
    }

    fn request(run: RunId, text: &str) -> ReplyRequest {
        ReplyRequest {
            run,
            text: text.to_string(),
            cancel: CancellationToken::new(),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<ReplyEvent>) -> Vec<ReplyEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            let terminal = event.outcome.is_terminal();
            out.push(event);
            if terminal {
                break;
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_in_order_then_done() {
        let pipeline = pipeline(
            FixedGenerator {
                reply: "lights on!",
                delay: Duration::from_millis(10),
            },
            EchoSynth,
        );
        let (tx, rx) = mpsc::channel(16);
        pipeline.spawn(request(3, "turn the lights on"), tx);

        let events = collect(rx).await;
        assert!(events.iter().all(|e| e.run == 3));
        assert_eq!(events.last().unwrap().outcome, ReplyOutcome::Done);

        let audio: Vec<u8> = events
            .iter()
            .filter_map(|e| match &e.outcome {
                ReplyOutcome::Chunk(c) => Some(c.payload.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(audio, b"lights on!".to_vec());
        assert_eq!(events.len(), 3 + 1); // 10 bytes in 4-byte frames + Done
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_timeout_is_a_failure_not_a_cancel() {
        let pipeline = pipeline(
            FixedGenerator {
                reply: "too late",
                delay: Duration::from_secs(30),
            },
            EchoSynth,
        );
        let (tx, rx) = mpsc::channel(16);
        pipeline.spawn(request(1, "hello"), tx);

        let events = collect(rx).await;
        assert_eq!(
            events,
            vec![ReplyEvent {
                run: 1,
                outcome: ReplyOutcome::Failed(ReplyFailure::GenerationFailed(FailureCause::Timeout)),
            }]
        );
    }

    #[tokio::test]
    async fn test_backend_errors_are_reported_by_stage() {
        let (tx, rx) = mpsc::channel(16);
        pipeline(FailingGenerator, EchoSynth).spawn(request(1, "hi"), tx);
        match &collect(rx).await[0].outcome {
            ReplyOutcome::Failed(ReplyFailure::GenerationFailed(FailureCause::Backend(msg))) => {
                assert!(msg.contains("503"))
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let (tx, rx) = mpsc::channel(16);
        let generator = FixedGenerator {
            reply: "ok",
            delay: Duration::ZERO,
        };
        pipeline(generator, BrokenSynth).spawn(request(2, "hi"), tx);
        assert!(matches!(
            collect(rx).await[0].outcome,
            ReplyOutcome::Failed(ReplyFailure::SynthesisFailed(FailureCause::Backend(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_generation_emits_no_chunks() {
        let pipeline = pipeline(
            FixedGenerator {
                reply: "never spoken",
                delay: Duration::from_millis(200),
            },
            EchoSynth,
        );
        let (tx, rx) = mpsc::channel(16);
        let req = request(9, "hello");
        let cancel = req.cancel.clone();
        pipeline.spawn(req, tx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let events = collect(rx).await;
        assert_eq!(
            events,
            vec![ReplyEvent {
                run: 9,
                outcome: ReplyOutcome::Cancelled
            }]
        );
    }

    #[tokio::test]
    async fn test_already_cancelled_request_never_calls_out() {
        let (tx, rx) = mpsc::channel(16);
        let req = request(4, "hello");
        req.cancel.cancel();
        pipeline(FailingGenerator, BrokenSynth).spawn(req, tx);
        assert_eq!(collect(rx).await[0].outcome, ReplyOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_empty_reply_is_silent_done() {
        let (tx, rx) = mpsc::channel(16);
        let generator = FixedGenerator {
            reply: "   ",
            delay: Duration::ZERO,
        };
        pipeline(generator, EchoSynth).spawn(request(5, "hmm"), tx);
        assert_eq!(
            collect(rx).await,
            vec![ReplyEvent {
                run: 5,
                outcome: ReplyOutcome::Done
            }]
        );
    }
}
