//! **CallSession** — per-call orchestrator and turn-taking state machine.
//!
//! One session per telephony connection. Everything the call touches is owned here and
//! driven from a single task: telephony input, transcript events, reply-run events and
//! playback activity are all channels multiplexed by one `select!` loop, so state is
//! never mutated from anywhere else.
//!
//! ```text
//!   telephony ──TelephonyInput──►┐
//!   transcription ──Transcript──►├─► CallSession ──enqueue/flush──► PlaybackController
//!   reply runs ──ReplyEvent─────►┘        │
//!                                         └──spawn(ReplyRequest)──► ReplyPipeline
//! ```
//!
//! Turn states: `Idle` → `Listening` → `Responding` → `Listening`/`Idle`; `Closed` is
//! terminal. A `SpeechStarted` while playback is active is a barge-in: the active run
//! is cancelled and playback is flushed.

use crate::codec::{decode_chunk, decode_event, parse_sequence, InboundEvent, OutboundEvent, StreamSid, StreamStart};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{PlaybackConfig, PlaybackController};
use crate::reply::{ReplyEvent, ReplyOutcome, ReplyPipeline, ReplyRequest, RunId};
use crate::transcription::{
    TranscriptEvent, TranscriptEvents, TranscriptionBackend, TranscriptionChannel, TranscriptionConfig,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Buffered reply events between runs and the session task
const REPLY_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TurnState {
    /// No active generation, playback idle
    Idle,
    /// Waiting for a finalized utterance
    Listening,
    /// A reply run is in flight and/or its audio is playing
    Responding,
    /// Call is over
    Closed,
}

/// What the transport hands the session
#[derive(Debug, Clone)]
pub enum TelephonyInput {
    /// One JSON text frame from the telephony leg
    Frame(String),
    /// Socket closed or errored
    Disconnected,
}

/// Process-wide clients and settings, built once and shared into every call.
pub struct CallServices {
    pub transcription: Arc<dyn TranscriptionBackend>,
    pub pipeline: ReplyPipeline,
    pub transcription_config: TranscriptionConfig,
    pub playback_config: PlaybackConfig,
}

/// End-of-call counters
#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    pub stream_sid: Option<StreamSid>,
    pub call_sid: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub frames_in: u64,
    pub frames_out: u64,
    pub frames_flushed: u64,
    pub malformed_messages: u64,
    pub replies_started: u64,
    pub replies_completed: u64,
    pub replies_failed: u64,
    pub replies_cancelled: u64,
    pub barge_ins: u64,
    pub stale_chunks_discarded: u64,
}

impl CallSummary {
    fn new() -> Self {
        Self {
            stream_sid: None,
            call_sid: None,
            started_at: Utc::now(),
            ended_at: None,
            frames_in: 0,
            frames_out: 0,
            frames_flushed: 0,
            malformed_messages: 0,
            replies_started: 0,
            replies_completed: 0,
            replies_failed: 0,
            replies_cancelled: 0,
            barge_ins: 0,
            stale_chunks_discarded: 0,
        }
    }
}

struct ActiveRun {
    run: RunId,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    chunks: usize,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Flow {
    Continue,
    Stop,
}

pub struct CallSession {
    services: Arc<CallServices>,
    outbound: mpsc::Sender<OutboundEvent>,
    state: TurnState,
    state_tx: watch::Sender<TurnState>,
    transcription: Option<TranscriptionChannel>,
    transcripts: Option<TranscriptEvents>,
    playback: Option<PlaybackController>,
    activity: Option<watch::Receiver<bool>>,
    active_run: Option<ActiveRun>,
    next_run: RunId,
    reply_tx: mpsc::Sender<ReplyEvent>,
    reply_rx: mpsc::Receiver<ReplyEvent>,
    /// Caller audio arrived since the last reply was requested
    audio_since_reply: bool,
    summary: CallSummary,
}

impl CallSession {
    /// `outbound` carries everything the session sends to the telephony leg.
    pub fn new(services: Arc<CallServices>, outbound: mpsc::Sender<OutboundEvent>) -> Self {
        let (state_tx, _) = watch::channel(TurnState::Idle);
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_EVENT_CAPACITY);
        Self {
            services,
            outbound,
            state: TurnState::Idle,
            state_tx,
            transcription: None,
            transcripts: None,
            playback: None,
            activity: None,
            active_run: None,
            next_run: 0,
            reply_tx,
            reply_rx,
            audio_since_reply: false,
            summary: CallSummary::new(),
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Follow state transitions from outside the session task
    pub fn state_watch(&self) -> watch::Receiver<TurnState> {
        self.state_tx.subscribe()
    }

    /// Stream id, once the telephony leg has sent `start`
    pub fn stream_sid(&self) -> Option<&str> {
        self.summary.stream_sid.as_deref()
    }

    pub fn summary(&self) -> CallSummary {
        let mut summary = self.summary.clone();
        if let Some(playback) = &self.playback {
            let stats = playback.stats();
            summary.frames_out = stats.frames_sent;
            summary.frames_flushed = stats.frames_dropped;
        }
        summary
    }

    /// Drive the call until the telephony leg stops or a fatal error occurs. Resources
    /// are released on every exit path.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<TelephonyInput>) -> VoiceResult<CallSummary> {
        let result = self.drive(&mut inbound).await;
        self.close().await;

        let summary = self.summary();
        match &result {
            Ok(()) => info!(
                stream_sid = summary.stream_sid.as_deref().unwrap_or("-"),
                frames_in = summary.frames_in,
                frames_out = summary.frames_out,
                replies = summary.replies_started,
                completed = summary.replies_completed,
                failed = summary.replies_failed,
                cancelled = summary.replies_cancelled,
                barge_ins = summary.barge_ins,
                "Call ended"
            ),
            Err(e) => error!(
                stream_sid = summary.stream_sid.as_deref().unwrap_or("-"),
                error = %e,
                "Call ended with error"
            ),
        }
        result.map(|_| summary)
    }

    async fn drive(&mut self, inbound: &mut mpsc::Receiver<TelephonyInput>) -> VoiceResult<()> {
        loop {
            if self.state == TurnState::Closed {
                return Ok(());
            }

            tokio::select! {
                input = inbound.recv() => {
                    let input = input.unwrap_or(TelephonyInput::Disconnected);
                    if let Flow::Stop = self.on_input(input).await? {
                        return Ok(());
                    }
                }
                Some(event) = self.reply_rx.recv() => {
                    self.on_reply(event);
                }
                event = next_transcript(&mut self.transcripts) => {
                    self.on_transcript(event.unwrap_or(TranscriptEvent::Closed)).await?;
                }
                active = activity_changed(&mut self.activity) => {
                    if !active {
                        self.settle();
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Telephony
    // ------------------------------------------------------------------------

    async fn on_input(&mut self, input: TelephonyInput) -> VoiceResult<Flow> {
        let text = match input {
            TelephonyInput::Frame(text) => text,
            TelephonyInput::Disconnected => {
                info!(
                    stream_sid = self.stream_sid().unwrap_or("-"),
                    reason = %VoiceError::TransportClosed,
                    "Telephony leg disconnected"
                );
                return Ok(Flow::Stop);
            }
        };

        let event = match decode_event(&text) {
            Ok(event) => event,
            Err(e) => {
                self.summary.malformed_messages += 1;
                warn!(error = %e, "Dropping malformed telephony message");
                return Ok(Flow::Continue);
            }
        };

        match event {
            InboundEvent::Connected { protocol, .. } => {
                debug!(?protocol, "Telephony stream connected");
            }
            InboundEvent::Start { start, .. } => self.on_start(start).await?,
            InboundEvent::Media { sequence_number, media } => {
                self.on_media(&media.payload, parse_sequence(sequence_number.as_deref()));
            }
            InboundEvent::Mark { mark, .. } => {
                if let Some(playback) = &self.playback {
                    playback.acknowledge_mark(&mark.name);
                }
            }
            InboundEvent::Dtmf { dtmf } => {
                let digit = dtmf.and_then(|d| d.digit);
                info!(?digit, "DTMF received");
            }
            InboundEvent::Stop { .. } => {
                info!(stream_sid = self.stream_sid().unwrap_or("-"), "Telephony stream stopped");
                self.close().await;
                return Ok(Flow::Stop);
            }
            InboundEvent::Unknown => debug!("Ignoring unknown telephony event"),
        }
        Ok(Flow::Continue)
    }

    async fn on_start(&mut self, start: StreamStart) -> VoiceResult<()> {
        if let Some(current) = self.stream_sid() {
            warn!(
                current,
                ignored = %start.stream_sid,
                "Duplicate start event ignored; stream id is fixed for the call"
            );
            return Ok(());
        }

        if let Some(format) = &start.media_format {
            if format.encoding != "audio/x-mulaw" || format.sample_rate != 8000 {
                warn!(
                    encoding = %format.encoding,
                    sample_rate = format.sample_rate,
                    "Unexpected media format; assuming 8 kHz mu-law"
                );
            }
        }

        info!(
            stream_sid = %start.stream_sid,
            call_sid = start.call_sid.as_deref().unwrap_or("-"),
            "Call started"
        );
        self.summary.stream_sid = Some(start.stream_sid.clone());
        self.summary.call_sid = start.call_sid;

        let (channel, events) = TranscriptionChannel::start(
            self.services.transcription.as_ref(),
            &self.services.transcription_config,
        )
        .await?;
        self.transcription = Some(channel);
        self.transcripts = Some(events);

        let playback = PlaybackController::new(
            start.stream_sid,
            self.outbound.clone(),
            self.services.playback_config.clone(),
        );
        self.activity = Some(playback.subscribe());
        self.playback = Some(playback);

        self.set_state(TurnState::Listening);
        Ok(())
    }

    fn on_media(&mut self, payload: &str, sequence: Option<u64>) {
        let Some(transcription) = self.transcription.as_mut() else {
            debug!("Media before start dropped");
            return;
        };

        let sequence = sequence.unwrap_or(self.summary.frames_in);
        match decode_chunk(payload, sequence) {
            Ok(chunk) => {
                transcription.submit(chunk);
                self.summary.frames_in += 1;
                self.audio_since_reply = true;
                if self.state == TurnState::Idle {
                    self.set_state(TurnState::Listening);
                }
            }
            Err(e) => {
                self.summary.malformed_messages += 1;
                warn!(error = %e, sequence, "Dropping undecodable media frame");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Transcription
    // ------------------------------------------------------------------------

    async fn on_transcript(&mut self, event: TranscriptEvent) -> VoiceResult<()> {
        match event {
            TranscriptEvent::PartialText(text) => debug!(%text, "Partial transcript"),
            TranscriptEvent::FinalText(text) => {
                let text = text.trim();
                if !text.is_empty() {
                    self.start_reply(text.to_string()).await;
                }
            }
            TranscriptEvent::SpeechStarted => {
                let playing = self.playback.as_ref().map_or(false, |p| p.is_active());
                if playing {
                    self.barge_in().await;
                } else {
                    debug!("Speech started while agent is silent");
                }
            }
            TranscriptEvent::Error(message) => warn!(%message, "Transcription backend reported an error"),
            TranscriptEvent::Closed => {
                self.transcripts = None;
                return Err(VoiceError::TranscriptionClosed(
                    "speech-to-text stream ended during the call".to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn start_reply(&mut self, text: String) {
        self.cancel_run();
        // Whatever is still queued or playing belongs to an earlier turn
        if let Some(playback) = &self.playback {
            if playback.is_active() {
                playback.flush().await;
            }
        }

        self.next_run += 1;
        let run = self.next_run;
        let cancel = CancellationToken::new();
        let request = ReplyRequest {
            run,
            text,
            cancel: cancel.clone(),
        };
        let handle = self.services.pipeline.spawn(request, self.reply_tx.clone());

        self.active_run = Some(ActiveRun {
            run,
            cancel,
            handle,
            chunks: 0,
        });
        self.audio_since_reply = false;
        self.summary.replies_started += 1;
        self.set_state(TurnState::Responding);
    }

    async fn barge_in(&mut self) {
        self.summary.barge_ins += 1;
        info!(
            stream_sid = self.stream_sid().unwrap_or("-"),
            run = self.active_run.as_ref().map(|r| r.run),
            "Barge-in: caller interrupted playback"
        );
        self.cancel_run();
        if let Some(playback) = &self.playback {
            playback.flush().await;
        }
        self.set_state(TurnState::Listening);
    }

    /// Abandon the active run and count it as cancelled. Its remaining events,
    /// including a terminal one already queued, arrive tagged with a stale id.
    fn cancel_run(&mut self) {
        if let Some(run) = self.active_run.take() {
            debug!(run = run.run, "Cancelling reply run");
            run.cancel.cancel();
            self.summary.replies_cancelled += 1;
        }
    }

    // ------------------------------------------------------------------------
    // Reply runs
    // ------------------------------------------------------------------------

    fn on_reply(&mut self, event: ReplyEvent) {
        let current = self.active_run.as_ref().map(|r| r.run) == Some(event.run);

        match event.outcome {
            ReplyOutcome::Chunk(chunk) => {
                if !current {
                    self.summary.stale_chunks_discarded += 1;
                    return;
                }
                if let (Some(playback), Some(run)) = (&self.playback, self.active_run.as_mut()) {
                    playback.enqueue(chunk);
                    run.chunks += 1;
                }
            }
            ReplyOutcome::Done => {
                if !current {
                    debug!(run = event.run, "Ignoring completion of a superseded run");
                    return;
                }
                self.summary.replies_completed += 1;
                if let Some(run) = self.active_run.take() {
                    if run.chunks > 0 {
                        if let Some(playback) = &self.playback {
                            playback.mark(format!("reply-{}", run.run));
                        }
                    }
                }
                self.settle();
            }
            ReplyOutcome::Cancelled => {
                // Superseded runs were counted when they were cancelled
                if current {
                    self.summary.replies_cancelled += 1;
                    self.active_run = None;
                    self.settle();
                }
            }
            ReplyOutcome::Failed(failure) => {
                if !current {
                    debug!(run = event.run, ?failure, "Ignoring failure from a superseded run");
                    return;
                }
                self.summary.replies_failed += 1;
                warn!(run = event.run, ?failure, "Reply turn lost; caller hears silence");
                self.active_run = None;
                self.settle();
            }
        }
    }

    /// Leave `Responding` once no run is active and playback has gone idle.
    fn settle(&mut self) {
        if self.state != TurnState::Responding || self.active_run.is_some() {
            return;
        }
        if self.playback.as_ref().map_or(false, |p| p.is_active()) {
            return;
        }
        let next = if self.audio_since_reply {
            TurnState::Listening
        } else {
            TurnState::Idle
        };
        self.set_state(next);
    }

    fn set_state(&mut self, next: TurnState) {
        if self.state == next {
            return;
        }
        debug!(from = ?self.state, to = ?next, "Turn state");
        self.state = next;
        self.state_tx.send_replace(next);
    }

    /// Cancel the active run, stop playback and close transcription. Idempotent.
    pub async fn close(&mut self) {
        if self.state == TurnState::Closed {
            return;
        }

        if let Some(run) = self.active_run.take() {
            run.cancel.cancel();
            run.handle.abort();
            self.summary.replies_cancelled += 1;
        }
        if let Some(playback) = self.playback.as_mut() {
            playback.close();
        }
        self.transcripts = None;
        self.activity = None;
        if let Some(transcription) = self.transcription.as_mut() {
            transcription.close().await;
        }
        self.summary.ended_at = Some(Utc::now());
        self.set_state(TurnState::Closed);
    }
}

async fn next_transcript(events: &mut Option<TranscriptEvents>) -> Option<TranscriptEvent> {
    match events {
        Some(events) => events.next().await,
        None => std::future::pending().await,
    }
}

/// Resolves with the new activity flag; pends forever without a playback controller.
async fn activity_changed(activity: &mut Option<watch::Receiver<bool>>) -> bool {
    match activity {
        Some(rx) => match rx.changed().await {
            Ok(()) => *rx.borrow_and_update(),
            Err(_) => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::PlaceholderGenerator;
    use crate::reply::ReplyConfig;
    use crate::transcription::PlaceholderTranscription;
    use crate::tts::PlaceholderTts;

    fn services() -> Arc<CallServices> {
        Arc::new(CallServices {
            transcription: Arc::new(PlaceholderTranscription),
            pipeline: ReplyPipeline::new(
                Arc::new(PlaceholderGenerator::default()),
                Arc::new(PlaceholderTts),
                ReplyConfig::default(),
            ),
            transcription_config: TranscriptionConfig::default(),
            playback_config: PlaybackConfig::default(),
        })
    }

    fn start_frame(sid: &str) -> String {
        format!(
            r#"{{"event":"start","sequenceNumber":"1","start":{{"streamSid":"{}","callSid":"CA123","mediaFormat":{{"encoding":"audio/x-mulaw","sampleRate":8000,"channels":1}}}}}}"#,
            sid
        )
    }

    #[tokio::test]
    async fn test_close_twice_is_quiet() {
        let (tx, _rx) = mpsc::channel(16);
        let mut session = CallSession::new(services(), tx);
        session.on_input(TelephonyInput::Frame(start_frame("MZ1"))).await.unwrap();
        assert_eq!(session.state(), TurnState::Listening);

        session.close().await;
        let first_end = session.summary().ended_at;
        session.close().await;

        assert_eq!(session.state(), TurnState::Closed);
        assert_eq!(session.summary().ended_at, first_end);
    }

    #[tokio::test]
    async fn test_media_before_start_is_dropped() {
        let (tx, _rx) = mpsc::channel(16);
        let mut session = CallSession::new(services(), tx);
        let media = r#"{"event":"media","sequenceNumber":"2","media":{"payload":"//8="}}"#;
        session.on_input(TelephonyInput::Frame(media.to_string())).await.unwrap();

        assert_eq!(session.summary().frames_in, 0);
        assert_eq!(session.state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn test_stream_id_is_fixed_by_first_start() {
        let (tx, _rx) = mpsc::channel(16);
        let mut session = CallSession::new(services(), tx);
        session.on_input(TelephonyInput::Frame(start_frame("MZ1"))).await.unwrap();
        session.on_input(TelephonyInput::Frame(start_frame("MZ2"))).await.unwrap();

        assert_eq!(session.stream_sid(), Some("MZ1"));
        session.close().await;
    }

    #[tokio::test]
    async fn test_superseded_run_counts_once_even_if_it_already_finished() {
        let (tx, _rx) = mpsc::channel(16);
        let mut session = CallSession::new(services(), tx);
        session.on_input(TelephonyInput::Frame(start_frame("MZ1"))).await.unwrap();

        session.start_reply("first".to_string()).await;
        // Let run 1 finish so its Done sits unread in the reply queue
        let first = session.active_run.as_mut().unwrap();
        (&mut first.handle).await.unwrap();

        session.start_reply("second".to_string()).await;
        let second = session.active_run.as_mut().unwrap();
        assert_eq!(second.run, 2);
        (&mut second.handle).await.unwrap();

        while let Ok(event) = session.reply_rx.try_recv() {
            session.on_reply(event);
        }

        let summary = session.summary();
        assert_eq!(summary.replies_started, 2);
        assert_eq!(summary.replies_cancelled, 1);
        assert_eq!(summary.replies_completed, 1);
        assert!(session.active_run.is_none());
        session.close().await;
    }

    #[tokio::test]
    async fn test_malformed_messages_are_counted_not_fatal() {
        let (tx, _rx) = mpsc::channel(16);
        let mut session = CallSession::new(services(), tx);
        let flow = session
            .on_input(TelephonyInput::Frame("{not json".to_string()))
            .await
            .unwrap();
        assert!(matches!(flow, Flow::Continue));

        session.on_input(TelephonyInput::Frame(start_frame("MZ1"))).await.unwrap();
        let bad_media = r#"{"event":"media","media":{"payload":"***"}}"#;
        session.on_input(TelephonyInput::Frame(bad_media.to_string())).await.unwrap();

        assert_eq!(session.summary().malformed_messages, 2);
        assert_eq!(session.state(), TurnState::Listening);
        session.close().await;
    }
}
