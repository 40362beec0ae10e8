//! **PlaybackController** — the only path agent audio takes toward the caller.
//!
//! Frames are queued locally and released by a transmitter task, paced so that at most
//! `max_lead` of audio is outstanding at the far end. `flush()` and the transmitter
//! serialize on the same send gate, so a flush always wins: anything still queued when
//! the flush takes the gate is dropped, and the `clear` goes out after the last frame
//! that made it onto the wire.
//!
//! ```text
//! enqueue ──► [queue] ──► transmitter ──► gate(outbound tx) ──► telephony
//!                             ▲                  ▲
//!                           wake               flush (clear)
//! ```

use crate::audio::AudioChunk;
use crate::codec::{encode_chunk, OutboundEvent, StreamSid};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Maximum audio sent ahead of the far end's playout position
    pub max_lead: Duration,
    /// Extra time a sent mark may take to come back before playback counts as idle
    pub mark_grace: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            max_lead: Duration::from_secs(1),
            mark_grace: Duration::from_millis(500),
        }
    }
}

/// Counters for the call summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    /// Frames the codec refused to encode; never sent
    pub frames_rejected: u64,
    pub clears_sent: u64,
    pub marks_sent: u64,
}

#[derive(Debug)]
enum Outgoing {
    Frame(AudioChunk),
    Mark(String),
}

struct PlaybackState {
    queue: VecDeque<Outgoing>,
    /// Estimated instant at which the far end finishes playing what we already sent
    playout_until: Instant,
    pending_mark: Option<String>,
    stats: PlaybackStats,
    closed: bool,
}

impl PlaybackState {
    fn idle_at(&self, grace: Duration) -> Instant {
        match self.pending_mark {
            Some(_) => self.playout_until + grace,
            None => self.playout_until,
        }
    }

    fn is_active(&self, now: Instant, grace: Duration) -> bool {
        !self.queue.is_empty() || now < self.idle_at(grace)
    }
}

struct Shared {
    stream_sid: StreamSid,
    config: PlaybackConfig,
    state: Mutex<PlaybackState>,
    /// Held across every outbound send, by the transmitter and by `flush`
    gate: tokio::sync::Mutex<mpsc::Sender<OutboundEvent>>,
    wake: Notify,
    active: watch::Sender<bool>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, PlaybackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish activity; called with the state lock held so readers never see a stale flag.
    fn publish(&self, state: &PlaybackState, now: Instant) {
        let active = !state.closed && state.is_active(now, self.config.mark_grace);
        self.active.send_if_modified(|current| {
            if *current != active {
                *current = active;
                true
            } else {
                false
            }
        });
    }
}

enum Step {
    Send,
    WaitUntil(Instant),
    WaitForWork,
    Stop,
}

/// Owns the playback queue for one call. Only exists once the stream id is known,
/// so no audio can leave before `start`.
pub struct PlaybackController {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl PlaybackController {
    pub fn new(stream_sid: StreamSid, outbound: mpsc::Sender<OutboundEvent>, config: PlaybackConfig) -> Self {
        let (active, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            stream_sid,
            config,
            state: Mutex::new(PlaybackState {
                queue: VecDeque::new(),
                playout_until: Instant::now(),
                pending_mark: None,
                stats: PlaybackStats::default(),
                closed: false,
            }),
            gate: tokio::sync::Mutex::new(outbound),
            wake: Notify::new(),
            active,
        });

        let task = tokio::spawn(transmit(Arc::clone(&shared)));
        Self {
            shared,
            task: Some(task),
        }
    }

    pub fn stream_sid(&self) -> &str {
        &self.shared.stream_sid
    }

    /// Append a frame; frames go out in the order they were enqueued.
    pub fn enqueue(&self, chunk: AudioChunk) {
        self.push(Outgoing::Frame(chunk));
    }

    /// Queue a named mark behind the frames already enqueued. The far end echoes it
    /// once everything before it has played.
    pub fn mark(&self, name: impl Into<String>) {
        self.push(Outgoing::Mark(name.into()));
    }

    fn push(&self, item: Outgoing) {
        {
            let mut state = self.shared.state();
            if state.closed {
                return;
            }
            state.queue.push_back(item);
            self.shared.publish(&state, Instant::now());
        }
        self.shared.wake.notify_one();
    }

    /// Drop everything not yet sent and tell the far end to purge its buffer.
    /// Returns the number of frames discarded locally.
    pub async fn flush(&self) -> usize {
        let gate = self.shared.gate.lock().await;

        let dropped = {
            let mut state = self.shared.state();
            if state.closed {
                return 0;
            }
            let dropped = discard(&mut state);
            self.shared.publish(&state, Instant::now());
            dropped
        };

        let clear = OutboundEvent::clear(&self.shared.stream_sid);
        if gate.send(clear).await.is_err() {
            debug!("Outbound closed before clear could be sent");
        }

        // Anything that slipped in while the clear was in flight is stale too
        let late = {
            let mut state = self.shared.state();
            state.stats.clears_sent += 1;
            let late = discard(&mut state);
            self.shared.publish(&state, Instant::now());
            late
        };
        drop(gate);

        info!(
            stream_sid = %self.shared.stream_sid,
            dropped = dropped + late,
            "Playback flushed"
        );
        dropped + late
    }

    /// Far end reported a mark as played. Unknown or stale names are ignored.
    pub fn acknowledge_mark(&self, name: &str) {
        {
            let mut state = self.shared.state();
            if state.pending_mark.as_deref() != Some(name) {
                debug!(mark = name, "Ignoring mark that is not pending");
                return;
            }
            state.pending_mark = None;
            let now = Instant::now();
            if state.playout_until > now {
                state.playout_until = now;
            }
            self.shared.publish(&state, now);
        }
        self.shared.wake.notify_one();
    }

    /// Non-idle while any frame is queued or presumed still playing.
    pub fn is_active(&self) -> bool {
        let state = self.shared.state();
        !state.closed && state.is_active(Instant::now(), self.shared.config.mark_grace)
    }

    /// Activity changes, published by the controller as they happen.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shared.active.subscribe()
    }

    pub fn stats(&self) -> PlaybackStats {
        self.shared.state().stats
    }

    /// Stop transmitting and drop the queue. Idempotent.
    pub fn close(&mut self) {
        {
            let mut state = self.shared.state();
            if !state.closed {
                state.closed = true;
                discard(&mut state);
                self.shared.publish(&state, Instant::now());
            }
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.close();
    }
}

/// Empty the queue and forget the far end's buffer. Returns the frames dropped.
fn discard(state: &mut PlaybackState) -> usize {
    let dropped = state
        .queue
        .drain(..)
        .filter(|item| matches!(item, Outgoing::Frame(_)))
        .count();
    state.stats.frames_dropped += dropped as u64;
    state.pending_mark = None;
    state.playout_until = Instant::now();
    dropped
}

fn next_step(shared: &Shared) -> Step {
    let now = Instant::now();
    let state = shared.state();
    if state.closed {
        return Step::Stop;
    }
    shared.publish(&state, now);

    match state.queue.front() {
        Some(Outgoing::Mark(_)) => Step::Send,
        Some(Outgoing::Frame(_)) => {
            let release_at = state
                .playout_until
                .checked_sub(shared.config.max_lead)
                .unwrap_or(now);
            if release_at > now {
                Step::WaitUntil(release_at)
            } else {
                Step::Send
            }
        }
        None => {
            let idle_at = state.idle_at(shared.config.mark_grace);
            if idle_at > now {
                // Wake when the far end should have drained, to publish idle
                Step::WaitUntil(idle_at)
            } else {
                Step::WaitForWork
            }
        }
    }
}

async fn transmit(shared: Arc<Shared>) {
    loop {
        match next_step(&shared) {
            Step::Stop => break,
            Step::WaitForWork => shared.wake.notified().await,
            Step::WaitUntil(at) => {
                tokio::select! {
                    _ = shared.wake.notified() => {}
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            Step::Send => {
                let gate = shared.gate.lock().await;

                // Pop only while holding the gate; a flush may have emptied the queue
                let event = {
                    let mut state = shared.state();
                    if state.closed {
                        break;
                    }
                    let Some(item) = state.queue.pop_front() else {
                        continue;
                    };
                    match item {
                        Outgoing::Frame(chunk) => match encode_chunk(&shared.stream_sid, &chunk) {
                            Ok(event) => {
                                state.playout_until = state.playout_until.max(Instant::now()) + chunk.duration();
                                state.stats.frames_sent += 1;
                                event
                            }
                            Err(e) => {
                                state.stats.frames_rejected += 1;
                                warn!(error = %e, sequence = chunk.sequence, "Dropping unencodable frame");
                                continue;
                            }
                        },
                        Outgoing::Mark(name) => {
                            state.pending_mark = Some(name.clone());
                            state.stats.marks_sent += 1;
                            OutboundEvent::mark(&shared.stream_sid, name)
                        }
                    }
                };

                if gate.send(event).await.is_err() {
                    debug!(stream_sid = %shared.stream_sid, "Outbound closed, transmitter stopping");
                    let mut state = shared.state();
                    state.closed = true;
                    discard(&mut state);
                    shared.publish(&state, Instant::now());
                    break;
                }
            }
        }
    }
}
