//! `PlaybackController`: the speaking state machine.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──speak(text)──► Generating ──audio ready──► Playing ──end of audio──► Idle
//!                           │                          │
//!                           └──── stop() / speak() / barge-in / failure ─────► Idle
//! ```
//!
//! ## Sessions
//!
//! Every `speak()` opens a numbered session and emits `Started` for it
//! immediately; exactly one `Finished` follows, carrying the reason. State
//! transitions happen under the `inner` lock and are keyed by session id, so
//! a stale worker can never finish a newer session. The playback handle lives
//! in the session and is released by whoever ends it, exactly once.
//!
//! Ending a session has two halves. The session is taken out of `inner`
//! first, so `state()` and `is_active()` answer at once. Releasing the
//! handle (which may wait for the device to drain) and emitting `Finished`
//! happen after `inner` is released, under the separate `order` lock that
//! keeps events in session order.
//!
//! ## Workers
//!
//! One session worker synthesizes, starts the sink and waits for the end of
//! audio. While `Playing`, a barge-in watcher thread polls the injected
//! `InterruptionPredicate`. Both wait on the session's cancel channel, which
//! is dropped when the session ends, so they wake immediately.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn};

use super::barge_in::{BargeInMonitor, InterruptionPredicate};
use super::{VoiceConfig, BROADCAST_CAP};
use crate::audio::output::{AudioSink, PlaybackHandle};
use crate::ipc::events::{FinishReason, PlaybackEvent};
use crate::tts::{sanitize_for_speech, Synthesizer};

/// How often the session worker checks for the end of audio.
const END_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Generating,
    Playing,
}

struct Session {
    id: u64,
    state: PlaybackState,
    handle: Option<Box<dyn PlaybackHandle>>,
    /// Dropped when the session ends; wakes the worker and the watcher.
    _cancel: Sender<()>,
}

/// A session already taken out of `inner`, not yet announced.
struct Ending {
    id: u64,
    reason: FinishReason,
    was_playing: bool,
    handle: Option<Box<dyn PlaybackHandle>>,
}

struct Inner {
    session: Option<Session>,
    next_id: u64,
    workers: Vec<JoinHandle<()>>,
}

struct Shared {
    synthesizer: Arc<dyn Synthesizer>,
    sink: Arc<dyn AudioSink>,
    predicate: Arc<dyn InterruptionPredicate>,
    monitor: Arc<BargeInMonitor>,
    barge_in_poll: Duration,
    voice: Mutex<String>,
    /// Held while ending sessions and emitting events. Taken before `inner`.
    order: Mutex<()>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<PlaybackEvent>,
}

/// Owns speech generation, playback and the barge-in watcher.
pub struct PlaybackController {
    shared: Arc<Shared>,
}

impl PlaybackController {
    pub fn new(
        synthesizer: Arc<dyn Synthesizer>,
        sink: Arc<dyn AudioSink>,
        predicate: Arc<dyn InterruptionPredicate>,
        monitor: Arc<BargeInMonitor>,
        config: &VoiceConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            shared: Arc::new(Shared {
                synthesizer,
                sink,
                predicate,
                monitor,
                barge_in_poll: config.barge_in_poll,
                voice: Mutex::new(config.voice.clone()),
                order: Mutex::new(()),
                inner: Mutex::new(Inner {
                    session: None,
                    next_id: 1,
                    workers: Vec::new(),
                }),
                events,
            }),
        }
    }

    /// Speak `text` in the current voice. Returns immediately.
    ///
    /// Any live session is finished (`Superseded`) before the new one starts.
    /// Returns the new session id, or `None` if nothing speakable remained
    /// after sanitizing.
    pub fn speak(&self, text: &str) -> Option<u64> {
        let text = sanitize_for_speech(text);
        if text.is_empty() {
            debug!("nothing speakable, skipping");
            return None;
        }
        let voice = self.shared.voice.lock().clone();

        let _order = self.shared.order.lock();
        let (previous, id, cancel_rx) = {
            let mut inner = self.shared.inner.lock();
            let previous = inner
                .session
                .take()
                .map(|s| self.shared.close(s, FinishReason::Superseded));
            inner.workers.retain(|w| !w.is_finished());

            let id = inner.next_id;
            inner.next_id += 1;
            let (cancel_tx, cancel_rx) = bounded::<()>(0);
            inner.session = Some(Session {
                id,
                state: PlaybackState::Generating,
                handle: None,
                _cancel: cancel_tx,
            });
            (previous, id, cancel_rx)
        };
        if let Some(previous) = previous {
            self.shared.announce(previous);
        }
        let _ = self.shared.events.send(PlaybackEvent::Started { session: id });
        info!(session = id, chars = text.len(), voice = voice.as_str(), "playback session started");

        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("prism-playback-session".into())
            .spawn(move || run_session(&shared, id, &text, &voice, cancel_rx));
        match spawned {
            Ok(handle) => self.shared.inner.lock().workers.push(handle),
            Err(e) => {
                error!("failed to spawn playback worker: {e}");
                self.shared.end_ordered(Some(id), FinishReason::Failed);
            }
        }
        Some(id)
    }

    /// Halt the live session. Idempotent; safe while generation is in
    /// flight (its result is discarded). Returns `true` if a session ended.
    pub fn stop(&self) -> bool {
        self.shared.end_session(None, FinishReason::Stopped)
    }

    pub fn state(&self) -> PlaybackState {
        self.shared
            .inner
            .lock()
            .session
            .as_ref()
            .map_or(PlaybackState::Idle, |s| s.state)
    }

    /// `true` while generating or playing.
    pub fn is_active(&self) -> bool {
        self.shared.inner.lock().session.is_some()
    }

    /// Id of the live session, if any.
    pub fn current_session(&self) -> Option<u64> {
        self.shared.inner.lock().session.as_ref().map(|s| s.id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.shared.events.subscribe()
    }

    /// Voice used by the next `speak()`.
    pub fn set_voice(&self, voice: impl Into<String>) {
        let voice = voice.into();
        info!(voice = voice.as_str(), "voice changed");
        *self.shared.voice.lock() = voice;
    }

    pub fn voice(&self) -> String {
        self.shared.voice.lock().clone()
    }

    pub fn voices(&self) -> Vec<String> {
        self.shared.synthesizer.voices()
    }

    /// Stop and wait for every session worker to exit.
    pub fn shutdown(&self) {
        self.stop();
        let workers = std::mem::take(&mut self.shared.inner.lock().workers);
        for worker in workers {
            if worker.join().is_err() {
                error!("playback worker panicked");
            }
        }
    }
}

// ── Worker ───────────────────────────────────────────────────────────────────

fn run_session(shared: &Arc<Shared>, id: u64, text: &str, voice: &str, cancel: Receiver<()>) {
    let span = info_span!("playback_session", session = id);
    let _enter = span.enter();

    let started = Instant::now();
    let audio = match shared.synthesizer.synthesize(text, voice) {
        Ok(audio) => audio,
        Err(e) => {
            warn!("synthesis failed: {e}");
            shared.end_session(Some(id), FinishReason::Failed);
            return;
        }
    };
    debug!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        duration_ms = audio.duration().as_millis() as u64,
        "speech generated"
    );

    if !shared.is_current(id) {
        debug!("session ended during generation, discarding audio");
        return;
    }

    let handle = match shared.sink.play(audio) {
        Ok(handle) => handle,
        Err(e) => {
            error!("playback failed to start: {e}");
            shared.end_session(Some(id), FinishReason::Failed);
            return;
        }
    };

    if !shared.begin_playing(id, handle) {
        return;
    }

    let watcher = {
        let shared = Arc::clone(shared);
        let cancel = cancel.clone();
        std::thread::Builder::new()
            .name("prism-barge-in".into())
            .spawn(move || watch_for_barge_in(&shared, id, &cancel))
    };
    let watcher = match watcher {
        Ok(w) => Some(w),
        Err(e) => {
            warn!("barge-in watcher unavailable: {e}");
            None
        }
    };

    loop {
        match cancel.recv_timeout(END_POLL) {
            Err(RecvTimeoutError::Timeout) => {
                if shared.playback_finished(id) {
                    shared.end_session(Some(id), FinishReason::Completed);
                    break;
                }
            }
            _ => break,
        }
    }

    if let Some(watcher) = watcher {
        if watcher.join().is_err() {
            error!("barge-in watcher panicked");
        }
    }
}

fn watch_for_barge_in(shared: &Shared, id: u64, cancel: &Receiver<()>) {
    while let Err(RecvTimeoutError::Timeout) = cancel.recv_timeout(shared.barge_in_poll) {
        if shared.predicate.should_interrupt() {
            info!(session = id, "barge-in detected, stopping playback");
            shared.end_session(Some(id), FinishReason::Interrupted);
            return;
        }
    }
}

impl Shared {
    fn is_current(&self, id: u64) -> bool {
        self.inner.lock().session.as_ref().is_some_and(|s| s.id == id)
    }

    /// Install the handle and arm barge-in, unless the session ended while
    /// the sink was opening; then the handle is released here.
    fn begin_playing(&self, id: u64, mut handle: Box<dyn PlaybackHandle>) -> bool {
        {
            let mut inner = self.inner.lock();
            if let Some(session) = inner.session.as_mut().filter(|s| s.id == id) {
                session.handle = Some(handle);
                session.state = PlaybackState::Playing;
                self.monitor.arm();
                debug!("playing");
                return true;
            }
        }
        handle.stop();
        debug!("session ended while the sink was opening");
        false
    }

    fn playback_finished(&self, id: u64) -> bool {
        let inner = self.inner.lock();
        inner
            .session
            .as_ref()
            .filter(|s| s.id == id)
            .and_then(|s| s.handle.as_ref())
            .is_some_and(|h| h.is_finished())
    }

    /// End session `id` (or whichever is live when `None`).
    fn end_session(&self, id: Option<u64>, reason: FinishReason) -> bool {
        let _order = self.order.lock();
        self.end_ordered(id, reason)
    }

    /// `end_session` for callers already holding `order`.
    fn end_ordered(&self, id: Option<u64>, reason: FinishReason) -> bool {
        let ending = {
            let mut inner = self.inner.lock();
            let matches = inner
                .session
                .as_ref()
                .is_some_and(|s| id.map_or(true, |id| s.id == id));
            if !matches {
                return false;
            }
            match inner.session.take() {
                Some(session) => self.close(session, reason),
                None => return false,
            }
        };
        self.announce(ending);
        true
    }

    /// Detach the session and disarm barge-in. Caller holds `inner`.
    /// Dropping the session wakes its worker and watcher.
    fn close(&self, mut session: Session, reason: FinishReason) -> Ending {
        self.monitor.disarm();
        Ending {
            id: session.id,
            reason,
            was_playing: session.state == PlaybackState::Playing,
            handle: session.handle.take(),
        }
    }

    /// Release the audio, stamp a natural end, then emit `Finished`. Caller
    /// holds `order` but not `inner`.
    fn announce(&self, ending: Ending) {
        let Ending {
            id,
            reason,
            was_playing,
            handle,
        } = ending;
        if let Some(mut handle) = handle {
            handle.stop();
        }
        if was_playing && reason == FinishReason::Completed {
            self.monitor.record_playback_end(Instant::now());
        }
        let _ = self.events.send(PlaybackEvent::Finished {
            session: id,
            reason,
        });
        info!(session = id, ?reason, "playback session finished");
    }
}
