//! `ListeningController`: the speech-capture state machine.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──start(continuous)──► Listening ──segment──► Processing ──text──► Listening (continuous)
//!  ▲                              │                       │        └─────► Idle      (single-shot)
//!  └──────────── stop() ──────────┴───────────────────────┘
//! ```
//!
//! Each session gets its own worker thread, active flag and wake channel.
//! `stop()` clears the flag and drops the channel; the worker notices at its
//! next safe point. A worker spawned by a later `start()` joins the previous
//! one before touching the microphone, so two listening loops never capture
//! at once.
//!
//! Events are sent while holding the state lock, after checking that the
//! session is still current. Once `stop()` returns, no speech from that
//! session can be emitted.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, trace, warn};

use super::barge_in::BargeInMonitor;
use super::{VoiceConfig, BROADCAST_CAP};
use crate::audio::recorder::{EnergyLevel, EnergySampler, SegmentRecorder};
use crate::audio::Microphone;
use crate::buffering::segment::AudioSegment;
use crate::error::{ErrorKind, PrismError, Result};
use crate::ipc::events::{ListeningStatus, ListeningStatusEvent, SpeechEvent};
use crate::speech::Transcriber;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListeningState {
    Idle,
    Listening,
    Processing,
}

struct Session {
    id: u64,
    continuous: bool,
    active: Arc<AtomicBool>,
    /// Dropped on stop to wake the worker out of any wait.
    _wake: Sender<()>,
    last_segment_end: Option<Instant>,
}

struct Inner {
    state: ListeningState,
    session: Option<Session>,
    next_id: u64,
    /// Most recent worker; each worker joins its predecessor.
    worker: Option<JoinHandle<()>>,
}

struct Shared {
    microphone: Arc<dyn Microphone>,
    transcriber: Arc<dyn Transcriber>,
    monitor: Arc<BargeInMonitor>,
    level: Arc<EnergyLevel>,
    config: VoiceConfig,
    inner: Mutex<Inner>,
    status_tx: broadcast::Sender<ListeningStatusEvent>,
    speech_tx: broadcast::Sender<SpeechEvent>,
    seq: AtomicU64,
}

/// Owns the listening loop and the barge-in energy sampler.
///
/// `Send + Sync`; share it behind an `Arc`.
pub struct ListeningController {
    shared: Arc<Shared>,
    sampler: Mutex<Option<EnergySampler>>,
}

impl ListeningController {
    pub fn new(
        microphone: Arc<dyn Microphone>,
        transcriber: Arc<dyn Transcriber>,
        monitor: Arc<BargeInMonitor>,
        level: Arc<EnergyLevel>,
        config: VoiceConfig,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (speech_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            shared: Arc::new(Shared {
                microphone,
                transcriber,
                monitor,
                level,
                config,
                inner: Mutex::new(Inner {
                    state: ListeningState::Idle,
                    session: None,
                    next_id: 1,
                    worker: None,
                }),
                status_tx,
                speech_tx,
                seq: AtomicU64::new(0),
            }),
            sampler: Mutex::new(None),
        }
    }

    /// Begin a listening session. Returns `false` (and does nothing) when a
    /// session is already live.
    pub fn start(&self, continuous: bool) -> bool {
        let mut inner = self.shared.inner.lock();
        if inner.session.is_some() {
            debug!("start ignored: already listening");
            return false;
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let active = Arc::new(AtomicBool::new(true));
        let (wake_tx, wake_rx) = bounded::<()>(0);
        inner.session = Some(Session {
            id,
            continuous,
            active: Arc::clone(&active),
            _wake: wake_tx,
            last_segment_end: None,
        });
        inner.state = ListeningState::Listening;
        self.shared.emit_status(ListeningStatus::ListeningStarted, None);
        info!(session = id, continuous, "listening started");

        let previous = inner.worker.take();
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("prism-listening".into())
            .spawn(move || {
                if let Some(previous) = previous {
                    if previous.join().is_err() {
                        error!("previous listening worker panicked");
                    }
                }
                run_session(&shared, id, continuous, &active, &wake_rx);
            });

        match spawned {
            Ok(handle) => {
                inner.worker = Some(handle);
                true
            }
            Err(e) => {
                error!("failed to spawn listening worker: {e}");
                inner.session = None;
                inner.state = ListeningState::Idle;
                self.shared.emit_status(ListeningStatus::ListeningStopped, Some(e.to_string()));
                false
            }
        }
    }

    /// End the live session, if any. Safe from any thread and any state.
    /// Returns `true` if a session was actually stopped.
    pub fn stop(&self) -> bool {
        let mut inner = self.shared.inner.lock();
        let Some(session) = inner.session.take() else {
            return false;
        };
        session.active.store(false, Ordering::Release);
        inner.state = ListeningState::Idle;
        self.shared.emit_status(ListeningStatus::ListeningStopped, None);
        info!(session = session.id, "listening stopped");
        true
    }

    pub fn state(&self) -> ListeningState {
        self.shared.inner.lock().state
    }

    /// `true` while a session is live (Listening or Processing).
    pub fn is_active(&self) -> bool {
        self.shared.inner.lock().session.is_some()
    }

    /// Mode of the live session, if any.
    pub fn is_continuous(&self) -> Option<bool> {
        self.shared
            .inner
            .lock()
            .session
            .as_ref()
            .map(|s| s.continuous)
    }

    /// When the live session last finished capturing a segment.
    pub fn last_segment_end(&self) -> Option<Instant> {
        self.shared
            .inner
            .lock()
            .session
            .as_ref()
            .and_then(|s| s.last_segment_end)
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<ListeningStatusEvent> {
        self.shared.status_tx.subscribe()
    }

    pub fn subscribe_speech(&self) -> broadcast::Receiver<SpeechEvent> {
        self.shared.speech_tx.subscribe()
    }

    /// The live microphone level fed by capture and by the sampler.
    pub fn energy_level(&self) -> Arc<EnergyLevel> {
        Arc::clone(&self.shared.level)
    }

    // ── Barge-in sampling ────────────────────────────────────────────────────

    /// Start publishing microphone energy without recognizing anything.
    /// Returns `false` if sampling was already running or could not start.
    pub fn start_energy_sampling(&self) -> bool {
        let mut sampler = self.sampler.lock();
        if sampler.as_ref().is_some_and(EnergySampler::is_running) {
            return false;
        }
        match EnergySampler::start(
            Arc::clone(&self.shared.microphone),
            Arc::clone(&self.shared.level),
        ) {
            Ok(s) => {
                *sampler = Some(s);
                true
            }
            Err(e) => {
                warn!("could not start energy sampling: {e}");
                false
            }
        }
    }

    pub fn stop_energy_sampling(&self) {
        let taken = self.sampler.lock().take();
        if let Some(mut sampler) = taken {
            sampler.stop();
        }
    }

    pub fn is_sampling(&self) -> bool {
        self.sampler
            .lock()
            .as_ref()
            .is_some_and(EnergySampler::is_running)
    }

    /// Stop everything and wait for the worker threads to exit.
    pub fn shutdown(&self) {
        self.stop();
        self.stop_energy_sampling();
        let worker = self.shared.inner.lock().worker.take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("listening worker panicked");
            }
        }
    }
}

// ── Worker ───────────────────────────────────────────────────────────────────

fn run_session(
    shared: &Shared,
    id: u64,
    continuous: bool,
    active: &AtomicBool,
    wake: &Receiver<()>,
) {
    let span = info_span!("listening_session", session = id);
    let _enter = span.enter();
    let config = &shared.config;

    while active.load(Ordering::Acquire) {
        if let Some(remaining) = shared.monitor.remaining_debounce(Instant::now()) {
            trace!(remaining_ms = remaining.as_millis() as u64, "inside debounce window");
            if !wait(wake, remaining.min(config.idle_poll)) {
                break;
            }
            continue;
        }

        let segment = match shared.capture(id, active) {
            Ok(segment) => segment,
            Err(e) => match e.kind() {
                ErrorKind::Transient => {
                    trace!("no phrase: {e}");
                    continue;
                }
                ErrorKind::Coordination => break,
                ErrorKind::Backend => {
                    warn!("capture failed: {e}");
                    if !wait(wake, config.backend_backoff) {
                        break;
                    }
                    continue;
                }
                ErrorKind::Resource => {
                    error!("microphone unavailable: {e}");
                    shared.abandon(id, &e);
                    break;
                }
            },
        };

        if !active.load(Ordering::Acquire) {
            debug!("stopped during capture, discarding segment");
            break;
        }
        shared.mark_segment_end(id);

        let started = Instant::now();
        match shared.transcriber.transcribe(&segment) {
            Ok(Some(text)) if !text.trim().is_empty() => {
                debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    backend = shared.transcriber.name(),
                    "speech recognized"
                );
                if !shared.deliver(id, text.trim(), continuous) || !continuous {
                    break;
                }
            }
            Ok(_) => {
                debug!("speech not understood");
                shared.set_state(id, ListeningState::Listening);
            }
            Err(e) => match e.kind() {
                ErrorKind::Transient => shared.set_state(id, ListeningState::Listening),
                ErrorKind::Coordination => break,
                ErrorKind::Backend => {
                    warn!("recognition failed: {e}");
                    shared.set_state(id, ListeningState::Listening);
                    if !wait(wake, config.backend_backoff) {
                        break;
                    }
                }
                ErrorKind::Resource => {
                    error!("recognition lost its device: {e}");
                    shared.abandon(id, &e);
                    break;
                }
            },
        }
    }

    debug!("listening worker exiting");
}

/// Sleep up to `timeout`; `false` once the session's wake channel is gone.
fn wait(wake: &Receiver<()>, timeout: Duration) -> bool {
    matches!(wake.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
}

impl Shared {
    /// Open the microphone, calibrate, record one phrase. The stream is
    /// dropped before returning.
    fn capture(&self, id: u64, active: &AtomicBool) -> Result<AudioSegment> {
        let stream = self.microphone.open()?;
        let mut recorder = SegmentRecorder::new(stream, &self.config, Arc::clone(&self.level))?;
        recorder.calibrate()?;
        if !active.load(Ordering::Acquire) {
            return Err(PrismError::Cancelled);
        }
        self.emit_if_current(id, ListeningStatus::ListeningForCommand, None);
        let segment = recorder.record(active)?;
        self.set_state(id, ListeningState::Processing);
        self.emit_if_current(id, ListeningStatus::ProcessingSpeech, None);
        Ok(segment)
    }

    fn emit_status(&self, status: ListeningStatus, detail: Option<String>) {
        let _ = self.status_tx.send(ListeningStatusEvent { status, detail });
    }

    fn emit_if_current(&self, id: u64, status: ListeningStatus, detail: Option<String>) {
        let inner = self.inner.lock();
        if is_current(&inner, id) {
            self.emit_status(status, detail);
        }
    }

    fn set_state(&self, id: u64, state: ListeningState) {
        let mut inner = self.inner.lock();
        if is_current(&inner, id) {
            inner.state = state;
        }
    }

    fn mark_segment_end(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.session.as_mut().filter(|s| s.id == id) {
            session.last_segment_end = Some(Instant::now());
        }
    }

    /// Emit recognized text if the session is still live. A single-shot
    /// session ends here, atomically with the emission.
    fn deliver(&self, id: u64, text: &str, continuous: bool) -> bool {
        let mut inner = self.inner.lock();
        let live = inner
            .session
            .as_ref()
            .is_some_and(|s| s.id == id && s.active.load(Ordering::Acquire));
        if !live {
            debug!("session ended during recognition, discarding text");
            return false;
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        info!(seq, chars = text.len(), "speech delivered");
        let _ = self.speech_tx.send(SpeechEvent {
            seq,
            text: text.to_string(),
        });

        if continuous {
            inner.state = ListeningState::Listening;
        } else {
            end_locked(&mut inner, self, None);
        }
        true
    }

    /// A resource error ends the session; surface it once.
    fn abandon(&self, id: u64, err: &PrismError) {
        let mut inner = self.inner.lock();
        if is_current(&inner, id) {
            end_locked(&mut inner, self, Some(err.to_string()));
        }
    }
}

fn is_current(inner: &Inner, id: u64) -> bool {
    inner.session.as_ref().is_some_and(|s| s.id == id)
}

fn end_locked(inner: &mut Inner, shared: &Shared, unavailable: Option<String>) {
    if let Some(session) = inner.session.take() {
        session.active.store(false, Ordering::Release);
        inner.state = ListeningState::Idle;
        if let Some(detail) = unavailable {
            shared.emit_status(ListeningStatus::MicrophoneUnavailable, Some(detail));
        }
        shared.emit_status(ListeningStatus::ListeningStopped, None);
        info!(session = session.id, "listening session ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::{drain, recv_with_timeout, StubMicrophone, StubReply, StubTranscriber};

    struct Fixture {
        mic: Arc<StubMicrophone>,
        transcriber: Arc<StubTranscriber>,
        monitor: Arc<BargeInMonitor>,
        controller: ListeningController,
    }

    fn test_config() -> VoiceConfig {
        VoiceConfig {
            ambient_calibration: Duration::from_millis(20),
            pause_threshold: Duration::from_millis(100),
            min_phrase_duration: Duration::from_millis(60),
            backend_backoff: Duration::from_millis(50),
            debounce_window: Duration::from_millis(500),
            ..VoiceConfig::default()
        }
    }

    fn fixture(replies: Vec<StubReply>) -> Fixture {
        let config = test_config();
        let mic = Arc::new(StubMicrophone::new(16_000));
        let transcriber = Arc::new(StubTranscriber::with_replies(replies));
        let monitor = Arc::new(BargeInMonitor::new(config.debounce_window));
        let controller = ListeningController::new(
            mic.clone(),
            transcriber.clone(),
            Arc::clone(&monitor),
            Arc::new(EnergyLevel::new()),
            config,
        );
        Fixture {
            mic,
            transcriber,
            monitor,
            controller,
        }
    }

    fn say(mic: &StubMicrophone) {
        mic.push_silence(Duration::from_millis(60));
        mic.push_speech(Duration::from_millis(200), 0.3);
        mic.push_silence(Duration::from_millis(200));
    }

    fn wait_for_state(c: &ListeningController, state: ListeningState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if c.state() == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let f = fixture(vec![]);
        let mut status = f.controller.subscribe_status();
        assert!(!f.controller.stop());
        assert!(!f.controller.stop());
        assert_eq!(f.controller.state(), ListeningState::Idle);
        assert!(drain(&mut status).is_empty());
        f.controller.shutdown();
    }

    #[test]
    fn second_start_is_ignored() {
        let f = fixture(vec![]);
        let mut status = f.controller.subscribe_status();
        assert!(f.controller.start(true));
        assert!(!f.controller.start(true));
        assert!(!f.controller.start(false));
        assert_eq!(f.controller.is_continuous(), Some(true));

        let first = recv_with_timeout(&mut status, Duration::from_secs(1)).expect("status");
        assert_eq!(first.status, ListeningStatus::ListeningStarted);
        let started = drain(&mut status)
            .into_iter()
            .filter(|e| e.status == ListeningStatus::ListeningStarted)
            .count();
        assert_eq!(started, 0, "only one session may start");

        assert!(f.controller.stop());
        f.controller.shutdown();
        assert!(f.mic.open_count() <= 1);
    }

    #[test]
    fn interleaved_start_stop_never_overlaps_capture() {
        let f = fixture(vec![]);
        f.mic.set_background(0.05);
        // (call start?, continuous, pause before the next call in ms)
        let steps = [
            (true, true, 0),
            (false, false, 0),
            (true, false, 0),
            (true, true, 5),
            (false, false, 40),
            (true, true, 30),
            (false, false, 0),
            (false, false, 0),
            (true, false, 60),
            (false, false, 1),
            (true, true, 0),
            (false, false, 0),
            (true, true, 80),
        ];
        for round in 0..4 {
            for &(start, continuous, pause_ms) in &steps {
                if start {
                    f.controller.start(continuous);
                } else {
                    f.controller.stop();
                }
                assert!(f.mic.open_streams() <= 1, "round {round}: overlapping capture");
                std::thread::sleep(Duration::from_millis(pause_ms + round));
            }
        }
        f.controller.stop();
        f.controller.shutdown();

        assert!(f.mic.open_count() > 0, "some session should have reached the microphone");
        assert_eq!(f.mic.max_concurrent_opens(), 1);
        assert_eq!(f.mic.open_streams(), 0);
    }

    #[test]
    fn single_shot_delivers_once_then_idles() {
        let f = fixture(vec![StubReply::Text("hello".into())]);
        let mut speech = f.controller.subscribe_speech();
        say(&f.mic);

        assert!(f.controller.start(false));
        let event = recv_with_timeout(&mut speech, Duration::from_secs(3)).expect("speech");
        assert_eq!(event.text, "hello");
        assert!(wait_for_state(&f.controller, ListeningState::Idle, Duration::from_secs(1)));
        assert!(!f.controller.is_active());

        std::thread::sleep(Duration::from_millis(200));
        assert!(drain(&mut speech).is_empty());
        f.controller.shutdown();
        assert_eq!(f.transcriber.calls(), 1);
    }

    #[test]
    fn continuous_mode_keeps_listening() {
        let f = fixture(vec![
            StubReply::Text("one".into()),
            StubReply::Text("two".into()),
        ]);
        let mut speech = f.controller.subscribe_speech();
        say(&f.mic);
        say(&f.mic);

        f.controller.start(true);
        let a = recv_with_timeout(&mut speech, Duration::from_secs(3)).expect("first");
        let b = recv_with_timeout(&mut speech, Duration::from_secs(3)).expect("second");
        assert_eq!((a.text.as_str(), b.text.as_str()), ("one", "two"));
        assert!(b.seq > a.seq);
        assert!(f.controller.is_active());
        assert!(f.controller.last_segment_end().is_some());

        f.controller.shutdown();
        assert_eq!(f.controller.state(), ListeningState::Idle);
    }

    #[test]
    fn unintelligible_and_backend_failures_keep_looping() {
        let f = fixture(vec![
            StubReply::Unintelligible,
            StubReply::Fail("503".into()),
            StubReply::Text("finally".into()),
        ]);
        let mut speech = f.controller.subscribe_speech();
        for _ in 0..3 {
            say(&f.mic);
        }

        f.controller.start(false);
        let event = recv_with_timeout(&mut speech, Duration::from_secs(5)).expect("speech");
        assert_eq!(event.text, "finally");
        assert_eq!(f.transcriber.calls(), 3);
        f.controller.shutdown();
    }

    #[test]
    fn debounce_window_keeps_microphone_closed() {
        let f = fixture(vec![]);
        let ended = Instant::now();
        f.monitor.record_playback_end(ended);

        f.controller.start(true);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(f.mic.open_count(), 0, "mic opened inside debounce window");

        std::thread::sleep(Duration::from_millis(400));
        let opens = f.mic.open_times();
        assert!(!opens.is_empty(), "mic never opened after the window");
        assert!(opens[0] >= ended + Duration::from_millis(500));
        f.controller.shutdown();
    }

    #[test]
    fn missing_microphone_is_reported_once() {
        let f = fixture(vec![]);
        f.mic.set_unavailable(true);
        let mut status = f.controller.subscribe_status();

        f.controller.start(true);
        assert!(wait_for_state(&f.controller, ListeningState::Idle, Duration::from_secs(1)));
        std::thread::sleep(Duration::from_millis(100));

        let statuses: Vec<_> = drain(&mut status).into_iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![
                ListeningStatus::ListeningStarted,
                ListeningStatus::MicrophoneUnavailable,
                ListeningStatus::ListeningStopped,
            ]
        );

        f.mic.set_unavailable(false);
        assert!(f.controller.start(false), "controller must stay usable");
        f.controller.shutdown();
    }

    #[test]
    fn stop_while_waiting_for_speech_is_prompt() {
        let f = fixture(vec![]);
        f.controller.start(true);
        std::thread::sleep(Duration::from_millis(150));

        let started = Instant::now();
        assert!(f.controller.stop());
        f.controller.shutdown();
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn no_speech_after_stop_returns() {
        let f = fixture(vec![StubReply::Text("late".into())]);
        // recognition outlives the stop
        let slow = Arc::new(
            StubTranscriber::with_replies([StubReply::Text("late".into())])
                .with_delay(Duration::from_millis(300)),
        );
        let controller = ListeningController::new(
            f.mic.clone(),
            slow.clone(),
            Arc::clone(&f.monitor),
            Arc::new(EnergyLevel::new()),
            test_config(),
        );
        let mut speech = controller.subscribe_speech();
        say(&f.mic);

        controller.start(true);
        let deadline = Instant::now() + Duration::from_secs(3);
        while slow.calls() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(slow.calls(), 1, "recognition should be in flight");
        controller.stop();
        controller.shutdown();

        assert!(drain(&mut speech).is_empty());
    }

    #[test]
    fn energy_sampling_toggles() {
        let f = fixture(vec![]);
        f.mic.set_background(0.2);
        assert!(f.controller.start_energy_sampling());
        assert!(!f.controller.start_energy_sampling());
        assert!(f.controller.is_sampling());

        let level = f.controller.energy_level();
        let deadline = Instant::now() + Duration::from_secs(1);
        while level.latest(Duration::from_millis(200)).is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(level.latest(Duration::from_millis(200)).is_some());

        f.controller.stop_energy_sampling();
        assert!(!f.controller.is_sampling());
        f.controller.shutdown();
    }
}
