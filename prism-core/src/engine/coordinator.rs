//! `InteractionCoordinator`: keeps listening and speaking from fighting
//! over the microphone.
//!
//! ## Protocol
//!
//! ```text
//! Started  ─► listening live?  ─► remember, ListeningController::stop()
//!          ─► voice enabled?   ─► start barge-in energy sampling
//! Finished ─► stamp debounce, stop sampling
//!          ─► remembered && continuous requested
//!                 ─► arm resume deadline (now + resume_grace)
//! tick     ─► deadline passed && still silent? ─► start(continuous)
//! Started  ─► also disarms a pending deadline
//! ```
//!
//! The coordinator is the only component that restarts listening after
//! playback. Listening intent (`enable_listening` / `disable_listening`) is
//! recorded here so a resume honours what the user last asked for.
//!
//! Playback events are consumed on a dedicated thread. Broadcast receivers
//! have no blocking timeout, so the thread drains with `try_recv` and sleeps
//! on its shutdown channel between polls. The resume deadline is checked on
//! the same tick, so events keep flowing while a resume is pending.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, error, info, warn};

use super::barge_in::{BargeInMonitor, EnergyInterruption};
use super::listening::ListeningController;
use super::playback::PlaybackController;
use super::VoiceConfig;
use crate::audio::output::AudioSink;
use crate::audio::recorder::EnergyLevel;
use crate::audio::Microphone;
use crate::error::{PrismError, Result};
use crate::ipc::events::PlaybackEvent;
use crate::speech::Transcriber;
use crate::tts::Synthesizer;

/// Event poll interval of the coordinator thread.
const EVENT_POLL: Duration = Duration::from_millis(10);

/// What the user last asked the listening side to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListeningIntent {
    pub enabled: bool,
    pub continuous: bool,
}

struct CoordinatorState {
    intent: ListeningIntent,
    /// Listening was live when a playback started; OR-ed across sessions.
    resume_pending: bool,
    /// When the event thread may restart listening.
    resume_at: Option<Instant>,
}

pub struct InteractionCoordinator {
    listening: Arc<ListeningController>,
    playback: Arc<PlaybackController>,
    monitor: Arc<BargeInMonitor>,
    state: Arc<Mutex<CoordinatorState>>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InteractionCoordinator {
    /// Build both controllers around one microphone and one barge-in
    /// monitor, inject the energy predicate into playback and start the
    /// event thread.
    ///
    /// # Errors
    /// `Io` if the coordinator thread cannot be spawned.
    pub fn new(
        microphone: Arc<dyn Microphone>,
        transcriber: Arc<dyn Transcriber>,
        synthesizer: Arc<dyn Synthesizer>,
        sink: Arc<dyn AudioSink>,
        config: VoiceConfig,
    ) -> Result<Self> {
        let monitor = Arc::new(BargeInMonitor::new(config.debounce_window));
        let level = Arc::new(EnergyLevel::new());
        let predicate = Arc::new(EnergyInterruption::new(
            Arc::clone(&level),
            Arc::clone(&monitor),
            config.barge_in_threshold,
            config.barge_in_max_sample_age,
        ));

        let playback = Arc::new(PlaybackController::new(
            synthesizer,
            sink,
            predicate,
            Arc::clone(&monitor),
            &config,
        ));
        let listening = Arc::new(ListeningController::new(
            microphone,
            transcriber,
            Arc::clone(&monitor),
            level,
            config.clone(),
        ));

        Self::with_controllers(listening, playback, monitor, config.resume_grace)
    }

    /// Coordinate controllers built elsewhere. They must share `monitor`.
    pub fn with_controllers(
        listening: Arc<ListeningController>,
        playback: Arc<PlaybackController>,
        monitor: Arc<BargeInMonitor>,
        resume_grace: Duration,
    ) -> Result<Self> {
        let state = Arc::new(Mutex::new(CoordinatorState {
            intent: ListeningIntent::default(),
            resume_pending: false,
            resume_at: None,
        }));
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let events = playback.subscribe();

        let worker = {
            let ctx = EventLoop {
                listening: Arc::clone(&listening),
                playback: Arc::clone(&playback),
                monitor: Arc::clone(&monitor),
                state: Arc::clone(&state),
                resume_grace,
                shutdown: shutdown_rx,
            };
            std::thread::Builder::new()
                .name("prism-coordinator".into())
                .spawn(move || ctx.run(events))
                .map_err(PrismError::Io)?
        };

        Ok(Self {
            listening,
            playback,
            monitor,
            state,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn listening(&self) -> &Arc<ListeningController> {
        &self.listening
    }

    pub fn playback(&self) -> &Arc<PlaybackController> {
        &self.playback
    }

    pub fn monitor(&self) -> &Arc<BargeInMonitor> {
        &self.monitor
    }

    pub fn intent(&self) -> ListeningIntent {
        self.state.lock().intent
    }

    /// Record the intent and start listening, unless playback currently
    /// owns the microphone; then listening resumes when it finishes.
    pub fn enable_listening(&self, continuous: bool) -> bool {
        let mut state = self.state.lock();
        state.intent = ListeningIntent {
            enabled: true,
            continuous,
        };
        if self.playback.is_active() {
            debug!("playback active, listening deferred until it finishes");
            state.resume_pending = true;
            self.listening.start_energy_sampling();
            return false;
        }
        self.listening.start(continuous)
    }

    /// Stop listening and forget any pending resume.
    pub fn disable_listening(&self) {
        let mut state = self.state.lock();
        state.intent = ListeningIntent::default();
        state.resume_pending = false;
        state.resume_at = None;
        self.listening.stop();
        self.listening.stop_energy_sampling();
    }

    /// Stop everything and join every worker.
    pub fn shutdown(&self) {
        self.disable_listening();
        drop(self.shutdown_tx.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("coordinator thread panicked");
            }
        }
        self.playback.shutdown();
        self.listening.shutdown();
        info!("voice core shut down");
    }
}

// ── Event thread ─────────────────────────────────────────────────────────────

struct EventLoop {
    listening: Arc<ListeningController>,
    playback: Arc<PlaybackController>,
    monitor: Arc<BargeInMonitor>,
    state: Arc<Mutex<CoordinatorState>>,
    resume_grace: Duration,
    shutdown: Receiver<()>,
}

impl EventLoop {
    fn run(self, mut events: broadcast::Receiver<PlaybackEvent>) {
        loop {
            loop {
                match events.try_recv() {
                    Ok(event) => self.handle(event),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Lagged(n)) => warn!("coordinator lagged {n} playback events"),
                    Err(TryRecvError::Closed) => return,
                }
            }
            self.resume_if_due(Instant::now());
            if !self.sleep(EVENT_POLL) {
                return;
            }
        }
    }

    fn handle(&self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Started { session } => {
                let mut state = self.state.lock();
                if state.resume_at.take().is_some() {
                    debug!(session, "pending resume cancelled by new playback");
                }
                if self.listening.stop() {
                    state.resume_pending = true;
                    debug!(session, "listening paused for playback");
                }
                if state.intent.enabled {
                    self.listening.start_energy_sampling();
                }
            }
            PlaybackEvent::Finished { session, reason } => {
                self.monitor.record_playback_end(Instant::now());
                if self.playback.is_active() {
                    debug!(session, "superseded, next session already running");
                    return;
                }
                self.listening.stop_energy_sampling();

                let mut state = self.state.lock();
                if state.resume_pending && state.intent.enabled && state.intent.continuous {
                    debug!(session, ?reason, "listening resumes after grace period");
                    state.resume_at = Some(Instant::now() + self.resume_grace);
                }
            }
        }
    }

    fn resume_if_due(&self, now: Instant) {
        let mut state = self.state.lock();
        match state.resume_at {
            Some(at) if at <= now => state.resume_at = None,
            _ => return,
        }
        let intent = state.intent;
        if !state.resume_pending || !(intent.enabled && intent.continuous) {
            return;
        }
        if self.playback.is_active() {
            debug!("playback restarted during grace period, resume deferred");
            return;
        }
        state.resume_pending = false;
        if self.listening.start(intent.continuous) {
            info!("listening resumed after playback");
        }
    }

    fn sleep(&self, timeout: Duration) -> bool {
        matches!(self.shutdown.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::listening::ListeningState;
    use crate::stub::{SimulatedSink, StubMicrophone, StubSynthesizer, StubTranscriber};

    fn config() -> VoiceConfig {
        VoiceConfig {
            ambient_calibration: Duration::from_millis(20),
            debounce_window: Duration::from_millis(300),
            resume_grace: Duration::from_millis(100),
            ..VoiceConfig::default()
        }
    }

    fn build(speech: Duration) -> (InteractionCoordinator, Arc<StubMicrophone>) {
        build_with(speech, config())
    }

    fn build_with(
        speech: Duration,
        config: VoiceConfig,
    ) -> (InteractionCoordinator, Arc<StubMicrophone>) {
        let mic = Arc::new(StubMicrophone::new(16_000));
        let coordinator = InteractionCoordinator::new(
            mic.clone(),
            Arc::new(StubTranscriber::new()),
            Arc::new(StubSynthesizer::new().with_fixed_duration(speech)),
            Arc::new(SimulatedSink::new()),
            config,
        )
        .expect("coordinator");
        (coordinator, mic)
    }

    fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn playback_pauses_and_resumes_continuous_listening() {
        let (c, _mic) = build(Duration::from_millis(200));
        assert!(c.enable_listening(true));
        assert!(c.listening().is_active());

        c.playback().speak("answer");
        assert!(eventually(Duration::from_secs(1), || !c.listening().is_active()));
        assert!(eventually(Duration::from_millis(150), || c.listening().is_sampling()));

        assert!(eventually(Duration::from_secs(2), || c.listening().is_active()));
        assert!(!c.playback().is_active());
        assert!(!c.listening().is_sampling());
        assert_eq!(c.listening().is_continuous(), Some(true));
        c.shutdown();
    }

    #[test]
    fn disabled_listening_is_not_resumed() {
        let (c, _mic) = build(Duration::from_millis(150));
        c.enable_listening(true);
        c.playback().speak("answer");
        assert!(eventually(Duration::from_secs(1), || !c.listening().is_active()));
        c.disable_listening();

        assert!(eventually(Duration::from_secs(1), || !c.playback().is_active()));
        std::thread::sleep(Duration::from_millis(300));
        assert!(!c.listening().is_active());
        assert_eq!(c.listening().state(), ListeningState::Idle);
        c.shutdown();
    }

    #[test]
    fn idle_listener_stays_idle_after_playback() {
        let (c, mic) = build(Duration::from_millis(100));
        c.playback().speak("hello");
        assert!(eventually(Duration::from_secs(1), || !c.playback().is_active()));
        std::thread::sleep(Duration::from_millis(300));
        assert!(!c.listening().is_active());
        assert_eq!(mic.open_count(), 0, "nothing should touch the microphone");
        assert!(c.monitor().last_playback_end().is_some());
        c.shutdown();
    }

    #[test]
    fn enabling_during_playback_defers_until_it_ends() {
        let (c, _mic) = build(Duration::from_millis(200));
        c.playback().speak("hold on");
        assert!(!c.enable_listening(true));
        assert!(!c.listening().is_active());
        assert!(eventually(Duration::from_secs(2), || c.listening().is_active()));
        c.shutdown();
    }

    #[test]
    fn new_answer_during_resume_grace_pauses_listening_at_once() {
        let (c, mic) = build_with(
            Duration::from_secs(2),
            VoiceConfig {
                resume_grace: Duration::from_millis(500),
                ..config()
            },
        );
        assert!(c.enable_listening(true));
        c.playback().speak("first");
        assert!(eventually(Duration::from_secs(1), || !c.listening().is_active()));
        c.playback().stop();
        assert!(eventually(Duration::from_secs(1), || c.monitor().last_playback_end().is_some()));

        std::thread::sleep(Duration::from_millis(50));
        c.disable_listening();
        assert!(c.enable_listening(true));

        let spoke_at = Instant::now();
        c.playback().speak("second answer");
        assert!(eventually(Duration::from_millis(150), || !c.listening().is_active()));
        assert!(spoke_at.elapsed() < Duration::from_millis(200));
        assert!(eventually(Duration::from_millis(150), || c.listening().is_sampling()));
        std::thread::sleep(Duration::from_millis(50));

        // Only the barge-in sampler holds the microphone from here on.
        let opens = mic.open_count();
        std::thread::sleep(Duration::from_millis(600));
        assert!(c.playback().is_active());
        assert!(!c.listening().is_active());
        assert_eq!(mic.open_count(), opens, "microphone reopened during playback");

        assert!(eventually(Duration::from_secs(3), || c.listening().is_active()));
        c.shutdown();
    }

    #[test]
    fn disable_during_grace_cancels_resume() {
        let (c, _mic) = build_with(
            Duration::from_secs(2),
            VoiceConfig {
                resume_grace: Duration::from_millis(200),
                ..config()
            },
        );
        c.enable_listening(true);
        c.playback().speak("answer");
        assert!(eventually(Duration::from_secs(1), || !c.listening().is_active()));
        c.playback().stop();
        std::thread::sleep(Duration::from_millis(50));
        c.disable_listening();
        std::thread::sleep(Duration::from_millis(400));
        assert!(!c.listening().is_active());
        c.shutdown();
    }

    #[test]
    fn shutdown_is_prompt_and_repeatable() {
        let (c, _mic) = build(Duration::from_secs(5));
        c.enable_listening(true);
        c.playback().speak("a very long answer");
        let started = Instant::now();
        c.shutdown();
        c.shutdown();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!c.playback().is_active());
        assert!(!c.listening().is_active());
    }
}
