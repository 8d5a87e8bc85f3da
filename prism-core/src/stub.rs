//! Offline stand-ins for every device and backend.
//!
//! Used by `prism --offline` and by the test suite. Everything here runs in
//! real time: a stub microphone delivers samples no faster than a real one
//! would, and a simulated playback lasts as long as its audio.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::debug;

use crate::audio::output::{AudioSink, PlaybackHandle};
use crate::audio::{CaptureStream, Microphone};
use crate::buffering::segment::{AudioSegment, SynthesizedAudio};
use crate::error::{PrismError, Result};
use crate::speech::Transcriber;
use crate::tts::Synthesizer;

// ── Microphone ───────────────────────────────────────────────────────────────

#[derive(Debug)]
struct MicState {
    queued: VecDeque<f32>,
    /// Amplitude of the square wave played once the queue runs dry.
    background: f32,
    /// Flips every sample so the background has zero mean.
    phase: bool,
}

/// A microphone fed from a script.
///
/// All streams opened from one `StubMicrophone` read the same queue, the way
/// two streams on one device hear the same room.
#[derive(Debug)]
pub struct StubMicrophone {
    sample_rate: u32,
    state: Arc<Mutex<MicState>>,
    opens: AtomicUsize,
    open_times: Mutex<Vec<Instant>>,
    live: Arc<LiveStreams>,
    unavailable: AtomicBool,
}

/// Streams currently open, and the most ever open at once.
#[derive(Debug, Default)]
struct LiveStreams {
    now: AtomicUsize,
    peak: AtomicUsize,
}

impl StubMicrophone {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            state: Arc::new(Mutex::new(MicState {
                queued: VecDeque::new(),
                background: 0.0,
                phase: false,
            })),
            opens: AtomicUsize::new(0),
            open_times: Mutex::new(Vec::new()),
            live: Arc::new(LiveStreams::default()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Queue a loud square wave with RMS `amplitude`.
    pub fn push_speech(&self, span: Duration, amplitude: f32) {
        let n = self.samples_in(span);
        let mut state = self.state.lock();
        for i in 0..n {
            let s = if i % 2 == 0 { amplitude } else { -amplitude };
            state.queued.push_back(s);
        }
    }

    pub fn push_silence(&self, span: Duration) {
        let n = self.samples_in(span);
        self.state.lock().queued.extend(std::iter::repeat(0.0).take(n));
    }

    /// Level heard whenever nothing is queued.
    pub fn set_background(&self, amplitude: f32) {
        self.state.lock().background = amplitude;
    }

    /// Make every following `open()` fail like a missing device.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Acquire)
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.open_times.lock().clone()
    }

    /// Streams not yet dropped.
    pub fn open_streams(&self) -> usize {
        self.live.now.load(Ordering::Acquire)
    }

    /// Highest number of streams that were ever open at the same time.
    pub fn max_concurrent_opens(&self) -> usize {
        self.live.peak.load(Ordering::Acquire)
    }

    fn samples_in(&self, span: Duration) -> usize {
        (span.as_secs_f64() * self.sample_rate as f64).round() as usize
    }
}

impl Microphone for StubMicrophone {
    fn open(&self) -> Result<Box<dyn CaptureStream>> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(PrismError::NoDefaultInputDevice);
        }
        self.opens.fetch_add(1, Ordering::AcqRel);
        self.open_times.lock().push(Instant::now());
        let live = self.live.now.fetch_add(1, Ordering::AcqRel) + 1;
        self.live.peak.fetch_max(live, Ordering::AcqRel);
        Ok(Box::new(StubCaptureStream {
            sample_rate: self.sample_rate,
            state: Arc::clone(&self.state),
            live: Arc::clone(&self.live),
            started: Instant::now(),
            delivered: 0,
        }))
    }
}

struct StubCaptureStream {
    sample_rate: u32,
    state: Arc<Mutex<MicState>>,
    live: Arc<LiveStreams>,
    started: Instant,
    delivered: u64,
}

impl CaptureStream for StubCaptureStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, buf: &mut [f32], wait: Duration) -> Result<usize> {
        // Samples become available at the stream's real-time rate.
        let due_at = |delivered: u64| {
            Duration::from_secs_f64(delivered as f64 / self.sample_rate as f64)
        };
        let target = due_at(self.delivered + buf.len() as u64);
        let elapsed = self.started.elapsed();
        if target > elapsed {
            let sleep = target - elapsed;
            if sleep > wait {
                std::thread::sleep(wait);
                return Ok(0);
            }
            std::thread::sleep(sleep);
        }

        let mut state = self.state.lock();
        for slot in buf.iter_mut() {
            *slot = match state.queued.pop_front() {
                Some(s) => s,
                None => {
                    state.phase = !state.phase;
                    if state.phase {
                        state.background
                    } else {
                        -state.background
                    }
                }
            };
        }
        self.delivered += buf.len() as u64;
        Ok(buf.len())
    }
}

impl Drop for StubCaptureStream {
    fn drop(&mut self) {
        self.live.now.fetch_sub(1, Ordering::AcqRel);
    }
}

// ── Transcriber ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubReply {
    Text(String),
    /// Audio heard, nothing understood.
    Unintelligible,
    /// Backend failure with this message.
    Fail(String),
}

/// Answers transcription requests from a script, then `Unintelligible`.
#[derive(Debug, Default)]
pub struct StubTranscriber {
    replies: Mutex<VecDeque<StubReply>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl StubTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies(replies: impl IntoIterator<Item = StubReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Simulated recognition latency.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push(&self, reply: StubReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }
}

impl Transcriber for StubTranscriber {
    fn transcribe(&self, segment: &AudioSegment) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let reply = self.replies.lock().pop_front();
        debug!(samples = segment.samples.len(), ?reply, "stub transcription");
        match reply {
            Some(StubReply::Text(text)) => Ok(Some(text)),
            Some(StubReply::Unintelligible) | None => Ok(None),
            Some(StubReply::Fail(msg)) => Err(PrismError::Recognition(msg)),
        }
    }

    fn name(&self) -> &str {
        "stub"
    }
}

// ── Synthesizer ──────────────────────────────────────────────────────────────

/// Produces silent audio whose length grows with the text.
#[derive(Debug)]
pub struct StubSynthesizer {
    sample_rate: u32,
    per_char: Duration,
    min_duration: Duration,
    delay: Duration,
    failing: AtomicBool,
    requests: Mutex<Vec<(String, String)>>,
}

impl Default for StubSynthesizer {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            per_char: Duration::from_millis(60),
            min_duration: Duration::from_millis(200),
            delay: Duration::ZERO,
            failing: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl StubSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every utterance lasts exactly `duration`.
    pub fn with_fixed_duration(mut self, duration: Duration) -> Self {
        self.per_char = Duration::ZERO;
        self.min_duration = duration;
        self
    }

    /// Simulated generation latency.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// `(text, voice)` of every request so far.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().clone()
    }
}

impl Synthesizer for StubSynthesizer {
    fn synthesize(&self, text: &str, voice: &str) -> Result<SynthesizedAudio> {
        self.requests.lock().push((text.to_string(), voice.to_string()));
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.failing.load(Ordering::Acquire) {
            return Err(PrismError::Synthesis("stub synthesizer offline".into()));
        }
        let length = (self.per_char * text.chars().count() as u32).max(self.min_duration);
        let samples = (length.as_secs_f64() * self.sample_rate as f64).round() as usize;
        Ok(SynthesizedAudio::new(vec![0.0; samples], self.sample_rate))
    }

    fn voices(&self) -> Vec<String> {
        vec!["stub".into(), "stub-alt".into()]
    }
}

// ── Sink ─────────────────────────────────────────────────────────────────────

/// Pretends to play audio for as long as it lasts.
#[derive(Debug, Default)]
pub struct SimulatedSink {
    counters: Arc<SinkCounters>,
    failing: AtomicBool,
    stop_delay: Duration,
}

#[derive(Debug, Default)]
struct SinkCounters {
    plays: AtomicUsize,
    releases: AtomicUsize,
}

impl SimulatedSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `stop()` on a playing handle block for `delay`, like an output
    /// device draining its buffer.
    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Playbacks started.
    pub fn plays(&self) -> usize {
        self.counters.plays.load(Ordering::Acquire)
    }

    /// Playbacks whose resource has been released.
    pub fn releases(&self) -> usize {
        self.counters.releases.load(Ordering::Acquire)
    }

    /// Playbacks currently holding the output.
    pub fn active(&self) -> usize {
        self.plays().saturating_sub(self.releases())
    }
}

impl AudioSink for SimulatedSink {
    fn play(&self, audio: SynthesizedAudio) -> Result<Box<dyn PlaybackHandle>> {
        if self.failing.load(Ordering::Acquire) {
            return Err(PrismError::NoDefaultOutputDevice);
        }
        self.counters.plays.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(SimulatedPlayback {
            started: Instant::now(),
            duration: audio.duration(),
            released: false,
            stop_delay: self.stop_delay,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct SimulatedPlayback {
    started: Instant,
    duration: Duration,
    released: bool,
    stop_delay: Duration,
    counters: Arc<SinkCounters>,
}

impl PlaybackHandle for SimulatedPlayback {
    fn is_finished(&self) -> bool {
        self.released || self.started.elapsed() >= self.duration
    }

    fn stop(&mut self) {
        if !self.released {
            if !self.stop_delay.is_zero() && self.started.elapsed() < self.duration {
                std::thread::sleep(self.stop_delay);
            }
            self.released = true;
            self.counters.releases.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl Drop for SimulatedPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Event helpers ────────────────────────────────────────────────────────────

/// Poll a broadcast receiver until an event arrives or `timeout` passes.
pub fn recv_with_timeout<T: Clone>(
    rx: &mut broadcast::Receiver<T>,
    timeout: Duration,
) -> Option<T> {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(ev) => return Some(ev),
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    return None;
                }
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => return None,
        }
    }
}

/// Everything already queued on `rx`, without waiting.
pub fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(ev) => out.push(ev),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}
