//! Segment capture on top of an open `CaptureStream`.
//!
//! ```text
//! CaptureStream (device rate) → RateConverter → 20 ms frames (target rate)
//!                                                   │
//!                                   EnergyLevel ◄───┤ rms per frame
//!                                                   │
//!                                   EnergyVad: onset → phrase → pause
//!                                                   │
//!                                               AudioSegment
//! ```
//!
//! Timeouts are measured in captured audio, with a wall-clock guard so a
//! stalled device cannot hold the caller forever.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::resample::RateConverter;
use super::{CaptureStream, Microphone};
use crate::buffering::segment::AudioSegment;
use crate::engine::VoiceConfig;
use crate::error::{PrismError, Result};
use crate::vad::{compute_rms, EnergyVad, VoiceActivityDetector};

/// VAD frame length.
const FRAME_MS: u32 = 20;
/// Audio kept from before the onset so the first syllable is not clipped.
const PRE_ROLL: Duration = Duration::from_millis(200);
/// Longest single wait on the device; bounds how late a stop is noticed.
const READ_WAIT: Duration = Duration::from_millis(40);
/// Slack added to audio-time limits before the wall-clock guard fires.
const WALL_SLACK: Duration = Duration::from_secs(1);
/// Silent frames still counted as speech after the last loud one.
const HANGOVER_FRAMES: u32 = 2;
/// Chunk length published by the barge-in sampler.
const SAMPLER_CHUNK_MS: u32 = 50;

// ── Energy meter ─────────────────────────────────────────────────────────────

/// Latest microphone RMS, shared between whoever captures and whoever asks.
#[derive(Debug, Default)]
pub struct EnergyLevel {
    latest: Mutex<Option<(f32, Instant)>>,
}

impl EnergyLevel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, rms: f32) {
        *self.latest.lock() = Some((rms, Instant::now()));
    }

    /// The last published level, if it is younger than `max_age`.
    pub fn latest(&self, max_age: Duration) -> Option<f32> {
        let guard = self.latest.lock();
        match *guard {
            Some((rms, at)) if at.elapsed() <= max_age => Some(rms),
            _ => None,
        }
    }

    pub fn clear(&self) {
        *self.latest.lock() = None;
    }
}

// ── Segment recorder ─────────────────────────────────────────────────────────

/// Turns a live capture stream into bounded speech segments.
pub struct SegmentRecorder {
    stream: Box<dyn CaptureStream>,
    converter: RateConverter,
    vad: EnergyVad,
    level: Arc<EnergyLevel>,
    target_rate: u32,
    frame_len: usize,
    read_buf: Vec<f32>,
    /// Converted samples not yet cut into a frame.
    pending: Vec<f32>,
    listen_timeout: Option<Duration>,
    phrase_time_limit: Duration,
    pause_threshold: Duration,
    min_phrase_duration: Duration,
    ambient_calibration: Duration,
}

impl SegmentRecorder {
    /// # Errors
    /// `AudioStream` if the device rate cannot be converted to the target rate.
    pub fn new(
        stream: Box<dyn CaptureStream>,
        config: &VoiceConfig,
        level: Arc<EnergyLevel>,
    ) -> Result<Self> {
        let device_rate = stream.sample_rate();
        let target_rate = config.target_sample_rate;
        let device_frame = frame_samples(device_rate, FRAME_MS);
        let converter = RateConverter::new(device_rate, target_rate, device_frame)?;

        Ok(Self {
            stream,
            converter,
            vad: EnergyVad::new(
                config.energy_threshold,
                config.ambient_multiplier,
                HANGOVER_FRAMES,
            ),
            level,
            target_rate,
            frame_len: frame_samples(target_rate, FRAME_MS),
            read_buf: vec![0.0; device_frame],
            pending: Vec::new(),
            listen_timeout: config.listen_timeout,
            phrase_time_limit: config.phrase_time_limit,
            pause_threshold: config.pause_threshold,
            min_phrase_duration: config.min_phrase_duration,
            ambient_calibration: config.ambient_calibration,
        })
    }

    /// Current speech threshold (after any calibration).
    pub fn threshold(&self) -> f32 {
        self.vad.threshold()
    }

    /// Measure room noise for the configured calibration time and raise the
    /// speech threshold above it. Returns the ambient RMS.
    pub fn calibrate(&mut self) -> Result<f32> {
        let wanted = self.frames_in(self.ambient_calibration);
        if wanted == 0 {
            return Ok(0.0);
        }

        let deadline = Instant::now() + self.ambient_calibration + WALL_SLACK;
        let mut sum = 0.0f32;
        let mut got = 0usize;
        while got < wanted && Instant::now() < deadline {
            if let Some(frame) = self.next_frame()? {
                sum += compute_rms(&frame);
                got += 1;
            }
        }

        let ambient = if got == 0 { 0.0 } else { sum / got as f32 };
        self.vad.set_noise_floor(ambient);
        debug!(ambient, frames = got, threshold = self.vad.threshold(), "ambient calibrated");
        Ok(ambient)
    }

    /// Block until one phrase has been captured.
    ///
    /// `active` is checked while waiting for speech to begin; a phrase that
    /// has started is always recorded to its end.
    ///
    /// # Errors
    /// - `Cancelled` when `active` drops before any speech.
    /// - `CaptureTimeout` when no phrase began within `listen_timeout`.
    /// - `AudioStream` when the device fails.
    pub fn record(&mut self, active: &AtomicBool) -> Result<AudioSegment> {
        self.vad.reset();
        let frame_dur = Duration::from_millis(FRAME_MS as u64);
        let pre_roll_frames = self.frames_in(PRE_ROLL).max(1);
        let pause_frames = self.frames_in(self.pause_threshold).max(1);
        let limit_frames = self.frames_in(self.phrase_time_limit).max(1);
        let min_voiced = self.frames_in(self.min_phrase_duration);

        let started = Instant::now();
        let mut waited = Duration::ZERO;
        let mut pre_roll: VecDeque<Vec<f32>> = VecDeque::with_capacity(pre_roll_frames + 1);

        loop {
            if !active.load(Ordering::Acquire) {
                return Err(PrismError::Cancelled);
            }
            if let Some(limit) = self.listen_timeout {
                if waited >= limit || started.elapsed() >= limit + WALL_SLACK {
                    return Err(PrismError::CaptureTimeout);
                }
            }

            let Some(frame) = self.next_frame()? else {
                continue;
            };
            waited += frame_dur;

            if !self.vad.classify(&frame).is_speech() {
                pre_roll.push_back(frame);
                if pre_roll.len() > pre_roll_frames {
                    pre_roll.pop_front();
                }
                continue;
            }

            trace!(waited_ms = waited.as_millis() as u64, "speech onset");
            let phrase_started = Instant::now();
            let mut samples: Vec<f32> = pre_roll.drain(..).flatten().collect();
            samples.extend_from_slice(&frame);
            let mut phrase_frames = 1usize;
            let mut voiced = 1usize;
            let mut silent_run = 0usize;

            while silent_run < pause_frames && phrase_frames < limit_frames {
                let Some(frame) = self.next_frame()? else {
                    if phrase_started.elapsed() >= self.phrase_time_limit + WALL_SLACK {
                        warn!("capture stalled mid-phrase, closing segment early");
                        break;
                    }
                    continue;
                };
                phrase_frames += 1;
                samples.extend_from_slice(&frame);
                if self.vad.classify(&frame).is_speech() {
                    voiced += 1;
                    silent_run = 0;
                } else {
                    silent_run += 1;
                }
            }

            if voiced < min_voiced {
                debug!(voiced, min_voiced, "discarding blip shorter than a phrase");
                self.vad.reset();
                continue;
            }

            let segment = AudioSegment::new(samples, self.target_rate);
            info!(
                samples = segment.samples.len(),
                duration_ms = (segment.duration_secs() * 1000.0) as u64,
                "segment captured"
            );
            return Ok(segment);
        }
    }

    /// Next frame at the target rate, or `None` if the device had nothing
    /// within `READ_WAIT`.
    fn next_frame(&mut self) -> Result<Option<Vec<f32>>> {
        while self.pending.len() < self.frame_len {
            let n = self.stream.read(&mut self.read_buf, READ_WAIT)?;
            if n == 0 {
                return Ok(None);
            }
            let converted = self.converter.process(&self.read_buf[..n]);
            self.pending.extend_from_slice(&converted);
        }
        let frame: Vec<f32> = self.pending.drain(..self.frame_len).collect();
        self.level.publish(compute_rms(&frame));
        Ok(Some(frame))
    }

    fn frames_in(&self, span: Duration) -> usize {
        (span.as_millis() / FRAME_MS as u128) as usize
    }
}

fn frame_samples(rate: u32, ms: u32) -> usize {
    ((rate as u64 * ms as u64) / 1000).max(1) as usize
}

// ── Barge-in energy sampler ──────────────────────────────────────────────────

/// Background worker that keeps its own capture stream open and publishes
/// RMS into an `EnergyLevel`. Used during playback to detect barge-in.
pub struct EnergySampler {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl EnergySampler {
    pub fn start(microphone: Arc<dyn Microphone>, level: Arc<EnergyLevel>) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let running_for_thread = Arc::clone(&running);

        let worker = std::thread::Builder::new()
            .name("prism-energy-sampler".into())
            .spawn(move || {
                let mut stream = match microphone.open() {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("energy sampler could not open microphone: {e}");
                        return;
                    }
                };
                let mut buf = vec![0.0f32; frame_samples(stream.sample_rate(), SAMPLER_CHUNK_MS)];
                debug!("energy sampling started");

                while running_for_thread.load(Ordering::Acquire) {
                    match stream.read(&mut buf, READ_WAIT) {
                        Ok(0) => {}
                        Ok(n) => level.publish(compute_rms(&buf[..n])),
                        Err(e) => {
                            warn!("energy sampler stream failed: {e}");
                            break;
                        }
                    }
                }

                level.clear();
                debug!("energy sampling stopped");
            })
            .map_err(PrismError::Io)?;

        Ok(Self {
            running,
            worker: Some(worker),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Stop sampling and wait for the stream to close. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("energy sampler thread panicked");
            }
        }
    }
}

impl Drop for EnergySampler {
    fn drop(&mut self) {
        self.stop();
    }
}
