//! Audio playback to speakers.
//!
//! A playback is the transient audio resource of a speaking session: the
//! device stream plus the samples it reads. `PlaybackHandle` owns it; the
//! resource is released when the handle is stopped or dropped, whichever
//! happens first, and never twice.
//!
//! The cpal stream is `!Send`, so `CpalSink` runs each playback on its own
//! short-lived thread and hands back a `Send` handle that signals it.

use crate::buffering::segment::SynthesizedAudio;
use crate::error::Result;

/// Something that can play synthesized speech.
pub trait AudioSink: Send + Sync + 'static {
    /// Start playing `audio` and return immediately.
    ///
    /// # Errors
    /// Resource errors when the output device cannot be opened.
    fn play(&self, audio: SynthesizedAudio) -> Result<Box<dyn PlaybackHandle>>;
}

/// Control over one in-progress playback.
pub trait PlaybackHandle: Send {
    /// `true` once the last sample has been played (or the stream died).
    fn is_finished(&self) -> bool;

    /// Halt output and release the device stream. Idempotent.
    fn stop(&mut self);
}

#[cfg(feature = "audio-cpal")]
pub use cpal_sink::CpalSink;

#[cfg(feature = "audio-cpal")]
mod cpal_sink {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    };
    use std::thread::JoinHandle;
    use std::time::Duration;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
    use crossbeam_channel::{bounded, Sender};
    use tracing::{debug, error, info, warn};

    use super::{AudioSink, PlaybackHandle};
    use crate::audio::resample::resample_all;
    use crate::buffering::segment::SynthesizedAudio;
    use crate::error::{PrismError, Result};

    /// How often the playback thread checks for end-of-audio.
    const DRAIN_POLL: Duration = Duration::from_millis(10);
    /// Tail kept open after the last sample so the device buffer drains.
    const DRAIN_TAIL: Duration = Duration::from_millis(100);

    /// Plays to the default output device.
    #[derive(Debug, Clone, Default)]
    pub struct CpalSink;

    impl CpalSink {
        pub fn new() -> Self {
            Self
        }
    }

    impl AudioSink for CpalSink {
        fn play(&self, audio: SynthesizedAudio) -> Result<Box<dyn PlaybackHandle>> {
            let finished = Arc::new(AtomicBool::new(false));
            let (stop_tx, stop_rx) = bounded::<()>(1);
            let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<()>>();

            let finished_for_thread = Arc::clone(&finished);
            let worker = std::thread::Builder::new()
                .name("prism-playback".into())
                .spawn(move || {
                    let stream = match open_output(audio, Arc::clone(&finished_for_thread)) {
                        Ok(s) => {
                            let _ = open_tx.send(Ok(()));
                            s
                        }
                        Err(e) => {
                            finished_for_thread.store(true, Ordering::Release);
                            let _ = open_tx.send(Err(e));
                            return;
                        }
                    };

                    loop {
                        if finished_for_thread.load(Ordering::Acquire) {
                            std::thread::sleep(DRAIN_TAIL);
                            break;
                        }
                        match stop_rx.recv_timeout(DRAIN_POLL) {
                            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                                debug!("playback stopped before end of audio");
                                break;
                            }
                            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                        }
                    }

                    // Stream drops here, releasing the output device on this thread.
                    drop(stream);
                    finished_for_thread.store(true, Ordering::Release);
                })
                .map_err(PrismError::Io)?;

            match open_rx.recv() {
                Ok(Ok(())) => Ok(Box::new(CpalPlayback {
                    finished,
                    stop_tx: Some(stop_tx),
                    worker: Some(worker),
                })),
                Ok(Err(e)) => {
                    let _ = worker.join();
                    Err(e)
                }
                Err(_) => {
                    let _ = worker.join();
                    Err(PrismError::AudioStream("playback thread died".into()))
                }
            }
        }
    }

    struct CpalPlayback {
        finished: Arc<AtomicBool>,
        stop_tx: Option<Sender<()>>,
        worker: Option<JoinHandle<()>>,
    }

    impl PlaybackHandle for CpalPlayback {
        fn is_finished(&self) -> bool {
            self.finished.load(Ordering::Acquire)
        }

        fn stop(&mut self) {
            if let Some(tx) = self.stop_tx.take() {
                let _ = tx.try_send(());
            }
            if let Some(worker) = self.worker.take() {
                if worker.join().is_err() {
                    error!("playback thread panicked");
                }
            }
        }
    }

    impl Drop for CpalPlayback {
        fn drop(&mut self) {
            self.stop();
        }
    }

    fn open_output(audio: SynthesizedAudio, finished: Arc<AtomicBool>) -> Result<Stream> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(PrismError::NoDefaultOutputDevice)?;
        let supported = device
            .default_output_config()
            .map_err(|e| PrismError::AudioDevice(e.to_string()))?;

        let device_rate = supported.sample_rate().0;
        let config = StreamConfig {
            channels: supported.channels(),
            sample_rate: cpal::SampleRate(device_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let samples = Arc::new(resample_all(&audio.samples, audio.sample_rate, device_rate)?);
        info!(
            device = device.name().unwrap_or_default().as_str(),
            voice_rate = audio.sample_rate,
            device_rate,
            samples = samples.len(),
            "starting playback"
        );

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_output::<f32>(&device, &config, samples, finished),
            SampleFormat::I16 => build_output::<i16>(&device, &config, samples, finished),
            SampleFormat::U16 => build_output::<u16>(&device, &config, samples, finished),
            fmt => Err(PrismError::AudioStream(format!(
                "unsupported output sample format: {fmt:?}"
            ))),
        }?;

        stream
            .play()
            .map_err(|e| PrismError::AudioStream(e.to_string()))?;
        Ok(stream)
    }

    fn build_output<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        samples: Arc<Vec<f32>>,
        finished: Arc<AtomicBool>,
    ) -> Result<Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = config.channels.max(1) as usize;
        let position = AtomicUsize::new(0);
        let finished_on_error = Arc::clone(&finished);

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    let mut pos = position.load(Ordering::Relaxed);
                    for frame in data.chunks_mut(channels) {
                        let sample = match samples.get(pos) {
                            Some(s) => {
                                pos += 1;
                                *s
                            }
                            None => {
                                finished.store(true, Ordering::Release);
                                0.0
                            }
                        };
                        for out in frame.iter_mut() {
                            *out = T::from_sample(sample);
                        }
                    }
                    position.store(pos, Ordering::Relaxed);
                },
                move |err| {
                    warn!("audio output stream error: {err}");
                    finished_on_error.store(true, Ordering::Release);
                },
                None,
            )
            .map_err(|e| PrismError::AudioStream(e.to_string()))
    }
}
