//! Microphone capture.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority. It
//! **must not** allocate, block on a mutex, or perform I/O. Frames are
//! down-mixed into a scratch buffer sized on first use and pushed into an SPSC
//! ring buffer whose `push_slice` is lock-free.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). A `CaptureStream` is therefore opened *and dropped* on the worker
//! thread that reads it; only the `Microphone` factory crosses threads.
//!
//! Two consumers open the microphone: the listening loop (one stream per
//! captured segment) and the barge-in `EnergySampler` (one stream per playback
//! session). Each gets its own stream and ring buffer, so neither starves the
//! other.

pub mod device;
pub mod output;
pub mod recorder;
pub mod resample;

use std::time::Duration;

#[cfg(feature = "audio-cpal")]
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

#[cfg(feature = "audio-cpal")]
use crate::buffering::{create_audio_ring, AudioConsumer, AudioProducer, Consumer, Producer};
use crate::error::Result;
#[cfg(feature = "audio-cpal")]
use crate::error::PrismError;

/// Factory for capture streams. Shared between controllers.
pub trait Microphone: Send + Sync + 'static {
    /// Open a new capture stream on the calling thread.
    ///
    /// # Errors
    /// Resource errors (`NoDefaultInputDevice`, `AudioDevice`, `AudioStream`)
    /// when the device cannot be opened.
    fn open(&self) -> Result<Box<dyn CaptureStream>>;
}

/// An open microphone stream delivering mono f32 samples.
///
/// Not `Send`: create and drop it on the same thread.
pub trait CaptureStream {
    /// Rate of the samples returned by `read` (Hz).
    fn sample_rate(&self) -> u32;

    /// Fill `buf` with up to `buf.len()` samples, waiting at most `wait` for
    /// the first one. Returns `Ok(0)` when nothing arrived in time.
    ///
    /// # Errors
    /// `AudioStream` when the device reported a failure (e.g. unplugged).
    fn read(&mut self, buf: &mut [f32], wait: Duration) -> Result<usize>;
}

/// Poll interval while a ring buffer is empty (avoids busy-waiting a core).
#[cfg(feature = "audio-cpal")]
const EMPTY_RING_SLEEP: Duration = Duration::from_millis(5);

/// The system microphone via cpal.
#[cfg(feature = "audio-cpal")]
#[derive(Debug, Clone, Default)]
pub struct CpalMicrophone {
    preferred_device: Option<String>,
}

#[cfg(feature = "audio-cpal")]
impl CpalMicrophone {
    /// Use the input device named `preferred_device` when present, otherwise
    /// the default input, otherwise the first non-loopback input.
    pub fn new(preferred_device: Option<String>) -> Self {
        Self { preferred_device }
    }
}

#[cfg(feature = "audio-cpal")]
impl Microphone for CpalMicrophone {
    fn open(&self) -> Result<Box<dyn CaptureStream>> {
        let stream = CpalCaptureStream::open(self.preferred_device.as_deref())?;
        Ok(Box::new(stream))
    }
}

/// Live cpal input stream feeding a ring buffer.
#[cfg(feature = "audio-cpal")]
pub struct CpalCaptureStream {
    /// Kept alive so the stream is not dropped prematurely.
    _stream: Stream,
    consumer: AudioConsumer,
    /// Set to `false` on drop so a late callback no-ops.
    running: Arc<AtomicBool>,
    /// Set by the error callback; surfaced on the next `read`.
    failed: Arc<AtomicBool>,
    sample_rate: u32,
}

#[cfg(feature = "audio-cpal")]
impl CpalCaptureStream {
    fn open(preferred_device_name: Option<&str>) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let mut selected_device = None;

        if let Some(preferred_name) = preferred_device_name {
            match host.input_devices() {
                Ok(mut devices) => {
                    selected_device = devices.find(|device| {
                        device
                            .name()
                            .map(|name| name == preferred_name)
                            .unwrap_or(false)
                    });
                    if selected_device.is_none() {
                        warn!(preferred_name, "preferred input device not found, falling back");
                    }
                }
                Err(e) => warn!("failed to list input devices while resolving preference: {e}"),
            }
        }

        let device = if let Some(device) = selected_device {
            device
        } else if let Some(default) = host.default_input_device() {
            default
        } else {
            let mut devices = host
                .input_devices()
                .map_err(|e| PrismError::AudioDevice(e.to_string()))?;
            let fallback = devices
                .find(|d| {
                    !d.name()
                        .map(|n| self::device::is_loopback_like_name(&n))
                        .unwrap_or(true)
                })
                .ok_or(PrismError::NoDefaultInputDevice)?;
            warn!("no default input device, falling back to first microphone-like input");
            fallback
        };

        let supported = device
            .default_input_config()
            .map_err(|e| PrismError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();

        info!(
            device = device.name().unwrap_or_default().as_str(),
            sample_rate, channels, "opening input device"
        );

        let config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (producer, consumer) = create_audio_ring();
        let running = Arc::new(AtomicBool::new(true));
        let failed = Arc::new(AtomicBool::new(false));

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                build_mono_input::<f32>(&device, &config, producer, &running, &failed)
            }
            SampleFormat::I16 => {
                build_mono_input::<i16>(&device, &config, producer, &running, &failed)
            }
            SampleFormat::U16 => {
                build_mono_input::<u16>(&device, &config, producer, &running, &failed)
            }
            SampleFormat::U8 => {
                build_mono_input::<u8>(&device, &config, producer, &running, &failed)
            }
            fmt => {
                return Err(PrismError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| PrismError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            consumer,
            running,
            failed,
            sample_rate,
        })
    }
}

#[cfg(feature = "audio-cpal")]
fn build_mono_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: &Arc<AtomicBool>,
    failed: &Arc<AtomicBool>,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let ch = config.channels.max(1) as usize;
    let running = Arc::clone(running);
    let failed = Arc::clone(failed);
    let mut mix_buf: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _info: &cpal::InputCallbackInfo| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / ch;
                mix_buf.resize(frames, 0.0);
                for (f, slot) in mix_buf.iter_mut().enumerate() {
                    let base = f * ch;
                    let sum: f32 = data[base..base + ch]
                        .iter()
                        .map(|&s| s.to_sample::<f32>())
                        .sum();
                    *slot = sum / ch as f32;
                }
                let written = producer.push_slice(&mix_buf);
                if written < mix_buf.len() {
                    warn!("capture ring full: dropped {} frames", mix_buf.len() - written);
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
                failed.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(|e| PrismError::AudioStream(e.to_string()))
}

#[cfg(feature = "audio-cpal")]
impl CaptureStream for CpalCaptureStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, buf: &mut [f32], wait: Duration) -> Result<usize> {
        let started = std::time::Instant::now();
        loop {
            if self.failed.load(Ordering::Acquire) {
                return Err(PrismError::AudioStream("input device failed".into()));
            }
            let n = self.consumer.pop_slice(buf);
            if n > 0 {
                return Ok(n);
            }
            if started.elapsed() >= wait {
                return Ok(0);
            }
            std::thread::sleep(EMPTY_RING_SLEEP);
        }
    }
}

#[cfg(feature = "audio-cpal")]
impl Drop for CpalCaptureStream {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}
