//! Typed audio buffers handed between capture, recognition and playback.

/// One bounded span of captured mono PCM handed to the transcriber.
#[derive(Debug, Clone)]
pub struct AudioSegment {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (e.g. 16000).
    pub sample_rate: u32,
}

impl AudioSegment {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Returns the duration of this segment in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Returns true if the segment contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Encode as 16-bit PCM WAV, the format speech APIs accept.
    pub fn to_wav_bytes(&self) -> crate::error::Result<Vec<u8>> {
        use crate::error::PrismError;

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)
                .map_err(|e| PrismError::AudioStream(format!("wav encode: {e}")))?;
            for &sample in &self.samples {
                let pcm = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                writer
                    .write_sample(pcm)
                    .map_err(|e| PrismError::AudioStream(format!("wav encode: {e}")))?;
            }
            writer
                .finalize()
                .map_err(|e| PrismError::AudioStream(format!("wav encode: {e}")))?;
        }
        Ok(cursor.into_inner())
    }
}

/// Playable audio produced by a synthesizer.
///
/// Owned by exactly one playback session. Handing it to an `AudioSink`
/// moves it into the sink's playback handle; dropping it anywhere else
/// releases it.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (e.g. 24000).
    pub sample_rate: u32,
}

impl SynthesizedAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration(&self) -> std::time::Duration {
        if self.sample_rate == 0 {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Decode a WAV payload (any integer or float PCM layout) into mono f32.
    pub fn from_wav_bytes(bytes: &[u8]) -> crate::error::Result<Self> {
        use crate::error::PrismError;

        let mut reader = hound::WavReader::new(std::io::Cursor::new(bytes))
            .map_err(|e| PrismError::Synthesis(format!("wav decode: {e}")))?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => collect_until_eof(reader.samples::<f32>())?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                collect_until_eof(reader.samples::<i32>().map(|s| s.map(|v| v as f32 / scale)))?
            }
        };

        let samples = if channels == 1 {
            interleaved
        } else {
            interleaved
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                .collect()
        };

        Ok(Self::new(samples, spec.sample_rate))
    }
}

/// Streaming speech endpoints write a placeholder data length; a payload
/// that ends early is accepted as long as it held some audio.
fn collect_until_eof(
    samples: impl Iterator<Item = hound::Result<f32>>,
) -> crate::error::Result<Vec<f32>> {
    let mut out = Vec::new();
    for sample in samples {
        match sample {
            Ok(s) => out.push(s),
            Err(hound::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof && !out.is_empty() =>
            {
                break
            }
            Err(e) => {
                return Err(crate::error::PrismError::Synthesis(format!("wav decode: {e}")))
            }
        }
    }
    Ok(out)
}
