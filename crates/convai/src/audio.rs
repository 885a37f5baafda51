use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler, ResamplerConstructionError};
use std::io::Cursor;
use std::time::Duration;
use tracing::warn;

/// Sample rate the service expects for user audio.
pub const CONVAI_INPUT_SAMPLE_RATE: u32 = 16_000;
/// Default rate of the headerless PCM the service sends back (`pcm_16000`).
pub const CONVAI_OUTPUT_SAMPLE_RATE: u32 = 16_000;
/// Samples per outbound frame: 256 ms at 16 kHz.
pub const DEFAULT_FRAME_SAMPLES: usize = 4096;

const RESAMPLER_CHUNK: usize = 1024;

/// Creates a mono resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: u32,
    out_sampling_rate: u32,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>, ResamplerConstructionError> {
    FastFixedIn::<f32>::new(
        out_sampling_rate as f64 / in_sampling_rate as f64,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )
}

/// Converts normalised f32 samples to PCM16, scaling by 32768 and saturating.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts PCM16 samples to normalised f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Encodes PCM16 samples as little-endian bytes in standard base64.
pub fn encode_i16(pcm16: &[i16]) -> String {
    let bytes: Vec<u8> = pcm16
        .iter()
        .flat_map(|&sample| sample.to_le_bytes())
        .collect();
    base64::engine::general_purpose::STANDARD.encode(&bytes)
}

/// Decodes a standard base64 payload to raw bytes.
pub fn decode_base64(fragment: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(fragment)
}

/// Interprets little-endian bytes as PCM16. A trailing odd byte is dropped.
pub fn bytes_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// True when `bytes` already starts with a RIFF/WAVE header.
pub fn is_wav(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

/// Wraps PCM16 samples in a 44-byte canonical WAV header.
pub fn pcm16_to_wav(
    samples: &[i16],
    sample_rate: u32,
    channels: u16,
) -> Result<Vec<u8>, hound::Error> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(cursor.into_inner())
}

/// One playable unit of agent speech.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    /// The clip as a complete WAV file.
    pub wav: Vec<u8>,
    /// Interleaved PCM16 samples.
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioClip {
    /// Builds a clip from a decoded `audio` payload.
    ///
    /// Headerless PCM is wrapped as mono 16-bit at `pcm_sample_rate`; payloads
    /// that are already WAV keep their own format.
    pub fn from_payload(bytes: Vec<u8>, pcm_sample_rate: u32) -> Result<Self, hound::Error> {
        if is_wav(&bytes) {
            let reader = hound::WavReader::new(Cursor::new(bytes.as_slice()))?;
            let spec = reader.spec();
            if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
                return Err(hound::Error::Unsupported);
            }
            let samples = reader
                .into_samples::<i16>()
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Self {
                wav: bytes,
                samples,
                sample_rate: spec.sample_rate,
                channels: spec.channels,
            });
        }

        let samples = bytes_to_i16(&bytes);
        let wav = pcm16_to_wav(&samples, pcm_sample_rate, 1)?;
        Ok(Self {
            wav,
            samples,
            sample_rate: pcm_sample_rate,
            channels: 1,
        })
    }

    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() as u64 / self.channels.max(1) as u64;
        Duration::from_micros(frames * 1_000_000 / self.sample_rate.max(1) as u64)
    }
}

/// Turns device sample blocks into fixed-size PCM16 frames at the target rate.
pub struct FrameAssembler {
    frame_samples: usize,
    resampler: Option<FastFixedIn<f32>>,
    staged: Vec<f32>,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(
        source_rate: u32,
        target_rate: u32,
        frame_samples: usize,
    ) -> Result<Self, ResamplerConstructionError> {
        let resampler = if source_rate == target_rate {
            None
        } else {
            Some(create_resampler(source_rate, target_rate, RESAMPLER_CHUNK)?)
        };
        Ok(Self {
            frame_samples: frame_samples.max(1),
            resampler,
            staged: Vec::new(),
            pending: Vec::new(),
        })
    }

    /// Feeds one block and returns every frame that is now complete.
    pub fn push(&mut self, block: &[f32]) -> Vec<Vec<i16>> {
        match &mut self.resampler {
            None => self.pending.extend_from_slice(block),
            Some(resampler) => {
                self.staged.extend_from_slice(block);
                loop {
                    let needed = resampler.input_frames_next();
                    if self.staged.len() < needed {
                        break;
                    }
                    let chunk: Vec<f32> = self.staged.drain(..needed).collect();
                    match resampler.process(&[chunk], None) {
                        Ok(out) => self.pending.extend_from_slice(&out[0]),
                        Err(e) => {
                            warn!(error = %e, "Dropping capture chunk that failed to resample")
                        }
                    }
                }
            }
        }

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let frame: Vec<f32> = self.pending.drain(..self.frame_samples).collect();
            frames.push(convert_f32_to_i16(&frame));
        }
        frames
    }
}
