//! Microphone and speaker backends on top of `cpal`.
//!
//! `cpal` streams are not `Send`, so each one lives on its own thread and is
//! dropped there when the owning handle signals it.

use async_trait::async_trait;
use convai::audio::{AudioClip, convert_i16_to_f32, create_resampler};
use convai::{
    AudioCapture, AudioSink, CaptureConstraints, CaptureError, CaptureGuard, CaptureStream,
    PlaybackError,
};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use ringbuf::{HeapRb, traits::*};
use rubato::Resampler;
use std::sync::{Arc, mpsc as std_mpsc};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

const RESAMPLE_CHUNK: usize = 1024;
/// Two seconds of headroom at 48 kHz stereo.
const SPEAKER_BUFFER: usize = 48_000 * 2 * 2;

/// Default input device of the default host.
#[derive(Debug, Default, Clone)]
pub struct MicCapture;

struct StreamGuard(std_mpsc::Sender<()>);

impl CaptureGuard for StreamGuard {
    fn release(self: Box<Self>) {
        let _ = self.0.send(());
    }
}

fn map_build_error(e: cpal::BuildStreamError) -> CaptureError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => {
            CaptureError::DeviceUnavailable("input device disappeared".to_string())
        }
        cpal::BuildStreamError::StreamConfigNotSupported => {
            CaptureError::Unsupported("default input config rejected".to_string())
        }
        other => CaptureError::Device(other.to_string()),
    }
}

fn open_input(blocks: mpsc::Sender<Vec<f32>>) -> Result<(cpal::Stream, u32), CaptureError> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| CaptureError::DeviceUnavailable("no input device".to_string()))?;
    info!(
        "Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );
    let config: cpal::StreamConfig = device
        .default_input_config()
        .map_err(|e| CaptureError::Device(format!("failed to get input config: {e}")))?
        .into();
    let channels = config.channels as usize;
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono = if channels == 1 {
                    data.to_vec()
                } else {
                    data.chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                        .collect()
                };
                if let Err(e) = blocks.try_send(mono) {
                    debug!("Dropping microphone block: {e}");
                }
            },
            |err| error!("Audio input stream error: {err}"),
            None,
        )
        .map_err(map_build_error)?;
    stream
        .play()
        .map_err(|e| CaptureError::Device(format!("failed to start input stream: {e}")))?;
    Ok((stream, config.sample_rate.0))
}

/// Runs on the capture thread until `stop` fires or its sender is dropped.
fn run_input(
    blocks: mpsc::Sender<Vec<f32>>,
    ready: oneshot::Sender<Result<u32, CaptureError>>,
    stop: std_mpsc::Receiver<()>,
) {
    match open_input(blocks) {
        Ok((stream, rate)) => {
            let _ = ready.send(Ok(rate));
            let _ = stop.recv();
            drop(stream);
            info!("Microphone stream closed");
        }
        Err(e) => {
            let _ = ready.send(Err(e));
        }
    }
}

#[async_trait]
impl AudioCapture for MicCapture {
    async fn open(&self, constraints: &CaptureConstraints) -> Result<CaptureStream, CaptureError> {
        let (tx, blocks) = mpsc::channel(32);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel();
        std::thread::Builder::new()
            .name("convai-mic".to_string())
            .spawn(move || run_input(tx, ready_tx, stop_rx))
            .map_err(|e| CaptureError::Device(e.to_string()))?;

        let sample_rate = ready_rx
            .await
            .map_err(|_| CaptureError::Device("capture thread exited".to_string()))??;
        info!(
            device_rate = sample_rate,
            target_rate = constraints.sample_rate,
            "Microphone open"
        );
        Ok(CaptureStream {
            sample_rate,
            blocks,
            guard: Box::new(StreamGuard(stop_tx)),
        })
    }
}

/// Resamples mono audio in fixed chunks, zero-padding the tail.
pub fn resample(samples: Vec<f32>, from: u32, to: u32) -> Result<Vec<f32>, PlaybackError> {
    if from == to {
        return Ok(samples);
    }
    let mut resampler = create_resampler(from, to, RESAMPLE_CHUNK)
        .map_err(|e| PlaybackError::Output(e.to_string()))?;
    let mut out = Vec::with_capacity(samples.len() * to as usize / from.max(1) as usize + 1);
    for chunk in samples.chunks(RESAMPLE_CHUNK) {
        let mut block = chunk.to_vec();
        block.resize(RESAMPLE_CHUNK, 0.0);
        let processed = resampler
            .process(&[block], None)
            .map_err(|e| PlaybackError::Output(e.to_string()))?;
        out.extend_from_slice(&processed[0]);
    }
    Ok(out)
}

type SharedRing = Arc<Mutex<HeapRb<f32>>>;

/// Empties the ring so the device falls back to silence; returns samples dropped.
fn discard(ring: &SharedRing) -> usize {
    ring.lock().clear()
}

/// Default output device; clips are queued into a ring buffer the device drains.
pub struct SpeakerSink {
    ring: SharedRing,
    sample_rate: u32,
    _stop: std_mpsc::Sender<()>,
}

fn open_output(ring: SharedRing) -> Result<(cpal::Stream, u32), PlaybackError> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| PlaybackError::Output("no output device".to_string()))?;
    info!(
        "Using output device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );
    let config: cpal::StreamConfig = device
        .default_output_config()
        .map_err(|e| PlaybackError::Output(format!("failed to get output config: {e}")))?
        .into();
    let channels = config.channels as usize;
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut ring = ring.lock();
                for frame in data.chunks_mut(channels) {
                    let sample = ring.try_pop().unwrap_or(0.0);
                    frame.fill(sample);
                }
            },
            |err| error!("Audio output stream error: {err}"),
            None,
        )
        .map_err(|e| PlaybackError::Output(format!("failed to build output stream: {e}")))?;
    stream
        .play()
        .map_err(|e| PlaybackError::Output(format!("failed to start output stream: {e}")))?;
    Ok((stream, config.sample_rate.0))
}

impl SpeakerSink {
    pub fn open() -> Result<Self, PlaybackError> {
        let ring: SharedRing = Arc::new(Mutex::new(HeapRb::new(SPEAKER_BUFFER)));
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let device_ring = ring.clone();

        std::thread::Builder::new()
            .name("convai-speaker".to_string())
            .spawn(move || match open_output(device_ring) {
                Ok((stream, rate)) => {
                    let _ = ready_tx.send(Ok(rate));
                    let _ = stop_rx.recv();
                    drop(stream);
                    info!("Speaker stream closed");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| PlaybackError::Output(e.to_string()))?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| PlaybackError::Output("speaker thread exited".to_string()))??;
        info!(sample_rate, "Speaker open");
        Ok(Self {
            ring,
            sample_rate,
            _stop: stop_tx,
        })
    }
}

#[async_trait]
impl AudioSink for SpeakerSink {
    async fn play(&self, clip: AudioClip) -> Result<(), PlaybackError> {
        let channels = clip.channels.max(1) as usize;
        let pcm = convert_i16_to_f32(&clip.samples);
        let mono: Vec<f32> = if channels == 1 {
            pcm
        } else {
            pcm.chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        };
        let samples = resample(mono, clip.sample_rate, self.sample_rate)?;

        let mut offset = 0;
        while offset < samples.len() {
            let pushed = self.ring.lock().push_slice(&samples[offset..]);
            offset += pushed;
            if offset < samples.len() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        while !self.ring.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if samples.is_empty() {
            warn!("Played an empty clip");
        }
        Ok(())
    }

    fn cancel(&self) {
        let dropped = discard(&self.ring);
        if dropped > 0 {
            debug!(dropped, "Discarded buffered speaker audio");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_empties_ring() {
        let ring: SharedRing = Arc::new(Mutex::new(HeapRb::new(16)));
        assert_eq!(ring.lock().push_slice(&[0.5; 10]), 10);

        assert_eq!(discard(&ring), 10);
        assert!(ring.lock().is_empty());
        assert_eq!(discard(&ring), 0);
    }

    #[test]
    fn test_resample_identity() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(resample(samples.clone(), 16_000, 16_000).unwrap(), samples);
    }

    #[test]
    fn test_resample_upsamples_length() {
        let out = resample(vec![0.0; 2048], 16_000, 48_000).unwrap();
        assert!(out.len() >= 6000 && out.len() <= 6200);
    }
}
