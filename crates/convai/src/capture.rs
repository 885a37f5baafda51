//! Microphone capture seam and the frame pump that feeds the socket.

use crate::audio::{FrameAssembler, encode_i16};
use crate::error::CaptureError;
use crate::transport::Frame;
use async_trait::async_trait;
use convai_types::OutboundMessage;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

/// What the session asks of the capture device.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl CaptureConstraints {
    /// Mono voice capture at `sample_rate` with the usual processing requested.
    pub fn voice(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Keeps the underlying device alive until released.
pub trait CaptureGuard: Send {
    /// Stops every track of the device. Consumed, so it runs at most once.
    fn release(self: Box<Self>);
}

/// A live capture: mono f32 blocks at `sample_rate`.
pub struct CaptureStream {
    /// Rate the device actually delivers; resampled to the target if different.
    pub sample_rate: u32,
    pub blocks: mpsc::Receiver<Vec<f32>>,
    pub guard: Box<dyn CaptureGuard>,
}

/// Source of microphone audio.
#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Acquires the device. Resolves once permission is granted or denied.
    async fn open(&self, constraints: &CaptureConstraints) -> Result<CaptureStream, CaptureError>;
}

type FrameGate = Arc<Mutex<Option<mpsc::UnboundedSender<Frame>>>>;

/// A capture wired to the outbound channel.
pub(crate) struct ActiveCapture {
    gate: FrameGate,
    pump: JoinHandle<()>,
    guard: Box<dyn CaptureGuard>,
}

impl ActiveCapture {
    pub(crate) fn start(
        stream: CaptureStream,
        target_rate: u32,
        frame_samples: usize,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Result<Self, CaptureError> {
        let CaptureStream {
            sample_rate,
            blocks,
            guard,
        } = stream;
        let assembler = match FrameAssembler::new(sample_rate, target_rate, frame_samples) {
            Ok(assembler) => assembler,
            Err(e) => {
                guard.release();
                return Err(CaptureError::Unsupported(e.to_string()));
            }
        };
        info!(
            device_rate = sample_rate,
            target_rate, frame_samples, "Starting PCM capture"
        );

        let gate: FrameGate = Arc::new(Mutex::new(Some(outbound)));
        let pump = tokio::spawn(pump(blocks, assembler, gate.clone()));
        Ok(Self { gate, pump, guard })
    }

    /// Closes the gate, stops the pump and releases the device.
    ///
    /// Once this returns no further frame reaches the outbound channel.
    pub(crate) fn release(self) {
        self.gate.lock().take();
        self.pump.abort();
        self.guard.release();
        info!("Capture released");
    }
}

async fn pump(
    mut blocks: mpsc::Receiver<Vec<f32>>,
    mut assembler: FrameAssembler,
    gate: FrameGate,
) {
    let mut sent: u64 = 0;
    while let Some(block) = blocks.recv().await {
        for frame in assembler.push(&block) {
            let text = match OutboundMessage::audio(encode_i16(&frame)).to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode audio frame");
                    continue;
                }
            };
            let gate = gate.lock();
            let Some(outbound) = gate.as_ref() else {
                return;
            };
            if outbound.send(Frame::Text(text)).is_err() {
                return;
            }
            sent += 1;
            debug!(frame = sent, "Sent PCM audio chunk");
        }
    }
    warn!(frames = sent, "Capture device stopped delivering audio");
}
