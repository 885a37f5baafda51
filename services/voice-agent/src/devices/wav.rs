use async_trait::async_trait;
use convai::audio::{AudioClip, convert_i16_to_f32};
use convai::{
    AudioCapture, AudioSink, CaptureConstraints, CaptureError, CaptureGuard, CaptureStream,
    PlaybackError,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

/// Length of each block handed to the session.
pub const CAPTURE_BLOCK: Duration = Duration::from_millis(100);

/// Reads a WAV file as mono f32 samples, averaging channels.
pub fn read_wav_mono(path: &Path) -> Result<(u32, Vec<f32>), CaptureError> {
    let reader = hound::WavReader::open(path).map_err(|e| match e {
        hound::Error::IoError(io) => {
            CaptureError::DeviceUnavailable(format!("{}: {io}", path.display()))
        }
        other => CaptureError::Unsupported(format!("{}: {other}", path.display())),
    })?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => {
            let samples = reader
                .into_samples::<i16>()
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| CaptureError::Device(e.to_string()))?;
            convert_i16_to_f32(&samples)
        }
        (hound::SampleFormat::Float, 32) => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CaptureError::Device(e.to_string()))?,
        (format, bits) => {
            return Err(CaptureError::Unsupported(format!(
                "{bits}-bit {format:?} WAV is not supported"
            )));
        }
    };

    let channels = spec.channels.max(1) as usize;
    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };
    Ok((spec.sample_rate, mono))
}

/// Plays a WAV file into the session as if it were a microphone.
///
/// Blocks are paced in real time; once the file is exhausted the capture keeps
/// delivering silence so the agent can detect the end of the turn.
#[derive(Debug, Clone)]
pub struct WavFileCapture {
    path: PathBuf,
    block: Duration,
}

impl WavFileCapture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block: CAPTURE_BLOCK,
        }
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }
}

struct TaskGuard(JoinHandle<()>);

impl CaptureGuard for TaskGuard {
    fn release(self: Box<Self>) {
        self.0.abort();
    }
}

#[async_trait]
impl AudioCapture for WavFileCapture {
    async fn open(&self, constraints: &CaptureConstraints) -> Result<CaptureStream, CaptureError> {
        let path = self.path.clone();
        let (sample_rate, samples) = tokio::task::spawn_blocking(move || read_wav_mono(&path))
            .await
            .map_err(|e| CaptureError::Device(e.to_string()))??;
        info!(
            path = %self.path.display(),
            sample_rate,
            requested_rate = constraints.sample_rate,
            seconds = samples.len() as f32 / sample_rate.max(1) as f32,
            "Streaming WAV file as microphone input"
        );

        let block_len = ((sample_rate as u128 * self.block.as_millis()) / 1000).max(1) as usize;
        let (tx, blocks) = mpsc::channel(8);
        let period = self.block;
        let feeder = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            for chunk in samples.chunks(block_len) {
                ticker.tick().await;
                if tx.send(chunk.to_vec()).await.is_err() {
                    return;
                }
            }
            debug!("WAV input exhausted; sending silence");
            loop {
                ticker.tick().await;
                if tx.send(vec![0.0; block_len]).await.is_err() {
                    return;
                }
            }
        });

        Ok(CaptureStream {
            sample_rate,
            blocks,
            guard: Box::new(TaskGuard(feeder)),
        })
    }
}

/// Writes every agent clip to a numbered WAV file.
///
/// With `realtime` set, `play` also waits for the clip's duration so the
/// session sees playback take as long as it would on a speaker.
#[derive(Debug)]
pub struct WavDirSink {
    dir: PathBuf,
    realtime: bool,
    written: AtomicUsize,
}

impl WavDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            realtime: true,
            written: AtomicUsize::new(0),
        })
    }

    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for WavDirSink {
    async fn play(&self, clip: AudioClip) -> Result<(), PlaybackError> {
        let index = self.written.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self.dir.join(format!("agent-{index:04}.wav"));
        tokio::fs::write(&path, &clip.wav)
            .await
            .map_err(|e| PlaybackError::Output(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), duration = ?clip.duration(), "Wrote agent audio");
        if self.realtime {
            tokio::time::sleep(clip.duration()).await;
        }
        Ok(())
    }
}
