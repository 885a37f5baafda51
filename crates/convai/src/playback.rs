//! Sequential playback of agent audio.
//!
//! Producers append clips from any task; a single worker task takes them in
//! arrival order and awaits each one through the [`AudioSink`] before taking
//! the next, so two clips never overlap.

use crate::audio::AudioClip;
use crate::error::PlaybackError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, warn};

/// Output device for agent speech.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Plays one clip and resolves when it has finished (or failed).
    async fn play(&self, clip: AudioClip) -> Result<(), PlaybackError>;

    /// Discards audio already handed to the device. Called on teardown.
    fn cancel(&self) {}
}

/// Progress reported by the drain worker.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// The worker took the first clip after being idle.
    CycleStarted,
    /// The queue became empty after at least one clip.
    Drained,
    /// A clip failed and was skipped.
    Failed(PlaybackError),
}

struct QueueInner {
    clips: Mutex<VecDeque<AudioClip>>,
    wake: Notify,
}

/// FIFO of clips with one in-flight consumer.
pub struct PlaybackQueue {
    inner: Arc<QueueInner>,
    sink: Arc<dyn AudioSink>,
    worker: JoinHandle<()>,
}

impl PlaybackQueue {
    /// Creates an empty queue and spawns its drain worker.
    pub fn spawn<F>(sink: Arc<dyn AudioSink>, on_event: F) -> Self
    where
        F: Fn(PlaybackEvent) + Send + Sync + 'static,
    {
        let inner = Arc::new(QueueInner {
            clips: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
        });
        let worker = tokio::spawn(drain(inner.clone(), sink.clone(), on_event));
        Self {
            inner,
            sink,
            worker,
        }
    }

    pub fn enqueue(&self, clip: AudioClip) {
        let depth = {
            let mut clips = self.inner.clips.lock();
            clips.push_back(clip);
            clips.len()
        };
        debug!(depth, "Queued agent audio");
        self.inner.wake.notify_one();
    }

    /// Drops every clip that has not started playing.
    pub fn clear(&self) {
        self.inner.clips.lock().clear();
    }

    /// Drops pending clips and whatever the sink has buffered.
    pub fn cancel(&self) {
        self.clear();
        self.sink.cancel();
    }

    /// Cancels playback and stops the worker, cutting the current clip short.
    pub fn shutdown(&self) {
        self.worker.abort();
        self.cancel();
    }

    pub fn len(&self) -> usize {
        self.inner.clips.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn drain<F>(inner: Arc<QueueInner>, sink: Arc<dyn AudioSink>, on_event: F)
where
    F: Fn(PlaybackEvent) + Send + Sync + 'static,
{
    let mut draining = false;
    loop {
        let next = inner.clips.lock().pop_front();
        match next {
            Some(clip) => {
                if !draining {
                    draining = true;
                    on_event(PlaybackEvent::CycleStarted);
                }
                if let Err(e) = sink.play(clip).await {
                    warn!(error = %e, "Skipping audio chunk that failed to play");
                    on_event(PlaybackEvent::Failed(e));
                }
            }
            None => {
                if draining {
                    draining = false;
                    on_event(PlaybackEvent::Drained);
                }
                inner.wake.notified().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Records the first sample of every clip and how many play at once.
    struct RecordingSink {
        played: Mutex<Vec<i16>>,
        active: Mutex<usize>,
        max_active: Mutex<usize>,
        cancelled: Mutex<usize>,
        delay: Duration,
        fail_on: Option<i16>,
    }

    impl RecordingSink {
        fn new(delay: Duration, fail_on: Option<i16>) -> Arc<Self> {
            Arc::new(Self {
                played: Mutex::new(Vec::new()),
                active: Mutex::new(0),
                max_active: Mutex::new(0),
                cancelled: Mutex::new(0),
                delay,
                fail_on,
            })
        }
    }

    #[async_trait]
    impl AudioSink for RecordingSink {
        async fn play(&self, clip: AudioClip) -> Result<(), PlaybackError> {
            {
                let mut active = self.active.lock();
                *active += 1;
                let mut max = self.max_active.lock();
                *max = (*max).max(*active);
            }
            tokio::time::sleep(self.delay).await;
            *self.active.lock() -= 1;
            let tag = clip.samples[0];
            if Some(tag) == self.fail_on {
                return Err(PlaybackError::Output("device lost".into()));
            }
            self.played.lock().push(tag);
            Ok(())
        }

        fn cancel(&self) {
            *self.cancelled.lock() += 1;
        }
    }

    fn clip(tag: i16) -> AudioClip {
        AudioClip::from_payload(tag.to_le_bytes().to_vec(), 16_000).unwrap()
    }

    fn event_channel() -> (
        impl Fn(PlaybackEvent) + Send + Sync + 'static,
        mpsc::UnboundedReceiver<PlaybackEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (move |event| drop(tx.send(event)), rx)
    }

    #[tokio::test]
    async fn test_plays_in_order_one_at_a_time() {
        let sink = RecordingSink::new(Duration::from_millis(20), None);
        let (on_event, mut events) = event_channel();
        let queue = PlaybackQueue::spawn(sink.clone(), on_event);

        queue.enqueue(clip(1));
        queue.enqueue(clip(2));
        tokio::time::sleep(Duration::from_millis(5)).await;
        // appended while the first clip is still playing
        queue.enqueue(clip(3));
        queue.enqueue(clip(4));

        assert_eq!(events.recv().await, Some(PlaybackEvent::CycleStarted));
        assert_eq!(events.recv().await, Some(PlaybackEvent::Drained));
        assert_eq!(*sink.played.lock(), vec![1, 2, 3, 4]);
        assert_eq!(*sink.max_active.lock(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_failed_clip_is_skipped() {
        let sink = RecordingSink::new(Duration::from_millis(1), Some(2));
        let (on_event, mut events) = event_channel();
        let queue = PlaybackQueue::spawn(sink.clone(), on_event);

        for tag in 1..=3 {
            queue.enqueue(clip(tag));
        }

        assert_eq!(events.recv().await, Some(PlaybackEvent::CycleStarted));
        assert!(matches!(
            events.recv().await,
            Some(PlaybackEvent::Failed(PlaybackError::Output(_)))
        ));
        assert_eq!(events.recv().await, Some(PlaybackEvent::Drained));
        assert_eq!(*sink.played.lock(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_new_cycle_after_drain() {
        let sink = RecordingSink::new(Duration::from_millis(1), None);
        let (on_event, mut events) = event_channel();
        let queue = PlaybackQueue::spawn(sink.clone(), on_event);

        queue.enqueue(clip(1));
        assert_eq!(events.recv().await, Some(PlaybackEvent::CycleStarted));
        assert_eq!(events.recv().await, Some(PlaybackEvent::Drained));

        queue.enqueue(clip(2));
        assert_eq!(events.recv().await, Some(PlaybackEvent::CycleStarted));
        assert_eq!(events.recv().await, Some(PlaybackEvent::Drained));
        assert_eq!(*sink.played.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_clear_drops_pending_clips() {
        let sink = RecordingSink::new(Duration::from_millis(30), None);
        let (on_event, mut events) = event_channel();
        let queue = PlaybackQueue::spawn(sink.clone(), on_event);

        queue.enqueue(clip(1));
        assert_eq!(events.recv().await, Some(PlaybackEvent::CycleStarted));
        queue.enqueue(clip(2));
        queue.enqueue(clip(3));
        queue.clear();
        assert!(queue.is_empty());

        assert_eq!(events.recv().await, Some(PlaybackEvent::Drained));
        assert_eq!(*sink.played.lock(), vec![1]);
    }

    #[tokio::test]
    async fn test_shutdown_cuts_playback_and_cancels_sink() {
        let sink = RecordingSink::new(Duration::from_millis(50), None);
        let (on_event, mut events) = event_channel();
        let queue = PlaybackQueue::spawn(sink.clone(), on_event);

        queue.enqueue(clip(1));
        queue.enqueue(clip(2));
        assert_eq!(events.recv().await, Some(PlaybackEvent::CycleStarted));
        queue.shutdown();

        assert!(queue.is_empty());
        assert_eq!(*sink.cancelled.lock(), 1);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(sink.played.lock().is_empty());
        assert!(events.try_recv().is_err());
    }
}
