//! Manages one conversation with a voice agent over a WebSocket.
//!
//! A [`ConversationSession`] owns the link (a reader task, a writer task and
//! a playback worker), the active capture if any, and the observable
//! [`SessionState`]. All public operations settle with a `Result` and mirror
//! failures into `last_error`; none of them panics.

use crate::audio::{AudioClip, decode_base64};
use crate::capture::{ActiveCapture, AudioCapture, CaptureConstraints};
use crate::config::SessionConfig;
use crate::dispatch::{Effect, dispatch};
use crate::error::{PlaybackError, SessionError};
use crate::playback::{AudioSink, PlaybackEvent, PlaybackQueue};
use crate::state::{AgentMode, ConnectionState, Diagnostic, RecordingState, SessionState};
use crate::transport::{CloseInfo, Connector, Frame, FrameSink, FrameStream, Link, WsConnector};
use convai_types::{InboundMessage, OutboundMessage};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::{
    sync::{Mutex as AsyncMutex, broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

/// How long `disconnect()` waits for the close frame to be written.
const CLOSE_GRACE: Duration = Duration::from_secs(1);
const DIAGNOSTICS_CAPACITY: usize = 64;

/// State shared between the session and its background tasks.
struct Shared {
    state: watch::Sender<SessionState>,
    diagnostics: broadcast::Sender<Diagnostic>,
    /// Written only inside `state` updates so the two never disagree.
    capture: Mutex<Option<ActiveCapture>>,
    /// Bumped by every `disconnect()`; tasks of an older link stop mutating state.
    epoch: AtomicU64,
}

impl Shared {
    fn update(&self, f: impl FnOnce(&mut SessionState)) {
        self.state.send_if_modified(|state| {
            let before = state.clone();
            f(state);
            *state != before
        });
    }

    fn notify(&self, diagnostic: Diagnostic) {
        let _ = self.diagnostics.send(diagnostic);
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Marks the link as gone and hands back the capture to release.
    fn link_lost(&self, error: Option<String>) -> Option<ActiveCapture> {
        let mut taken = None;
        self.update(|state| {
            state.link_lost(error);
            taken = self.capture.lock().take();
        });
        taken
    }

    fn on_playback(&self, epoch: u64, event: PlaybackEvent) {
        if !self.is_current(epoch) {
            return;
        }
        match event {
            PlaybackEvent::CycleStarted => self.update(|s| s.agent_mode = AgentMode::Speaking),
            PlaybackEvent::Drained => self.update(|s| s.agent_mode = AgentMode::Listening),
            PlaybackEvent::Failed(e) => self.notify(Diagnostic::Playback {
                error: e.to_string(),
            }),
        }
    }
}

/// The per-connection resources.
struct LiveLink {
    outbound: mpsc::UnboundedSender<Frame>,
    playback: Arc<PlaybackQueue>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl LiveLink {
    /// Sends a normal close frame and waits briefly for it to be written.
    async fn close(mut self) {
        self.playback.shutdown();
        if self
            .outbound
            .send(Frame::Close(Some(CloseInfo::normal())))
            .is_ok()
            && tokio::time::timeout(CLOSE_GRACE, &mut self.writer)
                .await
                .is_err()
        {
            warn!("Timed out while sending the close frame");
        }
    }
}

impl Drop for LiveLink {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
        self.playback.shutdown();
    }
}

/// A client session with a conversational voice agent.
pub struct ConversationSession {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    capture: Arc<dyn AudioCapture>,
    sink: Arc<dyn AudioSink>,
    shared: Arc<Shared>,
    link: AsyncMutex<Option<LiveLink>>,
    /// Serialises `start_recording` / `stop_recording`.
    capture_op: AsyncMutex<()>,
}

impl ConversationSession {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        capture: Arc<dyn AudioCapture>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        let (diagnostics, _) = broadcast::channel(DIAGNOSTICS_CAPACITY);
        Self {
            config,
            connector,
            capture,
            sink,
            shared: Arc::new(Shared {
                state,
                diagnostics,
                capture: Mutex::new(None),
                epoch: AtomicU64::new(0),
            }),
            link: AsyncMutex::new(None),
            capture_op: AsyncMutex::new(()),
        }
    }

    /// A session that talks to the real service through `tokio-tungstenite`.
    pub fn with_websocket(
        config: SessionConfig,
        capture: Arc<dyn AudioCapture>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        Self::new(config, Arc::new(WsConnector), capture, sink)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current snapshot of the observable state.
    pub fn state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Receiver for non-fatal events (parse failures, playback failures, ...).
    pub fn diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.shared.diagnostics.subscribe()
    }

    /// Opens the WebSocket and starts the link tasks.
    ///
    /// Does nothing when already connecting or connected.
    #[instrument(name = "convai_connect", skip_all, fields(agent_id = %self.config.agent_id))]
    pub async fn connect(&self) -> Result<(), SessionError> {
        if let Err(e) = self.config.validate() {
            error!(error = %e, "Refusing to connect");
            let message = e.to_string();
            self.shared.update(|s| s.last_error = Some(message));
            return Err(e);
        }

        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        let mut seen = ConnectionState::Disconnected;
        let claimed = self.shared.state.send_if_modified(|s| {
            seen = s.connection;
            if s.connection != ConnectionState::Disconnected {
                return false;
            }
            s.connection = ConnectionState::Connecting;
            s.last_error = None;
            true
        });
        match seen {
            _ if claimed => {}
            ConnectionState::Closing => {
                warn!("connect() while the previous link is still closing");
                return Err(SessionError::Connection(
                    "a disconnect is still in progress".to_string(),
                ));
            }
            _ => {
                info!("Already connected or connecting; ignoring connect()");
                return Ok(());
            }
        }

        // Remains of a link the peer closed earlier.
        let stale = self.link.lock().await.take();
        drop(stale);

        let request = self.config.connect_request();
        info!(url = %request.redacted_url(), "Connecting to conversational service");

        let open = self.connector.connect(request);
        let opened = match self.config.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, open).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!("timed out after {}s", limit.as_secs_f32())),
            },
            None => open.await.map_err(|e| e.to_string()),
        };

        let link = match opened {
            Ok(link) => link,
            Err(detail) => {
                error!(error = %detail, "Failed to open WebSocket");
                if self.shared.is_current(epoch) {
                    let message = format!(
                        "Connection error occurred: {detail}. Please check your API credentials and try again."
                    );
                    if let Some(capture) = self.shared.link_lost(Some(message)) {
                        capture.release();
                    }
                }
                return Err(SessionError::Connection(detail));
            }
        };

        let mut slot = self.link.lock().await;
        if !self.shared.is_current(epoch) {
            warn!("Session was disconnected while the socket was opening");
            let mut sink = link.sink;
            let _ = sink.send(Frame::Close(Some(CloseInfo::normal()))).await;
            let _ = sink.close().await;
            return Err(SessionError::Connection(
                "disconnected while the connection was opening".to_string(),
            ));
        }
        *slot = Some(self.start_link(link, epoch));
        self.shared.update(|s| {
            s.connection = ConnectionState::Connected;
            s.last_error = None;
        });
        info!("Connected to conversational service");
        Ok(())
    }

    fn start_link(&self, link: Link, epoch: u64) -> LiveLink {
        let Link { sink, stream } = link;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        if self.config.send_initiation {
            match OutboundMessage::initiation().to_json() {
                Ok(text) => {
                    debug!("Sending conversation initiation message");
                    let _ = outbound.send(Frame::Text(text));
                }
                Err(e) => warn!(error = %e, "Failed to encode initiation message"),
            }
        }

        let writer = tokio::spawn(
            write_loop(sink, outbound_rx).instrument(info_span!("convai_writer", epoch)),
        );

        let shared = self.shared.clone();
        let playback = Arc::new(PlaybackQueue::spawn(self.sink.clone(), move |event| {
            shared.on_playback(epoch, event)
        }));

        let reader = Reader {
            shared: self.shared.clone(),
            outbound: outbound.clone(),
            playback: playback.clone(),
            epoch,
            output_sample_rate: self.config.output_sample_rate,
            inactivity_timeout: self.config.inactivity_timeout,
        };
        let reader =
            tokio::spawn(reader.run(stream).instrument(info_span!("convai_reader", epoch)));

        LiveLink {
            outbound,
            playback,
            reader,
            writer,
        }
    }

    /// Closes the connection and resets every observable field.
    ///
    /// Safe from any state; repeated calls have no further effect.
    #[instrument(name = "convai_disconnect", skip_all)]
    pub async fn disconnect(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);

        let mut capture = None;
        self.shared.update(|s| {
            capture = self.shared.capture.lock().take();
            s.recording = RecordingState::Idle;
        });
        if let Some(capture) = capture {
            capture.release();
        }

        let link = self.link.lock().await.take();
        if let Some(link) = link {
            info!("Closing WebSocket");
            self.shared.update(|s| s.connection = ConnectionState::Closing);
            link.close().await;
        }

        // A connect() that started after the epoch bump owns the slot now.
        let slot = self.link.lock().await;
        if slot.is_some() {
            debug!("A newer link was opened during disconnect; keeping it");
            return;
        }
        self.shared.update(SessionState::reset);
        drop(slot);
        debug!("Session reset to disconnected");
    }

    /// Starts streaming microphone audio to the agent.
    #[instrument(name = "convai_start_recording", skip_all)]
    pub async fn start_recording(&self) -> Result<(), SessionError> {
        let _op = self.capture_op.lock().await;

        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        let outbound = {
            let link = self.link.lock().await;
            let state = self.state();
            match link.as_ref() {
                Some(link) if state.is_connected() => {
                    if state.is_recording() {
                        debug!("Already recording");
                        return Ok(());
                    }
                    link.outbound.clone()
                }
                _ => {
                    warn!(connection = ?state.connection, "Cannot record without a connection");
                    return Err(SessionError::NotConnected);
                }
            }
        };

        let constraints = CaptureConstraints::voice(self.config.input_sample_rate);
        info!("Requesting microphone access");
        let stream = match self.capture.open(&constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                let err = SessionError::Capture(e);
                error!(error = %err, "Failed to start recording");
                if self.shared.is_current(epoch) {
                    let message = err.to_string();
                    self.shared.update(|s| {
                        s.recording = RecordingState::Idle;
                        s.last_error = Some(message);
                    });
                }
                return Err(err);
            }
        };

        let active = match ActiveCapture::start(
            stream,
            self.config.input_sample_rate,
            self.config.frame_samples,
            outbound,
        ) {
            Ok(active) => active,
            Err(e) => {
                let err = SessionError::Capture(e);
                error!(error = %err, "Failed to start capture pipeline");
                let message = err.to_string();
                self.shared.update(|s| s.last_error = Some(message));
                return Err(err);
            }
        };

        let mut rejected = Some(active);
        self.shared.update(|s| {
            if s.is_connected() && self.shared.is_current(epoch) {
                *self.shared.capture.lock() = rejected.take();
                s.recording = RecordingState::Capturing;
                s.last_error = None;
            }
        });
        if let Some(active) = rejected {
            warn!("Connection went away while the microphone was opening");
            active.release();
            return Err(SessionError::NotConnected);
        }
        info!("Started PCM recording");
        Ok(())
    }

    /// Stops streaming microphone audio and clears the in-progress user
    /// transcript. The connection stays open.
    #[instrument(name = "convai_stop_recording", skip_all)]
    pub async fn stop_recording(&self) {
        let _op = self.capture_op.lock().await;

        let mut capture = None;
        self.shared.update(|s| {
            capture = self.shared.capture.lock().take();
            if capture.is_some() || s.is_recording() {
                s.recording = RecordingState::Idle;
                s.agent_mode = AgentMode::Listening;
                s.last_user_transcript.clear();
            }
        });
        match capture {
            Some(capture) => {
                capture.release();
                info!("Stopped recording");
            }
            None => debug!("stop_recording() while not recording"),
        }
    }

    /// Clears the last user transcript.
    pub fn clear_transcript(&self) {
        self.shared.update(|s| s.last_user_transcript.clear());
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        let capture = self.shared.capture.lock().take();
        if let Some(capture) = capture {
            capture.release();
        }
    }
}

/// Consumes the socket stream for one link.
struct Reader {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Frame>,
    playback: Arc<PlaybackQueue>,
    epoch: u64,
    output_sample_rate: u32,
    inactivity_timeout: Option<Duration>,
}

impl Reader {
    async fn run(self, mut stream: FrameStream) {
        loop {
            let next = match self.inactivity_timeout {
                Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        error!(?limit, "No message from the service; treating link as lost");
                        self.teardown(Some(format!(
                            "Connection closed unexpectedly: no message received for {}s",
                            limit.as_secs_f32()
                        )));
                        return;
                    }
                },
                None => stream.next().await,
            };

            match next {
                Some(Ok(Frame::Text(text))) => self.handle_text(&text),
                Some(Ok(Frame::Close(close))) => {
                    let close = close.unwrap_or(CloseInfo {
                        code: 1005,
                        reason: String::new(),
                    });
                    info!(code = close.code, reason = %close.reason, "WebSocket closed by peer");
                    if close.code == crate::transport::NORMAL_CLOSURE {
                        self.teardown(None);
                    } else {
                        let reason = if close.reason.is_empty() {
                            "Unknown reason".to_string()
                        } else {
                            close.reason
                        };
                        self.teardown(Some(format!("Connection closed unexpectedly: {reason}")));
                    }
                    return;
                }
                Some(Err(e)) => {
                    error!(error = %e, "Error reading from WebSocket");
                    self.teardown(Some(format!("Connection closed unexpectedly: {e}")));
                    return;
                }
                None => {
                    error!("WebSocket stream ended without a close frame");
                    self.teardown(Some(
                        "Connection closed unexpectedly: Unknown reason".to_string(),
                    ));
                    return;
                }
            }
        }
    }

    fn teardown(&self, error: Option<String>) {
        if !self.shared.is_current(self.epoch) {
            return;
        }
        self.playback.cancel();
        if let Some(capture) = self.shared.link_lost(error) {
            capture.release();
        }
    }

    fn handle_text(&self, text: &str) {
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed WebSocket message");
                self.shared.notify(Diagnostic::ProtocolParse {
                    error: e.to_string(),
                    frame: text.to_string(),
                });
                return;
            }
        };
        if matches!(message, InboundMessage::Unknown) {
            debug!(frame = %text, "Ignoring unknown message type");
            self.shared.notify(Diagnostic::UnknownMessage {
                frame: text.to_string(),
            });
            return;
        }
        debug!(kind = message.kind(), "WebSocket message");

        let mut effect = None;
        self.shared.update(|state| effect = dispatch(state, message));

        match effect {
            Some(Effect::Reply(reply)) => match reply.to_json() {
                Ok(json) => {
                    if self.outbound.send(Frame::Text(json)).is_err() {
                        warn!("Writer is gone; reply dropped");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to encode reply"),
            },
            Some(Effect::Enqueue(payload)) => match self.decode_clip(&payload) {
                Ok(clip) => self.playback.enqueue(clip),
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable audio chunk");
                    self.shared.notify(Diagnostic::Playback {
                        error: e.to_string(),
                    });
                }
            },
            Some(Effect::Notify(diagnostic)) => self.shared.notify(diagnostic),
            None => {}
        }
    }

    fn decode_clip(&self, payload: &str) -> Result<AudioClip, PlaybackError> {
        let bytes = decode_base64(payload).map_err(|e| PlaybackError::Decode(e.to_string()))?;
        AudioClip::from_payload(bytes, self.output_sample_rate)
            .map_err(|e| PlaybackError::Decode(e.to_string()))
    }
}

/// Sole owner of the socket sink; frames leave in the order they were queued.
async fn write_loop(mut sink: FrameSink, mut outbound: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = outbound.recv().await {
        let closing = matches!(frame, Frame::Close(_));
        if let Err(e) = sink.send(frame).await {
            warn!(error = %e, "Failed to write to WebSocket");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}
