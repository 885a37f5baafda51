//! Drives one conversation to completion, reconnecting after abnormal closes.

use crate::config::Config;
use convai::{ConnectionState, ConversationSession, SessionError, SessionState};
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub max_conversation: Duration,
}

impl From<&Config> for SupervisorSettings {
    fn from(config: &Config) -> Self {
        Self {
            reconnect_interval: config.reconnect_interval,
            max_reconnect_attempts: config.max_reconnect_attempts,
            max_conversation: config.max_conversation,
        }
    }
}

/// Why a conversation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The service closed the connection normally.
    Completed,
    /// The maximum conversation duration elapsed.
    TimeLimit,
    /// The shutdown future resolved.
    Interrupted,
    /// Every reconnect attempt failed.
    GaveUp { attempts: u32 },
}

/// Connects, starts recording and keeps the conversation alive until it ends.
///
/// Only the first connect or recording failure is returned as an error; later
/// link losses are retried up to `max_reconnect_attempts` times.
pub async fn run_conversation(
    session: &ConversationSession,
    settings: &SupervisorSettings,
    shutdown: impl Future<Output = ()>,
) -> Result<Outcome, SessionError> {
    let mut states = session.subscribe();
    let mut diagnostics = session.diagnostics();

    resume(session).await?;
    info!("Conversation started; speak to the agent");

    let deadline = tokio::time::sleep(settings.max_conversation);
    tokio::pin!(deadline);
    tokio::pin!(shutdown);

    let mut seen = session.state();
    let mut attempts = 0u32;

    let outcome = 'conversation: loop {
        tokio::select! {
            _ = &mut shutdown => break Outcome::Interrupted,
            _ = &mut deadline => {
                info!(limit = ?settings.max_conversation, "Maximum conversation duration reached");
                break Outcome::TimeLimit;
            }
            diagnostic = diagnostics.recv() => match diagnostic {
                Ok(diagnostic) => debug!(?diagnostic, "Session diagnostic"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Diagnostics lagged"),
                Err(RecvError::Closed) => {}
            },
            changed = states.changed() => {
                if changed.is_err() {
                    break Outcome::Completed;
                }
                let state = states.borrow_and_update().clone();
                report_transcripts(&seen, &state);
                seen = state.clone();

                if state.connection != ConnectionState::Disconnected {
                    continue;
                }
                let Some(mut error) = state.last_error else {
                    info!("Conversation ended by the service");
                    break Outcome::Completed;
                };

                loop {
                    if attempts >= settings.max_reconnect_attempts {
                        warn!(attempts, %error, "Giving up on the conversation");
                        break 'conversation Outcome::GaveUp { attempts };
                    }
                    attempts += 1;
                    warn!(
                        attempt = attempts,
                        max = settings.max_reconnect_attempts,
                        %error,
                        "Connection lost; reconnecting in {:?}",
                        settings.reconnect_interval
                    );

                    tokio::select! {
                        _ = &mut shutdown => break 'conversation Outcome::Interrupted,
                        _ = &mut deadline => break 'conversation Outcome::TimeLimit,
                        _ = tokio::time::sleep(settings.reconnect_interval) => {}
                    }
                    if let Err(e) = resume(session).await {
                        warn!(error = %e, "Reconnect failed");
                        error = e.to_string();
                        continue;
                    }

                    // The link may already be gone again; look before waiting.
                    let now = states.borrow_and_update().clone();
                    seen = now.clone();
                    if now.is_connected() {
                        info!(attempt = attempts, "Reconnected");
                        attempts = 0;
                        break;
                    }
                    match now.last_error {
                        Some(e) => error = e,
                        None => break 'conversation Outcome::Completed,
                    }
                }
            }
        }
    };

    session.disconnect().await;
    Ok(outcome)
}

/// Opens the link and starts the microphone; a link without audio is closed again.
async fn resume(session: &ConversationSession) -> Result<(), SessionError> {
    session.connect().await?;
    if let Err(e) = session.start_recording().await {
        session.disconnect().await;
        return Err(e);
    }
    Ok(())
}

fn report_transcripts(before: &SessionState, after: &SessionState) {
    if after.last_user_transcript != before.last_user_transcript
        && !after.last_user_transcript.is_empty()
    {
        info!(target: "transcript", "You: {}", after.last_user_transcript);
    }
    if after.last_agent_utterance != before.last_agent_utterance
        && !after.last_agent_utterance.is_empty()
    {
        info!(target: "transcript", "Agent: {}", after.last_agent_utterance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use convai::audio::AudioClip;
    use convai::transport::{CloseInfo, Connector, Frame, Link};
    use convai::{
        AudioCapture, AudioSink, CaptureConstraints, CaptureError, CaptureGuard, CaptureStream,
        ConnectRequest, PlaybackError, SessionConfig, TransportError,
    };
    use futures_util::{SinkExt, stream};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Hands out in-memory links; after `accept` links it refuses.
    struct ScriptedConnector {
        calls: AtomicUsize,
        accept: usize,
        servers: Mutex<Vec<mpsc::UnboundedSender<Result<Frame, TransportError>>>>,
    }

    impl ScriptedConnector {
        fn new(accept: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                accept,
                servers: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Sends a text frame on the most recent link.
        fn send_latest(&self, text: &str) {
            let servers = self.servers.lock();
            let server = servers.last().expect("no link opened");
            let _ = server.send(Ok(Frame::Text(text.to_string())));
        }

        /// Closes the most recent link with `code`.
        fn close_latest(&self, code: u16) {
            let servers = self.servers.lock();
            let server = servers.last().expect("no link opened");
            let _ = server.send(Ok(Frame::Close(Some(CloseInfo {
                code,
                reason: "test".to_string(),
            }))));
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _request: ConnectRequest) -> Result<Link, TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call >= self.accept {
                return Err(TransportError::Request("503 Service Unavailable".into()));
            }
            let (server, inbound) = mpsc::unbounded_channel();
            self.servers.lock().push(server);
            let stream = stream::unfold(inbound, |mut rx| async move {
                rx.recv().await.map(|frame| (frame, rx))
            });
            let sink =
                futures_util::sink::drain::<Frame>().sink_map_err(|_| TransportError::Closed);
            Ok(Link {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        }
    }

    struct NoopGuard;

    impl CaptureGuard for NoopGuard {
        fn release(self: Box<Self>) {}
    }

    /// A microphone in a silent room; denies access after `allow` opens.
    #[derive(Default)]
    struct SilentCapture {
        opened: AtomicUsize,
        allow: Option<usize>,
        devices: Mutex<Vec<mpsc::Sender<Vec<f32>>>>,
    }

    #[async_trait]
    impl AudioCapture for SilentCapture {
        async fn open(&self, c: &CaptureConstraints) -> Result<CaptureStream, CaptureError> {
            let opened = self.opened.fetch_add(1, Ordering::SeqCst);
            if self.allow.is_some_and(|allow| opened >= allow) {
                return Err(CaptureError::PermissionDenied);
            }
            let (tx, blocks) = mpsc::channel(1);
            self.devices.lock().push(tx);
            Ok(CaptureStream {
                sample_rate: c.sample_rate,
                blocks,
                guard: Box::new(NoopGuard),
            })
        }
    }

    struct NullSink;

    #[async_trait]
    impl AudioSink for NullSink {
        async fn play(&self, _clip: AudioClip) -> Result<(), PlaybackError> {
            Ok(())
        }
    }

    fn session(connector: Arc<ScriptedConnector>) -> ConversationSession {
        session_with(connector, SilentCapture::default())
    }

    fn session_with(
        connector: Arc<ScriptedConnector>,
        capture: SilentCapture,
    ) -> ConversationSession {
        ConversationSession::new(
            SessionConfig::new("sk_test", "agent_test").with_initiation(false),
            connector,
            Arc::new(capture),
            Arc::new(NullSink),
        )
    }

    fn settings(max_reconnect_attempts: u32) -> SupervisorSettings {
        SupervisorSettings {
            reconnect_interval: Duration::from_millis(10),
            max_reconnect_attempts,
            max_conversation: Duration::from_secs(5),
        }
    }

    /// Waits until `n` links have been requested.
    async fn until_calls(connector: &ScriptedConnector, n: usize) {
        while connector.calls() < n {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_normal_close_completes() {
        let connector = ScriptedConnector::new(1);
        let session = session(connector.clone());
        let closer = {
            let connector = connector.clone();
            async move {
                until_calls(&connector, 1).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                connector.close_latest(1000);
                std::future::pending::<()>().await
            }
        };

        let outcome = run_conversation(&session, &settings(3), closer).await.unwrap();
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(connector.calls(), 1);
        assert_eq!(session.state(), SessionState::default());
    }

    #[tokio::test]
    async fn test_abnormal_close_reconnects() {
        let connector = ScriptedConnector::new(2);
        let session = session(connector.clone());
        let script = {
            let connector = connector.clone();
            async move {
                until_calls(&connector, 1).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                connector.close_latest(1006);
                until_calls(&connector, 2).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                connector.close_latest(1000);
                std::future::pending::<()>().await
            }
        };

        let outcome = run_conversation(&session, &settings(3), script).await.unwrap();
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(connector.calls(), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let connector = ScriptedConnector::new(1);
        let session = session(connector.clone());
        let script = {
            let connector = connector.clone();
            async move {
                until_calls(&connector, 1).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                connector.close_latest(1011);
                std::future::pending::<()>().await
            }
        };

        let outcome = run_conversation(&session, &settings(2), script).await.unwrap();
        assert_eq!(outcome, Outcome::GaveUp { attempts: 2 });
        assert_eq!(connector.calls(), 3);
    }

    #[tokio::test]
    async fn test_server_error_then_normal_close_completes() {
        let connector = ScriptedConnector::new(3);
        let session = session(connector.clone());
        let script = {
            let connector = connector.clone();
            async move {
                until_calls(&connector, 1).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                connector.send_latest(r#"{"type":"error","error_event":{"message":"quota"}}"#);
                tokio::time::sleep(Duration::from_millis(20)).await;
                connector.close_latest(1000);
                std::future::pending::<()>().await
            }
        };

        let outcome = run_conversation(&session, &settings(2), script).await.unwrap();
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_without_microphone_counts_as_failed() {
        let connector = ScriptedConnector::new(usize::MAX);
        let capture = SilentCapture {
            allow: Some(1),
            ..Default::default()
        };
        let session = session_with(connector.clone(), capture);
        let script = {
            let connector = connector.clone();
            async move {
                until_calls(&connector, 1).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                connector.close_latest(1006);
                std::future::pending::<()>().await
            }
        };

        let outcome = run_conversation(&session, &settings(2), script).await.unwrap();
        assert_eq!(outcome, Outcome::GaveUp { attempts: 2 });
        assert_eq!(connector.calls(), 3);
        assert_eq!(session.state(), SessionState::default());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts() {
        let connector = ScriptedConnector::new(1);
        let session = session(connector.clone());

        let shutdown = tokio::time::sleep(Duration::from_millis(30));
        let outcome = run_conversation(&session, &settings(3), shutdown).await.unwrap();
        assert_eq!(outcome, Outcome::Interrupted);
        assert_eq!(session.state(), SessionState::default());
    }

    #[tokio::test]
    async fn test_time_limit() {
        let connector = ScriptedConnector::new(1);
        let session = session(connector.clone());
        let settings = SupervisorSettings {
            max_conversation: Duration::from_millis(30),
            ..settings(3)
        };

        let outcome = run_conversation(&session, &settings, std::future::pending())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::TimeLimit);
    }

    #[tokio::test]
    async fn test_first_connect_failure_is_returned() {
        let connector = ScriptedConnector::new(0);
        let session = session(connector.clone());

        let err = run_conversation(&session, &settings(3), std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Connection(_)));
        assert_eq!(connector.calls(), 1);
    }
}
