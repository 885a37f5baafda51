//! Observable session state and the non-fatal diagnostics channel.

use serde::Serialize;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    #[default]
    Idle,
    Capturing,
}

/// Who is expected to be producing audio right now.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    #[default]
    Listening,
    Speaking,
}

/// Snapshot of everything a caller can observe about a session.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionState {
    pub connection: ConnectionState,
    pub recording: RecordingState,
    pub agent_mode: AgentMode,
    /// Assigned by the service in its initiation metadata.
    pub conversation_id: Option<String>,
    pub last_user_transcript: String,
    pub last_agent_utterance: String,
    pub last_error: Option<String>,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    pub fn is_recording(&self) -> bool {
        self.recording == RecordingState::Capturing
    }

    /// Resets every field to its disconnected value.
    pub(crate) fn reset(&mut self) {
        *self = SessionState::default();
    }

    /// Applies the teardown that follows a closed or failed link.
    ///
    /// `None` means the peer closed normally, so no error survives it.
    pub(crate) fn link_lost(&mut self, error: Option<String>) {
        self.connection = ConnectionState::Disconnected;
        self.recording = RecordingState::Idle;
        self.agent_mode = AgentMode::Listening;
        self.last_error = error;
    }
}

/// Non-fatal events. Each one is also logged.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// An inbound frame was not valid protocol JSON and was dropped.
    ProtocolParse { error: String, frame: String },
    /// A message with an unknown `type` was ignored.
    UnknownMessage { frame: String },
    /// A queued clip could not be decoded or played; it was skipped.
    Playback { error: String },
    /// The service sent an `error` message.
    Server { message: String },
    /// The service handed the turn back to the user.
    Interrupted { reason: Option<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state() {
        let state = SessionState::default();
        assert_eq!(state.connection, ConnectionState::Disconnected);
        assert_eq!(state.recording, RecordingState::Idle);
        assert_eq!(state.agent_mode, AgentMode::Listening);
        assert!(state.conversation_id.is_none());
        assert!(!state.is_connected());
        assert!(!state.is_recording());
    }

    #[test]
    fn test_link_lost_keeps_conversation_fields() {
        let mut state = SessionState {
            connection: ConnectionState::Connected,
            recording: RecordingState::Capturing,
            agent_mode: AgentMode::Speaking,
            conversation_id: Some("c1".into()),
            last_user_transcript: "hello".into(),
            last_agent_utterance: "hi there".into(),
            last_error: None,
        };
        state.link_lost(Some("Connection closed unexpectedly: gone".into()));
        assert_eq!(state.connection, ConnectionState::Disconnected);
        assert_eq!(state.recording, RecordingState::Idle);
        assert_eq!(state.agent_mode, AgentMode::Listening);
        assert_eq!(state.conversation_id.as_deref(), Some("c1"));
        assert_eq!(
            state.last_error.as_deref(),
            Some("Connection closed unexpectedly: gone")
        );

    }

    #[test]
    fn test_normal_close_clears_earlier_error() {
        let mut state = SessionState {
            connection: ConnectionState::Connected,
            conversation_id: Some("c1".into()),
            last_error: Some("Server error: quota".into()),
            ..Default::default()
        };
        state.link_lost(None);
        assert_eq!(state.connection, ConnectionState::Disconnected);
        assert_eq!(state.conversation_id.as_deref(), Some("c1"));
        assert!(state.last_error.is_none());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_value(SessionState::default()).unwrap();
        assert_eq!(json["connection"], "disconnected");
        assert_eq!(json["agent_mode"], "listening");
    }
}
