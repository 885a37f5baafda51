//! Wire types for the conversational-voice WebSocket protocol.
//!
//! Every frame is a JSON text message. Server frames are discriminated by a
//! `type` field and carry their payload in a `<name>_event` object. Client
//! frames are either tagged control events or bare `user_audio_chunk` objects.

use serde::{Deserialize, Serialize};

/// Identifier the server attaches to events that expect an echo (e.g. `ping`).
///
/// The service currently sends integers; strings are accepted so that an echo
/// never alters the identifier it was given.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum EventId {
    Number(u64),
    Text(String),
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventId::Number(n) => write!(f, "{n}"),
            EventId::Text(s) => f.write_str(s),
        }
    }
}

/// Messages sent from the conversational service to the client.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// First message of a conversation; assigns the conversation id.
    ConversationInitiationMetadata {
        #[serde(default)]
        conversation_initiation_metadata_event: InitiationMetadataEvent,
    },
    /// Recognised text of the user's current utterance.
    UserTranscript {
        #[serde(default)]
        user_transcription_event: UserTranscriptionEvent,
    },
    /// Text of the utterance the agent is about to speak.
    AgentResponse {
        #[serde(default)]
        agent_response_event: AgentResponseEvent,
    },
    /// Replacement text for an utterance already being spoken.
    AgentResponseCorrection {
        #[serde(default)]
        agent_response_correction_event: AgentResponseCorrectionEvent,
    },
    /// A chunk of agent speech, base64 encoded.
    Audio {
        #[serde(default)]
        audio_event: AudioEvent,
    },
    /// Keep-alive check. Must be answered with a `pong` carrying the same id.
    Ping {
        #[serde(default)]
        ping_event: PingEvent,
    },
    /// The agent stopped speaking because the user took the turn.
    Interruption {
        #[serde(default)]
        interruption_event: InterruptionEvent,
    },
    /// An error reported by the service. The connection is not closed by it.
    Error {
        #[serde(default)]
        error_event: ErrorEvent,
        #[serde(default)]
        message: Option<String>,
    },
    /// Any tag this client does not know about.
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    /// Parses a single text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The wire tag of this message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::ConversationInitiationMetadata { .. } => {
                "conversation_initiation_metadata"
            }
            InboundMessage::UserTranscript { .. } => "user_transcript",
            InboundMessage::AgentResponse { .. } => "agent_response",
            InboundMessage::AgentResponseCorrection { .. } => "agent_response_correction",
            InboundMessage::Audio { .. } => "audio",
            InboundMessage::Ping { .. } => "ping",
            InboundMessage::Interruption { .. } => "interruption",
            InboundMessage::Error { .. } => "error",
            InboundMessage::Unknown => "unknown",
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct InitiationMetadataEvent {
    pub conversation_id: Option<String>,
    pub agent_output_audio_format: Option<String>,
    pub user_input_audio_format: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct UserTranscriptionEvent {
    pub user_transcript: String,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AgentResponseEvent {
    pub agent_response: String,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AgentResponseCorrectionEvent {
    pub original_agent_response: Option<String>,
    pub corrected_response: String,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AudioEvent {
    pub audio_base_64: Option<String>,
    pub event_id: Option<EventId>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct PingEvent {
    pub event_id: Option<EventId>,
    pub ping_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct InterruptionEvent {
    pub reason: Option<String>,
    pub event_id: Option<EventId>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ErrorEvent {
    pub message: Option<String>,
    pub error_type: Option<String>,
    pub code: Option<u16>,
}

/// Fallback text when the service reports an error without a message.
pub const GENERIC_SERVER_ERROR: &str = "Server error occurred. Please try again.";

impl InboundMessage {
    /// Human-readable description of an `error` message.
    ///
    /// Returns `None` for every other variant.
    pub fn error_description(&self) -> Option<String> {
        let InboundMessage::Error {
            error_event,
            message,
        } = self
        else {
            return None;
        };
        let detail = error_event.message.as_ref().or(message.as_ref());
        Some(match (detail, &error_event.error_type) {
            (Some(detail), Some(kind)) => format!("Server error ({kind}): {detail}"),
            (Some(detail), None) => format!("Server error: {detail}"),
            (None, _) => GENERIC_SERVER_ERROR.to_string(),
        })
    }
}

/// Control events sent from the client, discriminated by `type`.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Explicit handshake sent once right after the socket opens.
    ConversationInitiationClientData,
    /// Answer to a `ping`.
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        event_id: Option<EventId>,
    },
}

/// Every frame the client can send.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum OutboundMessage {
    Event(ClientEvent),
    /// One captured frame: base64 of PCM16 mono little-endian samples.
    UserAudioChunk { user_audio_chunk: String },
}

impl OutboundMessage {
    pub fn initiation() -> Self {
        OutboundMessage::Event(ClientEvent::ConversationInitiationClientData)
    }

    pub fn pong(event_id: Option<EventId>) -> Self {
        OutboundMessage::Event(ClientEvent::Pong { event_id })
    }

    pub fn audio(user_audio_chunk: String) -> Self {
        OutboundMessage::UserAudioChunk { user_audio_chunk }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_initiation_metadata() {
        let msg = InboundMessage::parse(
            r#"{"type":"conversation_initiation_metadata","conversation_initiation_metadata_event":{"conversation_id":"abc123","agent_output_audio_format":"pcm_16000"}}"#,
        )
        .unwrap();
        match msg {
            InboundMessage::ConversationInitiationMetadata {
                conversation_initiation_metadata_event: event,
            } => {
                assert_eq!(event.conversation_id.as_deref(), Some("abc123"));
                assert_eq!(event.agent_output_audio_format.as_deref(), Some("pcm_16000"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_missing_event_payload_defaults() {
        let msg = InboundMessage::parse(r#"{"type":"user_transcript"}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::UserTranscript {
                user_transcription_event: UserTranscriptionEvent::default(),
            }
        );
    }

    #[test]
    fn test_unknown_tag_is_accepted() {
        let msg =
            InboundMessage::parse(r#"{"type":"vad_score","vad_score_event":{"vad_score":0.9}}"#)
                .unwrap();
        assert_eq!(msg, InboundMessage::Unknown);
        assert_eq!(msg.kind(), "unknown");
    }

    #[test]
    fn test_missing_tag_is_a_parse_error() {
        assert!(InboundMessage::parse(r#"{"user_transcript":"hi"}"#).is_err());
        assert!(InboundMessage::parse("not json").is_err());
    }

    #[test]
    fn test_ping_event_id_variants() {
        let numeric =
            InboundMessage::parse(r#"{"type":"ping","ping_event":{"event_id":7,"ping_ms":40}}"#)
                .unwrap();
        assert_eq!(
            numeric,
            InboundMessage::Ping {
                ping_event: PingEvent {
                    event_id: Some(EventId::Number(7)),
                    ping_ms: Some(40),
                }
            }
        );

        let text =
            InboundMessage::parse(r#"{"type":"ping","ping_event":{"event_id":"e-1"}}"#).unwrap();
        let InboundMessage::Ping { ping_event } = text else {
            panic!("expected ping");
        };
        assert_eq!(ping_event.event_id, Some(EventId::Text("e-1".into())));
    }

    #[test]
    fn test_error_description() {
        let with_detail = InboundMessage::parse(
            r#"{"type":"error","error_event":{"message":"quota exceeded","error_type":"billing"}}"#,
        )
        .unwrap();
        assert_eq!(
            with_detail.error_description().as_deref(),
            Some("Server error (billing): quota exceeded")
        );

        let top_level = InboundMessage::parse(r#"{"type":"error","message":"bad agent"}"#).unwrap();
        assert_eq!(
            top_level.error_description().as_deref(),
            Some("Server error: bad agent")
        );

        let bare = InboundMessage::parse(r#"{"type":"error"}"#).unwrap();
        assert_eq!(bare.error_description().as_deref(), Some(GENERIC_SERVER_ERROR));

        let not_error = InboundMessage::parse(r#"{"type":"interruption"}"#).unwrap();
        assert!(not_error.error_description().is_none());
    }

    #[test]
    fn test_outbound_wire_shapes() {
        let init: serde_json::Value =
            serde_json::from_str(&OutboundMessage::initiation().to_json().unwrap()).unwrap();
        assert_eq!(init, json!({"type": "conversation_initiation_client_data"}));

        let pong: serde_json::Value = serde_json::from_str(
            &OutboundMessage::pong(Some(EventId::Number(42)))
                .to_json()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(pong, json!({"type": "pong", "event_id": 42}));

        let bare_pong: serde_json::Value =
            serde_json::from_str(&OutboundMessage::pong(None).to_json().unwrap()).unwrap();
        assert_eq!(bare_pong, json!({"type": "pong"}));

        let audio: serde_json::Value =
            serde_json::from_str(&OutboundMessage::audio("AAA=".into()).to_json().unwrap())
                .unwrap();
        assert_eq!(audio, json!({"user_audio_chunk": "AAA="}));
    }
}
