//! Maps inbound protocol messages onto session state.
//!
//! `dispatch` is pure: it mutates the snapshot it is given and reports any
//! side effect for the caller to perform.

use crate::state::{AgentMode, Diagnostic, SessionState};
use convai_types::{InboundMessage, OutboundMessage};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Effect {
    /// Send this message back immediately.
    Reply(OutboundMessage),
    /// Decode this base64 payload and queue it for playback.
    Enqueue(String),
    /// Publish a non-fatal event.
    Notify(Diagnostic),
}

pub(crate) fn dispatch(state: &mut SessionState, message: InboundMessage) -> Option<Effect> {
    match message {
        InboundMessage::ConversationInitiationMetadata {
            conversation_initiation_metadata_event: event,
        } => {
            info!(conversation_id = ?event.conversation_id, "Conversation started");
            state.conversation_id = event.conversation_id;
            None
        }
        InboundMessage::UserTranscript {
            user_transcription_event: event,
        } => {
            debug!(transcript = %event.user_transcript, "User transcript");
            state.last_user_transcript = event.user_transcript;
            None
        }
        InboundMessage::AgentResponse {
            agent_response_event: event,
        } => {
            debug!(response = %event.agent_response, "Agent response");
            state.last_agent_utterance = event.agent_response;
            state.agent_mode = AgentMode::Speaking;
            None
        }
        InboundMessage::AgentResponseCorrection {
            agent_response_correction_event: event,
        } => {
            debug!(corrected = %event.corrected_response, "Agent response correction");
            state.last_agent_utterance = event.corrected_response;
            None
        }
        InboundMessage::Audio { audio_event } => audio_event
            .audio_base_64
            .filter(|payload| !payload.is_empty())
            .map(Effect::Enqueue),
        InboundMessage::Ping { ping_event } => {
            Some(Effect::Reply(OutboundMessage::pong(ping_event.event_id)))
        }
        InboundMessage::Interruption { interruption_event } => {
            info!(reason = ?interruption_event.reason, "Conversation interrupted");
            state.agent_mode = AgentMode::Listening;
            Some(Effect::Notify(Diagnostic::Interrupted {
                reason: interruption_event.reason,
            }))
        }
        error @ InboundMessage::Error { .. } => {
            let message = error.error_description().unwrap_or_default();
            warn!(%message, "Server reported an error");
            state.last_error = Some(message.clone());
            Some(Effect::Notify(Diagnostic::Server { message }))
        }
        InboundMessage::Unknown => None,
    }
}
