//! Client for a realtime conversational voice agent.
//!
//! A [`ConversationSession`] keeps one WebSocket to the agent, streams
//! microphone audio to it as base64 PCM frames, plays the agent's audio
//! replies strictly in arrival order and exposes transcripts and status as an
//! observable [`SessionState`].
//!
//! Devices and the socket sit behind the [`AudioCapture`], [`AudioSink`] and
//! [`Connector`] traits.

pub mod audio;
pub mod capture;
pub mod config;
mod dispatch;
pub mod error;
pub mod playback;
pub mod session;
pub mod state;
pub mod transport;

pub use capture::{AudioCapture, CaptureConstraints, CaptureGuard, CaptureStream};
pub use config::{AuthMode, ConnectRequest, SessionConfig};
pub use convai_types;
pub use error::{CaptureError, PlaybackError, SessionError, TransportError};
pub use playback::AudioSink;
pub use session::ConversationSession;
pub use state::{AgentMode, ConnectionState, Diagnostic, RecordingState, SessionState};
pub use transport::{Connector, Frame, Link, WsConnector};
