//! Error taxonomy for the session and its collaborators.

/// Errors returned from the public session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Credentials or agent id missing; raised before any network action.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Recording or sending attempted without an open connection.
    #[error("Not connected to the conversational service. Please connect first.")]
    NotConnected,
    /// The socket could not be opened, or it failed while opening.
    #[error("Connection error: {0}")]
    Connection(String),
    /// The microphone could not be opened.
    #[error("Failed to start recording: {0}")]
    Capture(#[from] CaptureError),
}

/// Failures of the WebSocket transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid connection request: {0}")]
    Request(String),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Transport closed")]
    Closed,
}

/// Failures to acquire or run the capture device.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CaptureError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("no capture device available: {0}")]
    DeviceUnavailable(String),
    #[error("unsupported capture constraints: {0}")]
    Unsupported(String),
    #[error("capture device failed: {0}")]
    Device(String),
}

/// Failures to decode or play a queued clip. Always non-fatal.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlaybackError {
    #[error("failed to decode audio chunk: {0}")]
    Decode(String),
    #[error("audio output failed: {0}")]
    Output(String),
}
