use crate::{audio, error::SessionError};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_ENDPOINT: &str = "wss://api.elevenlabs.io/v1/convai/conversation";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying the credential in [`AuthMode::Header`].
pub const API_KEY_HEADER: &str = "xi-api-key";

/// How the credential travels with the WebSocket upgrade request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// `xi-api-key` header; the agent id stays in the query string.
    #[default]
    Header,
    /// Both `agent_id` and `xi_api_key` as query parameters.
    QueryParam,
}

/// Everything a [`crate::ConversationSession`] needs to reach its agent.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub api_key: SecretString,
    pub agent_id: String,
    pub endpoint: String,
    pub auth_mode: AuthMode,
    /// Send `conversation_initiation_client_data` once the socket opens.
    pub send_initiation: bool,
    /// Rate of outbound user audio.
    pub input_sample_rate: u32,
    /// Rate assumed for headerless PCM received from the agent.
    pub output_sample_rate: u32,
    /// Samples per outbound audio frame.
    pub frame_samples: usize,
    pub connect_timeout: Option<Duration>,
    /// Treat the link as dead when no frame arrives for this long.
    pub inactivity_timeout: Option<Duration>,
}

impl SessionConfig {
    pub fn new(api_key: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            api_key: SecretString::from(api_key.into()),
            agent_id: agent_id.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            auth_mode: AuthMode::default(),
            send_initiation: true,
            input_sample_rate: audio::CONVAI_INPUT_SAMPLE_RATE,
            output_sample_rate: audio::CONVAI_OUTPUT_SAMPLE_RATE,
            frame_samples: audio::DEFAULT_FRAME_SAMPLES,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            inactivity_timeout: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_auth_mode(mut self, auth_mode: AuthMode) -> Self {
        self.auth_mode = auth_mode;
        self
    }

    pub fn with_initiation(mut self, send_initiation: bool) -> Self {
        self.send_initiation = send_initiation;
        self
    }

    pub fn with_output_sample_rate(mut self, rate: u32) -> Self {
        self.output_sample_rate = rate;
        self
    }

    pub fn with_frame_samples(mut self, frame_samples: usize) -> Self {
        self.frame_samples = frame_samples;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Checks the preconditions of `connect()`.
    ///
    /// Credential shapes that look unusual are only logged; the service is
    /// the authority on whether they are valid.
    pub fn validate(&self) -> Result<(), SessionError> {
        let key = self.api_key.expose_secret();
        if key.trim().is_empty() {
            return Err(SessionError::Configuration(
                "API key is required. Set ELEVENLABS_API_KEY.".to_string(),
            ));
        }
        if self.agent_id.trim().is_empty() {
            return Err(SessionError::Configuration(
                "Agent ID is required. Set ELEVENLABS_AGENT_ID.".to_string(),
            ));
        }
        if self.frame_samples == 0 {
            return Err(SessionError::Configuration(
                "frame_samples must be greater than zero".to_string(),
            ));
        }
        if self.output_sample_rate == 0 || self.input_sample_rate == 0 {
            return Err(SessionError::Configuration(
                "sample rates must be greater than zero".to_string(),
            ));
        }
        if !key.starts_with("sk_") {
            warn!("API key does not start with 'sk_'; it may be invalid");
        }
        if !self.agent_id.starts_with("agent_") {
            warn!(
                agent_id = %self.agent_id,
                "Agent ID does not start with 'agent_'; it may be invalid"
            );
        }
        Ok(())
    }

    /// Builds the upgrade request for the configured auth mode.
    ///
    /// Query values are percent-encoded.
    pub fn connect_request(&self) -> ConnectRequest {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        let agent_id = urlencoding::encode(&self.agent_id);
        match self.auth_mode {
            AuthMode::Header => ConnectRequest {
                url: format!("{}{}agent_id={}", self.endpoint, separator, agent_id),
                api_key_header: Some(self.api_key.clone()),
            },
            AuthMode::QueryParam => ConnectRequest {
                url: format!(
                    "{}{}agent_id={}&xi_api_key={}",
                    self.endpoint,
                    separator,
                    agent_id,
                    urlencoding::encode(self.api_key.expose_secret())
                ),
                api_key_header: None,
            },
        }
    }
}

/// A fully resolved WebSocket upgrade request.
#[derive(Clone)]
pub struct ConnectRequest {
    pub url: String,
    /// Value for the [`API_KEY_HEADER`] header, if the credential goes there.
    pub api_key_header: Option<SecretString>,
}

impl ConnectRequest {
    /// The URL with any credential query parameter masked.
    pub fn redacted_url(&self) -> String {
        match self.url.find("xi_api_key=") {
            Some(start) => {
                let value_start = start + "xi_api_key=".len();
                let value_end = self.url[value_start..]
                    .find('&')
                    .map(|i| value_start + i)
                    .unwrap_or(self.url.len());
                format!("{}***{}", &self.url[..value_start], &self.url[value_end..])
            }
            None => self.url.clone(),
        }
    }
}

impl std::fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("url", &self.redacted_url())
            .field("api_key_header", &self.api_key_header.is_some())
            .finish()
    }
}
