use convai::{AuthMode, SessionConfig, config::DEFAULT_ENDPOINT};
use secrecy::{ExposeSecret, SecretString};
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

pub const DEFAULT_API_URL: &str = "https://api.elevenlabs.io";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
///
/// Credentials are optional here; a session without them fails on connect.
#[derive(Clone, Debug)]
pub struct Config {
    pub api_key: Option<SecretString>,
    pub agent_id: Option<String>,
    pub ws_url: String,
    pub api_url: String,
    pub auth_mode: AuthMode,
    pub output_sample_rate: u32,
    pub connect_timeout: Option<Duration>,
    pub inactivity_timeout: Option<Duration>,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub max_conversation: Duration,
    pub log_level: Level,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        None => Ok(default),
    }
}

/// Seconds, where `0` disables the timeout.
fn parse_timeout(name: &str, default: Option<u64>) -> Result<Option<Duration>, ConfigError> {
    let secs = match var(name) {
        Some(_) => Some(parse_var::<u64>(name, 0)?),
        None => default,
    };
    Ok(secs.filter(|&s| s > 0).map(Duration::from_secs))
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let api_key = var("ELEVENLABS_API_KEY").map(SecretString::from);
        let agent_id = var("ELEVENLABS_AGENT_ID");
        let ws_url = var("ELEVENLABS_WS_URL").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let api_url = var("ELEVENLABS_API_URL")
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let auth_mode = match var("ELEVENLABS_AUTH_MODE")
            .unwrap_or_else(|| "header".to_string())
            .to_lowercase()
            .as_str()
        {
            "header" => AuthMode::Header,
            "query" => AuthMode::QueryParam,
            other => {
                return Err(ConfigError::InvalidValue(
                    "ELEVENLABS_AUTH_MODE".to_string(),
                    format!("'{other}' is not one of 'header', 'query'"),
                ));
            }
        };

        let output_sample_rate = parse_var(
            "ELEVENLABS_OUTPUT_SAMPLE_RATE",
            convai::audio::CONVAI_OUTPUT_SAMPLE_RATE,
        )?;
        if output_sample_rate == 0 {
            return Err(ConfigError::InvalidValue(
                "ELEVENLABS_OUTPUT_SAMPLE_RATE".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let connect_timeout = parse_timeout("CONNECT_TIMEOUT_SECS", Some(10))?;
        let inactivity_timeout = parse_timeout("INACTIVITY_TIMEOUT_SECS", None)?;
        let reconnect_interval =
            Duration::from_millis(parse_var("RECONNECT_INTERVAL_MS", 5000u64)?);
        let max_reconnect_attempts = parse_var("MAX_RECONNECT_ATTEMPTS", 5u32)?;
        let max_conversation = Duration::from_secs(parse_var("MAX_CONVERSATION_SECS", 300u64)?);

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            api_key,
            agent_id,
            ws_url,
            api_url,
            auth_mode,
            output_sample_rate,
            connect_timeout,
            inactivity_timeout,
            reconnect_interval,
            max_reconnect_attempts,
            max_conversation,
            log_level,
        })
    }

    pub fn require_api_key(&self) -> Result<&SecretString, ConfigError> {
        self.api_key
            .as_ref()
            .ok_or_else(|| ConfigError::MissingVar("ELEVENLABS_API_KEY".to_string()))
    }

    /// Session settings for this environment. Missing credentials stay empty.
    pub fn session_config(&self) -> SessionConfig {
        let api_key = self
            .api_key
            .as_ref()
            .map(|key| key.expose_secret().to_string())
            .unwrap_or_default();
        SessionConfig::new(api_key, self.agent_id.clone().unwrap_or_default())
            .with_endpoint(self.ws_url.clone())
            .with_auth_mode(self.auth_mode)
            .with_output_sample_rate(self.output_sample_rate)
            .with_connect_timeout(self.connect_timeout)
            .with_inactivity_timeout(self.inactivity_timeout)
    }
}
