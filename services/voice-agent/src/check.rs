//! Credential and connectivity checks run by `voice-agent check`.

use convai::config::{API_KEY_HEADER, DEFAULT_CONNECT_TIMEOUT};
use convai::transport::{CloseInfo, Connector, Frame};
use convai::SessionConfig;
use futures_util::SinkExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("API test failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API key invalid: {0}")]
    Rejected(reqwest::StatusCode),
    #[error("WebSocket test failed: {0}")]
    WebSocket(String),
}

/// The parts of `GET /v1/user` worth reporting.
#[derive(Debug, Deserialize, Default)]
pub struct UserInfo {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub subscription: Option<Subscription>,
}

#[derive(Debug, Deserialize, Default)]
pub struct Subscription {
    #[serde(default)]
    pub tier: Option<String>,
}

/// Verifies the API key against the REST API.
pub async fn check_api_key(
    client: &reqwest::Client,
    api_url: &str,
    api_key: &SecretString,
) -> Result<UserInfo, CheckError> {
    let url = format!("{}/v1/user", api_url.trim_end_matches('/'));
    info!(%url, "Testing API credentials");
    let response = client
        .get(&url)
        .header(API_KEY_HEADER, api_key.expose_secret())
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        warn!(%status, "API key rejected");
        return Err(CheckError::Rejected(status));
    }
    let user = response.json::<UserInfo>().await?;
    info!(
        user = user.first_name.as_deref().unwrap_or("Unknown"),
        "API key valid"
    );
    Ok(user)
}

/// Opens the conversation socket once and closes it again.
pub async fn check_websocket(
    connector: &dyn Connector,
    session: &SessionConfig,
) -> Result<(), CheckError> {
    session
        .validate()
        .map_err(|e| CheckError::WebSocket(e.to_string()))?;
    let limit = session.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
    let request = session.connect_request();
    info!(url = %request.redacted_url(), "Testing WebSocket connection");

    let link = tokio::time::timeout(limit, connector.connect(request))
        .await
        .map_err(|_| {
            CheckError::WebSocket(format!(
                "connection timeout ({} seconds)",
                limit.as_secs()
            ))
        })?
        .map_err(|e| CheckError::WebSocket(e.to_string()))?;

    let mut sink = link.sink;
    if let Err(e) = sink.send(Frame::Close(Some(CloseInfo::normal()))).await {
        warn!(error = %e, "Failed to close test connection cleanly");
    }
    info!("WebSocket connection successful");
    Ok(())
}
