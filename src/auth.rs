//! Authorization handshake: exchanges a role identifier for a short-lived
//! access token and the channel id scoping all signaling envelopes.

use crate::config::RealtimeConfig;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorization rejected: {0}")]
    Rejected(String),
    #[error("authorization transport failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("authorization config error: {0}")]
    Config(String),
}

/// Bearer token plus the channel id it is scoped to. Created once per
/// connect cycle and never refreshed mid-session.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub role: String,
    pub channel: String,
}

#[derive(Debug, Deserialize)]
struct TokenEnvelope {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    data: Option<TokenData>,
}

#[derive(Debug, Deserialize)]
struct TokenData {
    access_token: String,
    role: String,
    channel: String,
}

/// Stateless client for the authorization endpoint. Retry policy belongs
/// to the caller.
#[derive(Debug, Clone)]
pub struct AuthorizationClient {
    client: Client,
    endpoint: Url,
}

impl AuthorizationClient {
    pub fn new(config: &RealtimeConfig) -> Result<Self, AuthError> {
        let endpoint = config
            .auth_endpoint()
            .map_err(|err| AuthError::Config(err.to_string()))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| AuthError::Config(err.to_string()))?;
        Ok(Self { client, endpoint })
    }

    /// One outbound call; a non-success status or a non-zero payload code
    /// are both logical rejections even on HTTP 200.
    pub async fn fetch_token(&self, role: &str) -> Result<AccessToken, AuthError> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[("role", role)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Rejected(format!(
                "authorization endpoint returned {status}"
            )));
        }

        let envelope: TokenEnvelope = response.json().await?;
        if envelope.code != 0 {
            let detail = envelope
                .message
                .unwrap_or_else(|| format!("status code {}", envelope.code));
            return Err(AuthError::Rejected(detail));
        }
        let data = envelope
            .data
            .ok_or_else(|| AuthError::Rejected("token payload missing".into()))?;

        tracing::debug!(
            target: "auth",
            role = %data.role,
            channel = %data.channel,
            "access token issued"
        );
        Ok(AccessToken {
            token: data.access_token,
            role: data.role,
            channel: data.channel,
        })
    }
}
