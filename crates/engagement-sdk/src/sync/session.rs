use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::SyncError;
use crate::config::{ConfigError, EngagementConfig};

const SYNC_SESSIONS_PATH: &str = "sync-sessions";

/// A PDT sync session created by the backend for one viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSession {
    /// Shown to the viewer and typed into the operator console.
    pub pin: String,
    pub sync_channel: String,
    /// How long the operator has to connect.
    pub connect_timeout: Duration,
}

#[async_trait]
pub trait SessionSetup: Send + Sync {
    async fn create_session(&self, session_id: &str) -> Result<SyncSession, SyncError>;
}

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    session_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    pin: String,
    sync_channel: String,
    /// Seconds.
    connect_timeout: f64,
}

impl TryFrom<CreateSessionResponse> for SyncSession {
    type Error = SyncError;

    fn try_from(response: CreateSessionResponse) -> Result<Self, Self::Error> {
        if response.pin.trim().is_empty() {
            return Err(SyncError::InvalidResponse("empty pin".into()));
        }
        if response.sync_channel.trim().is_empty() {
            return Err(SyncError::InvalidChannel);
        }
        let connect_timeout = Duration::try_from_secs_f64(response.connect_timeout).map_err(|err| {
            SyncError::InvalidResponse(format!("connect_timeout {}: {err}", response.connect_timeout))
        })?;
        Ok(SyncSession {
            pin: response.pin,
            sync_channel: response.sync_channel,
            connect_timeout,
        })
    }
}

/// Creates sync sessions through the engagement REST API.
pub struct ReqwestSessionSetup {
    client: reqwest::Client,
    endpoint: Url,
    access_token: Option<String>,
}

impl ReqwestSessionSetup {
    pub fn new(client: reqwest::Client, config: &EngagementConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client,
            endpoint: config.endpoint(SYNC_SESSIONS_PATH)?,
            access_token: config.access_token.clone(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl SessionSetup for ReqwestSessionSetup {
    async fn create_session(&self, session_id: &str) -> Result<SyncSession, SyncError> {
        debug!(target: "pdt.session", endpoint = %self.endpoint, session_id, "creating sync session");
        let mut builder = self.client.post(self.endpoint.clone());
        if let Some(token) = &self.access_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.json(&CreateSessionRequest { session_id }).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(target: "pdt.session", status = status.as_u16(), "sync session request rejected");
            return Err(SyncError::HttpStatus(status.as_u16()));
        }
        let payload = response
            .json::<CreateSessionResponse>()
            .await
            .map_err(|err| SyncError::InvalidResponse(err.to_string()))?;
        SyncSession::try_from(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(pin: &str, channel: &str, timeout: f64) -> CreateSessionResponse {
        CreateSessionResponse {
            pin: pin.into(),
            sync_channel: channel.into(),
            connect_timeout: timeout,
        }
    }

    #[test]
    fn converts_seconds_to_duration() {
        let session = SyncSession::try_from(response("4821", "sync.abc", 120.0)).unwrap();
        assert_eq!(session.pin, "4821");
        assert_eq!(session.sync_channel, "sync.abc");
        assert_eq!(session.connect_timeout, Duration::from_secs(120));
    }

    #[test]
    fn rejects_unusable_responses() {
        assert_eq!(
            SyncSession::try_from(response("4821", " ", 120.0)).unwrap_err(),
            SyncError::InvalidChannel
        );
        assert!(matches!(
            SyncSession::try_from(response("", "sync.abc", 120.0)),
            Err(SyncError::InvalidResponse(_))
        ));
        assert!(matches!(
            SyncSession::try_from(response("4821", "sync.abc", -1.0)),
            Err(SyncError::InvalidResponse(_))
        ));
    }

    #[test]
    fn endpoint_is_joined_onto_api_base() {
        let config = EngagementConfig::new("https://api.example.com/v1").unwrap();
        let setup = ReqwestSessionSetup::new(reqwest::Client::new(), &config).unwrap();
        assert_eq!(setup.endpoint().as_str(), "https://api.example.com/v1/sync-sessions");
    }
}
