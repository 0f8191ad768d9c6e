//! reqwest-backed implementations of the pipeline and sync collaborators.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tracing::trace;

use crate::config::{ConfigError, EngagementConfig};
use crate::pipeline::{FetchError, ImageFetcher, ImpressionClient, ImpressionError};
use crate::sync::ReqwestSessionSetup;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum HttpClientError {
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// One shared connection pool for every HTTP collaborator.
#[derive(Clone)]
pub struct HttpClients {
    client: reqwest::Client,
    config: EngagementConfig,
}

impl HttpClients {
    pub fn new(config: &EngagementConfig) -> Result<Self, HttpClientError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.http_timeout)
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    pub fn image_fetcher(&self) -> HttpImageFetcher {
        HttpImageFetcher {
            client: self.client.clone(),
        }
    }

    pub fn impression_client(&self) -> HttpImpressionClient {
        HttpImpressionClient {
            client: self.client.clone(),
            access_token: self.config.access_token.clone(),
        }
    }

    pub fn session_setup(&self) -> Result<ReqwestSessionSetup, HttpClientError> {
        Ok(ReqwestSessionSetup::new(self.client.clone(), &self.config)?)
    }
}

pub struct HttpImageFetcher {
    client: reqwest::Client,
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        trace!(target: "widgets.images", url, "fetching image");
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status()));
        }
        Ok(response.bytes().await?)
    }
}

#[derive(Serialize)]
struct ImpressionRequest<'a> {
    session_id: &'a str,
}

pub struct HttpImpressionClient {
    client: reqwest::Client,
    access_token: Option<String>,
}

#[async_trait]
impl ImpressionClient for HttpImpressionClient {
    async fn send_impression(&self, impression_url: &str, session_id: &str) -> Result<(), ImpressionError> {
        let mut builder = self
            .client
            .post(impression_url)
            .json(&ImpressionRequest { session_id });
        if let Some(token) = &self.access_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(ImpressionError::HttpStatus(response.status()));
        }
        Ok(())
    }
}
