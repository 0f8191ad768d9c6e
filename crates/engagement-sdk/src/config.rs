use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::logging::{LogConfig, LogLevel};

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_millis(8000);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// SDK configuration shared by the pipeline's HTTP collaborators and the
/// sync coordinator.
#[derive(Debug, Clone)]
pub struct EngagementConfig {
    pub api_base: Url,
    pub access_token: Option<String>,
    /// Identifies this viewer session in impressions and sync-session setup.
    pub session_id: String,
    pub sync_interval: Duration,
    pub http_timeout: Duration,
    pub log: LogConfig,
}

impl EngagementConfig {
    pub fn new(api_base: impl AsRef<str>) -> Result<Self, ConfigError> {
        Ok(Self {
            api_base: parse_api_base(api_base.as_ref())?,
            access_token: None,
            session_id: Uuid::new_v4().to_string(),
            sync_interval: DEFAULT_SYNC_INTERVAL,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            log: LogConfig::default(),
        })
    }

    /// Load configuration from `ENGAGEMENT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_base = non_empty_var("ENGAGEMENT_API_BASE")
            .ok_or(ConfigError::Missing("ENGAGEMENT_API_BASE"))?;
        let mut config = Self::new(api_base)?;

        config.access_token = non_empty_var("ENGAGEMENT_ACCESS_TOKEN");
        if let Some(session_id) = non_empty_var("ENGAGEMENT_SESSION_ID") {
            config.session_id = session_id;
        }
        if let Some(ms) = millis_var("ENGAGEMENT_SYNC_INTERVAL_MS")? {
            config.sync_interval = ms;
        }
        if let Some(ms) = millis_var("ENGAGEMENT_HTTP_TIMEOUT_MS")? {
            config.http_timeout = ms;
        }
        if let Some(level) = non_empty_var("ENGAGEMENT_LOG_LEVEL") {
            config.log.level = level
                .parse::<LogLevel>()
                .map_err(|reason| ConfigError::Invalid {
                    key: "ENGAGEMENT_LOG_LEVEL",
                    reason,
                })?;
        }
        config.log.file = non_empty_var("ENGAGEMENT_LOG_FILE").map(PathBuf::from);
        Ok(config)
    }

    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token;
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, ConfigError> {
        self.api_base
            .join(path)
            .map_err(|err| ConfigError::Invalid {
                key: "ENGAGEMENT_API_BASE",
                reason: format!("cannot join {path}: {err}"),
            })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn millis_var(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    non_empty_var(key)
        .map(|raw| {
            raw.parse::<u64>()
                .ok()
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .ok_or_else(|| ConfigError::Invalid {
                    key,
                    reason: format!("expected a positive number of milliseconds, got {raw}"),
                })
        })
        .transpose()
}

fn parse_api_base(raw: &str) -> Result<Url, ConfigError> {
    let mut base = raw.trim().to_string();
    if base.is_empty() {
        return Err(ConfigError::Missing("ENGAGEMENT_API_BASE"));
    }
    if !base.contains("://") {
        base = format!("{}{base}", infer_scheme(&base));
    }
    // Keep a trailing slash so `Url::join` appends instead of replacing the last segment.
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base).map_err(|err| ConfigError::Invalid {
        key: "ENGAGEMENT_API_BASE",
        reason: err.to_string(),
    })
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base);
    let host = host_part.to_ascii_lowercase();
    let private_172 = host
        .strip_prefix("172.")
        .and_then(|rest| rest.split('.').next())
        .and_then(|octet| octet.parse::<u8>().ok())
        .map(|octet| (16..32).contains(&octet))
        .unwrap_or(false);
    if host.starts_with("localhost")
        || host.starts_with("127.")
        || host.starts_with("10.")
        || host.starts_with("192.168.")
        || host == "0.0.0.0"
        || host == "::1"
        || private_172
    {
        "http://"
    } else {
        "https://"
    }
}
