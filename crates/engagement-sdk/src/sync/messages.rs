use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::time::pdt_format;

/// Everything exchanged on a sync channel, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum SyncMessage {
    SyncSessionStatus(SyncSessionStatus),
    SyncSessionUpdate(SyncSessionUpdate),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncSessionStatus {
    /// Sent by the operator console; carries the key the viewer must publish with.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        publish_key: Option<String>,
    },
    /// Handshake reply from the viewer.
    Pong,
    /// Operator confirmation; the viewer starts publishing updates.
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSessionUpdate {
    #[serde(with = "pdt_format")]
    pub program_date_time: DateTime<Utc>,
}

impl SyncMessage {
    pub fn ping(publish_key: impl Into<String>) -> Self {
        SyncMessage::SyncSessionStatus(SyncSessionStatus::Ping {
            publish_key: Some(publish_key.into()),
        })
    }

    pub fn pong() -> Self {
        SyncMessage::SyncSessionStatus(SyncSessionStatus::Pong)
    }

    pub fn connected() -> Self {
        SyncMessage::SyncSessionStatus(SyncSessionStatus::Connected)
    }

    pub fn update(program_date_time: DateTime<Utc>) -> Self {
        SyncMessage::SyncSessionUpdate(SyncSessionUpdate { program_date_time })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}
