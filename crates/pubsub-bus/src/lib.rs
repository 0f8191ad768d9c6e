//! Channel-oriented pub/sub contract shared by the engagement SDK.
//!
//! The real substrate is supplied by the host application; [`LocalBus`] is an
//! in-memory stand-in with the same ordering guarantees (per-channel FIFO).

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("no subscribers on channel {0}")]
    NoSubscribers(String),
    #[error("publish rejected: {0}")]
    Rejected(String),
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

#[async_trait]
pub trait PubSubClient: Send + Sync {
    /// Starts observing `channel`. Messages published after this call are
    /// delivered in publish order.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusMessage>;

    fn unsubscribe(&self, channel: &str);

    /// Installs the rotating credential used for subsequent publishes.
    /// Resolves once the substrate has accepted the key.
    async fn set_publish_key(&self, key: &str) -> BusResult<()>;

    async fn publish(&self, channel: &str, payload: Bytes) -> BusResult<()>;
}

#[derive(Debug, Default)]
struct ChannelEntry {
    sender: Option<broadcast::Sender<BusMessage>>,
    subscriptions: usize,
}

/// Simple in-memory bus for tests and non-transport contexts.
#[derive(Debug, Default)]
pub struct LocalBus {
    channels: RwLock<HashMap<String, ChannelEntry>>,
    publish_keys: Mutex<Vec<String>>,
    rejected_key: Mutex<Option<String>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<BusMessage> {
        let mut guard = self.channels.write();
        let entry = guard.entry(channel.to_string()).or_default();
        entry
            .sender
            .get_or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// The key most recently accepted by [`PubSubClient::set_publish_key`].
    pub fn publish_key(&self) -> Option<String> {
        self.publish_keys.lock().last().cloned()
    }

    /// Every key accepted so far, oldest first.
    pub fn publish_key_history(&self) -> Vec<String> {
        self.publish_keys.lock().clone()
    }

    /// Number of live `subscribe` calls not yet matched by `unsubscribe`.
    pub fn subscription_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .get(channel)
            .map(|entry| entry.subscriptions)
            .unwrap_or(0)
    }

    /// Makes `set_publish_key` fail for the given key.
    pub fn reject_publish_key(&self, key: impl Into<String>) {
        *self.rejected_key.lock() = Some(key.into());
    }
}

#[async_trait]
impl PubSubClient for LocalBus {
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusMessage> {
        let receiver = self.sender_for(channel).subscribe();
        if let Some(entry) = self.channels.write().get_mut(channel) {
            entry.subscriptions += 1;
        }
        receiver
    }

    fn unsubscribe(&self, channel: &str) {
        let mut guard = self.channels.write();
        if let Some(entry) = guard.get_mut(channel) {
            entry.subscriptions = entry.subscriptions.saturating_sub(1);
        }
    }

    async fn set_publish_key(&self, key: &str) -> BusResult<()> {
        if self.rejected_key.lock().as_deref() == Some(key) {
            return Err(BusError::Rejected(format!("publish key {key} refused")));
        }
        self.publish_keys.lock().push(key.to_string());
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> BusResult<()> {
        let sender = self.sender_for(channel);
        sender
            .send(BusMessage {
                channel: channel.to_string(),
                payload,
            })
            .map(|_| ())
            .map_err(|_| BusError::NoSubscribers(channel.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_delivers_in_publish_order() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("sync.abc");
        bus.publish("sync.abc", Bytes::from_static(b"one"))
            .await
            .expect("publish ok");
        bus.publish("sync.abc", Bytes::from_static(b"two"))
            .await
            .expect("publish ok");
        let first = sub.recv().await.expect("receive ok");
        let second = sub.recv().await.expect("receive ok");
        assert_eq!(first.channel, "sync.abc");
        assert_eq!(first.payload, Bytes::from_static(b"one"));
        assert_eq!(second.payload, Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_reports_channel() {
        let bus = LocalBus::new();
        let err = bus
            .publish("nobody", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoSubscribers(ref c) if c == "nobody"));
    }

    #[tokio::test]
    async fn tracks_subscriptions_and_keys() {
        let bus = LocalBus::new();
        let _a = bus.subscribe("chan");
        let _b = bus.subscribe("chan");
        bus.unsubscribe("chan");
        assert_eq!(bus.subscription_count("chan"), 1);
        bus.unsubscribe("chan");
        bus.unsubscribe("chan");
        assert_eq!(bus.subscription_count("chan"), 0);

        bus.set_publish_key("k1").await.expect("key accepted");
        bus.reject_publish_key("bad");
        assert!(bus.set_publish_key("bad").await.is_err());
        bus.set_publish_key("k2").await.expect("key accepted");
        assert_eq!(bus.publish_key().as_deref(), Some("k2"));
        assert_eq!(bus.publish_key_history(), vec!["k1", "k2"]);
    }
}
