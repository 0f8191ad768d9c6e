use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

/// Content-addressable byte store keyed by URL.
#[async_trait]
pub trait ContentCache: Send + Sync {
    fn has(&self, key: &str) -> bool;

    async fn get(&self, key: &str) -> Option<Bytes>;

    async fn set(&self, key: &str, value: Bytes);
}

/// In-memory adapter for tests and early wiring.
#[derive(Debug, Default)]
pub struct InMemoryContentCache {
    entries: RwLock<HashMap<String, Bytes>>,
}

impl InMemoryContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl ContentCache for InMemoryContentCache {
    fn has(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    async fn get(&self, key: &str) -> Option<Bytes> {
        self.entries.read().get(key).cloned()
    }

    async fn set(&self, key: &str, value: Bytes) {
        self.entries.write().insert(key.to_string(), value);
    }
}
