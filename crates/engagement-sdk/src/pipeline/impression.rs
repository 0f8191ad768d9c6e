use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::WidgetProxyInput;
use crate::event::{DiscardReason, WidgetProxyPublishData};

#[derive(Debug, Error)]
pub enum ImpressionError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(reqwest::StatusCode),
}

#[async_trait]
pub trait ImpressionClient: Send + Sync {
    async fn send_impression(&self, impression_url: &str, session_id: &str) -> Result<(), ImpressionError>;
}

/// Fires an impression beacon for every published widget that carries an
/// impression URL, then forwards without waiting for it.
///
/// Beacons live in a `JoinSet` owned by the proxy; dropping the proxy aborts
/// whatever is still in flight.
pub struct ImpressionProxy {
    downstream: Arc<dyn WidgetProxyInput>,
    client: Arc<dyn ImpressionClient>,
    session_id: String,
    runtime: Handle,
    beacons: Mutex<JoinSet<()>>,
}

impl ImpressionProxy {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        downstream: Arc<dyn WidgetProxyInput>,
        client: Arc<dyn ImpressionClient>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            downstream,
            client,
            session_id: session_id.into(),
            runtime: Handle::current(),
            beacons: Mutex::new(JoinSet::new()),
        }
    }

    /// Beacons spawned but not yet reaped.
    pub fn in_flight(&self) -> usize {
        let mut beacons = self.beacons.lock();
        reap(&mut beacons);
        beacons.len()
    }

    fn fire(&self, widget_id: String, impression_url: String) {
        let client = Arc::clone(&self.client);
        let session_id = self.session_id.clone();
        let mut beacons = self.beacons.lock();
        reap(&mut beacons);
        beacons.spawn_on(
            async move {
                match client.send_impression(&impression_url, &session_id).await {
                    Ok(()) => debug!(target: "widgets.impression", widget_id = %widget_id, "impression recorded"),
                    Err(err) => warn!(
                        target: "widgets.impression",
                        widget_id = %widget_id,
                        url = %impression_url,
                        error = %err,
                        "impression beacon failed"
                    ),
                }
            },
            &self.runtime,
        );
    }
}

fn reap(beacons: &mut JoinSet<()>) {
    while let Some(result) = beacons.try_join_next() {
        if let Err(err) = result {
            if err.is_panic() {
                warn!(target: "widgets.impression", error = %err, "impression task panicked");
            }
        }
    }
}

impl WidgetProxyInput for ImpressionProxy {
    fn publish(&self, data: WidgetProxyPublishData) {
        if let Some(url) = data.event.payload().impression_url.clone() {
            self.fire(data.event.id().to_string(), url);
        }
        self.downstream.publish(data);
    }

    fn discard(&self, data: WidgetProxyPublishData, reason: DiscardReason) {
        self.downstream.discard(data, reason);
    }
}
