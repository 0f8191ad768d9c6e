use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::WidgetProxyInput;
use crate::cache::ContentCache;
use crate::event::{DiscardReason, WidgetProxyPublishData};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(reqwest::StatusCode),
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

enum Job {
    Publish(WidgetProxyPublishData),
    Discard(WidgetProxyPublishData, DiscardReason),
}

/// Prefetches the images of created widgets into the content cache before
/// passing them on, so the gate only ever holds renderable widgets.
///
/// Events leave in arrival order. An event without images overtakes nothing:
/// it is forwarded synchronously only when no earlier event is still in the
/// worker.
pub struct ImageDownloadProxy {
    downstream: Arc<dyn WidgetProxyInput>,
    jobs: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
    worker: JoinHandle<()>,
}

impl ImageDownloadProxy {
    pub fn new(
        downstream: Arc<dyn WidgetProxyInput>,
        cache: Arc<dyn ContentCache>,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(run_worker(
            rx,
            Arc::clone(&downstream),
            cache,
            fetcher,
            Arc::clone(&pending),
        ));
        Self {
            downstream,
            jobs,
            pending,
            worker,
        }
    }

    fn submit(&self, job: Job) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(job)) = self.jobs.send(job) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!(target: "widgets.images", "image worker stopped; forwarding without prefetch");
            match job {
                Job::Publish(data) => self.downstream.publish(data),
                Job::Discard(data, reason) => self.downstream.discard(data, reason),
            }
        }
    }

    fn idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }
}

impl WidgetProxyInput for ImageDownloadProxy {
    fn publish(&self, data: WidgetProxyPublishData) {
        if data.event.image_urls().is_empty() && self.idle() {
            self.downstream.publish(data);
        } else {
            self.submit(Job::Publish(data));
        }
    }

    fn discard(&self, data: WidgetProxyPublishData, reason: DiscardReason) {
        if self.idle() {
            self.downstream.discard(data, reason);
        } else {
            self.submit(Job::Discard(data, reason));
        }
    }
}

impl Drop for ImageDownloadProxy {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker(
    mut jobs: mpsc::UnboundedReceiver<Job>,
    downstream: Arc<dyn WidgetProxyInput>,
    cache: Arc<dyn ContentCache>,
    fetcher: Arc<dyn ImageFetcher>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            Job::Publish(data) => {
                prefetch(cache.as_ref(), fetcher.as_ref(), &data).await;
                downstream.publish(data);
            }
            Job::Discard(data, reason) => downstream.discard(data, reason),
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Downloads every image not already cached, concurrently, and waits for all
/// of them to settle. Failures are logged; the display layer refetches
/// anything still missing.
async fn prefetch(cache: &dyn ContentCache, fetcher: &dyn ImageFetcher, data: &WidgetProxyPublishData) {
    let missing: Vec<String> = data
        .event
        .image_urls()
        .into_iter()
        .filter(|url| !cache.has(url))
        .collect();
    if missing.is_empty() {
        return;
    }

    let widget_id = data.event.id();
    debug!(target: "widgets.images", widget_id, count = missing.len(), "prefetching widget images");
    join_all(missing.iter().map(|url| async move {
        match fetcher.fetch(url).await {
            Ok(bytes) => cache.set(url, bytes).await,
            Err(err) => warn!(
                target: "widgets.images",
                widget_id,
                url = %url,
                error = %err,
                "image prefetch failed"
            ),
        }
    }))
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryContentCache;
    use crate::pipeline::testing::{created, with_images, Delivery, RecordingInput};
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct ScriptedFetcher {
        calls: Mutex<Vec<String>>,
        failing: Vec<String>,
        hold: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl ImageFetcher for ScriptedFetcher {
        async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
            self.calls.lock().push(url.to_string());
            if let Some(hold) = &self.hold {
                hold.notified().await;
            }
            if self.failing.iter().any(|u| u == url) {
                return Err(FetchError::HttpStatus(reqwest::StatusCode::NOT_FOUND));
            }
            Ok(Bytes::from(format!("bytes:{url}")))
        }
    }

    #[tokio::test]
    async fn downloads_only_uncached_images_then_forwards_unchanged() {
        let cache = Arc::new(InMemoryContentCache::new());
        cache.set("img/cached", Bytes::from_static(b"old")).await;
        let fetcher = Arc::new(ScriptedFetcher::default());
        let sink = RecordingInput::new();
        let proxy = ImageDownloadProxy::new(sink.clone(), cache.clone(), fetcher.clone());

        let input = with_images("w1", &["img/a", "img/cached", "img/b"]);
        proxy.publish(input.clone());

        let deliveries = sink.wait_for(1).await;
        assert_eq!(deliveries, vec![Delivery::Published(input)]);
        let mut calls = fetcher.calls.lock().clone();
        calls.sort();
        assert_eq!(calls, vec!["img/a", "img/b"]);
        assert_eq!(cache.get("img/a").await, Some(Bytes::from("bytes:img/a")));
        assert_eq!(cache.get("img/cached").await, Some(Bytes::from_static(b"old")));
    }

    #[tokio::test]
    async fn failed_downloads_do_not_block_forwarding() {
        let cache = Arc::new(InMemoryContentCache::new());
        let fetcher = Arc::new(ScriptedFetcher {
            failing: vec!["img/broken".into()],
            ..Default::default()
        });
        let sink = RecordingInput::new();
        let proxy = ImageDownloadProxy::new(sink.clone(), cache.clone(), fetcher);

        proxy.publish(with_images("w1", &["img/broken", "img/ok"]));

        assert_eq!(sink.wait_for(1).await.len(), 1);
        assert!(cache.has("img/ok"));
        assert!(!cache.has("img/broken"));
    }

    #[tokio::test]
    async fn events_without_images_pass_through_synchronously() {
        let sink = RecordingInput::new();
        let proxy = ImageDownloadProxy::new(
            sink.clone(),
            Arc::new(InMemoryContentCache::new()),
            Arc::new(ScriptedFetcher::default()),
        );
        proxy.publish(created("w1"));
        assert_eq!(sink.published_ids(), vec!["w1"]);
    }

    #[tokio::test]
    async fn later_events_wait_for_earlier_downloads() {
        let hold = Arc::new(Notify::new());
        let fetcher = Arc::new(ScriptedFetcher {
            hold: Some(hold.clone()),
            ..Default::default()
        });
        let sink = RecordingInput::new();
        let proxy = ImageDownloadProxy::new(sink.clone(), Arc::new(InMemoryContentCache::new()), fetcher.clone());

        proxy.publish(with_images("slow", &["img/slow"]));
        proxy.publish(created("fast"));
        proxy.discard(created("dropped"), DiscardReason::NoVote);

        tokio::task::yield_now().await;
        assert!(sink.deliveries().is_empty());

        // Release the held download once the worker is parked on it.
        while fetcher.calls.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        hold.notify_waiters();

        let deliveries = sink.wait_for(3).await;
        let ids: Vec<&str> = deliveries.iter().map(Delivery::id).collect();
        assert_eq!(ids, vec!["slow", "fast", "dropped"]);
        assert!(matches!(deliveries[2], Delivery::Discarded(_, DiscardReason::NoVote)));
    }
}
