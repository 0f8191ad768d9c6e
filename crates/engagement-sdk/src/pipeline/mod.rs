//! The widget event pipeline: an ordered chain of stages between the backend
//! event source and the display layer.
//!
//! Every stage receives events through [`WidgetProxyInput`] and hands each one
//! to its downstream exactly once, either as `publish` or as `discard`.

pub mod image_download;
pub mod impression;
pub mod logger;
pub mod no_vote_discard;
pub mod store_widget;

use std::sync::Arc;

use tracing::debug;

use crate::cache::ContentCache;
use crate::event::{ClientEvent, DiscardReason, WidgetProxyPublishData};
use crate::time::PlayerTimeSource;
use crate::votes::VoteRepository;

pub use image_download::{FetchError, ImageDownloadProxy, ImageFetcher};
pub use impression::{ImpressionClient, ImpressionError, ImpressionProxy};
pub use logger::{describe_schedule, WidgetLoggerProxy};
pub use no_vote_discard::NoVoteDiscardProxy;
pub use store_widget::{ReleasePolicy, StoreWidgetProxy};

/// Input side of a pipeline stage.
pub trait WidgetProxyInput: Send + Sync {
    fn publish(&self, data: WidgetProxyPublishData);

    fn discard(&self, data: WidgetProxyPublishData, reason: DiscardReason);
}

/// The display layer at the end of the chain. After showing a widget it must
/// eventually call [`WidgetPipeline::set_processing`] with `false`.
pub trait WidgetDisplay: Send + Sync {
    fn display_widget(&self, data: WidgetProxyPublishData);

    fn widget_discarded(&self, _data: WidgetProxyPublishData, _reason: DiscardReason) {}
}

struct DisplaySink {
    display: Arc<dyn WidgetDisplay>,
}

impl WidgetProxyInput for DisplaySink {
    fn publish(&self, data: WidgetProxyPublishData) {
        self.display.display_widget(data);
    }

    fn discard(&self, data: WidgetProxyPublishData, reason: DiscardReason) {
        self.display.widget_discarded(data, reason);
    }
}

/// Collaborators the stages are built from.
pub struct PipelineParts {
    pub cache: Arc<dyn ContentCache>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub votes: Arc<dyn VoteRepository>,
    pub impressions: Arc<dyn ImpressionClient>,
    pub session_id: String,
    pub time_source: Option<Arc<dyn PlayerTimeSource>>,
    pub release_policy: ReleasePolicy,
}

pub struct WidgetPipeline {
    head: Arc<ImageDownloadProxy>,
    gate: Arc<StoreWidgetProxy>,
}

impl WidgetPipeline {
    /// Builds the chain
    /// image download → no-vote discard → gate → impression → logger → display.
    ///
    /// Must be called from within a Tokio runtime; the image and impression
    /// stages spawn their work onto it.
    pub fn assemble(parts: PipelineParts, display: Arc<dyn WidgetDisplay>) -> Self {
        let PipelineParts {
            cache,
            fetcher,
            votes,
            impressions,
            session_id,
            time_source,
            release_policy,
        } = parts;

        let sink: Arc<dyn WidgetProxyInput> = Arc::new(DisplaySink { display });
        let logger: Arc<dyn WidgetProxyInput> = Arc::new(WidgetLoggerProxy::new(sink, time_source));
        let impression: Arc<dyn WidgetProxyInput> =
            Arc::new(ImpressionProxy::new(logger, impressions, session_id));
        let gate = Arc::new(StoreWidgetProxy::new(impression, release_policy));
        let no_vote: Arc<dyn WidgetProxyInput> =
            Arc::new(NoVoteDiscardProxy::new(gate.clone(), votes));
        let head = Arc::new(ImageDownloadProxy::new(no_vote, cache, fetcher));

        debug!(target: "widgets.pipeline", policy = ?release_policy, "widget pipeline assembled");
        Self { head, gate }
    }

    pub fn publish(&self, event: ClientEvent) {
        self.head.publish(WidgetProxyPublishData::new(event));
    }

    /// Puts an event the host insists on showing next at the front of the gate.
    /// It skips image prefetch and vote resolution.
    pub fn add_to_front_of_queue(&self, event: ClientEvent) {
        self.gate
            .add_to_front_of_queue(WidgetProxyPublishData::new(event));
    }

    pub fn set_processing(&self, processing: bool) {
        self.gate.set_processing(processing);
    }

    pub fn is_processing(&self) -> bool {
        self.gate.is_processing()
    }

    pub fn queued_len(&self) -> usize {
        self.gate.queued_len()
    }

    /// Discards everything queued at the gate and everything that reaches it
    /// afterwards with [`DiscardReason::PipelineShutdown`].
    pub fn shutdown(&self) {
        self.gate.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use super::*;
    use crate::event::{WidgetKind, WidgetOption, WidgetPayload, WidgetPhase};

    #[derive(Debug, Clone, PartialEq)]
    pub enum Delivery {
        Published(WidgetProxyPublishData),
        Discarded(WidgetProxyPublishData, DiscardReason),
    }

    impl Delivery {
        pub fn id(&self) -> &str {
            match self {
                Delivery::Published(data) | Delivery::Discarded(data, _) => data.event.id(),
            }
        }
    }

    /// Downstream stand-in that records what it receives.
    #[derive(Default)]
    pub struct RecordingInput {
        deliveries: Mutex<Vec<Delivery>>,
        changed: Notify,
    }

    impl RecordingInput {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn deliveries(&self) -> Vec<Delivery> {
            self.deliveries.lock().clone()
        }

        pub fn published_ids(&self) -> Vec<String> {
            self.deliveries
                .lock()
                .iter()
                .filter_map(|d| match d {
                    Delivery::Published(data) => Some(data.event.id().to_string()),
                    Delivery::Discarded(..) => None,
                })
                .collect()
        }

        pub async fn wait_for(&self, count: usize) -> Vec<Delivery> {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let notified = self.changed.notified();
                    if self.deliveries.lock().len() >= count {
                        return self.deliveries();
                    }
                    notified.await;
                }
            })
            .await
            .expect("deliveries arrived")
        }

        fn record(&self, delivery: Delivery) {
            self.deliveries.lock().push(delivery);
            self.changed.notify_waiters();
        }
    }

    impl WidgetProxyInput for RecordingInput {
        fn publish(&self, data: WidgetProxyPublishData) {
            self.record(Delivery::Published(data));
        }

        fn discard(&self, data: WidgetProxyPublishData, reason: DiscardReason) {
            self.record(Delivery::Discarded(data, reason));
        }
    }

    pub fn option(id: &str, image_url: Option<&str>) -> WidgetOption {
        WidgetOption {
            id: id.into(),
            description: None,
            image_url: image_url.map(Into::into),
            vote_url: Some(format!("https://api.test/votes/{id}")),
            is_correct: None,
            answer_count: None,
            vote_count: None,
        }
    }

    pub fn event(kind: WidgetKind, phase: WidgetPhase, id: &str) -> ClientEvent {
        let mut payload = WidgetPayload::new(id, format!("program.{id}"), Duration::from_secs(10));
        payload.options = vec![option(&format!("{id}-a"), None), option(&format!("{id}-b"), None)];
        ClientEvent::new(kind, phase, payload).expect("valid event")
    }

    pub fn created(id: &str) -> WidgetProxyPublishData {
        WidgetProxyPublishData::new(event(WidgetKind::TextPoll, WidgetPhase::Created, id))
    }

    pub fn with_images(id: &str, urls: &[&str]) -> WidgetProxyPublishData {
        let mut payload = WidgetPayload::new(id, format!("program.{id}"), Duration::from_secs(10));
        payload.options = urls
            .iter()
            .enumerate()
            .map(|(i, url)| option(&format!("{id}-{i}"), Some(url)))
            .collect();
        WidgetProxyPublishData::new(
            ClientEvent::new(WidgetKind::ImagePoll, WidgetPhase::Created, payload).expect("valid event"),
        )
    }
}
