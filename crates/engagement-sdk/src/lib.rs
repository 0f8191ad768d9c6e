//! Engagement SDK: client-side plumbing for live-program widgets.
//!
//! Responsibilities:
//! - running backend widget events through the ordered proxy pipeline
//!   (image prefetch, vote resolution, display gate, impressions, logging)
//! - pairing a viewer with an operator console and streaming program date
//!   time over a pub/sub sync channel
//! - HTTP and in-memory implementations of the external collaborators

pub mod cache;
pub mod config;
pub mod event;
pub mod http;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod sync;
pub mod time;
pub mod votes;

pub use cache::{ContentCache, InMemoryContentCache};
pub use config::{ConfigError, EngagementConfig};
pub use event::{
    ClientEvent, DiscardReason, EventError, Vote, WidgetKind, WidgetOption, WidgetPayload, WidgetPhase,
    WidgetProxyPublishData,
};
pub use http::{HttpClientError, HttpClients, HttpImageFetcher, HttpImpressionClient};
pub use pipeline::{PipelineParts, ReleasePolicy, WidgetDisplay, WidgetPipeline, WidgetProxyInput};
pub use sync::{
    spawn_delegate_dispatch, SyncCoordinator, SyncDelegate, SyncError, SyncNotification, SyncPhase, SyncSession,
};
pub use time::PlayerTimeSource;
pub use votes::{InMemoryVoteRepository, VoteRepository};
