use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use super::WidgetProxyInput;
use crate::event::{DiscardReason, WidgetProxyPublishData};
use crate::time::PlayerTimeSource;

const IN_SYNC_TOLERANCE_MS: i64 = 50;

/// Human-readable position of a widget's program date time relative to the
/// player's playhead.
pub fn describe_schedule(program_date_time: Option<DateTime<Utc>>, playhead: Option<DateTime<Utc>>) -> String {
    let Some(scheduled) = program_date_time else {
        return "no program date time".to_string();
    };
    let Some(playhead) = playhead else {
        return "no player time".to_string();
    };
    let offset_ms = (scheduled - playhead).num_milliseconds();
    if offset_ms.abs() < IN_SYNC_TOLERANCE_MS {
        "in sync with playhead".to_string()
    } else if offset_ms > 0 {
        format!("scheduled {:.3}s ahead of playhead", offset_ms as f64 / 1000.0)
    } else {
        format!("{:.3}s behind playhead", -offset_ms as f64 / 1000.0)
    }
}

/// Observability tap in front of the display layer.
pub struct WidgetLoggerProxy {
    downstream: Arc<dyn WidgetProxyInput>,
    time_source: Option<Arc<dyn PlayerTimeSource>>,
}

impl WidgetLoggerProxy {
    pub fn new(downstream: Arc<dyn WidgetProxyInput>, time_source: Option<Arc<dyn PlayerTimeSource>>) -> Self {
        Self {
            downstream,
            time_source,
        }
    }

    fn schedule(&self, data: &WidgetProxyPublishData) -> String {
        let playhead = self.time_source.as_ref().and_then(|source| source.playhead());
        describe_schedule(data.event.payload().program_date_time, playhead)
    }
}

impl WidgetProxyInput for WidgetLoggerProxy {
    fn publish(&self, data: WidgetProxyPublishData) {
        info!(
            target: "widgets.pipeline",
            widget_id = %data.event.id(),
            event = %data.event.event_name(),
            has_vote = data.vote.is_some(),
            schedule = %self.schedule(&data),
            "widget published"
        );
        self.downstream.publish(data);
    }

    fn discard(&self, data: WidgetProxyPublishData, reason: DiscardReason) {
        info!(
            target: "widgets.pipeline",
            widget_id = %data.event.id(),
            event = %data.event.event_name(),
            reason = reason.as_str(),
            "widget discarded"
        );
        self.downstream.discard(data, reason);
    }
}
