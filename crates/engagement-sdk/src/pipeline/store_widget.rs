use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, info};

use super::WidgetProxyInput;
use crate::event::{DiscardReason, WidgetProxyPublishData};
use crate::queue::Queue;

/// How many queued events one "processing finished" signal releases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// Exactly one event per `true → false` transition.
    #[default]
    OnePerSignal,
    /// Keep releasing until the display layer reports busy again or the
    /// queue runs dry.
    DrainUntilBusy,
}

#[derive(Default)]
struct GateState {
    is_processing: bool,
    closed: bool,
    queue: Queue<WidgetProxyPublishData>,
}

enum Decision {
    Forward(WidgetProxyPublishData),
    Reject(WidgetProxyPublishData),
    Hold,
}

/// Backpressure point of the pipeline: holds events while the display layer
/// is busy.
///
/// `delivery` serializes every decide-then-forward sequence so events leave in
/// the order they were decided. It is re-entrant because the display layer
/// typically flips `set_processing(true)` from inside `display_widget`.
pub struct StoreWidgetProxy {
    downstream: Arc<dyn WidgetProxyInput>,
    policy: ReleasePolicy,
    delivery: ReentrantMutex<()>,
    state: Mutex<GateState>,
}

impl StoreWidgetProxy {
    pub fn new(downstream: Arc<dyn WidgetProxyInput>, policy: ReleasePolicy) -> Self {
        Self {
            downstream,
            policy,
            delivery: ReentrantMutex::new(()),
            state: Mutex::new(GateState::default()),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.state.lock().is_processing
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn set_processing(&self, processing: bool) {
        let _delivery = self.delivery.lock();
        let released = {
            let mut state = self.state.lock();
            let was_processing = state.is_processing;
            state.is_processing = processing;
            was_processing && !processing && !state.closed
        };
        if !released {
            return;
        }
        match self.policy {
            ReleasePolicy::OnePerSignal => {
                let next = self.state.lock().queue.dequeue();
                if let Some(data) = next {
                    self.forward(data);
                }
            }
            ReleasePolicy::DrainUntilBusy => loop {
                let next = {
                    let mut state = self.state.lock();
                    if state.is_processing || state.closed {
                        break;
                    }
                    state.queue.dequeue()
                };
                match next {
                    Some(data) => self.forward(data),
                    None => break,
                }
            },
        }
    }

    /// Queues `data` ahead of everything already waiting; forwards it at once
    /// when the display layer is idle.
    pub fn add_to_front_of_queue(&self, data: WidgetProxyPublishData) {
        let _delivery = self.delivery.lock();
        let decision = {
            let mut state = self.state.lock();
            if state.closed {
                Decision::Reject(data)
            } else if state.is_processing {
                state.queue.enqueue_front(data);
                Decision::Hold
            } else {
                Decision::Forward(data)
            }
        };
        self.apply(decision);
    }

    /// Closes the gate. Queued events and anything published afterwards are
    /// discarded instead of reaching a display layer that is going away.
    pub fn shutdown(&self) {
        let _delivery = self.delivery.lock();
        let drained = {
            let mut state = self.state.lock();
            state.closed = true;
            state.queue.drain()
        };
        info!(target: "widgets.pipeline", discarded = drained.len(), "widget gate shut down");
        for data in drained {
            self.downstream.discard(data, DiscardReason::PipelineShutdown);
        }
    }

    fn apply(&self, decision: Decision) {
        match decision {
            Decision::Forward(data) => self.forward(data),
            Decision::Reject(data) => self.downstream.discard(data, DiscardReason::PipelineShutdown),
            Decision::Hold => {}
        }
    }

    fn forward(&self, data: WidgetProxyPublishData) {
        debug!(target: "widgets.pipeline", widget_id = %data.event.id(), "gate released widget");
        self.downstream.publish(data);
    }
}

impl WidgetProxyInput for StoreWidgetProxy {
    fn publish(&self, data: WidgetProxyPublishData) {
        let _delivery = self.delivery.lock();
        let decision = {
            let mut state = self.state.lock();
            if state.closed {
                Decision::Reject(data)
            } else if state.is_processing {
                state.queue.enqueue(data);
                Decision::Hold
            } else if state.queue.is_empty() {
                Decision::Forward(data)
            } else {
                // Idle with a backlog: the oldest queued event goes first.
                state.queue.enqueue(data);
                state.queue.dequeue().map_or(Decision::Hold, Decision::Forward)
            }
        };
        self.apply(decision);
    }

    fn discard(&self, data: WidgetProxyPublishData, reason: DiscardReason) {
        self.downstream.discard(data, reason);
    }
}
