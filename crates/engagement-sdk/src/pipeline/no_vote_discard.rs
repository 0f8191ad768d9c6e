use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::WidgetProxyInput;
use crate::event::{DiscardReason, WidgetProxyPublishData};
use crate::votes::VoteRepository;

/// Resolves follow-ups against the viewer's recorded vote. The vote is consumed
/// here, so a repeated follow-up for the same widget is discarded.
pub struct NoVoteDiscardProxy {
    downstream: Arc<dyn WidgetProxyInput>,
    votes: Arc<dyn VoteRepository>,
    // Serializes find-then-clear so a vote is consumed by one follow-up only.
    consume: Mutex<()>,
}

impl NoVoteDiscardProxy {
    pub fn new(downstream: Arc<dyn WidgetProxyInput>, votes: Arc<dyn VoteRepository>) -> Self {
        Self {
            downstream,
            votes,
            consume: Mutex::new(()),
        }
    }
}

impl WidgetProxyInput for NoVoteDiscardProxy {
    fn publish(&self, data: WidgetProxyPublishData) {
        if !data.event.requires_vote() {
            self.downstream.publish(data);
            return;
        }

        let widget_id = data.event.id().to_string();
        let vote = {
            let _consume = self.consume.lock();
            let vote = self.votes.find_vote(&widget_id);
            if vote.is_some() {
                self.votes.clear_vote(&widget_id);
            }
            vote
        };
        match vote {
            Some(vote) => self.downstream.publish(data.with_vote(vote)),
            None => {
                debug!(target: "widgets.pipeline", widget_id = %widget_id, "follow-up without a vote");
                self.downstream.discard(data, DiscardReason::NoVote);
            }
        }
    }

    fn discard(&self, data: WidgetProxyPublishData, reason: DiscardReason) {
        self.downstream.discard(data, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Vote, WidgetKind, WidgetPhase};
    use crate::pipeline::testing::{event, Delivery, RecordingInput};
    use crate::votes::InMemoryVoteRepository;
    use std::thread;
    use std::time::Duration;

    fn follow_up(id: &str) -> WidgetProxyPublishData {
        WidgetProxyPublishData::new(event(WidgetKind::TextPrediction, WidgetPhase::FollowUp, id))
    }

    #[test]
    fn follow_up_without_vote_is_discarded() {
        let sink = RecordingInput::new();
        let proxy = NoVoteDiscardProxy::new(sink.clone(), Arc::new(InMemoryVoteRepository::new()));

        proxy.publish(follow_up("w1"));

        assert_eq!(
            sink.deliveries(),
            vec![Delivery::Discarded(follow_up("w1"), DiscardReason::NoVote)]
        );
    }

    #[test]
    fn vote_is_attached_and_consumed_once() {
        let votes = Arc::new(InMemoryVoteRepository::new());
        let vote = Vote {
            option_id: "w1-a".into(),
            claim_token: Some("claim".into()),
        };
        votes.record_vote("w1", vote.clone());
        let sink = RecordingInput::new();
        let proxy = NoVoteDiscardProxy::new(sink.clone(), votes.clone());

        proxy.publish(follow_up("w1"));
        assert!(votes.find_vote("w1").is_none());
        proxy.publish(follow_up("w1"));

        assert_eq!(
            sink.deliveries(),
            vec![
                Delivery::Published(follow_up("w1").with_vote(vote)),
                Delivery::Discarded(follow_up("w1"), DiscardReason::NoVote),
            ]
        );
    }

    #[test]
    fn other_phases_pass_through_untouched() {
        let votes = Arc::new(InMemoryVoteRepository::new());
        votes.record_vote(
            "w2",
            Vote {
                option_id: "w2-a".into(),
                claim_token: None,
            },
        );
        let sink = RecordingInput::new();
        let proxy = NoVoteDiscardProxy::new(sink.clone(), votes.clone());

        let created = WidgetProxyPublishData::new(event(WidgetKind::TextPrediction, WidgetPhase::Created, "w2"));
        proxy.publish(created.clone());
        proxy.discard(created.clone(), DiscardReason::PipelineShutdown);

        assert_eq!(
            sink.deliveries(),
            vec![
                Delivery::Published(created.clone()),
                Delivery::Discarded(created, DiscardReason::PipelineShutdown),
            ]
        );
        assert!(votes.find_vote("w2").is_some());
    }

    /// Holds each lookup long enough for a second thread to overlap it.
    struct SlowVotes(InMemoryVoteRepository);

    impl VoteRepository for SlowVotes {
        fn find_vote(&self, widget_id: &str) -> Option<Vote> {
            let vote = self.0.find_vote(widget_id);
            thread::sleep(Duration::from_millis(50));
            vote
        }

        fn clear_vote(&self, widget_id: &str) {
            self.0.clear_vote(widget_id);
        }
    }

    #[test]
    fn concurrent_follow_ups_consume_the_vote_once() {
        let repo = InMemoryVoteRepository::new();
        repo.record_vote(
            "w1",
            Vote {
                option_id: "w1-a".into(),
                claim_token: None,
            },
        );
        let sink = RecordingInput::new();
        let proxy = Arc::new(NoVoteDiscardProxy::new(sink.clone(), Arc::new(SlowVotes(repo))));

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let proxy = proxy.clone();
                thread::spawn(move || proxy.publish(follow_up("w1")))
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let deliveries = sink.deliveries();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(sink.published_ids(), vec!["w1"]);
        assert!(deliveries.contains(&Delivery::Discarded(follow_up("w1"), DiscardReason::NoVote)));
    }
}
