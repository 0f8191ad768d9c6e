use std::collections::HashMap;

use parking_lot::Mutex;

use crate::event::Vote;

/// Votes the viewer cast, keyed by widget id.
pub trait VoteRepository: Send + Sync {
    fn find_vote(&self, widget_id: &str) -> Option<Vote>;

    fn clear_vote(&self, widget_id: &str);
}

#[derive(Debug, Default)]
pub struct InMemoryVoteRepository {
    votes: Mutex<HashMap<String, Vote>>,
}

impl InMemoryVoteRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records (or replaces) the viewer's vote on a created widget.
    pub fn record_vote(&self, widget_id: impl Into<String>, vote: Vote) {
        self.votes.lock().insert(widget_id.into(), vote);
    }
}

impl VoteRepository for InMemoryVoteRepository {
    fn find_vote(&self, widget_id: &str) -> Option<Vote> {
        self.votes.lock().get(widget_id).cloned()
    }

    fn clear_vote(&self, widget_id: &str) {
        self.votes.lock().remove(widget_id);
    }
}
