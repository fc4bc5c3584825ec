use crate::backfill::feed::{Checkpoint, CheckpointError, FeedId, FeedState};
use anyhow::Result;
use std::collections::BTreeMap;

/// Durable home of feed state. Only checkpoint writes move a frontier.
pub trait ProgressStore: Send {
    fn list_feeds(&self) -> Result<Vec<FeedState>>;

    fn read_feed_state(&self, id: FeedId) -> Result<Option<FeedState>>;

    fn feed_by_name(&self, name: &str) -> Result<Option<FeedState>> {
        Ok(self
            .list_feeds()?
            .into_iter()
            .find(|feed| feed.name == name))
    }

    /// Persists `checkpoint` before returning. A checkpoint newer than the
    /// stored frontier is rejected.
    fn write_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()>;

    /// Turns backfill off for the feed. Nothing in the engine turns it back on.
    fn disable_feed(&mut self, id: FeedId) -> Result<()>;
}

/// In-memory store that also keeps every accepted checkpoint in order.
#[derive(Debug, Default, Clone)]
pub struct MemoryProgressStore {
    feeds: BTreeMap<FeedId, FeedState>,
    history: Vec<Checkpoint>,
}

impl MemoryProgressStore {
    pub fn new(feeds: impl IntoIterator<Item = FeedState>) -> Self {
        Self {
            feeds: feeds.into_iter().map(|feed| (feed.id, feed)).collect(),
            history: Vec::new(),
        }
    }

    pub fn insert(&mut self, feed: FeedState) {
        self.feeds.insert(feed.id, feed);
    }

    pub fn feed(&self, id: FeedId) -> Option<&FeedState> {
        self.feeds.get(&id)
    }

    /// Accepted checkpoints, oldest write first.
    pub fn history(&self) -> &[Checkpoint] {
        &self.history
    }

    pub fn history_for(&self, id: FeedId) -> Vec<u64> {
        self.history
            .iter()
            .filter(|checkpoint| checkpoint.feed_id == id)
            .map(|checkpoint| checkpoint.sequence)
            .collect()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn list_feeds(&self) -> Result<Vec<FeedState>> {
        Ok(self.feeds.values().cloned().collect())
    }

    fn read_feed_state(&self, id: FeedId) -> Result<Option<FeedState>> {
        Ok(self.feeds.get(&id).cloned())
    }

    fn write_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        let feed = self
            .feeds
            .get_mut(&checkpoint.feed_id)
            .ok_or(CheckpointError::UnknownFeed(checkpoint.feed_id))?;
        feed.apply_checkpoint(checkpoint)?;
        self.history.push(checkpoint.clone());
        Ok(())
    }

    fn disable_feed(&mut self, id: FeedId) -> Result<()> {
        let feed = self
            .feeds
            .get_mut(&id)
            .ok_or(CheckpointError::UnknownFeed(id))?;
        feed.enabled = false;
        Ok(())
    }
}
