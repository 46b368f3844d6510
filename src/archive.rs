//! Bounded history of completed rounds
//!
//! Only the aggregate outcome of a round survives its closure: the poll,
//! its final tally, and when and why it ended. Individual answers are
//! dropped with the round.

use std::time::Duration;

use serde::Serialize;
use web_time::SystemTime;

use crate::{
    constants::archive::DEFAULT_CAPACITY,
    poll::{CloseReason, Poll, PollId, Tally},
};

/// A completed round with its final results
#[serde_with::serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchivedPoll {
    poll: Poll,
    tally: Tally,
    #[serde_as(as = "serde_with::TimestampMilliSeconds<i64>")]
    ended_at: SystemTime,
    reason: CloseReason,
}

impl ArchivedPoll {
    /// Freezes a round's final state
    pub fn new(poll: Poll, tally: Tally, ended_at: SystemTime, reason: CloseReason) -> Self {
        Self {
            poll,
            tally,
            ended_at,
            reason,
        }
    }

    /// The round that ended
    pub fn poll(&self) -> &Poll {
        &self.poll
    }

    /// The id of the round that ended
    pub fn poll_id(&self) -> PollId {
        self.poll.id()
    }

    /// The final tally
    pub fn tally(&self) -> &Tally {
        &self.tally
    }

    /// When the round ended
    pub fn ended_at(&self) -> SystemTime {
        self.ended_at
    }

    /// Why the round ended
    pub fn reason(&self) -> CloseReason {
        self.reason
    }
}

/// Most-recent-first list of completed rounds, capped at a fixed capacity
#[derive(Debug, Clone)]
pub struct Archive {
    capacity: usize,
    entries: Vec<ArchivedPoll>,
}

impl Default for Archive {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl Archive {
    /// Creates an empty archive that keeps at most `capacity` rounds
    ///
    /// A capacity of zero is raised to one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Prepends a completed round, evicting the oldest one when full
    ///
    /// If the new entry would not end strictly after the newest one, as
    /// when two rounds close in the same millisecond or the clock stepped
    /// backwards, its end time is moved to one millisecond past the newest
    /// so the list stays strictly ordered by `ended_at`, descending.
    ///
    /// # Returns
    ///
    /// The evicted round, if any
    pub fn record(&mut self, mut archived: ArchivedPoll) -> Option<ArchivedPoll> {
        if let Some(newest) = self.entries.first() {
            let floor = newest.ended_at + Duration::from_millis(1);
            archived.ended_at = archived.ended_at.max(floor);
        }
        self.entries.insert(0, archived);
        if self.entries.len() > self.capacity {
            self.entries.pop()
        } else {
            None
        }
    }

    /// Returns the retained rounds, most recent first
    pub fn list(&self) -> &[ArchivedPoll] {
        &self.entries
    }

    /// Maximum number of retained rounds
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of retained rounds
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no round has been archived yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
