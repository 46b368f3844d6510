//! Answer registration for the active round
//!
//! The registrar remembers which participant answered what, so that each
//! participant is counted at most once per round, and decides whether the
//! round has been answered by everyone currently connected.

use std::collections::{HashMap, HashSet, hash_map::Entry};

use serde::Serialize;
use thiserror::Error;
use web_time::SystemTime;

use crate::{
    poll::{Poll, PollId, Tally},
    watcher::Id,
};

/// A single accepted answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerRecord {
    /// The chosen option label
    pub option: String,
    /// The round the answer was given in
    pub poll_id: PollId,
    /// When the answer was accepted
    pub timestamp: SystemTime,
}

/// Reasons an answer was not counted
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No round is open
    #[error("no round is active")]
    NoActivePoll,
    /// The answer names a round other than the active one
    #[error("answer is for a different round")]
    WrongPoll,
    /// The option is not one of the round's options
    #[error("option is not part of the round")]
    UnknownOption,
    /// The participant already answered this round
    #[error("participant already answered")]
    AlreadyAnswered,
}

/// Outcome of an accepted answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// The tally after the answer was counted
    pub tally: Tally,
    /// Whether every connected participant has now answered
    pub complete: bool,
}

/// Per-round record of who answered
#[derive(Debug, Default, Clone)]
pub struct Registrar {
    records: HashMap<Id, AnswerRecord>,
}

impl Registrar {
    /// Counts one answer toward `tally`
    ///
    /// Checks run in order: round id, option, then duplicate. A rejected
    /// answer leaves both the registrar and the tally untouched.
    ///
    /// # Errors
    ///
    /// * `Rejection::WrongPoll` - `poll_id` is not the id of `poll`
    /// * `Rejection::UnknownOption` - `option` is not one of the poll's options
    /// * `Rejection::AlreadyAnswered` - the participant has a record already
    pub fn submit(
        &mut self,
        poll: &Poll,
        tally: &mut Tally,
        participant: Id,
        option: &str,
        poll_id: PollId,
        now: SystemTime,
    ) -> Result<(), Rejection> {
        if poll.id() != poll_id {
            return Err(Rejection::WrongPoll);
        }
        if !tally.contains(option) {
            return Err(Rejection::UnknownOption);
        }
        match self.records.entry(participant) {
            Entry::Occupied(_) => Err(Rejection::AlreadyAnswered),
            Entry::Vacant(v) => {
                tally.increment(option);
                v.insert(AnswerRecord {
                    option: option.to_owned(),
                    poll_id,
                    timestamp: now,
                });
                Ok(())
            }
        }
    }

    /// Whether every id in `connected` has answered
    ///
    /// An empty set never counts as answered, otherwise a round with
    /// nobody connected would close the moment it opened.
    pub fn covers(&self, connected: &HashSet<Id>) -> bool {
        !connected.is_empty() && connected.iter().all(|id| self.records.contains_key(id))
    }

    /// The answer recorded for a participant
    pub fn record(&self, participant: Id) -> Option<&AnswerRecord> {
        self.records.get(&participant)
    }

    /// Number of participants who answered
    pub fn answered_count(&self) -> usize {
        self.records.len()
    }
}
