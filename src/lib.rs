//! # Livepoll Library
//!
//! This library provides the engine behind a live classroom poll: a
//! presenter opens a timed multiple-choice round, connected participants
//! answer at most once, running tallies are broadcast to everyone, and
//! completed rounds are kept in a bounded archive.
//!
//! The core ([`coordinator::Coordinator`]) is transport agnostic and
//! talks to the outside world through [`session::Tunnel`] and
//! [`session::Scheduler`]. The [`runtime`] module drives it on a tokio
//! task for hosts that want a ready-made event loop.

#![cfg_attr(all(coverage_nightly, test), feature(coverage_attribute))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]
use derive_where::derive_where;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

pub mod archive;
pub mod config;
pub mod constants;
pub mod coordinator;
mod names;
pub mod poll;
pub mod registrar;
pub mod runtime;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod watcher;

use poll::{CloseReason, Poll, PollId, Tally};
use watcher::Id;

/// Messages sent to synchronize a client's view with the session
///
/// Sync messages carry point-in-time state and are sent to a single
/// connection on connect, reconnect, or explicit request.
#[derive(Debug, Serialize, Clone, derive_more::From)]
pub enum SyncMessage {
    /// The live round, or idle
    State(snapshot::Snapshot),
    /// Completed rounds, most recent first
    Archive(Vec<archive::ArchivedPoll>),
    /// Named participants, sent to the presenter
    Participants(TruncatedVec<String>),
}

impl SyncMessage {
    /// Serializes the message as JSON for a tunnel
    ///
    /// # Panics
    ///
    /// Never in practice: every field serializes infallibly to JSON.
    pub fn to_message(&self) -> String {
        serde_json::to_string(self).expect("default serializer cannot fail")
    }
}

/// Messages sent to notify clients about changes in the session
#[skip_serializing_none]
#[derive(Debug, Serialize, Clone)]
pub enum UpdateMessage {
    /// Assign a unique ID to a connection
    IdAssign(Id),
    /// Prompt the connection to choose a display name
    NameChoose,
    /// The display name the connection now holds
    NameAssign(String),
    /// The requested display name was refused
    NameError(names::Error),
    /// Named participants, sent to the presenter whenever the list changes
    Participants(TruncatedVec<String>),
    /// A new round opened
    PollStarted(Poll),
    /// A vote was counted
    TallyUpdated {
        /// The round the tally belongs to
        poll_id: PollId,
        /// Counts for every option
        tally: Tally,
    },
    /// A round ended
    PollClosed {
        /// The round that ended
        poll_id: PollId,
        /// Final counts for every option
        tally: Tally,
        /// Why it ended
        reason: CloseReason,
    },
    /// A create request was refused, sent to the presenter only
    CreateError(poll::Error),
    /// The presenter removed this participant from the session
    Kicked,
}

impl UpdateMessage {
    /// Serializes the message as JSON for a tunnel
    ///
    /// # Panics
    ///
    /// Never in practice: every field serializes infallibly to JSON.
    pub fn to_message(&self) -> String {
        serde_json::to_string(self).expect("default serializer cannot fail")
    }
}

/// Alarms for timed events
///
/// Each alarm carries the id of the round it was armed for, so a late
/// firing against a newer round is recognized and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlarmMessage {
    /// The round's duration elapsed
    Deadline(PollId),
}

impl AlarmMessage {
    /// The round this alarm belongs to
    pub fn poll_id(&self) -> PollId {
        match self {
            AlarmMessage::Deadline(poll_id) => *poll_id,
        }
    }
}

/// A capped list that still reports how many items there were
///
/// Used for participant lists: the presenter sees the total number of
/// participants while only the first few names are transmitted.
#[derive(Debug, Clone, Serialize)]
#[derive_where(Default)]
pub struct TruncatedVec<T> {
    exact_count: usize,
    items: Vec<T>,
}

impl<T: Clone> TruncatedVec<T> {
    /// Keeps at most `limit` items of `list`, recording `exact_count` as the total
    pub fn new<I: Iterator<Item = T>>(list: I, limit: usize, exact_count: usize) -> Self {
        Self {
            exact_count,
            items: list.take(limit).collect_vec(),
        }
    }

    /// Total number of items before truncation
    pub fn exact_count(&self) -> usize {
        self.exact_count
    }

    /// The retained items
    pub fn items(&self) -> &[T] {
        &self.items
    }
}
