//! Authoritative session state
//!
//! The store owns the single active round (if any) together with its
//! tally and answer registrar, the id counter, and the archive of
//! completed rounds. It knows nothing about connections or timers; the
//! coordinator layers those on top.

use std::collections::HashSet;

use web_time::SystemTime;

use crate::{
    archive::{Archive, ArchivedPoll},
    poll::{CloseReason, Poll, PollConfig, PollId, Tally},
    registrar::{Accepted, Registrar, Rejection},
    snapshot::Snapshot,
    watcher::Id,
};

/// The open round and everything collected for it so far
#[derive(Debug, Clone)]
pub struct ActiveRound {
    poll: Poll,
    tally: Tally,
    registrar: Registrar,
}

impl ActiveRound {
    /// The open round
    pub fn poll(&self) -> &Poll {
        &self.poll
    }

    /// Counts so far
    pub fn tally(&self) -> &Tally {
        &self.tally
    }

    /// Who answered so far
    pub fn registrar(&self) -> &Registrar {
        &self.registrar
    }
}

/// Poll state of one session
#[derive(Debug, Clone)]
pub struct SessionStore {
    next_id: PollId,
    active: Option<ActiveRound>,
    archive: Archive,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(Archive::default())
    }
}

impl SessionStore {
    /// Creates an idle store that archives into `archive`
    pub fn new(archive: Archive) -> Self {
        Self {
            next_id: PollId::first(),
            active: None,
            archive,
        }
    }

    /// Opens a new round from a validated definition
    ///
    /// Any round still active is replaced without being archived; callers
    /// decide beforehand whether that is allowed. The tally starts at zero
    /// for every option and the registrar starts empty.
    pub fn open(&mut self, config: PollConfig, now: SystemTime) -> Poll {
        let id = self.next_id;
        self.next_id = id.next();

        let poll = Poll::open(id, config, now);
        self.active = Some(ActiveRound {
            tally: Tally::zeroed(poll.options()),
            poll: poll.clone(),
            registrar: Registrar::default(),
        });
        poll
    }

    /// Drops the active round without archiving it
    pub fn discard(&mut self) -> Option<ActiveRound> {
        self.active.take()
    }

    /// Counts an answer toward the active round
    ///
    /// `connected` is the set of participants currently connected; it
    /// decides whether the round is now answered by everyone.
    ///
    /// # Errors
    ///
    /// `Rejection::NoActivePoll` when idle, otherwise whatever
    /// [`Registrar::submit`] rejects.
    pub fn submit(
        &mut self,
        participant: Id,
        option: &str,
        poll_id: PollId,
        now: SystemTime,
        connected: &HashSet<Id>,
    ) -> Result<Accepted, Rejection> {
        let ActiveRound {
            poll,
            tally,
            registrar,
        } = self.active.as_mut().ok_or(Rejection::NoActivePoll)?;

        registrar.submit(poll, tally, participant, option, poll_id, now)?;

        Ok(Accepted {
            tally: tally.clone(),
            complete: registrar.covers(connected),
        })
    }

    /// Whether the active round has been answered by everyone in `connected`
    pub fn is_complete(&self, connected: &HashSet<Id>) -> bool {
        self.active
            .as_ref()
            .is_some_and(|round| round.registrar.covers(connected))
    }

    /// Closes the active round if it is `poll_id`, archiving its results
    ///
    /// Closing a round that is no longer active does nothing, so a late
    /// deadline and an early closure can race without double-archiving.
    ///
    /// # Returns
    ///
    /// The archived round, if this call closed it
    pub fn close(
        &mut self,
        poll_id: PollId,
        reason: CloseReason,
        now: SystemTime,
    ) -> Option<ArchivedPoll> {
        if self.active_id() != Some(poll_id) {
            return None;
        }
        let ActiveRound { poll, tally, .. } = self.active.take()?;

        let archived = ArchivedPoll::new(poll, tally, now, reason);
        if let Some(evicted) = self.archive.record(archived.clone()) {
            tracing::debug!(poll_id = %evicted.poll_id(), "evicted from archive");
        }
        Some(archived)
    }

    /// The open round, if any
    pub fn active(&self) -> Option<&ActiveRound> {
        self.active.as_ref()
    }

    /// The id of the open round, if any
    pub fn active_id(&self) -> Option<PollId> {
        self.active.as_ref().map(|round| round.poll.id())
    }

    /// Completed rounds
    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    /// Captures the current state as seen at `now`
    pub fn snapshot(&self, now: SystemTime) -> Snapshot {
        Snapshot::capture(self.active.as_ref(), now)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::time::Duration;

    use super::*;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn pick_one() -> PollConfig {
        PollConfig::new("Pick one", ["A", "B"], 10)
    }

    #[test]
    fn test_open_zeroes_tally() {
        let mut store = SessionStore::default();
        let poll = store.open(pick_one(), at(0));

        let active = store.active().unwrap();
        assert_eq!(active.poll(), &poll);
        assert_eq!(
            active.tally().iter().collect::<Vec<_>>(),
            vec![("A", 0), ("B", 0)]
        );
        assert_eq!(active.registrar().answered_count(), 0);
    }

    #[test]
    fn test_ids_increase() {
        let mut store = SessionStore::default();
        let first = store.open(pick_one(), at(0)).id();
        let second = store.open(pick_one(), at(1)).id();
        assert!(second > first);
    }

    #[test]
    fn test_submit_while_idle() {
        let mut store = SessionStore::default();
        let result = store.submit(Id::new(), "A", PollId::first(), at(0), &HashSet::new());
        assert_eq!(result, Err(Rejection::NoActivePoll));
    }

    #[test]
    fn test_submit_reports_completion() {
        let mut store = SessionStore::default();
        let id = store.open(pick_one(), at(0)).id();
        let p1 = Id::new();
        let p2 = Id::new();
        let connected = HashSet::from([p1, p2]);

        let first = store.submit(p1, "A", id, at(1), &connected).unwrap();
        assert!(!first.complete);
        assert_eq!(first.tally.get("A"), Some(1));

        let second = store.submit(p2, "B", id, at(2), &connected).unwrap();
        assert!(second.complete);
        assert!(store.is_complete(&connected));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut store = SessionStore::default();
        let id = store.open(pick_one(), at(0)).id();

        let archived = store.close(id, CloseReason::Timeout, at(10)).unwrap();
        assert_eq!(archived.poll_id(), id);
        assert_eq!(archived.reason(), CloseReason::Timeout);
        assert_eq!(archived.ended_at(), at(10));

        assert!(store.close(id, CloseReason::Complete, at(11)).is_none());
        assert!(store.active().is_none());
        assert_eq!(store.archive().len(), 1);
    }

    #[test]
    fn test_close_stale_id_keeps_active() {
        let mut store = SessionStore::default();
        let old = store.open(pick_one(), at(0)).id();
        let new = store.open(pick_one(), at(1)).id();

        assert!(store.close(old, CloseReason::Timeout, at(10)).is_none());
        assert_eq!(store.active_id(), Some(new));
        assert!(store.archive().is_empty());
    }

    #[test]
    fn test_discard_does_not_archive() {
        let mut store = SessionStore::default();
        store.open(pick_one(), at(0));

        assert!(store.discard().is_some());
        assert!(store.active().is_none());
        assert!(store.archive().is_empty());
        assert_eq!(store.snapshot(at(1)), Snapshot::Idle);
    }
}
