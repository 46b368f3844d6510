//! Point-in-time view of the session for late joiners

use std::time::Duration;

use serde::Serialize;
use web_time::SystemTime;

use crate::{
    poll::{Poll, Tally},
    store::ActiveRound,
};

/// What a client needs to render the session from scratch
#[serde_with::serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Snapshot {
    /// A round is open
    Active {
        /// The open round
        poll: Poll,
        /// Counts so far
        tally: Tally,
        /// Time left until the deadline
        #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
        time_remaining: Duration,
    },
    /// No round is open
    Idle,
}

impl Snapshot {
    /// Captures the active round, if any, as seen at `now`
    pub fn capture(active: Option<&ActiveRound>, now: SystemTime) -> Self {
        match active {
            Some(round) => Snapshot::Active {
                poll: round.poll().clone(),
                tally: round.tally().clone(),
                time_remaining: round.poll().time_remaining(now),
            },
            None => Snapshot::Idle,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::{poll::PollConfig, store::SessionStore};

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_idle() {
        assert_eq!(Snapshot::capture(None, at(0)), Snapshot::Idle);
        assert_eq!(serde_json::to_string(&Snapshot::Idle).unwrap(), r#""Idle""#);
    }

    #[test]
    fn test_active_time_remaining() {
        let mut store = SessionStore::default();
        store.open(PollConfig::new("Q", ["A", "B"], 10), at(100));

        let Snapshot::Active { time_remaining, .. } = store.snapshot(at(104)) else {
            panic!("expected an active snapshot");
        };
        assert_eq!(time_remaining, Duration::from_secs(6));

        let Snapshot::Active { time_remaining, .. } = store.snapshot(at(200)) else {
            panic!("expected an active snapshot");
        };
        assert_eq!(time_remaining, Duration::ZERO);
    }

    #[test]
    fn test_capture_is_deterministic() {
        let mut store = SessionStore::default();
        store.open(PollConfig::new("Q", ["A", "B"], 10), at(0));

        assert_eq!(store.snapshot(at(3)), store.snapshot(at(3)));
    }

    #[test]
    fn test_active_serialization() {
        let mut store = SessionStore::default();
        store.open(PollConfig::new("Q", ["A", "B"], 10), at(0));

        let json = serde_json::to_value(store.snapshot(at(4))).unwrap();
        assert_eq!(json["Active"]["time_remaining"], 6000);
        assert_eq!(json["Active"]["tally"]["A"], 0);
        assert_eq!(json["Active"]["poll"]["id"], "1");
    }
}
