//! Poll definitions and result tallies
//!
//! This module defines what a presenter submits to open a round
//! ([`PollConfig`]), the immutable round it becomes ([`Poll`]), and the
//! per-option vote counter ([`Tally`]) that is broadcast while the round
//! is live and frozen into the archive when it closes.

use std::{fmt::Display, num::ParseIntError, str::FromStr, time::Duration};

use garde::Validate;
use itertools::Itertools;
use serde::{Deserialize, Serialize, ser::SerializeMap};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;
use web_time::SystemTime;

use crate::constants::poll::{
    MAX_DURATION, MAX_OPTION_COUNT, MAX_OPTION_LENGTH, MAX_QUESTION_LENGTH, MIN_DURATION,
    MIN_OPTION_COUNT,
};

type ValidationResult = garde::Result;

/// Identifier of a single round
///
/// Ids are handed out in increasing order by the owning coordinator, so
/// comparing two ids orders their rounds by creation.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, DeserializeFromStr, SerializeDisplay,
)]
pub struct PollId(u64);

impl PollId {
    /// The id given to the first round of a session
    pub fn first() -> Self {
        Self(1)
    }

    /// The id that follows this one
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl Display for PollId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PollId {
    type Err = ParseIntError;

    /// Parses a poll id from its decimal representation
    ///
    /// # Errors
    ///
    /// Returns a `ParseIntError` if the string is not a valid `u64`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Why a round ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    /// The round's deadline elapsed
    Timeout,
    /// Every connected participant answered, or the presenter ended it
    Complete,
}

/// Errors that can occur when opening a round
#[derive(Error, Serialize, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The poll definition failed validation
    #[error("invalid poll: {0}")]
    Invalid(String),
    /// A round is active and the session refuses to replace it yet
    #[error("the current round has not been answered by every participant")]
    RoundInProgress,
}

impl From<garde::Report> for Error {
    fn from(report: garde::Report) -> Self {
        Self::Invalid(report.to_string())
    }
}

fn validate_question(val: &str) -> ValidationResult {
    if val.trim().is_empty() {
        Err(garde::Error::new("question cannot be empty"))
    } else {
        Ok(())
    }
}

fn validate_options(val: &[String]) -> ValidationResult {
    if val.iter().any(|option| option.trim().is_empty()) {
        return Err(garde::Error::new("options cannot be empty"));
    }
    if !val.iter().all_unique() {
        return Err(garde::Error::new("options must be distinct"));
    }
    Ok(())
}

fn validate_duration(val: i64) -> ValidationResult {
    match u64::try_from(val) {
        Ok(seconds) if (MIN_DURATION..=MAX_DURATION).contains(&seconds) => Ok(()),
        _ => Err(garde::Error::new(format!(
            "duration is outside of the bounds [{MIN_DURATION},{MAX_DURATION}]",
        ))),
    }
}

/// A presenter's request to open a round
///
/// The duration is carried as a signed integer so that a negative value
/// reaches validation instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct PollConfig {
    /// The question shown to participants
    #[garde(length(chars, max = MAX_QUESTION_LENGTH), custom(|v: &String, _| validate_question(v)))]
    pub question: String,
    /// Answer labels, in display order
    #[garde(
        length(min = MIN_OPTION_COUNT, max = MAX_OPTION_COUNT),
        inner(length(chars, max = MAX_OPTION_LENGTH)),
        custom(|v: &Vec<String>, _| validate_options(v))
    )]
    pub options: Vec<String>,
    /// Round length in whole seconds
    #[garde(custom(|v: &i64, _| validate_duration(*v)))]
    pub duration: i64,
}

impl PollConfig {
    /// Creates a poll definition from its parts
    pub fn new<Q, O, I>(question: Q, options: I, duration: i64) -> Self
    where
        Q: Into<String>,
        O: Into<String>,
        I: IntoIterator<Item = O>,
    {
        Self {
            question: question.into(),
            options: options.into_iter().map(Into::into).collect_vec(),
            duration,
        }
    }
}

/// A single open (or archived) round
///
/// Immutable once created; the next round replaces it wholesale.
#[serde_with::serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Poll {
    id: PollId,
    question: String,
    options: Vec<String>,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    duration: Duration,
    #[serde_as(as = "serde_with::TimestampMilliSeconds<i64>")]
    start_time: SystemTime,
    #[serde_as(as = "serde_with::TimestampMilliSeconds<i64>")]
    end_time: SystemTime,
}

impl Poll {
    /// Opens a round from an already validated definition
    pub(crate) fn open(id: PollId, config: PollConfig, start_time: SystemTime) -> Self {
        let duration = Duration::from_secs(config.duration.unsigned_abs());
        Self {
            id,
            question: config.question,
            options: config.options,
            duration,
            start_time,
            end_time: start_time + duration,
        }
    }

    /// Returns the round's id
    pub fn id(&self) -> PollId {
        self.id
    }

    /// Returns the question text
    pub fn question(&self) -> &str {
        &self.question
    }

    /// Returns the answer labels in display order
    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// Returns how long the round accepts answers
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Returns when the round opened
    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    /// Returns when the round's deadline falls
    pub fn end_time(&self) -> SystemTime {
        self.end_time
    }

    /// Time left until the deadline, saturating at zero
    pub fn time_remaining(&self, now: SystemTime) -> Duration {
        self.end_time.duration_since(now).unwrap_or_default()
    }
}

/// Vote counts for every option of a round
///
/// Counts are stored aligned with the option list, so the tally always
/// covers exactly the poll's options, including the ones nobody picked.
/// Serializes as a JSON object in option order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tally {
    options: Vec<String>,
    counts: Vec<u64>,
}

impl Tally {
    /// Creates a tally with a zero count for each option
    pub fn zeroed(options: &[String]) -> Self {
        Self {
            options: options.to_vec(),
            counts: vec![0; options.len()],
        }
    }

    /// Returns the count for an option, or `None` if it is not one of the poll's options
    pub fn get(&self, option: &str) -> Option<u64> {
        self.position(option).map(|i| self.counts[i])
    }

    /// Whether the option is one of the poll's options
    pub fn contains(&self, option: &str) -> bool {
        self.position(option).is_some()
    }

    /// Total number of votes counted
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Iterates over `(option, count)` pairs in option order
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.options
            .iter()
            .map(String::as_str)
            .zip(self.counts.iter().copied())
    }

    /// Adds one vote to an option
    ///
    /// # Returns
    ///
    /// `false` if the option is unknown, in which case nothing changes
    pub(crate) fn increment(&mut self, option: &str) -> bool {
        match self.position(option) {
            Some(i) => {
                self.counts[i] += 1;
                true
            }
            None => false,
        }
    }

    fn position(&self, option: &str) -> Option<usize> {
        self.options.iter().position(|o| o == option)
    }
}

impl Serialize for Tally {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.counts.len()))?;
        for (option, count) in self.iter() {
            map.serialize_entry(option, &count)?;
        }
        map.end()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn pick_one() -> PollConfig {
        PollConfig::new("Pick one", ["A", "B"], 10)
    }

    #[test]
    fn test_poll_config_valid() {
        assert!(pick_one().validate().is_ok());
    }

    #[test]
    fn test_poll_config_empty_question() {
        let mut config = pick_one();
        config.question = "   ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_poll_config_question_too_long() {
        let mut config = pick_one();
        config.question = "q".repeat(MAX_QUESTION_LENGTH + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_poll_config_needs_two_options() {
        let config = PollConfig::new("Pick one", ["A"], 10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_poll_config_rejects_duplicate_options() {
        let config = PollConfig::new("Pick one", ["A", "A"], 10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_poll_config_rejects_blank_option() {
        let config = PollConfig::new("Pick one", ["A", " "], 10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_poll_config_too_many_options() {
        let options = (0..=MAX_OPTION_COUNT).map(|i| format!("option {i}"));
        let config = PollConfig::new("Pick one", options, 10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_poll_config_duration_bounds() {
        for duration in [0, -5] {
            let mut config = pick_one();
            config.duration = duration;
            assert!(config.validate().is_err(), "{duration} should be rejected");
        }

        let mut config = pick_one();
        config.duration = MAX_DURATION as i64;
        assert!(config.validate().is_ok());
        config.duration += 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_poll_config_deserialize() {
        let config: PollConfig =
            serde_json::from_str(r#"{"question":"Q","options":["x","y"],"duration":30}"#).unwrap();
        assert_eq!(config, PollConfig::new("Q", ["x", "y"], 30));
    }

    #[test]
    fn test_error_from_report() {
        let report = PollConfig::new("", ["A"], 0).validate().unwrap_err();
        assert!(matches!(Error::from(report), Error::Invalid(message) if !message.is_empty()));
    }

    #[test]
    fn test_poll_open_stamps_end_time() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let poll = Poll::open(PollId::first(), pick_one(), start);

        assert_eq!(poll.start_time(), start);
        assert_eq!(poll.end_time(), start + Duration::from_secs(10));
        assert_eq!(poll.options(), ["A", "B"]);
    }

    #[test]
    fn test_time_remaining_saturates() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let poll = Poll::open(PollId::first(), pick_one(), start);

        assert_eq!(
            poll.time_remaining(start + Duration::from_secs(4)),
            Duration::from_secs(6)
        );
        assert_eq!(
            poll.time_remaining(start + Duration::from_secs(60)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_poll_id_ordering_and_parsing() {
        let first = PollId::first();
        let second = first.next();
        assert!(first < second);
        assert_eq!("2".parse::<PollId>().unwrap(), second);
        assert!("two".parse::<PollId>().is_err());
        assert_eq!(serde_json::to_string(&second).unwrap(), r#""2""#);
    }

    #[test]
    fn test_tally_zeroed_covers_options() {
        let tally = Tally::zeroed(&["A".to_string(), "B".to_string()]);
        assert_eq!(tally.iter().collect_vec(), vec![("A", 0), ("B", 0)]);
        assert_eq!(tally.total(), 0);
    }

    #[test]
    fn test_tally_increment() {
        let mut tally = Tally::zeroed(&["A".to_string(), "B".to_string()]);
        assert!(tally.increment("B"));
        assert!(!tally.increment("C"));
        assert_eq!(tally.get("B"), Some(1));
        assert_eq!(tally.get("C"), None);
        assert_eq!(tally.total(), 1);
    }

    #[test]
    fn test_tally_serializes_in_option_order() {
        let mut tally = Tally::zeroed(&["Zebra".to_string(), "Apple".to_string()]);
        tally.increment("Zebra");
        assert_eq!(
            serde_json::to_string(&tally).unwrap(),
            r#"{"Zebra":1,"Apple":0}"#
        );
    }
}
