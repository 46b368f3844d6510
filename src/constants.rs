//! Configuration constants for the poll session engine
//!
//! This module contains the limits and defaults used throughout the
//! engine to keep poll definitions, participant names and the archive
//! within consistent boundaries.

/// Poll definition limits
pub mod poll {
    /// Maximum length of a poll question in characters
    pub const MAX_QUESTION_LENGTH: usize = 200;
    /// Minimum number of answer options for a poll
    pub const MIN_OPTION_COUNT: usize = 2;
    /// Maximum number of answer options for a poll
    pub const MAX_OPTION_COUNT: usize = 16;
    /// Maximum length of a single option label in characters
    pub const MAX_OPTION_LENGTH: usize = 100;
    /// Minimum round duration in seconds
    pub const MIN_DURATION: u64 = 1;
    /// Maximum round duration in seconds
    pub const MAX_DURATION: u64 = 86_400;
}

/// Completed-round archive limits
pub mod archive {
    /// Number of completed rounds retained when not configured otherwise
    pub const DEFAULT_CAPACITY: usize = 20;
    /// Largest archive capacity accepted by the options validator
    pub const MAX_CAPACITY: usize = 1000;
}

/// Participant limits
pub mod participant {
    /// Maximum number of connections tracked by a single session
    pub const MAX_COUNT: usize = 1000;
    /// Maximum length of a display name in bytes
    pub const MAX_NAME_LENGTH: usize = 30;
    /// Number of names listed in a presenter participant update
    pub const LIST_LIMIT: usize = 50;
}
