//! Runtime options for a poll session

use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::{
    constants::archive::{DEFAULT_CAPACITY, MAX_CAPACITY},
    poll,
};

/// What happens when the presenter opens a round while another is active
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum RoundPolicy {
    /// The active round is discarded without being archived
    #[default]
    Supersede,
    /// Opening is refused until every connected participant has answered
    RequireCompletion,
}

/// Session-wide behavior switches
///
/// Missing fields fall back to their defaults when deserializing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct Options {
    /// Number of completed rounds kept in the archive
    #[garde(range(min = 1, max = MAX_CAPACITY))]
    pub archive_capacity: usize,
    /// Handling of a create request while a round is active
    #[garde(skip)]
    pub round_policy: RoundPolicy,
    /// Whether a round closes as soon as every connected participant answered
    #[garde(skip)]
    pub early_close: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            archive_capacity: DEFAULT_CAPACITY,
            round_policy: RoundPolicy::default(),
            early_close: true,
        }
    }
}

impl Options {
    /// Validates the options, handing them back on success
    ///
    /// # Errors
    ///
    /// Returns `poll::Error::Invalid` describing the offending field.
    pub fn validated(self) -> Result<Self, poll::Error> {
        self.validate()?;
        Ok(self)
    }
}
