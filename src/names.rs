//! Display names for participants
//!
//! Names are unique within a session, trimmed, length-limited and
//! screened with `rustrict`. A name stays reserved while its owner is
//! disconnected and is only released when the owner is removed.

use std::collections::{HashMap, hash_map::Entry};

use rustrict::CensorStr;
use serde::Serialize;
use thiserror::Error;

use super::{constants::participant::MAX_NAME_LENGTH, watcher::Id};

/// Two-way mapping between participants and their display names
#[derive(Debug, Default, Clone)]
pub struct Names {
    by_id: HashMap<Id, String>,
    by_name: HashMap<String, Id>,
}

/// Reasons a display name was refused
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Another participant holds this name
    #[error("name is taken")]
    Used,
    /// This participant already has a name
    #[error("participant already named")]
    Assigned,
    /// Nothing left after trimming
    #[error("name is blank")]
    Empty,
    /// Flagged by the content filter
    #[error("name is inappropriate")]
    Sinful,
    /// Longer than the name limit
    #[error("name exceeds {MAX_NAME_LENGTH} bytes")]
    TooLong,
}

/// Trims and screens a requested name
fn screen(requested: &str) -> Result<&str, Error> {
    if requested.len() > MAX_NAME_LENGTH {
        return Err(Error::TooLong);
    }
    let trimmed = rustrict::trim_whitespace(requested);
    if trimmed.is_empty() {
        Err(Error::Empty)
    } else if trimmed.is_inappropriate() {
        Err(Error::Sinful)
    } else {
        Ok(trimmed)
    }
}

impl Names {
    /// The name held by `id`
    pub fn get_name(&self, id: &Id) -> Option<String> {
        self.by_id.get(id).cloned()
    }

    /// The participant holding `name`, matched exactly
    pub fn get_id(&self, name: &str) -> Option<Id> {
        self.by_name.get(name).copied()
    }

    /// Gives `id` the display name `requested`
    ///
    /// # Returns
    ///
    /// The name as stored, with surrounding whitespace removed
    ///
    /// # Errors
    ///
    /// Any [`Error`]; on error nothing is reserved.
    pub fn set_name(&mut self, id: Id, requested: &str) -> Result<String, Error> {
        let name = screen(requested)?;
        if self.by_name.contains_key(name) {
            return Err(Error::Used);
        }
        let Entry::Vacant(slot) = self.by_id.entry(id) else {
            return Err(Error::Assigned);
        };
        slot.insert(name.to_owned());
        self.by_name.insert(name.to_owned(), id);
        Ok(name.to_owned())
    }

    /// Releases the name held by `id`
    ///
    /// # Returns
    ///
    /// The released name, if `id` had one
    pub fn remove(&mut self, id: &Id) -> Option<String> {
        let name = self.by_id.remove(id)?;
        self.by_name.remove(&name);
        Some(name)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_set_name_trims_and_maps_both_ways() {
        let mut names = Names::default();
        let grace = Id::new();

        assert_eq!(names.set_name(grace, "  Grace\t"), Ok("Grace".to_string()));
        assert_eq!(names.get_name(&grace), Some("Grace".to_string()));
        assert_eq!(names.get_id("Grace"), Some(grace));
        assert_eq!(names.get_id("  Grace\t"), None);
    }

    #[test]
    fn test_screen_rejections() {
        let cases = [
            ("", Error::Empty),
            (" \n ", Error::Empty),
            ("shit", Error::Sinful),
        ];
        for (requested, expected) in cases {
            assert_eq!(screen(requested), Err(expected), "{requested:?}");
        }

        let at_limit = "Maximiliana Bartholomew Smithe";
        assert_eq!(at_limit.len(), MAX_NAME_LENGTH);
        assert_eq!(screen(at_limit), Ok(at_limit));
        assert_eq!(screen(&format!("{at_limit}s")), Err(Error::TooLong));
    }

    #[test]
    fn test_names_are_unique_and_exact() {
        let mut names = Names::default();
        let first = Id::new();
        let second = Id::new();

        names.set_name(first, "Ada").unwrap();
        assert_eq!(names.set_name(second, " Ada "), Err(Error::Used));
        assert_eq!(names.set_name(second, "ada"), Ok("ada".to_string()));
    }

    #[test]
    fn test_one_name_per_participant() {
        let mut names = Names::default();
        let id = Id::new();

        names.set_name(id, "Ada").unwrap();
        assert_eq!(names.set_name(id, "Lovelace"), Err(Error::Assigned));
        assert_eq!(names.get_id("Lovelace"), None);
    }

    #[test]
    fn test_remove_releases_name() {
        let mut names = Names::default();
        let leaving = Id::new();
        let arriving = Id::new();

        names.set_name(leaving, "Ada").unwrap();
        assert_eq!(names.remove(&leaving), Some("Ada".to_string()));
        assert_eq!(names.remove(&leaving), None);
        assert_eq!(names.get_name(&leaving), None);

        assert!(names.set_name(arriving, "Ada").is_ok());
    }

    #[test]
    fn test_error_serializes_as_variant() {
        assert_eq!(serde_json::to_string(&Error::Used).unwrap(), r#""Used""#);
        assert_eq!(
            Error::TooLong.to_string(),
            format!("name exceeds {MAX_NAME_LENGTH} bytes")
        );
    }
}
