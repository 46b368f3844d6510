//! Presenter and participant connection management
//!
//! This module tracks everyone attached to a poll session: the presenter,
//! named participants, and connections that have not picked a name yet.
//! Identities outlive connections; whether a watcher is currently
//! connected is answered by the tunnel finder supplied by the host.

use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    str::FromStr,
};

use enum_map::{Enum, EnumMap};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;
use uuid::Uuid;

use super::{
    SyncMessage, UpdateMessage, constants::participant::MAX_COUNT, session::Tunnel,
};

/// A unique identifier for a watcher
///
/// The id is stable across reconnects: a client that reconnects with the
/// same id resumes its role, name, and any answer it already gave.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, DeserializeFromStr, SerializeDisplay,
)]
pub struct Id(Uuid);

impl Id {
    /// Creates a new random watcher ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Id {
    type Err = uuid::Error;

    /// Parses an ID from a UUID string
    ///
    /// # Errors
    ///
    /// Returns a `uuid::Error` if the string is not a valid UUID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

/// The role of a watcher in the session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    /// A connection that hasn't chosen a display name yet
    Unassigned,
    /// The presenter who opens rounds
    Presenter,
    /// A named participant who may answer
    Participant(ParticipantValue),
}

/// The kind of watcher without associated data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum, Serialize, Deserialize)]
pub enum ValueKind {
    /// An unassigned connection
    Unassigned,
    /// The presenter
    Presenter,
    /// A participant
    Participant,
}

impl Value {
    /// Returns the kind of this value without the associated data
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Unassigned => ValueKind::Unassigned,
            Value::Presenter => ValueKind::Presenter,
            Value::Participant(_) => ValueKind::Participant,
        }
    }
}

/// Participant-specific data
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantValue {
    /// The participant's display name
    pub name: String,
}

/// Errors that can occur when managing watchers
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The session has reached the maximum number of tracked connections
    #[error("maximum number of participants reached")]
    MaximumParticipants,
}

/// Registry of everyone attached to a poll session
///
/// Roles are indexed both by id and by kind, so "every connected
/// participant" does not have to scan the presenter and unassigned
/// connections.
#[derive(Debug, Default)]
pub struct Watchers {
    roles: HashMap<Id, Value>,
    by_kind: EnumMap<ValueKind, HashSet<Id>>,
}

impl Watchers {
    /// Creates a registry that already knows the presenter
    pub fn with_presenter_id(presenter_id: Id) -> Self {
        let mut watchers = Self::default();
        watchers.roles.insert(presenter_id, Value::Presenter);
        watchers.by_kind[ValueKind::Presenter].insert(presenter_id);
        watchers
    }

    fn reachable<'a, T: Tunnel, F: Fn(Id) -> Option<T>>(
        ids: impl Iterator<Item = &'a Id>,
        tunnel_finder: F,
    ) -> Vec<(Id, T)> {
        ids.filter_map(|id| Some((*id, tunnel_finder(*id)?)))
            .collect_vec()
    }

    /// Every watcher that currently has a tunnel
    pub fn connected<T: Tunnel, F: Fn(Id) -> Option<T>>(&self, tunnel_finder: F) -> Vec<(Id, T)> {
        Self::reachable(self.roles.keys(), tunnel_finder)
    }

    /// Watchers of one kind that currently have a tunnel
    pub fn connected_of<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        kind: ValueKind,
        tunnel_finder: F,
    ) -> Vec<(Id, T)> {
        Self::reachable(self.by_kind[kind].iter(), tunnel_finder)
    }

    /// Ids of the participants that currently have a tunnel
    pub fn connected_participants<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        tunnel_finder: F,
    ) -> HashSet<Id> {
        self.by_kind[ValueKind::Participant]
            .iter()
            .copied()
            .filter(|id| tunnel_finder(*id).is_some())
            .collect()
    }

    /// Ids of the watchers of one kind that have no tunnel
    pub fn disconnected_of<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        kind: ValueKind,
        tunnel_finder: F,
    ) -> Vec<Id> {
        self.by_kind[kind]
            .iter()
            .copied()
            .filter(|id| tunnel_finder(*id).is_none())
            .collect_vec()
    }

    /// Number of known watchers of one kind, connected or not
    pub fn count_of(&self, kind: ValueKind) -> usize {
        self.by_kind[kind].len()
    }

    /// Whether the registry holds as many watchers as a session allows
    pub fn is_full(&self) -> bool {
        self.roles.len() >= MAX_COUNT
    }

    /// Registers a watcher under `value`
    ///
    /// # Errors
    ///
    /// Returns `Error::MaximumParticipants` if the session is full.
    pub fn add_watcher(&mut self, id: Id, value: Value) -> Result<(), Error> {
        if self.is_full() {
            return Err(Error::MaximumParticipants);
        }
        self.by_kind[value.kind()].insert(id);
        self.roles.insert(id, value);
        Ok(())
    }

    /// Changes the role of a known watcher; unknown ids are ignored
    pub fn update_watcher_value(&mut self, id: Id, value: Value) {
        let Some(current) = self.roles.get_mut(&id) else {
            return;
        };
        if current.kind() != value.kind() {
            self.by_kind[current.kind()].remove(&id);
            self.by_kind[value.kind()].insert(id);
        }
        *current = value;
    }

    /// Forgets a watcher entirely
    ///
    /// # Returns
    ///
    /// The watcher's last role, if it was known
    pub fn remove_watcher(&mut self, id: Id) -> Option<Value> {
        let value = self.roles.remove(&id)?;
        self.by_kind[value.kind()].remove(&id);
        Some(value)
    }

    /// The role of a watcher
    pub fn get_watcher_value(&self, id: Id) -> Option<Value> {
        self.roles.get(&id).cloned()
    }

    /// Whether the watcher is known, connected or not
    pub fn has_watcher(&self, id: Id) -> bool {
        self.roles.contains_key(&id)
    }

    /// Closes the watcher's tunnel, if it has one
    pub fn close_session<T: Tunnel, F: Fn(Id) -> Option<T>>(&self, id: Id, tunnel_finder: F) {
        if let Some(tunnel) = tunnel_finder(id) {
            tunnel.close();
        }
    }

    /// Sends an update to one watcher, if connected
    pub fn send_message<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        message: &UpdateMessage,
        id: Id,
        tunnel_finder: F,
    ) {
        if let Some(tunnel) = tunnel_finder(id) {
            tunnel.send_message(message);
        }
    }

    /// Sends a sync message to one watcher, if connected
    pub fn send_state<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        state: &SyncMessage,
        id: Id,
        tunnel_finder: F,
    ) {
        if let Some(tunnel) = tunnel_finder(id) {
            tunnel.send_state(state);
        }
    }

    /// The display name of a participant
    pub fn get_name(&self, id: Id) -> Option<String> {
        match self.roles.get(&id)? {
            Value::Participant(participant) => Some(participant.name.clone()),
            _ => None,
        }
    }

    /// Broadcasts an update to every connected watcher, unassigned ones included
    ///
    /// Round events go to everyone so a client that has not joined yet
    /// still tracks the live round.
    pub fn announce<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        message: &UpdateMessage,
        tunnel_finder: F,
    ) {
        for (_, tunnel) in self.connected(tunnel_finder) {
            tunnel.send_message(message);
        }
    }

    /// Broadcasts an update to the connected watchers of one kind
    pub fn announce_specific<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        kind: ValueKind,
        message: &UpdateMessage,
        tunnel_finder: F,
    ) {
        for (_, tunnel) in self.connected_of(kind, tunnel_finder) {
            tunnel.send_message(message);
        }
    }
}
