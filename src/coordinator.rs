//! Session coordination
//!
//! This module contains the [`Coordinator`], which ties the poll state
//! ([`SessionStore`]) to the people watching it ([`Watchers`]). It routes
//! incoming messages by the sender's role, arms and disarms round
//! deadlines, and broadcasts every state change to connected clients.
//!
//! A round can end from two directions: its deadline alarm, or every
//! connected participant having answered. Both lead into
//! [`Coordinator::close`], which only acts on the round that is still
//! active, so whichever edge comes second is a no-op.

use garde::Validate;
use itertools::Itertools;
use serde::Deserialize;
use web_time::SystemTime;

use super::{
    AlarmMessage, SyncMessage, TruncatedVec, UpdateMessage,
    archive::{Archive, ArchivedPoll},
    config::{Options, RoundPolicy},
    constants::participant::LIST_LIMIT,
    names::{self, Names},
    poll::{self, CloseReason, Poll, PollConfig, PollId, Tally},
    registrar::{Accepted, Rejection},
    session::{Scheduler, Tunnel},
    snapshot::Snapshot,
    store::SessionStore,
    watcher::{self, Id, ParticipantValue, Value, ValueKind, Watchers},
};

/// Messages received from connected clients
///
/// This enum categorizes incoming messages based on the sender's role,
/// ensuring that only appropriate messages are processed from each
/// watcher type.
#[derive(Debug, Deserialize, Clone)]
pub enum IncomingMessage {
    /// Messages from the presenter
    Presenter(IncomingPresenterMessage),
    /// Messages from connections that have not joined yet
    Unassigned(IncomingUnassignedMessage),
    /// Messages from named participants
    Participant(IncomingParticipantMessage),
    /// Read-only requests, accepted from anyone
    Request(IncomingRequestMessage),
}

impl IncomingMessage {
    /// Validates that a message matches the sender's role
    ///
    /// # Arguments
    ///
    /// * `sender_kind` - The role of the watcher sending the message
    ///
    /// # Returns
    ///
    /// `true` if the sender may send this message, `false` otherwise
    fn follows(&self, sender_kind: ValueKind) -> bool {
        matches!(
            (self, sender_kind),
            (IncomingMessage::Presenter(_), ValueKind::Presenter)
                | (IncomingMessage::Participant(_), ValueKind::Participant)
                | (IncomingMessage::Unassigned(_), ValueKind::Unassigned)
                | (IncomingMessage::Request(_), _)
        )
    }
}

/// Messages that can be sent by the presenter
#[derive(Debug, Deserialize, Clone)]
pub enum IncomingPresenterMessage {
    /// Open a new round
    Create(PollConfig),
    /// End the active round now
    CloseRound,
    /// Remove a participant by display name
    Kick(String),
}

/// Messages that can be sent by connections that have not joined yet
#[derive(Debug, Deserialize, Clone)]
pub enum IncomingUnassignedMessage {
    /// Request a display name and become a participant
    Join(String),
}

/// Messages that can be sent by participants
#[derive(Debug, Deserialize, Clone)]
pub enum IncomingParticipantMessage {
    /// Answer the round `poll_id` with `option`
    SubmitAnswer {
        /// The round being answered
        poll_id: PollId,
        /// The chosen option label
        option: String,
    },
}

/// Read-only requests
#[derive(Debug, Deserialize, Clone, Copy)]
pub enum IncomingRequestMessage {
    /// Request the current state snapshot
    State,
    /// Request the completed-round history
    Archive,
}

/// A single live poll session
///
/// Owns all poll state, the watcher registry and the display names.
/// Every method that changes state takes a `tunnel_finder` to reach
/// connected clients, and those that touch round deadlines take a
/// [`Scheduler`].
#[derive(Debug)]
pub struct Coordinator {
    /// Poll state
    store: SessionStore,
    /// Everyone watching the session
    pub watchers: Watchers,
    /// Participant display names
    names: Names,
    /// Session behavior switches
    options: Options,
}

impl Coordinator {
    /// Creates an idle session owned by `presenter_id`
    pub fn new(options: Options, presenter_id: Id) -> Self {
        Self {
            store: SessionStore::new(Archive::with_capacity(options.archive_capacity)),
            watchers: Watchers::with_presenter_id(presenter_id),
            names: Names::default(),
            options,
        }
    }

    /// The options the session was created with
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Captures the current state as seen at `now`
    pub fn snapshot(&self, now: SystemTime) -> Snapshot {
        self.store.snapshot(now)
    }

    /// Completed rounds, most recent first
    pub fn archive(&self) -> &[ArchivedPoll] {
        self.store.archive().list()
    }

    /// The open round, if any
    pub fn active_poll(&self) -> Option<&Poll> {
        self.store.active().map(|round| round.poll())
    }

    // Rounds

    /// Opens a new round and broadcasts it
    ///
    /// The definition is validated before anything changes. If a round is
    /// already active, the session's [`RoundPolicy`] decides what happens
    /// to it: under `Supersede` it is discarded without being archived,
    /// under `RequireCompletion` it is archived as complete when everyone
    /// connected has answered, or when no participant is connected, and
    /// the request is refused otherwise.
    ///
    /// # Arguments
    ///
    /// * `config` - The poll definition
    /// * `now` - Current time, used as the round's start time
    /// * `scheduler` - Arms the round's deadline
    /// * `tunnel_finder` - Function to find communication tunnels for watchers
    ///
    /// # Errors
    ///
    /// * `poll::Error::Invalid` - The definition failed validation
    /// * `poll::Error::RoundInProgress` - The policy forbids replacing the active round yet
    ///
    /// # Type Parameters
    ///
    /// * `T` - Type implementing the Tunnel trait for watcher communication
    /// * `F` - Function type for finding tunnels by watcher ID
    /// * `S` - Type implementing the Scheduler trait for deadlines
    pub fn create<T: Tunnel, F: Fn(Id) -> Option<T>, S: Scheduler>(
        &mut self,
        config: PollConfig,
        now: SystemTime,
        scheduler: &mut S,
        tunnel_finder: F,
    ) -> Result<Poll, poll::Error> {
        config.validate()?;

        if let Some(active_id) = self.store.active_id() {
            match self.options.round_policy {
                RoundPolicy::Supersede => {
                    scheduler.cancel(&AlarmMessage::Deadline(active_id));
                    self.store.discard();
                    tracing::info!(poll_id = %active_id, "round superseded");
                }
                RoundPolicy::RequireCompletion => {
                    let connected = self.watchers.connected_participants(&tunnel_finder);
                    // an empty room has nobody left to wait for
                    if !connected.is_empty() && !self.store.is_complete(&connected) {
                        return Err(poll::Error::RoundInProgress);
                    }
                    self.close(
                        active_id,
                        CloseReason::Complete,
                        now,
                        scheduler,
                        &tunnel_finder,
                    );
                }
            }
        }

        let poll = self.store.open(config, now);
        scheduler.schedule(AlarmMessage::Deadline(poll.id()), poll.duration());

        tracing::info!(
            poll_id = %poll.id(),
            options = poll.options().len(),
            duration_secs = poll.duration().as_secs(),
            "round opened"
        );

        self.watchers
            .announce(&UpdateMessage::PollStarted(poll.clone()), tunnel_finder);

        Ok(poll)
    }

    /// Counts a participant's answer and broadcasts the new tally
    ///
    /// When the answer completes the round for everyone connected and
    /// early closing is enabled, the round is closed right away.
    ///
    /// # Errors
    ///
    /// Any [`Rejection`]; a rejected answer changes nothing and
    /// broadcasts nothing.
    ///
    /// # Type Parameters
    ///
    /// * `T` - Type implementing the Tunnel trait for watcher communication
    /// * `F` - Function type for finding tunnels by watcher ID
    /// * `S` - Type implementing the Scheduler trait for deadlines
    pub fn submit<T: Tunnel, F: Fn(Id) -> Option<T>, S: Scheduler>(
        &mut self,
        participant: Id,
        option: &str,
        poll_id: PollId,
        now: SystemTime,
        scheduler: &mut S,
        tunnel_finder: F,
    ) -> Result<Tally, Rejection> {
        let connected = self.watchers.connected_participants(&tunnel_finder);
        let Accepted { tally, complete } =
            self.store.submit(participant, option, poll_id, now, &connected)?;

        self.watchers.announce(
            &UpdateMessage::TallyUpdated {
                poll_id,
                tally: tally.clone(),
            },
            &tunnel_finder,
        );

        if complete && self.options.early_close {
            self.close(poll_id, CloseReason::Complete, now, scheduler, tunnel_finder);
        }

        Ok(tally)
    }

    /// Ends the round `poll_id`, archives it and broadcasts the final tally
    ///
    /// Does nothing unless `poll_id` is the active round, which makes it
    /// safe to reach from both the deadline and early completion.
    ///
    /// # Returns
    ///
    /// The archived round, if this call closed it
    ///
    /// # Type Parameters
    ///
    /// * `T` - Type implementing the Tunnel trait for watcher communication
    /// * `F` - Function type for finding tunnels by watcher ID
    /// * `S` - Type implementing the Scheduler trait for deadlines
    pub fn close<T: Tunnel, F: Fn(Id) -> Option<T>, S: Scheduler>(
        &mut self,
        poll_id: PollId,
        reason: CloseReason,
        now: SystemTime,
        scheduler: &mut S,
        tunnel_finder: F,
    ) -> Option<ArchivedPoll> {
        let archived = self.store.close(poll_id, reason, now)?;
        scheduler.cancel(&AlarmMessage::Deadline(poll_id));

        tracing::info!(
            poll_id = %poll_id,
            reason = ?reason,
            votes = archived.tally().total(),
            "round closed"
        );

        self.watchers.announce(
            &UpdateMessage::PollClosed {
                poll_id,
                tally: archived.tally().clone(),
                reason,
            },
            tunnel_finder,
        );

        Some(archived)
    }

    /// Handles a fired alarm
    ///
    /// A deadline for a round that already ended, or was superseded, is
    /// ignored.
    pub fn receive_alarm<T: Tunnel, F: Fn(Id) -> Option<T>, S: Scheduler>(
        &mut self,
        message: AlarmMessage,
        now: SystemTime,
        scheduler: &mut S,
        tunnel_finder: F,
    ) {
        match message {
            AlarmMessage::Deadline(poll_id) => {
                if self
                    .close(poll_id, CloseReason::Timeout, now, scheduler, tunnel_finder)
                    .is_none()
                {
                    tracing::trace!(poll_id = %poll_id, "stale deadline ignored");
                }
            }
        }
    }

    /// Closes the active round if the connected participants have all answered
    fn check_completion<T: Tunnel, F: Fn(Id) -> Option<T>, S: Scheduler>(
        &mut self,
        now: SystemTime,
        scheduler: &mut S,
        tunnel_finder: F,
    ) {
        if !self.options.early_close {
            return;
        }
        let Some(poll_id) = self.store.active_id() else {
            return;
        };
        let connected = self.watchers.connected_participants(&tunnel_finder);
        if self.store.is_complete(&connected) {
            self.close(poll_id, CloseReason::Complete, now, scheduler, tunnel_finder);
        }
    }

    // Participants

    fn participants_message<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        tunnel_finder: F,
    ) -> TruncatedVec<String> {
        let participants = self
            .watchers
            .connected_of(ValueKind::Participant, tunnel_finder);
        let exact_count = participants.len();

        TruncatedVec::new(
            participants
                .into_iter()
                .filter_map(|(id, _)| self.watchers.get_name(id)),
            LIST_LIMIT,
            exact_count,
        )
    }

    fn announce_participants<T: Tunnel, F: Fn(Id) -> Option<T>>(&self, tunnel_finder: F) {
        self.watchers.announce_specific(
            ValueKind::Presenter,
            &UpdateMessage::Participants(self.participants_message(&tunnel_finder)),
            &tunnel_finder,
        );
    }

    /// Assigns a display name and promotes the watcher to participant
    fn assign_participant_name<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        watcher: Id,
        name: &str,
        tunnel_finder: F,
    ) -> Result<(), names::Error> {
        let name = self.names.set_name(watcher, name)?;

        self.watchers.update_watcher_value(
            watcher,
            Value::Participant(ParticipantValue { name: name.clone() }),
        );

        tracing::info!(participant = %watcher, name = %name, "participant joined");

        self.watchers.send_message(
            &UpdateMessage::NameAssign(name),
            watcher,
            &tunnel_finder,
        );
        self.announce_participants(&tunnel_finder);

        Ok(())
    }

    /// Removes a participant from the session by display name
    ///
    /// The participant is told, its tunnel is closed, and its identity and
    /// name are forgotten. Its answer to the active round stays counted.
    /// Since the set of connected participants shrinks, the round may now
    /// be complete.
    ///
    /// # Returns
    ///
    /// The id of the removed participant, if the name was known
    pub fn kick<T: Tunnel, F: Fn(Id) -> Option<T>, S: Scheduler>(
        &mut self,
        name: &str,
        now: SystemTime,
        scheduler: &mut S,
        tunnel_finder: F,
    ) -> Option<Id> {
        let Some(id) = self.names.get_id(name) else {
            tracing::debug!(name = %name, "kick for unknown name ignored");
            return None;
        };

        self.watchers
            .send_message(&UpdateMessage::Kicked, id, &tunnel_finder);
        self.watchers.close_session(id, &tunnel_finder);
        self.watchers.remove_watcher(id);
        self.names.remove(&id);

        tracing::info!(participant = %id, name = %name, "participant kicked");

        self.announce_participants(&tunnel_finder);
        self.check_completion(now, scheduler, &tunnel_finder);

        Some(id)
    }

    // Network

    /// Returns the message necessary to synchronize a watcher's view
    pub fn state_message(&self, now: SystemTime) -> SyncMessage {
        SyncMessage::State(self.snapshot(now))
    }

    /// Forgets disconnected participants that have nothing left to resume
    ///
    /// A participant whose answer to the active round is still on record
    /// is kept so it can reconnect into that round.
    ///
    /// # Returns
    ///
    /// The number of participants forgotten
    fn evict_disconnected<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        tunnel_finder: F,
    ) -> usize {
        let answered = |id: Id| {
            self.store
                .active()
                .is_some_and(|round| round.registrar().record(id).is_some())
        };
        let idle = self
            .watchers
            .disconnected_of(ValueKind::Participant, tunnel_finder)
            .into_iter()
            .filter(|id| !answered(*id))
            .collect_vec();

        for id in &idle {
            self.watchers.remove_watcher(*id);
            self.names.remove(id);
        }

        idle.len()
    }

    /// Adds a new unassigned connection to the session
    ///
    /// The connection receives its id, a prompt to choose a name, and the
    /// current state so it can render a round already in progress. When
    /// the session is full, disconnected participants without an answer
    /// in the active round are forgotten to make room.
    ///
    /// # Errors
    ///
    /// Returns `watcher::Error::MaximumParticipants` if the session is
    /// still full after that.
    pub fn add_unassigned<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        watcher: Id,
        now: SystemTime,
        tunnel_finder: F,
    ) -> Result<(), watcher::Error> {
        if self.watchers.is_full() {
            let evicted = self.evict_disconnected(&tunnel_finder);
            tracing::debug!(evicted, "session full, disconnected participants forgotten");
        }

        self.watchers.add_watcher(watcher, Value::Unassigned)?;

        self.watchers
            .send_message(&UpdateMessage::IdAssign(watcher), watcher, &tunnel_finder);
        self.watchers
            .send_message(&UpdateMessage::NameChoose, watcher, &tunnel_finder);
        self.watchers
            .send_state(&self.state_message(now), watcher, tunnel_finder);

        Ok(())
    }

    /// Resynchronizes a known watcher that (re)connected
    ///
    /// Every role receives the current state snapshot; the presenter also
    /// receives the participant list and participants are reminded of
    /// their name.
    pub fn update_session<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        watcher_id: Id,
        now: SystemTime,
        tunnel_finder: F,
    ) {
        let Some(watcher_value) = self.watchers.get_watcher_value(watcher_id) else {
            return;
        };

        match watcher_value {
            Value::Presenter => {
                self.watchers
                    .send_state(&self.state_message(now), watcher_id, &tunnel_finder);
                self.watchers.send_state(
                    &SyncMessage::Participants(self.participants_message(&tunnel_finder)),
                    watcher_id,
                    &tunnel_finder,
                );
            }
            Value::Participant(participant) => {
                self.watchers.send_message(
                    &UpdateMessage::NameAssign(participant.name),
                    watcher_id,
                    &tunnel_finder,
                );
                self.watchers
                    .send_state(&self.state_message(now), watcher_id, &tunnel_finder);
                self.announce_participants(&tunnel_finder);
            }
            Value::Unassigned => {
                self.watchers
                    .send_message(&UpdateMessage::NameChoose, watcher_id, &tunnel_finder);
                self.watchers
                    .send_state(&self.state_message(now), watcher_id, &tunnel_finder);
            }
        }
    }

    /// Handles a watcher losing its connection
    ///
    /// A connection that never joined has nothing to resume and is
    /// forgotten. Participants and the presenter keep their identity and
    /// name so they can reconnect. A participant no longer counts toward
    /// completion, so the round may now be complete. The `tunnel_finder`
    /// must already report the watcher as gone.
    pub fn disconnect<T: Tunnel, F: Fn(Id) -> Option<T>, S: Scheduler>(
        &mut self,
        watcher_id: Id,
        now: SystemTime,
        scheduler: &mut S,
        tunnel_finder: F,
    ) {
        let Some(watcher_value) = self.watchers.get_watcher_value(watcher_id) else {
            return;
        };

        tracing::debug!(watcher = %watcher_id, kind = ?watcher_value.kind(), "disconnected");

        match watcher_value {
            Value::Unassigned => {
                self.watchers.remove_watcher(watcher_id);
            }
            Value::Participant(_) => {
                self.announce_participants(&tunnel_finder);
                self.check_completion(now, scheduler, &tunnel_finder);
            }
            Value::Presenter => {}
        }
    }

    /// Handles incoming messages from watchers
    ///
    /// Messages that do not match the sender's role are dropped. Failures
    /// are reported only to the sender: create errors as
    /// `UpdateMessage::CreateError`, name errors as
    /// `UpdateMessage::NameError`. Rejected answers are not reported.
    ///
    /// # Arguments
    ///
    /// * `watcher_id` - ID of the watcher sending the message
    /// * `message` - The incoming message to process
    /// * `now` - Current time
    /// * `scheduler` - Arms and disarms round deadlines
    /// * `tunnel_finder` - Function to find communication tunnels for watchers
    ///
    /// # Type Parameters
    ///
    /// * `T` - Type implementing the Tunnel trait for watcher communication
    /// * `F` - Function type for finding tunnels by watcher ID
    /// * `S` - Type implementing the Scheduler trait for deadlines
    pub fn receive_message<T: Tunnel, F: Fn(Id) -> Option<T>, S: Scheduler>(
        &mut self,
        watcher_id: Id,
        message: IncomingMessage,
        now: SystemTime,
        scheduler: &mut S,
        tunnel_finder: F,
    ) {
        let Some(watcher_value) = self.watchers.get_watcher_value(watcher_id) else {
            return;
        };

        if !message.follows(watcher_value.kind()) {
            tracing::debug!(watcher = %watcher_id, kind = ?watcher_value.kind(), "message not allowed for role");
            return;
        }

        match message {
            IncomingMessage::Unassigned(IncomingUnassignedMessage::Join(name)) => {
                if let Err(e) = self.assign_participant_name(watcher_id, &name, &tunnel_finder) {
                    self.watchers.send_message(
                        &UpdateMessage::NameError(e),
                        watcher_id,
                        tunnel_finder,
                    );
                }
            }
            IncomingMessage::Presenter(IncomingPresenterMessage::Create(config)) => {
                if let Err(e) = self.create(config, now, scheduler, &tunnel_finder) {
                    tracing::debug!(error = %e, "create refused");
                    self.watchers.send_message(
                        &UpdateMessage::CreateError(e),
                        watcher_id,
                        tunnel_finder,
                    );
                }
            }
            IncomingMessage::Presenter(IncomingPresenterMessage::CloseRound) => {
                if let Some(poll_id) = self.store.active_id() {
                    self.close(poll_id, CloseReason::Complete, now, scheduler, tunnel_finder);
                }
            }
            IncomingMessage::Presenter(IncomingPresenterMessage::Kick(name)) => {
                self.kick(&name, now, scheduler, tunnel_finder);
            }
            IncomingMessage::Participant(IncomingParticipantMessage::SubmitAnswer {
                poll_id,
                option,
            }) => {
                if let Err(rejection) =
                    self.submit(watcher_id, &option, poll_id, now, scheduler, tunnel_finder)
                {
                    tracing::debug!(
                        participant = %watcher_id,
                        poll_id = %poll_id,
                        %rejection,
                        "answer rejected"
                    );
                }
            }
            IncomingMessage::Request(IncomingRequestMessage::State) => {
                self.watchers
                    .send_state(&self.state_message(now), watcher_id, tunnel_finder);
            }
            IncomingMessage::Request(IncomingRequestMessage::Archive) => {
                self.watchers.send_state(
                    &SyncMessage::Archive(self.archive().to_vec()),
                    watcher_id,
                    tunnel_finder,
                );
            }
        }
    }
}
