//! Tokio event loop around a [`Coordinator`]
//!
//! [`spawn`] starts one task that owns the session and processes
//! commands strictly in arrival order, so answers, alarms and connection
//! changes never interleave. Clients interact through a cloneable
//! [`Handle`]; each connection receives its outbound messages as JSON
//! strings on its own unbounded channel.
//!
//! Round deadlines are tokio sleep tasks that post an alarm back into the
//! command channel. They hold only a weak sender, so once every
//! [`Handle`] is dropped the loop ends even with deadlines pending.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender},
    task::{AbortHandle, JoinHandle},
};
use web_time::SystemTime;

use crate::{
    AlarmMessage, SyncMessage, UpdateMessage,
    config::Options,
    coordinator::{Coordinator, IncomingMessage},
    poll::{self, PollId},
    session::{Scheduler, Tunnel},
    watcher::Id,
};

/// Errors returned by [`Handle`]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The event loop is no longer running
    #[error("poll session has stopped")]
    Stopped,
}

#[derive(Debug)]
enum Command {
    Connect {
        id: Id,
        serial: u64,
        tunnel: ChannelTunnel,
    },
    Message {
        id: Id,
        message: IncomingMessage,
    },
    Disconnect {
        id: Id,
        serial: u64,
    },
    Alarm(AlarmMessage),
}

/// A [`Tunnel`] that serializes messages onto an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelTunnel(UnboundedSender<String>);

impl Tunnel for ChannelTunnel {
    fn send_message(&self, message: &UpdateMessage) {
        if self.0.send(message.to_message()).is_err() {
            tracing::trace!("update dropped for closed connection");
        }
    }

    fn send_state(&self, state: &SyncMessage) {
        if self.0.send(state.to_message()).is_err() {
            tracing::trace!("state dropped for closed connection");
        }
    }

    fn close(self) {}
}

/// One client connection to a running session
#[derive(Debug)]
pub struct Connection {
    /// The identity the session knows this connection by
    pub id: Id,
    /// Outbound JSON messages; ends when the session closes the connection
    pub receiver: UnboundedReceiver<String>,
    serial: u64,
}

/// Client side of a running session
#[derive(Debug, Clone)]
pub struct Handle {
    commands: UnboundedSender<Command>,
    presenter: Id,
    serials: Arc<AtomicU64>,
}

impl Handle {
    /// The presenter's identity; connect with it to act as presenter
    pub fn presenter_id(&self) -> Id {
        self.presenter
    }

    /// Opens a connection
    ///
    /// Passing the id of a known watcher resumes that identity and
    /// replaces its previous connection, which is closed. Any other id,
    /// or `None`, joins as a new unassigned watcher.
    ///
    /// # Errors
    ///
    /// Returns `Error::Stopped` if the event loop has ended.
    pub fn connect(&self, claim: Option<Id>) -> Result<Connection, Error> {
        let id = claim.unwrap_or_default();
        let serial = self.serials.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();

        self.command(Command::Connect {
            id,
            serial,
            tunnel: ChannelTunnel(sender),
        })?;

        Ok(Connection {
            id,
            receiver,
            serial,
        })
    }

    /// Delivers a parsed message from a connection
    ///
    /// # Errors
    ///
    /// Returns `Error::Stopped` if the event loop has ended.
    pub fn send(&self, id: Id, message: IncomingMessage) -> Result<(), Error> {
        self.command(Command::Message { id, message })
    }

    /// Delivers a raw JSON message from a connection
    ///
    /// Text that does not parse as an [`IncomingMessage`] is dropped.
    ///
    /// # Errors
    ///
    /// Returns `Error::Stopped` if the event loop has ended.
    pub fn send_text(&self, id: Id, text: &str) -> Result<(), Error> {
        match serde_json::from_str(text) {
            Ok(message) => self.send(id, message),
            Err(e) => {
                tracing::debug!(watcher = %id, error = %e, "malformed message dropped");
                Ok(())
            }
        }
    }

    /// Ends a connection
    ///
    /// A participant or the presenter keeps its identity and can reconnect
    /// with [`Handle::connect`]; a connection that never joined is
    /// forgotten. Disconnecting a connection that was already
    /// replaced by a newer one has no effect on the newer one.
    ///
    /// # Errors
    ///
    /// Returns `Error::Stopped` if the event loop has ended.
    pub fn disconnect(&self, connection: Connection) -> Result<(), Error> {
        self.command(Command::Disconnect {
            id: connection.id,
            serial: connection.serial,
        })
    }

    fn command(&self, command: Command) -> Result<(), Error> {
        self.commands.send(command).map_err(|_| Error::Stopped)
    }
}

/// Starts a poll session on the current tokio runtime
///
/// The returned task finishes once every [`Handle`] clone is dropped.
///
/// # Errors
///
/// Returns `poll::Error::Invalid` if `options` fail validation.
///
/// # Panics
///
/// Panics if called outside of a tokio runtime.
pub fn spawn(options: Options) -> Result<(Handle, JoinHandle<()>), poll::Error> {
    let options = options.validated()?;
    let presenter = Id::new();
    let (commands, receiver) = mpsc::unbounded_channel();

    let engine = Engine {
        coordinator: Coordinator::new(options, presenter),
        links: HashMap::new(),
        timers: HashMap::new(),
        commands: commands.downgrade(),
        receiver,
    };

    tracing::info!(presenter = %presenter, "poll session started");

    let task = tokio::spawn(engine.run());

    Ok((
        Handle {
            commands,
            presenter,
            serials: Arc::new(AtomicU64::new(0)),
        },
        task,
    ))
}

#[derive(Debug)]
struct Link {
    serial: u64,
    tunnel: ChannelTunnel,
}

struct Engine {
    coordinator: Coordinator,
    links: HashMap<Id, Link>,
    timers: HashMap<PollId, AbortHandle>,
    commands: WeakUnboundedSender<Command>,
    receiver: UnboundedReceiver<Command>,
}

struct TimerScheduler<'a> {
    timers: &'a mut HashMap<PollId, AbortHandle>,
    commands: &'a WeakUnboundedSender<Command>,
}

impl Scheduler for TimerScheduler<'_> {
    fn schedule(&mut self, alarm: AlarmMessage, after: Duration) {
        let commands = self.commands.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(commands) = commands.upgrade() {
                if commands.send(Command::Alarm(alarm)).is_err() {
                    tracing::trace!(poll_id = %alarm.poll_id(), "alarm fired after shutdown");
                }
            }
        });

        if let Some(previous) = self.timers.insert(alarm.poll_id(), task.abort_handle()) {
            previous.abort();
        }
    }

    fn cancel(&mut self, alarm: &AlarmMessage) {
        if let Some(timer) = self.timers.remove(&alarm.poll_id()) {
            timer.abort();
        }
    }
}

impl Engine {
    async fn run(mut self) {
        while let Some(command) = self.receiver.recv().await {
            self.handle(command);
        }

        for (_, timer) in self.timers.drain() {
            timer.abort();
        }

        tracing::info!("poll session stopped");
    }

    fn handle(&mut self, command: Command) {
        let now = SystemTime::now();

        match command {
            Command::Connect { id, serial, tunnel } => {
                if let Some(previous) = self.links.insert(id, Link { serial, tunnel }) {
                    previous.tunnel.close();
                }

                let links = &self.links;
                let tunnel_finder = |id: Id| links.get(&id).map(|link| link.tunnel.clone());

                if self.coordinator.watchers.has_watcher(id) {
                    self.coordinator.update_session(id, now, tunnel_finder);
                } else if let Err(e) = self.coordinator.add_unassigned(id, now, tunnel_finder) {
                    tracing::debug!(watcher = %id, error = %e, "connection refused");
                }
            }
            Command::Message { id, message } => {
                if !self.links.contains_key(&id) {
                    return;
                }

                let links = &self.links;
                let mut scheduler = TimerScheduler {
                    timers: &mut self.timers,
                    commands: &self.commands,
                };
                self.coordinator
                    .receive_message(id, message, now, &mut scheduler, |id| {
                        links.get(&id).map(|link| link.tunnel.clone())
                    });
            }
            Command::Disconnect { id, serial } => {
                match self.links.get(&id) {
                    Some(link) if link.serial == serial => {
                        self.links.remove(&id);
                    }
                    _ => return,
                }

                let links = &self.links;
                let mut scheduler = TimerScheduler {
                    timers: &mut self.timers,
                    commands: &self.commands,
                };
                self.coordinator
                    .disconnect(id, now, &mut scheduler, |id| {
                        links.get(&id).map(|link| link.tunnel.clone())
                    });
            }
            Command::Alarm(alarm) => {
                self.timers.remove(&alarm.poll_id());

                let links = &self.links;
                let mut scheduler = TimerScheduler {
                    timers: &mut self.timers,
                    commands: &self.commands,
                };
                self.coordinator
                    .receive_alarm(alarm, now, &mut scheduler, |id| {
                        links.get(&id).map(|link| link.tunnel.clone())
                    });
            }
        }

        // connections of watchers the session no longer knows are closed
        let watchers = &self.coordinator.watchers;
        self.links.retain(|id, _| watchers.has_watcher(*id));
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::constants::participant::MAX_COUNT;

    const JOIN_ADA: &str = r#"{"Unassigned":{"Join":"Ada"}}"#;
    const CREATE: &str =
        r#"{"Presenter":{"Create":{"question":"Pick one","options":["A","B"],"duration":10}}}"#;
    const ANSWER_A: &str = r#"{"Participant":{"SubmitAnswer":{"poll_id":"1","option":"A"}}}"#;

    fn drain(receiver: &mut UnboundedReceiver<String>) -> Vec<String> {
        let mut messages = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn closed(messages: &[String]) -> Vec<&String> {
        messages
            .iter()
            .filter(|m| m.starts_with(r#"{"PollClosed":"#))
            .collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_closes_round_once() {
        let (handle, _task) = spawn(Options::default()).unwrap();
        let mut presenter = handle.connect(Some(handle.presenter_id())).unwrap();
        let mut ada = handle.connect(None).unwrap();
        handle.send_text(ada.id, JOIN_ADA).unwrap();
        handle.send_text(presenter.id, CREATE).unwrap();
        settle().await;

        let messages = drain(&mut ada.receiver);
        assert!(messages.iter().any(|m| m.starts_with(r#"{"PollStarted":"#)));
        drain(&mut presenter.receiver);

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(closed(&drain(&mut ada.receiver)).is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let messages = drain(&mut ada.receiver);
        assert_eq!(
            closed(&messages),
            vec![r#"{"PollClosed":{"poll_id":"1","tally":{"A":0,"B":0},"reason":"Timeout"}}"#]
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(drain(&mut ada.receiver).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_everyone_answered_closes_early() {
        let (handle, _task) = spawn(Options::default()).unwrap();
        let presenter = handle.connect(Some(handle.presenter_id())).unwrap();
        let mut ada = handle.connect(None).unwrap();
        handle.send_text(ada.id, JOIN_ADA).unwrap();
        handle.send_text(presenter.id, CREATE).unwrap();
        settle().await;
        drain(&mut ada.receiver);

        handle.send_text(ada.id, ANSWER_A).unwrap();
        settle().await;

        let messages = drain(&mut ada.receiver);
        assert_eq!(
            messages,
            vec![
                r#"{"TallyUpdated":{"poll_id":"1","tally":{"A":1,"B":0}}}"#,
                r#"{"PollClosed":{"poll_id":"1","tally":{"A":1,"B":0},"reason":"Complete"}}"#,
            ]
        );

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(closed(&drain(&mut ada.receiver)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_text_is_dropped() {
        let (handle, _task) = spawn(Options::default()).unwrap();
        let mut viewer = handle.connect(None).unwrap();
        settle().await;
        drain(&mut viewer.receiver);

        handle.send_text(viewer.id, "{not json").unwrap();
        handle
            .send_text(
                viewer.id,
                r#"{"Presenter":{"Create":{"question":"Q","options":["A","B"],"duration":1.5}}}"#,
            )
            .unwrap();
        handle.send_text(viewer.id, r#"{"Request":"State"}"#).unwrap();
        settle().await;

        assert_eq!(drain(&mut viewer.receiver), vec![r#"{"State":"Idle"}"#]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replaces_connection() {
        let (handle, _task) = spawn(Options::default()).unwrap();
        let mut first = handle.connect(None).unwrap();
        handle.send_text(first.id, JOIN_ADA).unwrap();
        settle().await;

        let mut second = handle.connect(Some(first.id)).unwrap();
        settle().await;

        drain(&mut first.receiver);
        assert!(first.receiver.recv().await.is_none());
        assert_eq!(
            drain(&mut second.receiver),
            vec![r#"{"NameAssign":"Ada"}"#, r#"{"State":"Idle"}"#]
        );

        handle.disconnect(first).unwrap();
        handle.send_text(second.id, r#"{"Request":"Archive"}"#).unwrap();
        settle().await;
        assert_eq!(drain(&mut second.receiver), vec![r#"{"Archive":[]}"#]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kicked_connection_is_closed() {
        let (handle, _task) = spawn(Options::default()).unwrap();
        let presenter = handle.connect(Some(handle.presenter_id())).unwrap();
        let mut ada = handle.connect(None).unwrap();
        handle.send_text(ada.id, JOIN_ADA).unwrap();
        handle
            .send_text(presenter.id, r#"{"Presenter":{"Kick":"Ada"}}"#)
            .unwrap();
        settle().await;

        let messages = drain(&mut ada.receiver);
        assert_eq!(messages.last().map(String::as_str), Some(r#""Kicked""#));
        assert!(ada.receiver.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_churn_leaves_room() {
        let (handle, _task) = spawn(Options::default()).unwrap();

        for round in 0..=MAX_COUNT {
            let lurker = handle.connect(None).unwrap();
            handle.disconnect(lurker).unwrap();

            let guest = handle.connect(None).unwrap();
            let join = format!(r#"{{"Unassigned":{{"Join":"guest{round}"}}}}"#);
            handle.send_text(guest.id, &join).unwrap();
            handle.disconnect(guest).unwrap();
        }
        settle().await;

        let mut fresh = handle.connect(None).unwrap();
        settle().await;

        let messages = drain(&mut fresh.receiver);
        assert_eq!(messages.len(), 3);
        assert!(messages[0].starts_with(r#"{"IdAssign":"#));
        assert_eq!(messages[1], r#""NameChoose""#);
        assert_eq!(messages[2], r#"{"State":"Idle"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handles_stops_session() {
        let (handle, task) = spawn(Options::default()).unwrap();
        let presenter = handle.connect(Some(handle.presenter_id())).unwrap();
        handle.send_text(presenter.id, CREATE).unwrap();
        settle().await;

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_options_are_refused() {
        let options = Options {
            archive_capacity: 0,
            ..Options::default()
        };
        assert!(spawn(options).is_err());
    }
}
