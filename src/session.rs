//! Seams between the engine and its host
//!
//! The engine never performs I/O itself. Outbound messages go through a
//! [`Tunnel`] per connection and round deadlines go through a
//! [`Scheduler`], both supplied by whoever drives the engine.

use std::time::Duration;

use super::{AlarmMessage, SyncMessage, UpdateMessage};

/// Trait for sending messages through a communication tunnel
///
/// Delivery is fire-and-forget: an implementation must never block or
/// report failure back into the engine.
pub trait Tunnel {
    /// Sends an update message to the client
    ///
    /// Update messages notify clients about changes that affect their
    /// current view or state.
    fn send_message(&self, message: &UpdateMessage);

    /// Sends a state synchronization message to the client
    ///
    /// Sync messages carry point-in-time state, typically on connect,
    /// reconnect, or an explicit request.
    fn send_state(&self, state: &SyncMessage);

    /// Closes the communication tunnel
    fn close(self);
}

/// Trait for arming and disarming timed alarms
///
/// Alarms come back into the engine through
/// [`Coordinator::receive_alarm`](crate::coordinator::Coordinator::receive_alarm).
/// The engine tolerates an alarm that fires after it was cancelled, so
/// `cancel` only needs to be best effort.
pub trait Scheduler {
    /// Arms `alarm` to fire once after `after` has elapsed
    fn schedule(&mut self, alarm: AlarmMessage, after: Duration);

    /// Disarms a previously scheduled alarm
    fn cancel(&mut self, alarm: &AlarmMessage);
}
