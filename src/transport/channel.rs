//! Command/response correlation and liveness bookkeeping.
//!
//! ESP3 responses carry no request identifier, so the link keeps exactly one
//! command in flight. [`CommandSlot`] is that single slot; [`CommandChannel`]
//! is the cloneable handle callers use to queue work for the link task.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::commands::{
    IdBase, Outgoing, VersionInfo, check_response, id_base_command, learn_mode_command,
    reset_command, version_command,
};
use super::packet::Packet;
use crate::core::CommandError;

/// Reply continuation for a queued command.
pub(crate) type Reply = oneshot::Sender<Result<Packet, CommandError>>;

/// Work queued for the link task.
#[derive(Debug)]
pub(crate) enum LinkRequest {
    /// Send and wait for the RESPONSE.
    Command {
        packet: Packet,
        timeout: Duration,
        reply: Reply,
    },
    /// Send without waiting for a result.
    Post(Outgoing),
}

/// Who is waiting for the in-flight response.
#[derive(Debug)]
pub enum Waiter {
    /// A caller awaiting the response.
    Caller(oneshot::Sender<Result<Packet, CommandError>>),
    /// The liveness probe.
    Probe,
    /// A fire-and-forget packet; the response only frees the slot.
    Detached,
}

/// What happened to the in-flight command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    /// Nothing was in flight.
    Empty,
    /// A caller was answered.
    Caller,
    /// A detached command finished.
    Detached,
    /// The liveness probe finished; `answered` is false on timeout or cancel.
    Probe {
        /// Whether the module responded.
        answered: bool,
    },
}

#[derive(Debug)]
struct InFlight {
    waiter: Waiter,
    deadline: Instant,
}

/// The single in-flight command slot.
///
/// Urgent packets may be written while a command is in flight. Their
/// responses arrive after the in-flight one and are counted as `trailing`;
/// no new command is sent until they are in or have timed out.
#[derive(Debug, Default)]
pub struct CommandSlot {
    in_flight: Option<InFlight>,
    trailing: u32,
    trailing_deadline: Option<Instant>,
}

impl CommandSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a new command may be sent.
    pub fn is_free(&self) -> bool {
        self.in_flight.is_none() && self.trailing == 0
    }

    /// Responses still expected for packets written past the slot.
    pub fn trailing(&self) -> u32 {
        self.trailing
    }

    /// Next instant something in the slot times out.
    pub fn deadline(&self) -> Option<Instant> {
        match &self.in_flight {
            Some(f) => Some(f.deadline),
            None => self.trailing_deadline,
        }
    }

    /// Occupy the slot after writing a command.
    ///
    /// An occupied slot is cancelled first, so its waiter sees
    /// [`CommandError::Timeout`] rather than someone else's response.
    pub fn occupy(&mut self, waiter: Waiter, deadline: Instant) {
        if self.in_flight.is_some() {
            self.take_in_flight(Err(CommandError::Timeout));
        }
        self.in_flight = Some(InFlight { waiter, deadline });
    }

    /// Record a written packet whose RESPONSE nobody waits for.
    ///
    /// An idle slot is occupied as [`Waiter::Detached`]; otherwise the
    /// response is expected after the ones already pending.
    pub fn expect_response(&mut self, deadline: Instant) {
        if self.is_free() {
            self.in_flight = Some(InFlight {
                waiter: Waiter::Detached,
                deadline,
            });
            return;
        }
        self.trailing += 1;
        let latest = self.trailing_deadline.map_or(deadline, |d| d.max(deadline));
        self.trailing_deadline = Some(latest);
    }

    /// Hand a RESPONSE to the waiter and free the slot.
    pub fn complete(&mut self, response: Packet) -> SlotOutcome {
        if self.in_flight.is_some() {
            return self.take_in_flight(Ok(response));
        }
        if self.trailing > 0 {
            self.trailing -= 1;
            if self.trailing == 0 {
                self.trailing_deadline = None;
            }
            return SlotOutcome::Detached;
        }
        SlotOutcome::Empty
    }

    /// Time out the in-flight command if its deadline has passed.
    ///
    /// Trailing responses are given up once the in-flight command is gone
    /// and their deadline has passed.
    pub fn expire(&mut self, now: Instant) -> SlotOutcome {
        let in_flight_due = self.in_flight.as_ref().map(|f| f.deadline <= now);
        match (in_flight_due, self.trailing_deadline) {
            (Some(true), _) => self.take_in_flight(Err(CommandError::Timeout)),
            (None, Some(d)) if d <= now => {
                self.clear_trailing();
                SlotOutcome::Detached
            }
            _ => SlotOutcome::Empty,
        }
    }

    /// Fail the in-flight command with `error` and forget trailing
    /// responses. Idempotent.
    pub fn cancel(&mut self, error: CommandError) -> SlotOutcome {
        self.clear_trailing();
        self.take_in_flight(Err(error))
    }

    fn clear_trailing(&mut self) {
        self.trailing = 0;
        self.trailing_deadline = None;
    }

    /// `Ok` carries the module's RESPONSE, `Err` the reason nothing came.
    fn take_in_flight(&mut self, response: Result<Packet, CommandError>) -> SlotOutcome {
        match self.in_flight.take() {
            None => SlotOutcome::Empty,
            Some(InFlight { waiter, .. }) => match waiter {
                Waiter::Caller(reply) => {
                    let _ = reply.send(response.and_then(check_response));
                    SlotOutcome::Caller
                }
                Waiter::Probe => SlotOutcome::Probe {
                    answered: response.is_ok(),
                },
                Waiter::Detached => SlotOutcome::Detached,
            },
        }
    }
}

/// Result of recording a liveness probe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessVerdict {
    /// Keep going.
    Healthy,
    /// Hard-reset the transport; `attempt` counts from 1.
    Reset {
        /// Consecutive reset attempt.
        attempt: u32,
    },
    /// Too many resets without recovery.
    Exhausted,
}

/// Counts probe misses and hard resets.
#[derive(Debug, Clone)]
pub struct Liveness {
    retries: u32,
    max_resets: u32,
    misses: u32,
    resets: u32,
}

impl Liveness {
    /// Escalate after `retries` consecutive misses, give up after `max_resets` resets.
    pub fn new(retries: u32, max_resets: u32) -> Self {
        Self {
            retries: retries.max(1),
            max_resets,
            misses: 0,
            resets: 0,
        }
    }

    /// Consecutive misses so far.
    pub fn misses(&self) -> u32 {
        self.misses
    }

    /// Consecutive resets so far.
    pub fn resets(&self) -> u32 {
        self.resets
    }

    /// The module answered a probe.
    pub fn record_success(&mut self) {
        self.misses = 0;
        self.resets = 0;
    }

    /// A probe went unanswered.
    pub fn record_miss(&mut self) -> LivenessVerdict {
        self.misses += 1;
        if self.misses < self.retries {
            return LivenessVerdict::Healthy;
        }
        self.misses = 0;
        self.begin_reset()
    }

    /// Count a hard reset attempt.
    pub fn begin_reset(&mut self) -> LivenessVerdict {
        if self.resets >= self.max_resets {
            return LivenessVerdict::Exhausted;
        }
        self.resets += 1;
        LivenessVerdict::Reset {
            attempt: self.resets,
        }
    }
}

/// Cloneable handle for sending commands through the link task.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    tx: mpsc::Sender<LinkRequest>,
    urgent: mpsc::Sender<Outgoing>,
    timeout: Duration,
}

impl CommandChannel {
    pub(crate) fn new(
        tx: mpsc::Sender<LinkRequest>,
        urgent: mpsc::Sender<Outgoing>,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            urgent,
            timeout,
        }
    }

    /// Default response timeout for [`request`](Self::request).
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the link task is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Send a command and wait for an OK response.
    pub async fn request(&self, packet: Packet) -> Result<Packet, CommandError> {
        self.request_with_timeout(packet, self.timeout).await
    }

    /// Send a command with an explicit response timeout.
    pub async fn request_with_timeout(
        &self,
        packet: Packet,
        timeout: Duration,
    ) -> Result<Packet, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LinkRequest::Command {
                packet,
                timeout,
                reply,
            })
            .await
            .map_err(|_| CommandError::ChannelClosed)?;
        rx.await.map_err(|_| CommandError::ChannelClosed)?
    }

    /// Queue a packet without waiting for its response.
    ///
    /// [Urgent](Outgoing::is_urgent) packets are written even while a
    /// command is in flight; the rest wait their turn like commands.
    pub async fn post(&self, outgoing: Outgoing) -> Result<(), CommandError> {
        if outgoing.is_urgent() {
            return self
                .urgent
                .send(outgoing)
                .await
                .map_err(|_| CommandError::ChannelClosed);
        }
        self.tx
            .send(LinkRequest::Post(outgoing))
            .await
            .map_err(|_| CommandError::ChannelClosed)
    }

    /// Read the module's version information.
    pub async fn read_version(&self) -> Result<VersionInfo, CommandError> {
        let response = self.request(version_command()).await?;
        VersionInfo::parse(&response)
    }

    /// Read the module's ID base.
    pub async fn read_id_base(&self) -> Result<IdBase, CommandError> {
        let response = self.request(id_base_command()).await?;
        IdBase::parse(&response)
    }

    /// Software-reset the module.
    pub async fn reset(&self) -> Result<(), CommandError> {
        self.request(reset_command()).await.map(|_| ())
    }

    /// Switch smart-ack learn mode.
    pub async fn set_learn_mode(
        &self,
        enable: bool,
        timeout: Duration,
    ) -> Result<(), CommandError> {
        self.request(learn_mode_command(enable, timeout))
            .await
            .map(|_| ())
    }
}
