//! Operation / Phase engine
//!
//! An operation is one unit of work against one controller. Its handler owns
//! an explicit phase table: `poll(phase)` performs one exchange and names the
//! next phase, asks to run the same phase again, or finishes.
//!
//! Cleanup consumes the operation's handler, so it runs exactly once whatever
//! the outcome: success, failure, rejection at shutdown, or the operation
//! simply being dropped.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::completer::CompleterTicket;
use crate::error::{CommError, Result};
use crate::model::{CommLink, Controller, ControllerLock};
use crate::property::CommChannel;

/// Queue priority; earlier variants run first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Operator-initiated safety action
    Urgent,
    /// Device command (sign message, gate arm, camera switch)
    Command,
    /// Configuration download
    Download,
    /// Device data readback after a command
    DeviceData,
    /// Interval sample polls
    PollHigh,
    /// Status and diagnostic polls
    PollLow,
    /// Background listening; never preempts other work
    Idle,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Urgent => "urgent",
            Priority::Command => "command",
            Priority::Download => "download",
            Priority::DeviceData => "device_data",
            Priority::PollHigh => "poll_high",
            Priority::PollLow => "poll_low",
            Priority::Idle => "idle",
        };
        f.write_str(name)
    }
}

/// Transition returned by a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next<P> {
    /// Continue with another phase
    Goto(P),
    /// Run the same phase again (listen loop)
    ///
    /// The loop ends when the phase returns something else, when the
    /// handler's `max_cycles` is reached (treated as done), or when the link
    /// queue closes (fails with `QueueDrained`).
    Again,
    /// Terminal success
    Done,
}

/// Protocol-specific work driven by the engine
#[async_trait]
pub trait OpHandler: Send + Sized + 'static {
    /// Phase table key
    type Phase: Copy + fmt::Debug + Send + Sync + 'static;
    /// Value handed to the submitter on success
    type Output: Send + 'static;

    /// Short label for logs
    fn name(&self) -> &str;

    fn first_phase(&self) -> Self::Phase;

    /// Perform exactly one exchange for `phase`
    async fn poll(
        &mut self,
        phase: Self::Phase,
        chan: &mut CommChannel<'_>,
    ) -> Result<Next<Self::Phase>>;

    /// Bound on consecutive `Next::Again` cycles of one phase
    fn max_cycles(&self) -> Option<u32> {
        None
    }

    /// Commit decoded values to device state
    fn on_success(&mut self, controller: &Controller) {
        let _ = controller;
    }

    /// Record a fault against device state
    fn on_failure(&mut self, controller: &Controller, err: &CommError) {
        let _ = (controller, err);
    }

    fn into_output(self) -> Self::Output;
}

// ============================================================================
// Completion
// ============================================================================

/// Final report of an operation
#[derive(Debug)]
pub struct OpReport<T> {
    pub outcome: Result<T>,
    /// Retries consumed by transport errors
    pub retries: u32,
    /// Phase transitions completed
    pub phases: u32,
}

/// Submitter side of an operation's completion
///
/// Dropping it does not cancel the operation.
#[derive(Debug)]
pub struct Completion<T> {
    rx: oneshot::Receiver<OpReport<T>>,
}

impl<T> Completion<T> {
    /// Wait for the outcome
    pub async fn wait(self) -> Result<T> {
        self.report().await.outcome
    }

    /// Wait for the outcome with retry and phase counts
    pub async fn report(self) -> OpReport<T> {
        self.rx.await.unwrap_or(OpReport {
            outcome: Err(CommError::QueueDrained),
            retries: 0,
            phases: 0,
        })
    }
}

// ============================================================================
// Operation
// ============================================================================

/// Step result seen by the link worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Moved to another phase
    Continue,
    /// Same phase again
    Again,
    Done,
}

/// Type-erased operation held by a link queue
#[async_trait]
pub(crate) trait Job: Send {
    fn controller(&self) -> &Arc<Controller>;

    fn priority(&self) -> Priority;

    fn label(&self) -> String;

    async fn step(&mut self, chan: &mut CommChannel<'_>) -> Result<Step>;

    /// Consume one retry; false once the budget is spent
    fn take_retry(&mut self) -> bool;

    fn retries(&self) -> u32;

    fn max_retries(&self) -> u32;

    /// Terminal cleanup; runs the completion callbacks exactly once
    fn finish(self: Box<Self>, result: Result<()>);
}

/// One unit of work against one controller
pub struct Operation<H: OpHandler> {
    controller: Arc<Controller>,
    priority: Priority,
    exclusive: bool,
    max_retries: Option<u32>,
    handler: Option<H>,
    phase: H::Phase,
    retries: u32,
    phases: u32,
    cycles: u32,
    ticket: Option<CompleterTicket>,
    lock: Option<ControllerLock>,
    done: Option<oneshot::Sender<OpReport<H::Output>>>,
}

impl<H: OpHandler> fmt::Debug for Operation<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("controller", &self.controller.name())
            .field("priority", &self.priority)
            .field("exclusive", &self.exclusive)
            .field("phase", &self.phase)
            .field("retries", &self.retries)
            .finish()
    }
}

impl<H: OpHandler> Operation<H> {
    pub fn new(controller: Arc<Controller>, priority: Priority, handler: H) -> Self {
        let phase = handler.first_phase();
        Self {
            controller,
            priority,
            exclusive: false,
            max_retries: None,
            handler: Some(handler),
            phase,
            retries: 0,
            phases: 0,
            cycles: 0,
            ticket: None,
            lock: None,
            done: None,
        }
    }

    /// Hold the controller exclusively while in flight
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Override the link's retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Count this operation in a completer epoch
    pub fn with_ticket(mut self, ticket: CompleterTicket) -> Self {
        self.ticket = Some(ticket);
        self
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Validate against the link, take the exclusive lock and open the
    /// completion channel
    ///
    /// A rejected operation is disarmed: no callbacks run and the controller
    /// status is untouched.
    pub(crate) fn arm(
        &mut self,
        link: &CommLink,
        default_retries: u32,
    ) -> Result<Completion<H::Output>> {
        if let Err(e) = self.check(link) {
            self.disarm();
            return Err(e);
        }
        if self.exclusive {
            match self.controller.try_lock() {
                Ok(lock) => self.lock = Some(lock),
                Err(e) => {
                    warn!(link = %link.name, "Rejected {}: {}", self.describe(), e);
                    self.disarm();
                    return Err(e);
                },
            }
        }
        self.max_retries.get_or_insert(default_retries);
        let (tx, rx) = oneshot::channel();
        self.done = Some(tx);
        Ok(Completion { rx })
    }

    fn check(&self, link: &CommLink) -> Result<()> {
        if self.controller.link() != link.name {
            return Err(CommError::config(format!(
                "{} belongs to link {}, not {}",
                self.controller.name(),
                self.controller.link(),
                link.name
            )));
        }
        if !link.protocol.is_drop_valid(self.controller.drop_address()) {
            return Err(CommError::config(format!(
                "drop {} out of range {:?} for {}",
                self.controller.drop_address(),
                link.protocol.drop_range(),
                link.protocol
            )));
        }
        Ok(())
    }

    /// Drop the handler without running callbacks
    fn disarm(&mut self) {
        self.handler = None;
        if let Some(ticket) = self.ticket.as_mut() {
            ticket.mark_failed();
        }
        self.ticket = None;
    }

    fn describe(&self) -> String {
        let name = self.handler.as_ref().map(|h| h.name()).unwrap_or("operation");
        format!("{} {}", name, self.controller.name())
    }

    fn cleanup(&mut self, result: Result<()>) {
        let Some(mut handler) = self.handler.take() else {
            return;
        };
        let label = format!("{} {}", handler.name(), self.controller.name());
        let outcome = match result {
            Ok(()) => {
                self.controller.record_success();
                handler.on_success(&self.controller);
                debug!(
                    "{} done: {} phases, {} retries",
                    label, self.phases, self.retries
                );
                Ok(handler.into_output())
            },
            Err(e) => {
                self.controller.record_failure(&e);
                handler.on_failure(&self.controller, &e);
                if let Some(ticket) = self.ticket.as_mut() {
                    ticket.mark_failed();
                }
                match e {
                    CommError::QueueDrained => info!("{} drained", label),
                    _ => warn!("{} failed after {} retries: {}", label, self.retries, e),
                }
                Err(e)
            },
        };
        // Leave the completer epoch and release the controller
        self.ticket = None;
        self.lock = None;
        if let Some(tx) = self.done.take() {
            let _ = tx.send(OpReport {
                outcome,
                retries: self.retries,
                phases: self.phases,
            });
        }
    }
}

impl<H: OpHandler> Drop for Operation<H> {
    fn drop(&mut self) {
        self.cleanup(Err(CommError::QueueDrained));
    }
}

#[async_trait]
impl<H: OpHandler> Job for Operation<H> {
    fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn label(&self) -> String {
        self.describe()
    }

    async fn step(&mut self, chan: &mut CommChannel<'_>) -> Result<Step> {
        let phase = self.phase;
        let handler = self.handler.as_mut().ok_or(CommError::QueueDrained)?;
        match handler.poll(phase, chan).await? {
            Next::Goto(next) => {
                debug!("{:?} -> {:?}", phase, next);
                self.phase = next;
                self.phases += 1;
                self.cycles = 0;
                Ok(Step::Continue)
            },
            Next::Again => {
                self.cycles += 1;
                match handler.max_cycles() {
                    Some(max) if self.cycles >= max => {
                        debug!("{:?} reached {} cycles", phase, max);
                        self.phases += 1;
                        Ok(Step::Done)
                    },
                    _ => Ok(Step::Again),
                }
            },
            Next::Done => {
                self.phases += 1;
                Ok(Step::Done)
            },
        }
    }

    fn take_retry(&mut self) -> bool {
        if self.retries >= self.max_retries() {
            return false;
        }
        self.retries += 1;
        true
    }

    fn retries(&self) -> u32 {
        self.retries
    }

    fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(0)
    }

    fn finish(mut self: Box<Self>, result: Result<()>) {
        self.cleanup(result);
    }
}
