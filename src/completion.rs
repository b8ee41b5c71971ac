//! Single-shot completion cell and fixed-interval poll driver.
//!
//! A [`Completion`] permits exactly one transition out of `Pending`. The
//! driver in [`poll`] ticks a recurring timer, compares elapsed time against
//! the deadline on every tick, and drops the timer as soon as the cell
//! settles, whichever path settled it.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::error::{Error, Operation, Result};

/// Single-shot completion state.
#[derive(Debug)]
pub enum Completion<T, E> {
    Pending,
    Resolved(T),
    Rejected(E),
}

impl<T, E> Default for Completion<T, E> {
    fn default() -> Self {
        Completion::Pending
    }
}

impl<T, E> Completion<T, E> {
    pub fn new() -> Self {
        Completion::Pending
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Completion::Pending)
    }

    /// Resolves the cell. Returns false if it had already settled.
    pub fn resolve(&mut self, value: T) -> bool {
        if !self.is_pending() {
            return false;
        }
        *self = Completion::Resolved(value);
        true
    }

    /// Rejects the cell. Returns false if it had already settled.
    pub fn reject(&mut self, error: E) -> bool {
        if !self.is_pending() {
            return false;
        }
        *self = Completion::Rejected(error);
        true
    }

    /// Consumes the cell, returning the outcome if it settled.
    pub fn into_outcome(self) -> Option<std::result::Result<T, E>> {
        match self {
            Completion::Pending => None,
            Completion::Resolved(value) => Some(Ok(value)),
            Completion::Rejected(error) => Some(Err(error)),
        }
    }
}

/// Outcome of a single poll check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick<T> {
    /// Not there yet; poll again on the next tick.
    Continue,
    /// Converged.
    Done(T),
}

/// Interval and hard deadline for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub operation: Operation,
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSchedule {
    pub fn new(operation: Operation, interval: Duration, timeout: Duration) -> Self {
        Self {
            operation,
            interval,
            timeout,
        }
    }

    fn timeout_error(&self) -> Error {
        Error::Timeout {
            operation: self.operation,
            timeout: self.timeout,
        }
    }
}

/// A check run once per tick.
///
/// Returning `Err` rejects the poll; state that must survive between ticks
/// (failure counters) lives on the implementor.
#[async_trait]
pub trait PollCheck: Send {
    type Output: Send;

    async fn check(&mut self) -> Result<Tick<Self::Output>>;
}

/// Runs `check` on every tick of `schedule` until it settles.
///
/// The first tick fires one interval after the start. On each tick the
/// elapsed time is compared against the timeout before the check runs, so
/// no check is issued after the deadline, and a check is cut off when the
/// deadline passes while it is still running.
pub async fn poll<C: PollCheck>(check: &mut C, schedule: PollSchedule) -> Result<C::Output> {
    let start = Instant::now();
    let deadline = start + schedule.timeout;
    let mut timer = time::interval_at(start + schedule.interval, schedule.interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut completion = Completion::new();
    while completion.is_pending() {
        timer.tick().await;

        if start.elapsed() > schedule.timeout {
            completion.reject(schedule.timeout_error());
            break;
        }

        // A check still in flight at the deadline is abandoned.
        match time::timeout_at(deadline, check.check()).await {
            Ok(Ok(Tick::Continue)) => {}
            Ok(Ok(Tick::Done(value))) => {
                completion.resolve(value);
            }
            Ok(Err(e)) => {
                completion.reject(e);
            }
            Err(_) => {
                completion.reject(schedule.timeout_error());
            }
        }
    }
    drop(timer);

    completion
        .into_outcome()
        .unwrap_or_else(|| Err(schedule.timeout_error()))
}
