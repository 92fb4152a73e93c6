//! Error types
//!
//! Clock-level failures are reported synchronously to the caller of the
//! failing operation. Process-level failures stay inside the process that
//! raised them.

use crate::process::{ProcessEvent, ProcessId, ProcessState};
use crate::signal::Interrupt;
use thiserror::Error;

/// Errors reported by clock operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClockError {
    /// Scheduling time lies before the current virtual time.
    #[error("cannot schedule at {requested}: clock is already at {now}")]
    PastTime { requested: f64, now: f64 },

    /// NaN or infinite schedule time, or an unusable tick.
    #[error("invalid time value {0}")]
    InvalidTime(f64),

    /// `delay` called with a negative duration.
    #[error("negative delay {0}")]
    NegativeDelay(f64),

    /// The event queue has no entries.
    #[error("event queue is empty")]
    EmptyQueue,

    /// Neither an event nor a sampling tick is pending.
    #[error("nothing scheduled after time {time}")]
    NoMoreEvents { time: f64 },

    /// The requested process id collided and could not be re-derived.
    #[error("process id {0} is taken and no fresh id can be derived")]
    DuplicateProcessId(ProcessId),

    #[error("no process registered under id {0}")]
    UnknownProcess(ProcessId),

    #[error("process cannot go from {from:?} on {event:?}")]
    InvalidTransition {
        from: ProcessState,
        event: ProcessEvent,
    },

    /// The scheduler loop is already advancing this clock.
    #[error("clock is already running")]
    AlreadyRunning,

    #[error("step limit {limit} exceeded at time {time}")]
    StepLimit { limit: u64, time: f64 },

    /// The clock a process belongs to has been dropped.
    #[error("clock is no longer alive")]
    Detached,
}

/// Error type of a process body.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProcessError {
    /// A signal was delivered at the current suspension point.
    #[error("interrupted by {0}")]
    Interrupted(Interrupt),

    #[error(transparent)]
    Clock(#[from] ClockError),
}

impl ProcessError {
    /// The interrupt carried by this error, if any.
    pub fn interrupt(&self) -> Option<&Interrupt> {
        match self {
            ProcessError::Interrupted(i) => Some(i),
            ProcessError::Clock(_) => None,
        }
    }

    /// Whether this error is a `Stop` interrupt.
    pub fn is_stop(&self) -> bool {
        self.interrupt().is_some_and(|i| i.signal.is_stop())
    }
}

/// Errors loading a [`ClockConfig`](crate::config::ClockConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse clock config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid clock config: {0}")]
    Invalid(#[from] ClockError),
}
