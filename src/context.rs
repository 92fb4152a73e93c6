//! Process context
//!
//! The handle a process body receives each cycle. It exposes the
//! suspension primitives; everything else goes through the clock.

use crate::action::Condition;
use crate::clock::{Clock, ClockShared};
use crate::error::{ClockError, ProcessError};
use crate::process::{Process, ProcessId, SuspendKind, Suspension};
use crate::wakeup::Wakeup;
use std::future::Future;
use std::pin::Pin;
use std::rc::Weak;
use std::task::{Context, Poll};

/// Handle given to a process body.
#[derive(Clone)]
pub struct ProcessCtx {
    clock: Weak<ClockShared>,
    process: Process,
}

impl ProcessCtx {
    pub(crate) fn new(clock: Weak<ClockShared>, process: Process) -> Self {
        Self { clock, process }
    }

    pub fn id(&self) -> &ProcessId {
        self.process.id()
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    /// The owning clock.
    pub fn clock(&self) -> Result<Clock, ClockError> {
        self.clock
            .upgrade()
            .map(Clock::from_shared)
            .ok_or(ClockError::Detached)
    }

    /// Current virtual time; NaN once the clock is gone.
    pub fn now(&self) -> f64 {
        self.clock().map(|c| c.now()).unwrap_or(f64::NAN)
    }

    /// Suspend for `duration` units of virtual time.
    ///
    /// The process resumes exactly at `now + duration`, after the events
    /// already queued for that instant.
    pub fn delay(&self, duration: f64) -> Suspend {
        let request = if duration.is_nan() {
            Request::Failed(ClockError::InvalidTime(duration))
        } else if duration < 0.0 {
            Request::Failed(ClockError::NegativeDelay(duration))
        } else {
            match self.clock() {
                Ok(clock) => Request::Delay(clock.now() + duration),
                Err(e) => Request::Failed(e),
            }
        };
        Suspend::new(self, request)
    }

    /// Suspend until `condition` holds.
    ///
    /// Returns without suspending when the condition already holds; no
    /// virtual time passes in that case.
    pub fn wait(&self, condition: impl Into<Condition>) -> Suspend {
        Suspend::new(self, Request::Wait(condition.into()))
    }

    /// Run `f` under the clock lock.
    pub fn sync<R>(&self, f: impl FnOnce(&Clock) -> R) -> Result<R, ClockError> {
        self.clock().map(|clock| clock.sync(f))
    }
}

enum Request {
    Delay(f64),
    Wait(Condition),
    Failed(ClockError),
}

/// Future returned by the suspension primitives.
///
/// Resolves to `Ok(())` when the clock resumes the process, or to
/// `Err(ProcessError::Interrupted(..))` when a signal unwinds it.
pub struct Suspend {
    ctx: ProcessCtx,
    request: Option<Request>,
    wakeup: Option<Wakeup>,
}

impl Suspend {
    fn new(ctx: &ProcessCtx, request: Request) -> Self {
        Self {
            ctx: ctx.clone(),
            request: Some(request),
            wakeup: None,
        }
    }

    /// Wait on a wakeup that is already registered with the process.
    pub(crate) fn parked(ctx: &ProcessCtx, wakeup: Wakeup) -> Self {
        Self {
            ctx: ctx.clone(),
            request: None,
            wakeup: Some(wakeup),
        }
    }

    fn register(&mut self, request: Request) -> Option<Result<(), ProcessError>> {
        let process = &self.ctx.process;
        if let Some(interrupt) = process.take_deferred() {
            return Some(Err(ProcessError::Interrupted(interrupt)));
        }
        let clock = match self.ctx.clock() {
            Ok(clock) => clock,
            Err(e) => return Some(Err(e.into())),
        };

        let wakeup = Wakeup::new();
        let kind = match request {
            Request::Failed(e) => return Some(Err(e.into())),
            Request::Delay(at) => SuspendKind::Delay(clock.schedule_wakeup(at, wakeup.clone())),
            Request::Wait(condition) => {
                if condition.holds(&clock) {
                    return Some(Ok(()));
                }
                SuspendKind::Wait(clock.watch_wakeup(condition, wakeup.clone()))
            }
        };
        process.suspend(Suspension {
            wakeup: wakeup.clone(),
            kind,
        });
        self.wakeup = Some(wakeup);
        None
    }
}

impl Future for Suspend {
    type Output = Result<(), ProcessError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(request) = this.request.take() {
            if let Some(ready) = this.register(request) {
                return Poll::Ready(ready);
            }
        }

        let Some(wakeup) = this.wakeup.as_ref() else {
            return Poll::Ready(Ok(()));
        };
        match wakeup.outcome() {
            Some(outcome) => {
                this.ctx.process.resume_from(wakeup);
                Poll::Ready(outcome.map_err(ProcessError::Interrupted))
            }
            None => {
                wakeup.set_waker(cx.waker());
                Poll::Pending
            }
        }
    }
}

impl Unpin for Suspend {}
