//! Processes
//!
//! A process wraps an async body that the clock re-runs for a number of
//! cycles. The body suspends itself through [`ProcessCtx::delay`] and
//! [`ProcessCtx::wait`]; everything between two suspension points runs
//! without interleaving with other processes or clock actions.
//!
//! Lifecycle: registered (parked on its start gate, `Idle`) -> `Running`
//! for each cycle -> `Idle` between cycles -> `Halted` once the cycles are
//! used up, the process is stopped, or its body fails.

use crate::context::{ProcessCtx, Suspend};
use crate::error::{ClockError, ProcessError};
use crate::executor::TaskId;
use crate::queue::EventHandle;
use crate::signal::Interrupt;
use crate::wakeup::Wakeup;
use crate::clock::WatchId;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use tracing::{debug, warn};

/// Caller-chosen process identifier.
#[derive(Clone, Debug)]
pub enum ProcessId {
    Int(i64),
    Float(f64),
    Name(String),
}

impl ProcessId {
    /// Derive the first id after `self` that `taken` rejects.
    ///
    /// - integers count up by one,
    /// - floats count up by one,
    /// - names get a `#<n>` suffix: `"p"` -> `"p#1"`, `"p#1"` -> `"p#2"`.
    ///   Only a trailing run of ASCII digits after the last `#` counts as a
    ///   suffix, so `"p#x"` -> `"p#x#1"`.
    ///
    /// Returns `None` when the sequence runs out (integer overflow, or a
    /// float too large for `+ 1.0` to change it).
    pub fn derive_fresh(&self, taken: impl Fn(&ProcessId) -> bool) -> Option<ProcessId> {
        match self {
            ProcessId::Int(n) => {
                let mut next = *n;
                loop {
                    next = next.checked_add(1)?;
                    let candidate = ProcessId::Int(next);
                    if !taken(&candidate) {
                        return Some(candidate);
                    }
                }
            }
            ProcessId::Float(x) => {
                if !x.is_finite() {
                    return None;
                }
                let mut next = *x;
                loop {
                    let bumped = next + 1.0;
                    if bumped.to_bits() == next.to_bits() || !bumped.is_finite() {
                        return None;
                    }
                    next = bumped;
                    let candidate = ProcessId::Float(next);
                    if !taken(&candidate) {
                        return Some(candidate);
                    }
                }
            }
            ProcessId::Name(name) => {
                let (base, mut n) = split_suffix(name);
                loop {
                    n = n.checked_add(1)?;
                    let candidate = ProcessId::Name(format!("{}#{}", base, n));
                    if !taken(&candidate) {
                        return Some(candidate);
                    }
                }
            }
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ProcessId::Int(_) => 0,
            ProcessId::Float(_) => 1,
            ProcessId::Name(_) => 2,
        }
    }
}

fn split_suffix(name: &str) -> (&str, u64) {
    if let Some((base, digits)) = name.rsplit_once('#') {
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = digits.parse::<u64>() {
                return (base, n);
            }
        }
    }
    (name, 0)
}

impl PartialEq for ProcessId {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ProcessId {}

impl PartialOrd for ProcessId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Floats use total_cmp so ids stay usable as map keys.
impl Ord for ProcessId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ProcessId::Int(a), ProcessId::Int(b)) => a.cmp(b),
            (ProcessId::Float(a), ProcessId::Float(b)) => a.total_cmp(b),
            (ProcessId::Name(a), ProcessId::Name(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessId::Int(n) => write!(f, "{}", n),
            ProcessId::Float(x) => write!(f, "{}", x),
            ProcessId::Name(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for ProcessId {
    fn from(n: i64) -> Self {
        ProcessId::Int(n)
    }
}

impl From<i32> for ProcessId {
    fn from(n: i32) -> Self {
        ProcessId::Int(n.into())
    }
}

impl From<u32> for ProcessId {
    fn from(n: u32) -> Self {
        ProcessId::Int(n.into())
    }
}

impl From<f64> for ProcessId {
    fn from(x: f64) -> Self {
        ProcessId::Float(x)
    }
}

impl From<&str> for ProcessId {
    fn from(s: &str) -> Self {
        ProcessId::Name(s.to_string())
    }
}

impl From<String> for ProcessId {
    fn from(s: String) -> Self {
        ProcessId::Name(s)
    }
}

/// How many times a process body is run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Cycles {
    #[default]
    Unbounded,
    Count(u64),
}

impl Cycles {
    pub fn has_remaining(self) -> bool {
        !matches!(self, Cycles::Count(0))
    }

    fn decrement(self) -> Self {
        match self {
            Cycles::Unbounded => Cycles::Unbounded,
            Cycles::Count(n) => Cycles::Count(n.saturating_sub(1)),
        }
    }
}

impl From<u64> for Cycles {
    fn from(n: u64) -> Self {
        Cycles::Count(n)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Idle,
    Running,
    Halted,
}

/// Inputs of the process state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessEvent {
    /// The start gate opened or the next cycle began.
    Resume,
    /// The body returned normally.
    Return,
    /// No cycles are left.
    Exhausted,
    /// A `Stop` interrupt was injected.
    Stop,
    /// The body failed with anything other than `Stop`.
    Fail,
}

impl ProcessState {
    /// The process transition function. `Halted` accepts nothing.
    pub fn transition(self, event: ProcessEvent) -> Result<ProcessState, ClockError> {
        use ProcessEvent as E;
        use ProcessState as S;
        match (self, event) {
            (S::Idle, E::Resume) => Ok(S::Running),
            (S::Running, E::Return) => Ok(S::Idle),
            (S::Idle, E::Exhausted) => Ok(S::Halted),
            (S::Idle | S::Running, E::Stop) => Ok(S::Halted),
            (S::Running, E::Fail) => Ok(S::Halted),
            (from, event) => Err(ClockError::InvalidTransition { from, event }),
        }
    }
}

/// How a halted process ended.
#[derive(Clone, Debug, PartialEq)]
pub enum ProcessOutcome {
    /// All cycles ran.
    Completed,
    /// Ended by a `Stop` signal.
    Stopped,
    /// The body failed; the error did not leave the process. A signal the
    /// body did not handle ends up here as `ProcessError::Interrupted`.
    Failed(ProcessError),
    /// Dropped by a clock reset.
    Aborted,
}

/// What a suspended process is parked on.
pub(crate) enum SuspendKind {
    Gate,
    Delay(EventHandle),
    Wait(WatchId),
}

pub(crate) struct Suspension {
    pub wakeup: Wakeup,
    pub kind: SuspendKind,
}

struct ProcessInner {
    id: ProcessId,
    state: Cell<ProcessState>,
    cycles: Cell<Cycles>,
    task: Cell<Option<TaskId>>,
    suspension: RefCell<Option<Suspension>>,
    /// Interrupts that arrived while the process was not suspended.
    deferred: RefCell<VecDeque<Interrupt>>,
    outcome: RefCell<Option<ProcessOutcome>>,
}

/// Handle to a registered process.
#[derive(Clone)]
pub struct Process(Rc<ProcessInner>);

impl Process {
    pub(crate) fn new(id: ProcessId, cycles: Cycles) -> Self {
        Process(Rc::new(ProcessInner {
            id,
            state: Cell::new(ProcessState::Idle),
            cycles: Cell::new(cycles),
            task: Cell::new(None),
            suspension: RefCell::new(None),
            deferred: RefCell::new(VecDeque::new()),
            outcome: RefCell::new(None),
        }))
    }

    pub fn id(&self) -> &ProcessId {
        &self.0.id
    }

    pub fn state(&self) -> ProcessState {
        self.0.state.get()
    }

    pub fn cycles_remaining(&self) -> Cycles {
        self.0.cycles.get()
    }

    /// `None` until the process halts.
    pub fn outcome(&self) -> Option<ProcessOutcome> {
        self.0.outcome.borrow().clone()
    }

    /// Whether the process is parked in `delay`, `wait` or on its start gate.
    pub fn is_suspended(&self) -> bool {
        self.0.suspension.borrow().is_some()
    }

    pub fn same_as(&self, other: &Process) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn apply(&self, event: ProcessEvent) -> Result<ProcessState, ClockError> {
        let from = self.state();
        let to = from.transition(event)?;
        debug!(process = %self.0.id, ?from, ?to, ?event, "process transition");
        self.0.state.set(to);
        Ok(to)
    }

    pub(crate) fn task(&self) -> Option<TaskId> {
        self.0.task.get()
    }

    pub(crate) fn set_task(&self, task: TaskId) {
        self.0.task.set(Some(task));
    }

    pub(crate) fn suspend(&self, suspension: Suspension) {
        *self.0.suspension.borrow_mut() = Some(suspension);
    }

    pub(crate) fn take_suspension(&self) -> Option<Suspension> {
        self.0.suspension.borrow_mut().take()
    }

    /// Clear the suspension if it still belongs to `wakeup`.
    pub(crate) fn resume_from(&self, wakeup: &Wakeup) {
        let mut slot = self.0.suspension.borrow_mut();
        if slot.as_ref().is_some_and(|s| s.wakeup.same_as(wakeup)) {
            *slot = None;
        }
    }

    pub(crate) fn defer(&self, interrupt: Interrupt) {
        self.0.deferred.borrow_mut().push_back(interrupt);
    }

    pub(crate) fn take_deferred(&self) -> Option<Interrupt> {
        self.0.deferred.borrow_mut().pop_front()
    }

    fn finish(&self, outcome: ProcessOutcome) {
        self.0.state.set(ProcessState::Halted);
        self.0.deferred.borrow_mut().clear();
        self.0.suspension.borrow_mut().take();
        let mut slot = self.0.outcome.borrow_mut();
        if slot.is_none() {
            *slot = Some(outcome);
        }
    }

    /// Force the terminal state without running the body again.
    pub(crate) fn abort(&self) {
        self.finish(ProcessOutcome::Aborted);
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.0.id)
            .field("state", &self.state())
            .field("cycles", &self.cycles_remaining())
            .finish()
    }
}

/// The execution context of one process: wait on the start gate, then run
/// the body once per cycle until the cycles are used up or a signal ends it.
pub(crate) async fn drive<F, Fut>(ctx: ProcessCtx, body: F, gate: Wakeup)
where
    F: Fn(ProcessCtx) -> Fut,
    Fut: Future<Output = Result<(), ProcessError>>,
{
    let process = ctx.process().clone();

    let outcome = match Suspend::parked(&ctx, gate).await {
        Err(e) if e.is_stop() => ProcessOutcome::Stopped,
        Err(e) => ProcessOutcome::Failed(e),
        Ok(()) => run_cycles(&ctx, &process, &body).await,
    };

    if let ProcessOutcome::Failed(e) = &outcome {
        warn!(process = %process.id(), error = %e, "process halted abnormally");
    }
    process.finish(outcome);
    if let Ok(clock) = ctx.clock() {
        clock.unregister(&process);
    }
}

async fn run_cycles<F, Fut>(ctx: &ProcessCtx, process: &Process, body: &F) -> ProcessOutcome
where
    F: Fn(ProcessCtx) -> Fut,
    Fut: Future<Output = Result<(), ProcessError>>,
{
    loop {
        // stopped from outside between cycles
        if process.state() == ProcessState::Halted {
            return ProcessOutcome::Stopped;
        }
        if !process.cycles_remaining().has_remaining() {
            let _ = process.apply(ProcessEvent::Exhausted);
            return ProcessOutcome::Completed;
        }
        if process.apply(ProcessEvent::Resume).is_err() {
            return ProcessOutcome::Stopped;
        }

        match body(ctx.clone()).await {
            Ok(()) => {
                // a Stop injected mid-cycle already halted the process
                if process.apply(ProcessEvent::Return).is_err() {
                    return ProcessOutcome::Stopped;
                }
                process.0.cycles.set(process.cycles_remaining().decrement());
            }
            Err(e) if e.is_stop() => {
                let _ = process.apply(ProcessEvent::Stop);
                return ProcessOutcome::Stopped;
            }
            Err(e) => {
                let _ = process.apply(ProcessEvent::Fail);
                return ProcessOutcome::Failed(e);
            }
        }
    }
}
