//! Clock and scheduler loop
//!
//! The clock owns virtual time, the event queue, the condition watch list,
//! the sampling registry and the process registry. Time only moves inside
//! [`Clock::step`]; everything else reads it.
//!
//! A step advances to the earlier of the next queued event and the next
//! sampling tick, then runs, in order:
//! 1. every sampling action (if the tick is due),
//! 2. every event due at that instant, FIFO, including ones scheduled for
//!    the same instant while the step runs,
//! 3. every conditional action whose condition now holds.
//!
//! The condition watch list is rechecked after each invoked action, and a
//! process woken by an action runs to its next suspension point before the
//! step moves on.

use crate::action::{Action, Condition, SampleAction};
use crate::config::ClockConfig;
use crate::context::ProcessCtx;
use crate::error::{ClockError, ProcessError};
use crate::executor::Executor;
use crate::process::{self, Cycles, Process, ProcessEvent, ProcessId, ProcessState, SuspendKind, Suspension};
use crate::queue::{EventHandle, EventQueue};
use crate::signal::{Interrupt, Payload, Signal};
use crate::wakeup::Wakeup;
use parking_lot::ReentrantMutex;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Whether the scheduler loop may currently advance time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockState {
    /// Fresh or reset, or between standalone steps.
    Idle,
    /// A step or run is in progress.
    Running,
    /// A run finished or was halted.
    Halted,
}

/// Identifier of a conditional event or process wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

/// Identifier of a sampling action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SampleId(u64);

/// Identifier of a repeating event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepeatId(u64);

/// What a single step did.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepReport {
    /// The instant the step advanced to.
    pub time: f64,
    pub sampled: u64,
    pub events: u64,
    pub conditions: u64,
}

impl StepReport {
    fn fired(&self) -> u64 {
        self.sampled + self.events + self.conditions
    }
}

/// Result of a run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunSummary {
    /// Timed and conditional events executed during the run.
    pub events_executed: u64,
    pub final_time: f64,
    pub steps: u64,
    /// The run stopped on [`Clock::halt`] before reaching its horizon.
    pub halted: bool,
}

struct WatchEntry {
    id: WatchId,
    condition: Condition,
    action: Action,
}

const MAX_TICK_BUMPS: usize = 4;

/// Candidate instants for the next step; `INFINITY` when absent.
struct Targets {
    event: f64,
    sample: f64,
    recheck: f64,
}

impl Targets {
    fn next(&self) -> f64 {
        self.event.min(self.sample).min(self.recheck)
    }
}

/// Restores the clock state when a step or run exits, unwinding included.
struct StateGuard<'a> {
    clock: &'a Clock,
    exit: ClockState,
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut core) = self.clock.shared.core.try_borrow_mut() {
            core.state = self.exit;
        }
    }
}

type SampleFn = Rc<RefCell<SampleAction>>;
type RepeatFn = Rc<RefCell<dyn FnMut(&Clock)>>;

struct ClockCore {
    time: f64,
    tick: f64,
    state: ClockState,
    halt_requested: bool,
    queue: EventQueue<Action>,
    watch: Vec<WatchEntry>,
    samples: Vec<(SampleId, SampleFn)>,
    processes: BTreeMap<ProcessId, Process>,
    repeats: HashMap<RepeatId, EventHandle>,
    next_id: u64,
    events_executed: u64,
}

impl ClockCore {
    fn new(tick: f64) -> Self {
        Self {
            time: 0.0,
            tick,
            state: ClockState::Idle,
            halt_requested: false,
            queue: EventQueue::new(),
            watch: Vec::new(),
            samples: Vec::new(),
            processes: BTreeMap::new(),
            repeats: HashMap::new(),
            next_id: 0,
            events_executed: 0,
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Smallest multiple of `interval` strictly after the current time.
    ///
    /// Fails with `InvalidTime(interval)` once the clock is so far along that
    /// no later multiple is representable.
    fn next_multiple(&self, interval: f64) -> Result<Option<f64>, ClockError> {
        if interval <= 0.0 {
            return Ok(None);
        }
        let mut n = (self.time / interval).floor() + 1.0;
        // floor() may land one or two below the true quotient after rounding
        for _ in 0..MAX_TICK_BUMPS {
            let t = n * interval;
            if t > self.time {
                return Ok(Some(t));
            }
            let bumped = n + 1.0;
            if bumped == n {
                break;
            }
            n = bumped;
        }
        Err(ClockError::InvalidTime(interval))
    }

    fn next_sample_time(&self) -> Result<Option<f64>, ClockError> {
        self.next_multiple(self.tick)
    }

    /// Recheck interval for a clock that has pending conditions but does not
    /// sample. Sampling actions never run on it.
    fn next_recheck_time(&self, condition_tick: f64) -> Result<Option<f64>, ClockError> {
        if self.tick > 0.0 || self.watch.is_empty() {
            return Ok(None);
        }
        self.next_multiple(condition_tick)
    }

    fn check_time(&self, time: f64) -> Result<(), ClockError> {
        if !time.is_finite() {
            return Err(ClockError::InvalidTime(time));
        }
        if time < self.time {
            return Err(ClockError::PastTime {
                requested: time,
                now: self.time,
            });
        }
        Ok(())
    }
}

pub(crate) struct ClockShared {
    core: RefCell<ClockCore>,
    executor: Executor,
    lock: ReentrantMutex<()>,
    config: ClockConfig,
}

/// Handle to a simulation clock. Clones share the same clock.
#[derive(Clone)]
pub struct Clock {
    shared: Rc<ClockShared>,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self::build(ClockConfig::default())
    }

    pub fn with_config(config: ClockConfig) -> Result<Self, ClockError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: ClockConfig) -> Self {
        Self {
            shared: Rc::new(ClockShared {
                core: RefCell::new(ClockCore::new(config.tick)),
                executor: Executor::new(),
                lock: ReentrantMutex::new(()),
                config,
            }),
        }
    }

    pub(crate) fn from_shared(shared: Rc<ClockShared>) -> Self {
        Self { shared }
    }

    fn core(&self) -> Ref<'_, ClockCore> {
        self.shared.core.borrow()
    }

    fn core_mut(&self) -> RefMut<'_, ClockCore> {
        self.shared.core.borrow_mut()
    }

    /// Run every process that has been woken until it suspends again.
    fn drain(&self) {
        self.shared.executor.run_until_stalled();
    }

    // --- Observers ---

    /// Current virtual time.
    pub fn now(&self) -> f64 {
        self.core().time
    }

    pub fn tick(&self) -> f64 {
        self.core().tick
    }

    pub fn state(&self) -> ClockState {
        self.core().state
    }

    pub fn config(&self) -> &ClockConfig {
        &self.shared.config
    }

    /// Number of queued timed events, process delays included.
    pub fn pending_events(&self) -> usize {
        self.core().queue.len()
    }

    /// Number of entries on the condition watch list, process waits included.
    pub fn pending_conditions(&self) -> usize {
        self.core().watch.len()
    }

    pub fn sample_count(&self) -> usize {
        self.core().samples.len()
    }

    /// Total timed and conditional events executed since creation or reset.
    pub fn events_executed(&self) -> u64 {
        self.core().events_executed
    }

    pub fn get_process(&self, id: &ProcessId) -> Option<Process> {
        self.core().processes.get(id).cloned()
    }

    /// Registered process ids, in id order.
    pub fn process_ids(&self) -> Vec<ProcessId> {
        self.core().processes.keys().cloned().collect()
    }

    // --- Scheduling ---

    /// Schedule `action` at absolute time `time`.
    pub fn event(&self, action: Action, time: f64) -> Result<EventHandle, ClockError> {
        let mut core = self.core_mut();
        core.check_time(time)?;
        let handle = core.queue.insert(time, action);
        trace!(time, seq = handle.seq(), "event scheduled");
        Ok(handle)
    }

    /// Schedule `action` at `now + delay`.
    pub fn event_after(&self, action: Action, delay: f64) -> Result<EventHandle, ClockError> {
        if delay < 0.0 {
            return Err(ClockError::NegativeDelay(delay));
        }
        let at = self.now() + delay;
        self.event(action, at)
    }

    /// Run `action` the first time `condition` holds at a recheck.
    pub fn event_when(&self, action: Action, condition: Condition) -> Result<WatchId, ClockError> {
        Ok(self.watch(condition, action))
    }

    /// Remove a queued event. Returns whether it was still pending.
    pub fn cancel(&self, handle: EventHandle) -> bool {
        self.core_mut().queue.remove(handle).is_some()
    }

    /// Remove a conditional event. Returns whether it was still pending.
    pub fn cancel_watch(&self, id: WatchId) -> bool {
        let mut core = self.core_mut();
        let before = core.watch.len();
        core.watch.retain(|e| e.id != id);
        core.watch.len() != before
    }

    fn watch(&self, condition: Condition, action: Action) -> WatchId {
        let mut core = self.core_mut();
        if core.tick <= 0.0 && core.watch.is_empty() {
            debug!(
                interval = self.shared.config.condition_tick,
                "rechecking conditions without sampling"
            );
        }
        let id = WatchId(core.alloc_id());
        core.watch.push(WatchEntry {
            id,
            condition,
            action,
        });
        id
    }

    pub(crate) fn schedule_wakeup(&self, at: f64, wakeup: Wakeup) -> EventHandle {
        self.core_mut().queue.insert(
            at,
            Action::new(move |_| {
                wakeup.fire();
            }),
        )
    }

    pub(crate) fn watch_wakeup(&self, condition: Condition, wakeup: Wakeup) -> WatchId {
        self.watch(
            condition,
            Action::new(move |_| {
                wakeup.fire();
            }),
        )
    }

    /// Run `action` at `start` and then every `interval` until cancelled.
    pub fn every(
        &self,
        action: impl FnMut(&Clock) + 'static,
        start: f64,
        interval: f64,
    ) -> Result<RepeatId, ClockError> {
        if !(interval.is_finite() && interval > 0.0) {
            return Err(ClockError::InvalidTime(interval));
        }
        let f: RepeatFn = Rc::new(RefCell::new(action));
        let mut core = self.core_mut();
        core.check_time(start)?;
        let id = RepeatId(core.alloc_id());
        let handle = core.queue.insert(start, repeat_action(id, f, start, interval));
        core.repeats.insert(id, handle);
        Ok(id)
    }

    /// Stop a repeating event. Returns whether it was still active.
    pub fn cancel_repeat(&self, id: RepeatId) -> bool {
        let mut core = self.core_mut();
        match core.repeats.remove(&id) {
            Some(handle) => {
                core.queue.remove(handle);
                true
            }
            None => false,
        }
    }

    /// Set the sampling interval. `0` disables sampling.
    pub fn set_tick(&self, tick: f64) -> Result<(), ClockError> {
        if !(tick.is_finite() && tick >= 0.0) {
            return Err(ClockError::InvalidTime(tick));
        }
        self.core_mut().tick = tick;
        Ok(())
    }

    /// Register an action to run on every tick.
    pub fn sample(&self, action: SampleAction) -> SampleId {
        let mut core = self.core_mut();
        let id = SampleId(core.alloc_id());
        core.samples.push((id, Rc::new(RefCell::new(action))));
        id
    }

    pub fn remove_sample(&self, id: SampleId) -> bool {
        let mut core = self.core_mut();
        let before = core.samples.len();
        core.samples.retain(|(sid, _)| *sid != id);
        core.samples.len() != before
    }

    // --- Scheduler loop ---

    /// Mark the clock running. The returned guard sets `exit` when dropped.
    fn enter(&self, exit: ClockState) -> Result<StateGuard<'_>, ClockError> {
        let mut core = self.core_mut();
        if core.state == ClockState::Running {
            return Err(ClockError::AlreadyRunning);
        }
        core.state = ClockState::Running;
        Ok(StateGuard { clock: self, exit })
    }

    /// Advance to the next event or sampling tick and execute what is due.
    pub fn step(&self) -> Result<StepReport, ClockError> {
        let _guard = self.shared.lock.lock();
        let _running = self.enter(ClockState::Idle)?;
        self.step_inner()
    }

    fn next_target(&self) -> Result<Targets, ClockError> {
        let mut core = self.core_mut();
        let condition_tick = self.shared.config.condition_tick;
        Ok(Targets {
            event: core.queue.peek_min().unwrap_or(f64::INFINITY),
            sample: core.next_sample_time()?.unwrap_or(f64::INFINITY),
            recheck: core.next_recheck_time(condition_tick)?.unwrap_or(f64::INFINITY),
        })
    }

    fn step_inner(&self) -> Result<StepReport, ClockError> {
        self.drain();

        let targets = self.next_target()?;
        let event_time = targets.event;
        let sample_time = targets.sample;
        let target = targets.next();
        if target == f64::INFINITY {
            return Err(ClockError::NoMoreEvents { time: self.now() });
        }

        self.core_mut().time = target;
        debug!(time = target, "step");

        let mut report = StepReport {
            time: target,
            ..StepReport::default()
        };

        if sample_time <= target {
            self.run_samples(&mut report)?;
        }
        if event_time <= target {
            self.run_due_events(target, &mut report)?;
        }
        self.recheck_conditions(&mut report)?;

        self.core_mut().events_executed += report.events + report.conditions;
        Ok(report)
    }

    fn check_instant_limit(&self, report: &StepReport) -> Result<(), ClockError> {
        let limit = self.shared.config.max_events_per_instant;
        if report.fired() > limit {
            return Err(ClockError::StepLimit {
                limit,
                time: report.time,
            });
        }
        Ok(())
    }

    fn run_samples(&self, report: &mut StepReport) -> Result<(), ClockError> {
        let samples: Vec<(SampleId, SampleFn)> = self.core().samples.clone();
        for (id, action) in samples {
            // removed by an earlier sample in this tick
            if !self.core().samples.iter().any(|(sid, _)| *sid == id) {
                continue;
            }
            trace!(time = report.time, sample = id.0, "sample");
            report.sampled += 1;
            action.borrow_mut().invoke(self)?;
            self.drain();
            self.check_instant_limit(report)?;
        }
        self.recheck_conditions(report)
    }

    fn run_due_events(&self, target: f64, report: &mut StepReport) -> Result<(), ClockError> {
        loop {
            let next = self.core_mut().queue.pop_due(target);
            let Some((handle, action)) = next else {
                return Ok(());
            };
            trace!(time = target, seq = handle.seq(), "event");
            report.events += 1;
            action.invoke(self)?;
            self.drain();
            self.check_instant_limit(report)?;
            self.recheck_conditions(report)?;
        }
    }

    /// Fire every watch entry whose condition holds, until none does.
    fn recheck_conditions(&self, report: &mut StepReport) -> Result<(), ClockError> {
        loop {
            let entries = std::mem::take(&mut self.core_mut().watch);
            if entries.is_empty() {
                return Ok(());
            }
            let (fired, mut kept): (Vec<WatchEntry>, Vec<WatchEntry>) =
                entries.into_iter().partition(|e| e.condition.holds(self));
            {
                let mut core = self.core_mut();
                // entries registered while the predicates ran
                kept.append(&mut core.watch);
                core.watch = kept;
            }
            if fired.is_empty() {
                return Ok(());
            }
            for entry in fired {
                trace!(time = report.time, watch = entry.id.0, "condition fired");
                report.conditions += 1;
                entry.action.invoke(self)?;
                self.drain();
                self.check_instant_limit(report)?;
            }
        }
    }

    /// Step while the next event or tick is at or before `until`, then move
    /// the clock to `until`.
    #[tracing::instrument(level = "debug", skip(self), fields(from = self.now()))]
    pub fn run(&self, until: f64) -> Result<RunSummary, ClockError> {
        let _guard = self.shared.lock.lock();
        self.core().check_time(until)?;
        let _running = self.enter(ClockState::Halted)?;
        let executed_before = {
            let mut core = self.core_mut();
            core.halt_requested = false;
            core.events_executed
        };

        let result = self.run_inner(until);

        if let Err(e) = &result {
            warn!(error = %e, time = self.now(), "run halted abnormally");
        }
        let (steps, halted) = result?;
        let mut core = self.core_mut();
        if !halted {
            core.time = until;
        }
        let summary = RunSummary {
            events_executed: core.events_executed - executed_before,
            final_time: core.time,
            steps,
            halted,
        };
        debug!(?summary, "run finished");
        Ok(summary)
    }

    fn run_inner(&self, until: f64) -> Result<(u64, bool), ClockError> {
        self.drain();
        let limit = self.shared.config.max_steps;
        let mut steps = 0;
        loop {
            if self.core().halt_requested {
                return Ok((steps, true));
            }
            let next = self.next_target()?.next();
            if next > until {
                return Ok((steps, false));
            }
            if steps >= limit {
                return Err(ClockError::StepLimit {
                    limit,
                    time: self.now(),
                });
            }
            steps += 1;
            self.step_inner()?;
        }
    }

    /// Run for `duration` units of virtual time from now.
    pub fn run_for(&self, duration: f64) -> Result<RunSummary, ClockError> {
        if duration < 0.0 {
            return Err(ClockError::NegativeDelay(duration));
        }
        let until = self.now() + duration;
        self.run(until)
    }

    /// Ask the current run to stop after the step in progress.
    pub fn halt(&self) {
        self.core_mut().halt_requested = true;
    }

    /// Restore a fresh clock: time 0, initial tick, every registry empty.
    /// Registered processes are dropped and report `Aborted`.
    pub fn reset(&self) -> Result<(), ClockError> {
        let _guard = self.shared.lock.lock();
        if self.state() == ClockState::Running {
            return Err(ClockError::AlreadyRunning);
        }
        let processes = std::mem::take(&mut self.core_mut().processes);
        for process in processes.values() {
            if let Some(task) = process.task() {
                self.shared.executor.cancel(task);
            }
            process.abort();
        }
        self.shared.executor.clear();
        *self.core_mut() = ClockCore::new(self.shared.config.tick);
        debug!(dropped = processes.len(), "clock reset");
        Ok(())
    }

    /// Execute `f` while holding the clock lock. The lock is released on
    /// every exit path, unwinding included.
    pub fn sync<R>(&self, f: impl FnOnce(&Clock) -> R) -> R {
        let _guard = self.shared.lock.lock();
        f(self)
    }

    pub fn is_locked(&self) -> bool {
        self.shared.lock.is_locked()
    }

    // --- Processes ---

    /// Register a process and start it.
    ///
    /// The body runs once per cycle. It starts right away and runs until its
    /// first suspension point. A colliding `id` is replaced by a derived
    /// fresh one; the id actually used is returned.
    pub fn process<F, Fut>(
        &self,
        id: impl Into<ProcessId>,
        body: F,
        cycles: impl Into<Cycles>,
    ) -> Result<ProcessId, ClockError>
    where
        F: Fn(ProcessCtx) -> Fut + 'static,
        Fut: Future<Output = Result<(), ProcessError>> + 'static,
    {
        let requested = id.into();
        let cycles = cycles.into();
        let gate = Wakeup::new();

        let process = {
            let mut core = self.core_mut();
            let id = if core.processes.contains_key(&requested) {
                let fresh = requested
                    .derive_fresh(|c| core.processes.contains_key(c))
                    .ok_or_else(|| ClockError::DuplicateProcessId(requested.clone()))?;
                debug!(requested = %requested, derived = %fresh, "process id taken");
                fresh
            } else {
                requested
            };
            let process = Process::new(id.clone(), cycles);
            process.suspend(Suspension {
                wakeup: gate.clone(),
                kind: SuspendKind::Gate,
            });
            core.processes.insert(id, process.clone());
            process
        };

        let ctx = ProcessCtx::new(Rc::downgrade(&self.shared), process.clone());
        let task = self.shared.executor.spawn(process::drive(ctx, body, gate.clone()));
        process.set_task(task);
        debug!(process = %process.id(), ?cycles, "process registered");

        // start-gate handoff
        self.drain();
        process.resume_from(&gate);
        gate.fire();
        self.drain();

        Ok(process.id().clone())
    }

    /// Deliver `signal` at the process's current suspension point.
    ///
    /// A process that is not suspended receives the signal at its next
    /// `delay` or `wait`.
    pub fn interrupt(
        &self,
        id: &ProcessId,
        signal: Signal,
        value: Option<Payload>,
    ) -> Result<(), ClockError> {
        let process = self
            .get_process(id)
            .ok_or_else(|| ClockError::UnknownProcess(id.clone()))?;
        let interrupt = Interrupt::new(signal, value);
        debug!(process = %id, signal = %interrupt.signal, "interrupt");
        self.deliver(&process, interrupt);
        self.drain();
        Ok(())
    }

    /// Stop a process: it halts immediately and unwinds from its current
    /// suspension point without running further code.
    pub fn stop(&self, id: &ProcessId, value: Option<Payload>) -> Result<(), ClockError> {
        let process = self
            .get_process(id)
            .ok_or_else(|| ClockError::UnknownProcess(id.clone()))?;
        if process.state() != ProcessState::Halted {
            process.apply(ProcessEvent::Stop)?;
        }
        self.interrupt(id, Signal::Stop, value)
    }

    fn deliver(&self, process: &Process, interrupt: Interrupt) {
        match process.take_suspension() {
            Some(suspension) if !suspension.wakeup.is_fired() => {
                match suspension.kind {
                    SuspendKind::Delay(handle) => {
                        self.cancel(handle);
                    }
                    SuspendKind::Wait(id) => {
                        self.cancel_watch(id);
                    }
                    SuspendKind::Gate => {}
                }
                suspension.wakeup.interrupt(interrupt);
            }
            Some(resumed) => {
                // woken but not yet polled: hand the signal to the next suspension
                process.suspend(resumed);
                process.defer(interrupt);
            }
            None => process.defer(interrupt),
        }
    }

    pub(crate) fn unregister(&self, process: &Process) {
        let mut core = self.core_mut();
        let registered = core
            .processes
            .get(process.id())
            .is_some_and(|p| p.same_as(process));
        if registered {
            core.processes.remove(process.id());
            debug!(process = %process.id(), "process unregistered");
        }
    }
}

fn repeat_action(id: RepeatId, f: RepeatFn, at: f64, interval: f64) -> Action {
    Action::new(move |clock| {
        (f.borrow_mut())(clock);
        let mut core = clock.core_mut();
        if core.repeats.contains_key(&id) {
            let next = at + interval;
            let handle = core.queue.insert(next, repeat_action(id, f.clone(), next, interval));
            core.repeats.insert(id, handle);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn recorder() -> (Rc<RefCell<Vec<(String, f64)>>>, impl Fn(&str) -> Action) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        let make = move |name: &str| {
            let l = l.clone();
            let name = name.to_string();
            Action::new(move |clock| l.borrow_mut().push((name, clock.now())))
        };
        (log, make)
    }

    #[test]
    fn test_clock_creation() {
        let clock = Clock::new();
        assert_eq!(clock.now(), 0.0);
        assert_eq!(clock.tick(), 0.0);
        assert_eq!(clock.state(), ClockState::Idle);
        assert!(!clock.is_locked());
    }

    #[test]
    fn test_past_time_rejected() {
        let clock = Clock::new();
        clock.event(Action::noop(), 2.0).unwrap();
        clock.run(2.0).unwrap();

        assert_eq!(
            clock.event(Action::noop(), 1.0),
            Err(ClockError::PastTime {
                requested: 1.0,
                now: 2.0
            })
        );
        assert_eq!(
            clock.event(Action::noop(), f64::NAN).unwrap_err().to_string(),
            "invalid time value NaN"
        );
        assert!(clock.event(Action::noop(), 2.0).is_ok());
    }

    #[test]
    fn test_step_without_work_fails() {
        let clock = Clock::new();
        assert_eq!(clock.step(), Err(ClockError::NoMoreEvents { time: 0.0 }));
        assert_eq!(clock.state(), ClockState::Idle);
    }

    #[test]
    fn test_step_runs_all_due_events() {
        let clock = Clock::new();
        let (log, make) = recorder();
        clock.event(make("a"), 1.0).unwrap();
        clock.event(make("b"), 1.0).unwrap();
        clock.event(make("c"), 2.0).unwrap();

        let report = clock.step().unwrap();
        assert_eq!(report.time, 1.0);
        assert_eq!(report.events, 2);
        assert_eq!(clock.now(), 1.0);
        assert_eq!(log.borrow().len(), 2);
        assert_eq!(clock.pending_events(), 1);
    }

    #[test]
    fn test_chained_event_at_same_instant_runs_in_same_step() {
        let clock = Clock::new();
        let (log, make) = recorder();
        let then = make("second");
        clock
            .event(
                Action::fallible(move |clock| {
                    clock.event(then, clock.now())?;
                    Ok(())
                }),
                3.0,
            )
            .unwrap();

        let report = clock.step().unwrap();
        assert_eq!(report.events, 2);
        assert_eq!(*log.borrow(), vec![("second".to_string(), 3.0)]);
    }

    #[test]
    fn test_failing_action_aborts_step() {
        let clock = Clock::new();
        clock
            .event(Action::fallible(|c| c.event(Action::noop(), -1.0).map(|_| ())), 1.0)
            .unwrap();
        assert_eq!(
            clock.step(),
            Err(ClockError::PastTime {
                requested: -1.0,
                now: 1.0
            })
        );
        assert_eq!(clock.state(), ClockState::Idle);
    }

    #[test]
    fn test_sampling_ticks() {
        let clock = Clock::new();
        clock.set_tick(0.5).unwrap();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let id = clock.sample(SampleAction::new(move |_| h.set(h.get() + 1)));

        clock.run(2.0).unwrap();
        assert_eq!(hits.get(), 4);

        assert!(clock.remove_sample(id));
        assert!(!clock.remove_sample(id));
        clock.run(3.0).unwrap();
        assert_eq!(hits.get(), 4);
    }

    #[test]
    fn test_next_sample_time_is_strictly_later() {
        let mut core = ClockCore::new(0.1);
        core.time = 0.30000000000000004;
        let t = core.next_sample_time().unwrap().unwrap();
        assert!(t > core.time);
        assert!((t - 0.4).abs() < 1e-12);

        core.time = 2.0;
        core.tick = 1.0;
        assert_eq!(core.next_sample_time(), Ok(Some(3.0)));

        core.tick = 0.0;
        assert_eq!(core.next_sample_time(), Ok(None));
    }

    #[test]
    fn test_next_sample_time_at_large_times() {
        let mut core = ClockCore::new(1.0);
        core.time = 1e15;
        assert_eq!(core.next_sample_time(), Ok(Some(1e15 + 1.0)));

        // adjacent floats are 16 apart here, so no later whole tick exists
        core.time = 1e17;
        assert_eq!(core.next_sample_time(), Err(ClockError::InvalidTime(1.0)));
    }

    #[test]
    fn test_step_past_representable_ticks_fails() {
        let clock = Clock::new();
        clock.event(Action::noop(), 1e17).unwrap();
        clock.step().unwrap();
        clock.set_tick(1.0).unwrap();

        assert_eq!(clock.step(), Err(ClockError::InvalidTime(1.0)));
        assert_eq!(clock.run(2e17), Err(ClockError::InvalidTime(1.0)));
        assert_eq!(clock.state(), ClockState::Halted);
        assert_eq!(clock.now(), 1e17);
    }

    #[test]
    fn test_invalid_tick() {
        let clock = Clock::new();
        assert_eq!(clock.set_tick(-1.0), Err(ClockError::InvalidTime(-1.0)));
        assert!(clock.set_tick(f64::INFINITY).is_err());
    }

    #[test]
    fn test_conditions_rechecked_without_sampling() {
        let clock = Clock::new();
        let samples = Rc::new(Cell::new(0));
        let s = samples.clone();
        clock.sample(SampleAction::new(move |_| s.set(s.get() + 1)));

        let fired_at = Rc::new(Cell::new(f64::NAN));
        let f = fired_at.clone();
        clock
            .event_when(
                Action::new(move |c| f.set(c.now())),
                Condition::at_or_after(0.05),
            )
            .unwrap();

        let summary = clock.run(1.0).unwrap();
        assert!((fired_at.get() - 0.05).abs() < 1e-9);
        assert_eq!(clock.pending_conditions(), 0);
        assert_eq!(summary.events_executed, 1);
        assert_eq!(samples.get(), 0);
        assert_eq!(clock.tick(), 0.0);

        // nothing pending: no recheck steps
        let summary = clock.run(2.0).unwrap();
        assert_eq!(summary.steps, 0);
    }

    #[test]
    fn test_condition_tick_zero_disables_rechecks() {
        let config = ClockConfig {
            condition_tick: 0.0,
            ..ClockConfig::default()
        };
        let clock = Clock::with_config(config).unwrap();
        clock
            .event_when(Action::noop(), Condition::at_or_after(0.5))
            .unwrap();
        assert_eq!(clock.step(), Err(ClockError::NoMoreEvents { time: 0.0 }));

        // an event still triggers a recheck
        clock.event(Action::noop(), 1.0).unwrap();
        let report = clock.step().unwrap();
        assert_eq!(report.conditions, 1);
    }

    #[test]
    fn test_panicking_action_leaves_clock_usable() {
        let clock = Clock::new();
        clock.event(Action::new(|_| panic!("action failed")), 1.0).unwrap();
        clock.event(Action::noop(), 2.0).unwrap();

        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| clock.run(5.0)));
        assert!(unwound.is_err());
        assert_eq!(clock.state(), ClockState::Halted);
        assert!(!clock.is_locked());

        let summary = clock.run(5.0).unwrap();
        assert_eq!(summary.events_executed, 1);
        assert_eq!(clock.now(), 5.0);
    }

    #[test]
    fn test_cancel_event_and_watch() {
        let clock = Clock::new();
        let (log, make) = recorder();
        let h = clock.event(make("gone"), 1.0).unwrap();
        let w = clock.event_when(make("never"), Condition::new(|_| true)).unwrap();

        assert!(clock.cancel(h));
        assert!(!clock.cancel(h));
        assert!(clock.cancel_watch(w));
        assert!(!clock.cancel_watch(w));

        clock.run(2.0).unwrap();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_every_repeats_until_cancelled() {
        let clock = Clock::new();
        let times = Rc::new(RefCell::new(Vec::new()));
        let t = times.clone();
        let id = clock.every(move |c| t.borrow_mut().push(c.now()), 1.0, 2.0).unwrap();

        clock.run(6.0).unwrap();
        assert_eq!(*times.borrow(), vec![1.0, 3.0, 5.0]);

        assert!(clock.cancel_repeat(id));
        clock.run(10.0).unwrap();
        assert_eq!(times.borrow().len(), 3);
        assert_eq!(clock.every(|_| {}, 10.0, 0.0), Err(ClockError::InvalidTime(0.0)));
    }

    #[test]
    fn test_halt_stops_run_early() {
        let clock = Clock::new();
        clock.event(Action::new(|c| c.halt()), 2.0).unwrap();
        clock.event(Action::noop(), 4.0).unwrap();

        let summary = clock.run(10.0).unwrap();
        assert!(summary.halted);
        assert_eq!(summary.final_time, 2.0);
        assert_eq!(clock.state(), ClockState::Halted);

        let summary = clock.run(10.0).unwrap();
        assert!(!summary.halted);
        assert_eq!(summary.events_executed, 1);
        assert_eq!(summary.final_time, 10.0);
    }

    #[test]
    fn test_step_limit() {
        let config = ClockConfig {
            max_steps: 3,
            ..ClockConfig::default()
        };
        let clock = Clock::with_config(config).unwrap();
        clock.set_tick(1.0).unwrap();
        assert_eq!(
            clock.run(10.0),
            Err(ClockError::StepLimit { limit: 3, time: 3.0 })
        );
    }

    #[test]
    fn test_zero_delay_livelock_is_bounded() {
        fn again(clock: &Clock) {
            let _ = clock.event(Action::new(again), clock.now());
        }
        let config = ClockConfig {
            max_events_per_instant: 50,
            ..ClockConfig::default()
        };
        let clock = Clock::with_config(config).unwrap();
        clock.event(Action::new(again), 0.0).unwrap();
        assert_eq!(
            clock.step(),
            Err(ClockError::StepLimit { limit: 50, time: 0.0 })
        );
    }

    #[test]
    fn test_nested_run_is_rejected() {
        let clock = Clock::new();
        let nested = Rc::new(RefCell::new(None));
        let n = nested.clone();
        clock
            .event(Action::new(move |c| *n.borrow_mut() = Some(c.run(5.0))), 1.0)
            .unwrap();
        clock.run(2.0).unwrap();
        assert_eq!(*nested.borrow(), Some(Err(ClockError::AlreadyRunning)));
    }

    #[test]
    fn test_sync_holds_lock() {
        let clock = Clock::new();
        assert!(clock.sync(|c| c.is_locked()));
        assert!(!clock.is_locked());

        // re-entrant from inside a step
        let inside = Rc::new(Cell::new(false));
        let i = inside.clone();
        clock
            .event(Action::new(move |c| i.set(c.sync(|c| c.is_locked()))), 1.0)
            .unwrap();
        clock.run(1.0).unwrap();
        assert!(inside.get());
    }

    #[test]
    fn test_sync_releases_on_panic() {
        let clock = Clock::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            clock.sync(|_| panic!("boom"));
        }));
        assert!(result.is_err());
        assert!(!clock.is_locked());
    }

    #[test]
    fn test_reset_restores_fresh_clock() {
        let clock = Clock::new();
        clock.set_tick(1.0).unwrap();
        clock.sample(SampleAction::new(|_| {}));
        clock.event(Action::noop(), 5.0).unwrap();
        clock.event_when(Action::noop(), Condition::new(|_| false)).unwrap();
        clock.run(2.0).unwrap();

        clock.reset().unwrap();
        assert_eq!(clock.now(), 0.0);
        assert_eq!(clock.tick(), 0.0);
        assert_eq!(clock.state(), ClockState::Idle);
        assert_eq!(clock.pending_events(), 0);
        assert_eq!(clock.pending_conditions(), 0);
        assert_eq!(clock.sample_count(), 0);
        assert_eq!(clock.events_executed(), 0);
    }
}
