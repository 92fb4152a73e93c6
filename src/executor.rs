//! Single-threaded deterministic executor
//!
//! Drives process bodies. Tasks are polled in the order they were woken,
//! so two runs that wake the same tasks in the same order observe the same
//! interleaving. At most one task runs at a time; a drain requested while
//! another drain is in progress returns immediately and the outer drain
//! picks up whatever was woken.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, VecDeque},
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, RawWaker, RawWakerVTable, Waker},
};
use tracing::trace;

/// Identifier of a spawned task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

/// A task in the executor.
pub struct Task {
    id: TaskId,
    /// `None` once the task finished or was cancelled.
    fut: RefCell<Option<Pin<Box<dyn Future<Output = ()>>>>>,
    /// Whether this task is currently in the ready queue.
    scheduled: Cell<bool>,
    /// Completed tasks are never polled again.
    completed: Cell<bool>,
    exec: Weak<RefCell<ExecutorInner>>,
}

struct ExecutorInner {
    /// FIFO queue of ready tasks.
    ready: VecDeque<Rc<Task>>,
    /// Every task that has not completed, by id.
    live: BTreeMap<TaskId, Rc<Task>>,
    next_id: u64,
}

/// Single-threaded deterministic executor.
pub struct Executor {
    inner: Rc<RefCell<ExecutorInner>>,
    draining: Cell<bool>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(ExecutorInner {
                ready: VecDeque::new(),
                live: BTreeMap::new(),
                next_id: 0,
            })),
            draining: Cell::new(false),
        }
    }

    /// Spawn a new task. It first runs on the next drain.
    pub fn spawn(&self, fut: impl Future<Output = ()> + 'static) -> TaskId {
        let task = {
            let mut inner = self.inner.borrow_mut();
            let id = TaskId(inner.next_id);
            inner.next_id += 1;
            let task = Rc::new(Task {
                id,
                fut: RefCell::new(Some(Box::pin(fut))),
                scheduled: Cell::new(false),
                completed: Cell::new(false),
                exec: Rc::downgrade(&self.inner),
            });
            inner.live.insert(id, task.clone());
            task
        };
        let id = task.id;
        self.enqueue(&task);
        id
    }

    fn enqueue(&self, task: &Rc<Task>) {
        if task.completed.get() {
            return;
        }
        if task.scheduled.replace(true) {
            return; // Already queued
        }
        self.inner.borrow_mut().ready.push_back(task.clone());
    }

    /// Poll ready tasks until none are left.
    /// Returns the number of polls performed; 0 when called re-entrantly.
    pub fn run_until_stalled(&self) -> usize {
        if self.draining.replace(true) {
            return 0;
        }
        let _draining = DrainGuard(&self.draining);
        let mut polls = 0;
        loop {
            let task = self.inner.borrow_mut().ready.pop_front();
            let Some(task) = task else {
                break;
            };

            task.scheduled.set(false);

            // Stale wakers may have re-added a finished task
            if task.completed.get() {
                continue;
            }

            polls += 1;
            trace!(task = task.id.0, "polling task");

            let waker = task_waker(&task);
            let mut cx = Context::from_waker(&waker);

            let poll = match task.fut.borrow_mut().as_mut() {
                Some(fut) => fut.as_mut().poll(&mut cx),
                None => Poll::Ready(()),
            };
            if poll.is_ready() || task.completed.get() {
                self.finish(&task);
            }
        }
        polls
    }

    fn finish(&self, task: &Rc<Task>) {
        task.completed.set(true);
        self.inner.borrow_mut().live.remove(&task.id);
        let fut = task.fut.borrow_mut().take();
        drop(fut);
    }

    /// Cancel a task, dropping its future. Returns false if it already finished.
    /// A task that is being polled right now is dropped when its poll returns.
    pub fn cancel(&self, id: TaskId) -> bool {
        let task = self.inner.borrow_mut().live.remove(&id);
        let Some(task) = task else {
            return false;
        };
        task.completed.set(true);
        if let Ok(mut slot) = task.fut.try_borrow_mut() {
            let fut = slot.take();
            drop(slot);
            drop(fut);
        }
        true
    }

    /// Cancel every live task.
    pub fn clear(&self) {
        let ids: Vec<TaskId> = self.inner.borrow().live.keys().copied().collect();
        for id in ids {
            self.cancel(id);
        }
        self.inner.borrow_mut().ready.clear();
    }

    pub fn has_ready_tasks(&self) -> bool {
        !self.inner.borrow().ready.is_empty()
    }

    /// Number of tasks that have not completed.
    pub fn live_tasks(&self) -> usize {
        self.inner.borrow().live.len()
    }
}

/// Clears the draining flag when a drain ends, unwinding included.
struct DrainGuard<'a>(&'a Cell<bool>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

// --- Waker implementation ---

fn task_waker(task: &Rc<Task>) -> Waker {
    unsafe fn clone_fn(data: *const ()) -> RawWaker {
        let task = Rc::<Task>::from_raw(data as *const Task);
        let cloned = task.clone();
        std::mem::forget(task);
        RawWaker::new(Rc::into_raw(cloned) as *const (), &VTABLE)
    }

    unsafe fn wake_fn(data: *const ()) {
        wake_by_ref_fn(data);
        drop_fn(data);
    }

    unsafe fn wake_by_ref_fn(data: *const ()) {
        let task = Rc::<Task>::from_raw(data as *const Task);
        if !task.completed.get() {
            if let Some(exec) = task.exec.upgrade() {
                // FIFO in wake order
                if !task.scheduled.replace(true) {
                    exec.borrow_mut().ready.push_back(task.clone());
                }
            }
        }
        std::mem::forget(task);
    }

    unsafe fn drop_fn(data: *const ()) {
        drop(Rc::<Task>::from_raw(data as *const Task));
    }

    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_fn, wake_fn, wake_by_ref_fn, drop_fn);

    let raw = RawWaker::new(Rc::into_raw(task.clone()) as *const (), &VTABLE);
    unsafe { Waker::from_raw(raw) }
}
