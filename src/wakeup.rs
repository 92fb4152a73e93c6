//! One-shot wake slot
//!
//! The synchronization point between the scheduler loop and a suspended
//! process. The clock fires it exactly once, either with `Ok` (resume
//! normally) or with an interrupt; the suspended future picks up the
//! outcome on its next poll.

use crate::signal::Interrupt;
use std::cell::RefCell;
use std::rc::Rc;
use std::task::Waker;

/// Shared wake state between a suspension future and the clock.
#[derive(Clone)]
pub struct Wakeup {
    inner: Rc<RefCell<WakeupInner>>,
}

struct WakeupInner {
    outcome: Option<Result<(), Interrupt>>,
    waker: Option<Waker>,
}

impl Wakeup {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(WakeupInner {
                outcome: None,
                waker: None,
            })),
        }
    }

    pub fn set_waker(&self, w: &Waker) {
        self.inner.borrow_mut().waker = Some(w.clone());
    }

    /// Resume the waiter normally. Ignored once fired.
    pub fn fire(&self) -> bool {
        self.complete(Ok(()))
    }

    /// Resume the waiter with an interrupt. Ignored once fired.
    pub fn interrupt(&self, interrupt: Interrupt) -> bool {
        self.complete(Err(interrupt))
    }

    fn complete(&self, outcome: Result<(), Interrupt>) -> bool {
        let waker = {
            let mut s = self.inner.borrow_mut();
            if s.outcome.is_some() {
                return false;
            }
            s.outcome = Some(outcome);
            s.waker.take()
        };
        // Wake outside the borrow: the executor may poll re-entrantly.
        if let Some(w) = waker {
            w.wake();
        }
        true
    }

    pub fn same_as(&self, other: &Wakeup) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_fired(&self) -> bool {
        self.inner.borrow().outcome.is_some()
    }

    /// The outcome, if fired.
    pub fn outcome(&self) -> Option<Result<(), Interrupt>> {
        self.inner.borrow().outcome.clone()
    }
}

impl Default for Wakeup {
    fn default() -> Self {
        Self::new()
    }
}
