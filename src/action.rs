//! Actions and conditions
//!
//! An [`Action`] is the unit of work the clock invokes: a callable with its
//! arguments already bound. How the callable was built is the caller's
//! business; the clock only ever calls it with a reference to itself so it
//! can read the time and schedule follow-up work.

use crate::clock::Clock;
use crate::error::ClockError;
use std::fmt;
use std::rc::Rc;

type OnceFn = Box<dyn FnOnce(&Clock) -> Result<(), ClockError>>;
type MutFn = Box<dyn FnMut(&Clock) -> Result<(), ClockError>>;
type Predicate = Rc<dyn Fn(&Clock) -> bool>;

/// One-shot unit of work for events and conditional events.
pub struct Action(OnceFn);

impl Action {
    pub fn new(f: impl FnOnce(&Clock) + 'static) -> Self {
        Action(Box::new(move |clock| {
            f(clock);
            Ok(())
        }))
    }

    /// An action whose error aborts the step that invoked it.
    pub fn fallible(f: impl FnOnce(&Clock) -> Result<(), ClockError> + 'static) -> Self {
        Action(Box::new(f))
    }

    /// Bind `args` to `f`.
    pub fn call<A: 'static>(f: impl FnOnce(&Clock, A) + 'static, args: A) -> Self {
        Action::new(move |clock| f(clock, args))
    }

    pub fn noop() -> Self {
        Action::new(|_| {})
    }

    pub(crate) fn invoke(self, clock: &Clock) -> Result<(), ClockError> {
        (self.0)(clock)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Action(..)")
    }
}

/// Repeatable unit of work for the sampling registry.
pub struct SampleAction(MutFn);

impl SampleAction {
    pub fn new(mut f: impl FnMut(&Clock) + 'static) -> Self {
        SampleAction(Box::new(move |clock| {
            f(clock);
            Ok(())
        }))
    }

    pub fn fallible(f: impl FnMut(&Clock) -> Result<(), ClockError> + 'static) -> Self {
        SampleAction(Box::new(f))
    }

    pub(crate) fn invoke(&mut self, clock: &Clock) -> Result<(), ClockError> {
        (self.0)(clock)
    }
}

impl fmt::Debug for SampleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SampleAction(..)")
    }
}

/// A conjunction of predicates. Satisfied only when every predicate holds
/// at the same check; an empty condition always holds.
#[derive(Clone, Default)]
pub struct Condition {
    predicates: Vec<Predicate>,
}

impl Condition {
    pub fn new(predicate: impl Fn(&Clock) -> bool + 'static) -> Self {
        Self {
            predicates: vec![Rc::new(predicate)],
        }
    }

    /// Holds once virtual time has reached `t`.
    pub fn at_or_after(t: f64) -> Self {
        Self::new(move |clock| clock.now() >= t)
    }

    /// Combine several conditions into one.
    pub fn all(conditions: impl IntoIterator<Item = Condition>) -> Self {
        Self {
            predicates: conditions
                .into_iter()
                .flat_map(|c| c.predicates)
                .collect(),
        }
    }

    pub fn and(mut self, predicate: impl Fn(&Clock) -> bool + 'static) -> Self {
        self.predicates.push(Rc::new(predicate));
        self
    }

    pub fn holds(&self, clock: &Clock) -> bool {
        self.predicates.iter().all(|p| p(clock))
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

impl From<Vec<Condition>> for Condition {
    fn from(conditions: Vec<Condition>) -> Self {
        Condition::all(conditions)
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Condition({} predicates)", self.predicates.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_bound_arguments() {
        let clock = Clock::new();
        let seen = Rc::new(Cell::new(0));
        let action = Action::call(|_, (cell, n): (Rc<Cell<i32>>, i32)| cell.set(n), (seen.clone(), 7));
        action.invoke(&clock).unwrap();
        assert_eq!(seen.get(), 7);
    }

    #[test]
    fn test_fallible_action_propagates() {
        let clock = Clock::new();
        let action = Action::fallible(|_| Err(ClockError::EmptyQueue));
        assert_eq!(action.invoke(&clock), Err(ClockError::EmptyQueue));
    }

    #[test]
    fn test_condition_is_a_conjunction() {
        let clock = Clock::new();
        let flag = Rc::new(Cell::new(false));

        let f = flag.clone();
        let cond = Condition::all(vec![Condition::at_or_after(0.0), Condition::new(move |_| f.get())]);
        assert_eq!(cond.len(), 2);
        assert!(!cond.holds(&clock));

        flag.set(true);
        assert!(cond.holds(&clock));
        assert!(!cond.clone().and(|_| false).holds(&clock));
        assert!(Condition::default().holds(&clock));
    }
}
