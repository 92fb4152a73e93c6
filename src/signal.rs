//! Interrupt signals delivered to suspended processes.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

/// A signal that unwinds a process from its current suspension point.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Terminates the process cleanly.
    Stop,
    /// Any caller-defined signal. Propagates out of the process unless its
    /// body handles it.
    Named(String),
}

impl Signal {
    pub fn named(name: impl Into<String>) -> Self {
        Signal::Named(name.into())
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Signal::Stop)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Stop => write!(f, "Stop"),
            Signal::Named(name) => write!(f, "{}", name),
        }
    }
}

/// Opaque value attached to an interrupt.
#[derive(Clone)]
pub struct Payload(Rc<dyn Any>);

impl Payload {
    pub fn new<T: Any>(value: T) -> Self {
        Payload(Rc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Payload(..)")
    }
}

// Payloads carry no equality of their own; two payloads are equal when
// they share the same allocation.
impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// A delivered signal and its optional value.
#[derive(Clone, Debug, PartialEq)]
pub struct Interrupt {
    pub signal: Signal,
    pub value: Option<Payload>,
}

impl Interrupt {
    pub fn new(signal: Signal, value: Option<Payload>) -> Self {
        Self { signal, value }
    }

    /// Downcast the attached value.
    pub fn value<T: Any>(&self) -> Option<&T> {
        self.value.as_ref().and_then(|p| p.downcast_ref::<T>())
    }
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_downcast() {
        let i = Interrupt::new(Signal::named("miss"), Some(Payload::new(42u32)));
        assert_eq!(i.value::<u32>(), Some(&42));
        assert_eq!(i.value::<String>(), None);
        assert_eq!(i.to_string(), "miss");
    }

    #[test]
    fn test_payload_equality_is_identity() {
        let p = Payload::new("x");
        let q = Payload::new("x");
        assert_eq!(p, p.clone());
        assert_ne!(p, q);
    }
}
