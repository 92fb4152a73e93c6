//! Discrete-Event Simulation Clock
//!
//! A single-threaded simulation kernel with:
//! - A virtual clock that only moves when the scheduler loop steps it
//! - Timed events (FIFO among equal times) and conditional events
//! - Periodic sampling on a fixed tick
//! - Suspendable processes (`delay` / `wait`) driven by a deterministic executor
//! - Interrupt signals, including `Stop`, delivered at suspension points
//!
//! ```
//! use des_clock::{Action, Clock, ProcessCtx, ProcessError};
//!
//! let clock = Clock::new();
//! clock.event(Action::new(|c| println!("tick at {}", c.now())), 5.0).unwrap();
//! clock
//!     .process(
//!         "walker",
//!         |ctx: ProcessCtx| async move {
//!             ctx.delay(2.0).await?;
//!             Ok::<_, ProcessError>(())
//!         },
//!         1u64,
//!     )
//!     .unwrap();
//! let summary = clock.run(10.0).unwrap();
//! assert_eq!(summary.final_time, 10.0);
//! ```

pub mod action;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod process;
pub mod queue;
pub mod signal;
pub mod wakeup;


pub use action::{Action, Condition, SampleAction};
pub use clock::{Clock, ClockState, RepeatId, RunSummary, SampleId, StepReport, WatchId};
pub use config::ClockConfig;
pub use context::{ProcessCtx, Suspend};
pub use error::{ClockError, ConfigError, ProcessError};
pub use process::{Cycles, Process, ProcessEvent, ProcessId, ProcessOutcome, ProcessState};
pub use queue::{EventHandle, EventQueue};
pub use signal::{Interrupt, Payload, Signal};
