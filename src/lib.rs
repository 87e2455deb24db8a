//! # Boottime Timeout
//!
//! Single-shot timeouts for a cooperative, single-threaded event loop that
//! stay correct across suspend and resume.
//!
//! A timeout is measured on `CLOCK_BOOTTIME`, which keeps counting while the
//! machine sleeps. A 30 second timeout armed just before a 10 second suspend
//! fires about 20 seconds after resume, where a plain monotonic timer would
//! wait the full 30.
//!
//! ## Features
//!
//! - **Suspend-aware**: Backed by a `CLOCK_BOOTTIME` timerfd
//! - **Fire once**: The callback runs at most once, then the source removes itself
//! - **Exactly-once release**: The release hook runs once on dispatch, cancellation or loop shutdown
//! - **Degrade, don't fail**: Kernel timer failures leave one inert timer and a log line
//! - **Pluggable loop**: Works with [`MainLoop`] or any [`EventLoop`] implementation
//! - **Tokio integration**: [`MainLoop::run`] drives the loop from a Tokio runtime
//!
//! ## Quick Start
//!
//! ```rust
//! use boottime_timeout::{schedule_once, Callback, MainLoop, Priority};
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut main_loop = MainLoop::new("my_loop".to_string(), 16)?;
//!     let fired = Rc::new(Cell::new(false));
//!
//!     let callback: Callback<Rc<Cell<bool>>> =
//!         Box::new(|fired: &mut Rc<Cell<bool>>| fired.set(true));
//!     schedule_once(
//!         &mut main_loop,
//!         Priority::DEFAULT,
//!         0,
//!         Some(callback),
//!         Rc::clone(&fired),
//!         None,
//!     )?;
//!
//!     while !fired.get() {
//!         main_loop.iteration(true)?;
//!     }
//!     Ok(())
//! }
//! ```

#[macro_use]
mod sys;

pub mod clock;
mod error;
mod main_loop;
mod source;
mod timeout;

pub use clock::{Boottime, Countdown, ManualClock, SuspendAwareClock};
pub use error::{Error, Result};
pub use main_loop::{EventLoop, LoopHandle, MainLoop};
pub use source::{Control, Prepared, Priority, Readiness, Registration, Source, SourceId};
pub use timeout::{
    schedule_once, schedule_once_default, schedule_once_with_clock, Callback, ReleaseNotify,
    TimeoutOnce, TimerState,
};

// Re-export commonly used types for convenience
pub use std::time::Duration;
pub use tokio_util::sync::CancellationToken;
