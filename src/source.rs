//! The contract between an event loop and the sources it drives.
//!
//! A loop calls [`Source::prepare`] before each wait, [`Source::check`] after
//! it, and [`Source::dispatch`] on every source that reported ready. Teardown
//! is the source's `Drop`: a loop releases a source by dropping it.

use std::fmt;
use std::num::NonZeroU32;
use std::os::fd::RawFd;
use std::time::Duration;

/// Identifier of a source attached to a loop. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(NonZeroU32);

impl SourceId {
    /// `None` for zero, which never identifies a source
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// Raw numeric value
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dispatch priority. Lower values are dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    pub const HIGH: Priority = Priority(-100);
    pub const DEFAULT: Priority = Priority(0);
    pub const HIGH_IDLE: Priority = Priority(100);
    pub const DEFAULT_IDLE: Priority = Priority(200);
    pub const LOW: Priority = Priority(300);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::DEFAULT
    }
}

/// Result of [`Source::prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prepared {
    /// The source can be dispatched without waiting.
    pub ready: bool,
    /// Upper bound on how long the loop may block for this source.
    pub timeout: Option<Duration>,
}

impl Prepared {
    /// Not ready; block until a descriptor becomes readable.
    pub const WAIT: Prepared = Prepared {
        ready: false,
        timeout: None,
    };
}

/// Result of [`Source::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Remove,
}

/// Readiness observed for a source's descriptor during one wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub error: bool,
    pub hangup: bool,
}

impl Readiness {
    pub const NONE: Readiness = Readiness {
        readable: false,
        error: false,
        hangup: false,
    };

    pub const READABLE: Readiness = Readiness {
        readable: true,
        error: false,
        hangup: false,
    };

    pub(crate) fn from_epoll(events: u32) -> Self {
        Readiness {
            readable: events & libc::EPOLLIN as u32 != 0,
            error: events & libc::EPOLLERR as u32 != 0,
            hangup: events & libc::EPOLLHUP as u32 != 0,
        }
    }

    /// Nothing was reported for the descriptor
    pub fn is_empty(&self) -> bool {
        !(self.readable || self.error || self.hangup)
    }
}

/// Membership of one descriptor in a loop's watch set.
///
/// Dropping the registration removes the descriptor from the watch set.
#[must_use = "dropping a Registration deregisters the descriptor"]
pub struct Registration {
    deregister: Option<Box<dyn FnOnce()>>,
}

impl Registration {
    pub fn new(deregister: impl FnOnce() + 'static) -> Self {
        Self {
            deregister: Some(Box::new(deregister)),
        }
    }

    /// A registration that nothing has to undo.
    pub fn detached() -> Self {
        Self { deregister: None }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("attached", &self.deregister.is_some())
            .finish()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(deregister) = self.deregister.take() {
            deregister();
        }
    }
}

/// A pollable event source driven by an event loop.
pub trait Source {
    /// Name used in diagnostics
    fn name(&self) -> &str;

    /// Descriptor the loop should watch for read readiness.
    fn descriptor(&self) -> Option<RawFd>;

    /// Hand the source ownership of its watch-set registration.
    fn attach(&mut self, registration: Registration);

    fn prepare(&mut self) -> Prepared;

    /// Decide readiness after the wait. `readiness` is empty when the
    /// descriptor was not reported (or the source has none).
    fn check(&mut self, readiness: Readiness) -> bool;

    fn dispatch(&mut self) -> Control;

    /// The source can never become ready because its setup failed.
    fn is_degenerate(&self) -> bool {
        false
    }
}
