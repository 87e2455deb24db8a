use std::cell::Cell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use super::{Countdown, SuspendAwareClock};

#[derive(Debug, Default)]
struct Inner {
    boottime: Cell<Duration>,
    monotonic: Cell<Duration>,
    live: Cell<usize>,
    fail_next_countdown: Cell<bool>,
    fail_next_arm: Cell<bool>,
}

/// A simulated suspend-aware clock for tests.
///
/// Time only moves when told to. [`ManualClock::advance`] models the machine
/// running, [`ManualClock::suspend`] models it sleeping: boot time advances in
/// both cases, the awake-only [`ManualClock::monotonic`] reading only in the
/// first. Countdowns handed out by this clock have no descriptor, so a loop
/// finds them ready through `check` alone.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    inner: Rc<Inner>,
}

impl ManualClock {
    /// Clock at boot time zero with no countdowns
    pub fn new() -> Self {
        Self::default()
    }

    /// Elapsed time including suspended periods.
    pub fn boottime(&self) -> Duration {
        self.inner.boottime.get()
    }

    /// Elapsed time excluding suspended periods.
    pub fn monotonic(&self) -> Duration {
        self.inner.monotonic.get()
    }

    pub fn advance(&self, by: Duration) {
        self.inner.boottime.set(self.inner.boottime.get() + by);
        self.inner.monotonic.set(self.inner.monotonic.get() + by);
    }

    pub fn suspend(&self, by: Duration) {
        self.inner.boottime.set(self.inner.boottime.get() + by);
    }

    /// Make the next `countdown()` call fail as if the kernel were out of timers.
    pub fn fail_next_countdown(&self) {
        self.inner.fail_next_countdown.set(true);
    }

    /// Make the next `arm()` on any countdown of this clock fail.
    pub fn fail_next_arm(&self) {
        self.inner.fail_next_arm.set(true);
    }

    /// Number of countdowns created by this clock that are still alive.
    pub fn live_countdowns(&self) -> usize {
        self.inner.live.get()
    }
}

impl SuspendAwareClock for ManualClock {
    type Countdown = ManualCountdown;

    fn countdown(&self) -> io::Result<ManualCountdown> {
        if self.inner.fail_next_countdown.replace(false) {
            return Err(io::Error::from_raw_os_error(libc::EMFILE));
        }
        self.inner.live.set(self.inner.live.get() + 1);
        Ok(ManualCountdown {
            clock: Rc::clone(&self.inner),
            deadline: None,
        })
    }
}

/// Countdown against a [`ManualClock`].
#[derive(Debug)]
pub struct ManualCountdown {
    clock: Rc<Inner>,
    deadline: Option<Duration>,
}

impl Countdown for ManualCountdown {
    fn arm(&mut self, delay: Duration) -> io::Result<()> {
        if self.clock.fail_next_arm.replace(false) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        self.deadline = Some(self.clock.boottime.get() + delay);
        Ok(())
    }

    fn descriptor(&self) -> Option<RawFd> {
        None
    }

    fn take_expirations(&mut self) -> io::Result<u64> {
        match self.deadline {
            Some(deadline) if self.clock.boottime.get() >= deadline => {
                self.deadline = None;
                Ok(1)
            }
            _ => Ok(0),
        }
    }
}

impl Drop for ManualCountdown {
    fn drop(&mut self) {
        self.clock.live.set(self.clock.live.get() - 1);
    }
}
