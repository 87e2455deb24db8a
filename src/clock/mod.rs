//! Suspend-aware countdown objects.
//!
//! A [`SuspendAwareClock`] hands out single-shot [`Countdown`]s measured on a
//! clock that keeps running while the machine is suspended. On Linux that is
//! `CLOCK_BOOTTIME` exposed through a timerfd ([`Boottime`]); [`ManualClock`]
//! simulates the same behaviour for deterministic tests.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

pub mod manual;
pub mod timerfd;

pub use manual::{ManualClock, ManualCountdown};
pub use timerfd::{Boottime, TimerFd};

/// Factory for suspend-aware countdowns.
pub trait SuspendAwareClock {
    type Countdown: Countdown + 'static;

    /// Create a new, disarmed countdown.
    fn countdown(&self) -> io::Result<Self::Countdown>;
}

/// A single-shot countdown on a suspend-aware clock.
pub trait Countdown {
    /// Program the countdown to expire `delay` from now.
    fn arm(&mut self, delay: Duration) -> io::Result<()>;

    /// Descriptor that becomes readable on expiry, if the countdown has one.
    fn descriptor(&self) -> Option<RawFd>;

    /// Consume pending expirations without blocking.
    ///
    /// Returns 0 if the countdown has not expired yet.
    fn take_expirations(&mut self) -> io::Result<u64>;
}

/// Convert a single-shot delay into a kernel `itimerspec`.
///
/// An all-zero `it_value` disarms a timerfd, so a zero delay is programmed
/// as the shortest representable one.
pub(crate) fn itimerspec_for(delay: Duration) -> libc::itimerspec {
    let delay_ms = delay.as_millis();
    let (tv_sec, tv_nsec) = if delay_ms == 0 {
        (0, 1)
    } else {
        (
            (delay_ms / 1000).min(libc::time_t::MAX as u128) as libc::time_t,
            ((delay_ms % 1000) * 1_000_000) as libc::c_long,
        )
    };

    libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec { tv_sec, tv_nsec },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_itimerspec_splits_milliseconds() {
        let spec = itimerspec_for(Duration::from_millis(2_500));
        assert_eq!(spec.it_value.tv_sec, 2);
        assert_eq!(spec.it_value.tv_nsec, 500_000_000);
        assert_eq!(spec.it_interval.tv_sec, 0);
        assert_eq!(spec.it_interval.tv_nsec, 0);
    }

    #[test]
    fn test_itimerspec_whole_seconds() {
        let spec = itimerspec_for(Duration::from_secs(30));
        assert_eq!(spec.it_value.tv_sec, 30);
        assert_eq!(spec.it_value.tv_nsec, 0);
    }

    #[test]
    fn test_zero_delay_stays_armed() {
        let spec = itimerspec_for(Duration::ZERO);
        assert_eq!(spec.it_value.tv_sec, 0);
        assert_ne!(spec.it_value.tv_nsec, 0);
    }
}
