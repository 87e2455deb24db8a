//! Single-shot, suspend-aware timeout sources.
//!
//! A [`TimeoutOnce`] owns one countdown on a suspend-aware clock. It arms the
//! countdown on the first `prepare`, becomes ready when the countdown
//! expires, runs its callback once and asks the loop to remove it. Dropping
//! the source closes the countdown, removes its watch-set registration and
//! runs the release hook; whatever path leads there, that happens once.

use std::fmt;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::clock::{Boottime, Countdown, SuspendAwareClock};
use crate::error::{Error, Result};
use crate::main_loop::EventLoop;
use crate::source::{Control, Prepared, Priority, Readiness, Registration, Source, SourceId};

/// Called once on expiry with the user data.
pub type Callback<T> = Box<dyn FnOnce(&mut T)>;

/// Called once when the timer lets go of the user data.
pub type ReleaseNotify<T> = Box<dyn FnOnce(T)>;

const SOURCE_NAME: &str = "boottime timeout source";

/// Lifecycle of a [`TimeoutOnce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Created, countdown not yet programmed.
    Unarmed,
    /// Countdown programmed, waiting for expiry.
    Armed,
    /// Callback has run. Terminal.
    Dispatched,
    /// The countdown object could not be created. Never becomes ready.
    Degenerate,
}

pub struct TimeoutOnce<T, K: Countdown> {
    countdown: Option<K>,
    registration: Option<Registration>,
    delay: Duration,
    armed: bool,
    state: TimerState,
    callback: Option<Callback<T>>,
    data: Option<T>,
    on_release: Option<ReleaseNotify<T>>,
}

impl<T, K: Countdown> TimeoutOnce<T, K> {
    /// Build a timeout source on `clock`.
    ///
    /// If the clock cannot produce a countdown the source is still returned,
    /// in the [`TimerState::Degenerate`] state: it never fires, but it can be
    /// attached and removed like any other source.
    pub fn new<C>(
        clock: &C,
        delay: Duration,
        callback: Callback<T>,
        data: T,
        on_release: Option<ReleaseNotify<T>>,
    ) -> Self
    where
        C: SuspendAwareClock<Countdown = K>,
    {
        let (countdown, state) = match clock.countdown() {
            Ok(countdown) => (Some(countdown), TimerState::Unarmed),
            Err(e) => {
                log::warn!("{}", Error::ClockCreate(e));
                (None, TimerState::Degenerate)
            }
        };

        TimeoutOnce {
            countdown,
            registration: None,
            delay,
            armed: false,
            state,
            callback: Some(callback),
            data: Some(data),
            on_release,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> TimerState {
        self.state
    }

    /// Delay programmed into the countdown on the first prepare
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Whether the countdown has been programmed
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Close the countdown, drop the registration and run the release hook.
    /// Safe to call more than once.
    fn release(&mut self) {
        // Deregister while the descriptor is still open.
        self.registration.take();
        let had_countdown = self.countdown.take().is_some();
        self.armed = false;
        self.callback.take();

        if let Some(data) = self.data.take() {
            if let Some(on_release) = self.on_release.take() {
                on_release(data);
            }
        }

        if had_countdown {
            log::debug!("Finalize {} ({:?})", SOURCE_NAME, self.state);
        }
    }
}

impl<T, K: Countdown> Source for TimeoutOnce<T, K> {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn descriptor(&self) -> Option<RawFd> {
        self.countdown.as_ref().and_then(|countdown| countdown.descriptor())
    }

    fn attach(&mut self, registration: Registration) {
        self.registration = Some(registration);
    }

    fn prepare(&mut self) -> Prepared {
        if self.armed {
            return Prepared::WAIT;
        }
        let Some(countdown) = self.countdown.as_mut() else {
            return Prepared::WAIT;
        };

        log::debug!("Timeout prepare: {}s for {}", self.delay.as_secs(), SOURCE_NAME);
        if let Err(e) = countdown.arm(self.delay) {
            log::warn!("{}", Error::Arm(e));
        }

        self.armed = true;
        self.state = TimerState::Armed;
        Prepared::WAIT
    }

    fn check(&mut self, readiness: Readiness) -> bool {
        if !self.armed {
            return false;
        }
        let Some(countdown) = self.countdown.as_mut() else {
            return false;
        };
        if countdown.descriptor().is_some() && readiness.is_empty() {
            return false;
        }

        match countdown.take_expirations() {
            Ok(expirations) => expirations > 0,
            Err(e) => {
                log::warn!("Failed to read timer expirations: {}", e);
                false
            }
        }
    }

    fn dispatch(&mut self) -> Control {
        let Some(callback) = self.callback.take() else {
            log::warn!("Timeout source dispatched without callback");
            return Control::Remove;
        };

        log::debug!("Dispatch {}", SOURCE_NAME);
        if let Some(data) = self.data.as_mut() {
            callback(data);
        }
        self.state = TimerState::Dispatched;

        Control::Remove
    }

    fn is_degenerate(&self) -> bool {
        self.state == TimerState::Degenerate
    }
}

impl<T, K: Countdown> Drop for TimeoutOnce<T, K> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T, K: Countdown> fmt::Debug for TimeoutOnce<T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutOnce")
            .field("delay", &self.delay)
            .field("state", &self.state)
            .field("armed", &self.armed)
            .field("descriptor", &self.descriptor())
            .finish()
    }
}

/// Call `callback` once, `delay_seconds` of `CLOCK_BOOTTIME` time from the
/// loop's next iteration.
///
/// Boot time keeps counting while the machine is suspended, so the timeout
/// stays correct across suspend and resume.
///
/// # Arguments
/// * `event_loop` - Loop the timeout source is attached to
/// * `priority` - Dispatch priority of the source
/// * `delay_seconds` - Delay until the callback runs
/// * `callback` - Invoked with `user_data`; `None` is rejected
/// * `user_data` - Value handed to `callback` and then to `on_release`
/// * `on_release` - Invoked once when the source lets go of `user_data`
///
/// Returns the id to pass to [`EventLoop::remove`] for cancellation. A
/// source whose timer object could not be created is still attached but
/// never fires.
pub fn schedule_once<L, T>(
    event_loop: &mut L,
    priority: Priority,
    delay_seconds: u64,
    callback: Option<Callback<T>>,
    user_data: T,
    on_release: Option<ReleaseNotify<T>>,
) -> Result<SourceId>
where
    L: EventLoop + ?Sized,
    T: 'static,
{
    schedule_once_with_clock(
        &Boottime,
        event_loop,
        priority,
        delay_seconds,
        callback,
        user_data,
        on_release,
    )
}

/// [`schedule_once`] against an arbitrary suspend-aware clock.
pub fn schedule_once_with_clock<C, L, T>(
    clock: &C,
    event_loop: &mut L,
    priority: Priority,
    delay_seconds: u64,
    callback: Option<Callback<T>>,
    user_data: T,
    on_release: Option<ReleaseNotify<T>>,
) -> Result<SourceId>
where
    C: SuspendAwareClock,
    L: EventLoop + ?Sized,
    T: 'static,
{
    let Some(callback) = callback else {
        log::warn!("schedule_once called without a callback");
        return Err(Error::MissingCallback);
    };

    let delay = Duration::from_millis(delay_seconds.saturating_mul(1000));
    let source = TimeoutOnce::new(clock, delay, callback, user_data, on_release);
    Ok(event_loop.attach(Box::new(source), priority))
}

/// [`schedule_once`] at default priority with a plain closure.
pub fn schedule_once_default<L, F>(event_loop: &mut L, delay_seconds: u64, f: F) -> Result<SourceId>
where
    L: EventLoop + ?Sized,
    F: FnOnce() + 'static,
{
    let callback: Callback<()> = Box::new(move |_: &mut ()| f());
    schedule_once(
        event_loop,
        Priority::DEFAULT,
        delay_seconds,
        Some(callback),
        (),
        None,
    )
}
