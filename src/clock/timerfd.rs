use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use super::{itimerspec_for, Countdown, SuspendAwareClock};

/// `CLOCK_BOOTTIME`: monotonic, and counts time spent in suspend.
#[derive(Debug, Default, Clone, Copy)]
pub struct Boottime;

impl SuspendAwareClock for Boottime {
    type Countdown = TimerFd;

    fn countdown(&self) -> io::Result<TimerFd> {
        TimerFd::boottime()
    }
}

/// A non-blocking, close-on-exec timerfd.
///
/// The descriptor is owned exclusively and closed when the value is dropped.
#[derive(Debug)]
pub struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    pub fn boottime() -> io::Result<Self> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_BOOTTIME,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC
        ))?;
        // SAFETY: timerfd_create returned a fresh descriptor that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { fd })
    }
}

impl Countdown for TimerFd {
    fn arm(&mut self, delay: Duration) -> io::Result<()> {
        let spec = itimerspec_for(delay);
        syscall!(timerfd_settime(
            self.fd.as_raw_fd(),
            0,
            &spec,
            std::ptr::null_mut()
        ))?;
        Ok(())
    }

    fn descriptor(&self) -> Option<RawFd> {
        Some(self.fd.as_raw_fd())
    }

    fn take_expirations(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        let res = syscall!(read(
            self.fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        ));
        match res {
            Ok(n) if n as usize == buf.len() => Ok(u64::from_ne_bytes(buf)),
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read from timerfd",
            )),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
