use std::io;

/// Errors produced by timeout sources and the main loop.
///
/// Only [`Error::MissingCallback`] and [`Error::Poller`] ever reach a caller.
/// Clock failures are logged and degrade a single timer instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `schedule_once` was called without a callback.
    #[error("timeout source requires a callback")]
    MissingCallback,

    /// The suspend-aware timer object could not be created.
    #[error("failed to create boottime timer: {0}")]
    ClockCreate(#[source] io::Error),

    /// The countdown could not be programmed into the timer object.
    #[error("failed to set up timer: {0}")]
    Arm(#[source] io::Error),

    /// epoll creation, registration or wait failed.
    #[error("main loop poller failure: {0}")]
    Poller(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
