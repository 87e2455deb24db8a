//! Basic usage example for boottime timeouts

use std::cell::Cell;
use std::rc::Rc;

use boottime_timeout::{
    schedule_once, schedule_once_default, Callback, CancellationToken, EventLoop, MainLoop,
    Priority, ReleaseNotify,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    let cancel_token = CancellationToken::new();
    let mut main_loop = MainLoop::new("example_loop".to_string(), 16)?;

    // Set multiple timers
    let expired = Rc::new(Cell::new(0));
    for (name, seconds) in [("short_timer", 1), ("medium_timer", 2), ("long_timer", 3)] {
        let expired = Rc::clone(&expired);
        let cancel_token = cancel_token.clone();
        schedule_once_default(&mut main_loop, seconds, move || {
            println!("Timer '{}' expired!", name);
            expired.set(expired.get() + 1);
            if expired.get() == 3 {
                cancel_token.cancel();
            }
        })?;
    }

    // Demonstrate cancellation: the release hook still runs exactly once
    let callback: Callback<&'static str> =
        Box::new(|name: &mut &'static str| println!("Timer '{}' expired!", name));
    let released: ReleaseNotify<&'static str> =
        Box::new(|name| println!("Timer '{}' released", name));
    let cancelled = schedule_once(
        &mut main_loop,
        Priority::LOW,
        10,
        Some(callback),
        "cancelled_timer",
        Some(released),
    )?;
    println!("Timers set! Waiting for expiration...");

    main_loop.iteration(false)?;
    main_loop.remove(cancelled);
    println!("Timer cancelled!");

    main_loop.run_until(&cancel_token)?;

    println!("Main loop shut down successfully!");
    Ok(())
}
