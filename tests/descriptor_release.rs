//! Kernel timer descriptors are closed when a timeout is dispatched, removed
//! or dropped with its loop.
//!
//! One test per binary: parallel tests would open descriptors of their own
//! and skew the count.

use std::cell::Cell;
use std::rc::Rc;

use boottime_timeout::{schedule_once_default, EventLoop, MainLoop};

fn open_descriptors() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .expect("procfs is mounted")
        .count()
}

#[test]
fn test_timer_descriptors_are_closed() {
    let mut main_loop = MainLoop::new("descriptors".to_string(), 8).unwrap();
    let baseline = open_descriptors();

    // Dispatched
    let fired = Rc::new(Cell::new(false));
    let flag = Rc::clone(&fired);
    schedule_once_default(&mut main_loop, 0, move || flag.set(true)).unwrap();
    assert_eq!(open_descriptors(), baseline + 1);
    while !fired.get() {
        main_loop.iteration(true).unwrap();
    }
    assert!(main_loop.is_empty());
    assert_eq!(open_descriptors(), baseline);

    // Removed while armed
    let id = schedule_once_default(&mut main_loop, 5, || panic!("removed timer fired")).unwrap();
    main_loop.iteration(false).unwrap();
    assert_eq!(open_descriptors(), baseline + 1);
    assert!(main_loop.remove(id));
    assert_eq!(open_descriptors(), baseline);

    // Dropped with the loop, armed and unarmed
    schedule_once_default(&mut main_loop, 5, || {}).unwrap();
    main_loop.iteration(false).unwrap();
    schedule_once_default(&mut main_loop, 5, || {}).unwrap();
    assert_eq!(open_descriptors(), baseline + 2);
    drop(main_loop);
    // The loop's own epoll descriptor goes too.
    assert_eq!(open_descriptors(), baseline - 1);
}
