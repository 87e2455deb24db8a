//! A single-threaded, readiness-driven event loop.
//!
//! [`MainLoop`] owns a set of boxed [`Source`]s and an epoll instance holding
//! their descriptors. Each iteration prepares every source, waits for
//! readiness, checks, and dispatches the ready ones in priority order.
//! Removing a source drops it, which is how sources release their resources.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::source::{Control, Priority, Readiness, Registration, Source, SourceId};

/// What a host loop must offer to accept sources.
pub trait EventLoop {
    /// Take ownership of `source` and start driving it.
    fn attach(&mut self, source: Box<dyn Source>, priority: Priority) -> SourceId;

    /// Remove and release a source. Returns false if `id` is unknown.
    fn remove(&mut self, id: SourceId) -> bool;
}

/// epoll instance shared between the loop and the registrations it hands out.
#[derive(Debug)]
struct Poller {
    fd: OwnedFd,
}

impl Poller {
    fn new() -> io::Result<Self> {
        let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        // SAFETY: epoll_create1 returned a fresh descriptor that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { fd })
    }

    fn add(&self, fd: RawFd, id: SourceId) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLERR) as u32,
            u64: u64::from(id.get()),
        };
        syscall!(epoll_ctl(
            self.fd.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            &mut event
        ))?;
        Ok(())
    }

    fn delete(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.fd.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut()
        ))?;
        Ok(())
    }

    fn wait(
        &self,
        events: &mut Vec<libc::epoll_event>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let timeout_ms = match timeout {
            None => -1,
            Some(timeout) => {
                // Round up: a sub-millisecond hint must not become a zero timeout.
                let ms = timeout.as_nanos().div_ceil(1_000_000);
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
        };

        events.clear();
        let res = syscall!(epoll_wait(
            self.fd.as_raw_fd(),
            events.as_mut_ptr(),
            events.capacity() as libc::c_int,
            timeout_ms
        ));
        match res {
            Ok(n) => {
                // SAFETY: the kernel initialised the first `n` entries, n <= capacity.
                unsafe { events.set_len(n as usize) };
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e),
        }
    }
}

struct PollerFd(Rc<Poller>);

impl AsRawFd for PollerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd.as_raw_fd()
    }
}

struct Entry {
    priority: Priority,
    source: Box<dyn Source>,
}

/// State shared between a loop and its handles.
struct Shared {
    alive: Cell<bool>,
    next_id: Cell<u32>,
    /// Ids handed out and not yet removed, attached or pending
    allocated: RefCell<HashSet<SourceId>>,
    removals: RefCell<Vec<SourceId>>,
    attachments: RefCell<Vec<(SourceId, Priority, Box<dyn Source>)>>,
}

impl Shared {
    fn new() -> Self {
        Shared {
            alive: Cell::new(true),
            next_id: Cell::new(1),
            allocated: RefCell::new(HashSet::new()),
            removals: RefCell::new(Vec::new()),
            attachments: RefCell::new(Vec::new()),
        }
    }

    fn allocate_id(&self) -> SourceId {
        let mut allocated = self.allocated.borrow_mut();
        loop {
            let candidate = SourceId::new(self.next_id.get());
            self.next_id.set(self.next_id.get().wrapping_add(1));
            if let Some(id) = candidate {
                if allocated.insert(id) {
                    return id;
                }
            }
        }
    }
}

/// Same-thread handle for attaching and removing sources from inside callbacks.
///
/// Requests are queued and applied before the loop's next dispatch. A source
/// removed by an earlier callback in the same iteration is released
/// undispatched; a source attached from a callback is prepared on the next
/// iteration.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Rc<Shared>,
}

impl LoopHandle {
    /// Queue removal of `id`. Returns false if the loop no longer exists.
    pub fn remove(&self, id: SourceId) -> bool {
        if !self.shared.alive.get() {
            return false;
        }
        self.shared.removals.borrow_mut().push(id);
        true
    }

    /// Whether the loop behind this handle still exists.
    pub fn is_alive(&self) -> bool {
        self.shared.alive.get()
    }
}

impl EventLoop for LoopHandle {
    /// Queue `source` for attachment. If the loop is gone the source is
    /// released immediately.
    fn attach(&mut self, source: Box<dyn Source>, priority: Priority) -> SourceId {
        let id = self.shared.allocate_id();
        if self.shared.alive.get() {
            self.shared
                .attachments
                .borrow_mut()
                .push((id, priority, source));
        } else {
            log::warn!(
                "Source {} '{}' attached after its loop was dropped",
                id,
                source.name()
            );
            drop(source);
        }
        id
    }

    fn remove(&mut self, id: SourceId) -> bool {
        LoopHandle::remove(self, id)
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("alive", &self.shared.alive.get())
            .finish()
    }
}

/// Epoll-backed event loop.
pub struct MainLoop {
    /// Instance name for logging
    name: String,

    /// Sources keyed by id. Dropping an entry releases the source.
    sources: BTreeMap<SourceId, Entry>,

    /// Watch set of source descriptors
    poller: Rc<Poller>,

    /// Readiness buffer reused across waits
    events: Vec<libc::epoll_event>,

    /// Id allocation and requests queued through a LoopHandle
    shared: Rc<Shared>,
}

impl MainLoop {
    /// Create a new MainLoop
    ///
    /// # Arguments
    /// * `name` - Loop instance name for logging
    /// * `event_capacity` - Maximum readiness events collected per wait
    pub fn new(name: String, event_capacity: usize) -> Result<Self> {
        let poller = Poller::new().map_err(Error::Poller)?;
        Ok(MainLoop {
            name,
            sources: BTreeMap::new(),
            poller: Rc::new(poller),
            events: Vec::with_capacity(event_capacity.max(1)),
            shared: Rc::new(Shared::new()),
        })
    }

    /// Instance name used in log lines
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle for attaching and removing sources from inside callbacks
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Rc::clone(&self.shared),
        }
    }

    /// Number of attached sources
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether no source is attached
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Whether `id` is attached to this loop
    pub fn contains(&self, id: SourceId) -> bool {
        self.sources.contains_key(&id)
    }

    /// Name of the source attached as `id`
    pub fn source_name(&self, id: SourceId) -> Option<&str> {
        self.sources.get(&id).map(|entry| entry.source.name())
    }

    /// Whether the source attached as `id` can never become ready
    pub fn is_degenerate(&self, id: SourceId) -> Option<bool> {
        self.sources.get(&id).map(|entry| entry.source.is_degenerate())
    }

    /// Run one prepare / wait / check / dispatch cycle.
    ///
    /// Blocks only if `may_block` is set and no source is ready after
    /// prepare. Returns whether any source was dispatched.
    pub fn iteration(&mut self, may_block: bool) -> Result<bool> {
        let (mut ready, timeout) = self.prepare_sources();
        let wait = if !ready.is_empty() || !may_block {
            Some(Duration::ZERO)
        } else {
            timeout
        };

        self.poll(wait)?;
        self.check_sources(&mut ready);
        Ok(self.dispatch_ready(ready))
    }

    /// Iterate until `cancel` is triggered.
    ///
    /// The token is checked between iterations, so cancelling from another
    /// thread takes effect only once the current wait returns. Use
    /// [`MainLoop::run`] when that matters.
    pub fn run_until(&mut self, cancel: &CancellationToken) -> Result<()> {
        log::info!("Main loop '{}' started", self.name);

        while !cancel.is_cancelled() {
            if let Err(e) = self.iteration(true) {
                log::warn!("Main loop '{}' failed: {}", self.name, e);
                return Err(e);
            }
        }

        log::info!("Main loop '{}' stopped", self.name);
        Ok(())
    }

    /// Drive the loop from a Tokio runtime until `cancel` is triggered.
    ///
    /// The epoll descriptor is registered with Tokio's reactor, so the
    /// future yields while no source is ready. The future is `!Send`; run it
    /// on a current-thread runtime or inside a `LocalSet`.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let poll_fd =
            AsyncFd::with_interest(PollerFd(Rc::clone(&self.poller)), Interest::READABLE)
                .map_err(Error::Poller)?;

        log::info!("Main loop '{}' started", self.name);

        // Tokio sees the epoll fd edge-triggered: while the last poll filled
        // the event buffer, more readiness may be queued without a new edge.
        let mut saturated = false;
        loop {
            if cancel.is_cancelled() {
                log::info!("Main loop '{}' cancelled", self.name);
                break;
            }

            let (mut ready, timeout) = self.prepare_sources();
            if ready.is_empty() && !saturated {
                tokio::select! {
                    guard = poll_fd.readable() => {
                        guard.map_err(Error::Poller)?.clear_ready();
                    },

                    _ = sleep(timeout.unwrap_or_default()), if timeout.is_some() => {},

                    _ = cancel.cancelled() => {
                        log::info!("Main loop '{}' cancelled via token", self.name);
                        break;
                    }
                }
            }

            saturated = self.poll(Some(Duration::ZERO))?;
            self.check_sources(&mut ready);
            self.dispatch_ready(ready);
        }

        log::info!("Main loop '{}' stopped", self.name);
        Ok(())
    }

    /// Apply attachments, then removals, queued through a LoopHandle.
    fn apply_pending(&mut self) {
        loop {
            let attachments = std::mem::take(&mut *self.shared.attachments.borrow_mut());
            let removals = std::mem::take(&mut *self.shared.removals.borrow_mut());
            if attachments.is_empty() && removals.is_empty() {
                break;
            }

            for (id, priority, source) in attachments {
                self.insert_source(id, source, priority);
            }
            for id in removals {
                self.remove(id);
            }
        }
    }

    fn insert_source(&mut self, id: SourceId, mut source: Box<dyn Source>, priority: Priority) {
        if let Some(fd) = source.descriptor() {
            match self.poller.add(fd, id) {
                Ok(()) => {
                    let poller = Rc::clone(&self.poller);
                    source.attach(Registration::new(move || {
                        if let Err(e) = poller.delete(fd) {
                            log::debug!("Failed to deregister fd {}: {}", fd, e);
                        }
                    }));
                }
                Err(e) => {
                    log::warn!(
                        "Main loop '{}' failed to watch fd {} of '{}': {}",
                        self.name,
                        fd,
                        source.name(),
                        e
                    );
                }
            }
        }

        log::debug!(
            "Main loop '{}' attached source {} '{}' at priority {}",
            self.name,
            id,
            source.name(),
            priority.0
        );
        self.sources.insert(id, Entry { priority, source });
    }

    fn prepare_sources(&mut self) -> (Vec<SourceId>, Option<Duration>) {
        self.apply_pending();

        let mut ready = Vec::new();
        let mut timeout: Option<Duration> = None;
        for (id, entry) in self.sources.iter_mut() {
            let prepared = entry.source.prepare();
            if prepared.ready {
                ready.push(*id);
            }
            if let Some(t) = prepared.timeout {
                timeout = Some(timeout.map_or(t, |current| current.min(t)));
            }
        }
        (ready, timeout)
    }

    /// Collect readiness into the event buffer. Returns true if the buffer
    /// came back full.
    fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
        self.poller
            .wait(&mut self.events, timeout)
            .map_err(Error::Poller)?;
        Ok(self.events.len() == self.events.capacity())
    }

    fn check_sources(&mut self, ready: &mut Vec<SourceId>) {
        let mut observed: HashMap<u32, Readiness> = HashMap::with_capacity(self.events.len());
        for event in &self.events {
            let event = *event;
            observed.insert(event.u64 as u32, Readiness::from_epoll(event.events));
        }

        for (id, entry) in self.sources.iter_mut() {
            if ready.contains(id) {
                continue;
            }
            let readiness = observed.get(&id.get()).copied().unwrap_or(Readiness::NONE);
            if entry.source.check(readiness) {
                ready.push(*id);
            }
        }
    }

    fn dispatch_ready(&mut self, mut ready: Vec<SourceId>) -> bool {
        ready.sort_by_key(|id| (self.sources.get(id).map(|entry| entry.priority), *id));

        let mut dispatched = false;
        for id in ready {
            self.apply_pending();
            let Some(entry) = self.sources.get_mut(&id) else {
                continue;
            };
            dispatched = true;
            if entry.source.dispatch() == Control::Remove {
                self.remove(id);
            }
        }
        self.apply_pending();
        dispatched
    }
}

impl EventLoop for MainLoop {
    fn attach(&mut self, source: Box<dyn Source>, priority: Priority) -> SourceId {
        let id = self.shared.allocate_id();
        self.insert_source(id, source, priority);
        id
    }

    fn remove(&mut self, id: SourceId) -> bool {
        let Some(entry) = self.sources.remove(&id) else {
            return false;
        };
        self.shared.allocated.borrow_mut().remove(&id);

        log::debug!("Main loop '{}' removing source {}", self.name, id);
        drop(entry);
        true
    }
}

impl Drop for MainLoop {
    fn drop(&mut self) {
        if !self.sources.is_empty() {
            log::debug!(
                "Main loop '{}' discarding {} source(s)",
                self.name,
                self.sources.len()
            );
        }
        self.shared.alive.set(false);
        self.sources.clear();

        let attachments = std::mem::take(&mut *self.shared.attachments.borrow_mut());
        drop(attachments);
        self.shared.removals.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Prepared;

    /// Ready whenever its flag is set; records dispatches into a shared log.
    struct FlagSource {
        label: &'static str,
        flag: Rc<Cell<bool>>,
        log: Rc<RefCell<Vec<&'static str>>>,
        dropped: Rc<Cell<usize>>,
        control: Control,
    }

    impl Source for FlagSource {
        fn name(&self) -> &str {
            self.label
        }

        fn descriptor(&self) -> Option<RawFd> {
            None
        }

        fn attach(&mut self, _registration: Registration) {}

        fn prepare(&mut self) -> Prepared {
            Prepared::WAIT
        }

        fn check(&mut self, _readiness: Readiness) -> bool {
            self.flag.get()
        }

        fn dispatch(&mut self) -> Control {
            self.log.borrow_mut().push(self.label);
            self.control
        }
    }

    impl Drop for FlagSource {
        fn drop(&mut self) {
            self.dropped.set(self.dropped.get() + 1);
        }
    }

    struct Fixture {
        flag: Rc<Cell<bool>>,
        log: Rc<RefCell<Vec<&'static str>>>,
        dropped: Rc<Cell<usize>>,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                flag: Rc::new(Cell::new(false)),
                log: Rc::new(RefCell::new(Vec::new())),
                dropped: Rc::new(Cell::new(0)),
            }
        }

        fn source(&self, label: &'static str, control: Control) -> Box<dyn Source> {
            Box::new(FlagSource {
                label,
                flag: Rc::clone(&self.flag),
                log: Rc::clone(&self.log),
                dropped: Rc::clone(&self.dropped),
                control,
            })
        }
    }

    fn test_loop() -> MainLoop {
        MainLoop::new("test".to_string(), 8).unwrap()
    }

    #[test]
    fn test_ids_are_unique_and_nonzero() {
        let fixture = Fixture::new();
        let mut main_loop = test_loop();

        let a = main_loop.attach(fixture.source("a", Control::Continue), Priority::DEFAULT);
        let b = main_loop.attach(fixture.source("b", Control::Continue), Priority::DEFAULT);
        assert_ne!(a, b);
        assert!(a.get() > 0 && b.get() > 0);
        assert_eq!(main_loop.len(), 2);
        assert_eq!(main_loop.source_name(b), Some("b"));
    }

    #[test]
    fn test_nothing_ready_nothing_dispatched() {
        let fixture = Fixture::new();
        let mut main_loop = test_loop();
        main_loop.attach(fixture.source("a", Control::Continue), Priority::DEFAULT);

        assert!(!main_loop.iteration(false).unwrap());
        assert!(fixture.log.borrow().is_empty());
    }

    #[test]
    fn test_dispatch_follows_priority() {
        let fixture = Fixture::new();
        let mut main_loop = test_loop();
        main_loop.attach(fixture.source("low", Control::Continue), Priority::LOW);
        main_loop.attach(fixture.source("default", Control::Continue), Priority::DEFAULT);
        main_loop.attach(fixture.source("high", Control::Continue), Priority::HIGH);

        fixture.flag.set(true);
        assert!(main_loop.iteration(false).unwrap());
        assert_eq!(*fixture.log.borrow(), vec!["high", "default", "low"]);
    }

    #[test]
    fn test_remove_control_drops_source() {
        let fixture = Fixture::new();
        let mut main_loop = test_loop();
        let id = main_loop.attach(fixture.source("once", Control::Remove), Priority::DEFAULT);

        fixture.flag.set(true);
        main_loop.iteration(false).unwrap();
        main_loop.iteration(false).unwrap();

        assert_eq!(*fixture.log.borrow(), vec!["once"]);
        assert!(!main_loop.contains(id));
        assert_eq!(fixture.dropped.get(), 1);
    }

    #[test]
    fn test_handle_removal_skips_pending_dispatch() {
        let fixture = Fixture::new();
        let mut main_loop = test_loop();
        let handle = main_loop.handle();

        let id = main_loop.attach(fixture.source("victim", Control::Continue), Priority::DEFAULT);
        fixture.flag.set(true);
        assert!(handle.remove(id));

        assert!(!main_loop.iteration(false).unwrap());
        assert!(fixture.log.borrow().is_empty());
        assert_eq!(fixture.dropped.get(), 1);
    }

    #[test]
    fn test_handle_attach_applies_on_next_iteration() {
        let fixture = Fixture::new();
        let mut main_loop = test_loop();
        let mut handle = main_loop.handle();

        let first = main_loop.attach(fixture.source("first", Control::Continue), Priority::DEFAULT);
        let queued = handle.attach(fixture.source("queued", Control::Remove), Priority::HIGH);
        assert_ne!(first, queued);
        assert!(!main_loop.contains(queued));

        fixture.flag.set(true);
        assert!(main_loop.iteration(false).unwrap());
        assert_eq!(*fixture.log.borrow(), vec!["queued", "first"]);
        assert!(!main_loop.contains(queued));
        assert!(main_loop.contains(first));
    }

    #[test]
    fn test_handle_attach_then_remove_before_apply() {
        let fixture = Fixture::new();
        let mut main_loop = test_loop();
        let mut handle = main_loop.handle();

        let queued = handle.attach(fixture.source("queued", Control::Continue), Priority::DEFAULT);
        assert!(handle.remove(queued));

        fixture.flag.set(true);
        assert!(!main_loop.iteration(false).unwrap());
        assert_eq!(fixture.dropped.get(), 1);
        assert!(main_loop.is_empty());
    }

    #[test]
    fn test_handle_attach_after_drop_releases_source() {
        let fixture = Fixture::new();
        let main_loop = test_loop();
        let mut handle = main_loop.handle();
        assert!(handle.is_alive());

        drop(main_loop);
        assert!(!handle.is_alive());
        handle.attach(fixture.source("late", Control::Continue), Priority::DEFAULT);
        assert_eq!(fixture.dropped.get(), 1);
    }

    #[test]
    fn test_drop_releases_queued_attachments() {
        let fixture = Fixture::new();
        let main_loop = test_loop();
        let mut handle = main_loop.handle();
        handle.attach(fixture.source("queued", Control::Continue), Priority::DEFAULT);

        drop(main_loop);
        assert_eq!(fixture.dropped.get(), 1);
        assert!(fixture.log.borrow().is_empty());
    }

    #[test]
    fn test_remove_unknown_id() {
        let mut main_loop = test_loop();
        assert!(!main_loop.remove(SourceId::new(42).unwrap()));
    }

    #[test]
    fn test_drop_releases_all_sources() {
        let fixture = Fixture::new();
        let main_loop = {
            let mut main_loop = test_loop();
            main_loop.attach(fixture.source("a", Control::Continue), Priority::DEFAULT);
            main_loop.attach(fixture.source("b", Control::Continue), Priority::DEFAULT);
            main_loop
        };
        let handle = main_loop.handle();

        drop(main_loop);
        assert_eq!(fixture.dropped.get(), 2);
        assert!(!handle.remove(SourceId::new(1).unwrap()));
    }

    #[test]
    fn test_run_until_cancelled_token() {
        let fixture = Fixture::new();
        let mut main_loop = test_loop();
        main_loop.attach(fixture.source("a", Control::Continue), Priority::DEFAULT);

        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio_test::assert_ok!(main_loop.run_until(&cancel));
        assert!(fixture.log.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let mut main_loop = test_loop();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        tokio_test::assert_ok!(main_loop.run(cancel).await);
    }
}
