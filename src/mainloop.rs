//! Single-threaded poll(2) event loop.
//!
//! The loop owns three source kinds: IO watches on file descriptors, time
//! events with a monotonic deadline, and defer events that run on every
//! iteration. All callbacks fire on the thread that calls [`Mainloop::run`]
//! or [`Mainloop::iterate`]. Sources are interior-mutable handles, so a
//! callback may re-arm, disable, or free any event — including itself.

use std::cell::RefCell;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use tracing::trace;

/// Sentinel for "no deadline" in microsecond APIs.
pub const USEC_INVALID: u64 = u64::MAX;

/// Interest/readiness flags for an IO watch.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct IoEventFlags(u8);

impl IoEventFlags {
    pub const NONE: IoEventFlags = IoEventFlags(0);
    pub const INPUT: IoEventFlags = IoEventFlags(1);
    pub const OUTPUT: IoEventFlags = IoEventFlags(2);
    pub const HANGUP: IoEventFlags = IoEventFlags(4);
    pub const ERROR: IoEventFlags = IoEventFlags(8);

    pub fn contains(self, other: IoEventFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: IoEventFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for IoEventFlags {
    type Output = IoEventFlags;
    fn bitor(self, rhs: IoEventFlags) -> IoEventFlags {
        IoEventFlags(self.0 | rhs.0)
    }
}

pub type IoEventCb = Box<dyn FnMut(&IoEvent, RawFd, IoEventFlags)>;
pub type TimeEventCb = Box<dyn FnMut(&TimeEvent)>;
pub type DeferEventCb = Box<dyn FnMut(&DeferEvent)>;

struct IoEventInner {
    fd: RawFd,
    interest: IoEventFlags,
    cb: Option<IoEventCb>,
    dead: bool,
}

struct TimeEventInner {
    deadline: Option<Instant>,
    cb: Option<TimeEventCb>,
    dead: bool,
}

struct DeferEventInner {
    enabled: bool,
    cb: Option<DeferEventCb>,
    dead: bool,
}

/// Handle to an IO watch. Watches stay registered until [`IoEvent::free`].
#[derive(Clone)]
pub struct IoEvent(Rc<RefCell<IoEventInner>>);

impl IoEvent {
    /// Change the interest set. An empty set parks the watch.
    pub fn enable(&self, interest: IoEventFlags) {
        self.0.borrow_mut().interest = interest;
    }

    pub fn fd(&self) -> RawFd {
        self.0.borrow().fd
    }

    /// Unregister. Idempotent; safe to call from the watch's own callback.
    pub fn free(&self) {
        let mut inner = self.0.borrow_mut();
        inner.dead = true;
        inner.interest = IoEventFlags::NONE;
    }
}

/// Handle to a time event.
#[derive(Clone)]
pub struct TimeEvent(Rc<RefCell<TimeEventInner>>);

impl TimeEvent {
    /// Re-arm with a new deadline, or disarm with `None`.
    pub fn restart(&self, deadline: Option<Instant>) {
        self.0.borrow_mut().deadline = deadline;
    }

    pub fn free(&self) {
        let mut inner = self.0.borrow_mut();
        inner.dead = true;
        inner.deadline = None;
    }
}

/// Handle to a defer event.
#[derive(Clone)]
pub struct DeferEvent(Rc<RefCell<DeferEventInner>>);

impl DeferEvent {
    pub fn enable(&self, on: bool) {
        self.0.borrow_mut().enabled = on;
    }

    pub fn free(&self) {
        let mut inner = self.0.borrow_mut();
        inner.dead = true;
        inner.enabled = false;
    }
}

#[derive(Default)]
struct MainloopInner {
    io_events: Vec<Rc<RefCell<IoEventInner>>>,
    time_events: Vec<Rc<RefCell<TimeEventInner>>>,
    defer_events: Vec<Rc<RefCell<DeferEventInner>>>,
    quit_retval: Option<i32>,
}

/// The event loop. Cloning yields another handle to the same loop.
#[derive(Clone, Default)]
pub struct Mainloop {
    inner: Rc<RefCell<MainloopInner>>,
}

impl Mainloop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an IO watch on `fd`.
    pub fn io_new(&self, fd: RawFd, interest: IoEventFlags, cb: IoEventCb) -> IoEvent {
        let ev = Rc::new(RefCell::new(IoEventInner {
            fd,
            interest,
            cb: Some(cb),
            dead: false,
        }));
        self.inner.borrow_mut().io_events.push(Rc::clone(&ev));
        IoEvent(ev)
    }

    /// Register a time event; `None` creates it disarmed.
    pub fn time_new(&self, deadline: Option<Instant>, cb: TimeEventCb) -> TimeEvent {
        let ev = Rc::new(RefCell::new(TimeEventInner {
            deadline,
            cb: Some(cb),
            dead: false,
        }));
        self.inner.borrow_mut().time_events.push(Rc::clone(&ev));
        TimeEvent(ev)
    }

    /// Register a defer event, enabled immediately.
    pub fn defer_new(&self, cb: DeferEventCb) -> DeferEvent {
        let ev = Rc::new(RefCell::new(DeferEventInner {
            enabled: true,
            cb: Some(cb),
            dead: false,
        }));
        self.inner.borrow_mut().defer_events.push(Rc::clone(&ev));
        DeferEvent(ev)
    }

    /// Ask [`Mainloop::run`] to return `retval`.
    pub fn quit(&self, retval: i32) {
        self.inner.borrow_mut().quit_retval = Some(retval);
    }

    /// Run one iteration. With `block`, sleeps until a source fires or the
    /// nearest timer expires; otherwise only dispatches what is ready now.
    /// Returns the number of callbacks dispatched.
    pub fn iterate(&self, block: bool) -> Result<usize, Errno> {
        let mut dispatched = 0;

        dispatched += self.dispatch_defer();

        // A pending defer or quit must not sleep in poll.
        let immediate =
            !block || dispatched > 0 || self.inner.borrow().quit_retval.is_some();

        let now = Instant::now();
        // None = wait forever.
        let timeout: Option<Duration> = if immediate {
            Some(Duration::ZERO)
        } else {
            self.next_deadline()
                .map(|deadline| deadline.saturating_duration_since(now))
        };

        dispatched += self.poll_io(timeout)?;
        dispatched += self.dispatch_timers();
        self.collect_dead();

        Ok(dispatched)
    }

    /// Iterate until [`Mainloop::quit`] is called.
    pub fn run(&self) -> Result<i32, Errno> {
        loop {
            if let Some(r) = self.inner.borrow().quit_retval {
                return Ok(r);
            }
            self.iterate(true)?;
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .borrow()
            .time_events
            .iter()
            .filter_map(|ev| ev.borrow().deadline)
            .min()
    }

    fn dispatch_defer(&self) -> usize {
        let ready: Vec<_> = self
            .inner
            .borrow()
            .defer_events
            .iter()
            .filter(|ev| {
                let ev = ev.borrow();
                ev.enabled && !ev.dead
            })
            .cloned()
            .collect();

        let mut n = 0;
        for ev in ready {
            let cb = ev.borrow_mut().cb.take();
            if let Some(mut cb) = cb {
                cb(&DeferEvent(Rc::clone(&ev)));
                n += 1;
                let mut inner = ev.borrow_mut();
                if !inner.dead && inner.cb.is_none() {
                    inner.cb = Some(cb);
                }
            }
        }
        n
    }

    fn poll_io(&self, timeout: Option<Duration>) -> Result<usize, Errno> {
        let watched: Vec<_> = self
            .inner
            .borrow()
            .io_events
            .iter()
            .filter(|ev| {
                let ev = ev.borrow();
                !ev.dead && !ev.interest.is_empty()
            })
            .cloned()
            .collect();

        if watched.is_empty() {
            // Nothing to watch: honor the timer deadline by sleeping. An
            // idle loop with neither watches nor timers must not spin.
            match timeout {
                Some(d) if !d.is_zero() => std::thread::sleep(d),
                None => std::thread::sleep(Duration::from_millis(10)),
                _ => {}
            }
            return Ok(0);
        }

        let poll_timeout = match timeout {
            None => PollTimeout::NONE,
            // Clamp; expired timers are rechecked every iteration anyway.
            Some(d) => PollTimeout::from(d.as_millis().min(u128::from(u16::MAX)) as u16),
        };

        let mut pollfds: Vec<PollFd<'_>> = watched
            .iter()
            .map(|ev| {
                let ev = ev.borrow();
                let mut flags = PollFlags::empty();
                if ev.interest.contains(IoEventFlags::INPUT) {
                    flags |= PollFlags::POLLIN;
                }
                if ev.interest.contains(IoEventFlags::OUTPUT) {
                    flags |= PollFlags::POLLOUT;
                }
                PollFd::new(borrow_fd(ev.fd), flags)
            })
            .collect();

        let n = loop {
            match nix::poll::poll(&mut pollfds, poll_timeout) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
        };
        if n == 0 {
            return Ok(0);
        }

        let fired: Vec<(Rc<RefCell<IoEventInner>>, IoEventFlags)> = pollfds
            .iter()
            .zip(watched.iter())
            .filter_map(|(pfd, ev)| {
                let revents = pfd.revents()?;
                let mut flags = IoEventFlags::NONE;
                if revents.contains(PollFlags::POLLIN) {
                    flags = flags | IoEventFlags::INPUT;
                }
                if revents.contains(PollFlags::POLLOUT) {
                    flags = flags | IoEventFlags::OUTPUT;
                }
                if revents.contains(PollFlags::POLLHUP) {
                    flags = flags | IoEventFlags::HANGUP;
                }
                if revents.contains(PollFlags::POLLERR) || revents.contains(PollFlags::POLLNVAL) {
                    flags = flags | IoEventFlags::ERROR;
                }
                (!flags.is_empty()).then(|| (Rc::clone(ev), flags))
            })
            .collect();
        drop(pollfds);

        let mut dispatched = 0;
        for (ev, flags) in fired {
            let (fd, cb) = {
                let mut inner = ev.borrow_mut();
                if inner.dead {
                    continue;
                }
                (inner.fd, inner.cb.take())
            };
            if let Some(mut cb) = cb {
                trace!(fd, ?flags, "io event");
                cb(&IoEvent(Rc::clone(&ev)), fd, flags);
                dispatched += 1;
                let mut inner = ev.borrow_mut();
                if !inner.dead && inner.cb.is_none() {
                    inner.cb = Some(cb);
                }
            }
        }
        Ok(dispatched)
    }

    fn dispatch_timers(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<_> = self
            .inner
            .borrow()
            .time_events
            .iter()
            .filter(|ev| {
                let ev = ev.borrow();
                !ev.dead && ev.deadline.is_some_and(|d| d <= now)
            })
            .cloned()
            .collect();

        let mut dispatched = 0;
        for ev in expired {
            let cb = {
                let mut inner = ev.borrow_mut();
                // One-shot: the callback re-arms via restart() if it wants.
                inner.deadline = None;
                inner.cb.take()
            };
            if let Some(mut cb) = cb {
                cb(&TimeEvent(Rc::clone(&ev)));
                dispatched += 1;
                let mut inner = ev.borrow_mut();
                if !inner.dead && inner.cb.is_none() {
                    inner.cb = Some(cb);
                }
            }
        }
        dispatched
    }

    fn collect_dead(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.io_events.retain(|ev| !ev.borrow().dead);
        inner.time_events.retain(|ev| !ev.borrow().dead);
        inner.defer_events.retain(|ev| !ev.borrow().dead);
    }
}

#[allow(unsafe_code)]
fn borrow_fd<'a>(fd: RawFd) -> BorrowedFd<'a> {
    // The watch owner keeps the fd open for the lifetime of the watch;
    // freeing the watch before closing the fd is part of the contract.
    unsafe { BorrowedFd::borrow_raw(fd) }
}
