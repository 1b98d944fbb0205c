//! Daemon presence tracking.
//!
//! In no-fail mode an exhausted candidate list does not fail the context;
//! it waits for the daemon's well-known name to gain an owner on a desktop
//! bus and then retries. The bus binding itself lives outside this crate —
//! the context only consumes this trait.

use std::cell::RefCell;
use std::rc::Rc;

/// Which bus a presence signal arrived on. A session-bus signal means the
/// per-user daemon instance; a system-bus signal the system-wide one.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BusKind {
    Session,
    System,
}

/// Watches a desktop bus for the daemon name gaining an owner.
pub trait DaemonPresence {
    /// Register interest on `bus`; `cb` fires every time the daemon name
    /// appears there. Returns false if that bus is unreachable, in which
    /// case nothing was registered.
    fn watch(&self, bus: BusKind, cb: Box<dyn Fn()>) -> bool;
}

/// A hand-driven presence source, for tests and embedders without a bus.
#[derive(Default)]
pub struct ManualPresence {
    watchers: RefCell<Vec<(BusKind, Box<dyn Fn()>)>>,
}

impl ManualPresence {
    pub fn new() -> Rc<ManualPresence> {
        Rc::new(ManualPresence::default())
    }

    /// Simulate the daemon name gaining an owner on `bus`.
    pub fn trigger(&self, bus: BusKind) {
        for (kind, cb) in self.watchers.borrow().iter() {
            if *kind == bus {
                cb();
            }
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.borrow().len()
    }
}

impl DaemonPresence for ManualPresence {
    fn watch(&self, bus: BusKind, cb: Box<dyn Fn()>) -> bool {
        self.watchers.borrow_mut().push((bus, cb));
        true
    }
}
