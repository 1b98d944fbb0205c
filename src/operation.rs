//! Per-request operation objects.
//!
//! An operation tracks one in-flight request. The dispatcher's registered
//! continuation owns the user callback; the operation only carries the
//! cancellation state the continuation consults before invoking it, so a
//! cancelled request completes silently.

use std::cell::Cell;
use std::rc::Rc;

/// Lifecycle of an operation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OperationState {
    /// The request is in flight.
    Running,
    /// The reply (or synthesized timeout) has been dispatched.
    Done,
    /// Cancelled before completion; the callback will not run.
    Cancelled,
}

/// Handle to one in-flight request. Cloning shares the state.
#[derive(Debug, Clone)]
pub struct Operation {
    state: Rc<Cell<OperationState>>,
}

impl Operation {
    pub(crate) fn new() -> Operation {
        Operation {
            state: Rc::new(Cell::new(OperationState::Running)),
        }
    }

    pub fn state(&self) -> OperationState {
        self.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.state.get() == OperationState::Running
    }

    /// Prevent the user callback from running. The request itself is not
    /// recalled from the wire; its reply is discarded on arrival.
    pub fn cancel(&self) {
        if self.is_running() {
            self.state.set(OperationState::Cancelled);
        }
    }

    /// Mark completion. Idempotent; a cancelled operation stays cancelled.
    pub(crate) fn done(&self) {
        if self.is_running() {
            self.state.set(OperationState::Done);
        }
    }
}
