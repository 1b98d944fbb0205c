//! Tagged packet dispatch.
//!
//! Inbound control packets open with `(command, tag)`. Reply-kind commands
//! are correlated back to a registered continuation by tag; everything
//! else routes through a fixed command table. Each registered tag carries
//! a deadline after which a synthesized `TIMEOUT` completes it, so every
//! outstanding request finishes in bounded time.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::command::Command;
use crate::error::ErrorCode;
use crate::iochannel::Creds;
use crate::mainloop::{Mainloop, TimeEvent};
use crate::tagstruct::TagStruct;

/// How long a request may stay unanswered.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Handler for a command-routed packet.
pub type CommandHandler<U> = fn(&U, Command, u32, &mut TagStruct);

/// Continuation for a tag-routed reply. Fires exactly once.
pub type ReplyCb<U> = Box<dyn FnOnce(&U, Command, &mut TagStruct)>;

struct Reply<U> {
    cb: ReplyCb<U>,
    userdata: U,
    time_event: TimeEvent,
}

struct Inner<U: 'static> {
    table: &'static [(Command, CommandHandler<U>)],
    replies: HashMap<u32, Reply<U>>,
    drain_cb: Option<Box<dyn FnOnce()>>,
    /// Credentials of the packet currently being dispatched.
    creds: Option<Creds>,
}

/// The dispatcher. Cloning yields another handle to the same instance.
pub struct Pdispatch<U: 'static> {
    mainloop: Mainloop,
    inner: Rc<RefCell<Inner<U>>>,
}

impl<U: 'static> Clone for Pdispatch<U> {
    fn clone(&self) -> Self {
        Pdispatch {
            mainloop: self.mainloop.clone(),
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<U: 'static> Pdispatch<U> {
    pub fn new(mainloop: &Mainloop, table: &'static [(Command, CommandHandler<U>)]) -> Self {
        Pdispatch {
            mainloop: mainloop.clone(),
            inner: Rc::new(RefCell::new(Inner {
                table,
                replies: HashMap::new(),
                drain_cb: None,
                creds: None,
            })),
        }
    }

    /// Register the continuation for an outstanding tag.
    ///
    /// Whichever comes first — the peer's reply or the deadline — fires
    /// `cb` exactly once and removes the entry. Entries that leave the
    /// table any other way (teardown) drop their continuation unfired,
    /// releasing whatever it owns.
    pub fn register_reply(&self, tag: u32, timeout: Duration, userdata: U, cb: ReplyCb<U>) {
        let weak = Rc::downgrade(&self.inner);
        let time_event = self.mainloop.time_new(
            Some(Instant::now() + timeout),
            Box::new(move |_ev| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                Self::on_timeout(&inner, tag);
            }),
        );
        let mut inner = self.inner.borrow_mut();
        debug_assert!(!inner.replies.contains_key(&tag), "tag already in flight");
        inner.replies.insert(
            tag,
            Reply {
                cb,
                userdata,
                time_event,
            },
        );
    }

    fn on_timeout(inner: &Rc<RefCell<Inner<U>>>, tag: u32) {
        let entry = inner.borrow_mut().replies.remove(&tag);
        let Some(entry) = entry else {
            return;
        };
        debug!(tag, "request timed out");
        entry.time_event.free();
        let mut ts = TagStruct::new();
        (entry.cb)(&entry.userdata, Command::Timeout, &mut ts);
        Self::maybe_drain(inner);
    }

    /// Route one inbound packet. `Err` means a protocol violation the
    /// connection cannot survive.
    pub fn run(&self, payload: Bytes, creds: Option<Creds>, userdata: &U) -> Result<(), ErrorCode> {
        let mut ts = TagStruct::from_bytes(payload);
        let raw_command = ts.get_u32().map_err(|_| ErrorCode::Protocol)?;
        let tag = ts.get_u32().map_err(|_| ErrorCode::Protocol)?;
        let Some(command) = Command::from_wire(raw_command) else {
            debug!(raw_command, "unknown command");
            return Err(ErrorCode::Protocol);
        };
        trace!(?command, tag, "dispatching");

        if command.is_reply_kind() {
            let entry = self.inner.borrow_mut().replies.remove(&tag);
            let Some(entry) = entry else {
                // A reply can legitimately race its own timeout.
                debug!(tag, "reply for unknown tag, ignoring");
                return Ok(());
            };
            entry.time_event.free();
            self.inner.borrow_mut().creds = creds;
            (entry.cb)(&entry.userdata, command, &mut ts);
            self.inner.borrow_mut().creds = None;
            Self::maybe_drain(&self.inner);
            return Ok(());
        }

        let handler = {
            let inner = self.inner.borrow();
            inner
                .table
                .iter()
                .find(|(c, _)| *c == command)
                .map(|(_, h)| *h)
        };
        let Some(handler) = handler else {
            debug!(?command, "no handler for command");
            return Err(ErrorCode::Protocol);
        };
        self.inner.borrow_mut().creds = creds;
        handler(userdata, command, tag, &mut ts);
        self.inner.borrow_mut().creds = None;
        Ok(())
    }

    /// Credentials attached to the packet currently being dispatched.
    pub fn creds(&self) -> Option<Creds> {
        self.inner.borrow().creds
    }

    /// True while any tag is outstanding.
    pub fn is_pending(&self) -> bool {
        !self.inner.borrow().replies.is_empty()
    }

    /// Arm the drain hook; fires once when the last outstanding tag
    /// completes, then clears itself.
    pub fn set_drain_callback(&self, cb: Option<Box<dyn FnOnce()>>) {
        self.inner.borrow_mut().drain_cb = cb;
    }

    fn maybe_drain(inner: &Rc<RefCell<Inner<U>>>) {
        let cb = {
            let mut i = inner.borrow_mut();
            if i.replies.is_empty() {
                i.drain_cb.take()
            } else {
                None
            }
        };
        if let Some(cb) = cb {
            cb();
        }
    }

    /// Drop every outstanding continuation without firing it. Their
    /// owned state (operations) is released by the drop.
    pub fn unlink(&self) {
        let mut inner = self.inner.borrow_mut();
        for (_, entry) in inner.replies.drain() {
            entry.time_event.free();
        }
        inner.drain_cb = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Rc<RefCell<Vec<String>>>;

    fn log_handler(u: &Log, command: Command, tag: u32, _ts: &mut TagStruct) {
        u.borrow_mut().push(format!("{command:?}:{tag}"));
    }

    static TABLE: &[(Command, CommandHandler<Log>)] = &[(Command::SubscribeEvent, log_handler)];

    fn packet(command: Command, tag: u32) -> Bytes {
        let mut ts = TagStruct::new();
        ts.put_u32(command.to_wire());
        ts.put_u32(tag);
        ts.into_bytes()
    }

    #[test]
    fn reply_routes_by_tag_and_fires_once() {
        let ml = Mainloop::new();
        let pd: Pdispatch<Log> = Pdispatch::new(&ml, TABLE);
        let log: Log = Rc::new(RefCell::new(Vec::new()));

        pd.register_reply(
            5,
            DEFAULT_TIMEOUT,
            Rc::clone(&log),
            Box::new(|u, command, _ts| u.borrow_mut().push(format!("reply:{command:?}"))),
        );
        assert!(pd.is_pending());

        pd.run(packet(Command::Reply, 5), None, &log).expect("run");
        assert!(!pd.is_pending());
        // Same tag again: late duplicate, ignored.
        pd.run(packet(Command::Reply, 5), None, &log).expect("run");
        assert_eq!(*log.borrow(), vec!["reply:Reply".to_string()]);
    }

    #[test]
    fn command_routes_by_table() {
        let ml = Mainloop::new();
        let pd: Pdispatch<Log> = Pdispatch::new(&ml, TABLE);
        let log: Log = Rc::new(RefCell::new(Vec::new()));

        pd.run(packet(Command::SubscribeEvent, 99), None, &log)
            .expect("run");
        assert_eq!(*log.borrow(), vec!["SubscribeEvent:99".to_string()]);
    }

    #[test]
    fn unknown_command_is_protocol_violation() {
        let ml = Mainloop::new();
        let pd: Pdispatch<Log> = Pdispatch::new(&ml, TABLE);
        let log: Log = Rc::new(RefCell::new(Vec::new()));

        // Started is a known command with no handler in this table.
        assert_eq!(
            pd.run(packet(Command::Started, 0), None, &log),
            Err(ErrorCode::Protocol)
        );

        let mut ts = TagStruct::new();
        ts.put_u32(0xFFFF);
        ts.put_u32(0);
        assert_eq!(
            pd.run(ts.into_bytes(), None, &log),
            Err(ErrorCode::Protocol)
        );
    }

    #[test]
    fn deadline_synthesizes_timeout() {
        let ml = Mainloop::new();
        let pd: Pdispatch<Log> = Pdispatch::new(&ml, TABLE);
        let log: Log = Rc::new(RefCell::new(Vec::new()));

        pd.register_reply(
            7,
            Duration::ZERO,
            Rc::clone(&log),
            Box::new(|u, command, _ts| u.borrow_mut().push(format!("got:{command:?}"))),
        );
        ml.iterate(false).expect("iterate");
        assert_eq!(*log.borrow(), vec!["got:Timeout".to_string()]);
        assert!(!pd.is_pending());
    }

    #[test]
    fn drain_fires_when_last_tag_completes() {
        let ml = Mainloop::new();
        let pd: Pdispatch<Log> = Pdispatch::new(&ml, TABLE);
        let log: Log = Rc::new(RefCell::new(Vec::new()));

        pd.register_reply(1, DEFAULT_TIMEOUT, Rc::clone(&log), Box::new(|_, _, _| {}));
        pd.register_reply(2, DEFAULT_TIMEOUT, Rc::clone(&log), Box::new(|_, _, _| {}));

        let fired = Rc::new(RefCell::new(0));
        let fired2 = Rc::clone(&fired);
        pd.set_drain_callback(Some(Box::new(move || *fired2.borrow_mut() += 1)));

        pd.run(packet(Command::Reply, 1), None, &log).expect("run");
        assert_eq!(*fired.borrow(), 0);
        pd.run(packet(Command::Reply, 2), None, &log).expect("run");
        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn unlink_drops_continuations_unfired() {
        let ml = Mainloop::new();
        let pd: Pdispatch<Log> = Pdispatch::new(&ml, TABLE);
        let log: Log = Rc::new(RefCell::new(Vec::new()));

        pd.register_reply(
            3,
            DEFAULT_TIMEOUT,
            Rc::clone(&log),
            Box::new(|u, _, _| u.borrow_mut().push("fired".into())),
        );
        pd.unlink();
        assert!(!pd.is_pending());
        pd.run(packet(Command::Reply, 3), None, &log).expect("run");
        assert!(log.borrow().is_empty());
    }
}
