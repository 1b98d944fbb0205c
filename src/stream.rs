//! Playback and record stream objects.
//!
//! This layer is deliberately thin: enough of a stream for the context's
//! routing obligations. A stream registers under its server-assigned
//! channel id, keeps an inbound queue when recording, and surfaces the
//! server-push notifications (killed, moved, suspended, started, events,
//! buffer-attribute changes, write requests). The full buffering and
//! timing machinery of a complete stream implementation lives elsewhere.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use tracing::debug;

use crate::command::{Command, INVALID_INDEX};
use crate::context::{Context, ContextState, WeakContext};
use crate::error::{ErrorCode, Result};
use crate::forkdetect;
use crate::memblock::Memblock;
use crate::memblockq::{Memblockq, SeekMode};
use crate::proplist::Proplist;
use crate::pstream::MediaPayload;
use crate::sample::SampleSpec;

/// Stream lifecycle states.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamState {
    Unconnected,
    Creating,
    Ready,
    Failed,
    Terminated,
}

impl StreamState {
    pub fn is_good(self) -> bool {
        !matches!(self, StreamState::Failed | StreamState::Terminated)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    Playback,
    Record,
}

/// Server-applied buffer metrics, as pushed by attr-changed events.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BufferAttr {
    pub maxlength: u32,
    pub length: u32,
}

pub type StreamNotifyCb = Box<dyn FnMut(&Stream)>;
pub type StreamSizeCb = Box<dyn FnMut(&Stream, usize)>;
pub type StreamEventCb = Box<dyn FnMut(&Stream, &str, &Proplist)>;

struct Inner {
    context: WeakContext,
    state: StreamState,
    direction: Option<Direction>,
    name: String,
    sample_spec: SampleSpec,
    channel: Option<u32>,
    stream_index: u32,
    device_index: u32,
    device_name: Option<String>,
    suspended: bool,
    requested_bytes: u64,
    record_q: Option<Memblockq>,
    buffer_attr: Option<BufferAttr>,
    state_cb: Option<StreamNotifyCb>,
    read_cb: Option<StreamSizeCb>,
    write_cb: Option<StreamSizeCb>,
    overflow_cb: Option<StreamNotifyCb>,
    underflow_cb: Option<StreamNotifyCb>,
    started_cb: Option<StreamNotifyCb>,
    moved_cb: Option<StreamNotifyCb>,
    suspended_cb: Option<StreamNotifyCb>,
    event_cb: Option<StreamEventCb>,
    buffer_attr_cb: Option<StreamNotifyCb>,
}

/// Handle to a stream. Cloning shares the stream.
#[derive(Clone)]
pub struct Stream {
    inner: Rc<RefCell<Inner>>,
}

macro_rules! fire {
    ($self:expr, $slot:ident, |$cb:ident| $call:expr) => {{
        let taken = $self.inner.borrow_mut().$slot.take();
        if let Some(mut $cb) = taken {
            $call;
            let mut inner = $self.inner.borrow_mut();
            // A reentrant teardown clears slots; they stay cleared.
            if inner.state.is_good() && inner.$slot.is_none() {
                inner.$slot = Some($cb);
            }
        }
    }};
}

impl Stream {
    /// Create an unconnected stream on `c`.
    pub fn new(c: &Context, name: &str, sample_spec: &SampleSpec) -> Result<Stream> {
        if forkdetect::forked() {
            return Err(ErrorCode::Forked);
        }
        if !sample_spec.is_valid() {
            return Err(ErrorCode::Invalid);
        }
        if !c.state().is_good() {
            return Err(ErrorCode::BadState);
        }

        Ok(Stream {
            inner: Rc::new(RefCell::new(Inner {
                context: c.downgrade(),
                state: StreamState::Unconnected,
                direction: None,
                name: name.to_string(),
                sample_spec: *sample_spec,
                channel: None,
                stream_index: INVALID_INDEX,
                device_index: INVALID_INDEX,
                device_name: None,
                suspended: false,
                requested_bytes: 0,
                record_q: None,
                buffer_attr: None,
                state_cb: None,
                read_cb: None,
                write_cb: None,
                overflow_cb: None,
                underflow_cb: None,
                started_cb: None,
                moved_cb: None,
                suspended_cb: None,
                event_cb: None,
                buffer_attr_cb: None,
            })),
        })
    }

    pub(crate) fn same(a: &Stream, b: &Stream) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    fn context(&self) -> Result<Context> {
        self.inner
            .borrow()
            .context
            .upgrade()
            .ok_or(ErrorCode::BadState)
    }

    // === Connect / disconnect ===

    /// Open this stream for recording; `fragsize` is the delivery granule
    /// hint in bytes.
    pub fn connect_record(&self, fragsize: u32) -> Result<()> {
        self.connect(Direction::Record, fragsize)
    }

    /// Open this stream for playback; `tlength` is the target buffer
    /// length hint in bytes.
    pub fn connect_playback(&self, tlength: u32) -> Result<()> {
        self.connect(Direction::Playback, tlength)
    }

    fn connect(&self, direction: Direction, buffer_hint: u32) -> Result<()> {
        if forkdetect::forked() {
            return Err(ErrorCode::Forked);
        }
        let c = self.context()?;
        if self.state() != StreamState::Unconnected {
            c.set_last_error(ErrorCode::BadState);
            return Err(ErrorCode::BadState);
        }
        if c.state() != ContextState::Ready {
            c.set_last_error(ErrorCode::BadState);
            return Err(ErrorCode::BadState);
        }

        let command = match direction {
            Direction::Playback => Command::CreatePlaybackStream,
            Direction::Record => Command::CreateRecordStream,
        };
        let (mut ts, tag) = {
            let mut inner = self.inner.borrow_mut();
            inner.direction = Some(direction);
            let (mut ts, tag) = c.command_tagstruct(command);
            ts.put_string(Some(&inner.name));
            ts.put_sample_spec(&inner.sample_spec);
            ts.put_u32(buffer_hint);
            (ts, tag)
        };
        // Stub out the rest of the negotiation the full stream layer
        // would add here (channel maps, flags, volumes).
        ts.put_bool(false);

        c.adopt_stream(self.clone());
        self.transition(StreamState::Creating);

        c.send_tagstruct(ts);
        let s = self.clone();
        c.register_reply(
            tag,
            Box::new(move |u, command, ts| {
                let Some(c) = u.upgrade() else {
                    return;
                };
                s.on_created(&c, command, ts);
            }),
        );
        Ok(())
    }

    fn on_created(&self, c: &Context, command: Command, ts: &mut crate::tagstruct::TagStruct) {
        if self.state() != StreamState::Creating {
            return;
        }

        if command != Command::Reply {
            if c.handle_error(command, ts, false).is_ok() {
                self.transition(StreamState::Failed);
            }
            return;
        }

        let (Ok(channel), Ok(stream_index)) = (ts.get_u32(), ts.get_u32()) else {
            c.fail(ErrorCode::Protocol);
            return;
        };
        if channel == INVALID_INDEX || !ts.eof() {
            c.fail(ErrorCode::Protocol);
            return;
        }

        let record = {
            let mut inner = self.inner.borrow_mut();
            inner.channel = Some(channel);
            inner.stream_index = stream_index;
            let record = inner.direction == Some(Direction::Record);
            if record {
                inner.record_q = Some(Memblockq::new(inner.sample_spec.frame_size()));
            }
            record
        };
        c.bind_stream_channel(channel, self.clone(), record);
        debug!(channel, stream_index, "stream created");
        self.transition(StreamState::Ready);
    }

    /// Close the stream on the server and leave the channel registry.
    pub fn disconnect(&self) -> Result<()> {
        if forkdetect::forked() {
            return Err(ErrorCode::Forked);
        }
        let c = self.context()?;
        let (channel, direction) = {
            let inner = self.inner.borrow();
            (inner.channel, inner.direction)
        };
        let Some(channel) = channel else {
            return Err(ErrorCode::BadState);
        };
        if c.state() != ContextState::Ready {
            return Err(ErrorCode::BadState);
        }

        let command = match direction {
            Some(Direction::Playback) => Command::DeletePlaybackStream,
            Some(Direction::Record) => Command::DeleteRecordStream,
            None => return Err(ErrorCode::BadState),
        };
        let (mut ts, tag) = c.command_tagstruct(command);
        ts.put_u32(channel);
        c.send_tagstruct(ts);
        let s = self.clone();
        c.register_reply(
            tag,
            Box::new(move |u, _command, _ts| {
                if u.upgrade().is_some() {
                    s.transition(StreamState::Terminated);
                }
            }),
        );
        Ok(())
    }

    // === Introspection ===

    pub fn state(&self) -> StreamState {
        self.inner.borrow().state
    }

    pub fn direction(&self) -> Option<Direction> {
        self.inner.borrow().direction
    }

    /// The channel id the server keyed this stream under.
    pub fn channel(&self) -> Option<u32> {
        self.inner.borrow().channel
    }

    /// The server-side object index of this stream.
    pub fn index(&self) -> Result<u32> {
        let inner = self.inner.borrow();
        if inner.stream_index == INVALID_INDEX {
            return Err(ErrorCode::BadState);
        }
        Ok(inner.stream_index)
    }

    pub fn device_name(&self) -> Option<String> {
        self.inner.borrow().device_name.clone()
    }

    /// Index of the device the stream currently runs on.
    pub fn device_index(&self) -> u32 {
        self.inner.borrow().device_index
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.borrow().suspended
    }

    pub fn buffer_attr(&self) -> Option<BufferAttr> {
        self.inner.borrow().buffer_attr
    }

    /// Bytes the server asked for and has not yet received.
    pub fn requested_bytes(&self) -> usize {
        self.inner.borrow().requested_bytes as usize
    }

    // === Record side ===

    /// Bytes queued for reading, holes included.
    pub fn readable_size(&self) -> usize {
        self.inner.borrow().record_q.as_ref().map_or(0, Memblockq::len)
    }

    /// The next contiguous run of record data; holes read as silence.
    pub fn peek(&self) -> Option<Bytes> {
        self.inner.borrow_mut().record_q.as_mut()?.peek()
    }

    /// Consume `n` bytes after a peek.
    pub fn discard(&self, n: usize) {
        if let Some(q) = self.inner.borrow_mut().record_q.as_mut() {
            q.drop_bytes(n);
        }
    }

    // === Playback side ===

    /// Queue sample data on the server at the stream's write pointer.
    pub fn write(&self, block: &Memblock, offset: i64, seek: SeekMode) -> Result<()> {
        if forkdetect::forked() {
            return Err(ErrorCode::Forked);
        }
        let c = self.context()?;
        let channel = {
            let inner = self.inner.borrow();
            if inner.state != StreamState::Ready {
                return Err(ErrorCode::BadState);
            }
            inner.channel.ok_or(ErrorCode::BadState)?
        };
        {
            let mut inner = self.inner.borrow_mut();
            inner.requested_bytes = inner.requested_bytes.saturating_sub(block.len() as u64);
        }
        c.send_memblock(channel, offset, seek, block);
        Ok(())
    }

    // === Callback registration ===

    pub fn set_state_callback(&self, cb: Option<StreamNotifyCb>) {
        self.inner.borrow_mut().state_cb = cb;
    }

    pub fn set_read_callback(&self, cb: Option<StreamSizeCb>) {
        self.inner.borrow_mut().read_cb = cb;
    }

    pub fn set_write_callback(&self, cb: Option<StreamSizeCb>) {
        self.inner.borrow_mut().write_cb = cb;
    }

    pub fn set_overflow_callback(&self, cb: Option<StreamNotifyCb>) {
        self.inner.borrow_mut().overflow_cb = cb;
    }

    pub fn set_underflow_callback(&self, cb: Option<StreamNotifyCb>) {
        self.inner.borrow_mut().underflow_cb = cb;
    }

    pub fn set_started_callback(&self, cb: Option<StreamNotifyCb>) {
        self.inner.borrow_mut().started_cb = cb;
    }

    pub fn set_moved_callback(&self, cb: Option<StreamNotifyCb>) {
        self.inner.borrow_mut().moved_cb = cb;
    }

    pub fn set_suspended_callback(&self, cb: Option<StreamNotifyCb>) {
        self.inner.borrow_mut().suspended_cb = cb;
    }

    pub fn set_event_callback(&self, cb: Option<StreamEventCb>) {
        self.inner.borrow_mut().event_cb = cb;
    }

    pub fn set_buffer_attr_callback(&self, cb: Option<StreamNotifyCb>) {
        self.inner.borrow_mut().buffer_attr_cb = cb;
    }

    // === Context-driven notifications ===

    pub(crate) fn transition(&self, st: StreamState) {
        if self.inner.borrow().state == st {
            return;
        }
        let _self_ref = self.clone();
        self.inner.borrow_mut().state = st;
        debug!(state = ?st, "stream state");

        fire!(self, state_cb, |cb| cb(self));

        if !st.is_good() {
            let ctx = self.inner.borrow().context.upgrade();
            if let Some(c) = ctx {
                c.forget_stream(self);
            }
            let mut inner = self.inner.borrow_mut();
            inner.state_cb = None;
            inner.read_cb = None;
            inner.write_cb = None;
            inner.overflow_cb = None;
            inner.underflow_cb = None;
            inner.started_cb = None;
            inner.moved_cb = None;
            inner.suspended_cb = None;
            inner.event_cb = None;
            inner.buffer_attr_cb = None;
        }
    }

    pub(crate) fn on_memblock(&self, offset: i64, seek: SeekMode, media: MediaPayload) {
        let _self_ref = self.clone();
        let readable = {
            let mut inner = self.inner.borrow_mut();
            let Some(q) = inner.record_q.as_mut() else {
                return;
            };
            match media {
                MediaPayload::Block(block) if !block.is_empty() => {
                    q.seek(offset, seek);
                    q.push_align(&block);
                }
                MediaPayload::Block(_) => q.seek(offset, seek),
                MediaPayload::Hole(len) => q.seek(offset + i64::from(len), seek),
            }
            q.len()
        };

        if readable > 0 {
            fire!(self, read_cb, |cb| cb(self, readable));
        }
    }

    pub(crate) fn on_request(&self, nbytes: u32) {
        let _self_ref = self.clone();
        let requested = {
            let mut inner = self.inner.borrow_mut();
            inner.requested_bytes += u64::from(nbytes);
            inner.requested_bytes as usize
        };
        if requested > 0 {
            fire!(self, write_cb, |cb| cb(self, requested));
        }
    }

    pub(crate) fn on_overflow(&self) {
        let _self_ref = self.clone();
        fire!(self, overflow_cb, |cb| cb(self));
    }

    pub(crate) fn on_underflow(&self) {
        let _self_ref = self.clone();
        fire!(self, underflow_cb, |cb| cb(self));
    }

    pub(crate) fn on_started(&self) {
        let _self_ref = self.clone();
        fire!(self, started_cb, |cb| cb(self));
    }

    pub(crate) fn on_moved(&self, device_index: u32, device_name: String, suspended: bool) {
        let _self_ref = self.clone();
        {
            let mut inner = self.inner.borrow_mut();
            inner.device_index = device_index;
            inner.device_name = Some(device_name);
            inner.suspended = suspended;
        }
        fire!(self, moved_cb, |cb| cb(self));
    }

    pub(crate) fn on_suspended(&self, suspended: bool) {
        let _self_ref = self.clone();
        self.inner.borrow_mut().suspended = suspended;
        fire!(self, suspended_cb, |cb| cb(self));
    }

    pub(crate) fn on_event(&self, name: &str, proplist: &Proplist) {
        let _self_ref = self.clone();
        fire!(self, event_cb, |cb| cb(self, name, proplist));
    }

    pub(crate) fn on_buffer_attr(&self, maxlength: u32, length: u32) {
        let _self_ref = self.clone();
        self.inner.borrow_mut().buffer_attr = Some(BufferAttr { maxlength, length });
        fire!(self, buffer_attr_cb, |cb| cb(self));
    }
}
