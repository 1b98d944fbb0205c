//! Framed packet stream over a duplex channel.
//!
//! Every frame is a five-word big-endian descriptor followed by its
//! payload: `(length, channel, offset_hi, offset_lo, flags)`. A channel of
//! `u32::MAX` marks a control packet carrying a tag-struct; any other
//! channel carries media for that stream, with the seek mode in the low
//! flag byte. A hole frame has the hole flag set and no payload; its
//! length word is the hole size.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use nix::errno::Errno;
use tracing::{debug, trace};

use crate::command::INVALID_INDEX;
use crate::iochannel::{Creds, IoChannel};
use crate::mainloop::{IoEvent, IoEventFlags, Mainloop};
use crate::memblock::Memblock;
use crate::memblockq::SeekMode;

const DESCRIPTOR_SIZE: usize = 20;

/// Upper bound on a sane frame. Anything larger is a corrupt stream.
const FRAME_SIZE_MAX: u32 = 16 * 1024 * 1024;

const FLAG_SEEK_MASK: u32 = 0x0000_00FF;
const FLAG_HOLE: u32 = 0x0000_0100;

/// Media payload of an inbound frame.
#[derive(Debug)]
pub enum MediaPayload {
    Block(Memblock),
    /// A gap of this many bytes.
    Hole(u32),
}

pub type PacketCb = Box<dyn FnMut(Bytes, Option<Creds>)>;
pub type MemblockCb = Box<dyn FnMut(u32, i64, SeekMode, MediaPayload)>;
pub type DieCb = Box<dyn FnMut()>;
pub type DrainCb = Box<dyn FnOnce()>;

struct OutFrame {
    data: Bytes,
    with_creds: bool,
}

struct Inner {
    io: Option<IoChannel>,
    io_event: Option<IoEvent>,
    send_queue: VecDeque<OutFrame>,
    /// Bytes of the front frame already written.
    write_index: usize,
    rbuf: BytesMut,
    /// Credentials that arrived with recent bytes, attached to the next
    /// complete control packet.
    pending_creds: Option<Creds>,
    packet_cb: Option<PacketCb>,
    memblock_cb: Option<MemblockCb>,
    die_cb: Option<DieCb>,
    drain_cb: Option<DrainCb>,
    shm_enabled: bool,
    dead: bool,
}

enum Event {
    Packet(Bytes, Option<Creds>),
    Media(u32, i64, SeekMode, MediaPayload),
    Died,
}

/// The transport. Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct Pstream {
    inner: Rc<RefCell<Inner>>,
}

impl Pstream {
    pub fn new(mainloop: &Mainloop, io: IoChannel) -> Pstream {
        let inner = Rc::new(RefCell::new(Inner {
            io: Some(io),
            io_event: None,
            send_queue: VecDeque::new(),
            write_index: 0,
            rbuf: BytesMut::new(),
            pending_creds: None,
            packet_cb: None,
            memblock_cb: None,
            die_cb: None,
            drain_cb: None,
            shm_enabled: false,
            dead: false,
        }));

        let weak = Rc::downgrade(&inner);
        let fd = inner
            .borrow()
            .io
            .as_ref()
            .map(|io| io.raw_fd())
            .expect("io set");
        let io_event = mainloop.io_new(
            fd,
            IoEventFlags::INPUT,
            Box::new(move |_ev, _fd, flags| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                Pstream::on_io(&inner, flags);
            }),
        );
        inner.borrow_mut().io_event = Some(io_event);

        Pstream { inner }
    }

    pub fn set_packet_callback(&self, cb: PacketCb) {
        self.inner.borrow_mut().packet_cb = Some(cb);
    }

    pub fn set_memblock_callback(&self, cb: MemblockCb) {
        self.inner.borrow_mut().memblock_cb = Some(cb);
    }

    pub fn set_die_callback(&self, cb: DieCb) {
        self.inner.borrow_mut().die_cb = Some(cb);
    }

    /// Arm the drain hook; it fires once when the send queue empties.
    pub fn set_drain_callback(&self, cb: Option<DrainCb>) {
        self.inner.borrow_mut().drain_cb = cb;
    }

    pub fn is_pending(&self) -> bool {
        !self.inner.borrow().send_queue.is_empty()
    }

    /// Record the outcome of the shared-memory negotiation. Transfer
    /// stays copy-based either way; the flag is what the handshake and
    /// introspection observe.
    pub fn enable_shm(&self, on: bool) {
        self.inner.borrow_mut().shm_enabled = on;
    }

    pub fn is_shm_enabled(&self) -> bool {
        self.inner.borrow().shm_enabled
    }

    pub fn creds_supported(&self) -> bool {
        self.inner
            .borrow()
            .io
            .as_ref()
            .is_some_and(IoChannel::creds_supported)
    }

    /// Ask the kernel for peer credentials on inbound traffic.
    pub fn enable_creds(&self) -> Result<(), Errno> {
        match self.inner.borrow_mut().io.as_mut() {
            Some(io) => io.enable_creds(),
            None => Err(Errno::EBADF),
        }
    }

    /// Queue a control packet.
    pub fn send_packet(&self, payload: Bytes) {
        self.enqueue(payload, INVALID_INDEX, 0, 0, false);
    }

    /// Queue a control packet with our credentials attached out-of-band.
    pub fn send_packet_with_creds(&self, payload: Bytes) {
        self.enqueue(payload, INVALID_INDEX, 0, 0, true);
    }

    /// Queue a media frame for `channel`.
    pub fn send_memblock(&self, channel: u32, offset: i64, seek: SeekMode, block: &Memblock) {
        self.enqueue(
            block.as_bytes().clone(),
            channel,
            offset,
            seek as u32 & FLAG_SEEK_MASK,
            false,
        );
    }

    fn enqueue(&self, payload: Bytes, channel: u32, offset: i64, flags: u32, with_creds: bool) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.dead {
                return;
            }
            let mut frame = BytesMut::with_capacity(DESCRIPTOR_SIZE + payload.len());
            frame.put_u32(payload.len() as u32);
            frame.put_u32(channel);
            frame.put_u32((offset as u64 >> 32) as u32);
            frame.put_u32(offset as u64 as u32);
            frame.put_u32(flags);
            frame.put_slice(&payload);
            inner.send_queue.push_back(OutFrame {
                data: frame.freeze(),
                with_creds,
            });
        }
        self.update_interest();
    }

    fn update_interest(&self) {
        let inner = self.inner.borrow();
        if let Some(ev) = &inner.io_event {
            let mut interest = IoEventFlags::INPUT;
            if !inner.send_queue.is_empty() {
                interest = interest | IoEventFlags::OUTPUT;
            }
            ev.enable(interest);
        }
    }

    fn on_io(inner: &Rc<RefCell<Inner>>, flags: IoEventFlags) {
        let this = Pstream {
            inner: Rc::clone(inner),
        };

        if flags.intersects(IoEventFlags::OUTPUT) {
            this.do_write();
        }
        if flags.intersects(IoEventFlags::INPUT | IoEventFlags::HANGUP | IoEventFlags::ERROR) {
            this.do_read();
        }
    }

    fn do_write(&self) {
        let mut died = false;
        let mut drained = None;
        {
            let mut inner = self.inner.borrow_mut();
            if inner.dead {
                return;
            }
            while !inner.send_queue.is_empty() {
                let (data, with_creds) = {
                    let frame = inner.send_queue.front().expect("non-empty queue");
                    (frame.data.clone(), frame.with_creds)
                };
                let with_creds = with_creds && inner.write_index == 0;
                let chunk = data.slice(inner.write_index..);
                let Some(io) = inner.io.as_ref() else {
                    return;
                };
                let r = if with_creds {
                    io.write_with_creds(&chunk)
                } else {
                    io.write(&chunk)
                };
                match r {
                    Ok(n) => {
                        inner.write_index += n;
                        if inner.write_index >= data.len() {
                            inner.send_queue.pop_front();
                            inner.write_index = 0;
                        } else {
                            break;
                        }
                    }
                    Err(Errno::EAGAIN) | Err(Errno::EINTR) => break,
                    Err(e) => {
                        debug!("write failed: {e}");
                        died = true;
                        break;
                    }
                }
            }
            if !died && inner.send_queue.is_empty() {
                drained = inner.drain_cb.take();
            }
        }

        if died {
            self.die();
            return;
        }
        self.update_interest();
        if let Some(cb) = drained {
            cb();
        }
    }

    fn do_read(&self) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            if inner.dead {
                return;
            }

            let mut buf = [0u8; 16 * 1024];
            loop {
                let Some(io) = inner.io.as_ref() else {
                    return;
                };
                match io.read_with_creds(&mut buf) {
                    Ok((0, _)) => {
                        events.push(Event::Died);
                        break;
                    }
                    Ok((n, creds)) => {
                        if creds.is_some() {
                            inner.pending_creds = creds;
                        }
                        inner.rbuf.extend_from_slice(&buf[..n]);
                    }
                    Err(Errno::EAGAIN) | Err(Errno::EINTR) => break,
                    Err(e) => {
                        debug!("read failed: {e}");
                        events.push(Event::Died);
                        break;
                    }
                }
            }

            Self::parse_frames(&mut inner, &mut events);
        }

        self.dispatch(events);
    }

    fn parse_frames(inner: &mut Inner, events: &mut Vec<Event>) {
        loop {
            if inner.rbuf.len() < DESCRIPTOR_SIZE {
                return;
            }
            let d = &inner.rbuf[..DESCRIPTOR_SIZE];
            let length = u32::from_be_bytes([d[0], d[1], d[2], d[3]]);
            let channel = u32::from_be_bytes([d[4], d[5], d[6], d[7]]);
            let offset_hi = u32::from_be_bytes([d[8], d[9], d[10], d[11]]);
            let offset_lo = u32::from_be_bytes([d[12], d[13], d[14], d[15]]);
            let flags = u32::from_be_bytes([d[16], d[17], d[18], d[19]]);

            if length > FRAME_SIZE_MAX {
                debug!(length, "oversized frame, killing stream");
                events.push(Event::Died);
                return;
            }

            let offset = ((u64::from(offset_hi) << 32) | u64::from(offset_lo)) as i64;
            let is_hole = flags & FLAG_HOLE != 0;
            let payload_len = if is_hole { 0 } else { length as usize };

            if inner.rbuf.len() < DESCRIPTOR_SIZE + payload_len {
                return;
            }
            inner.rbuf.advance(DESCRIPTOR_SIZE);
            let payload = inner.rbuf.split_to(payload_len).freeze();

            if channel == INVALID_INDEX {
                if is_hole || flags != 0 {
                    debug!(flags, "garbage flags on control packet");
                    events.push(Event::Died);
                    return;
                }
                let creds = inner.pending_creds.take();
                events.push(Event::Packet(payload, creds));
            } else {
                let Some(seek) = SeekMode::from_wire(flags & FLAG_SEEK_MASK) else {
                    debug!(flags, "unknown seek mode");
                    events.push(Event::Died);
                    return;
                };
                let media = if is_hole {
                    MediaPayload::Hole(length)
                } else {
                    MediaPayload::Block(Memblock::from_bytes(payload))
                };
                events.push(Event::Media(channel, offset, seek, media));
            }
        }
    }

    fn dispatch(&self, events: Vec<Event>) {
        for event in events {
            // A callback may have torn the stream down mid-batch.
            if self.inner.borrow().dead {
                return;
            }
            match event {
                Event::Packet(payload, creds) => {
                    trace!(len = payload.len(), "control packet");
                    let cb = self.inner.borrow_mut().packet_cb.take();
                    if let Some(mut cb) = cb {
                        cb(payload, creds);
                        let mut inner = self.inner.borrow_mut();
                        if !inner.dead && inner.packet_cb.is_none() {
                            inner.packet_cb = Some(cb);
                        }
                    }
                }
                Event::Media(channel, offset, seek, media) => {
                    let cb = self.inner.borrow_mut().memblock_cb.take();
                    if let Some(mut cb) = cb {
                        cb(channel, offset, seek, media);
                        let mut inner = self.inner.borrow_mut();
                        if !inner.dead && inner.memblock_cb.is_none() {
                            inner.memblock_cb = Some(cb);
                        }
                    }
                }
                Event::Died => {
                    self.die();
                    return;
                }
            }
        }
    }

    fn die(&self) {
        let cb = {
            let mut inner = self.inner.borrow_mut();
            if inner.dead {
                return;
            }
            inner.dead = true;
            if let Some(ev) = inner.io_event.take() {
                ev.free();
            }
            inner.send_queue.clear();
            inner.drain_cb = None;
            inner.die_cb.take()
        };
        if let Some(mut cb) = cb {
            cb();
        }
    }

    /// Detach from the event loop and drop every callback. The stream is
    /// unusable afterwards.
    pub fn unlink(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.dead = true;
        if let Some(ev) = inner.io_event.take() {
            ev.free();
        }
        inner.io = None;
        inner.send_queue.clear();
        inner.packet_cb = None;
        inner.memblock_cb = None;
        inner.die_cb = None;
        inner.drain_cb = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

    fn pstream_pair(ml: &Mainloop) -> (Pstream, Pstream) {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK,
        )
        .expect("socketpair");
        (
            Pstream::new(ml, IoChannel::new(a, true, true)),
            Pstream::new(ml, IoChannel::new(b, true, true)),
        )
    }

    fn pump(ml: &Mainloop, n: usize) {
        for _ in 0..n {
            ml.iterate(false).expect("iterate");
        }
    }

    #[test]
    fn control_packet_roundtrip() {
        let ml = Mainloop::new();
        let (a, b) = pstream_pair(&ml);

        let got: Rc<RefCell<Vec<Bytes>>> = Rc::new(RefCell::new(Vec::new()));
        let got2 = Rc::clone(&got);
        b.set_packet_callback(Box::new(move |payload, _creds| {
            got2.borrow_mut().push(payload);
        }));

        a.send_packet(Bytes::from_static(b"first"));
        a.send_packet(Bytes::from_static(b"second"));
        assert!(a.is_pending());
        pump(&ml, 10);

        assert!(!a.is_pending());
        assert_eq!(
            *got.borrow(),
            vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
        );
    }

    #[test]
    fn memblock_frame_carries_seek_and_offset() {
        let ml = Mainloop::new();
        let (a, b) = pstream_pair(&ml);

        let got = Rc::new(RefCell::new(Vec::new()));
        let got2 = Rc::clone(&got);
        b.set_memblock_callback(Box::new(move |channel, offset, seek, media| {
            let len = match media {
                MediaPayload::Block(b) => b.len() as i64,
                MediaPayload::Hole(n) => -i64::from(n),
            };
            got2.borrow_mut().push((channel, offset, seek, len));
        }));

        let block = Memblock::from_bytes(Bytes::from_static(&[1, 2, 3, 4]));
        a.send_memblock(9, 256, SeekMode::Absolute, &block);
        pump(&ml, 10);

        assert_eq!(*got.borrow(), vec![(9, 256, SeekMode::Absolute, 4)]);
    }

    #[test]
    fn drain_fires_once_when_queue_empties() {
        let ml = Mainloop::new();
        let (a, _b) = pstream_pair(&ml);

        let fired = Rc::new(RefCell::new(0));
        let fired2 = Rc::clone(&fired);
        a.send_packet(Bytes::from_static(b"payload"));
        a.set_drain_callback(Some(Box::new(move || *fired2.borrow_mut() += 1)));
        pump(&ml, 10);
        pump(&ml, 10);

        assert_eq!(*fired.borrow(), 1);
        assert!(!a.is_pending());
    }

    #[test]
    fn peer_close_reports_death() {
        let ml = Mainloop::new();
        let (a, b) = pstream_pair(&ml);

        let died = Rc::new(RefCell::new(false));
        let died2 = Rc::clone(&died);
        b.set_die_callback(Box::new(move || *died2.borrow_mut() = true));

        a.unlink();
        drop(a);
        pump(&ml, 10);

        assert!(*died.borrow());
    }

    #[test]
    fn creds_reach_packet_callback() {
        let ml = Mainloop::new();
        let (a, b) = pstream_pair(&ml);
        b.enable_creds().expect("enable creds");

        let got = Rc::new(RefCell::new(None));
        let got2 = Rc::clone(&got);
        b.set_packet_callback(Box::new(move |_payload, creds| {
            *got2.borrow_mut() = creds;
        }));

        a.send_packet_with_creds(Bytes::from_static(b"auth"));
        pump(&ml, 10);

        let creds = got.borrow().expect("creds attached");
        assert_eq!(creds.uid, nix::unistd::getuid().as_raw());
    }
}
