//! Shared test fixture: a scripted stub server speaking the native wire
//! protocol over a unix socket in a scratch directory.
#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use pulsenative::tagstruct::TagStruct;
use pulsenative::{ClientConfig, Command, ConnectFlags, Context, ContextState, Mainloop, Proplist};

pub const DESCRIPTOR_SIZE: usize = 20;
pub const CONTROL_CHANNEL: u32 = u32::MAX;
pub const FLAG_HOLE: u32 = 0x100;
pub const SHM_BIT: u32 = 0x8000_0000;

// === Frame helpers ===

pub fn frame(channel: u32, offset: u64, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DESCRIPTOR_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&channel.to_be_bytes());
    out.extend_from_slice(&((offset >> 32) as u32).to_be_bytes());
    out.extend_from_slice(&(offset as u32).to_be_bytes());
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// A media frame for `channel` with `seek` in the low flag byte.
pub fn media_frame(channel: u32, offset: u64, seek: u32, payload: &[u8]) -> Vec<u8> {
    frame(channel, offset, seek, payload)
}

/// A hole frame: no payload, length word carries the hole size.
pub fn hole_frame(channel: u32, offset: u64, seek: u32, hole_len: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(DESCRIPTOR_SIZE);
    out.extend_from_slice(&hole_len.to_be_bytes());
    out.extend_from_slice(&channel.to_be_bytes());
    out.extend_from_slice(&((offset >> 32) as u32).to_be_bytes());
    out.extend_from_slice(&(offset as u32).to_be_bytes());
    out.extend_from_slice(&(seek | FLAG_HOLE).to_be_bytes());
    out
}

pub fn control_frame(ts: TagStruct) -> Vec<u8> {
    frame(CONTROL_CHANNEL, 0, 0, ts.as_bytes())
}

pub fn packet(command: Command, tag: u32) -> TagStruct {
    let mut ts = TagStruct::new();
    ts.put_u32(command.to_wire());
    ts.put_u32(tag);
    ts
}

// === Stub server ===

#[derive(Clone)]
pub struct StubConfig {
    /// Raw version word for the AUTH reply, capability bit included.
    pub version_word: u32,
    /// Reply to AUTH with this error code instead.
    pub auth_error: Option<u32>,
    pub client_index: u32,
    /// Answer this command with an error instead of an empty reply.
    pub ack_error: Option<(Command, u32)>,
    /// Park ack replies until `release_acks`.
    pub hold_acks: bool,
}

impl Default for StubConfig {
    fn default() -> Self {
        StubConfig {
            version_word: 30 | SHM_BIT,
            auth_error: None,
            client_index: 7,
            ack_error: None,
            hold_acks: false,
        }
    }
}

impl StubConfig {
    fn masked_version(&self) -> u32 {
        if self.version_word >= 13 {
            self.version_word & !SHM_BIT
        } else {
            self.version_word
        }
    }
}

pub enum ServerOp {
    PushFrame(Vec<u8>),
    ReleaseAcks,
    Close,
}

pub struct StubServer {
    pub path: PathBuf,
    pub seen: Arc<Mutex<Vec<u32>>>,
    control: Sender<ServerOp>,
    handle: Option<thread::JoinHandle<()>>,
    _dir: Option<tempfile::TempDir>,
}

impl StubServer {
    pub fn start(config: StubConfig) -> StubServer {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("native");
        let mut server = Self::start_at(config, path);
        server._dir = Some(dir);
        server
    }

    /// Bind at an exact path the test controls (e.g. a runtime dir).
    pub fn start_at(config: StubConfig, path: PathBuf) -> StubServer {
        let listener = UnixListener::bind(&path).expect("bind stub socket");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = channel();
        let seen2 = Arc::clone(&seen);
        let handle = thread::spawn(move || run_server(listener, config, seen2, rx));
        StubServer {
            path,
            seen,
            control: tx,
            handle: Some(handle),
            _dir: None,
        }
    }

    pub fn server_string(&self) -> String {
        format!("unix:{}", self.path.display())
    }

    pub fn push_frame(&self, f: Vec<u8>) {
        let _ = self.control.send(ServerOp::PushFrame(f));
    }

    pub fn push_packet(&self, ts: TagStruct) {
        self.push_frame(control_frame(ts));
    }

    pub fn release_acks(&self) {
        let _ = self.control.send(ServerOp::ReleaseAcks);
    }

    pub fn close(&self) {
        let _ = self.control.send(ServerOp::Close);
    }

    pub fn saw_command(&self, command: Command) -> bool {
        self.seen
            .lock()
            .expect("seen lock")
            .contains(&command.to_wire())
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        let _ = self.control.send(ServerOp::Close);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_server(
    listener: UnixListener,
    config: StubConfig,
    seen: Arc<Mutex<Vec<u32>>>,
    rx: Receiver<ServerOp>,
) {
    listener
        .set_nonblocking(true)
        .expect("nonblocking listener");
    let mut stream = loop {
        match listener.accept() {
            Ok((s, _)) => break s,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                match rx.try_recv() {
                    Ok(ServerOp::Close) => return,
                    Ok(_) => {}
                    Err(std::sync::mpsc::TryRecvError::Disconnected) => return,
                    Err(std::sync::mpsc::TryRecvError::Empty) => {}
                }
                thread::sleep(Duration::from_millis(2));
            }
            Err(_) => return,
        }
    };
    stream.set_nonblocking(false).expect("blocking stream");
    stream
        .set_read_timeout(Some(Duration::from_millis(5)))
        .expect("read timeout");

    let mut buf: Vec<u8> = Vec::new();
    let mut held: Vec<(Command, u32)> = Vec::new();
    let mut next_channel = 1u32;

    loop {
        while let Ok(op) = rx.try_recv() {
            match op {
                ServerOp::PushFrame(f) => {
                    let _ = stream.write_all(&f);
                }
                ServerOp::ReleaseAcks => {
                    for (_, tag) in held.drain(..) {
                        send_packet(&mut stream, packet(Command::Reply, tag));
                    }
                }
                ServerOp::Close => {
                    let _ = stream.shutdown(Shutdown::Both);
                    return;
                }
            }
        }

        let mut tmp = [0u8; 4096];
        match stream.read(&mut tmp) {
            Ok(0) => return,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => return,
        }

        while buf.len() >= DESCRIPTOR_SIZE {
            let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            let channel = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
            let flags = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
            let body = if flags & FLAG_HOLE != 0 { 0 } else { len };
            if buf.len() < DESCRIPTOR_SIZE + body {
                break;
            }
            let payload: Vec<u8> = buf[DESCRIPTOR_SIZE..DESCRIPTOR_SIZE + body].to_vec();
            buf.drain(..DESCRIPTOR_SIZE + body);
            if channel == CONTROL_CHANNEL {
                handle_packet(
                    &mut stream,
                    &payload,
                    &config,
                    &seen,
                    &mut held,
                    &mut next_channel,
                );
            }
        }
    }
}

fn send_packet(stream: &mut UnixStream, ts: TagStruct) {
    let _ = stream.write_all(&control_frame(ts));
}

fn handle_packet(
    stream: &mut UnixStream,
    payload: &[u8],
    config: &StubConfig,
    seen: &Arc<Mutex<Vec<u32>>>,
    held: &mut Vec<(Command, u32)>,
    next_channel: &mut u32,
) {
    let mut ts = TagStruct::from_bytes(Bytes::copy_from_slice(payload));
    let Ok(raw) = ts.get_u32() else { return };
    let Ok(tag) = ts.get_u32() else { return };
    seen.lock().expect("seen lock").push(raw);
    let Some(command) = Command::from_wire(raw) else {
        return;
    };

    match command {
        Command::Auth => {
            if let Some(code) = config.auth_error {
                let mut r = packet(Command::Error, tag);
                r.put_u32(code);
                send_packet(stream, r);
            } else {
                let mut r = packet(Command::Reply, tag);
                r.put_u32(config.version_word);
                send_packet(stream, r);
            }
        }
        Command::SetClientName => {
            let mut r = packet(Command::Reply, tag);
            if config.masked_version() >= 13 {
                r.put_u32(config.client_index);
            }
            send_packet(stream, r);
        }
        Command::CreatePlaybackStream | Command::CreateRecordStream => {
            let mut r = packet(Command::Reply, tag);
            r.put_u32(*next_channel);
            r.put_u32(100 + *next_channel);
            *next_channel += 1;
            send_packet(stream, r);
        }
        Command::Exit
        | Command::SetDefaultSink
        | Command::SetDefaultSource
        | Command::UpdateClientProplist
        | Command::RemoveClientProplist
        | Command::Subscribe
        | Command::DeletePlaybackStream
        | Command::DeleteRecordStream => {
            if let Some((cmd, code)) = config.ack_error
                && cmd == command
            {
                let mut r = packet(Command::Error, tag);
                r.put_u32(code);
                send_packet(stream, r);
            } else if config.hold_acks {
                held.push((command, tag));
            } else {
                send_packet(stream, packet(Command::Reply, tag));
            }
        }
        _ => {}
    }
}

// === Client fixture ===

pub fn test_config() -> ClientConfig {
    ClientConfig {
        autospawn: false,
        extra_arguments: None,
        ..ClientConfig::default()
    }
}

pub fn new_context(ml: &Mainloop) -> Context {
    Context::new_with_config(ml, Some("stub-tests"), Proplist::new(), test_config())
        .expect("context")
}

/// Iterate the loop until `cond` holds or five seconds pass.
pub fn wait_for(ml: &Mainloop, what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        ml.iterate(false).expect("iterate");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Connect to `server` and drive the loop until READY.
pub fn connect_ready(ml: &Mainloop, server: &StubServer) -> Context {
    let ctx = new_context(ml);
    ctx.connect(
        Some(&server.server_string()),
        ConnectFlags::NOAUTOSPAWN,
        None,
    )
    .expect("connect");
    wait_for(ml, "READY", || ctx.state() == ContextState::Ready);
    ctx
}
