//! The connection context.
//!
//! A context owns one connection attempt to the daemon: the candidate
//! cascade, the authentication and name handshake, the transport and
//! dispatcher, and every stream and operation living on the link. Its
//! lifecycle is `UNCONNECTED → CONNECTING → AUTHORIZING → SETTING_NAME →
//! READY`, with `FAILED` and `TERMINATED` absorbing.
//!
//! Everything runs on the caller's main loop thread. Internal callbacks
//! hold weak references upward and upgrade at fire time, so dropping the
//! last user handle releases the whole object graph without firing user
//! code.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::{Once, OnceLock};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use tracing::{debug, info};

use crate::command::{
    Command, INVALID_INDEX, PROTOCOL_VERSION, PROTOCOL_VERSION_MIN, VERSION_MASK, VERSION_SHM_BIT,
};
use crate::config::ClientConfig;
use crate::error::{ErrorCode, Result};
use crate::forkdetect;
use crate::iochannel::IoChannel;
use crate::mainloop::{Mainloop, TimeEvent, TimeEventCb, USEC_INVALID};
use crate::memblock::Mempool;
use crate::memblockq::SeekMode;
use crate::operation::Operation;
use crate::pdispatch::{CommandHandler, DEFAULT_TIMEOUT, Pdispatch, ReplyCb};
use crate::presence::{BusKind, DaemonPresence};
use crate::proplist::{PROP_APPLICATION_NAME, Proplist, UpdateMode};
use crate::pstream::{MediaPayload, Pstream};
use crate::sample::SampleSpec;
use crate::serverlist::{
    ServerAddress, ServerList, default_server_list, parse_server_list, prepend_per_user,
    prepend_system, strip_braced_prefix,
};
use crate::socket_client::{SocketClient, errno_is_retryable};
use crate::spawn::{SpawnApi, autospawn};
use crate::stream::{Stream, StreamState};
use crate::subscribe::SubscriptionEvent;
use crate::tagstruct::TagStruct;

/// Version string of this library.
pub fn library_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Extension name for per-stream volume restore.
pub const EXT_STREAM_RESTORE: &str = "module-stream-restore";

/// Extension name for device priority management.
pub const EXT_DEVICE_MANAGER: &str = "module-device-manager";

/// Context lifecycle states.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ContextState {
    Unconnected,
    Connecting,
    Authorizing,
    SettingName,
    Ready,
    Failed,
    Terminated,
}

impl ContextState {
    /// Every state that is not terminal.
    pub fn is_good(self) -> bool {
        !matches!(self, ContextState::Failed | ContextState::Terminated)
    }
}

/// Flags for [`Context::connect`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct ConnectFlags(u32);

impl ConnectFlags {
    pub const NONE: ConnectFlags = ConnectFlags(0);
    /// Never fork a daemon, even if configuration would allow it.
    pub const NOAUTOSPAWN: ConnectFlags = ConnectFlags(1);
    /// Keep waiting for the daemon instead of failing when every
    /// candidate is exhausted.
    pub const NOFAIL: ConnectFlags = ConnectFlags(2);

    pub fn contains(self, other: ConnectFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ConnectFlags {
    type Output = ConnectFlags;
    fn bitor(self, rhs: ConnectFlags) -> ConnectFlags {
        ConnectFlags(self.0 | rhs.0)
    }
}

pub type StateCb = Box<dyn FnMut(&Context)>;
pub type SuccessCb = Box<dyn FnOnce(&Context, bool)>;
pub type NotifyCb = Box<dyn FnOnce(&Context)>;
pub type EventCb = Box<dyn FnMut(&Context, &str, &Proplist)>;
pub type SubscribeCb = Box<dyn FnMut(&Context, SubscriptionEvent, u32)>;
pub type ExtensionCb = Box<dyn FnMut(&Context, &mut TagStruct)>;

pub(crate) struct Inner {
    mainloop: Mainloop,
    state: ContextState,
    error: ErrorCode,
    /// Peer protocol version, capability bit cleared. Valid from the
    /// `AUTH` reply on.
    version: u32,
    do_shm: bool,
    is_local: bool,
    server_specified: bool,
    no_fail: bool,
    do_autospawn: bool,
    ctag: u32,
    client_index: u32,
    conf: ClientConfig,
    proplist: Proplist,
    mempool: Rc<Mempool>,
    server_list: ServerList,
    server: Option<String>,
    client: Option<SocketClient>,
    pstream: Option<Pstream>,
    pdispatch: Option<Pdispatch<WeakContext>>,
    playback_streams: HashMap<u32, Stream>,
    record_streams: HashMap<u32, Stream>,
    all_streams: Vec<Stream>,
    operations: Vec<Operation>,
    state_cb: Option<StateCb>,
    event_cb: Option<EventCb>,
    subscribe_cb: Option<SubscribeCb>,
    ext_stream_restore_cb: Option<ExtensionCb>,
    ext_device_manager_cb: Option<ExtensionCb>,
    spawn_api: SpawnApi,
    presence: Option<Rc<dyn DaemonPresence>>,
    presence_armed_session: bool,
    presence_armed_system: bool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Unreferenced to zero: release resources without firing user
        // callbacks.
        if let Some(pd) = &self.pdispatch {
            pd.unlink();
        }
        if let Some(ps) = &self.pstream {
            ps.unlink();
        }
        if let Some(client) = &self.client {
            client.cancel();
        }
        for op in &self.operations {
            op.cancel();
        }
    }
}

/// Handle to a connection context. Cloning shares the context.
#[derive(Clone)]
pub struct Context {
    inner: Rc<RefCell<Inner>>,
}

/// Non-owning handle, used by everything that points back up at the
/// context.
#[derive(Clone)]
pub struct WeakContext {
    inner: Weak<RefCell<Inner>>,
}

impl WeakContext {
    pub fn upgrade(&self) -> Option<Context> {
        self.inner.upgrade().map(|inner| Context { inner })
    }
}

fn init_signals() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        // Socket writes pass MSG_NOSIGNAL on Linux; elsewhere a peer
        // hangup must not kill the process with SIGPIPE.
        #[cfg(not(target_os = "linux"))]
        #[allow(unsafe_code)]
        unsafe {
            let _ = nix::sys::signal::signal(
                nix::sys::signal::Signal::SIGPIPE,
                nix::sys::signal::SigHandler::SigIgn,
            );
        }
    });
}

fn rtclock_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Monotonic microseconds on the clock [`Context::rttime_new`] uses.
pub fn rtclock_now() -> u64 {
    rtclock_epoch().elapsed().as_micros() as u64
}

fn real_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

impl Context {
    /// Create an unconnected context named `name`.
    pub fn new(mainloop: &Mainloop, name: &str) -> Result<Context> {
        Self::new_with_proplist(mainloop, Some(name), Proplist::new())
    }

    /// Create an unconnected context with a caller-provided property
    /// list. `name` overrides `application.name` in it.
    pub fn new_with_proplist(
        mainloop: &Mainloop,
        name: Option<&str>,
        proplist: Proplist,
    ) -> Result<Context> {
        Self::new_with_config(mainloop, name, proplist, ClientConfig::load())
    }

    /// Create an unconnected context with explicit configuration instead
    /// of the file- and environment-derived one.
    pub fn new_with_config(
        mainloop: &Mainloop,
        name: Option<&str>,
        proplist: Proplist,
        conf: ClientConfig,
    ) -> Result<Context> {
        if forkdetect::forked() {
            return Err(ErrorCode::Forked);
        }
        forkdetect::init();
        init_signals();

        let mempool = Rc::new(Mempool::new(!conf.disable_shm, conf.shm_size));

        let mut proplist = proplist;
        if let Some(name) = name {
            proplist.set_str(PROP_APPLICATION_NAME, name);
        }

        Ok(Context {
            inner: Rc::new(RefCell::new(Inner {
                mainloop: mainloop.clone(),
                state: ContextState::Unconnected,
                error: ErrorCode::Ok,
                version: 0,
                do_shm: false,
                is_local: false,
                server_specified: false,
                no_fail: false,
                do_autospawn: false,
                ctag: 0,
                client_index: INVALID_INDEX,
                conf,
                proplist,
                mempool,
                server_list: ServerList::new(),
                server: None,
                client: None,
                pstream: None,
                pdispatch: None,
                playback_streams: HashMap::new(),
                record_streams: HashMap::new(),
                all_streams: Vec::new(),
                operations: Vec::new(),
                state_cb: None,
                event_cb: None,
                subscribe_cb: None,
                ext_stream_restore_cb: None,
                ext_device_manager_cb: None,
                spawn_api: SpawnApi::default(),
                presence: None,
                presence_armed_session: false,
                presence_armed_system: false,
            })),
        })
    }

    pub(crate) fn downgrade(&self) -> WeakContext {
        WeakContext {
            inner: Rc::downgrade(&self.inner),
        }
    }

    // === State machine ===

    pub fn state(&self) -> ContextState {
        self.inner.borrow().state
    }

    /// The last error recorded on this context.
    pub fn errno(&self) -> ErrorCode {
        self.inner.borrow().error
    }

    pub(crate) fn set_last_error(&self, code: ErrorCode) {
        self.inner.borrow_mut().error = code;
    }

    fn check(&self, ok: bool, code: ErrorCode) -> Result<()> {
        if ok {
            Ok(())
        } else {
            self.set_last_error(code);
            Err(code)
        }
    }

    fn set_state(&self, st: ContextState) {
        if self.inner.borrow().state == st {
            return;
        }
        // Held across the user callback so it may drop its own reference.
        let _self_ref = self.clone();

        self.inner.borrow_mut().state = st;
        debug!(state = ?st, "context state");

        let cb = self.inner.borrow_mut().state_cb.take();
        if let Some(mut cb) = cb {
            cb(self);
            let mut inner = self.inner.borrow_mut();
            // The callback may have re-entered and torn the context down;
            // a cleared slot stays cleared then.
            if inner.state.is_good() && inner.state_cb.is_none() {
                inner.state_cb = Some(cb);
            }
        }

        if !st.is_good() {
            self.unlink();
        }
    }

    pub(crate) fn fail(&self, code: ErrorCode) {
        self.set_last_error(code);
        self.set_state(ContextState::Failed);
    }

    fn unlink(&self) {
        let _self_ref = self.clone();

        let (streams, ops, stream_state) = {
            let mut inner = self.inner.borrow_mut();
            let stream_state = if inner.state == ContextState::Failed {
                StreamState::Failed
            } else {
                StreamState::Terminated
            };
            inner.playback_streams.clear();
            inner.record_streams.clear();
            let streams: Vec<Stream> = inner.all_streams.drain(..).collect();
            let ops: Vec<Operation> = inner.operations.drain(..).collect();
            (streams, ops, stream_state)
        };

        for s in streams {
            s.transition(stream_state);
        }
        for op in ops {
            op.cancel();
        }

        // Transport, dispatcher, dialer, in that order.
        let (pstream, pdispatch, client) = {
            let mut inner = self.inner.borrow_mut();
            (
                inner.pstream.take(),
                inner.pdispatch.take(),
                inner.client.take(),
            )
        };
        if let Some(ps) = pstream {
            ps.unlink();
        }
        if let Some(pd) = pdispatch {
            pd.unlink();
        }
        if let Some(client) = client {
            client.cancel();
        }

        let mut inner = self.inner.borrow_mut();
        inner.state_cb = None;
        inner.event_cb = None;
        inner.subscribe_cb = None;
        inner.ext_stream_restore_cb = None;
        inner.ext_device_manager_cb = None;
    }

    // === Connect cascade ===

    /// Start connecting. `server` is an explicit candidate string; `None`
    /// consults configuration and the built-in candidate list.
    pub fn connect(
        &self,
        server: Option<&str>,
        flags: ConnectFlags,
        spawn_api: Option<SpawnApi>,
    ) -> Result<()> {
        self.check(!forkdetect::forked(), ErrorCode::Forked)?;
        self.check(
            self.state() == ContextState::Unconnected,
            ErrorCode::BadState,
        )?;
        self.check(server.is_none_or(|s| !s.is_empty()), ErrorCode::Invalid)?;

        let _self_ref = self.clone();

        let list_ok = {
            let mut inner = self.inner.borrow_mut();
            if server.is_some() {
                // An explicit server never autospawns.
                inner.conf.autospawn = false;
            }
            let server_owned = server
                .map(str::to_string)
                .or_else(|| inner.conf.default_server.clone());

            inner.no_fail = flags.contains(ConnectFlags::NOFAIL);
            inner.server_specified = server_owned.is_some();
            debug_assert!(inner.server_list.is_empty());

            match server_owned {
                Some(s) => {
                    inner.server_list = parse_server_list(&s);
                    !inner.server_list.is_empty()
                }
                None => {
                    inner.server_list = default_server_list(&inner.conf, &real_env);
                    true
                }
            }
        };
        if !list_ok {
            self.fail(ErrorCode::InvalidServer);
            return Err(ErrorCode::InvalidServer);
        }

        {
            let mut inner = self.inner.borrow_mut();
            if !flags.contains(ConnectFlags::NOAUTOSPAWN) && inner.conf.autospawn {
                if nix::unistd::getuid().is_root() {
                    debug!("not autospawning as root");
                } else {
                    inner.do_autospawn = true;
                    if let Some(api) = spawn_api {
                        inner.spawn_api = api;
                    }
                }
            }
        }

        self.set_state(ContextState::Connecting);
        self.try_next_connection()
    }

    fn try_next_connection(&self) -> Result<()> {
        debug_assert!(self.inner.borrow().client.is_none());
        loop {
            let candidate = self.inner.borrow_mut().server_list.pop_front();

            let Some(candidate) = candidate else {
                let (do_autospawn, no_fail, server_specified) = {
                    let inner = self.inner.borrow();
                    (inner.do_autospawn, inner.no_fail, inner.server_specified)
                };

                if do_autospawn {
                    // Autospawn only once, then retry the per-user sockets.
                    let (conf, mut api) = {
                        let mut inner = self.inner.borrow_mut();
                        inner.do_autospawn = false;
                        (inner.conf.clone(), std::mem::take(&mut inner.spawn_api))
                    };
                    let spawned = autospawn(&conf, &mut api);
                    {
                        let mut inner = self.inner.borrow_mut();
                        inner.spawn_api = api;
                    }
                    if let Err(code) = spawned {
                        self.fail(code);
                        return Err(code);
                    }
                    let mut inner = self.inner.borrow_mut();
                    prepend_per_user(&mut inner.server_list, &real_env);
                    continue;
                }

                if no_fail && !server_specified {
                    self.arm_presence();
                    return Ok(());
                }

                self.fail(ErrorCode::ConnectionRefused);
                return Err(ErrorCode::ConnectionRefused);
            };

            debug!("trying to connect to {candidate}");
            self.inner.borrow_mut().server = Some(candidate.clone());

            let Ok(addr) = ServerAddress::parse(&candidate) else {
                continue;
            };

            let weak = self.downgrade();
            let mainloop = self.inner.borrow().mainloop.clone();
            match SocketClient::start(
                &mainloop,
                &addr,
                Box::new(move |r| {
                    if let Some(c) = weak.upgrade() {
                        c.on_connection(r);
                    }
                }),
            ) {
                Ok(client) => {
                    self.inner.borrow_mut().client = Some(client);
                    return Ok(());
                }
                Err(e) => {
                    debug!("connect to {candidate} failed early: {e}");
                    continue;
                }
            }
        }
    }

    fn on_connection(&self, r: std::result::Result<IoChannel, Errno>) {
        let _self_ref = self.clone();
        self.inner.borrow_mut().client = None;

        if self.state() != ContextState::Connecting {
            return;
        }

        match r {
            Ok(io) => self.setup_context(io),
            Err(e) if errno_is_retryable(e) => {
                let _ = self.try_next_connection();
            }
            Err(e) => {
                debug!("connection failed: {e}");
                self.fail(ErrorCode::ConnectionRefused);
            }
        }
    }

    fn arm_presence(&self) {
        let presence = self.inner.borrow().presence.clone();
        let Some(presence) = presence else {
            debug!("no presence monitor; staying in CONNECTING");
            return;
        };

        for bus in [BusKind::Session, BusKind::System] {
            let armed = {
                let inner = self.inner.borrow();
                match bus {
                    BusKind::Session => inner.presence_armed_session,
                    BusKind::System => inner.presence_armed_system,
                }
            };
            if armed {
                continue;
            }
            let weak = self.downgrade();
            let ok = presence.watch(
                bus,
                Box::new(move || {
                    if let Some(c) = weak.upgrade() {
                        c.on_presence(bus);
                    }
                }),
            );
            if ok {
                let mut inner = self.inner.borrow_mut();
                match bus {
                    BusKind::Session => inner.presence_armed_session = true,
                    BusKind::System => inner.presence_armed_system = true,
                }
            }
        }
    }

    fn on_presence(&self, bus: BusKind) {
        let _self_ref = self.clone();
        {
            let inner = self.inner.borrow();
            if inner.state != ContextState::Connecting || !inner.no_fail {
                return;
            }
        }
        debug!(?bus, "daemon name gained an owner, retrying");

        {
            let mut inner = self.inner.borrow_mut();
            match bus {
                BusKind::Session => prepend_per_user(&mut inner.server_list, &real_env),
                BusKind::System => prepend_system(&mut inner.server_list),
            }
        }
        if self.inner.borrow().client.is_none() {
            let _ = self.try_next_connection();
        }
    }

    // === Handshake ===

    fn setup_context(&self, io: IoChannel) {
        let _self_ref = self.clone();
        let mainloop = self.inner.borrow().mainloop.clone();
        let is_local = io.is_local();

        let pstream = Pstream::new(&mainloop, io);

        let weak = self.downgrade();
        pstream.set_die_callback(Box::new(move || {
            if let Some(c) = weak.upgrade() {
                c.fail(ErrorCode::ConnectionTerminated);
            }
        }));

        let weak = self.downgrade();
        pstream.set_packet_callback(Box::new(move |payload, creds| {
            let Some(c) = weak.upgrade() else {
                return;
            };
            let _self_ref = c.clone();
            let pd = c.inner.borrow().pdispatch.clone();
            if let Some(pd) = pd
                && pd.run(payload, creds, &c.downgrade()).is_err()
            {
                c.fail(ErrorCode::Protocol);
            }
        }));

        let weak = self.downgrade();
        pstream.set_memblock_callback(Box::new(move |channel, offset, seek, media| {
            if let Some(c) = weak.upgrade() {
                c.on_memblock(channel, offset, seek, media);
            }
        }));

        let pdispatch = Pdispatch::new(&mainloop, COMMAND_TABLE);

        let do_shm = {
            let mut inner = self.inner.borrow_mut();
            debug_assert!(inner.pstream.is_none() && inner.pdispatch.is_none());
            inner.is_local = is_local;
            inner.pstream = Some(pstream.clone());
            inner.pdispatch = Some(pdispatch);
            if !inner.conf.cookie_valid {
                info!("no cookie loaded, attempting to connect without");
            }
            inner.do_shm = inner.mempool.is_shared() && is_local;
            inner.do_shm
        };
        debug!(possible = do_shm, "shm");

        let (mut ts, tag) = self.command_tagstruct(Command::Auth);
        let (version_word, cookie) = {
            let inner = self.inner.borrow();
            (
                PROTOCOL_VERSION | if inner.do_shm { VERSION_SHM_BIT } else { 0 },
                inner.conf.cookie,
            )
        };
        ts.put_u32(version_word);
        ts.put_arbitrary(&cookie);

        if pstream.creds_supported() {
            if let Err(e) = pstream.enable_creds() {
                debug!("enabling credential passing failed: {e}");
            }
            pstream.send_packet_with_creds(ts.into_bytes());
        } else {
            pstream.send_packet(ts.into_bytes());
        }

        self.register_reply(
            tag,
            Box::new(|u, command, ts| {
                if let Some(c) = u.upgrade() {
                    c.setup_complete(command, ts);
                }
            }),
        );

        self.set_state(ContextState::Authorizing);
    }

    fn setup_complete(&self, command: Command, ts: &mut TagStruct) {
        let _self_ref = self.clone();
        let state = self.state();
        debug_assert!(matches!(
            state,
            ContextState::Authorizing | ContextState::SettingName
        ));

        if command != Command::Reply {
            let _ = self.handle_error(command, ts, true);
            return;
        }

        match state {
            ContextState::Authorizing => {
                let Ok(raw_version) = ts.get_u32() else {
                    self.fail(ErrorCode::Protocol);
                    return;
                };
                if !ts.eof() {
                    self.fail(ErrorCode::Protocol);
                    return;
                }
                if raw_version < PROTOCOL_VERSION_MIN {
                    self.fail(ErrorCode::Version);
                    return;
                }

                // From version 13 on, bit 31 advertises the peer's
                // shared-memory willingness and is not part of the
                // version number.
                let (version, shm_on_remote) = if raw_version >= 13 {
                    (raw_version & VERSION_MASK, raw_version & VERSION_SHM_BIT != 0)
                } else {
                    (raw_version, false)
                };
                debug!(remote = version, local = PROTOCOL_VERSION, "protocol version");

                let do_shm = {
                    let mut inner = self.inner.borrow_mut();
                    inner.version = version;
                    // Shared memory needs an explicit advertisement from
                    // a v13+ peer.
                    if inner.do_shm && !(version >= 13 && shm_on_remote) {
                        inner.do_shm = false;
                    }
                    inner.do_shm
                };

                if do_shm {
                    // Both endpoints must be owned by the same user,
                    // where the transport lets us check.
                    let creds = self
                        .inner
                        .borrow()
                        .pdispatch
                        .as_ref()
                        .and_then(Pdispatch::creds);
                    if let Some(creds) = creds
                        && creds.uid != nix::unistd::getuid().as_raw()
                    {
                        self.inner.borrow_mut().do_shm = false;
                    }
                }

                let do_shm = self.inner.borrow().do_shm;
                debug!(negotiated = do_shm, "shm");
                if let Some(ps) = &self.inner.borrow().pstream {
                    ps.enable_shm(do_shm);
                }

                let (mut reply, tag) = self.command_tagstruct(Command::SetClientName);
                {
                    let mut inner = self.inner.borrow_mut();
                    if version >= 13 {
                        inner.proplist.init_defaults();
                        reply.put_proplist(&inner.proplist);
                    } else {
                        reply.put_string(inner.proplist.get_str(PROP_APPLICATION_NAME));
                    }
                }
                self.send_tagstruct(reply);
                self.register_reply(
                    tag,
                    Box::new(|u, command, ts| {
                        if let Some(c) = u.upgrade() {
                            c.setup_complete(command, ts);
                        }
                    }),
                );
                self.set_state(ContextState::SettingName);
            }

            ContextState::SettingName => {
                let version = self.inner.borrow().version;
                if version >= 13 {
                    let Ok(index) = ts.get_u32() else {
                        self.fail(ErrorCode::Protocol);
                        return;
                    };
                    if index == INVALID_INDEX {
                        self.fail(ErrorCode::Protocol);
                        return;
                    }
                    self.inner.borrow_mut().client_index = index;
                }
                if !ts.eof() {
                    self.fail(ErrorCode::Protocol);
                    return;
                }
                self.set_state(ContextState::Ready);
            }

            _ => self.fail(ErrorCode::Protocol),
        }
    }

    /// Digest a non-`REPLY` completion. With `fail_hard`, any server
    /// error is terminal; otherwise it is recorded as the last error and
    /// returned. `Err` means the context is already failed.
    pub(crate) fn handle_error(
        &self,
        command: Command,
        ts: &mut TagStruct,
        fail_hard: bool,
    ) -> Result<ErrorCode> {
        let code = match command {
            Command::Error => {
                let Ok(raw) = ts.get_u32() else {
                    self.fail(ErrorCode::Protocol);
                    return Err(ErrorCode::Protocol);
                };
                if !ts.eof() {
                    self.fail(ErrorCode::Protocol);
                    return Err(ErrorCode::Protocol);
                }
                ErrorCode::normalize_wire(raw)
            }
            Command::Timeout => ErrorCode::Timeout,
            _ => {
                self.fail(ErrorCode::Protocol);
                return Err(ErrorCode::Protocol);
            }
        };

        if fail_hard {
            self.fail(code);
            return Err(code);
        }
        self.set_last_error(code);
        Ok(code)
    }

    // === Request plumbing ===

    /// Open a tag-struct with `(command, next tag)`.
    pub(crate) fn command_tagstruct(&self, command: Command) -> (TagStruct, u32) {
        let tag = {
            let mut inner = self.inner.borrow_mut();
            let tag = inner.ctag;
            inner.ctag = inner.ctag.wrapping_add(1);
            tag
        };
        let mut ts = TagStruct::new();
        ts.put_u32(command.to_wire());
        ts.put_u32(tag);
        (ts, tag)
    }

    pub(crate) fn send_tagstruct(&self, ts: TagStruct) {
        if let Some(ps) = &self.inner.borrow().pstream {
            ps.send_packet(ts.into_bytes());
        }
    }

    pub(crate) fn send_memblock(
        &self,
        channel: u32,
        offset: i64,
        seek: SeekMode,
        block: &crate::memblock::Memblock,
    ) {
        if let Some(ps) = &self.inner.borrow().pstream {
            ps.send_memblock(channel, offset, seek, block);
        }
    }

    pub(crate) fn register_reply(&self, tag: u32, cb: ReplyCb<WeakContext>) {
        let pd = self.inner.borrow().pdispatch.clone();
        if let Some(pd) = pd {
            pd.register_reply(tag, DEFAULT_TIMEOUT, self.downgrade(), cb);
        }
    }

    pub(crate) fn new_operation(&self) -> Operation {
        let op = Operation::new();
        let mut inner = self.inner.borrow_mut();
        inner.operations.retain(Operation::is_running);
        inner.operations.push(op.clone());
        op
    }

    fn op_guard(&self) -> Result<()> {
        self.check(!forkdetect::forked(), ErrorCode::Forked)?;
        self.check(self.state() == ContextState::Ready, ErrorCode::BadState)
    }

    fn ack_continuation(op: Operation, cb: Option<SuccessCb>) -> ReplyCb<WeakContext> {
        Box::new(move |u, command, ts| {
            let Some(c) = u.upgrade() else {
                op.done();
                return;
            };
            let _self_ref = c.clone();

            let mut success = true;
            if command != Command::Reply {
                if c.handle_error(command, ts, false).is_err() {
                    op.done();
                    return;
                }
                success = false;
            } else if !ts.eof() {
                c.fail(ErrorCode::Protocol);
                op.done();
                return;
            }

            if op.is_running()
                && let Some(cb) = cb
            {
                cb(&c, success);
            }
            op.done();
        })
    }

    fn send_ack_request(&self, ts: TagStruct, tag: u32, cb: Option<SuccessCb>) -> Operation {
        let op = self.new_operation();
        self.send_tagstruct(ts);
        self.register_reply(tag, Self::ack_continuation(op.clone(), cb));
        op
    }

    fn send_simple_command(&self, command: Command, cb: Option<SuccessCb>) -> Result<Operation> {
        self.op_guard()?;
        let (ts, tag) = self.command_tagstruct(command);
        Ok(self.send_ack_request(ts, tag, cb))
    }

    // === Public operations ===

    /// Ask the daemon to exit.
    pub fn exit_daemon(&self, cb: Option<SuccessCb>) -> Result<Operation> {
        self.send_simple_command(Command::Exit, cb)
    }

    pub fn set_default_sink(&self, name: &str, cb: Option<SuccessCb>) -> Result<Operation> {
        self.op_guard()?;
        let (mut ts, tag) = self.command_tagstruct(Command::SetDefaultSink);
        ts.put_string(Some(name));
        Ok(self.send_ack_request(ts, tag, cb))
    }

    pub fn set_default_source(&self, name: &str, cb: Option<SuccessCb>) -> Result<Operation> {
        self.op_guard()?;
        let (mut ts, tag) = self.command_tagstruct(Command::SetDefaultSource);
        ts.put_string(Some(name));
        Ok(self.send_ack_request(ts, tag, cb))
    }

    /// Rename this client. Speaks the proplist update on modern peers and
    /// the legacy name command otherwise.
    pub fn set_name(&self, name: &str, cb: Option<SuccessCb>) -> Result<Operation> {
        self.op_guard()?;
        if self.inner.borrow().version >= 13 {
            let mut p = Proplist::new();
            p.set_str(PROP_APPLICATION_NAME, name);
            self.proplist_update(UpdateMode::Replace, &p, cb)
        } else {
            let (mut ts, tag) = self.command_tagstruct(Command::SetClientName);
            ts.put_string(Some(name));
            Ok(self.send_ack_request(ts, tag, cb))
        }
    }

    /// Update this client's server-side property list.
    pub fn proplist_update(
        &self,
        mode: UpdateMode,
        p: &Proplist,
        cb: Option<SuccessCb>,
    ) -> Result<Operation> {
        self.op_guard()?;
        let version = self.inner.borrow().version;
        self.check(version >= 13, ErrorCode::NotSupported)?;

        let (mut ts, tag) = self.command_tagstruct(Command::UpdateClientProplist);
        ts.put_u32(mode as u32);
        ts.put_proplist(p);
        // The local list is left alone; it is not exported state.
        Ok(self.send_ack_request(ts, tag, cb))
    }

    /// Remove keys from this client's server-side property list.
    pub fn proplist_remove(&self, keys: &[&str], cb: Option<SuccessCb>) -> Result<Operation> {
        self.op_guard()?;
        self.check(!keys.is_empty(), ErrorCode::Invalid)?;
        let version = self.inner.borrow().version;
        self.check(version >= 13, ErrorCode::NotSupported)?;

        let (mut ts, tag) = self.command_tagstruct(Command::RemoveClientProplist);
        for key in keys {
            ts.put_string(Some(key));
        }
        ts.put_string(None);
        Ok(self.send_ack_request(ts, tag, cb))
    }

    /// Subscribe to server event notifications matching `mask`.
    pub fn subscribe(&self, mask: u32, cb: Option<SuccessCb>) -> Result<Operation> {
        self.op_guard()?;
        let (mut ts, tag) = self.command_tagstruct(Command::Subscribe);
        ts.put_u32(mask);
        Ok(self.send_ack_request(ts, tag, cb))
    }

    // === Drain ===

    /// True while anything is still queued or awaited on the link.
    pub fn is_pending(&self) -> Result<bool> {
        self.check(!forkdetect::forked(), ErrorCode::Forked)?;
        self.check(self.state().is_good(), ErrorCode::BadState)?;
        let inner = self.inner.borrow();
        Ok(inner.pstream.as_ref().is_some_and(Pstream::is_pending)
            || inner
                .pdispatch
                .as_ref()
                .is_some_and(Pdispatch::is_pending)
            || inner.client.is_some())
    }

    /// Invoke `cb` once every queued packet is flushed and every
    /// outstanding tag is answered. Refused when nothing is pending.
    pub fn drain(&self, cb: NotifyCb) -> Result<Operation> {
        self.check(!forkdetect::forked(), ErrorCode::Forked)?;
        self.check(self.state() == ContextState::Ready, ErrorCode::BadState)?;
        self.check(self.is_pending()?, ErrorCode::BadState)?;

        let op = self.new_operation();
        let state = Rc::new(DrainState {
            ctx: self.downgrade(),
            op: op.clone(),
            cb: RefCell::new(Some(cb)),
        });
        Self::drain_check(state);
        Ok(op)
    }

    fn drain_check(state: Rc<DrainState>) {
        let Some(c) = state.ctx.upgrade() else {
            return;
        };
        let _self_ref = c.clone();

        let (pstream, pdispatch) = {
            let inner = c.inner.borrow();
            (inner.pstream.clone(), inner.pdispatch.clone())
        };
        if let Some(ps) = &pstream {
            ps.set_drain_callback(None);
        }
        if let Some(pd) = &pdispatch {
            pd.set_drain_callback(None);
        }

        if !state.op.is_running() {
            return;
        }

        let mut done = true;
        if let Some(pd) = &pdispatch
            && pd.is_pending()
        {
            let st = Rc::clone(&state);
            pd.set_drain_callback(Some(Box::new(move || Self::drain_check(st))));
            done = false;
        }
        if let Some(ps) = &pstream
            && ps.is_pending()
        {
            let st = Rc::clone(&state);
            ps.set_drain_callback(Some(Box::new(move || Self::drain_check(st))));
            done = false;
        }

        if done {
            if let Some(cb) = state.cb.borrow_mut().take() {
                cb(&c);
            }
            state.op.done();
        }
    }

    // === Teardown ===

    /// Leave the server orderly. Safe to call repeatedly.
    pub fn disconnect(&self) {
        if forkdetect::forked() {
            return;
        }
        if self.state().is_good() {
            self.set_state(ContextState::Terminated);
        }
    }

    // === Inbound routing ===

    fn on_memblock(&self, channel: u32, offset: i64, seek: SeekMode, media: MediaPayload) {
        let _self_ref = self.clone();
        let stream = self.inner.borrow().record_streams.get(&channel).cloned();
        if let Some(s) = stream {
            s.on_memblock(offset, seek, media);
        }
    }

    pub(crate) fn lookup_stream(&self, command: Command, channel: u32) -> Option<Stream> {
        let inner = self.inner.borrow();
        let map = match command {
            Command::RecordStreamKilled
            | Command::RecordStreamMoved
            | Command::RecordStreamSuspended
            | Command::RecordStreamEvent
            | Command::RecordBufferAttrChanged => &inner.record_streams,
            _ => &inner.playback_streams,
        };
        map.get(&channel).cloned()
    }

    pub(crate) fn forget_stream(&self, stream: &Stream) {
        let mut inner = self.inner.borrow_mut();
        if let Some(channel) = stream.channel() {
            inner.playback_streams.remove(&channel);
            inner.record_streams.remove(&channel);
        }
        inner.all_streams.retain(|s| !Stream::same(s, stream));
    }

    pub(crate) fn adopt_stream(&self, stream: Stream) {
        self.inner.borrow_mut().all_streams.push(stream);
    }

    pub(crate) fn bind_stream_channel(&self, channel: u32, stream: Stream, record: bool) {
        let mut inner = self.inner.borrow_mut();
        if record {
            inner.record_streams.insert(channel, stream);
        } else {
            inner.playback_streams.insert(channel, stream);
        }
    }

    // === Callback registration ===

    fn in_terminal_state(&self) -> bool {
        !self.state().is_good()
    }

    pub fn set_state_callback(&self, cb: Option<StateCb>) {
        if forkdetect::forked() || self.in_terminal_state() {
            return;
        }
        self.inner.borrow_mut().state_cb = cb;
    }

    /// Callback for server-initiated client events (`CLIENT_EVENT`).
    pub fn set_event_callback(&self, cb: Option<EventCb>) {
        if forkdetect::forked() || self.in_terminal_state() {
            return;
        }
        self.inner.borrow_mut().event_cb = cb;
    }

    pub fn set_subscribe_callback(&self, cb: Option<SubscribeCb>) {
        if forkdetect::forked() || self.in_terminal_state() {
            return;
        }
        self.inner.borrow_mut().subscribe_cb = cb;
    }

    /// Callback for `module-stream-restore` extension messages.
    pub fn set_stream_restore_callback(&self, cb: Option<ExtensionCb>) {
        if forkdetect::forked() || self.in_terminal_state() {
            return;
        }
        self.inner.borrow_mut().ext_stream_restore_cb = cb;
    }

    /// Callback for `module-device-manager` extension messages.
    pub fn set_device_manager_callback(&self, cb: Option<ExtensionCb>) {
        if forkdetect::forked() || self.in_terminal_state() {
            return;
        }
        self.inner.borrow_mut().ext_device_manager_cb = cb;
    }

    /// Install the daemon presence source consulted in no-fail mode.
    pub fn set_presence_monitor(&self, presence: Rc<dyn DaemonPresence>) {
        self.inner.borrow_mut().presence = Some(presence);
    }

    // === Introspection ===

    /// Whether the server lives on this host. Meaningless before a dial
    /// completed.
    pub fn is_local(&self) -> Result<bool> {
        self.check(!forkdetect::forked(), ErrorCode::Forked)?;
        self.check(self.state().is_good(), ErrorCode::BadState)?;
        Ok(self.inner.borrow().is_local)
    }

    /// The server string of the current (or last attempted) connection,
    /// with any `{tag}` prefix stripped.
    pub fn server(&self) -> Result<String> {
        self.check(!forkdetect::forked(), ErrorCode::Forked)?;
        let server = self.inner.borrow().server.clone();
        match server {
            Some(s) => Ok(strip_braced_prefix(&s).to_string()),
            None => {
                self.set_last_error(ErrorCode::NoEntity);
                Err(ErrorCode::NoEntity)
            }
        }
    }

    /// The protocol version this library speaks.
    pub fn protocol_version(&self) -> u32 {
        PROTOCOL_VERSION
    }

    /// The peer's negotiated protocol version.
    pub fn server_protocol_version(&self) -> Result<u32> {
        self.check(!forkdetect::forked(), ErrorCode::Forked)?;
        self.check(self.state().is_good(), ErrorCode::BadState)?;
        Ok(self.inner.borrow().version)
    }

    /// The client index the server assigned to us (version >= 13).
    pub fn index(&self) -> Result<u32> {
        self.check(!forkdetect::forked(), ErrorCode::Forked)?;
        self.check(self.state() == ContextState::Ready, ErrorCode::BadState)?;
        let version = self.inner.borrow().version;
        self.check(version >= 13, ErrorCode::NotSupported)?;
        Ok(self.inner.borrow().client_index)
    }

    /// Whether shared-memory transfer was negotiated on this link.
    pub fn shm_negotiated(&self) -> bool {
        self.inner.borrow().do_shm
    }

    // === Timers ===

    /// Create a time event at `usec` on the library's monotonic clock;
    /// [`USEC_INVALID`] creates it disarmed.
    pub fn rttime_new(&self, usec: u64, cb: TimeEventCb) -> TimeEvent {
        let mainloop = self.inner.borrow().mainloop.clone();
        mainloop.time_new(deadline_from_usec(usec), cb)
    }

    /// Re-arm a time event; [`USEC_INVALID`] disarms it.
    pub fn rttime_restart(&self, ev: &TimeEvent, usec: u64) {
        ev.restart(deadline_from_usec(usec));
    }

    /// The optimal transfer granule for streams of spec `ss`.
    pub fn tile_size(&self, ss: Option<&SampleSpec>) -> Result<usize> {
        self.check(!forkdetect::forked(), ErrorCode::Forked)?;
        self.check(ss.is_none_or(SampleSpec::is_valid), ErrorCode::Invalid)?;
        let fs = ss.map_or(1, SampleSpec::frame_size);
        let mbs = (self.inner.borrow().mempool.block_size_max() / fs) * fs;
        Ok(mbs.max(fs))
    }

    pub(crate) fn server_version(&self) -> u32 {
        self.inner.borrow().version
    }
}

fn deadline_from_usec(usec: u64) -> Option<Instant> {
    (usec != USEC_INVALID).then(|| rtclock_epoch() + Duration::from_micros(usec))
}

struct DrainState {
    ctx: WeakContext,
    op: Operation,
    cb: RefCell<Option<NotifyCb>>,
}

// === Inbound command handlers ===

static COMMAND_TABLE: &[(Command, CommandHandler<WeakContext>)] = &[
    (Command::Request, handlers::request),
    (Command::Overflow, handlers::overflow_or_underflow),
    (Command::Underflow, handlers::overflow_or_underflow),
    (Command::PlaybackStreamKilled, handlers::stream_killed),
    (Command::RecordStreamKilled, handlers::stream_killed),
    (Command::PlaybackStreamMoved, handlers::stream_moved),
    (Command::RecordStreamMoved, handlers::stream_moved),
    (Command::PlaybackStreamSuspended, handlers::stream_suspended),
    (Command::RecordStreamSuspended, handlers::stream_suspended),
    (Command::Started, handlers::stream_started),
    (Command::SubscribeEvent, handlers::subscribe_event),
    (Command::Extension, handlers::extension),
    (Command::PlaybackStreamEvent, handlers::stream_event),
    (Command::RecordStreamEvent, handlers::stream_event),
    (Command::ClientEvent, handlers::client_event),
    (Command::PlaybackBufferAttrChanged, handlers::stream_buffer_attr),
    (Command::RecordBufferAttrChanged, handlers::stream_buffer_attr),
];

mod handlers {
    use super::*;
    use tracing::warn;

    pub(super) fn request(u: &WeakContext, command: Command, _tag: u32, ts: &mut TagStruct) {
        let Some(c) = u.upgrade() else {
            return;
        };
        let _self_ref = c.clone();
        let (Ok(channel), Ok(nbytes)) = (ts.get_u32(), ts.get_u32()) else {
            c.fail(ErrorCode::Protocol);
            return;
        };
        if !ts.eof() {
            c.fail(ErrorCode::Protocol);
            return;
        }
        match c.lookup_stream(command, channel) {
            Some(s) => s.on_request(nbytes),
            None => c.fail(ErrorCode::Protocol),
        }
    }

    pub(super) fn overflow_or_underflow(
        u: &WeakContext,
        command: Command,
        _tag: u32,
        ts: &mut TagStruct,
    ) {
        let Some(c) = u.upgrade() else {
            return;
        };
        let _self_ref = c.clone();
        let Ok(channel) = ts.get_u32() else {
            c.fail(ErrorCode::Protocol);
            return;
        };
        if !ts.eof() {
            c.fail(ErrorCode::Protocol);
            return;
        }
        match c.lookup_stream(command, channel) {
            Some(s) if command == Command::Overflow => s.on_overflow(),
            Some(s) => s.on_underflow(),
            None => c.fail(ErrorCode::Protocol),
        }
    }

    pub(super) fn stream_killed(u: &WeakContext, command: Command, _tag: u32, ts: &mut TagStruct) {
        let Some(c) = u.upgrade() else {
            return;
        };
        let _self_ref = c.clone();
        let Ok(channel) = ts.get_u32() else {
            c.fail(ErrorCode::Protocol);
            return;
        };
        if !ts.eof() {
            c.fail(ErrorCode::Protocol);
            return;
        }
        let Some(s) = c.lookup_stream(command, channel) else {
            c.fail(ErrorCode::Protocol);
            return;
        };
        c.set_last_error(ErrorCode::Killed);
        c.forget_stream(&s);
        s.transition(StreamState::Failed);
    }

    pub(super) fn stream_moved(u: &WeakContext, command: Command, _tag: u32, ts: &mut TagStruct) {
        let Some(c) = u.upgrade() else {
            return;
        };
        let _self_ref = c.clone();
        let (Ok(channel), Ok(device_index), Ok(device_name), Ok(suspended)) = (
            ts.get_u32(),
            ts.get_u32(),
            ts.get_string(),
            ts.get_bool(),
        ) else {
            c.fail(ErrorCode::Protocol);
            return;
        };
        let Some(device_name) = device_name else {
            c.fail(ErrorCode::Protocol);
            return;
        };
        if !ts.eof() {
            c.fail(ErrorCode::Protocol);
            return;
        }
        match c.lookup_stream(command, channel) {
            Some(s) => s.on_moved(device_index, device_name, suspended),
            None => c.fail(ErrorCode::Protocol),
        }
    }

    pub(super) fn stream_suspended(
        u: &WeakContext,
        command: Command,
        _tag: u32,
        ts: &mut TagStruct,
    ) {
        let Some(c) = u.upgrade() else {
            return;
        };
        let _self_ref = c.clone();
        let (Ok(channel), Ok(suspended)) = (ts.get_u32(), ts.get_bool()) else {
            c.fail(ErrorCode::Protocol);
            return;
        };
        if !ts.eof() {
            c.fail(ErrorCode::Protocol);
            return;
        }
        match c.lookup_stream(command, channel) {
            Some(s) => s.on_suspended(suspended),
            None => c.fail(ErrorCode::Protocol),
        }
    }

    pub(super) fn stream_started(u: &WeakContext, command: Command, _tag: u32, ts: &mut TagStruct) {
        let Some(c) = u.upgrade() else {
            return;
        };
        let _self_ref = c.clone();
        let Ok(channel) = ts.get_u32() else {
            c.fail(ErrorCode::Protocol);
            return;
        };
        if !ts.eof() {
            c.fail(ErrorCode::Protocol);
            return;
        }
        match c.lookup_stream(command, channel) {
            Some(s) => s.on_started(),
            None => c.fail(ErrorCode::Protocol),
        }
    }

    pub(super) fn subscribe_event(
        u: &WeakContext,
        _command: Command,
        _tag: u32,
        ts: &mut TagStruct,
    ) {
        let Some(c) = u.upgrade() else {
            return;
        };
        let _self_ref = c.clone();
        let (Ok(event), Ok(index)) = (ts.get_u32(), ts.get_u32()) else {
            c.fail(ErrorCode::Protocol);
            return;
        };
        if !ts.eof() {
            c.fail(ErrorCode::Protocol);
            return;
        }

        let cb = c.inner.borrow_mut().subscribe_cb.take();
        if let Some(mut cb) = cb {
            cb(&c, SubscriptionEvent::from_wire(event), index);
            let mut inner = c.inner.borrow_mut();
            if inner.state.is_good() && inner.subscribe_cb.is_none() {
                inner.subscribe_cb = Some(cb);
            }
        }
    }

    pub(super) fn extension(u: &WeakContext, _command: Command, _tag: u32, ts: &mut TagStruct) {
        let Some(c) = u.upgrade() else {
            return;
        };
        let _self_ref = c.clone();
        if c.server_version() < 15 {
            c.fail(ErrorCode::Protocol);
            return;
        }
        let (Ok(_idx), Ok(name)) = (ts.get_u32(), ts.get_string()) else {
            c.fail(ErrorCode::Protocol);
            return;
        };
        let Some(name) = name else {
            c.fail(ErrorCode::Protocol);
            return;
        };

        let slot = match name.as_str() {
            EXT_STREAM_RESTORE => {
                let cb = c.inner.borrow_mut().ext_stream_restore_cb.take();
                Some((cb, true))
            }
            EXT_DEVICE_MANAGER => {
                let cb = c.inner.borrow_mut().ext_device_manager_cb.take();
                Some((cb, false))
            }
            _ => {
                warn!(name, "received message for unknown extension");
                None
            }
        };
        if let Some((Some(mut cb), restore)) = slot {
            cb(&c, ts);
            let mut inner = c.inner.borrow_mut();
            if !inner.state.is_good() {
                return;
            }
            let target = if restore {
                &mut inner.ext_stream_restore_cb
            } else {
                &mut inner.ext_device_manager_cb
            };
            if target.is_none() {
                *target = Some(cb);
            }
        }
    }

    pub(super) fn stream_event(u: &WeakContext, command: Command, _tag: u32, ts: &mut TagStruct) {
        let Some(c) = u.upgrade() else {
            return;
        };
        let _self_ref = c.clone();
        let (Ok(channel), Ok(name), Ok(proplist)) =
            (ts.get_u32(), ts.get_string(), ts.get_proplist())
        else {
            c.fail(ErrorCode::Protocol);
            return;
        };
        let Some(name) = name else {
            c.fail(ErrorCode::Protocol);
            return;
        };
        if !ts.eof() {
            c.fail(ErrorCode::Protocol);
            return;
        }
        match c.lookup_stream(command, channel) {
            Some(s) => s.on_event(&name, &proplist),
            None => c.fail(ErrorCode::Protocol),
        }
    }

    pub(super) fn client_event(u: &WeakContext, _command: Command, _tag: u32, ts: &mut TagStruct) {
        let Some(c) = u.upgrade() else {
            return;
        };
        let _self_ref = c.clone();
        if c.server_version() < 15 {
            c.fail(ErrorCode::Protocol);
            return;
        }
        let (Ok(event), Ok(proplist)) = (ts.get_string(), ts.get_proplist()) else {
            c.fail(ErrorCode::Protocol);
            return;
        };
        let Some(event) = event else {
            c.fail(ErrorCode::Protocol);
            return;
        };
        if !ts.eof() {
            c.fail(ErrorCode::Protocol);
            return;
        }

        let cb = c.inner.borrow_mut().event_cb.take();
        if let Some(mut cb) = cb {
            cb(&c, &event, &proplist);
            let mut inner = c.inner.borrow_mut();
            if inner.state.is_good() && inner.event_cb.is_none() {
                inner.event_cb = Some(cb);
            }
        }
    }

    pub(super) fn stream_buffer_attr(
        u: &WeakContext,
        command: Command,
        _tag: u32,
        ts: &mut TagStruct,
    ) {
        let Some(c) = u.upgrade() else {
            return;
        };
        let _self_ref = c.clone();
        let (Ok(channel), Ok(maxlength), Ok(length)) =
            (ts.get_u32(), ts.get_u32(), ts.get_u32())
        else {
            c.fail(ErrorCode::Protocol);
            return;
        };
        if !ts.eof() {
            c.fail(ErrorCode::Protocol);
            return;
        }
        match c.lookup_stream(command, channel) {
            Some(s) => s.on_buffer_attr(maxlength, length),
            None => c.fail(ErrorCode::Protocol),
        }
    }
}
