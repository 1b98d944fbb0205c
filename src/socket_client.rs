//! Asynchronous connect to a single server candidate.
//!
//! One dialer handles one candidate. An immediate connect failure is
//! reported synchronously from [`SocketClient::start`] so the caller can
//! move on to the next candidate; everything else completes through the
//! callback once the socket turns writable.

use std::cell::RefCell;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::{Rc, Weak};

use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, SockFlag, SockType, SockaddrStorage, UnixAddr, connect, getsockopt, socket,
    sockopt,
};
use tracing::debug;

use crate::iochannel::IoChannel;
use crate::mainloop::{IoEvent, IoEventFlags, Mainloop};
use crate::serverlist::{ServerAddress, TcpFamily};

/// Completion callback: a connected channel, or the underlying errno.
pub type ConnectCb = Box<dyn FnOnce(Result<IoChannel, Errno>)>;

/// Whether a dial failure should advance the cascade to the next
/// candidate rather than fail the connection attempt outright.
pub fn errno_is_retryable(e: Errno) -> bool {
    matches!(e, Errno::ECONNREFUSED | Errno::ETIMEDOUT | Errno::EHOSTUNREACH)
}

struct Inner {
    fd: Option<OwnedFd>,
    io_event: Option<IoEvent>,
    callback: Option<ConnectCb>,
    is_unix: bool,
    is_local: bool,
}

/// An in-flight connection attempt.
pub struct SocketClient {
    inner: Rc<RefCell<Inner>>,
}

impl SocketClient {
    /// Begin connecting to `addr`. Errors returned here mean the attempt
    /// never got off the ground; the callback will not fire.
    pub fn start(
        mainloop: &Mainloop,
        addr: &ServerAddress,
        cb: ConnectCb,
    ) -> Result<SocketClient, Errno> {
        let (fd, is_unix, is_local) = match addr {
            ServerAddress::Unix(path) => {
                let fd = socket(
                    AddressFamily::Unix,
                    SockType::Stream,
                    SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
                    None,
                )?;
                let unix_addr = UnixAddr::new(path.as_path())?;
                match connect(fd.as_raw_fd(), &unix_addr) {
                    Ok(()) | Err(Errno::EINPROGRESS) => {}
                    Err(e) => return Err(e),
                }
                (fd, true, true)
            }
            ServerAddress::Tcp { host, port, family } => {
                let sockaddr = resolve(host, *port, *family)?;
                let af = match sockaddr {
                    SocketAddr::V4(_) => AddressFamily::Inet,
                    SocketAddr::V6(_) => AddressFamily::Inet6,
                };
                let fd = socket(
                    af,
                    SockType::Stream,
                    SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
                    None,
                )?;
                let storage = SockaddrStorage::from(sockaddr);
                match connect(fd.as_raw_fd(), &storage) {
                    Ok(()) | Err(Errno::EINPROGRESS) => {}
                    Err(e) => return Err(e),
                }
                (fd, false, sockaddr.ip().is_loopback())
            }
        };

        let inner = Rc::new(RefCell::new(Inner {
            fd: Some(fd),
            io_event: None,
            callback: Some(cb),
            is_unix,
            is_local,
        }));

        // Completion is writability; the kernel parks the error in
        // SO_ERROR for us to collect.
        let weak: Weak<RefCell<Inner>> = Rc::downgrade(&inner);
        let raw_fd = inner.borrow().fd.as_ref().map(|f| f.as_raw_fd());
        let io_event = mainloop.io_new(
            raw_fd.expect("fd set at start"),
            IoEventFlags::OUTPUT,
            Box::new(move |ev, _fd, _flags| {
                ev.free();
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                Self::complete(&inner);
            }),
        );
        inner.borrow_mut().io_event = Some(io_event);

        Ok(SocketClient { inner })
    }

    fn complete(inner: &Rc<RefCell<Inner>>) {
        let (fd, cb, is_unix, is_local) = {
            let mut i = inner.borrow_mut();
            let Some(cb) = i.callback.take() else {
                return;
            };
            (i.fd.take(), cb, i.is_unix, i.is_local)
        };
        let Some(fd) = fd else {
            return;
        };

        match getsockopt(&fd, sockopt::SocketError) {
            Ok(0) => cb(Ok(IoChannel::new(fd, is_unix, is_local))),
            Ok(errno) => {
                let e = Errno::from_raw(errno);
                debug!("connect failed: {e}");
                cb(Err(e));
            }
            Err(e) => cb(Err(e)),
        }
    }

    /// Abandon the attempt: the callback will never fire and the socket
    /// is closed.
    pub fn cancel(&self) {
        let mut inner = self.inner.borrow_mut();
        if let Some(ev) = inner.io_event.take() {
            ev.free();
        }
        inner.callback = None;
        inner.fd = None;
    }
}

fn resolve(host: &str, port: u16, family: TcpFamily) -> Result<SocketAddr, Errno> {
    let addrs = (host, port).to_socket_addrs().map_err(|e| {
        debug!("failed to resolve {host}: {e}");
        Errno::EHOSTUNREACH
    })?;
    addrs
        .into_iter()
        .find(|a| match family {
            TcpFamily::Any => true,
            TcpFamily::V4 => a.is_ipv4(),
            TcpFamily::V6 => a.is_ipv6(),
        })
        .ok_or(Errno::EHOSTUNREACH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::path::PathBuf;

    fn dial(
        ml: &Mainloop,
        addr: &ServerAddress,
    ) -> Rc<RefCell<Option<Result<IoChannel, Errno>>>> {
        let out = Rc::new(RefCell::new(None));
        let out2 = Rc::clone(&out);
        let client = SocketClient::start(
            ml,
            addr,
            Box::new(move |r| {
                *out2.borrow_mut() = Some(r);
            }),
        )
        .expect("start");
        // Keep the dialer alive while iterating.
        for _ in 0..50 {
            if out.borrow().is_some() {
                break;
            }
            ml.iterate(true).expect("iterate");
        }
        drop(client);
        out
    }

    #[test]
    fn connects_to_listening_unix_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("native");
        let _listener = UnixListener::bind(&path).expect("bind");

        let ml = Mainloop::new();
        let out = dial(&ml, &ServerAddress::Unix(path));
        let result = out.borrow_mut().take().expect("completed");
        let channel = result.expect("connected");
        assert!(channel.is_local());
        assert!(channel.creds_supported());
    }

    #[test]
    fn missing_socket_fails_synchronously() {
        let ml = Mainloop::new();
        let err = SocketClient::start(
            &ml,
            &ServerAddress::Unix(PathBuf::from("/nonexistent/native")),
            Box::new(|_| panic!("callback must not fire")),
        )
        .err()
        .expect("immediate failure");
        assert_eq!(err, Errno::ENOENT);
    }

    #[test]
    fn refused_tcp_port_reports_econnrefused() {
        // Bind then drop a listener to find a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let ml = Mainloop::new();
        let out = dial(
            &ml,
            &ServerAddress::Tcp {
                host: "127.0.0.1".into(),
                port,
                family: TcpFamily::V4,
            },
        );
        let result = out.borrow_mut().take().expect("completed");
        assert_eq!(result.err().expect("refused"), Errno::ECONNREFUSED);
    }

    #[test]
    fn cancel_suppresses_callback() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let ml = Mainloop::new();
        let client = SocketClient::start(
            &ml,
            &ServerAddress::Tcp {
                host: "127.0.0.1".into(),
                port,
                family: TcpFamily::V4,
            },
            Box::new(|_| panic!("cancelled callback fired")),
        )
        .expect("start");
        client.cancel();
        for _ in 0..5 {
            ml.iterate(false).expect("iterate");
        }
    }
}
