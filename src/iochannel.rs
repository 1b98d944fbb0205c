//! Duplex byte channel over a connected socket.
//!
//! Thin wrapper around the connected fd handed over by the dialer: non-
//! blocking reads/writes, locality, and out-of-band Unix credentials on
//! `AF_UNIX` links. Event-loop registration is the transport's concern.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, UnixCredentials, recv, recvmsg, send, sendmsg,
    setsockopt, sockopt,
};

/// Peer credentials observed on a channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Creds {
    pub uid: u32,
    pub gid: u32,
}

/// A connected duplex channel.
#[derive(Debug)]
pub struct IoChannel {
    fd: OwnedFd,
    is_unix: bool,
    is_local: bool,
    creds_enabled: bool,
}

impl IoChannel {
    /// Wrap a connected, non-blocking socket.
    pub fn new(fd: OwnedFd, is_unix: bool, is_local: bool) -> Self {
        Self {
            fd,
            is_unix,
            is_local,
            creds_enabled: false,
        }
    }

    pub fn raw_fd(&self) -> std::os::fd::RawFd {
        self.fd.as_raw_fd()
    }

    /// Whether the peer lives on this host.
    pub fn is_local(&self) -> bool {
        self.is_local
    }

    /// Whether credential passing can work on this channel.
    pub fn creds_supported(&self) -> bool {
        self.is_unix
    }

    /// Ask the kernel to attach peer credentials to inbound traffic.
    pub fn enable_creds(&mut self) -> Result<(), Errno> {
        if !self.is_unix {
            return Err(Errno::EOPNOTSUPP);
        }
        setsockopt(&self.fd, sockopt::PassCred, &true)?;
        self.creds_enabled = true;
        Ok(())
    }

    /// Non-blocking read. `Ok(0)` is end-of-stream.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        recv(self.fd.as_raw_fd(), buf, MsgFlags::empty())
    }

    /// Non-blocking read that also surfaces credentials when the kernel
    /// attached any to this segment.
    pub fn read_with_creds(&self, buf: &mut [u8]) -> Result<(usize, Option<Creds>), Errno> {
        if !self.creds_enabled {
            return Ok((self.read(buf)?, None));
        }

        let mut iov = [IoSliceMut::new(buf)];
        let mut cmsg_buf = nix::cmsg_space!(UnixCredentials);
        let msg = recvmsg::<()>(
            self.fd.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )?;
        let n = msg.bytes;

        let mut creds = None;
        if let Ok(cmsgs) = msg.cmsgs() {
            for cmsg in cmsgs {
                if let ControlMessageOwned::ScmCredentials(uc) = cmsg {
                    creds = Some(Creds {
                        uid: uc.uid(),
                        gid: uc.gid(),
                    });
                }
            }
        }
        Ok((n, creds))
    }

    /// Non-blocking write; short writes are expected.
    pub fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        send(self.fd.as_raw_fd(), buf, MsgFlags::MSG_NOSIGNAL)
    }

    /// Write with our own credentials attached as ancillary data.
    pub fn write_with_creds(&self, buf: &[u8]) -> Result<usize, Errno> {
        if !self.is_unix {
            return self.write(buf);
        }
        let creds = UnixCredentials::new();
        let iov = [IoSlice::new(buf)];
        let cmsgs = [ControlMessage::ScmCredentials(&creds)];
        sendmsg::<()>(
            self.fd.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::MSG_NOSIGNAL,
            None,
        )
    }
}
