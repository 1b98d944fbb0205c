//! Daemon autospawn.
//!
//! Forks and execs the configured daemon binary with `--start`, waits for
//! the starter process to exit, and reports whether the daemon came up.
//! The caller's hook set runs around the fork so applications can guard
//! their own global state (locks, threads) across it.

#![allow(unsafe_code)]

use std::ffi::CString;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;

use nix::errno::Errno;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, execv, fork};
use tracing::{debug, error};

use crate::config::ClientConfig;
use crate::error::ErrorCode;

/// Most arguments ever passed to the daemon, binary and `--start`
/// included.
const MAX_ARGS: usize = 32;

/// Hooks run around the fork.
///
/// `atfork` runs in the child between `fork` and `exec` and must therefore
/// be async-signal-safe; it is a plain function pointer on purpose.
#[derive(Default)]
pub struct SpawnApi {
    pub prefork: Option<Box<dyn FnMut()>>,
    pub atfork: Option<fn()>,
    pub postfork: Option<Box<dyn FnMut()>>,
    /// The child closes every inherited fd at or above this floor.
    pub close_from: Option<RawFd>,
}

/// Whether the process has disabled child reaping for `SIGCHLD`, which
/// makes `waitpid` on the starter impossible.
fn sigchld_blocks_wait() -> Result<bool, Errno> {
    let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
    let r = unsafe { libc::sigaction(libc::SIGCHLD, std::ptr::null(), &mut old) };
    if r < 0 {
        return Err(Errno::last());
    }
    Ok(old.sa_flags & libc::SA_NOCLDWAIT != 0 || old.sa_sigaction == libc::SIG_IGN)
}

fn close_fds_from(floor: RawFd) {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::close_range(floor as u32, u32::MAX, 0);
    }
    #[cfg(not(target_os = "linux"))]
    for fd in floor..1024 {
        let _ = nix::unistd::close(fd);
    }
}

/// Fork and exec the daemon, blocking on the starter's exit status.
///
/// Runs before any socket exists, so the blocking `waitpid` cannot starve
/// the event loop. Returns the error code to fail the connection with.
pub fn autospawn(conf: &ClientConfig, api: &mut SpawnApi) -> Result<(), ErrorCode> {
    match sigchld_blocks_wait() {
        Ok(true) => {
            debug!("process disabled waitpid(), cannot autospawn");
            return Err(ErrorCode::ConnectionRefused);
        }
        Ok(false) => {}
        Err(e) => {
            debug!("sigaction() failed: {e}");
            return Err(ErrorCode::Internal);
        }
    }

    debug!(binary = %conf.daemon_binary.display(), "trying to autospawn");

    // Argv is assembled before the fork; the child must not allocate.
    let mut argv: Vec<CString> = Vec::with_capacity(MAX_ARGS);
    argv.push(
        CString::new(conf.daemon_binary.as_os_str().as_bytes())
            .map_err(|_| ErrorCode::Invalid)?,
    );
    argv.push(CString::new("--start").expect("static arg"));
    if let Some(extra) = &conf.extra_arguments {
        for arg in extra.split_whitespace().take(MAX_ARGS - 2) {
            argv.push(CString::new(arg).map_err(|_| ErrorCode::Invalid)?);
        }
    }
    let close_from = api.close_from.unwrap_or(3);

    if let Some(prefork) = &mut api.prefork {
        prefork();
    }

    let fork_result = unsafe { fork() };
    let child = match fork_result {
        Ok(ForkResult::Child) => {
            if let Some(atfork) = api.atfork {
                atfork();
            }
            // Only the fds are cleaned up here; everything else is the
            // daemon binary's own job.
            close_fds_from(close_from);
            let _ = execv(&argv[0], &argv);
            unsafe { libc::_exit(1) }
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => {
            error!("fork() failed: {e}");
            if let Some(postfork) = &mut api.postfork {
                postfork();
            }
            return Err(ErrorCode::Internal);
        }
    };

    if let Some(postfork) = &mut api.postfork {
        postfork();
    }

    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, 0)) => return Ok(()),
            Ok(WaitStatus::Exited(_, status)) => {
                debug!(status, "daemon starter exited with failure");
                return Err(ErrorCode::ConnectionRefused);
            }
            Ok(WaitStatus::Signaled(..)) => return Err(ErrorCode::ConnectionRefused),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            // Someone else reaped the starter; assume startup worked.
            Err(Errno::ESRCH) => return Ok(()),
            Err(e) => {
                error!("waitpid() failed: {e}");
                return Err(ErrorCode::Internal);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn conf_for(binary: &str) -> ClientConfig {
        ClientConfig {
            daemon_binary: PathBuf::from(binary),
            extra_arguments: None,
            ..ClientConfig::default()
        }
    }

    #[test]
    fn normal_disposition_allows_wait() {
        assert!(!sigchld_blocks_wait().expect("sigaction"));
    }

    #[test]
    fn successful_starter_reports_ok() {
        // `true` ignores the "--start" argument and exits 0.
        let conf = conf_for("/bin/true");
        let mut api = SpawnApi::default();
        autospawn(&conf, &mut api).expect("spawn ok");
    }

    #[test]
    fn failing_starter_reports_connection_refused() {
        let conf = conf_for("/bin/false");
        let mut api = SpawnApi::default();
        assert_eq!(
            autospawn(&conf, &mut api),
            Err(ErrorCode::ConnectionRefused)
        );
    }

    #[test]
    fn missing_binary_reports_connection_refused() {
        let conf = conf_for("/nonexistent/daemon-binary");
        let mut api = SpawnApi::default();
        // exec fails in the child, which then exits non-zero.
        assert_eq!(
            autospawn(&conf, &mut api),
            Err(ErrorCode::ConnectionRefused)
        );
    }

    #[test]
    fn hooks_run_in_parent() {
        let pre = std::rc::Rc::new(std::cell::Cell::new(false));
        let post = std::rc::Rc::new(std::cell::Cell::new(false));
        let (pre2, post2) = (std::rc::Rc::clone(&pre), std::rc::Rc::clone(&post));
        let mut api = SpawnApi {
            prefork: Some(Box::new(move || pre2.set(true))),
            atfork: None,
            postfork: Some(Box::new(move || post2.set(true))),
            close_from: None,
        };
        autospawn(&conf_for("/bin/true"), &mut api).expect("spawn ok");
        assert!(pre.get());
        assert!(post.get());
    }
}
