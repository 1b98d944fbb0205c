//! Server endpoint syntax and the connection candidate list.
//!
//! Endpoint forms: `unix:/path`, `tcp:host[:port]`, `tcp4:host[:port]`,
//! `tcp6:[host][:port]`, or a bare host. A server string may hold several
//! whitespace-separated candidates, consumed left to right.

use std::collections::VecDeque;
use std::path::PathBuf;

use crate::config::ClientConfig;
use crate::error::ErrorCode;

/// TCP port the daemon listens on unless told otherwise.
pub const NATIVE_DEFAULT_PORT: u16 = 4713;

/// Socket file name inside a runtime directory.
pub const NATIVE_SOCKET_NAME: &str = "native";

/// System-wide daemon runtime directory.
pub const SYSTEM_RUNTIME_PATH: &str = "/var/run/pulse";

/// Address family restriction on a TCP candidate.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TcpFamily {
    Any,
    V4,
    V6,
}

/// One parsed connection candidate.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ServerAddress {
    Unix(PathBuf),
    Tcp {
        host: String,
        port: u16,
        family: TcpFamily,
    },
}

impl ServerAddress {
    /// Parse a single candidate string.
    pub fn parse(s: &str) -> Result<ServerAddress, ErrorCode> {
        let s = strip_braced_prefix(s);
        if s.is_empty() {
            return Err(ErrorCode::InvalidServer);
        }

        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(ErrorCode::InvalidServer);
            }
            return Ok(ServerAddress::Unix(PathBuf::from(path)));
        }
        if let Some(rest) = s.strip_prefix("tcp6:") {
            return parse_tcp(rest, TcpFamily::V6);
        }
        if let Some(rest) = s.strip_prefix("tcp4:") {
            return parse_tcp(rest, TcpFamily::V4);
        }
        if let Some(rest) = s.strip_prefix("tcp:") {
            return parse_tcp(rest, TcpFamily::Any);
        }
        // A bare path is accepted as a unix socket, a bare name as a host.
        if s.starts_with('/') {
            return Ok(ServerAddress::Unix(PathBuf::from(s)));
        }
        parse_tcp(s, TcpFamily::Any)
    }
}

fn parse_tcp(s: &str, family: TcpFamily) -> Result<ServerAddress, ErrorCode> {
    if s.is_empty() {
        return Err(ErrorCode::InvalidServer);
    }

    // Bracketed IPv6 literal, optionally followed by :port.
    if let Some(rest) = s.strip_prefix('[') {
        let Some(close) = rest.find(']') else {
            return Err(ErrorCode::InvalidServer);
        };
        let host = &rest[..close];
        if host.is_empty() {
            return Err(ErrorCode::InvalidServer);
        }
        let port = match &rest[close + 1..] {
            "" => NATIVE_DEFAULT_PORT,
            p => p
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .ok_or(ErrorCode::InvalidServer)?,
        };
        return Ok(ServerAddress::Tcp {
            host: host.to_string(),
            port,
            family,
        });
    }

    // host[:port], but an unbracketed IPv6 literal is all host.
    let (host, port) = match s.rfind(':') {
        Some(i) if !s[..i].contains(':') => {
            let port = s[i + 1..].parse().map_err(|_| ErrorCode::InvalidServer)?;
            (&s[..i], port)
        }
        _ => (s, NATIVE_DEFAULT_PORT),
    };
    if host.is_empty() {
        return Err(ErrorCode::InvalidServer);
    }
    Ok(ServerAddress::Tcp {
        host: host.to_string(),
        port,
        family,
    })
}

/// Strip a leading `{tag}` prefix, as used for per-machine default server
/// strings. Shown to users without the tag.
pub fn strip_braced_prefix(s: &str) -> &str {
    if let Some(rest) = s.strip_prefix('{')
        && let Some(end) = rest.find('}')
    {
        return &rest[end + 1..];
    }
    s
}

/// Split a server string into ordered candidates.
pub fn parse_server_list(s: &str) -> VecDeque<String> {
    s.split_whitespace().map(str::to_string).collect()
}

/// The ordered candidate queue the connect cascade consumes.
pub type ServerList = VecDeque<String>;

/// Per-user runtime directory: `$PULSE_RUNTIME_PATH`, else
/// `$XDG_RUNTIME_DIR/pulse`.
pub fn runtime_dir(env: &dyn Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(dir) = env("PULSE_RUNTIME_PATH")
        && !dir.trim().is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    if let Some(dir) = env("XDG_RUNTIME_DIR")
        && !dir.trim().is_empty()
    {
        return Some(PathBuf::from(dir).join("pulse"));
    }
    None
}

#[cfg(feature = "legacy-runtime-dirs")]
fn legacy_dirs(env: &dyn Fn(&str) -> Option<String>) -> Vec<PathBuf> {
    use std::os::unix::fs::MetadataExt;

    let mut dirs = Vec::new();
    // Old per-user path, then the very old one. Either is only trusted if
    // the caller owns it.
    if let Some(user) = env("USER") {
        dirs.push(PathBuf::from(format!("/tmp/pulse-{user}")));
    }
    if let Some(home) = env("HOME") {
        dirs.push(PathBuf::from(home).join(".pulse"));
    }
    dirs.retain(|d| {
        std::fs::metadata(d).is_ok_and(|m| m.uid() == nix::unistd::getuid().as_raw())
    });
    dirs
}

/// Prepend the per-user unix socket candidates, highest priority first.
pub fn prepend_per_user(list: &mut ServerList, env: &dyn Fn(&str) -> Option<String>) {
    #[cfg(feature = "legacy-runtime-dirs")]
    for dir in legacy_dirs(env).into_iter().rev() {
        list.push_front(unix_candidate(dir.join(NATIVE_SOCKET_NAME)));
    }

    if let Some(dir) = runtime_dir(env) {
        list.push_front(unix_candidate(dir.join(NATIVE_SOCKET_NAME)));
    }
}

/// Prepend the system-wide unix socket candidate.
pub fn prepend_system(list: &mut ServerList) {
    list.push_front(unix_candidate(
        PathBuf::from(SYSTEM_RUNTIME_PATH).join(NATIVE_SOCKET_NAME),
    ));
}

fn unix_candidate(path: PathBuf) -> String {
    format!("unix:{}", path.display())
}

/// Build the default candidate list for a connect without an explicit
/// server, ordered highest priority first.
pub fn default_server_list(
    conf: &ClientConfig,
    env: &dyn Fn(&str) -> Option<String>,
) -> ServerList {
    let mut list = ServerList::new();

    // Built back to front: each block prepends in front of the previous.
    if conf.auto_connect_display
        && let Some(display) = env("DISPLAY")
    {
        let host = display.split(':').next().unwrap_or("");
        if !host.is_empty() {
            list.push_front(host.to_string());
        }
    }

    if conf.auto_connect_localhost {
        list.push_front("tcp6:[::1]".to_string());
        list.push_front("tcp4:127.0.0.1".to_string());
    }

    prepend_system(&mut list);
    prepend_per_user(&mut list, env);

    list
}
