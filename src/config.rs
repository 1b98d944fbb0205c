//! Client configuration loading.
//!
//! Values come from an optional TOML file, then environment overrides
//! (`PULSE_SERVER`, `PULSE_BINARY`, `PULSE_COOKIE`). The authentication
//! cookie is a fixed-size opaque blob next to the config; a missing cookie
//! is not fatal, and one is generated on first use when possible.

use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use rand::RngCore;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::memblock::DEFAULT_POOL_SIZE;

/// Size of the authentication cookie in bytes.
pub const COOKIE_LENGTH: usize = 256;

/// Resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server string to use when the caller passes none.
    pub default_server: Option<String>,
    /// Daemon binary for autospawn.
    pub daemon_binary: PathBuf,
    /// Extra space-separated arguments appended on autospawn.
    pub extra_arguments: Option<String>,
    /// Whether autospawn is permitted at all.
    pub autospawn: bool,
    /// Try TCP loopback when no unix socket answers.
    pub auto_connect_localhost: bool,
    /// Follow the `DISPLAY` host when set.
    pub auto_connect_display: bool,
    /// Never negotiate shared memory.
    pub disable_shm: bool,
    /// Sample pool size in bytes.
    pub shm_size: usize,
    /// Cookie file override.
    pub cookie_file: Option<PathBuf>,
    /// Cookie bytes sent with `AUTH`. All zeros when not valid.
    pub cookie: [u8; COOKIE_LENGTH],
    /// Whether `cookie` was actually loaded.
    pub cookie_valid: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_server: None,
            daemon_binary: PathBuf::from("/usr/bin/pulseaudio"),
            extra_arguments: Some("--log-target=syslog".to_string()),
            autospawn: true,
            auto_connect_localhost: false,
            auto_connect_display: false,
            disable_shm: false,
            shm_size: DEFAULT_POOL_SIZE,
            cookie_file: None,
            cookie: [0u8; COOKIE_LENGTH],
            cookie_valid: false,
        }
    }
}

/// On-disk representation. Everything is optional; unset keys keep their
/// built-in defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    default_server: Option<String>,
    daemon_binary: Option<PathBuf>,
    extra_arguments: Option<String>,
    autospawn: Option<bool>,
    auto_connect_localhost: Option<bool>,
    auto_connect_display: Option<bool>,
    disable_shm: Option<bool>,
    shm_size: Option<usize>,
    cookie_file: Option<PathBuf>,
}

/// Per-user configuration directory.
pub fn config_dir(env: &dyn Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(dir) = env("XDG_CONFIG_HOME")
        && !dir.trim().is_empty()
    {
        return Some(PathBuf::from(dir).join("pulse"));
    }
    if let Some(home) = env("HOME")
        && !home.trim().is_empty()
    {
        return Some(PathBuf::from(home).join(".config").join("pulse"));
    }
    None
}

impl ClientConfig {
    /// Load from the default locations and the real environment.
    pub fn load() -> ClientConfig {
        Self::load_with(&|key| std::env::var(key).ok())
    }

    /// Load with an injected environment, for tests.
    pub fn load_with(env: &dyn Fn(&str) -> Option<String>) -> ClientConfig {
        let mut conf = ClientConfig::default();

        let file_path = env("PULSE_CLIENTCONFIG")
            .map(PathBuf::from)
            .or_else(|| config_dir(env).map(|d| d.join("client.toml")));
        if let Some(path) = file_path
            && path.exists()
        {
            match Self::read_file(&path) {
                Ok(file) => conf.apply_file(file),
                Err(e) => warn!("config load failed, using defaults: {e}"),
            }
        }

        conf.apply_env(env);
        conf.load_cookie(env);
        conf
    }

    fn read_file(path: &Path) -> Result<ConfigFile, String> {
        let contents =
            fs::read_to_string(path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        toml::from_str(&contents).map_err(|e| format!("failed to parse {}: {e}", path.display()))
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.default_server {
            self.default_server = Some(v);
        }
        if let Some(v) = file.daemon_binary {
            self.daemon_binary = v;
        }
        if let Some(v) = file.extra_arguments {
            self.extra_arguments = Some(v);
        }
        if let Some(v) = file.autospawn {
            self.autospawn = v;
        }
        if let Some(v) = file.auto_connect_localhost {
            self.auto_connect_localhost = v;
        }
        if let Some(v) = file.auto_connect_display {
            self.auto_connect_display = v;
        }
        if let Some(v) = file.disable_shm {
            self.disable_shm = v;
        }
        if let Some(v) = file.shm_size {
            self.shm_size = v;
        }
        if let Some(v) = file.cookie_file {
            self.cookie_file = Some(v);
        }
    }

    fn apply_env(&mut self, env: &dyn Fn(&str) -> Option<String>) {
        if let Some(server) = env("PULSE_SERVER")
            && !server.trim().is_empty()
        {
            self.default_server = Some(server);
        }
        if let Some(binary) = env("PULSE_BINARY")
            && !binary.trim().is_empty()
        {
            self.daemon_binary = PathBuf::from(binary);
        }
        if let Some(cookie) = env("PULSE_COOKIE")
            && !cookie.trim().is_empty()
        {
            self.cookie_file = Some(PathBuf::from(cookie));
        }
    }

    fn cookie_path(&self, env: &dyn Fn(&str) -> Option<String>) -> Option<PathBuf> {
        self.cookie_file
            .clone()
            .or_else(|| config_dir(env).map(|d| d.join("cookie")))
    }

    fn load_cookie(&mut self, env: &dyn Fn(&str) -> Option<String>) {
        let Some(path) = self.cookie_path(env) else {
            return;
        };

        match fs::read(&path) {
            Ok(bytes) if bytes.len() == COOKIE_LENGTH => {
                self.cookie.copy_from_slice(&bytes);
                self.cookie_valid = true;
            }
            Ok(bytes) => {
                warn!(
                    path = %path.display(),
                    len = bytes.len(),
                    "cookie file has wrong size, ignoring"
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                match generate_cookie(&path) {
                    Ok(cookie) => {
                        info!(path = %path.display(), "generated new authentication cookie");
                        self.cookie = cookie;
                        self.cookie_valid = true;
                    }
                    Err(e) => debug!("could not generate cookie: {e}"),
                }
            }
            Err(e) => debug!(path = %path.display(), "could not read cookie: {e}"),
        }
    }
}

fn generate_cookie(path: &Path) -> std::io::Result<[u8; COOKIE_LENGTH]> {
    let mut cookie = [0u8; COOKIE_LENGTH];
    rand::rng().fill_bytes(&mut cookie);

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    f.write_all(&cookie)?;
    Ok(cookie)
}
