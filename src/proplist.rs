//! Client property lists.
//!
//! A property list is an ordered map of dotted string keys to arbitrary
//! byte values. String-valued entries are stored with a trailing NUL on the
//! wire, as the native protocol requires.

use std::collections::BTreeMap;
use std::fmt;

/// Application name, shown by server-side introspection.
pub const PROP_APPLICATION_NAME: &str = "application.name";
/// Process id of the client.
pub const PROP_APPLICATION_PROCESS_ID: &str = "application.process.id";
/// Short binary name of the client process.
pub const PROP_APPLICATION_PROCESS_BINARY: &str = "application.process.binary";
/// User name running the client.
pub const PROP_APPLICATION_PROCESS_USER: &str = "application.process.user";
/// Host the client runs on.
pub const PROP_APPLICATION_PROCESS_HOST: &str = "application.process.host";

/// How a proplist update is applied on the receiving side.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum UpdateMode {
    /// Only add keys that do not exist yet.
    Set = 0,
    /// Add and overwrite.
    Merge = 1,
    /// Discard the old list entirely.
    Replace = 2,
}

impl UpdateMode {
    pub fn from_wire(v: u32) -> Option<UpdateMode> {
        match v {
            0 => Some(UpdateMode::Set),
            1 => Some(UpdateMode::Merge),
            2 => Some(UpdateMode::Replace),
            _ => None,
        }
    }
}

/// An ordered string-keyed property map.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Proplist {
    entries: BTreeMap<String, Vec<u8>>,
}

fn key_valid(key: &str) -> bool {
    !key.is_empty()
        && key.len() < 256
        && key
            .bytes()
            .all(|b| b.is_ascii_graphic() || b == b'.' || b == b'-' || b == b'_')
}

impl Proplist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a UTF-8 string value. Returns false if the key is not valid.
    pub fn set_str(&mut self, key: &str, value: &str) -> bool {
        if !key_valid(key) {
            return false;
        }
        let mut v = value.as_bytes().to_vec();
        v.push(0);
        self.entries.insert(key.to_string(), v);
        true
    }

    /// Set a raw byte value.
    pub fn set(&mut self, key: &str, value: &[u8]) -> bool {
        if !key_valid(key) {
            return false;
        }
        self.entries.insert(key.to_string(), value.to_vec());
        true
    }

    /// Get a value as a string, if it is stored NUL-terminated UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        let v = self.entries.get(key)?;
        let bytes = v.strip_suffix(&[0u8])?;
        std::str::from_utf8(bytes).ok()
    }

    /// Get a raw value.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Apply `other` onto `self` under the given mode.
    pub fn update(&mut self, mode: UpdateMode, other: &Proplist) {
        match mode {
            UpdateMode::Replace => {
                self.entries = other.entries.clone();
            }
            UpdateMode::Merge => {
                for (k, v) in &other.entries {
                    self.entries.insert(k.clone(), v.clone());
                }
            }
            UpdateMode::Set => {
                for (k, v) in &other.entries {
                    self.entries.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }
    }

    /// Fill in the process-derived keys a server expects from a well-behaved
    /// client, without overwriting anything the caller set.
    pub fn init_defaults(&mut self) {
        if !self.contains(PROP_APPLICATION_PROCESS_ID) {
            self.set_str(PROP_APPLICATION_PROCESS_ID, &std::process::id().to_string());
        }
        if !self.contains(PROP_APPLICATION_PROCESS_BINARY)
            && let Ok(exe) = std::env::current_exe()
            && let Some(name) = exe.file_name().and_then(|n| n.to_str())
        {
            self.set_str(PROP_APPLICATION_PROCESS_BINARY, name);
        }
        if !self.contains(PROP_APPLICATION_PROCESS_USER)
            && let Ok(user) = std::env::var("USER")
            && !user.is_empty()
        {
            self.set_str(PROP_APPLICATION_PROCESS_USER, &user);
        }
        if !self.contains(PROP_APPLICATION_PROCESS_HOST)
            && let Ok(host) = nix::unistd::gethostname()
            && let Some(host) = host.to_str()
        {
            self.set_str(PROP_APPLICATION_PROCESS_HOST, host);
        }
    }
}

impl fmt::Debug for Proplist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in &self.entries {
            match self.get_str(k) {
                Some(s) => map.entry(k, &s),
                None => map.entry(k, &format_args!("<{} bytes>", v.len())),
            };
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_values_roundtrip() {
        let mut p = Proplist::new();
        assert!(p.set_str(PROP_APPLICATION_NAME, "mixer"));
        assert_eq!(p.get_str(PROP_APPLICATION_NAME), Some("mixer"));
        // Raw form carries the trailing NUL.
        assert_eq!(p.get(PROP_APPLICATION_NAME), Some(&b"mixer\0"[..]));
    }

    #[test]
    fn invalid_keys_rejected() {
        let mut p = Proplist::new();
        assert!(!p.set_str("", "x"));
        assert!(!p.set_str("has space", "x"));
        assert!(p.set_str("a.b-c_d", "x"));
    }

    #[test]
    fn update_modes() {
        let mut base = Proplist::new();
        base.set_str("a", "1");
        base.set_str("b", "2");

        let mut patch = Proplist::new();
        patch.set_str("b", "20");
        patch.set_str("c", "30");

        let mut set = base.clone();
        set.update(UpdateMode::Set, &patch);
        assert_eq!(set.get_str("b"), Some("2"));
        assert_eq!(set.get_str("c"), Some("30"));

        let mut merge = base.clone();
        merge.update(UpdateMode::Merge, &patch);
        assert_eq!(merge.get_str("b"), Some("20"));
        assert_eq!(merge.get_str("a"), Some("1"));

        let mut replace = base.clone();
        replace.update(UpdateMode::Replace, &patch);
        assert!(!replace.contains("a"));
        assert_eq!(replace.len(), 2);
    }

    #[test]
    fn defaults_do_not_overwrite() {
        let mut p = Proplist::new();
        p.set_str(PROP_APPLICATION_PROCESS_ID, "42");
        p.init_defaults();
        assert_eq!(p.get_str(PROP_APPLICATION_PROCESS_ID), Some("42"));
        assert!(p.contains(PROP_APPLICATION_PROCESS_BINARY));
    }
}
