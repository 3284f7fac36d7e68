//! Cache keys and their wire form

use crate::codec::escape;
use crate::protocol::is_valid_key;
use crate::{CacheError, Result};
use std::borrow::Cow;
use std::fmt;

/// A key as the caller names it.
///
/// Integer keys double as their own precomputed hash, so callers can pin
/// related entries to one server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Str(String),
    Int(u64),
}

impl Key {
    /// The key as text, without namespace
    pub fn name(&self) -> Cow<'_, str> {
        match self {
            Key::Str(s) => Cow::Borrowed(s),
            Key::Int(n) => Cow::Owned(itoa::Buffer::new().format(*n).to_string()),
        }
    }

    /// Precomputed hash, if the key carries one
    pub fn hash_hint(&self) -> Option<u64> {
        match self {
            Key::Int(n) => Some(*n),
            Key::Str(_) => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

impl From<&String> for Key {
    fn from(s: &String) -> Self {
        Key::Str(s.clone())
    }
}

impl From<u64> for Key {
    fn from(n: u64) -> Self {
        Key::Int(n)
    }
}

impl From<u32> for Key {
    fn from(n: u32) -> Self {
        Key::Int(u64::from(n))
    }
}

/// Turns caller keys into the bytes sent on the wire
#[derive(Debug, Clone, Default)]
pub struct KeyFormat {
    namespace: Option<String>,
    urlencode: bool,
}

impl KeyFormat {
    pub fn new(namespace: Option<String>, urlencode: bool) -> Self {
        Self {
            namespace,
            urlencode,
        }
    }

    /// Build `<namespace>:<key>`, escaped or validated
    pub fn cache_key(&self, key: &Key) -> Result<Vec<u8>> {
        let name = key.name();
        let mut ck = Vec::with_capacity(name.len() + 16);
        if let Some(ns) = &self.namespace {
            ck.extend_from_slice(ns.as_bytes());
            ck.push(b':');
        }
        ck.extend_from_slice(name.as_bytes());

        if self.urlencode {
            ck = escape::escape(&ck);
        }

        if !is_valid_key(&ck) {
            return Err(CacheError::InvalidKey(
                String::from_utf8_lossy(&ck).into_owned(),
            ));
        }
        Ok(ck)
    }
}
