//! Composite operations: read-through loading and add-then-verify locking

use super::{Client, unique_suffix, validate_ttl};
use crate::codec::Value;
use crate::key::Key;
use crate::metrics::Op;
use crate::{CacheError, Result};
use std::collections::HashMap;
use std::future::Future;
use tracing::debug;

/// Cache key of a multi-part key: `<prefix>-<p1>/<p2>/...`
pub fn load_key<S: AsRef<str>>(prefix: &str, parts: &[S]) -> String {
    let mut key = String::with_capacity(prefix.len() + 1 + parts.len() * 8);
    key.push_str(prefix);
    key.push('-');
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push('/');
        }
        key.push_str(part.as_ref());
    }
    key
}

impl Client {
    /// Read-through fetch of multi-part keys.
    ///
    /// Keys are fetched in chunks. For every chunk the keys that missed are
    /// handed to `fill`, whose results are written back with `set_many` and
    /// merged into the returned map. The map is keyed by [`load_key`].
    /// An unreachable server set is treated as all misses.
    pub async fn load<F, Fut>(
        &self,
        prefix: &str,
        keys: &[Vec<String>],
        ttl: u64,
        mut fill: F,
    ) -> Result<HashMap<String, Value>>
    where
        F: FnMut(Vec<Vec<String>>) -> Fut,
        Fut: Future<Output = HashMap<Vec<String>, Value>>,
    {
        self.ensure_active()?;
        validate_ttl(ttl)?;
        let _t = self.metrics.track(Op::Load);

        let mut loaded = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(self.load_chunk) {
            let full: Vec<String> = chunk.iter().map(|parts| load_key(prefix, parts)).collect();
            let lookup: Vec<Key> = full.iter().map(Key::from).collect();

            let mut found = match self.fetch(&lookup).await {
                Ok(found) => found,
                Err(CacheError::NoServerAvailable) => HashMap::new(),
                Err(e) => return Err(e),
            };

            let missing: Vec<Vec<String>> = chunk
                .iter()
                .zip(&full)
                .filter(|(_, key)| !found.contains_key(*key))
                .map(|(parts, _)| parts.clone())
                .collect();

            if !missing.is_empty() {
                let mut filled = fill(missing.clone()).await;
                let mut write_back = Vec::with_capacity(filled.len());
                for parts in missing {
                    if let Some(value) = filled.remove(&parts) {
                        let key = load_key(prefix, &parts);
                        found.insert(key.clone(), value.clone());
                        write_back.push((key, value));
                    }
                }

                if !write_back.is_empty() && !self.readonly {
                    match self.set_many(write_back, ttl).await {
                        Ok(true) => {}
                        Ok(false) => debug!(prefix, "Loaded values were not all stored"),
                        Err(e) => debug!(prefix, "Could not store loaded values: {}", e),
                    }
                }
            }

            loaded.extend(found);
        }
        Ok(loaded)
    }

    /// Fetch `key`, computing and storing it with `init` on a miss
    pub async fn get_or_set<F, Fut, V>(&self, key: impl Into<Key>, ttl: u64, init: F) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
        V: Into<Value>,
    {
        validate_ttl(ttl)?;
        let key = key.into();
        if let Some(value) = self.get(key.clone()).await? {
            return Ok(value);
        }

        let value: Value = init().await.into();
        self.set(key, value.clone(), ttl).await?;
        Ok(value)
    }

    /// Try to become the owner of `key`.
    ///
    /// Adds a fresh token under `key` and reads it back. `Some(true)` only if
    /// our token is what the cache holds now; `Some(false)` if someone else
    /// got there first; `None` if either step could not be carried out.
    pub async fn check_and_add(&self, key: impl Into<Key>, ttl: u64) -> Result<Option<bool>> {
        validate_ttl(ttl)?;
        let _t = self.metrics.track(Op::CheckAndAdd);
        let key = key.into();
        let token = format!("Check-{}", unique_suffix());

        match self.add(key.clone(), token.as_str(), ttl).await {
            Ok(_) => {}
            Err(CacheError::NoServerAvailable) => return Ok(None),
            Err(e) => return Err(e),
        }

        let current = match self.get(key).await {
            Ok(current) => current,
            Err(CacheError::NoServerAvailable) => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(current.map(|v| v == token.as_str()))
    }
}
