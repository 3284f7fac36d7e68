//! Server registry and key → server selection
//!
//! Keys are routed through a bucket table in which every server appears
//! `weight` times. A dead server's keys fall through to the next live server
//! in configuration order, so routing stays deterministic for a given
//! liveness snapshot.

mod server;

pub use server::{Server, ServerSpec, ServerStatus};

use crate::config::ClientConfig;
use crate::key::Key;
use crate::{CacheError, Result};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Key hash used to pick a bucket
pub type HashFn = Arc<dyn Fn(&[u8]) -> u64 + Send + Sync>;

/// CRC-32 of the key, the traditional memcached client hash
pub fn default_hash(key: &[u8]) -> u64 {
    u64::from(crc32fast::hash(key))
}

#[derive(Default)]
struct Inner {
    servers: Vec<Arc<Server>>,
    buckets: Option<Vec<usize>>,
}

/// The configured servers and their routing table
pub struct Registry {
    inner: RwLock<Inner>,
    config: ClientConfig,
    hash: HashFn,
    next_no_server_log: Mutex<Option<Instant>>,
}

impl Registry {
    /// Create a registry for the servers in `config`
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let registry = Self {
            inner: RwLock::new(Inner::default()),
            config: config.clone(),
            hash: Arc::new(default_hash),
            next_no_server_log: Mutex::new(None),
        };
        registry.configure(&config.servers)?;
        Ok(registry)
    }

    /// Replace the key hash function
    pub fn with_hasher(mut self, hash: HashFn) -> Self {
        self.hash = hash;
        self
    }

    /// Replace the server list. Sockets of the old servers are closed and the
    /// bucket table is rebuilt on the next selection.
    pub fn configure<S: AsRef<str>>(&self, specs: &[S]) -> Result<()> {
        let servers = specs
            .iter()
            .map(|s| {
                let spec: ServerSpec = s.as_ref().parse()?;
                debug!("Adding server {}:{} (weight {})", spec.host, spec.port, spec.weight);
                Ok(Arc::new(Server::new(spec, &self.config)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut inner = self.inner.write();
        for old in &inner.servers {
            old.close();
        }
        inner.servers = servers;
        inner.buckets = None;
        Ok(())
    }

    /// Snapshot of the configured servers
    pub fn servers(&self) -> Vec<Arc<Server>> {
        self.inner.read().servers.clone()
    }

    /// Servers outside their dead window
    pub fn live_servers(&self) -> Vec<Arc<Server>> {
        self.inner
            .read()
            .servers
            .iter()
            .filter(|s| s.is_alive())
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().servers.is_empty()
    }

    /// Pick the server responsible for `key`
    pub fn select(&self, key: &Key) -> Result<Arc<Server>> {
        let found = self.with_buckets(|servers, buckets| {
            if servers.len() == 1 {
                return Ok(servers.first().filter(|s| s.is_alive()).cloned());
            }
            if servers.is_empty() || buckets.is_empty() {
                return Err(CacheError::NoServers);
            }

            let hkey = match key.hash_hint() {
                Some(h) => h,
                None => (self.hash)(key.name().as_bytes()),
            };
            let idx = buckets[(hkey % buckets.len() as u64) as usize];

            for offset in 0..servers.len() {
                let server = &servers[(idx + offset) % servers.len()];
                if server.is_alive() {
                    return Ok(Some(Arc::clone(server)));
                }
                debug!("Skipping dead server {}", server.addr());
            }
            Ok(None)
        })?;

        match found {
            Some(server) => Ok(server),
            None => {
                self.log_no_servers();
                Err(CacheError::NoServerAvailable)
            }
        }
    }

    /// Take `server` out of rotation until its retry delay has passed
    pub fn mark_dead(&self, server: &Server, reason: &str) {
        server.mark_dead(reason);
    }

    /// Close every pooled socket
    pub fn close(&self) {
        for server in &self.inner.read().servers {
            server.close();
        }
    }

    pub fn retry_delay(&self) -> Duration {
        self.config.retry_delay()
    }

    fn with_buckets<R>(&self, f: impl FnOnce(&[Arc<Server>], &[usize]) -> R) -> R {
        {
            let inner = self.inner.read();
            if let Some(buckets) = &inner.buckets {
                return f(&inner.servers, buckets);
            }
        }

        let mut inner = self.inner.write();
        // another caller may have built it while we waited
        if inner.buckets.is_none() {
            let buckets = build_buckets(&inner.servers);
            debug!("Built bucket table with {} buckets", buckets.len());
            inner.buckets = Some(buckets);
        }
        let inner = RwLockWriteGuard::downgrade(inner);
        f(&inner.servers, inner.buckets.as_deref().unwrap_or(&[]))
    }

    fn log_no_servers(&self) -> bool {
        self.log_no_servers_at(Instant::now())
    }

    /// At most one line per retry-delay window; true if this call logged
    fn log_no_servers_at(&self, now: Instant) -> bool {
        let mut next = self.next_no_server_log.lock();
        if next.is_some_and(|t| now < t) {
            return false;
        }
        *next = Some(now + self.config.retry_delay());
        error!("No memcached servers available");
        true
    }
}

fn build_buckets(servers: &[Arc<Server>]) -> Vec<usize> {
    let total: usize = servers.iter().map(|s| s.weight() as usize).sum();
    let mut buckets = Vec::with_capacity(total);
    for (idx, server) in servers.iter().enumerate() {
        buckets.extend(std::iter::repeat_n(idx, server.weight() as usize));
    }
    buckets
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Registry")
            .field("servers", &inner.servers)
            .field("buckets", &inner.buckets.as_ref().map(Vec::len))
            .finish()
    }
}
