//! Client facade
//!
//! Every public operation maps its keys to servers through the registry,
//! batches the resulting commands per server, runs them through the I/O
//! engine and interprets the replies. Anything that goes wrong on the wire
//! turns into a miss or an unconfirmed write.

mod load;

pub use load::load_key;

use crate::codec::{Value, ValueCodec, flag_names};
use crate::config::Config;
use crate::engine::{BatchPlan, IoEngine};
use crate::key::{Key, KeyFormat};
use crate::metrics::{Metrics, Op, OpStats};
use crate::protocol::{ReceiveBuffer, ServerStats, StatsKind, StoreMode, parse_stats};
use crate::registry::{HashFn, Registry, Server};
use crate::{CacheError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};

/// Longest relative TTL; larger values are absolute Unix times
pub const MONTH_IN_SECONDS: u64 = 30 * 24 * 60 * 60;

/// Counter shared by every generated diagnostic and check key
static UNIQUE: AtomicU64 = AtomicU64::new(0);

/// `<pid>:<unix time with micros>:<counter>`, unique within a deployment
fn unique_suffix() -> String {
    let n = UNIQUE.fetch_add(1, Ordering::Relaxed) + 1;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!(
        "{}:{}.{:06}:{}",
        std::process::id(),
        now.as_secs(),
        now.subsec_micros(),
        n
    )
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// 0, at most 30 days, or an absolute time that has not passed yet.
///
/// memcached reads anything above 30 days as a Unix timestamp and expires a
/// past one on arrival, so such a TTL is almost always a relative value that
/// overflowed the month. It is refused rather than stored and lost at once.
pub fn validate_ttl(ttl: u64) -> Result<()> {
    if ttl <= MONTH_IN_SECONDS || ttl > unix_now() {
        Ok(())
    } else {
        Err(CacheError::InvalidTtl(ttl))
    }
}

/// Distributed memcached client
pub struct Client {
    registry: Registry,
    engine: IoEngine,
    codec: ValueCodec,
    keys: KeyFormat,
    metrics: Arc<Metrics>,
    readonly: bool,
    delete_only: bool,
    set_many_slice: usize,
    load_chunk: usize,
}

impl Client {
    /// Build a client from configuration. No connection is made until the
    /// first operation.
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_metrics(config, Arc::new(Metrics::new()))
    }

    /// Build a client that reports into an existing metrics registry
    pub fn with_metrics(config: &Config, metrics: Arc<Metrics>) -> Result<Self> {
        config.validate()?;
        let client = &config.client;
        Ok(Self {
            registry: Registry::new(client)?,
            engine: IoEngine::new(
                client.timeout(),
                client.read_buffer_size,
                Arc::clone(&metrics),
            ),
            codec: ValueCodec::new(&config.codec),
            keys: KeyFormat::new(client.namespace.clone(), client.urlencode),
            metrics,
            readonly: client.readonly,
            delete_only: client.delete_only,
            set_many_slice: client.set_many_slice,
            load_chunk: client.load_chunk,
        })
    }

    /// Replace the key hash used for server selection
    pub fn with_hasher(mut self, hash: HashFn) -> Self {
        self.registry = self.registry.with_hasher(hash);
        self
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn is_delete_only(&self) -> bool {
        self.delete_only
    }

    /// True if at least one server is configured
    pub fn is_active(&self) -> bool {
        !self.registry.is_empty()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Replace the server list
    pub fn set_servers<S: AsRef<str>>(&self, specs: &[S]) -> Result<()> {
        self.registry.configure(specs)
    }

    /// One status line per server
    pub fn servers(&self) -> Vec<String> {
        self.registry
            .servers()
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    /// Count and CPU time of every operation performed so far
    pub fn stats(&self) -> BTreeMap<Op, OpStats> {
        self.metrics.ops.snapshot()
    }

    /// Drop every pooled connection
    pub fn close(&self) {
        self.registry.close();
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Fetch one value
    pub async fn get(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let key = key.into();
        let name = key.name().into_owned();
        let mut found = self.get_multi([key]).await?;
        Ok(found.remove(&name))
    }

    /// Fetch many values at once; missing keys are absent from the result
    pub async fn get_multi<I, K>(&self, keys: I) -> Result<HashMap<String, Value>>
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        self.ensure_active()?;
        let _t = self.metrics.track(Op::Get);
        let keys: Vec<Key> = keys.into_iter().map(Into::into).collect();
        self.fetch(&keys).await
    }

    async fn fetch(&self, keys: &[Key]) -> Result<HashMap<String, Value>> {
        if self.delete_only || keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut names: HashMap<Vec<u8>, String> = HashMap::with_capacity(keys.len());
        let mut plan: BatchPlan<Vec<u8>> = BatchPlan::new();
        for key in keys {
            let ck = self.keys.cache_key(key)?;
            let server = self.registry.select(key)?;
            let (_, wanted) = plan.entry(&server);
            wanted.push(ck.clone());
            names.insert(ck, key.name().into_owned());
        }
        for (writer, wanted) in plan.iter_mut() {
            writer.get(wanted.iter().map(Vec::as_slice));
        }

        let (batches, _) = plan.into_parts();
        let servers: Vec<Arc<Server>> = batches.iter().map(|b| Arc::clone(&b.server)).collect();
        let replies = self.engine.execute(batches).await;

        let mut found = HashMap::with_capacity(names.len());
        let mut broken = Vec::new();
        for (server, reply) in servers.iter().zip(replies) {
            let Some(reply) = reply else { continue };
            if !reply.line_is(-1, b"END") {
                error!(server = %server.addr(), "Malformed reply from memcached");
                self.metrics.protocol_errors.inc();
                continue;
            }
            for value in reply.values() {
                let Some(name) = names.get(value.key.as_ref()) else {
                    warn!(
                        server = %server.addr(),
                        "Unrequested key in reply: {}",
                        String::from_utf8_lossy(&value.key)
                    );
                    continue;
                };
                match self.codec.decode(value.flags, &value.data) {
                    Ok(v) => {
                        found.insert(name.clone(), v);
                    }
                    Err(e) => broken.push((value.flags, value.data.clone(), e)),
                }
            }
        }

        self.metrics.get_hits.inc_by(found.len() as u64);
        self.metrics
            .get_misses
            .inc_by(names.len().saturating_sub(found.len()) as u64);

        for (flags, raw, e) in broken {
            self.salvage(flags, raw, &e).await;
        }
        Ok(found)
    }

    /// Park a payload that failed to decode under a diagnostic key
    async fn salvage(&self, flags: u32, raw: Vec<u8>, cause: &crate::CodecError) {
        self.metrics.restore_failures.inc();
        let key = format!("broken-{}", unique_suffix());
        let pairs = vec![(Key::from(key.as_str()), Value::Bytes(raw))];
        if let Err(e) = self.store(StoreMode::Set, pairs, MONTH_IN_SECONDS).await {
            debug!("Could not save broken payload: {}", e);
        }
        warn!(
            saved_as = %key,
            flags = %flag_names(flags).join(", "),
            "Exception on memcache key restore: {}",
            cause
        );
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Store unconditionally
    pub async fn set(&self, key: impl Into<Key>, value: impl Into<Value>, ttl: u64) -> Result<bool> {
        self.store_one(Op::Set, StoreMode::Set, key.into(), value.into(), ttl)
            .await
    }

    /// Store only if the key is absent
    pub async fn add(&self, key: impl Into<Key>, value: impl Into<Value>, ttl: u64) -> Result<bool> {
        self.store_one(Op::Add, StoreMode::Add, key.into(), value.into(), ttl)
            .await
    }

    /// Store only if the key is present
    pub async fn replace(
        &self,
        key: impl Into<Key>,
        value: impl Into<Value>,
        ttl: u64,
    ) -> Result<bool> {
        self.store_one(Op::Replace, StoreMode::Replace, key.into(), value.into(), ttl)
            .await
    }

    async fn store_one(
        &self,
        op: Op,
        mode: StoreMode,
        key: Key,
        value: Value,
        ttl: u64,
    ) -> Result<bool> {
        self.ensure_writable()?;
        validate_ttl(ttl)?;
        let _t = self.metrics.track(op);
        self.store(mode, vec![(key, value)], ttl).await
    }

    /// Store many pairs, sliced into batches. True only if every pair was
    /// confirmed.
    pub async fn set_many<I, K, V>(&self, pairs: I, ttl: u64) -> Result<bool>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Key>,
        V: Into<Value>,
    {
        self.ensure_writable()?;
        validate_ttl(ttl)?;
        let _t = self.metrics.track(Op::Set);

        let pairs: Vec<(Key, Value)> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let mut all_stored = true;
        for slice in pairs.chunks(self.set_many_slice) {
            all_stored &= self.store(StoreMode::Set, slice.to_vec(), ttl).await?;
        }
        Ok(all_stored)
    }

    async fn store(&self, mode: StoreMode, pairs: Vec<(Key, Value)>, ttl: u64) -> Result<bool> {
        if self.delete_only {
            return Ok(false);
        }
        if pairs.is_empty() {
            return Ok(true);
        }

        let mut plan: BatchPlan<()> = BatchPlan::new();
        let mut bytes = 0usize;
        for (key, value) in &pairs {
            let ck = self.keys.cache_key(key)?;
            let server = self.registry.select(key)?;
            let (flags, data) = self.codec.encode(value);
            bytes += data.len();
            let (writer, tags) = plan.entry(&server);
            writer.store(mode, &ck, flags, ttl, &data);
            tags.push(());
        }
        debug!(
            mode = mode.as_str(),
            keys = pairs.len(),
            bytes,
            servers = plan.len(),
            ttl,
            "Storing"
        );

        let (batches, tags) = plan.into_parts();
        let replies = self.engine.execute(batches).await;
        Ok(replies.iter().zip(&tags).all(|(reply, tags)| {
            reply
                .as_ref()
                .is_some_and(|r| r.count_lines(b"STORED") == tags.len())
        }))
    }

    /// Increment a numeric value; `None` if absent or unreachable
    pub async fn incr(&self, key: impl Into<Key>, delta: u64) -> Result<Option<u64>> {
        self.arith(Op::Incr, key.into(), delta).await
    }

    /// Decrement a numeric value, clamping at 0
    pub async fn decr(&self, key: impl Into<Key>, delta: u64) -> Result<Option<u64>> {
        self.arith(Op::Decr, key.into(), delta).await
    }

    async fn arith(&self, op: Op, key: Key, delta: u64) -> Result<Option<u64>> {
        self.ensure_writable()?;
        let _t = self.metrics.track(op);
        if self.delete_only {
            return Ok(None);
        }

        let ck = self.keys.cache_key(&key)?;
        let server = match self.registry.select(&key) {
            Ok(server) => server,
            Err(CacheError::NoServerAvailable) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut plan: BatchPlan<()> = BatchPlan::new();
        let (writer, _) = plan.entry(&server);
        if op == Op::Incr {
            writer.incr(&ck, delta);
        } else {
            writer.decr(&ck, delta);
        }
        let (batches, _) = plan.into_parts();
        let Some(reply) = self.engine.execute(batches).await.pop().flatten() else {
            return Ok(None);
        };
        let value = reply.terminal_lines().next().and_then(leading_number);
        Ok(value)
    }

    /// Delete one key, optionally blocking re-adds for `time` seconds
    pub async fn delete(&self, key: impl Into<Key>, time: Option<u64>) -> Result<bool> {
        self.ensure_writable()?;
        let _t = self.metrics.track(Op::Delete);
        let key = key.into();

        let ck = self.keys.cache_key(&key)?;
        let server = self.registry.select(&key)?;
        let mut plan: BatchPlan<()> = BatchPlan::new();
        plan.entry(&server).0.delete(&ck, time);

        let (batches, _) = plan.into_parts();
        let reply = self.engine.execute(batches).await.pop().flatten();
        Ok(reply.is_some_and(|r| r.line_is(0, b"DELETED")))
    }

    /// Delete many keys in one round trip; each key maps to whether it was
    /// deleted
    pub async fn delete_many<I, K>(&self, keys: I) -> Result<HashMap<String, bool>>
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        self.ensure_writable()?;
        let _t = self.metrics.track(Op::Delete);

        let mut plan: BatchPlan<String> = BatchPlan::new();
        for key in keys {
            let key = key.into();
            let ck = self.keys.cache_key(&key)?;
            let server = self.registry.select(&key)?;
            let (writer, names) = plan.entry(&server);
            writer.delete(&ck, None);
            names.push(key.name().into_owned());
        }

        let (batches, names) = plan.into_parts();
        let replies = self.engine.execute(batches).await;

        let mut result = HashMap::new();
        for (reply, names) in replies.into_iter().zip(names) {
            let lines: Vec<&[u8]> = reply
                .as_ref()
                .map(|r| r.terminal_lines().collect())
                .unwrap_or_default();
            for (i, name) in names.into_iter().enumerate() {
                let deleted = lines.get(i).is_some_and(|l| *l == b"DELETED");
                result.insert(name, deleted);
            }
        }
        Ok(result)
    }

    /// Expire every item on every live server. `None` when nothing could be
    /// asked.
    pub async fn flush_all(&self) -> Result<Option<bool>> {
        if self.delete_only {
            return Ok(None);
        }
        self.ensure_writable()?;
        let _t = self.metrics.track(Op::FlushAll);

        let servers = self.registry.live_servers();
        if servers.is_empty() {
            return Ok(None);
        }
        let mut plan: BatchPlan<()> = BatchPlan::new();
        for server in &servers {
            plan.entry(server).0.flush_all();
        }
        let (batches, _) = plan.into_parts();
        let replies = self.engine.execute(batches).await;
        Ok(Some(
            replies
                .iter()
                .all(|r| r.as_ref().is_some_and(|r| r.line_is(0, b"OK"))),
        ))
    }

    // ---------------------------------------------------------------------
    // Server statistics
    // ---------------------------------------------------------------------

    /// `stats` of every live server, keyed by `host:port`
    pub async fn server_stats(&self) -> Option<HashMap<String, ServerStats>> {
        self.stats_map(StatsKind::General).await
    }

    /// Reset the counters on every live server; true if all confirmed
    pub async fn server_reset_stats(&self) -> Option<bool> {
        let replies = self.broadcast(StatsKind::Reset).await?;
        Some(
            replies
                .iter()
                .all(|(_, r)| r.as_ref().is_some_and(|r| r.line_is(0, b"RESET"))),
        )
    }

    /// Raw `stats maps` output per server
    pub async fn server_map_stats(&self) -> Option<HashMap<String, String>> {
        let replies = self.broadcast(StatsKind::Maps).await?;
        Some(
            replies
                .into_iter()
                .filter_map(|(addr, r)| Some((addr, r?.to_text())))
                .collect(),
        )
    }

    pub async fn server_malloc_stats(&self) -> Option<HashMap<String, ServerStats>> {
        self.stats_map(StatsKind::Malloc).await
    }

    pub async fn server_slab_stats(&self) -> Option<HashMap<String, ServerStats>> {
        self.stats_map(StatsKind::Slabs).await
    }

    pub async fn server_item_stats(&self) -> Option<HashMap<String, ServerStats>> {
        self.stats_map(StatsKind::Items).await
    }

    /// `stats sizes` lines per server
    pub async fn server_size_stats(&self) -> Option<HashMap<String, Vec<String>>> {
        let replies = self.broadcast(StatsKind::Sizes).await?;
        Some(
            replies
                .into_iter()
                .filter_map(|(addr, r)| {
                    let text = r?.to_text();
                    let lines = text
                        .split("\r\n")
                        .filter(|l| !l.is_empty())
                        .map(String::from)
                        .collect();
                    Some((addr, lines))
                })
                .collect(),
        )
    }

    async fn stats_map(&self, kind: StatsKind) -> Option<HashMap<String, ServerStats>> {
        let replies = self.broadcast(kind).await?;
        Some(
            replies
                .into_iter()
                .filter_map(|(addr, r)| Some((addr, parse_stats(&r?))))
                .collect(),
        )
    }

    /// Send one stats command to every live server
    async fn broadcast(&self, kind: StatsKind) -> Option<Vec<(String, Option<ReceiveBuffer>)>> {
        if self.delete_only {
            return None;
        }
        let _t = self.metrics.track(Op::ServerStats);

        let servers = self.registry.live_servers();
        let mut plan: BatchPlan<()> = BatchPlan::new();
        for server in &servers {
            plan.entry(server).0.stats(kind);
        }
        let (batches, _) = plan.into_parts();
        let addrs: Vec<String> = batches.iter().map(|b| b.server.addr().to_string()).collect();
        let replies = self.engine.execute(batches).await;
        Some(addrs.into_iter().zip(replies).collect())
    }

    // ---------------------------------------------------------------------
    // Guards
    // ---------------------------------------------------------------------

    fn ensure_active(&self) -> Result<()> {
        if self.registry.is_empty() {
            return Err(CacheError::NoServers);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_active()?;
        if self.readonly {
            return Err(CacheError::ReadOnly);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("registry", &self.registry)
            .field("engine", &self.engine)
            .field("readonly", &self.readonly)
            .field("delete_only", &self.delete_only)
            .finish_non_exhaustive()
    }
}

/// Leading decimal digits of an `incr`/`decr` reply
fn leading_number(line: &[u8]) -> Option<u64> {
    let end = line
        .iter()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(line.len());
    std::str::from_utf8(&line[..end]).ok()?.parse().ok()
}
