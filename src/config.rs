//! Configuration for PetraClient

use crate::CacheError;
use serde::Deserialize;
use std::time::Duration;

/// Default memcached port
pub const DEFAULT_PORT: u16 = 11211;

/// Default weight assigned to a server
pub const DEFAULT_WEIGHT: u32 = 1;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub codec: CodecConfig,
}

/// Client, routing and I/O configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Servers as `host[:port[:weight]]`
    pub servers: Vec<String>,

    /// Prefix prepended to every key as `<namespace>:<key>`
    pub namespace: Option<String>,

    /// Wall-clock budget for one batch (connect + write + read), milliseconds
    pub timeout_ms: u64,

    /// Budget for establishing a single connection, milliseconds
    pub connect_timeout_ms: u64,

    /// How long a dead server is skipped before it is tried again, seconds
    pub retry_delay_secs: u64,

    /// Pooled connections idle longer than this are closed, seconds
    pub idle_timeout_secs: u64,

    /// Bytes read from a socket per read call
    pub read_buffer_size: usize,

    /// Reject every write with `CacheError::ReadOnly`
    pub readonly: bool,

    /// Only deletes reach the servers; reads miss and writes are unconfirmed
    pub delete_only: bool,

    /// Percent-escape control and space bytes in keys instead of rejecting them
    pub urlencode: bool,

    /// Pairs per batch in `set_many`
    pub set_many_slice: usize,

    /// Keys per chunk in `load`
    pub load_chunk: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: vec![format!("127.0.0.1:{DEFAULT_PORT}")],
            namespace: None,
            timeout_ms: 1500,
            connect_timeout_ms: 1500,
            retry_delay_secs: 600,
            idle_timeout_secs: 60,
            read_buffer_size: 4096,
            readonly: false,
            delete_only: false,
            urlencode: false,
            set_many_slice: 10_240,
            load_chunk: 256,
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Value codec configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Compress payloads larger than `compress_threshold`
    pub compression: bool,

    /// Payload size in bytes above which compression is attempted
    pub compress_threshold: usize,

    /// Compressed form is kept only when smaller than this share of the original
    pub min_compression_ratio: f64,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression: true,
            compress_threshold: 8_000,
            min_compression_ratio: 0.80,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)?;

        let config: Self = toml::from_str(&contents)
            .map_err(|e| CacheError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables or use defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(servers) = std::env::var("PETRACLIENT_SERVERS") {
            config.client.servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(ns) = std::env::var("PETRACLIENT_NAMESPACE") {
            config.client.namespace = Some(ns).filter(|ns| !ns.is_empty());
        }

        if let Ok(timeout) = std::env::var("PETRACLIENT_TIMEOUT_MS")
            && let Ok(ms) = timeout.parse()
        {
            config.client.timeout_ms = ms;
        }

        if let Ok(delay) = std::env::var("PETRACLIENT_RETRY_DELAY_SECS")
            && let Ok(secs) = delay.parse()
        {
            config.client.retry_delay_secs = secs;
        }

        if let Ok(enabled) = std::env::var("PETRACLIENT_COMPRESSION") {
            config.codec.compression = enabled.to_lowercase() == "true" || enabled == "1";
        }

        config
    }

    /// Reject settings that would make the client unusable
    pub fn validate(&self) -> crate::Result<()> {
        if self.client.read_buffer_size == 0 {
            return Err(CacheError::Config("read_buffer_size must be > 0".into()));
        }
        if self.client.set_many_slice == 0 || self.client.load_chunk == 0 {
            return Err(CacheError::Config(
                "set_many_slice and load_chunk must be > 0".into(),
            ));
        }
        if !(self.codec.min_compression_ratio > 0.0 && self.codec.min_compression_ratio <= 1.0) {
            return Err(CacheError::Config(
                "min_compression_ratio must be in (0, 1]".into(),
            ));
        }
        if let Some(ns) = &self.client.namespace
            && ns.bytes().any(|b| b <= b' ' || b == 127)
        {
            return Err(CacheError::Config(format!("invalid namespace {ns:?}")));
        }
        Ok(())
    }
}
