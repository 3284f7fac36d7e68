//! A single memcached server: address, weight, liveness and pooled sockets

use crate::config::{ClientConfig, DEFAULT_PORT, DEFAULT_WEIGHT};
use crate::{CacheError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Idle sockets kept per server
const MAX_IDLE_CONNECTIONS: usize = 8;

/// Parsed `host[:port[:weight]]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

impl FromStr for ServerSpec {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().splitn(3, ':');
        let host = parts.next().unwrap_or("").to_string();
        if host.is_empty() {
            return Err(CacheError::Config(format!("Illegal host in {s:?}")));
        }

        let port = match parts.next() {
            Some(p) => p
                .parse::<u16>()
                .ok()
                .filter(|&p| p != 0)
                .ok_or_else(|| CacheError::Config(format!("Illegal port in {s:?}")))?,
            None => DEFAULT_PORT,
        };

        let weight = match parts.next() {
            Some(w) => w
                .parse::<u32>()
                .ok()
                .filter(|&w| w != 0)
                .ok_or_else(|| CacheError::Config(format!("Illegal weight in {s:?}")))?,
            None => DEFAULT_WEIGHT,
        };

        Ok(Self { host, port, weight })
    }
}

/// Connection status of a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    NotConnected,
    Connected,
    Dead { reason: String, retry_after: Instant },
}

struct PooledConnection {
    stream: TcpStream,
    last_used: Instant,
}

struct ServerState {
    status: ServerStatus,
    idle: Vec<PooledConnection>,
}

/// A memcached server the client distributes keys to
pub struct Server {
    host: String,
    port: u16,
    weight: u32,
    addr: String,
    connect_timeout: Duration,
    retry_delay: Duration,
    idle_timeout: Duration,
    state: Mutex<ServerState>,
}

impl Server {
    /// Create a server from its spec, taking timeouts from the client config
    pub fn new(spec: ServerSpec, config: &ClientConfig) -> Self {
        Self {
            addr: format!("{}:{}", spec.host, spec.port),
            host: spec.host,
            port: spec.port,
            weight: spec.weight,
            connect_timeout: config.connect_timeout(),
            retry_delay: config.retry_delay(),
            idle_timeout: config.idle_timeout(),
            state: Mutex::new(ServerState {
                status: ServerStatus::NotConnected,
                idle: Vec::new(),
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// `host:port`, the server's identity
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn status(&self) -> ServerStatus {
        self.state.lock().status.clone()
    }

    /// Deadline before which this server is skipped
    pub fn retry_after(&self) -> Option<Instant> {
        match self.state.lock().status {
            ServerStatus::Dead { retry_after, .. } => Some(retry_after),
            _ => None,
        }
    }

    /// False while the server sits in its dead window
    pub fn is_alive(&self) -> bool {
        match &self.state.lock().status {
            ServerStatus::Dead { retry_after, .. } => Instant::now() >= *retry_after,
            _ => true,
        }
    }

    /// Close all sockets and skip this server until `now + retry_delay`
    pub fn mark_dead(&self, reason: &str) {
        let retry_after = Instant::now() + self.retry_delay;
        {
            let mut state = self.state.lock();
            state.idle.clear();
            state.status = ServerStatus::Dead {
                reason: reason.to_string(),
                retry_after,
            };
        }
        info!(
            server = %self.addr,
            retry_in_secs = self.retry_delay.as_secs(),
            "Marking server dead, reason: {}",
            reason
        );
    }

    /// Drop all pooled sockets
    pub fn close(&self) {
        self.state.lock().idle.clear();
    }

    /// Take a pooled socket that is still open, or connect a new one
    pub async fn checkout(&self) -> io::Result<TcpStream> {
        while let Some(conn) = self.take_idle() {
            if is_reusable(&conn.stream) {
                return Ok(conn.stream);
            }
            debug!(server = %self.addr, "Discarding closed pooled connection");
        }

        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout"));
            }
        };

        // Disable Nagle's algorithm for lower latency
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let mut state = self.state.lock();
        if state.status != ServerStatus::Connected {
            debug!(server = %self.addr, "Connected");
            state.status = ServerStatus::Connected;
        }
        Ok(stream)
    }

    /// Return a socket after a clean exchange
    pub fn checkin(&self, stream: TcpStream) {
        let mut state = self.state.lock();
        if matches!(state.status, ServerStatus::Dead { .. }) {
            return;
        }
        if state.idle.len() < MAX_IDLE_CONNECTIONS {
            state.idle.push(PooledConnection {
                stream,
                last_used: Instant::now(),
            });
        }
    }

    /// Number of pooled sockets
    pub fn idle_connections(&self) -> usize {
        self.state.lock().idle.len()
    }

    fn take_idle(&self) -> Option<PooledConnection> {
        let mut state = self.state.lock();
        let idle_timeout = self.idle_timeout;
        state.idle.retain(|c| c.last_used.elapsed() < idle_timeout);
        state.idle.pop()
    }
}

/// An idle socket must have nothing to read: EOF or stray bytes both mean
/// it is out of sync with the server.
fn is_reusable(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    matches!(stream.try_read(&mut probe), Err(e) if e.kind() == io::ErrorKind::WouldBlock)
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.addr)
            .field("weight", &self.weight)
            .field("status", &self.status())
            .finish()
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status() {
            ServerStatus::Dead { reason, retry_after } => write!(
                f,
                "{} [{}] (DEAD: {}: retry in {}s)",
                self.addr,
                self.weight,
                reason,
                retry_after.saturating_duration_since(Instant::now()).as_secs()
            ),
            ServerStatus::Connected => write!(f, "{} [{}] (connected)", self.addr, self.weight),
            ServerStatus::NotConnected => {
                write!(f, "{} [{}] (not yet connected)", self.addr, self.weight)
            }
        }
    }
}
