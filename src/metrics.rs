//! Prometheus metrics and per-operation CPU accounting for PetraClient

use parking_lot::Mutex;
use prometheus::core::Collector;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;
use tracing::{debug, warn};

/// Client operations tracked in metrics and [`StatsCounters`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Op {
    Get,
    Set,
    Add,
    Replace,
    Incr,
    Decr,
    Delete,
    FlushAll,
    ServerStats,
    CheckAndAdd,
    Load,
}

impl Op {
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Get => "get",
            Op::Set => "set",
            Op::Add => "add",
            Op::Replace => "replace",
            Op::Incr => "incr",
            Op::Decr => "decr",
            Op::Delete => "delete",
            Op::FlushAll => "flush_all",
            Op::ServerStats => "server_stats",
            Op::CheckAndAdd => "check_and_add",
            Op::Load => "load",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client metrics registry
pub struct Metrics {
    pub registry: Registry,

    // Command counters, labelled by operation
    pub commands: IntCounterVec,

    // Hit/miss counters
    pub get_hits: IntCounter,
    pub get_misses: IntCounter,

    // Bytes counters
    pub bytes_read: IntCounter,
    pub bytes_written: IntCounter,

    // Failure counters
    pub servers_marked_dead: IntCounter,
    pub timeouts: IntCounter,
    pub protocol_errors: IntCounter,
    pub restore_failures: IntCounter,

    // Latency histograms
    pub cmd_latency: Histogram,

    /// Process-lifetime count and CPU time per operation
    pub ops: StatsCounters,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        let registry = Registry::new();

        let commands = IntCounterVec::new(
            Opts::new("petraclient_commands_total", "Total client operations"),
            &["op"],
        )
        .unwrap();

        let get_hits = IntCounter::new("petraclient_get_hits_total", "Total GET hits").unwrap();
        let get_misses =
            IntCounter::new("petraclient_get_misses_total", "Total GET misses").unwrap();

        let bytes_read =
            IntCounter::new("petraclient_bytes_read_total", "Total bytes read").unwrap();
        let bytes_written =
            IntCounter::new("petraclient_bytes_written_total", "Total bytes written").unwrap();

        let servers_marked_dead = IntCounter::new(
            "petraclient_servers_marked_dead_total",
            "Times a server was taken out of rotation",
        )
        .unwrap();
        let timeouts = IntCounter::new(
            "petraclient_timeouts_total",
            "Servers that missed a call deadline",
        )
        .unwrap();
        let protocol_errors =
            IntCounter::new("petraclient_protocol_errors_total", "Total protocol errors").unwrap();
        let restore_failures = IntCounter::new(
            "petraclient_restore_failures_total",
            "Payloads that could not be decoded",
        )
        .unwrap();

        let cmd_latency = Histogram::with_opts(
            HistogramOpts::new(
                "petraclient_cmd_latency_seconds",
                "Operation latency in seconds",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.002, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
            ]),
        )
        .unwrap();

        // Register all metrics
        let collectors: [Box<dyn Collector>; 9] = [
            Box::new(commands.clone()),
            Box::new(get_hits.clone()),
            Box::new(get_misses.clone()),
            Box::new(bytes_read.clone()),
            Box::new(bytes_written.clone()),
            Box::new(servers_marked_dead.clone()),
            Box::new(timeouts.clone()),
            Box::new(protocol_errors.clone()),
            Box::new(restore_failures.clone()),
        ];
        for collector in collectors {
            registry.register(collector).unwrap();
        }
        registry.register(Box::new(cmd_latency.clone())).unwrap();

        Self {
            registry,
            commands,
            get_hits,
            get_misses,
            bytes_read,
            bytes_written,
            servers_marked_dead,
            timeouts,
            protocol_errors,
            restore_failures,
            cmd_latency,
            ops: StatsCounters::default(),
        }
    }

    /// Start timing `op`; the result is recorded when the guard drops
    pub fn track(&self, op: Op) -> OpTimer<'_> {
        self.commands.with_label_values(&[op.as_str()]).inc();
        OpTimer {
            metrics: self,
            op,
            started: Instant::now(),
            cpu: CpuTimes::now(),
        }
    }

    /// Get Prometheus formatted metrics
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Count and accumulated CPU seconds of one operation type
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OpStats {
    pub count: u64,
    pub user_time: f64,
    pub system_time: f64,
}

/// Per-operation counters, kept for the life of the process
#[derive(Debug, Default)]
pub struct StatsCounters {
    ops: Mutex<BTreeMap<Op, OpStats>>,
}

impl StatsCounters {
    pub fn record(&self, op: Op, user_time: f64, system_time: f64) {
        let mut ops = self.ops.lock();
        let entry = ops.entry(op).or_default();
        entry.count += 1;
        entry.user_time += user_time;
        entry.system_time += system_time;
    }

    pub fn get(&self, op: Op) -> OpStats {
        self.ops.lock().get(&op).copied().unwrap_or_default()
    }

    /// Copy of every counter recorded so far
    pub fn snapshot(&self) -> BTreeMap<Op, OpStats> {
        self.ops.lock().clone()
    }
}

/// Guard returned by [`Metrics::track`]
pub struct OpTimer<'a> {
    metrics: &'a Metrics,
    op: Op,
    started: Instant,
    cpu: CpuTimes,
}

impl Drop for OpTimer<'_> {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        let cpu = CpuTimes::now();
        self.metrics.cmd_latency.observe(elapsed.as_secs_f64());
        self.metrics.ops.record(
            self.op,
            (cpu.user - self.cpu.user).max(0.0),
            (cpu.system - self.cpu.system).max(0.0),
        );
        debug!(op = %self.op, elapsed_us = elapsed.as_micros() as u64, "Operation finished");
    }
}

/// User and system CPU seconds consumed by this process
#[derive(Debug, Clone, Copy, Default)]
struct CpuTimes {
    user: f64,
    system: f64,
}

impl CpuTimes {
    #[cfg(unix)]
    #[allow(unsafe_code)]
    fn now() -> Self {
        let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
        // SAFETY: getrusage only writes into the struct we hand it
        let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
        if rc != 0 {
            return Self::default();
        }
        // SAFETY: zero-initialised and filled in by a successful call
        let usage = unsafe { usage.assume_init() };
        Self {
            user: timeval_secs(usage.ru_utime),
            system: timeval_secs(usage.ru_stime),
        }
    }

    #[cfg(not(unix))]
    fn now() -> Self {
        Self::default()
    }
}

#[cfg(unix)]
fn timeval_secs(tv: libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0
}
