//! Multiplexed I/O engine
//!
//! One call sends a command buffer to each involved server and collects the
//! replies concurrently. Every server gets its own future, all of them are
//! polled from the caller's task, and one wall-clock deadline covers
//! connect, write and read for the whole batch.

use crate::metrics::Metrics;
use crate::protocol::{CommandWriter, ErrorReply, ReceiveBuffer};
use crate::registry::Server;
use futures::future::join_all;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Commands bound for one server
#[derive(Debug)]
pub struct Batch {
    pub server: Arc<Server>,
    pub commands: CommandWriter,
}

/// Groups commands per server and remembers what each command was for.
///
/// `tags` of a server line up with the terminal replies that server sends
/// back, so per-command results can be matched by position.
#[derive(Debug)]
pub struct BatchPlan<T> {
    batches: Vec<Batch>,
    tags: Vec<Vec<T>>,
    index: HashMap<String, usize>,
}

impl<T> Default for BatchPlan<T> {
    fn default() -> Self {
        Self {
            batches: Vec::new(),
            tags: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> BatchPlan<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer and tag list for `server`, created on first use
    pub fn entry(&mut self, server: &Arc<Server>) -> (&mut CommandWriter, &mut Vec<T>) {
        let idx = match self.index.get(server.addr()) {
            Some(&idx) => idx,
            None => {
                let idx = self.batches.len();
                self.batches.push(Batch {
                    server: Arc::clone(server),
                    commands: CommandWriter::new(256),
                });
                self.tags.push(Vec::new());
                self.index.insert(server.addr().to_string(), idx);
                idx
            }
        };
        (&mut self.batches[idx].commands, &mut self.tags[idx])
    }

    /// Every writer with its tags, for commands that need the full tag list
    /// first (a multi-key `get`)
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&mut CommandWriter, &mut Vec<T>)> {
        self.batches
            .iter_mut()
            .map(|b| &mut b.commands)
            .zip(self.tags.iter_mut())
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Split into the batches to execute and their tags, in the same order
    pub fn into_parts(self) -> (Vec<Batch>, Vec<Vec<T>>) {
        (self.batches, self.tags)
    }
}

/// Runs batches against servers under one deadline
pub struct IoEngine {
    timeout: Duration,
    read_buffer_size: usize,
    metrics: Arc<Metrics>,
}

impl IoEngine {
    pub fn new(timeout: Duration, read_buffer_size: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            timeout,
            read_buffer_size: read_buffer_size.max(1),
            metrics,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute every batch concurrently.
    ///
    /// The result has one slot per batch, in input order. A slot is `None`
    /// when the server was skipped, failed, timed out or answered with an
    /// error.
    pub async fn execute(&self, batches: Vec<Batch>) -> Vec<Option<ReceiveBuffer>> {
        if batches.is_empty() {
            return Vec::new();
        }
        let started = Instant::now();
        let deadline = started + self.timeout;
        let servers = batches.len();

        let results = join_all(batches.into_iter().map(|b| self.run(b, deadline))).await;

        debug!(
            servers,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Batch finished"
        );
        results
    }

    async fn run(&self, batch: Batch, deadline: Instant) -> Option<ReceiveBuffer> {
        let Batch {
            server,
            mut commands,
        } = batch;

        let expected = commands.count();
        if expected == 0 {
            return None;
        }
        if !server.is_alive() {
            debug!(server = %server.addr(), "Skipping dead server");
            return None;
        }

        let payload = commands.take();
        match tokio::time::timeout_at(deadline, self.exchange(&server, &payload, expected)).await
        {
            Ok(Ok((stream, buffer))) => self.settle(&server, stream, buffer),
            Ok(Err(e)) => {
                self.mark_dead(&server, &e.to_string());
                None
            }
            Err(_) => {
                self.metrics.timeouts.inc();
                self.mark_dead(&server, "execution timeout");
                None
            }
        }
    }

    /// Write the whole payload while reading replies until all have arrived
    async fn exchange(
        &self,
        server: &Server,
        payload: &[u8],
        expected: usize,
    ) -> io::Result<(TcpStream, ReceiveBuffer)> {
        let mut stream = server.checkout().await?;
        let mut buffer = ReceiveBuffer::new(expected);

        {
            let (mut reader, mut writer) = stream.split();
            let write = async {
                writer.write_all(payload).await?;
                writer.flush().await?;
                self.metrics.bytes_written.inc_by(payload.len() as u64);
                Ok::<_, io::Error>(())
            };
            let read = async {
                let mut chunk = vec![0u8; self.read_buffer_size];
                while !buffer.is_done() {
                    let n = reader.read(&mut chunk).await?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed by server",
                        ));
                    }
                    self.metrics.bytes_read.inc_by(n as u64);
                    buffer.feed(&chunk[..n]);
                }
                Ok::<_, io::Error>(())
            };
            tokio::try_join!(write, read)?;
        }

        Ok((stream, buffer))
    }

    /// Decide what a finished buffer is worth and whether the socket can be
    /// reused
    fn settle(
        &self,
        server: &Server,
        stream: TcpStream,
        buffer: ReceiveBuffer,
    ) -> Option<ReceiveBuffer> {
        let Some(kind) = buffer.error_reply() else {
            server.checkin(stream);
            return Some(buffer);
        };

        self.metrics.protocol_errors.inc();
        match kind {
            ErrorReply::General => {
                error!(server = %server.addr(), "Unknown command sent to memcached");
            }
            ErrorReply::Server(msg) => {
                warn!(server = %server.addr(), "Server error: {}", msg);
            }
            ErrorReply::Client(msg) => {
                // a trailing ERROR may still be in flight
                error!(server = %server.addr(), "Client error: {}", msg);
                return None;
            }
            ErrorReply::Unknown => {
                // the stream is out of step; the server itself is fine
                error!(server = %server.addr(), "Unknown protocol error");
                return None;
            }
        }
        server.checkin(stream);
        None
    }

    fn mark_dead(&self, server: &Server, reason: &str) {
        self.metrics.servers_marked_dead.inc();
        server.mark_dead(reason);
    }
}

impl std::fmt::Debug for IoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoEngine")
            .field("timeout", &self.timeout)
            .field("read_buffer_size", &self.read_buffer_size)
            .finish_non_exhaustive()
    }
}
