//! In-process memcached stand-in for integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::JoinHandle;

#[derive(Default)]
struct State {
    items: Mutex<HashMap<Vec<u8>, (u32, Vec<u8>)>>,
    /// Read requests but never answer
    stall: AtomicBool,
    /// Answer `get` with a broken VALUE header
    malformed: AtomicBool,
    connections: AtomicUsize,
    requests: AtomicUsize,
}

/// A tiny memcached speaking enough of the ASCII protocol for the client
pub struct MockServer {
    port: u16,
    state: Arc<State>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(State::default());

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = serve(sock, state).await;
                });
            }
        });

        Self { port, state, task }
    }

    /// `host:port` as the client config expects it
    pub fn spec(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn set_stall(&self, on: bool) {
        self.state.stall.store(on, Ordering::SeqCst);
    }

    pub fn set_malformed(&self, on: bool) {
        self.state.malformed.store(on, Ordering::SeqCst);
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Request lines received so far
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub fn flags_of(&self, key: &str) -> Option<u32> {
        self.state.items.lock().get(key.as_bytes()).map(|(f, _)| *f)
    }

    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.state
            .items
            .lock()
            .get(key.as_bytes())
            .map(|(_, d)| d.clone())
    }

    pub fn insert_raw(&self, key: &str, flags: u32, data: &[u8]) {
        self.state
            .items
            .lock()
            .insert(key.as_bytes().to_vec(), (flags, data.to_vec()));
    }

    pub fn keys(&self) -> Vec<String> {
        self.state
            .items
            .lock()
            .keys()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.items.lock().len()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(sock: tokio::net::TcpStream, state: Arc<State>) -> std::io::Result<()> {
    let (rd, mut wr) = sock.into_split();
    let mut rd = BufReader::new(rd);
    let mut line = Vec::new();

    loop {
        line.clear();
        if rd.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }
        state.requests.fetch_add(1, Ordering::SeqCst);

        let text = String::from_utf8_lossy(&line).trim_end().to_string();
        let parts: Vec<&str> = text.split(' ').collect();

        let reply: Vec<u8> = match parts.as_slice() {
            ["get", keys @ ..] => get(&state, keys),
            [mode @ ("set" | "add" | "replace"), key, flags, _exptime, len] => {
                let len: usize = len.parse().unwrap_or(0);
                let mut data = vec![0u8; len + 2];
                rd.read_exact(&mut data).await?;
                data.truncate(len);
                store(&state, mode, key, flags.parse().unwrap_or(0), data)
            }
            ["delete", key, ..] => {
                if state.items.lock().remove(key.as_bytes()).is_some() {
                    b"DELETED\r\n".to_vec()
                } else {
                    b"NOT_FOUND\r\n".to_vec()
                }
            }
            [op @ ("incr" | "decr"), key, delta] => arith(&state, op, key, delta),
            ["stats"] => {
                let items = state.items.lock().len();
                format!(
                    "STAT pid 4242\r\nSTAT version 1.6.21-mock\r\nSTAT curr_items {items}\r\n\
                     STAT rusage_user 0:250000\r\nSTAT rusage_system 0.125\r\nEND\r\n"
                )
                .into_bytes()
            }
            ["stats", "reset"] => b"RESET\r\n".to_vec(),
            ["stats", "items"] => b"STAT items:1:number 3\r\nSTAT items:1:age 17\r\nEND\r\n".to_vec(),
            ["stats", "slabs"] => b"STAT 1:chunk_size 96\r\nSTAT active_slabs 1\r\nEND\r\n".to_vec(),
            ["stats", "sizes"] => b"STAT 96 3\r\nEND\r\n".to_vec(),
            ["stats", _] => b"END\r\n".to_vec(),
            ["flush_all", ..] => {
                state.items.lock().clear();
                b"OK\r\n".to_vec()
            }
            _ => b"ERROR\r\n".to_vec(),
        };

        if !state.stall.load(Ordering::SeqCst) {
            write(&mut wr, &reply).await?;
        }
    }
}

async fn write(wr: &mut OwnedWriteHalf, reply: &[u8]) -> std::io::Result<()> {
    wr.write_all(reply).await?;
    wr.flush().await
}

fn get(state: &State, keys: &[&str]) -> Vec<u8> {
    let items = state.items.lock();
    let mut out = Vec::new();
    for key in keys {
        if let Some((flags, data)) = items.get(key.as_bytes()) {
            if state.malformed.load(Ordering::SeqCst) {
                out.extend_from_slice(format!("VALUE {key} garbage\r\n").as_bytes());
                continue;
            }
            out.extend_from_slice(format!("VALUE {key} {flags} {}\r\n", data.len()).as_bytes());
            out.extend_from_slice(data);
            out.extend_from_slice(b"\r\n");
        }
    }
    out.extend_from_slice(b"END\r\n");
    out
}

fn store(state: &State, mode: &str, key: &str, flags: u32, data: Vec<u8>) -> Vec<u8> {
    let mut items = state.items.lock();
    let exists = items.contains_key(key.as_bytes());
    let allowed = match mode {
        "add" => !exists,
        "replace" => exists,
        _ => true,
    };
    if allowed {
        items.insert(key.as_bytes().to_vec(), (flags, data));
        b"STORED\r\n".to_vec()
    } else {
        b"NOT_STORED\r\n".to_vec()
    }
}

fn arith(state: &State, op: &str, key: &str, delta: &str) -> Vec<u8> {
    let Ok(delta) = delta.parse::<u64>() else {
        return b"CLIENT_ERROR invalid numeric delta argument\r\n".to_vec();
    };
    let mut items = state.items.lock();
    let Some((_, data)) = items.get_mut(key.as_bytes()) else {
        return b"NOT_FOUND\r\n".to_vec();
    };
    let Some(current) = std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
    else {
        return b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n".to_vec();
    };
    let next = if op == "incr" {
        current.wrapping_add(delta)
    } else {
        current.saturating_sub(delta)
    };
    *data = next.to_string().into_bytes();
    format!("{next}\r\n").into_bytes()
}
