//! Memcached ASCII protocol request builder

use bytes::BytesMut;
use itoa::Buffer;

/// Maximum key length (memcached spec)
pub const MAX_KEY_LENGTH: usize = 250;

/// Storage command variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreMode {
    /// Store unconditionally
    Set,
    /// Store only if the key is absent
    Add,
    /// Store only if the key is present
    Replace,
}

impl StoreMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreMode::Set => "set",
            StoreMode::Add => "add",
            StoreMode::Replace => "replace",
        }
    }
}

/// `stats` subcommands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatsKind {
    General,
    Reset,
    Maps,
    Malloc,
    Slabs,
    Items,
    Sizes,
}

impl StatsKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StatsKind::General => "stats",
            StatsKind::Reset => "stats reset",
            StatsKind::Maps => "stats maps",
            StatsKind::Malloc => "stats malloc",
            StatsKind::Slabs => "stats slabs",
            StatsKind::Items => "stats items",
            StatsKind::Sizes => "stats sizes",
        }
    }
}

/// Accumulates one or more commands bound for a single server.
///
/// Every command written produces exactly one terminal reply line
/// (`END`, `STORED`, `DELETED`, a number, ...), so `count()` is the number of
/// replies the server owes for the whole buffer.
#[derive(Debug, Default)]
pub struct CommandWriter {
    buf: BytesMut,
    count: usize,
}

impl CommandWriter {
    /// Create a new command writer with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            count: 0,
        }
    }

    /// Get the internal buffer
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Take the buffer, leaving an empty buffer in its place
    pub fn take(&mut self) -> BytesMut {
        self.count = 0;
        std::mem::take(&mut self.buf)
    }

    /// Number of commands written
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns true if no command has been written
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Write a get command
    /// Format: get <key>[ <key>...]\r\n
    pub fn get<'k>(&mut self, keys: impl IntoIterator<Item = &'k [u8]>) {
        self.buf.extend_from_slice(b"get");
        for key in keys {
            self.buf.extend_from_slice(b" ");
            self.buf.extend_from_slice(key);
        }
        self.finish_line();
    }

    /// Write a storage command
    /// Format: <mode> <key> <flags> <exptime> <bytes>\r\n<data>\r\n
    pub fn store(&mut self, mode: StoreMode, key: &[u8], flags: u32, exptime: u64, data: &[u8]) {
        let mut itoa_buf = Buffer::new();
        self.buf.reserve(key.len() + data.len() + 48);
        self.buf.extend_from_slice(mode.as_str().as_bytes());
        self.buf.extend_from_slice(b" ");
        self.buf.extend_from_slice(key);
        self.buf.extend_from_slice(b" ");
        self.buf.extend_from_slice(itoa_buf.format(flags).as_bytes());
        self.buf.extend_from_slice(b" ");
        self.buf.extend_from_slice(itoa_buf.format(exptime).as_bytes());
        self.buf.extend_from_slice(b" ");
        self.buf.extend_from_slice(itoa_buf.format(data.len()).as_bytes());
        self.buf.extend_from_slice(b"\r\n");
        self.buf.extend_from_slice(data);
        self.finish_line();
    }

    /// Write a delete command
    /// Format: delete <key>[ <time>]\r\n
    pub fn delete(&mut self, key: &[u8], time: Option<u64>) {
        self.buf.extend_from_slice(b"delete ");
        self.buf.extend_from_slice(key);
        if let Some(time) = time {
            let mut itoa_buf = Buffer::new();
            self.buf.extend_from_slice(b" ");
            self.buf.extend_from_slice(itoa_buf.format(time).as_bytes());
        }
        self.finish_line();
    }

    /// Write an incr command
    /// Format: incr <key> <value>\r\n
    pub fn incr(&mut self, key: &[u8], delta: u64) {
        self.arith(b"incr ", key, delta);
    }

    /// Write a decr command
    /// Format: decr <key> <value>\r\n
    pub fn decr(&mut self, key: &[u8], delta: u64) {
        self.arith(b"decr ", key, delta);
    }

    /// Write a stats command
    pub fn stats(&mut self, kind: StatsKind) {
        self.buf.extend_from_slice(kind.as_str().as_bytes());
        self.finish_line();
    }

    /// Write flush_all
    pub fn flush_all(&mut self) {
        self.buf.extend_from_slice(b"flush_all");
        self.finish_line();
    }

    fn arith(&mut self, verb: &[u8], key: &[u8], delta: u64) {
        let mut itoa_buf = Buffer::new();
        self.buf.extend_from_slice(verb);
        self.buf.extend_from_slice(key);
        self.buf.extend_from_slice(b" ");
        self.buf.extend_from_slice(itoa_buf.format(delta).as_bytes());
        self.finish_line();
    }

    fn finish_line(&mut self) {
        self.buf.extend_from_slice(b"\r\n");
        self.count += 1;
    }
}

/// Check if a key is valid
pub fn is_valid_key(key: &[u8]) -> bool {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return false;
    }
    // Keys cannot contain control characters or whitespace; UTF-8 is fine
    key.iter().all(|&b| b > b' ' && b != 127)
}
