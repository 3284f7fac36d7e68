//! Incremental reply parser
//!
//! A [`ReceiveBuffer`] is fed raw socket chunks and splits them into
//! [`ReplyBlock`]s. It alternates between two states: scanning for the next
//! CRLF-terminated line, and collecting the bytes still owed to a `VALUE`
//! payload. Every line other than `VALUE`, `STAT` or a blank line is a
//! terminal reply and settles one of the commands that were sent.

use bytes::{Bytes, BytesMut};
use tracing::error;

/// Payload of a `VALUE <key> <flags> <len>` reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueBlock {
    pub key: Bytes,
    pub flags: u32,
    pub len: usize,
    pub data: Vec<u8>,
}

impl ValueBlock {
    /// True once the declared length has been received
    pub fn is_complete(&self) -> bool {
        self.data.len() == self.len
    }
}

/// One parsed reply line, plus its payload for `VALUE` lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyBlock {
    /// The line without its CRLF
    pub line: Bytes,
    pub value: Option<ValueBlock>,
}

impl ReplyBlock {
    pub fn is_stat(&self) -> bool {
        self.line.starts_with(b"STAT ")
    }

    /// True for lines that settle a command (anything but VALUE and STAT)
    pub fn is_terminal(&self) -> bool {
        self.value.is_none() && !self.is_stat()
    }
}

/// Classified error reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorReply {
    /// `ERROR`: the server did not recognise the command
    General,
    /// `CLIENT_ERROR <msg>`
    Client(String),
    /// `SERVER_ERROR <msg>`
    Server(String),
    /// Stream anomaly without a recognisable error line
    Unknown,
}

/// Upper bound on speculative payload allocation
const MAX_PREALLOC: usize = 1024 * 1024;

/// Per-socket parse state for one call
#[derive(Debug)]
pub struct ReceiveBuffer {
    blocks: Vec<ReplyBlock>,
    unparsed: BytesMut,
    owed: usize,
    remaining: usize,
    error: bool,
    anomaly: bool,
}

impl ReceiveBuffer {
    /// Create a buffer expecting `expected` terminal replies
    pub fn new(expected: usize) -> Self {
        Self {
            blocks: Vec::new(),
            unparsed: BytesMut::new(),
            owed: 0,
            remaining: expected,
            error: false,
            anomaly: false,
        }
    }

    /// Append a chunk read from the socket
    pub fn feed(&mut self, mut data: &[u8]) {
        if self.owed > 0 {
            let take = self.owed.min(data.len());
            if let Some(value) = self.blocks.last_mut().and_then(|b| b.value.as_mut()) {
                value.data.extend_from_slice(&data[..take]);
            }
            self.owed -= take;
            data = &data[take..];
            if self.owed > 0 {
                return;
            }
        }

        self.unparsed.extend_from_slice(data);

        while self.owed == 0 && !self.anomaly {
            let Some(pos) = memchr::memchr(b'\r', &self.unparsed) else {
                break;
            };
            match self.unparsed.get(pos + 1) {
                Some(b'\n') => {}
                Some(_) => {
                    error!("Bare CR in memcached reply stream");
                    self.fail();
                    break;
                }
                // LF not here yet
                None => break,
            }

            let line = self.unparsed.split_to(pos + 2).freeze().slice(..pos);
            self.process_line(line);
        }
    }

    fn process_line(&mut self, line: Bytes) {
        if line.is_empty() {
            // separator after a VALUE payload
            return;
        }

        if line.starts_with(b"VALUE ") {
            match parse_value_header(&line) {
                Some((key, flags, len)) => {
                    let take = len.min(self.unparsed.len());
                    let mut data = Vec::with_capacity(len.min(MAX_PREALLOC));
                    data.extend_from_slice(&self.unparsed.split_to(take));
                    self.owed = len - take;
                    self.blocks.push(ReplyBlock {
                        line,
                        value: Some(ValueBlock {
                            key,
                            flags,
                            len,
                            data,
                        }),
                    });
                }
                None => {
                    error!(
                        "Malformed VALUE header from memcached: {}",
                        String::from_utf8_lossy(&line)
                    );
                    self.fail();
                }
            }
            return;
        }

        let block = ReplyBlock { line, value: None };
        if block.is_stat() {
            self.blocks.push(block);
            return;
        }

        if is_error_line(&block.line) {
            self.error = true;
        }
        self.blocks.push(block);
        self.settle_one();
    }

    fn settle_one(&mut self) {
        if self.remaining == 0 {
            error!("Received more data than expected from memcached");
            self.fail();
        } else {
            self.remaining -= 1;
        }
    }

    /// Unrecoverable stream state: finish now and discard the result
    fn fail(&mut self) {
        self.error = true;
        self.anomaly = true;
        self.remaining = 0;
        self.owed = 0;
    }

    /// True once every expected reply has arrived (or the stream is broken)
    pub fn is_done(&self) -> bool {
        self.remaining == 0 && self.owed == 0
    }

    /// True if any error reply or stream anomaly was seen
    pub fn is_error(&self) -> bool {
        self.error
    }

    /// Classify the first error in the buffer
    pub fn error_reply(&self) -> Option<ErrorReply> {
        if !self.error {
            return None;
        }
        let found = self
            .blocks
            .iter()
            .find(|b| b.is_terminal() && is_error_line(&b.line))
            .map(|b| classify_error(&b.line));
        Some(found.unwrap_or(ErrorReply::Unknown))
    }

    /// Drop everything parsed so far
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.unparsed.clear();
        self.owed = 0;
    }

    pub fn blocks(&self) -> &[ReplyBlock] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Completed `VALUE` payloads
    pub fn values(&self) -> impl Iterator<Item = &ValueBlock> {
        self.blocks
            .iter()
            .filter_map(|b| b.value.as_ref())
            .filter(|v| v.is_complete())
    }

    /// Terminal reply lines in arrival order
    pub fn terminal_lines(&self) -> impl Iterator<Item = &[u8]> {
        self.blocks
            .iter()
            .filter(|b| b.is_terminal())
            .map(|b| b.line.as_ref())
    }

    /// True if the block at `idx` is exactly `line`; negative indexes count
    /// from the end
    pub fn line_is(&self, idx: isize, line: &[u8]) -> bool {
        let idx = if idx < 0 {
            match self.blocks.len().checked_sub(idx.unsigned_abs()) {
                Some(i) => i,
                None => return false,
            }
        } else {
            idx as usize
        };
        self.blocks.get(idx).is_some_and(|b| b.line == line)
    }

    /// Number of blocks that are exactly `line`
    pub fn count_lines(&self, line: &[u8]) -> usize {
        self.blocks.iter().filter(|b| b.line == line).count()
    }

    /// True if the buffer is non-empty and every block is exactly `line`
    pub fn all_lines(&self, line: &[u8]) -> bool {
        !self.blocks.is_empty() && self.blocks.iter().all(|b| b.line == line)
    }

    /// Reply lines joined with CRLF, without the closing `END`
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            if block.line.as_ref() == b"END" {
                continue;
            }
            if !out.is_empty() {
                out.push_str("\r\n");
            }
            out.push_str(&String::from_utf8_lossy(&block.line));
        }
        out
    }
}

fn is_error_line(line: &[u8]) -> bool {
    line.split(|&b| b == b' ')
        .next()
        .is_some_and(|token| token.ends_with(b"ERROR"))
}

fn classify_error(line: &[u8]) -> ErrorReply {
    let (token, rest) = match memchr::memchr(b' ', line) {
        Some(i) => (&line[..i], &line[i + 1..]),
        None => (line, &[][..]),
    };
    let message = String::from_utf8_lossy(rest).trim().to_string();
    match token {
        b"ERROR" => ErrorReply::General,
        b"CLIENT_ERROR" => ErrorReply::Client(message),
        b"SERVER_ERROR" => ErrorReply::Server(message),
        _ => ErrorReply::Unknown,
    }
}

/// Parse `VALUE <key> <flags> <len>`
fn parse_value_header(line: &Bytes) -> Option<(Bytes, u32, usize)> {
    let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());
    parts.next()?; // VALUE
    let key = parts.next()?;
    let flags = parts.next().and_then(parse_u32)?;
    let len = parts.next().and_then(parse_usize)?;
    if parts.next().is_some() {
        return None;
    }
    Some((line.slice_ref(key), flags, len))
}

/// Parse bytes as u32
fn parse_u32(bytes: &[u8]) -> Option<u32> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Parse bytes as usize
fn parse_usize(bytes: &[u8]) -> Option<usize> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}
