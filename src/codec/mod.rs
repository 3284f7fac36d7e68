//! Value codec: turns [`Value`]s into flagged payloads and back
//!
//! Decoding reverses the flags in a fixed order: ESCAPED, COMPRESSED,
//! SERIALIZED, NUMERIC.

pub mod escape;
mod value;

pub use value::Value;

use crate::CodecError;
use crate::config::CodecConfig;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::borrow::Cow;
use std::io::{Read, Write};
use tracing::debug;

/// Payload is JSON
pub const F_SERIALIZED: u32 = 1;
/// Payload is zlib-deflated
pub const F_COMPRESSED: u32 = 2;
/// Payload is percent-escaped
pub const F_ESCAPED: u32 = 4;
/// Payload is a decimal integer
pub const F_NUMERIC: u32 = 8;

/// Names of the flags set in `flags`, for diagnostics
pub fn flag_names(flags: u32) -> Vec<&'static str> {
    [
        (F_ESCAPED, "ESCAPED"),
        (F_COMPRESSED, "COMPRESSED"),
        (F_SERIALIZED, "SERIALIZED"),
        (F_NUMERIC, "NUMERIC"),
    ]
    .into_iter()
    .filter(|(bit, _)| flags & bit != 0)
    .map(|(_, name)| name)
    .collect()
}

/// Encodes and decodes values according to the codec configuration
#[derive(Debug, Clone)]
pub struct ValueCodec {
    compression: bool,
    threshold: usize,
    min_ratio: f64,
}

impl ValueCodec {
    pub fn new(config: &CodecConfig) -> Self {
        Self {
            compression: config.compression,
            threshold: config.compress_threshold,
            min_ratio: config.min_compression_ratio,
        }
    }

    /// Encode a value, returning `(flags, payload)`
    pub fn encode(&self, value: &Value) -> (u32, Vec<u8>) {
        let (mut flags, payload) = match value {
            Value::Int(n) => {
                let mut buf = itoa::Buffer::new();
                (F_NUMERIC, buf.format(*n).as_bytes().to_vec())
            }
            Value::Str(s) => (0, s.as_bytes().to_vec()),
            Value::Bytes(b) => (0, b.clone()),
            Value::Structured(v) => (F_SERIALIZED, v.to_string().into_bytes()),
        };

        if self.compression && payload.len() > self.threshold {
            if let Some(zipped) = deflate(&payload)
                && (zipped.len() as f64) < payload.len() as f64 * self.min_ratio
            {
                debug!("Using compressed value ({}/{})", zipped.len(), payload.len());
                flags |= F_COMPRESSED;
                return (flags, zipped);
            }
        }

        (flags, payload)
    }

    /// Restore a value from its stored form
    pub fn decode(&self, flags: u32, data: &[u8]) -> Result<Value, CodecError> {
        let mut buf = Cow::Borrowed(data);

        if flags & F_ESCAPED != 0 {
            buf = Cow::Owned(escape::unescape(&buf)?);
        }

        if flags & F_COMPRESSED != 0 {
            buf = Cow::Owned(inflate(&buf)?);
        }

        if flags & F_SERIALIZED != 0 {
            let json: serde_json::Value = serde_json::from_slice(&buf)?;
            return Ok(Value::Structured(json));
        }

        if flags & F_NUMERIC != 0 {
            let n = std::str::from_utf8(&buf)
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .ok_or(CodecError::NotNumeric)?;
            return Ok(Value::Int(n));
        }

        match String::from_utf8(buf.into_owned()) {
            Ok(s) => Ok(Value::Str(s)),
            Err(e) => Ok(Value::Bytes(e.into_bytes())),
        }
    }
}

impl Default for ValueCodec {
    fn default() -> Self {
        Self::new(&CodecConfig::default())
    }
}

fn deflate(data: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
    encoder.write_all(data).ok()?;
    encoder.finish().ok()
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(CodecError::Decompress)?;
    Ok(out)
}
