//! Parsing of `stats` replies

use crate::protocol::ReceiveBuffer;
use std::collections::BTreeMap;

/// A single `STAT` value
#[derive(Debug, Clone, PartialEq)]
pub enum StatValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl StatValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            StatValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            StatValue::Float(f) => Some(*f),
            StatValue::Int(n) => Some(*n as f64),
            StatValue::Text(_) => None,
        }
    }
}

/// Stats of one server, keyed by stat name
pub type ServerStats = BTreeMap<String, StatValue>;

/// Collect the `STAT <name> <value>` lines of a reply
pub fn parse_stats(reply: &ReceiveBuffer) -> ServerStats {
    reply
        .blocks()
        .iter()
        .filter(|b| b.is_stat())
        .filter_map(|b| {
            let line = std::str::from_utf8(&b.line).ok()?;
            let mut parts = line.splitn(3, ' ');
            parts.next()?; // STAT
            let name = parts.next()?;
            let raw = parts.next().unwrap_or("").trim();
            Some((name.to_string(), convert(name, raw)))
        })
        .collect()
}

fn convert(name: &str, raw: &str) -> StatValue {
    match name {
        "version" => StatValue::Text(raw.to_string()),
        "rusage_user" | "rusage_system" => match parse_rusage(raw) {
            Some(secs) => StatValue::Float(secs),
            None => StatValue::Text(raw.to_string()),
        },
        _ => raw
            .parse::<i64>()
            .map_or_else(|_| StatValue::Text(raw.to_string()), StatValue::Int),
    }
}

/// Older servers report `sec:usec`, newer ones `sec.usec`
fn parse_rusage(raw: &str) -> Option<f64> {
    match raw.split_once(':') {
        Some((secs, micros)) => {
            let secs: f64 = secs.parse().ok()?;
            let micros: f64 = if micros.is_empty() { 0.0 } else { micros.parse().ok()? };
            Some(secs + micros / 1_000_000.0)
        }
        None => raw.parse().ok(),
    }
}
