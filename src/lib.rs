//! # PetraClient
//!
//! Distributed memcached client speaking the ASCII protocol.
//!
//! ## Features
//!
//! - get / set / add / replace / incr / decr / delete / flush_all / stats
//! - Weighted key distribution with failover to the next live server
//! - One concurrent round trip per call, bounded by a single deadline
//! - Integer, string, binary and JSON values with zlib compression
//! - Read-through `load` and add-then-verify `check_and_add`
//! - Prometheus metrics and per-operation CPU accounting
//!
//! ## Example
//!
//! ```ignore
//! use petraclient::prelude::*;
//!
//! let client = Client::new(&Config::from_env())?;
//! client.set("greeting", "hello", 60).await?;
//! let value = client.get("greeting").await?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────┐   ┌───────────┐   ┌─────────────┐
//! │ Client       │──▶│ Registry │   │ IoEngine  │──▶│ memcached 1 │
//! │  ├─ codec    │   │ (buckets,│   │ (one task,│──▶│ memcached 2 │
//! │  └─ keys     │──▶│  failover│──▶│  deadline)│──▶│ memcached N │
//! └──────────────┘   └──────────┘   └───────────┘   └─────────────┘
//! ```

// Modules
pub mod client;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod key;
pub mod metrics;
pub mod prelude;
pub mod protocol;
pub mod registry;

// Re-exports for convenience
pub use client::Client;
pub use codec::Value;
pub use error::{CacheError, CodecError, Result};
pub use key::Key;
