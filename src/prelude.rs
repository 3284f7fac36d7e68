//! Prelude module for common imports.
//!
//! This module re-exports commonly used types and traits for convenience.
//!
//! # Usage
//!
//! ```ignore
//! use petraclient::prelude::*;
//! ```

// Error types
pub use crate::error::{CacheError, CodecError, Result};

// Configuration
pub use crate::config::{ClientConfig, CodecConfig, Config};

// Client
pub use crate::client::{Client, load_key};
pub use crate::codec::Value;
pub use crate::key::Key;

// Protocol
pub use crate::protocol::{ServerStats, StatValue};

// Metrics
pub use crate::metrics::{Metrics, Op, OpStats};

// Common external crates
pub use std::sync::Arc;
pub use tracing::{debug, error, info, trace, warn};
