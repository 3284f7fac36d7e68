//! Memcached ASCII protocol, client side

pub mod command;
pub mod reply;
pub mod stats;

pub use command::{CommandWriter, MAX_KEY_LENGTH, StatsKind, StoreMode, is_valid_key};
pub use reply::{ErrorReply, ReceiveBuffer, ReplyBlock, ValueBlock};
pub use stats::{ServerStats, StatValue, parse_stats};
