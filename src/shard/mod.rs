//! Shard management module
//!
//! A shard owns one gateway session; its status is mirrored into a shared
//! [`ShardState`] for health reporting.

mod connection;
mod state;

pub use connection::{normalize_token, Shard};
pub use state::{ShardSnapshot, ShardState, ShardStatus};
