//! Raid Mate gateway library
//!
//! Sharded connection management for a Discord bot: a [`Manager`] splits the
//! bot across shards, connects them under the identify rate limit, routes
//! guild traffic to the owning shard and tears everything down in order.

pub mod config;
pub mod error;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod retry;
pub mod session;
pub mod shard;

#[cfg(test)]
mod testing;

pub use config::{GatewayConfig, IntentsConfig};
pub use error::{GatewayError, ManagerError};
pub use manager::{
    shard_for_guild, FailurePolicy, Manager, ManagerConfig, RestartError, DM_SHARD,
};
pub use session::twilight::{TwilightGateway, TwilightSession};
pub use session::{EventHandler, Gateway, GuildSummary, Session};
pub use shard::{ShardState, ShardStatus};
