//! Shard status tracking
//!
//! Lock-free view of every shard's lifecycle, readable while the manager
//! holds its own lock through a long start or shutdown sequence.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle status for a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    /// Allocated, no connect attempted yet
    Pending,
    /// Connect in progress
    Connecting,
    /// Session open
    Connected,
    /// Disconnect in progress
    Disconnecting,
    /// Session closed
    Disconnected,
    /// Last lifecycle operation failed
    Failed,
}

impl ShardStatus {
    /// Returns true if the shard holds a live session
    pub fn is_connected(&self) -> bool {
        matches!(self, ShardStatus::Connected)
    }
}

/// State for a single shard
#[derive(Debug)]
pub struct ShardStateEntry {
    pub status: ShardStatus,
    pub connect_attempts: AtomicU64,
    pub connected_at: Option<Instant>,
}

impl Default for ShardStateEntry {
    fn default() -> Self {
        Self {
            status: ShardStatus::Pending,
            connect_attempts: AtomicU64::new(0),
            connected_at: None,
        }
    }
}

/// Shared state across all shards of one manager
#[derive(Debug, Clone, Default)]
pub struct ShardState {
    inner: Arc<DashMap<u32, ShardStateEntry>>,
}

impl ShardState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all entries with `count` pending shards
    pub fn reset(&self, count: u32) {
        self.inner.clear();
        for shard_id in 0..count {
            self.inner.insert(shard_id, ShardStateEntry::default());
        }
    }

    /// Update shard status
    pub fn set_status(&self, shard_id: u32, status: ShardStatus) {
        if let Some(mut entry) = self.inner.get_mut(&shard_id) {
            entry.status = status;
            entry.connected_at = match status {
                ShardStatus::Connected => Some(Instant::now()),
                ShardStatus::Disconnecting => entry.connected_at,
                _ => None,
            };
        }
    }

    /// Increment connect attempt counter
    pub fn record_connect_attempt(&self, shard_id: u32) {
        if let Some(entry) = self.inner.get(&shard_id) {
            entry.connect_attempts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get status for a specific shard
    pub fn status(&self, shard_id: u32) -> Option<ShardStatus> {
        self.inner.get(&shard_id).map(|e| e.status)
    }

    /// Get connect attempts for a specific shard
    pub fn connect_attempts(&self, shard_id: u32) -> u64 {
        self.inner
            .get(&shard_id)
            .map_or(0, |e| e.connect_attempts.load(Ordering::Relaxed))
    }

    /// Get count of connected shards
    pub fn connected_shards(&self) -> usize {
        self.inner
            .iter()
            .filter(|e| e.status.is_connected())
            .count()
    }

    /// Get total tracked shard count
    pub fn shard_count(&self) -> usize {
        self.inner.len()
    }

    /// Check if every tracked shard is connected
    pub fn is_ready(&self) -> bool {
        let total = self.shard_count();
        total > 0 && self.connected_shards() == total
    }

    /// Snapshot of every shard ordered by shard ID
    pub fn snapshot(&self) -> Vec<ShardSnapshot> {
        let mut entries: Vec<_> = self
            .inner
            .iter()
            .map(|e| ShardSnapshot {
                shard_id: *e.key(),
                status: e.status,
                connect_attempts: e.connect_attempts.load(Ordering::Relaxed),
                connected_secs: e.connected_at.map(|at| at.elapsed().as_secs()),
            })
            .collect();
        entries.sort_by_key(|e| e.shard_id);
        entries
    }
}

/// Point-in-time view of one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardSnapshot {
    pub shard_id: u32,
    pub status: ShardStatus,
    pub connect_attempts: u64,
    pub connected_secs: Option<u64>,
}
