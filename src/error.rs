//! Domain error types for the Raid Mate gateway
//!
//! Lifecycle errors (`ManagerError`) are raised by the shard manager and its
//! shards; `GatewayError` covers the process boundary (configuration,
//! telemetry setup). main.rs is the ONLY module allowed to use
//! anyhow::Result.

use crate::retry::{Interrupted, RetryableError};
use crate::session::SessionError;
use std::time::Duration;
use thiserror::Error;

/// Shard manager errors
///
/// Every variant carries the shard it concerns where one exists, so a log
/// line is enough to tell which connection misbehaved:
/// ```text
/// ManagerError::ShutdownFailure { shard_id: 2, source: Timeout(3s) }
/// → "failed to shut down all shards: shard 2: operation timed out after 3s"
/// ```
#[derive(Error, Debug)]
pub enum ManagerError {
    /// The template session carries no usable credentials
    #[error("session is nil: the template session has no credentials")]
    NilSession,

    /// Connect was called on a shard that already owns a live session
    #[error("shard {shard_id} is already connected")]
    AlreadyConnected { shard_id: u32 },

    /// Disconnect was called on a shard without a live session
    #[error("shard {shard_id} is not connected")]
    NotConnected { shard_id: u32 },

    /// A shard failed to disconnect; later shards were not attempted
    #[error("failed to shut down all shards: shard {shard_id}: {source}")]
    ShutdownFailure {
        shard_id: u32,
        #[source]
        source: Box<ManagerError>,
    },

    /// The underlying session of a shard reported an error
    #[error("shard {shard_id} session error: {source}")]
    Session {
        shard_id: u32,
        #[source]
        source: SessionError,
    },

    /// The recommended shard count query failed
    #[error("gateway query failed: {0}")]
    GatewayQuery(#[source] SessionError),

    /// A bounded operation ran out of its time budget
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// One or more shards rejected a command registration request
    #[error("command request failed on {} shard(s): {}", .0.len(), join_messages(.0))]
    CommandFanOut(Vec<ManagerError>),
}

fn join_messages(errors: &[ManagerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ManagerError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `gateway_errors_total`.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::NilSession => "nil_session",
            Self::AlreadyConnected { .. } => "already_connected",
            Self::NotConnected { .. } => "not_connected",
            Self::ShutdownFailure { .. } => "shutdown_failure",
            Self::Session { .. } => "session",
            Self::GatewayQuery(_) => "gateway_query",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::CommandFanOut(_) => "command_fan_out",
        }
    }

    /// The shard this error is about, if any.
    pub fn shard_id(&self) -> Option<u32> {
        match self {
            Self::AlreadyConnected { shard_id }
            | Self::NotConnected { shard_id }
            | Self::ShutdownFailure { shard_id, .. }
            | Self::Session { shard_id, .. } => Some(*shard_id),
            _ => None,
        }
    }
}

impl From<Interrupted> for ManagerError {
    fn from(interrupted: Interrupted) -> Self {
        match interrupted {
            Interrupted::Timeout(budget) => Self::Timeout(budget),
            Interrupted::Cancelled => Self::Cancelled,
        }
    }
}

impl RetryableError for ManagerError {
    // Lifecycle misuse does not heal by trying again.
    fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::NilSession
                | Self::AlreadyConnected { .. }
                | Self::NotConnected { .. }
                | Self::Timeout(_)
                | Self::Cancelled
        )
    }
}

/// Process-level errors
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),

    /// Prometheus recorder could not be installed
    #[error("metrics recorder installation failed: {0}")]
    MetricsInstall(String),

    /// Shard manager failed during a process-level operation
    #[error(transparent)]
    Manager(#[from] ManagerError),
}
