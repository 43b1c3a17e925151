//! Shard manager
//!
//! Owns the ordered shard set of one process generation and drives it
//! through start, shutdown and restart. Shards are connected and
//! disconnected strictly one after another: the gateway limits how fast new
//! sessions may identify, so concurrency here would only buy rate-limit
//! rejections.
//!
//! Lock order is manager, then shard. Shards never call back into the
//! manager.

mod routing;

pub use routing::{shard_for_guild, DM_SHARD};

use crate::error::ManagerError;
use crate::metrics;
use crate::retry::{BackoffPolicy, Retry, RetryPolicy};
use crate::session::{EventHandler, ExitHook, Gateway, GuildSummary, ShardConnectParams};
use crate::shard::{Shard, ShardState, ShardStatus};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use twilight_gateway::Intents;
use twilight_model::application::command::Command;
use twilight_model::id::marker::{CommandMarker, GuildMarker};
use twilight_model::id::Id;

/// Minimum spacing between two identify handshakes
pub const DEFAULT_IDENTIFY_INTERVAL: Duration = Duration::from_secs(5);

/// Time budget for disconnecting every shard
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(20);

/// How an operation spanning every shard reacts to a per-shard failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop at the first failing shard and return its error
    FailFast,
    /// Visit every shard and report all failures together
    Accumulate,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailFast => f.write_str("fail_fast"),
            Self::Accumulate => f.write_str("accumulate"),
        }
    }
}

/// Timing and retry settings for a manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Pacing window applied to every shard but the last during start
    pub identify_interval: Duration,
    /// Budget for a whole shutdown, split evenly across shards
    pub shutdown_timeout: Duration,
    pub connect_retry: RetryPolicy,
    pub disconnect_retry: RetryPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            identify_interval: DEFAULT_IDENTIFY_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            connect_retry: RetryPolicy::default(),
            disconnect_retry: RetryPolicy {
                max_attempts: 3,
                backoff: BackoffPolicy {
                    first: Duration::from_millis(100),
                    max: Duration::from_secs(1),
                    factor: 2.0,
                },
            },
        }
    }
}

struct Inner<G: Gateway> {
    intents: Intents,
    shards: Vec<Shard<G::Session>>,
    shard_count: u32,
    /// Count set by the caller, kept across restarts
    pinned_shard_count: Option<u32>,
    handlers: Vec<EventHandler>,
}

/// Creates and manages every shard of the bot.
///
/// Safe for simultaneous use by multiple tasks.
pub struct Manager<G: Gateway> {
    gateway: Arc<G>,
    config: ManagerConfig,
    state: ShardState,
    inner: RwLock<Inner<G>>,
}

impl<G: Gateway> fmt::Debug for Manager<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Restart outcome when the manager could not be swapped cleanly
#[derive(Error)]
pub enum RestartError<G: Gateway> {
    /// The replacement never came up; the current manager is untouched
    #[error("replacement manager failed to start: {source}")]
    StartFailed {
        #[source]
        source: ManagerError,
    },

    /// The replacement is live, but the previous manager may still hold
    /// connections and its shutdown must be retried
    #[error("previous manager failed to shut down: {source}")]
    ShutdownFailed {
        replacement: Manager<G>,
        #[source]
        source: ManagerError,
    },
}

impl<G: Gateway> RestartError<G> {
    /// The underlying manager error
    pub fn error(&self) -> &ManagerError {
        match self {
            Self::StartFailed { source } | Self::ShutdownFailed { source, .. } => source,
        }
    }
}

impl<G: Gateway> fmt::Debug for RestartError<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartFailed { source } => f
                .debug_struct("StartFailed")
                .field("source", source)
                .finish(),
            Self::ShutdownFailed { source, .. } => f
                .debug_struct("ShutdownFailed")
                .field("source", source)
                .finish_non_exhaustive(),
        }
    }
}

impl<G: Gateway> Manager<G> {
    const LIFECYCLE_POLICY: FailurePolicy = FailurePolicy::FailFast;
    const COMMAND_POLICY: FailurePolicy = FailurePolicy::Accumulate;

    /// Create a manager sized to the gateway's recommended shard count.
    pub async fn new(gateway: Arc<G>) -> Result<Self, ManagerError> {
        Self::with_config(gateway, ManagerConfig::default()).await
    }

    /// Create a manager with explicit timing and retry settings.
    ///
    /// Fails with [`ManagerError::NilSession`] if the gateway carries no
    /// token. Issues exactly one read-only recommended-shards query; a
    /// recommendation below one is raised to one.
    pub async fn with_config(gateway: Arc<G>, config: ManagerConfig) -> Result<Self, ManagerError> {
        if gateway.token().trim().is_empty() {
            return Err(ManagerError::NilSession);
        }

        let recommended = gateway
            .recommended_shards()
            .await
            .map_err(ManagerError::GatewayQuery)?;
        let shard_count = recommended.max(1);

        info!(recommended, shard_count, "Shard manager created");

        Ok(Self {
            gateway,
            config,
            state: ShardState::new(),
            inner: RwLock::new(Inner {
                intents: Intents::empty(),
                shards: Vec::new(),
                shard_count,
                pinned_shard_count: None,
                handlers: Vec::new(),
            }),
        })
    }

    /// Allocate a fresh shard set and connect it in ascending ID order.
    ///
    /// Every shard but the last is paced by the identify interval. The
    /// first shard that still fails after its retries aborts the start;
    /// shards already connected stay connected until [`Manager::shutdown`].
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), ManagerError> {
        let mut inner = self.inner.write().await;

        let mut discarded = 0;
        for shard in &inner.shards {
            if shard.is_connected().await {
                discarded += 1;
            }
        }
        if discarded > 0 {
            warn!(discarded, "Discarding connected shards from a previous start without shutdown");
        }

        inner.shard_count = inner.shard_count.max(1);
        let shard_count = inner.shard_count;
        inner.shards = (0..shard_count).map(Shard::new).collect();
        self.state.reset(shard_count);
        metrics::set_shards_connected(0);

        info!(
            shard_count,
            handlers = inner.handlers.len(),
            intents = ?inner.intents,
            policy = %Self::LIFECYCLE_POLICY,
            "Starting shards"
        );

        let token = self.gateway.token().to_string();
        let gateway = self.gateway.as_ref();
        let state = &self.state;

        for shard in &inner.shards {
            let shard_id = shard.id();
            shard.add_handlers(&inner.handlers).await;
            shard.on_exit(self.session_lost_hook(shard_id)).await;

            let params = ShardConnectParams {
                token: token.clone(),
                shard_id,
                shard_count,
                intents: inner.intents,
            };

            let mut retry = Retry::new(self.config.connect_retry);
            // No handshake follows the last shard, so it needs no pacing.
            if shard_id + 1 < shard_count {
                retry = retry.with_rate_limit(self.config.identify_interval);
            }

            state.set_status(shard_id, ShardStatus::Connecting);
            let started = Instant::now();

            let result = retry
                .run(cancel, move |attempt| {
                    state.record_connect_attempt(shard_id);
                    metrics::record_connect_attempt(shard_id);
                    debug!(shard_id, attempt, "Connecting shard");
                    shard.connect(gateway, params.clone())
                })
                .await;

            if let Err(e) = result {
                // Cancellation can land in the pacing wait after a successful open.
                if shard.is_connected().await {
                    state.set_status(shard_id, ShardStatus::Connected);
                    metrics::record_connect(shard_id, started.elapsed());
                    metrics::set_shards_connected(state.connected_shards());
                } else {
                    state.set_status(shard_id, ShardStatus::Failed);
                }
                metrics::record_error(Some(shard_id), e.error_type_label());
                error!(
                    shard_id,
                    error = %e,
                    policy = %Self::LIFECYCLE_POLICY,
                    "Shard failed to connect, aborting start"
                );
                return Err(e);
            }

            state.set_status(shard_id, ShardStatus::Connected);
            metrics::record_connect(shard_id, started.elapsed());
            metrics::set_shards_connected(state.connected_shards());
        }

        info!(shard_count, "All shards connected");
        Ok(())
    }

    /// Marks the shard failed when its session dies without a disconnect.
    fn session_lost_hook(&self, shard_id: u32) -> ExitHook {
        let state = self.state.clone();
        ExitHook::new(move |reason| {
            state.set_status(shard_id, ShardStatus::Failed);
            metrics::record_error(Some(shard_id), "session_lost");
            metrics::set_shards_connected(state.connected_shards());
            warn!(shard_id, reason = %reason, "Shard session lost");
        })
    }

    /// Disconnect every shard in order, each within an equal share of the
    /// shutdown budget.
    ///
    /// Shards that are not connected count as done. The first other failure
    /// stops the loop and is returned as [`ManagerError::ShutdownFailure`];
    /// later shards are left as they are.
    pub async fn shutdown(&self, cancel: &CancellationToken) -> Result<(), ManagerError> {
        let inner = self.inner.write().await;

        if inner.shards.is_empty() {
            debug!("Shutdown requested before start, nothing to do");
            return Ok(());
        }

        let per_shard = self.config.shutdown_timeout / inner.shards.len() as u32;
        info!(
            shard_count = inner.shards.len(),
            ?per_shard,
            policy = %Self::LIFECYCLE_POLICY,
            "Shutting down shards"
        );

        let started = Instant::now();
        for shard in &inner.shards {
            let shard_id = shard.id();
            let was_connected = shard.is_connected().await;
            if was_connected {
                self.state.set_status(shard_id, ShardStatus::Disconnecting);
            }

            let result = Retry::new(self.config.disconnect_retry)
                .with_timeout(per_shard)
                .run(cancel, move |_| async move {
                    match shard.disconnect().await {
                        Err(ManagerError::NotConnected { .. }) => Ok(()),
                        other => other,
                    }
                })
                .await;

            if let Err(e) = result {
                self.state.set_status(shard_id, ShardStatus::Failed);
                let err = ManagerError::ShutdownFailure {
                    shard_id,
                    source: Box::new(e),
                };
                metrics::record_error(Some(shard_id), err.error_type_label());
                error!(
                    shard_id,
                    error = %err,
                    policy = %Self::LIFECYCLE_POLICY,
                    "Shard failed to disconnect, aborting shutdown"
                );
                return Err(err);
            }

            if was_connected {
                self.state.set_status(shard_id, ShardStatus::Disconnected);
            }
        }

        metrics::record_shutdown(started.elapsed());
        metrics::set_shards_connected(self.state.connected_shards());
        info!(elapsed = ?started.elapsed(), "All shards disconnected");
        Ok(())
    }

    /// Replace this manager with a freshly started one.
    ///
    /// The replacement inherits handlers, intents and any shard count set
    /// with [`Manager::set_shard_count`]. It is started before this manager
    /// is shut down, so traffic is never without a live shard set.
    pub async fn restart(&self, cancel: &CancellationToken) -> Result<Self, RestartError<G>> {
        let (handlers, intents, pinned) = {
            let inner = self.inner.read().await;
            (
                inner.handlers.clone(),
                inner.intents,
                inner.pinned_shard_count,
            )
        };

        info!(handlers = handlers.len(), ?pinned, "Restarting shard manager");

        let replacement = Self::with_config(Arc::clone(&self.gateway), self.config.clone())
            .await
            .map_err(|source| RestartError::StartFailed { source })?;

        replacement.add_handlers(handlers).await;
        replacement.set_intents(intents).await;
        if let Some(count) = pinned {
            replacement.set_shard_count(count).await;
        }

        if let Err(source) = replacement.start(cancel).await {
            // Partially started shards of the replacement would leak otherwise.
            if let Err(e) = replacement.shutdown(&CancellationToken::new()).await {
                warn!(error = %e, "Failed to clean up partially started replacement");
            }
            return Err(RestartError::StartFailed { source });
        }

        if let Err(source) = self.shutdown(cancel).await {
            return Err(RestartError::ShutdownFailed {
                replacement,
                source,
            });
        }

        info!(
            shard_count = replacement.shard_count().await,
            "Shard manager restarted"
        );
        Ok(replacement)
    }

    /// Set the intents used by the next connect.
    pub async fn set_intents(&self, intents: Intents) {
        self.inner.write().await.intents = intents;
    }

    pub async fn intents(&self) -> Intents {
        self.inner.read().await.intents
    }

    /// Set the shard count; takes effect on the next start or restart.
    pub async fn set_shard_count(&self, count: u32) {
        let count = count.max(1);
        let mut inner = self.inner.write().await;
        inner.shard_count = count;
        inner.pinned_shard_count = Some(count);
    }

    /// Configured shard count.
    pub async fn shard_count(&self) -> u32 {
        self.inner.read().await.shard_count
    }

    /// IDs of the current shard set, in slice order.
    pub async fn shard_ids(&self) -> Vec<u32> {
        self.inner.read().await.shards.iter().map(Shard::id).collect()
    }

    /// Register handlers on every current and future shard.
    pub async fn add_handlers<I>(&self, handlers: I)
    where
        I: IntoIterator<Item = EventHandler>,
    {
        let handlers: Vec<EventHandler> = handlers.into_iter().collect();
        let mut inner = self.inner.write().await;

        inner.handlers.extend(handlers.iter().cloned());
        for shard in &inner.shards {
            shard.add_handlers(&handlers).await;
        }

        debug!(
            added = handlers.len(),
            total = inner.handlers.len(),
            "Handlers registered"
        );
    }

    /// Remove every handler from the registry and from all shards.
    pub async fn remove_handlers(&self) {
        let mut inner = self.inner.write().await;

        inner.handlers.clear();
        for shard in &inner.shards {
            shard.remove_handlers().await;
        }

        debug!("Handlers removed");
    }

    pub async fn handler_count(&self) -> usize {
        self.inner.read().await.handlers.len()
    }

    /// Create a guild command through every shard.
    pub async fn register_command(
        &self,
        guild_id: Id<GuildMarker>,
        command: &Command,
    ) -> Result<(), ManagerError> {
        let inner = self.inner.read().await;
        let mut errors = Vec::new();
        for shard in &inner.shards {
            if let Err(e) = shard.register_command(guild_id, command).await {
                errors.push(e);
            }
        }
        Self::collect_command_errors("register_command", errors)
    }

    /// Overwrite the guild's commands through every shard.
    pub async fn register_commands_overwrite(
        &self,
        guild_id: Id<GuildMarker>,
        commands: &[Command],
    ) -> Result<(), ManagerError> {
        let inner = self.inner.read().await;
        let mut errors = Vec::new();
        for shard in &inner.shards {
            if let Err(e) = shard.register_commands_overwrite(guild_id, commands).await {
                errors.push(e);
            }
        }
        Self::collect_command_errors("register_commands_overwrite", errors)
    }

    /// Delete a guild command through every shard.
    pub async fn delete_command(
        &self,
        guild_id: Id<GuildMarker>,
        command_id: Id<CommandMarker>,
    ) -> Result<(), ManagerError> {
        let inner = self.inner.read().await;
        let mut errors = Vec::new();
        for shard in &inner.shards {
            if let Err(e) = shard.delete_command(guild_id, command_id).await {
                errors.push(e);
            }
        }
        Self::collect_command_errors("delete_command", errors)
    }

    fn collect_command_errors(
        operation: &'static str,
        errors: Vec<ManagerError>,
    ) -> Result<(), ManagerError> {
        if errors.is_empty() {
            return Ok(());
        }

        for e in &errors {
            metrics::record_error(e.shard_id(), e.error_type_label());
        }
        warn!(
            operation,
            failed_shards = errors.len(),
            policy = %Self::COMMAND_POLICY,
            "Command request failed on some shards"
        );
        Err(ManagerError::CommandFanOut(errors))
    }

    /// Guilds across all connected shards. The returned list is owned by
    /// the caller.
    pub async fn list_guilds(&self) -> Vec<GuildSummary> {
        let inner = self.inner.read().await;
        let mut guilds = Vec::new();
        for shard in &inner.shards {
            guilds.extend(shard.guilds().await);
        }
        guilds
    }

    /// Number of guilds across all connected shards.
    pub async fn guild_count(&self) -> usize {
        let inner = self.inner.read().await;
        let mut count = 0;
        for shard in &inner.shards {
            count += shard.guilds().await.len();
        }
        count
    }

    /// Session of the shard that carries DMs.
    pub async fn session_for_dm(&self) -> Option<Arc<G::Session>> {
        let inner = self.inner.read().await;
        match inner.shards.get(DM_SHARD as usize) {
            Some(shard) => shard.session().await,
            None => None,
        }
    }

    /// Session of the shard that serves `guild_id`.
    ///
    /// Routed over the live shard set, so a pending
    /// [`Manager::set_shard_count`] has no effect until the next start.
    pub async fn session_for_guild(&self, guild_id: Id<GuildMarker>) -> Option<Arc<G::Session>> {
        let inner = self.inner.read().await;
        if inner.shards.is_empty() {
            return None;
        }
        let index = shard_for_guild(guild_id, inner.shards.len() as u32);
        inner.shards[index as usize].session().await
    }

    /// Lock-free status view of the current shard set.
    pub fn state(&self) -> ShardState {
        self.state.clone()
    }
}
