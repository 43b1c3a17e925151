//! Gateway session boundary
//!
//! The manager never talks to Discord directly. It drives a [`Gateway`]
//! (credentials plus the recommended shard count query) and the
//! [`Session`]s that gateway opens, one per shard. The production
//! implementation lives in [`twilight`]; tests use an in-memory double.

pub mod twilight;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use twilight_gateway::Intents;
use twilight_model::application::command::Command;
use twilight_model::gateway::event::Event;
use twilight_model::id::marker::{CommandMarker, GuildMarker};
use twilight_model::id::Id;

/// Error reported by a session or gateway implementation
pub type SessionError = Box<dyn std::error::Error + Send + Sync>;

/// Credentials and shard layout a shard needs to open its session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardConnectParams {
    pub token: String,
    pub shard_id: u32,
    pub shard_count: u32,
    pub intents: Intents,
}

/// Opaque handle returned when a handler is attached to a live session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

/// Minimal view of a guild known to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildSummary {
    pub id: Id<GuildMarker>,
    pub shard_id: u32,
}

/// Caller-supplied callback invoked for every gateway event
#[derive(Clone)]
pub struct EventHandler {
    callback: Arc<dyn Fn(&Event) + Send + Sync>,
}

impl EventHandler {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Invoke the handler with an event
    pub fn call(&self, event: &Event) {
        (self.callback)(event)
    }

    /// Whether two values wrap the same callback
    pub fn same_callback(&self, other: &EventHandler) -> bool {
        Arc::ptr_eq(&self.callback, &other.callback)
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandler")
            .field("callback", &Arc::as_ptr(&self.callback))
            .finish()
    }
}

/// Callback fired once when an open session's connection dies without a
/// `close`. Receives the reason.
#[derive(Clone)]
pub struct ExitHook {
    callback: Arc<dyn Fn(&str) + Send + Sync>,
}

impl ExitHook {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    pub fn call(&self, reason: &str) {
        (self.callback)(reason)
    }
}

impl fmt::Debug for ExitHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitHook").finish_non_exhaustive()
    }
}

/// Source of sessions: holds the bot credentials and knows the gateway's
/// recommended shard count.
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    type Session: Session;

    /// Bot token used to identify new sessions
    fn token(&self) -> &str;

    /// Shard count recommended by the remote gateway
    async fn recommended_shards(&self) -> Result<u32, SessionError>;

    /// Build an unopened session for one shard
    fn session(&self, params: &ShardConnectParams) -> Result<Self::Session, SessionError>;
}

/// One connection to the remote gateway
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Open the connection; resolves once the session is identified
    async fn open(&self) -> Result<(), SessionError>;

    /// Close the connection
    async fn close(&self) -> Result<(), SessionError>;

    /// Attach a handler; events are dispatched to it until removed
    fn add_handler(&self, handler: EventHandler) -> HandlerId;

    /// Detach a previously attached handler
    fn remove_handler(&self, id: HandlerId);

    /// Install the hook fired if the connection dies after `open`.
    /// Sessions that cannot fail on their own may ignore it.
    fn on_exit(&self, _hook: ExitHook) {}

    /// Create one guild command
    async fn create_command(
        &self,
        guild_id: Id<GuildMarker>,
        command: &Command,
    ) -> Result<(), SessionError>;

    /// Replace all guild commands with the given set
    async fn overwrite_commands(
        &self,
        guild_id: Id<GuildMarker>,
        commands: &[Command],
    ) -> Result<(), SessionError>;

    /// Delete one guild command
    async fn delete_command(
        &self,
        guild_id: Id<GuildMarker>,
        command_id: Id<CommandMarker>,
    ) -> Result<(), SessionError>;

    /// Guilds this session currently receives events for
    fn guilds(&self) -> Vec<GuildSummary>;
}
