//! A single shard: one session slot plus the handlers bound to it

use crate::error::ManagerError;
use crate::session::{
    EventHandler, ExitHook, Gateway, GuildSummary, HandlerId, Session, ShardConnectParams,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use twilight_model::application::command::Command;
use twilight_model::id::marker::{CommandMarker, GuildMarker};
use twilight_model::id::Id;

const TOKEN_PREFIX: &str = "Bot ";

/// Handler registered on a shard; `attachment` is set while it is bound to
/// the live session and cleared when it is only queued.
#[derive(Debug, Clone)]
struct Registration {
    handler: EventHandler,
    attachment: Option<HandlerId>,
}

#[derive(Debug)]
struct Slot<S> {
    session: Option<Arc<S>>,
    handlers: Vec<Registration>,
    exit_hook: Option<ExitHook>,
}

/// One logical connection to the gateway.
///
/// Safe for simultaneous use by multiple tasks.
#[derive(Debug)]
pub struct Shard<S: Session> {
    id: u32,
    slot: Mutex<Slot<S>>,
}

impl<S: Session> Shard<S> {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            slot: Mutex::new(Slot {
                session: None,
                handlers: Vec::new(),
                exit_hook: None,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Hook handed to every session this shard opens from now on
    pub async fn on_exit(&self, hook: ExitHook) {
        self.slot.lock().await.exit_hook = Some(hook);
    }

    /// Open a session for this shard.
    ///
    /// Fails with [`ManagerError::AlreadyConnected`] if a session is already
    /// present. Queued handlers are attached before the connection opens.
    /// The session is only kept once `open` succeeds.
    pub async fn connect<G>(&self, gateway: &G, params: ShardConnectParams) -> Result<(), ManagerError>
    where
        G: Gateway<Session = S>,
    {
        let mut slot = self.slot.lock().await;

        if slot.session.is_some() {
            return Err(ManagerError::AlreadyConnected { shard_id: self.id });
        }

        let params = ShardConnectParams {
            token: normalize_token(&params.token),
            ..params
        };

        let session = gateway
            .session(&params)
            .map_err(|source| ManagerError::Session {
                shard_id: self.id,
                source,
            })?;

        let attachments: Vec<HandlerId> = slot
            .handlers
            .iter()
            .map(|r| session.add_handler(r.handler.clone()))
            .collect();

        if let Some(hook) = &slot.exit_hook {
            session.on_exit(hook.clone());
        }

        if let Err(source) = session.open().await {
            for id in attachments {
                session.remove_handler(id);
            }
            return Err(ManagerError::Session {
                shard_id: self.id,
                source,
            });
        }

        for (registration, id) in slot.handlers.iter_mut().zip(attachments) {
            registration.attachment = Some(id);
        }
        slot.session = Some(Arc::new(session));

        info!(
            shard_id = self.id,
            shard_count = params.shard_count,
            handlers = slot.handlers.len(),
            "Shard connected"
        );
        Ok(())
    }

    /// Close this shard's session.
    ///
    /// Fails with [`ManagerError::NotConnected`] if there is no session. On
    /// success the slot is cleared and handlers go back to the queue, so the
    /// shard can be connected again.
    pub async fn disconnect(&self) -> Result<(), ManagerError> {
        let mut slot = self.slot.lock().await;

        let Some(session) = slot.session.as_ref() else {
            return Err(ManagerError::NotConnected { shard_id: self.id });
        };

        session.close().await.map_err(|source| ManagerError::Session {
            shard_id: self.id,
            source,
        })?;

        slot.session = None;
        for registration in &mut slot.handlers {
            registration.attachment = None;
        }

        info!(shard_id = self.id, "Shard disconnected");
        Ok(())
    }

    /// Register handlers; attached live if connected, queued otherwise.
    pub async fn add_handlers(&self, handlers: &[EventHandler]) {
        let mut slot = self.slot.lock().await;
        let session = slot.session.clone();

        for handler in handlers {
            let attachment = session.as_ref().map(|s| s.add_handler(handler.clone()));
            slot.handlers.push(Registration {
                handler: handler.clone(),
                attachment,
            });
        }

        debug!(
            shard_id = self.id,
            added = handlers.len(),
            live = session.is_some(),
            "Handlers registered"
        );
    }

    /// Detach and forget every handler.
    pub async fn remove_handlers(&self) {
        let mut slot = self.slot.lock().await;
        let registrations = std::mem::take(&mut slot.handlers);

        if let Some(session) = slot.session.as_ref() {
            for id in registrations.iter().filter_map(|r| r.attachment) {
                session.remove_handler(id);
            }
        }

        debug!(shard_id = self.id, removed = registrations.len(), "Handlers removed");
    }

    /// Number of handlers registered on this shard.
    pub async fn handler_count(&self) -> usize {
        self.slot.lock().await.handlers.len()
    }

    /// Number of handlers currently bound to a live session.
    pub async fn attached_handler_count(&self) -> usize {
        self.slot
            .lock()
            .await
            .handlers
            .iter()
            .filter(|r| r.attachment.is_some())
            .count()
    }

    /// The live session, if connected.
    pub async fn session(&self) -> Option<Arc<S>> {
        self.slot.lock().await.session.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.slot.lock().await.session.is_some()
    }

    /// Create a guild command through this shard. No-op when disconnected.
    pub async fn register_command(
        &self,
        guild_id: Id<GuildMarker>,
        command: &Command,
    ) -> Result<(), ManagerError> {
        let Some(session) = self.session().await else {
            return Ok(());
        };
        session
            .create_command(guild_id, command)
            .await
            .map_err(|source| ManagerError::Session {
                shard_id: self.id,
                source,
            })
    }

    /// Overwrite all guild commands through this shard. No-op when disconnected.
    pub async fn register_commands_overwrite(
        &self,
        guild_id: Id<GuildMarker>,
        commands: &[Command],
    ) -> Result<(), ManagerError> {
        let Some(session) = self.session().await else {
            return Ok(());
        };
        session
            .overwrite_commands(guild_id, commands)
            .await
            .map_err(|source| ManagerError::Session {
                shard_id: self.id,
                source,
            })
    }

    /// Delete a guild command through this shard. No-op when disconnected.
    pub async fn delete_command(
        &self,
        guild_id: Id<GuildMarker>,
        command_id: Id<CommandMarker>,
    ) -> Result<(), ManagerError> {
        let Some(session) = self.session().await else {
            return Ok(());
        };
        session
            .delete_command(guild_id, command_id)
            .await
            .map_err(|source| ManagerError::Session {
                shard_id: self.id,
                source,
            })
    }

    /// Guilds served by this shard; empty when disconnected.
    pub async fn guilds(&self) -> Vec<GuildSummary> {
        self.session()
            .await
            .map(|s| s.guilds())
            .unwrap_or_default()
    }
}

/// Prefix the token with the bot authorization scheme if it is missing.
pub fn normalize_token(token: &str) -> String {
    if token.starts_with(TOKEN_PREFIX) {
        token.to_string()
    } else {
        format!("{TOKEN_PREFIX}{token}")
    }
}
