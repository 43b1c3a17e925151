//! Twilight-backed gateway sessions
//!
//! Each session runs its shard's event loop on its own task: events are
//! dispatched to attached handlers and guild membership is tracked from
//! READY, GUILD_CREATE and GUILD_DELETE. `open` resolves once READY
//! arrives.

use super::{
    EventHandler, ExitHook, Gateway, GuildSummary, HandlerId, Session, SessionError,
    ShardConnectParams,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use twilight_gateway::error::ReceiveMessageErrorType;
use twilight_gateway::{CloseFrame, Config, EventTypeFlags, MessageSender, Shard, StreamExt as _};
use twilight_http::Client;
use twilight_model::application::command::Command;
use twilight_model::gateway::event::Event;
use twilight_model::gateway::ShardId;
use twilight_model::id::marker::{ApplicationMarker, CommandMarker, GuildMarker};
use twilight_model::id::Id;

/// How long `open` waits for READY before giving up
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Receive errors in a row after which the shard is given up
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

type Handlers = Arc<RwLock<Vec<(HandlerId, EventHandler)>>>;
type Guilds = Arc<DashMap<Id<GuildMarker>, GuildSummary>>;

/// Discord gateway backed by twilight
#[derive(Debug, Clone)]
pub struct TwilightGateway {
    token: String,
    http: Arc<Client>,
    application_id: Arc<OnceCell<Id<ApplicationMarker>>>,
}

impl TwilightGateway {
    pub fn new(token: String) -> Self {
        Self {
            http: Arc::new(Client::new(token.clone())),
            token,
            application_id: Arc::new(OnceCell::new()),
        }
    }
}

#[async_trait]
impl Gateway for TwilightGateway {
    type Session = TwilightSession;

    fn token(&self) -> &str {
        &self.token
    }

    async fn recommended_shards(&self) -> Result<u32, SessionError> {
        let info = self.http.gateway().authed().await?.model().await?;
        debug!(
            shards = info.shards,
            remaining = info.session_start_limit.remaining,
            "Fetched gateway bot info"
        );
        Ok(info.shards)
    }

    fn session(&self, params: &ShardConnectParams) -> Result<TwilightSession, SessionError> {
        let shard_id = ShardId::new_checked(params.shard_id, params.shard_count).ok_or_else(|| {
            format!(
                "shard {} is out of range for {} shards",
                params.shard_id, params.shard_count
            )
        })?;

        Ok(TwilightSession {
            shard_id,
            config: Config::new(params.token.clone(), params.intents),
            http: Arc::clone(&self.http),
            application_id: Arc::clone(&self.application_id),
            handlers: Handlers::default(),
            next_handler: AtomicU64::new(0),
            guilds: Guilds::default(),
            exit_hook: StdMutex::new(None),
            running: Mutex::new(None),
        })
    }
}

/// Aborts the event loop task when dropped
#[derive(Debug)]
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug)]
struct Running {
    sender: MessageSender,
    closing: CancellationToken,
    task: AbortOnDrop,
}

/// One twilight shard connection
pub struct TwilightSession {
    shard_id: ShardId,
    config: Config,
    http: Arc<Client>,
    application_id: Arc<OnceCell<Id<ApplicationMarker>>>,
    handlers: Handlers,
    next_handler: AtomicU64,
    guilds: Guilds,
    exit_hook: StdMutex<Option<ExitHook>>,
    running: Mutex<Option<Running>>,
}

impl TwilightSession {
    async fn application_id(&self) -> Result<Id<ApplicationMarker>, SessionError> {
        self.application_id
            .get_or_try_init(|| async {
                let application = self.http.current_user_application().await?.model().await?;
                Ok::<_, SessionError>(application.id)
            })
            .await
            .copied()
    }
}

#[async_trait]
impl Session for TwilightSession {
    async fn open(&self) -> Result<(), SessionError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(format!("shard {} session is already open", self.shard_id.number()).into());
        }

        let shard = Shard::with_config(self.shard_id, self.config.clone());
        let sender = shard.sender();
        let closing = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = AbortOnDrop(tokio::spawn(run_events(
            shard,
            EventLoop {
                handlers: Arc::clone(&self.handlers),
                guilds: Arc::clone(&self.guilds),
                closing: closing.clone(),
                ready: Some(ready_tx),
                exit_hook: self
                    .exit_hook
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone(),
            },
        )));

        match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(reason))) => return Err(reason.into()),
            Ok(Err(_)) => return Err("event loop stopped before READY".into()),
            Err(_) => return Err(format!("no READY within {READY_TIMEOUT:?}").into()),
        }

        *running = Some(Running {
            sender,
            closing,
            task,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        let Some(mut running) = self.running.lock().await.take() else {
            return Ok(());
        };

        running.closing.cancel();
        if let Err(e) = running.sender.close(CloseFrame::NORMAL) {
            debug!(shard_id = self.shard_id.number(), error = %e, "Event loop already gone");
        }

        (&mut running.task.0).await?;
        self.guilds.clear();
        Ok(())
    }

    fn add_handler(&self, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        id
    }

    fn remove_handler(&self, id: HandlerId) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(handler_id, _)| *handler_id != id);
    }

    fn on_exit(&self, hook: ExitHook) {
        *self.exit_hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Discord treats command creation as an upsert by name, so this is a
    /// read-modify-write of the guild's command set.
    async fn create_command(
        &self,
        guild_id: Id<GuildMarker>,
        command: &Command,
    ) -> Result<(), SessionError> {
        let interaction = self.http.interaction(self.application_id().await?);

        let mut commands = interaction.guild_commands(guild_id).await?.models().await?;
        match commands
            .iter_mut()
            .find(|c| c.name == command.name && c.kind == command.kind)
        {
            Some(existing) => *existing = command.clone(),
            None => commands.push(command.clone()),
        }

        interaction.set_guild_commands(guild_id, &commands).await?;
        Ok(())
    }

    async fn overwrite_commands(
        &self,
        guild_id: Id<GuildMarker>,
        commands: &[Command],
    ) -> Result<(), SessionError> {
        let interaction = self.http.interaction(self.application_id().await?);
        interaction.set_guild_commands(guild_id, commands).await?;
        Ok(())
    }

    async fn delete_command(
        &self,
        guild_id: Id<GuildMarker>,
        command_id: Id<CommandMarker>,
    ) -> Result<(), SessionError> {
        let interaction = self.http.interaction(self.application_id().await?);
        interaction.delete_guild_command(guild_id, command_id).await?;
        Ok(())
    }

    fn guilds(&self) -> Vec<GuildSummary> {
        self.guilds.iter().map(|e| e.value().clone()).collect()
    }
}

struct EventLoop {
    handlers: Handlers,
    guilds: Guilds,
    closing: CancellationToken,
    ready: Option<oneshot::Sender<Result<(), String>>>,
    exit_hook: Option<ExitHook>,
}

impl EventLoop {
    fn signal_ready(&mut self, result: Result<(), String>) {
        if let Some(tx) = self.ready.take() {
            let _ = tx.send(result);
        }
    }

    /// Report how the loop ended: to `open` if READY never arrived,
    /// otherwise to the exit hook unless the session is being closed.
    fn finish(mut self, shard_id: u32, reason: String) {
        if let Some(tx) = self.ready.take() {
            let _ = tx.send(Err(reason));
            return;
        }
        if self.closing.is_cancelled() {
            return;
        }

        error!(shard_id, reason = %reason, "Shard session lost");
        self.guilds.clear();
        if let Some(hook) = &self.exit_hook {
            hook.call(&reason);
        }
    }

    fn track_guild(&self, shard_id: u32, guild_id: Id<GuildMarker>) {
        self.guilds.insert(
            guild_id,
            GuildSummary {
                id: guild_id,
                shard_id,
            },
        );
    }

    fn dispatch(&self, event: &Event) {
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, h)| h.clone())
            .collect();

        for handler in handlers {
            handler.call(event);
        }
    }
}

/// Run a single shard's event loop
async fn run_events(mut shard: Shard, mut ctx: EventLoop) {
    let shard_id = shard.id().number();
    let mut consecutive_errors: u32 = 0;

    while let Some(item) = shard.next_event(EventTypeFlags::all()).await {
        let event = match item {
            Ok(Event::GatewayClose(_)) if ctx.closing.is_cancelled() => break,
            Ok(event) => {
                consecutive_errors = 0;
                event
            }
            Err(source) => {
                consecutive_errors += 1;
                warn!(shard_id, error = %source, consecutive = consecutive_errors, "Error receiving event");

                if matches!(source.kind(), ReceiveMessageErrorType::Reconnect) {
                    error!(shard_id, "Fatal gateway error (reconnect failed)");
                    ctx.finish(shard_id, format!("reconnect failed: {source}"));
                    return;
                }

                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    error!(
                        shard_id,
                        consecutive = consecutive_errors,
                        "Shard dead: consecutive error threshold exceeded"
                    );
                    ctx.finish(
                        shard_id,
                        format!("{consecutive_errors} consecutive receive errors"),
                    );
                    return;
                }
                continue;
            }
        };

        match &event {
            Event::Ready(ready) => {
                ctx.guilds.clear();
                for guild in &ready.guilds {
                    ctx.track_guild(shard_id, guild.id);
                }
                info!(
                    shard_id,
                    guilds = ready.guilds.len(),
                    session_id = %ready.session_id,
                    "Shard ready"
                );
                ctx.signal_ready(Ok(()));
            }
            Event::Resumed => {
                info!(shard_id, "Shard resumed");
            }
            Event::GuildCreate(guild) => {
                ctx.track_guild(shard_id, guild.id());
                debug!(shard_id, guild_id = %guild.id(), "Guild available");
            }
            Event::GuildDelete(guild) => {
                // Unavailable guilds are outages, not departures.
                if guild.unavailable != Some(true) {
                    ctx.guilds.remove(&guild.id);
                }
                debug!(shard_id, guild_id = %guild.id, "Guild left");
            }
            _ => {}
        }

        ctx.dispatch(&event);
    }

    info!(shard_id, "Shard event stream ended");
    ctx.finish(shard_id, "gateway event stream ended".to_string());
}
