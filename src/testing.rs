//! In-memory gateway and session doubles for unit tests

use crate::session::{
    EventHandler, ExitHook, Gateway, GuildSummary, HandlerId, Session, SessionError, ShardConnectParams,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use twilight_model::application::command::Command;
use twilight_model::gateway::event::Event;
use twilight_model::id::marker::{CommandMarker, GuildMarker};
use twilight_model::id::Id;

fn failure(message: &str) -> SessionError {
    Box::new(std::io::Error::new(std::io::ErrorKind::Other, message.to_string()))
}

/// Handler that counts how many events it saw
pub fn counting_handler() -> (EventHandler, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let handler = EventHandler::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (handler, hits)
}

/// Minimal chat input command
pub fn command(name: &str) -> Command {
    serde_json::from_value(serde_json::json!({
        "type": 1,
        "name": name,
        "description": format!("{name} command"),
        "version": "1",
    }))
    .expect("valid command fixture")
}

#[derive(Debug, Default)]
struct Behaviour {
    /// Remaining open failures per shard
    open_failures: HashMap<u32, u32>,
    /// Close latency per shard
    close_delays: HashMap<u32, Duration>,
    /// Close failures per shard
    close_failures: HashMap<u32, u32>,
    /// Shards whose command calls fail
    command_failures: Vec<u32>,
    /// Guilds reported per shard
    guilds: HashMap<u32, Vec<u64>>,
}

/// Gateway double recording every session it hands out
#[derive(Debug, Clone)]
pub struct MockGateway {
    token: String,
    recommended: Result<u32, String>,
    behaviour: Arc<Mutex<Behaviour>>,
    sessions: Arc<Mutex<Vec<MockSession>>>,
    opens: Arc<Mutex<Vec<(u32, Instant)>>>,
    closes: Arc<Mutex<Vec<u32>>>,
}

impl MockGateway {
    pub fn new(recommended: u32) -> Self {
        Self {
            token: "secret".to_string(),
            recommended: Ok(recommended),
            behaviour: Arc::default(),
            sessions: Arc::default(),
            opens: Arc::default(),
            closes: Arc::default(),
        }
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = token.to_string();
        self
    }

    pub fn failing_query(mut self) -> Self {
        self.recommended = Err("gateway unavailable".to_string());
        self
    }

    /// The next `times` opens of `shard_id` fail
    pub fn fail_opens(&self, shard_id: u32, times: u32) {
        self.lock().open_failures.insert(shard_id, times);
    }

    /// The next `times` closes of `shard_id` fail
    pub fn fail_closes(&self, shard_id: u32, times: u32) {
        self.lock().close_failures.insert(shard_id, times);
    }

    pub fn delay_close(&self, shard_id: u32, delay: Duration) {
        self.lock().close_delays.insert(shard_id, delay);
    }

    pub fn fail_commands(&self, shard_id: u32) {
        self.lock().command_failures.push(shard_id);
    }

    pub fn serve_guilds(&self, shard_id: u32, guilds: &[u64]) {
        self.lock().guilds.insert(shard_id, guilds.to_vec());
    }

    /// Every session created so far, in creation order
    pub fn sessions(&self) -> Vec<MockSession> {
        self.sessions.lock().unwrap().clone()
    }

    /// Sessions that are currently open
    pub fn open_sessions(&self) -> Vec<MockSession> {
        self.sessions().into_iter().filter(|s| s.is_open()).collect()
    }

    /// Successful and failed open attempts as `(shard_id, when)`
    pub fn opens(&self) -> Vec<(u32, Instant)> {
        self.opens.lock().unwrap().clone()
    }

    /// Shard IDs in the order their close was attempted
    pub fn closes(&self) -> Vec<u32> {
        self.closes.lock().unwrap().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Behaviour> {
        self.behaviour.lock().unwrap()
    }
}

#[async_trait]
impl Gateway for MockGateway {
    type Session = MockSession;

    fn token(&self) -> &str {
        &self.token
    }

    async fn recommended_shards(&self) -> Result<u32, SessionError> {
        self.recommended.clone().map_err(|e| failure(&e))
    }

    fn session(&self, params: &ShardConnectParams) -> Result<MockSession, SessionError> {
        let session = MockSession {
            inner: Arc::new(SessionInner {
                params: params.clone(),
                open: AtomicBool::new(false),
                next_handler: AtomicU64::new(0),
                handlers: Mutex::new(Vec::new()),
                commands: Mutex::new(Vec::new()),
                exit_hook: Mutex::new(None),
                gateway: self.clone(),
            }),
        };
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

#[derive(Debug)]
struct SessionInner {
    params: ShardConnectParams,
    open: AtomicBool,
    next_handler: AtomicU64,
    handlers: Mutex<Vec<(HandlerId, EventHandler)>>,
    commands: Mutex<Vec<String>>,
    exit_hook: Mutex<Option<ExitHook>>,
    gateway: MockGateway,
}

/// Session double; clones share state
#[derive(Debug, Clone)]
pub struct MockSession {
    inner: Arc<SessionInner>,
}

impl MockSession {
    pub fn params(&self) -> &ShardConnectParams {
        &self.inner.params
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.lock().unwrap().len()
    }

    /// Whether this exact handler is attached
    pub fn has_handler(&self, handler: &EventHandler) -> bool {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .iter()
            .any(|(_, h)| h.same_callback(handler))
    }

    /// Deliver an event to every attached handler
    pub fn dispatch(&self, event: &Event) {
        let handlers: Vec<EventHandler> = self
            .inner
            .handlers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler.call(event);
        }
    }

    /// Simulate the connection dying on its own
    pub fn exit(&self, reason: &str) {
        self.inner.open.store(false, Ordering::SeqCst);
        let hook = self.inner.exit_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook.call(reason);
        }
    }

    /// Command requests seen, as `create:<name>`, `overwrite:<n>`, `delete:<id>`
    pub fn commands(&self) -> Vec<String> {
        self.inner.commands.lock().unwrap().clone()
    }

    fn shard_id(&self) -> u32 {
        self.inner.params.shard_id
    }

    fn command_result(&self, entry: String) -> Result<(), SessionError> {
        if self
            .inner
            .gateway
            .lock()
            .command_failures
            .contains(&self.shard_id())
        {
            return Err(failure("command rejected"));
        }
        self.inner.commands.lock().unwrap().push(entry);
        Ok(())
    }
}

fn take_failure(failures: &mut HashMap<u32, u32>, shard_id: u32) -> bool {
    match failures.get_mut(&shard_id) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

#[async_trait]
impl Session for MockSession {
    async fn open(&self) -> Result<(), SessionError> {
        let shard_id = self.shard_id();
        let gateway = &self.inner.gateway;
        gateway.opens.lock().unwrap().push((shard_id, Instant::now()));

        if take_failure(&mut gateway.lock().open_failures, shard_id) {
            return Err(failure("identify rejected"));
        }
        self.inner.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        let shard_id = self.shard_id();
        let gateway = &self.inner.gateway;
        gateway.closes.lock().unwrap().push(shard_id);

        let delay = gateway.lock().close_delays.get(&shard_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if take_failure(&mut gateway.lock().close_failures, shard_id) {
            return Err(failure("close frame rejected"));
        }
        self.inner.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn add_handler(&self, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::SeqCst));
        self.inner.handlers.lock().unwrap().push((id, handler));
        id
    }

    fn on_exit(&self, hook: ExitHook) {
        *self.inner.exit_hook.lock().unwrap() = Some(hook);
    }

    fn remove_handler(&self, id: HandlerId) {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .retain(|(handler_id, _)| *handler_id != id);
    }

    async fn create_command(
        &self,
        _guild_id: Id<GuildMarker>,
        command: &Command,
    ) -> Result<(), SessionError> {
        self.command_result(format!("create:{}", command.name))
    }

    async fn overwrite_commands(
        &self,
        _guild_id: Id<GuildMarker>,
        commands: &[Command],
    ) -> Result<(), SessionError> {
        self.command_result(format!("overwrite:{}", commands.len()))
    }

    async fn delete_command(
        &self,
        _guild_id: Id<GuildMarker>,
        command_id: Id<CommandMarker>,
    ) -> Result<(), SessionError> {
        self.command_result(format!("delete:{command_id}"))
    }

    fn guilds(&self) -> Vec<GuildSummary> {
        let shard_id = self.shard_id();
        self.inner
            .gateway
            .lock()
            .guilds
            .get(&shard_id)
            .map(|ids| {
                ids.iter()
                    .map(|&id| GuildSummary {
                        id: Id::new(id),
                        shard_id,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
