//! Public surface tests
//!
//! Drives the manager through a gateway implemented outside the crate, the
//! way an embedding bot would, and checks routing and configuration parsing
//! as exported.

use async_trait::async_trait;
use raidmate_gateway::session::{HandlerId, ShardConnectParams};
use raidmate_gateway::{
    shard_for_guild, EventHandler, Gateway, GatewayConfig, GuildSummary, Manager, ManagerConfig,
    ManagerError, Session, ShardStatus, DM_SHARD,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use twilight_gateway::Intents;
use twilight_model::application::command::Command;
use twilight_model::id::marker::{CommandMarker, GuildMarker};
use twilight_model::id::Id;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Default)]
struct Recorder {
    params: Mutex<Vec<ShardConnectParams>>,
}

struct StaticGateway {
    shards: u32,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl Gateway for StaticGateway {
    type Session = StaticSession;

    fn token(&self) -> &str {
        "integration-token"
    }

    async fn recommended_shards(&self) -> Result<u32, BoxError> {
        Ok(self.shards)
    }

    fn session(&self, params: &ShardConnectParams) -> Result<StaticSession, BoxError> {
        self.recorder.params.lock().unwrap().push(params.clone());
        Ok(StaticSession {
            shard_id: params.shard_id,
            open: AtomicBool::new(false),
            next: AtomicU64::new(0),
            handlers: Mutex::new(HashMap::new()),
        })
    }
}

struct StaticSession {
    shard_id: u32,
    open: AtomicBool,
    next: AtomicU64,
    handlers: Mutex<HashMap<HandlerId, EventHandler>>,
}

#[async_trait]
impl Session for StaticSession {
    async fn open(&self) -> Result<(), BoxError> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn add_handler(&self, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next.fetch_add(1, Ordering::SeqCst));
        self.handlers.lock().unwrap().insert(id, handler);
        id
    }

    fn remove_handler(&self, id: HandlerId) {
        self.handlers.lock().unwrap().remove(&id);
    }

    async fn create_command(&self, _: Id<GuildMarker>, _: &Command) -> Result<(), BoxError> {
        Ok(())
    }

    async fn overwrite_commands(&self, _: Id<GuildMarker>, _: &[Command]) -> Result<(), BoxError> {
        Ok(())
    }

    async fn delete_command(
        &self,
        _: Id<GuildMarker>,
        _: Id<CommandMarker>,
    ) -> Result<(), BoxError> {
        Ok(())
    }

    fn guilds(&self) -> Vec<GuildSummary> {
        vec![GuildSummary {
            id: Id::new(u64::from(self.shard_id) + 1),
            shard_id: self.shard_id,
        }]
    }
}

fn fast_config() -> ManagerConfig {
    ManagerConfig {
        identify_interval: Duration::from_millis(10),
        ..ManagerConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_external_gateway_lifecycle() {
    let recorder = Arc::new(Recorder::default());
    let gateway = Arc::new(StaticGateway {
        shards: 3,
        recorder: Arc::clone(&recorder),
    });
    let cancel = CancellationToken::new();

    let manager = Manager::with_config(gateway, fast_config()).await.unwrap();
    manager.set_intents(Intents::GUILDS).await;
    manager.add_handlers([EventHandler::new(|_| {})]).await;
    manager.start(&cancel).await.unwrap();

    let params = recorder.params.lock().unwrap().clone();
    assert_eq!(params.len(), 3);
    for (expected, p) in params.iter().enumerate() {
        assert_eq!(p.shard_id, expected as u32);
        assert_eq!(p.shard_count, 3);
        assert_eq!(p.token, "Bot integration-token");
        assert_eq!(p.intents, Intents::GUILDS);
    }

    let state = manager.state();
    assert!(state.is_ready());
    assert_eq!(state.status(2), Some(ShardStatus::Connected));
    assert_eq!(manager.guild_count().await, 3);

    let dm = manager.session_for_dm().await.unwrap();
    assert_eq!(dm.shard_id, DM_SHARD);

    manager.shutdown(&cancel).await.unwrap();
    assert_eq!(state.connected_shards(), 0);
    manager.shutdown(&cancel).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_start_reports_cancellation() {
    let gateway = Arc::new(StaticGateway {
        shards: 2,
        recorder: Arc::default(),
    });
    let cancel = CancellationToken::new();
    cancel.cancel();

    let manager = Manager::with_config(gateway, fast_config()).await.unwrap();
    let err = manager.start(&cancel).await.unwrap_err();
    assert!(matches!(err, ManagerError::Cancelled));
}

#[test]
fn test_routing_matches_documented_formula() {
    let guild = Id::new(81_384_788_765_712_384);
    assert_eq!(shard_for_guild(guild, 4), 2);
    assert_eq!(shard_for_guild(guild, 1), 0);
}

#[test]
fn test_config_from_lookup() {
    let config = GatewayConfig::from_lookup(|key| match key {
        "DISCORD_TOKEN" => Some("token".to_string()),
        "SHARD_COUNT" => Some("2".to_string()),
        "INTENTS_PRIVILEGED" => Some("guilds,bogus".to_string()),
        _ => None,
    });
    assert!(config.is_err());

    let config = GatewayConfig::from_lookup(|key| match key {
        "DISCORD_TOKEN" => Some("token".to_string()),
        "SHARD_COUNT" => Some("2".to_string()),
        _ => None,
    })
    .unwrap();
    assert_eq!(config.shard_count, Some(2));
    assert_eq!(config.manager_config().connect_retry.max_attempts, 3);
}
