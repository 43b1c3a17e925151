//! Raid Mate Gateway - sharded Discord connection manager
//!
//! Connects every shard of the bot under the identify rate limit, logs
//! guild lifecycle events, exposes health/ready/metrics endpoints and
//! restarts the whole shard set on SIGHUP.

use anyhow::Result;
use raidmate_gateway::config::GatewayConfig;
use raidmate_gateway::health::{self, AppState};
use raidmate_gateway::metrics::{self, GatewayMetrics};
use raidmate_gateway::{EventHandler, Manager, ManagerError, RestartError, TwilightGateway};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use twilight_model::gateway::event::Event;

/// How often the guild gauge is refreshed
const GUILD_GAUGE_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let gateway_config = GatewayConfig::from_env()?;

    // Initialize tracing with configured log level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("raidmate_gateway={}", gateway_config.log_level).parse()?)
                .add_directive("twilight_gateway=info".parse()?)
                .add_directive("twilight_http=info".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        shard_count = ?gateway_config.shard_count,
        "Starting Raid Mate Gateway"
    );

    let gateway_metrics = GatewayMetrics::install()?;
    info!("Prometheus metrics initialized");

    let intents = gateway_config.intents.intents();
    info!(?intents, "Using Discord intents");

    let gateway = Arc::new(TwilightGateway::new(gateway_config.discord_token.clone()));
    let mut manager = Manager::with_config(gateway, gateway_config.manager_config()).await?;
    manager.set_intents(intents).await;
    if let Some(count) = gateway_config.shard_count {
        manager.set_shard_count(count).await;
    }
    manager.add_handlers([lifecycle_logger()]).await;

    // Health server comes up before start so /ready reports progress
    let (state_tx, state_rx) = watch::channel(manager.state());
    let health_router = health::router(AppState {
        shards: state_rx,
        metrics: gateway_metrics,
    });
    let addr: SocketAddr = ([0, 0, 0, 0], gateway_config.http_port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port = gateway_config.http_port, "Starting HTTP server");

    let mut http_server = tokio::spawn(async move { axum::serve(listener, health_router).await });

    let cancel = CancellationToken::new();
    let shutdown = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            cancel.cancel();
        }
    });

    let mut failure = None;
    match manager.start(&cancel).await {
        Ok(()) | Err(ManagerError::Cancelled) => {}
        Err(e) => {
            // Partially connected shards are shut down below.
            error!(error = %e, "Shard manager failed to start");
            failure = Some(anyhow::Error::from(e));
            cancel.cancel();
        }
    }

    let mut reload = reload_signal()?;
    let mut guild_gauge = tokio::time::interval(GUILD_GAUGE_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = &mut http_server => {
                let err = match result {
                    Ok(Ok(())) => anyhow::anyhow!("HTTP server stopped"),
                    Ok(Err(e)) => anyhow::Error::from(e),
                    Err(e) => anyhow::Error::from(e),
                };
                error!(error = %err, "HTTP server error");
                failure = Some(err);
                break;
            }
            _ = guild_gauge.tick() => {
                metrics::set_guilds(manager.guild_count().await);
            }
            Some(()) = reload.recv() => {
                info!("Reload signal received");
                match manager.restart(&cancel).await {
                    Ok(replacement) => {
                        manager = replacement;
                        state_tx.send_replace(manager.state());
                    }
                    Err(RestartError::StartFailed { source }) => {
                        error!(error = %source, "Restart aborted, keeping current shards");
                    }
                    Err(RestartError::ShutdownFailed { replacement, source }) => {
                        warn!(error = %source, "Previous shards did not shut down cleanly");
                        let previous = std::mem::replace(&mut manager, replacement);
                        state_tx.send_replace(manager.state());
                        if let Err(e) = previous.shutdown(&CancellationToken::new()).await {
                            error!(error = %e, "Retried shutdown of previous shards failed");
                        }
                    }
                }
            }
        }
    }

    // Graceful shutdown gets its own token; the main one is already cancelled
    info!("Shutting down gateway...");
    if let Err(e) = manager.shutdown(&CancellationToken::new()).await {
        error!(error = %e, "Shard shutdown incomplete");
    }

    shutdown.abort();
    http_server.abort();

    info!("Gateway shutdown complete");
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Handler logging shard readiness and guild availability
fn lifecycle_logger() -> EventHandler {
    EventHandler::new(|event| match event {
        Event::Ready(ready) => info!(
            shard = ?ready.shard,
            user = %ready.user.name,
            guilds = ready.guilds.len(),
            "Logged in"
        ),
        Event::GuildCreate(guild) => debug!(guild_id = %guild.id(), "Guild created"),
        _ => {}
    })
}

/// Stream of reload requests (SIGHUP)
#[cfg(unix)]
fn reload_signal() -> Result<tokio::sync::mpsc::Receiver<()>> {
    let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

#[cfg(not(unix))]
fn reload_signal() -> Result<tokio::sync::mpsc::Receiver<()>> {
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    std::mem::forget(tx);
    Ok(rx)
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
