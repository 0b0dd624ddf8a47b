//! Crash Round Server
//!
//! Runs the round driver, settlement worker and WebSocket server until
//! Ctrl-C, then drains outstanding settlements.

use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crash_round::{
    VERSION,
    config::AppConfig,
    fairness::ServerSecret,
    game::machine::RoundMachine,
    network::{BroadcastGateway, GameServer, RoundDriver},
    settlement::{InMemoryLedger, SettlementConnector, spawn_settlement_worker},
};

/// How long pending settlements may take after shutdown.
const SETTLEMENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

fn init_tracing() {
    let default_level = if cfg!(feature = "debug-tracing") { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env().context("invalid configuration")?;

    info!("Crash Round Server v{}", VERSION);
    info!(
        wait_secs = config.round.wait_duration.as_secs(),
        cooldown_secs = config.round.cooldown.as_secs(),
        house_edge_bps = config.round.crash.house_edge_bps,
        max_multiplier = %config.round.crash.max_multiplier,
        "Round settings"
    );

    let secret = match config.server_secret.clone() {
        Some(secret) => secret,
        None => {
            warn!("CRASH_SERVER_SECRET not set, using a random master secret for this run");
            ServerSecret::generate()
        }
    };
    if !config.auth.is_configured() {
        warn!("No AUTH_SECRET or AUTH_PUBLIC_KEY_PEM set, every auth attempt will fail");
    }

    let ledger = InMemoryLedger::new(config.dev_starting_balance);
    let (shutdown_tx, _) = broadcast::channel(4);

    // Settlement worker
    let (job_tx, job_rx) = mpsc::unbounded_channel();
    let worker = spawn_settlement_worker(
        SettlementConnector::new(ledger.clone(), config.retry),
        job_rx,
    );

    // Round driver
    let machine = RoundMachine::new(config.round.clone(), secret, Instant::now());
    let (round, driver_task) = RoundDriver::spawn(
        machine,
        job_tx,
        config.driver.clone(),
        shutdown_tx.subscribe(),
    );

    // Gateway and server
    let gateway = Arc::new(BroadcastGateway::new(
        round,
        ledger,
        config.auth.clone(),
        config.server.version.clone(),
    ));
    let fanout = gateway.spawn_fanout();
    let server = Arc::new(GameServer::new(config.server.clone(), gateway, shutdown_tx.clone()));
    let mut server_task = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    let server_finished = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            info!("Ctrl-C received, shutting down");
            false
        }
        result = &mut server_task => {
            result.context("server task panicked")?.context("server stopped")?;
            true
        }
    };

    server.shutdown();
    if !server_finished {
        let _ = server_task.await;
    }
    let _ = driver_task.await;
    fanout.abort();

    // The driver held the only job sender; the worker exits once drained.
    if timeout(SETTLEMENT_DRAIN_TIMEOUT, worker).await.is_err() {
        warn!("Settlement worker did not drain in time");
    }

    info!("Shutdown complete");
    Ok(())
}
