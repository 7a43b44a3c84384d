// FX Sniper binary - config -> logging -> supervisor -> engine

use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use fx_sniper::core::{setup_logging, system_clock, ConfigManager, EventBus};
use fx_sniper::engine::{Engine, EngineError, SignalState, Supervisor};
use fx_sniper::Cli;

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    let cli = Cli::parse();

    let config = Arc::new(ConfigManager::new(cli.config.as_deref())?);
    let monitoring = config.monitoring();
    let log_level = cli.log_level.clone().unwrap_or(monitoring.log_level.clone());
    setup_logging(Some(&log_level), Some(monitoring.json_logs), Some(true));

    let summary = config.get_summary();
    info!(
        symbols = ?summary.symbols,
        feed = %summary.feed_url,
        min_confidence = summary.min_confidence,
        scan_interval_secs = summary.scan_interval_secs,
        "Starting fx-sniper"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received, shutting down"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        let _ = shutdown_tx.send(true);
    });

    let events = Arc::new(EventBus::new());
    let clock = system_clock();
    let supervisor = Supervisor::new(&config.supervisor()).with_event_bus(events.clone());
    // Built once so cooldowns, thresholds and delayed signals survive restarts
    let state = SignalState::new(&config, events.clone());

    let engine_rx = shutdown_rx.clone();
    let result = supervisor
        .run(
            |run| {
                let config = config.clone();
                let events = events.clone();
                let clock = clock.clone();
                let state = state.clone();
                let snapshot = cli.snapshot.clone();
                let rx = engine_rx.clone();
                async move {
                    let mut engine = Engine::with_state(config, events, clock, state)?;
                    if let Some(path) = snapshot {
                        engine = engine.with_snapshot_path(path);
                    }
                    let restored = engine.warm_start();
                    info!(run, restored, "Engine warm-started");
                    engine.run(rx).await
                }
            },
            shutdown_rx,
        )
        .await;

    match &result {
        Ok(()) => info!(stats = %supervisor.get_stats(), "fx-sniper stopped"),
        Err(e) => error!(error = %e, stats = %supervisor.get_stats(), "fx-sniper stopped after failure"),
    }
    result
}
