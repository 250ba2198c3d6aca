// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SinkMix Daemon - hosts the mixing engine with null output sinks.
//!
//! Sinks come from `daemon.toml` in the per-user config directory. Each one
//! renders its streams at device pace on its own IO thread; the main task
//! dispatches IO-thread notices and suspends sinks nobody uses.

mod config;
mod null_sink;
mod service;

use std::time::Instant;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

const TICK_INTERVAL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sinkmix=debug".parse()?)
                .add_directive("sinkmix_daemon=debug".parse()?),
        )
        .init();

    info!("SinkMix Daemon starting...");

    let config_manager = config::ConfigManager::new()?;
    let daemon_config = match config_manager.load() {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config, using defaults: {}", e);
            config::DaemonConfig::default()
        }
    };

    let mut service = service::DaemonService::new(&daemon_config);
    let created = service.create_sinks(&daemon_config);
    if created == 0 && !daemon_config.sinks.is_empty() {
        error!("No sink could be created");
        return Err("no sink could be created".into());
    }
    for sink in service.core().sinks() {
        info!("Sink {} \"{}\" ({})", sink.index(), sink.name(), sink.state());
    }
    info!("SinkMix Daemon ready with {} sinks", created);

    let mut ticker = interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Handle shutdown signals
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            _ = ticker.tick() => service.tick(Instant::now()),
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
        }
    }

    service.shutdown();
    info!("SinkMix Daemon stopped");
    Ok(())
}
