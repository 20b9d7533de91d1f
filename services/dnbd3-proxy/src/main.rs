//! dnbd3 Proxy
//!
//! Caches remote disk images on local storage and re-exports them to
//! clients over the dnbd3 wire protocol, filling cache misses from an
//! upstream alt-server when running in proxy mode.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dnbd3_proxy::actors::{RestartPolicy, Supervisor};
use dnbd3_proxy::config::alt_servers::parse_alt_servers_file;
use dnbd3_proxy::{Config, IntegrityHandle, Reaper, Server};
use dnbd3_proxy::altserver::AltServerRegistry;
use dnbd3_proxy::image::ImageRegistry;

/// How often the disk-space reaper checks free space.
const REAP_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Free-space floor the reaper tries to maintain.
const LOW_WATER_MARK_BYTES: u64 = 4 * 1024 * 1024 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting dnbd3 proxy");

    let config = Arc::new(Config::from_env()?);
    info!(
        base_path = %config.base_path.display(),
        listen_address = %config.listen_address,
        is_proxy = config.is_proxy,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut supervisor = Supervisor::new(RestartPolicy::default(), shutdown_rx.clone());
    let integrity = IntegrityHandle::spawn(&mut supervisor);

    let registry = Arc::new(ImageRegistry::new(config.clone(), integrity.clone()));
    match registry.reload(&config.base_path).await {
        Ok(loaded) => info!(loaded, "initial image scan complete"),
        Err(err) => tracing::warn!(error = %err, "initial image scan failed"),
    }

    let altservers = Arc::new(AltServerRegistry::new());
    match parse_alt_servers_file(&config.alt_servers_path()) {
        Ok(lines) => {
            let count = lines.len();
            altservers.load(lines).await;
            info!(count, "alt-servers file loaded");
        }
        Err(err) => tracing::warn!(error = %err, "failed to load alt-servers file"),
    }

    let reaper = Arc::new(Reaper::new(registry.clone(), config.clone()));
    tokio::spawn(reaper.run_loop(REAP_CHECK_INTERVAL, LOW_WATER_MARK_BYTES, shutdown_rx.clone()));

    let server = Server::new(registry, altservers, config, integrity);
    let server_task = tokio::spawn(server.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    server_task.await??;
    supervisor.stop_all().await;
    Ok(())
}
