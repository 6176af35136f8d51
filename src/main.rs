//! Lobby daemon entry point.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::FutureExt;
use log::{error, info};
use tokio::signal;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::interval;

mod api;
mod callback;
mod config;
mod driver;
mod heartbeat;
mod identity;
mod prometheus;
mod registry;
mod types;

use api::ApiState;
use callback::{run_callback_loop, shutdown_signalled, CallbackRunner, ChangeDetector};
use config::Config;
use driver::{Driver, Listener};
use heartbeat::spawn_heartbeat;
use identity::LocalHost;
use registry::{drain_logs, Registry};
use types::Discovery;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!(
        "Starting lobby daemon (driver: {:?}, register: {}, api: {}:{})",
        cfg.driver, cfg.register, cfg.host, cfg.port
    );

    // Registry and driver log lines, drained before anything can write
    let (log_tx, log_rx) = mpsc::unbounded_channel();
    let log_handle = tokio::spawn(drain_logs(log_rx));

    // Shared state
    let registry = Arc::new(Registry::new(cfg.ttl, Some(log_tx.clone())));
    let changes = ChangeDetector::new();
    let local = Arc::new(LocalHost::new(
        cfg.hostname.clone(),
        cfg.initial_labels(),
        &cfg.labels_path,
        cfg.runtime_labels_filename.clone(),
    ));

    // Transport
    let mut driver = driver::from_config(&cfg, log_tx);
    driver.register_subscribe_function(on_hi(registry.clone(), changes.clone()));
    driver.register_unsubscribe_function(on_goodbye(registry.clone(), changes.clone()));
    let driver: Arc<dyn Driver> = Arc::from(driver);
    driver
        .init()
        .await
        .context("Failed to connect to the discovery channel")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Cleanup sweep
    let clean_handle = tokio::spawn(clean_loop(
        registry.clone(),
        changes.clone(),
        Duration::from_secs(cfg.clean_every),
        shutdown_rx.clone(),
    ));

    // Heartbeat
    let (trigger, triggers) = heartbeat::trigger();
    let heartbeat_handle = if cfg.register {
        Some(spawn_heartbeat(
            driver.clone(),
            local.clone(),
            Duration::from_secs(cfg.keep_alive),
            triggers,
            shutdown_rx.clone(),
        ))
    } else {
        info!("Registration disabled, running as an observer");
        None
    };

    // Change callback
    let callback_handle = if cfg.callback.is_empty() {
        None
    } else {
        let runner = CallbackRunner::new(cfg.callback.clone(), registry.clone(), changes.clone());
        Some(tokio::spawn(run_callback_loop(
            runner,
            Duration::from_secs(cfg.callback_first_run_delay),
            Duration::from_secs(cfg.callback_cooldown),
            shutdown_rx.clone(),
        )))
    };

    // API
    let (api_stop_tx, api_stop_rx) = oneshot::channel::<()>();
    let api_handle = if cfg.disable_api {
        None
    } else {
        let addr = SocketAddr::new(
            cfg.host
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid API host {}", cfg.host))?,
            cfg.port,
        );
        let state = ApiState {
            registry: registry.clone(),
            local: local.clone(),
            trigger,
            node_exporter_port: cfg.node_exporter_port,
            token: cfg.token.clone(),
        };
        Some(tokio::spawn(async move {
            let stop = api_stop_rx.map(|_| ());
            if let Err(e) = api::serve(addr, state, stop).await {
                error!("API server failed: {}", e);
            }
        }))
    };

    // Graceful Shutdown
    match wait_for_signal().await {
        Ok(name) => {
            info!("{} signal received, sending goodbye packet", name);
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }
    let _ = shutdown_tx.send(true);

    if let Some(handle) = heartbeat_handle {
        let _ = handle.await;
    }
    // Give the goodbye packet time to reach the other nodes
    tokio::time::sleep(Duration::from_secs(cfg.shutdown_grace)).await;

    let _ = api_stop_tx.send(());
    if let Some(handle) = api_handle {
        let _ = handle.await;
    }
    if let Some(handle) = callback_handle {
        let _ = handle.await;
    }
    let _ = clean_handle.await;

    if let Err(e) = driver.close().await {
        error!("Closing driver failed: {}", e);
    }
    log_handle.abort();

    info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        res = signal::ctrl_c() => res.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    signal::ctrl_c().await.map(|_| "Ctrl+C")
}

/// Listener for `hi` packets: registers or refreshes the peer.
fn on_hi(registry: Arc<Registry>, changes: ChangeDetector) -> Listener {
    Arc::new(move |mut discovery: Discovery| {
        let registry = registry.clone();
        let changes = changes.clone();
        async move {
            discovery.sort_labels();
            let previous = registry.add(discovery.clone()).await;
            changes.observe(previous.as_ref(), &discovery);
        }
        .boxed()
    })
}

/// Listener for `goodbye` packets: forgets the peer.
fn on_goodbye(registry: Arc<Registry>, changes: ChangeDetector) -> Listener {
    Arc::new(move |discovery: Discovery| {
        let registry = registry.clone();
        let changes = changes.clone();
        async move {
            if registry.delete(&discovery.hostname).await {
                changes.mark();
            }
        }
        .boxed()
    })
}

/// Evicts dead peers every `every` until shutdown.
async fn clean_loop(
    registry: Arc<Registry>,
    changes: ChangeDetector,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_signalled(&mut shutdown) => break,
        }
        if !registry.clean().await.is_empty() {
            changes.mark();
        }
    }
}
