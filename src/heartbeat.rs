//! Heartbeat: the only place this node's discovery packet is published.
//!
//! Publishing happens on a single task fed by a fixed interval and by
//! [`Trigger::fire`], so packets are never sent concurrently.  When the
//! shutdown flag flips the task sends one goodbye packet and exits.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::driver::Driver;
use crate::identity::LocalHost;

/// Asks the heartbeat task to publish now.  Requests made while one is
/// already pending collapse into it.
#[derive(Clone)]
pub struct Trigger {
    tx: mpsc::Sender<()>,
}

impl Trigger {
    pub fn fire(&self) {
        // Full means a publish is already pending, closed means the
        // heartbeat isn't running (standalone mode or shutting down).
        let _ = self.tx.try_send(());
    }
}

pub fn trigger() -> (Trigger, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (Trigger { tx }, rx)
}

/// Spawns the heartbeat task.
pub fn spawn_heartbeat(
    driver: Arc<dyn Driver>,
    local: Arc<LocalHost>,
    keep_alive: Duration,
    triggers: mpsc::Receiver<()>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_heartbeat(driver, local, keep_alive, triggers, shutdown))
}

pub async fn run_heartbeat(
    driver: Arc<dyn Driver>,
    local: Arc<LocalHost>,
    keep_alive: Duration,
    mut triggers: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(keep_alive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                // A dropped sender counts as shutdown.
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
            Some(()) = triggers.recv() => debug!("Discovery packet triggered"),
        }
        send_discovery(driver.as_ref(), &local).await;
    }

    info!("Sending goodbye packet");
    match local.get_identification().await {
        Ok(discovery) => {
            if let Err(e) = driver.send_goodbye_packet(&discovery).await {
                error!("sending goodbye packet error: {}", e);
            }
        }
        Err(e) => error!("sending goodbye identification error: {}", e),
    }
}

async fn send_discovery(driver: &dyn Driver, local: &LocalHost) {
    let discovery = match local.get_identification().await {
        Ok(discovery) => discovery,
        Err(e) => {
            error!("sending discovery identification error: {}", e);
            return;
        }
    };
    // Best effort, a missed packet is repaired by the next tick.
    if let Err(e) = driver.send_discovery_packet(&discovery).await {
        error!("sending discovery error: {}", e);
    }
}
