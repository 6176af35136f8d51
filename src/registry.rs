//! In-memory store of the servers currently alive in the group.
//!
//! Records are keyed by hostname and expire when they are not refreshed
//! within the registry TTL.  The store is shared between the transport
//! receive task, the cleanup sweep and the HTTP handlers, so the backing
//! collection only lives behind the lock.

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;

use crate::types::{unix_now, Discovery};

/// Channel carrying human readable log lines to the drain task.
pub type LogChannel = UnboundedSender<String>;

pub struct Registry {
    servers: RwLock<Vec<Discovery>>,
    log_channel: Option<LogChannel>,
    ttl: u64,
}

impl Registry {
    /// `ttl` of `0` falls back to the record default.
    pub fn new(ttl: u64, log_channel: Option<LogChannel>) -> Self {
        Self {
            servers: RwLock::new(Vec::new()),
            log_channel,
            ttl,
        }
    }

    fn log(&self, message: String) {
        if let Some(tx) = &self.log_channel {
            // Only fails once the drain task is gone, i.e. during shutdown.
            let _ = tx.send(message);
        }
    }

    /// Inserts a new server or refreshes an existing one, replacing its
    /// labels.  Returns the record as it was before this call.
    pub async fn add(&self, mut discovery: Discovery) -> Option<Discovery> {
        let now = unix_now();
        let mut servers = self.servers.write().await;

        if let Some(existing) = servers.iter_mut().find(|d| d.hostname == discovery.hostname) {
            let previous = existing.clone();
            existing.last_check = now;
            existing.labels = discovery.labels;
            return Some(previous);
        }

        discovery.last_check = now;
        let hostname = discovery.hostname.clone();
        servers.push(discovery);
        drop(servers);

        self.log(format!("{} registered", hostname));
        None
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn refresh(&self, hostname: &str) {
        let mut servers = self.servers.write().await;
        if let Some(existing) = servers.iter_mut().find(|d| d.hostname == hostname) {
            existing.last_check = unix_now();
        }
    }

    /// Removes the server, returns `false` when it wasn't registered.
    pub async fn delete(&self, hostname: &str) -> bool {
        let mut servers = self.servers.write().await;
        let before = servers.len();
        servers.retain(|d| d.hostname != hostname);
        let removed = servers.len() != before;
        drop(servers);

        if removed {
            self.log(format!("removing {}", hostname));
        }
        removed
    }

    pub async fn exist(&self, hostname: &str) -> bool {
        self.servers.read().await.iter().any(|d| d.hostname == hostname)
    }

    /// Returns the server or an empty record when it's not registered.
    /// Check [`Registry::exist`] first or test for an empty hostname.
    pub async fn get(&self, hostname: &str) -> Discovery {
        self.servers
            .read()
            .await
            .iter()
            .find(|d| d.hostname == hostname)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get_all(&self) -> Vec<Discovery> {
        self.servers.read().await.clone()
    }

    /// Servers carrying at least one of the given labels.  Returned copies
    /// only keep the matching labels.
    pub async fn filter(&self, labels: &[String]) -> Vec<Discovery> {
        self.project(|label| labels.iter().any(|l| l == label)).await
    }

    /// Same as [`Registry::filter`] but matches label prefixes.
    pub async fn filter_prefix(&self, prefixes: &[String]) -> Vec<Discovery> {
        self.project(|label| prefixes.iter().any(|p| label.starts_with(p.as_str())))
            .await
    }

    async fn project<F>(&self, matches: F) -> Vec<Discovery>
    where
        F: Fn(&str) -> bool,
    {
        self.servers
            .read()
            .await
            .iter()
            .filter_map(|discovery| {
                let labels: Vec<_> = discovery
                    .labels
                    .iter()
                    .filter(|l| matches(l.as_str()))
                    .cloned()
                    .collect();
                if labels.is_empty() {
                    return None;
                }
                Some(Discovery {
                    labels,
                    ..discovery.clone()
                })
            })
            .collect()
    }

    /// Hostnames of the servers carrying exactly `label`.
    pub async fn resolve(&self, label: &str) -> Vec<String> {
        self.filter(&[label.to_string()])
            .await
            .into_iter()
            .map(|d| d.hostname)
            .collect()
    }

    /// Evicts every server that is no longer alive and returns their
    /// hostnames.
    pub async fn clean(&self) -> Vec<String> {
        self.clean_at(unix_now()).await
    }

    async fn clean_at(&self, now: i64) -> Vec<String> {
        let mut servers = self.servers.write().await;
        let mut evicted = Vec::new();
        servers.retain_mut(|server| {
            server.ttl = self.ttl;
            if server.is_alive_at(now) {
                true
            } else {
                evicted.push(server.hostname.clone());
                false
            }
        });
        drop(servers);

        for hostname in &evicted {
            self.log(format!("{} not alive anymore", hostname));
        }
        evicted
    }
}

/// Forwards registry and driver log lines to the logger until every
/// sender is gone.
pub async fn drain_logs(mut rx: tokio::sync::mpsc::UnboundedReceiver<String>) {
    while let Some(message) = rx.recv().await {
        log::info!("{}", message);
    }
}
