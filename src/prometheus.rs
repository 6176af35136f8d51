//! Prometheus HTTP service discovery view of the registry.
//!
//! Peers opt in with labels in the `prometheus:<job>:` namespace:
//!
//! * `prometheus:<job>:port:<port>` overrides the default exporter port,
//!   `-` omits the port entirely,
//! * `prometheus:<job>:host:<host>` adds a target host,
//! * `prometheus:<job>:<key>:<value>` becomes a Prometheus label,
//! * a bare `prometheus:<job>` includes the peer even without other keys.
//!
//! Targets only come from `host` keys, a peer without one is listed with
//! no targets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::Discovery;

/// One target group in the format Prometheus expects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrometheusService {
    pub targets: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

pub fn prepare_prometheus_output(
    job: &str,
    default_port: u16,
    discoveries: &[Discovery],
) -> Vec<PrometheusService> {
    let bare = format!("prometheus:{}", job);
    let prefix = format!("{}:", bare);
    let mut services = Vec::new();

    for discovery in discoveries {
        let mut port = default_port.to_string();
        let mut hosts = Vec::new();
        let mut labels = BTreeMap::new();
        let mut include = false;

        for label in discovery.find_labels_by_prefix(&prefix) {
            let rest = &label.as_str()[prefix.len()..];
            let Some((key, value)) = rest.split_once(':') else {
                continue;
            };
            match key {
                "port" => port = value.to_string(),
                "host" => hosts.push(value.to_string()),
                _ => {
                    labels.insert(key.to_string(), value.to_string());
                }
            }
            include = true;
        }

        if !include {
            include = discovery.labels.iter().any(|l| l.as_str() == bare);
        }
        if !include {
            continue;
        }

        let targets = hosts
            .into_iter()
            .map(|host| {
                if host.contains(':') || port == "-" {
                    host
                } else {
                    format!("{}:{}", host, port)
                }
            })
            .collect();

        services.push(PrometheusService { targets, labels });
    }

    services
}
