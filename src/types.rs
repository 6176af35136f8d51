//! Data structures used throughout the lobby daemon.
//!
//! These types are serialised using [`serde`](https://serde.rs/) and
//! broadcast over the discovery channel.  A [`Discovery`] describes one
//! server (hostname plus free-form labels) and an [`Envelope`] wraps it
//! with a message saying whether the server is announcing itself or
//! leaving the group.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Liveness window used when neither the record nor the registry sets one.
pub const DEFAULT_TTL: u64 = 60;

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// One piece of information about a server, conventionally
/// `namespace:value` (e.g. `service:web`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(String);

impl Label {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace part of the label, i.e. everything before the first `:`.
    pub fn namespace(&self) -> &str {
        self.0.split(':').next().unwrap_or_default()
    }

    /// Returns the `idx`-th `:`-separated token of the label.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn part(&self, idx: usize) -> Option<&str> {
        let parts: Vec<&str> = self.0.split(':').collect();
        if idx >= parts.len() {
            return None;
        }
        Some(parts[idx])
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Label {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Label {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Parses a newline separated list of labels, skipping blank lines.
pub fn parse_labels(body: &str) -> Vec<Label> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(Label::from)
        .collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("hostname cannot be empty")]
    EmptyHostname,
    #[error("hostname {0:?} contains whitespace")]
    InvalidHostname(String),
    #[error("label {0:?} is empty or spans multiple lines")]
    InvalidLabel(String),
}

/// Information about a single server, used for server discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discovery {
    pub hostname: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub labels: Vec<Label>,
    /// Unix timestamp of the last time this server was seen. Owned by the
    /// registry, senders leave it untouched.
    #[serde(default)]
    pub last_check: i64,
    /// Liveness window in seconds, `0` means [`DEFAULT_TTL`].
    #[serde(skip)]
    pub ttl: u64,
}

// Nodes without labels may send `"labels": null`.
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Label>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Label>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Discovery {
    pub fn new(hostname: impl Into<String>, labels: Vec<Label>) -> Self {
        Self {
            hostname: hostname.into(),
            labels,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.hostname.is_empty() {
            return Err(ValidationError::EmptyHostname);
        }
        if self.hostname.chars().any(char::is_whitespace) {
            return Err(ValidationError::InvalidHostname(self.hostname.clone()));
        }
        if let Some(label) = self
            .labels
            .iter()
            .find(|l| l.as_str().is_empty() || l.as_str().contains('\n'))
        {
            return Err(ValidationError::InvalidLabel(label.to_string()));
        }
        Ok(())
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn is_alive(&self) -> bool {
        self.is_alive_at(unix_now())
    }

    pub fn is_alive_at(&self, now: i64) -> bool {
        let ttl = if self.ttl == 0 { DEFAULT_TTL } else { self.ttl };
        now - self.last_check < ttl as i64
    }

    /// Labels starting with `prefix`. Not token aware, `service:te` matches
    /// `service:test`.
    pub fn find_labels_by_prefix(&self, prefix: &str) -> Vec<Label> {
        self.labels
            .iter()
            .filter(|l| l.as_str().starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Labels whose namespace equals `namespace`.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn find_labels(&self, namespace: &str) -> Vec<Label> {
        self.labels
            .iter()
            .filter(|l| l.namespace() == namespace)
            .cloned()
            .collect()
    }

    pub fn sort_labels(&mut self) {
        self.labels.sort();
    }

    /// True when hostname or labels differ. `last_check` and `ttl` are ignored.
    pub fn differs_from(&self, other: &Discovery) -> bool {
        self.hostname != other.hostname || self.labels != other.labels
    }
}

/// Message carried next to the discovery packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Message {
    /// Announce or keep-alive.
    Hi,
    /// The node is leaving the group.
    Goodbye,
    #[serde(other)]
    Unknown,
}

/// Wire unit exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub discovery: Discovery,
    pub message: Message,
}

impl Envelope {
    pub fn hi(discovery: Discovery) -> Self {
        Self {
            discovery,
            message: Message::Hi,
        }
    }

    pub fn goodbye(discovery: Discovery) -> Self {
        Self {
            discovery,
            message: Message::Goodbye,
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Discovery {
        Discovery {
            hostname: "test.example.com".into(),
            labels: vec![
                "service:test".into(),
                "test:123".into(),
                "public_ip:1.2.3.4".into(),
            ],
            last_check: unix_now(),
            ttl: 0,
        }
    }

    #[test]
    fn liveness_follows_ttl() {
        let now = unix_now();
        let mut discovery = sample();
        discovery.last_check = now;
        assert!(discovery.is_alive_at(now));
        assert!(discovery.is_alive());

        discovery.last_check = now - 90;
        assert!(!discovery.is_alive_at(now));

        discovery.ttl = 60;
        discovery.last_check = now - 61;
        assert!(!discovery.is_alive_at(now));
        discovery.last_check = now - 59;
        assert!(discovery.is_alive_at(now));
    }

    #[test]
    fn find_labels_by_namespace_and_prefix() {
        let discovery = sample();
        assert_eq!(discovery.find_labels("service"), vec![Label::from("service:test")]);
        assert_eq!(
            discovery.find_labels_by_prefix("te"),
            vec![Label::from("test:123")]
        );
        assert!(discovery.find_labels("serv").is_empty());
    }

    #[test]
    fn label_part_rejects_out_of_range() {
        let label = Label::from("prometheus:node:port:9100");
        assert_eq!(label.part(0), Some("prometheus"));
        assert_eq!(label.part(3), Some("9100"));
        assert_eq!(label.part(4), None);
    }

    #[test]
    fn differs_ignores_last_check() {
        let a = Discovery {
            hostname: "abcd.com".into(),
            labels: vec!["label1".into()],
            last_check: 52,
            ttl: 0,
        };
        let mut ab = a.clone();
        ab.last_check = 56;
        ab.ttl = 10;
        let c = Discovery {
            labels: vec!["label2".into()],
            ..a.clone()
        };
        let b = Discovery::new("efgh.com", vec!["label2".into()]);

        assert!(!a.differs_from(&a));
        assert!(!a.differs_from(&ab));
        assert!(a.differs_from(&c));
        assert!(a.differs_from(&b));
        assert!(b.differs_from(&c));
    }

    #[test]
    fn validate_rejects_bad_records() {
        assert_eq!(sample().validate(), Ok(()));
        assert_eq!(
            Discovery::new("", vec![]).validate(),
            Err(ValidationError::EmptyHostname)
        );
        assert!(Discovery::new("a b", vec![]).validate().is_err());
        assert!(Discovery::new("a", vec!["".into()]).validate().is_err());
    }

    #[test]
    fn envelope_json_round_trip() {
        let discovery = sample();
        let bytes = Envelope::hi(discovery.clone()).to_bytes().unwrap();
        let decoded: Envelope = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(decoded.message, Message::Hi);
        assert_eq!(decoded.discovery.hostname, discovery.hostname);
        assert_eq!(decoded.discovery.labels, discovery.labels);
        assert_eq!(decoded.discovery.last_check, discovery.last_check);
    }

    #[test]
    fn envelope_wire_shape() {
        let envelope = Envelope::goodbye(Discovery {
            hostname: "node1".into(),
            labels: vec!["service:web".into()],
            last_check: 10,
            ttl: 30,
        });
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "discovery": {"hostname": "node1", "labels": ["service:web"], "last_check": 10},
                "message": "goodbye"
            })
        );
    }

    #[test]
    fn unknown_message_is_not_a_decode_error() {
        let raw = r#"{"discovery":{"hostname":"a","labels":[],"last_check":0},"message":"ping"}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.message, Message::Unknown);
    }

    #[test]
    fn null_labels_decode_as_empty() {
        let raw = r#"{"discovery":{"hostname":"bare","labels":null,"last_check":7},"message":"hi"}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert!(envelope.discovery.labels.is_empty());
        assert_eq!(envelope.discovery.last_check, 7);

        let raw = r#"{"discovery":{"hostname":"bare"},"message":"hi"}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert!(envelope.discovery.labels.is_empty());
    }

    #[test]
    fn parse_labels_skips_blank_lines() {
        let labels = parse_labels("service:web\n\n  test:1  \n");
        assert_eq!(labels, vec![Label::from("service:web"), Label::from("test:1")]);
    }
}
