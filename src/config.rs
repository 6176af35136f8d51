use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Label;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[serde(alias = "NATS", alias = "Nats")]
    Nats,
    #[serde(alias = "Redis", alias = "REDIS")]
    Redis,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("nats_url cannot be empty when driver is set to nats")]
    MissingNatsUrl,
    #[error("{0} has to be greater than zero")]
    ZeroInterval(&'static str),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Authentication token for the API, empty disables authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub host: String,
    pub port: u16,
    pub disable_api: bool,

    pub driver: DriverKind,
    pub nats_url: String,
    pub nats_discovery_channel: String,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_db: i64,
    pub redis_channel: String,
    pub redis_password: String,

    pub labels: Vec<String>,
    pub labels_path: String,
    pub runtime_labels_filename: String,
    /// Overrides the hostname reported by the OS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    pub clean_every: u64,
    pub keep_alive: u64,
    pub ttl: u64,
    pub node_exporter_port: u16,
    /// Announce this node to the group, `false` runs the daemon as a pure
    /// observer.
    pub register: bool,

    pub callback: String,
    pub callback_cooldown: u64,
    pub callback_first_run_delay: u64,
    pub shutdown_grace: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: None,
            host: "127.0.0.1".into(),
            port: 1313,
            disable_api: false,
            driver: DriverKind::Nats,
            nats_url: String::new(),
            nats_discovery_channel: "lobby.discovery".into(),
            redis_host: "127.0.0.1".into(),
            redis_port: 6379,
            redis_db: 0,
            redis_channel: "lobby:discovery".into(),
            redis_password: String::new(),
            labels: Vec::new(),
            labels_path: "/etc/lobby/labels".into(),
            runtime_labels_filename: "_runtime".into(),
            hostname: None,
            clean_every: 15,
            keep_alive: 5,
            ttl: 30,
            node_exporter_port: 9100,
            register: true,
            callback: String::new(),
            callback_cooldown: 15,
            callback_first_run_delay: 30,
            shutdown_grace: 5,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("lobby.toml"))
            .merge(Json::file("lobby.json"))
            .merge(Env::prefixed("LOBBY_").ignore(&["labels", "token_file"]))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Labels come as a comma separated list rather than figment's array syntax
        if let Ok(labels) = std::env::var("LOBBY_LABELS") {
            config.labels = split_list(&labels);
        }

        // Support Docker-style secrets
        if let Ok(token_file) = std::env::var("LOBBY_TOKEN_FILE") {
            config.token = Some(std::fs::read_to_string(token_file)?.trim().to_string());
        }
        if config.token.as_deref() == Some("") {
            config.token = None;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.driver == DriverKind::Nats && self.nats_url.is_empty() {
            return Err(ConfigError::MissingNatsUrl);
        }
        for (name, value) in [
            ("keep_alive", self.keep_alive),
            ("clean_every", self.clean_every),
            ("callback_cooldown", self.callback_cooldown),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        Ok(())
    }

    pub fn initial_labels(&self) -> Vec<Label> {
        self.labels.iter().map(|l| Label::from(l.as_str())).collect()
    }
}

/// Splits a comma separated list, dropping blank items.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_need_nats_url() {
        Jail::expect_with(|_jail| {
            let err = Config::load().unwrap_err();
            assert!(err.to_string().contains("nats_url"));
            Ok(())
        });
    }

    #[test]
    fn env_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.set_env("LOBBY_NATS_URL", "nats://10.0.0.1:4222");
            jail.set_env("LOBBY_LABELS", "service:web, zone:eu,,");
            jail.set_env("LOBBY_KEEP_ALIVE", "2");
            jail.set_env("LOBBY_REGISTER", "false");

            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.driver, DriverKind::Nats);
            assert_eq!(config.nats_url, "nats://10.0.0.1:4222");
            assert_eq!(config.labels, vec!["service:web", "zone:eu"]);
            assert_eq!(config.keep_alive, 2);
            assert!(!config.register);
            assert_eq!(config.ttl, 30);
            assert_eq!(config.node_exporter_port, 9100);
            Ok(())
        });
    }

    #[test]
    fn toml_file_selects_redis() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "lobby.toml",
                r#"
                driver = "Redis"
                redis_host = "redis.internal"
                callback = "/usr/local/bin/regen"
                "#,
            )?;
            jail.set_env("LOBBY_REDIS_PORT", "6380");

            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.driver, DriverKind::Redis);
            assert_eq!(config.redis_host, "redis.internal");
            assert_eq!(config.redis_port, 6380);
            assert_eq!(config.callback, "/usr/local/bin/regen");
            Ok(())
        });
    }

    #[test]
    fn unsupported_driver_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("LOBBY_DRIVER", "kafka");
            jail.set_env("LOBBY_NATS_URL", "nats://localhost");
            assert!(Config::load().is_err());
            Ok(())
        });
    }

    #[test]
    fn token_file_overrides_token() {
        Jail::expect_with(|jail| {
            jail.create_file("token", "s3cret\n")?;
            jail.set_env("LOBBY_NATS_URL", "nats://localhost");
            jail.set_env("LOBBY_TOKEN", "ignored");
            jail.set_env("LOBBY_TOKEN_FILE", "token");

            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.token.as_deref(), Some("s3cret"));
            Ok(())
        });
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let config = Config {
            nats_url: "nats://localhost".into(),
            callback_cooldown: 0,
            ..Config::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroInterval("callback_cooldown"))
        );
    }
}
