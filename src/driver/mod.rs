//! Transport drivers carrying discovery envelopes between nodes.
//!
//! Every backend implements [`Driver`], the daemon never knows which one is
//! active.  Received payloads go through the shared [`Dispatcher`], which
//! decodes the envelope and hands the packet to the registered listeners.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::config::{Config, DriverKind};
use crate::registry::LogChannel;
use crate::types::{Discovery, Envelope, Message};

pub mod nats;
pub mod redis;
pub use self::nats::NatsDriver;
pub use self::redis::RedisDriver;

/// Callback receiving a discovery packet from the network.
pub type Listener = Arc<dyn Fn(Discovery) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("log channel has to be set before the driver is initialised")]
    MissingLogChannel,
    #[error("{0} listener has to be registered before the driver is initialised")]
    MissingListener(&'static str),
    #[error("driver is not initialised")]
    NotInitialized,
    #[error("invalid driver settings: {0}")]
    InvalidSettings(String),
    #[error("encoding envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("NATS connect error: {0}")]
    NatsConnect(#[from] async_nats::ConnectError),
    #[error("NATS subscribe error: {0}")]
    NatsSubscribe(#[from] async_nats::SubscribeError),
    #[error("NATS publish error: {0}")]
    NatsPublish(#[from] async_nats::PublishError),
    #[error("NATS flush error: {0}")]
    NatsFlush(#[from] async_nats::client::FlushError),
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

#[async_trait]
pub trait Driver: Send + Sync {
    /// Connects, subscribes to the discovery channel and starts dispatching
    /// received envelopes.  Listeners and the log channel must be set first.
    async fn init(&self) -> Result<(), DriverError>;

    /// Releases the connection.
    async fn close(&self) -> Result<(), DriverError>;

    /// Listener for `hi` packets.
    fn register_subscribe_function(&mut self, listener: Listener);

    /// Listener for `goodbye` packets.
    fn register_unsubscribe_function(&mut self, listener: Listener);

    async fn send_discovery_packet(&self, discovery: &Discovery) -> Result<(), DriverError>;

    async fn send_goodbye_packet(&self, discovery: &Discovery) -> Result<(), DriverError>;
}

/// Builds the driver selected in the configuration.
pub fn from_config(config: &Config, log_channel: LogChannel) -> Box<dyn Driver> {
    match config.driver {
        DriverKind::Nats => Box::new(NatsDriver::new(
            config.nats_url.clone(),
            config.nats_discovery_channel.clone(),
            Some(log_channel),
        )),
        DriverKind::Redis => Box::new(RedisDriver::new(
            config.redis_host.clone(),
            config.redis_port,
            config.redis_password.clone(),
            config.redis_db,
            config.redis_channel.clone(),
            Some(log_channel),
        )),
    }
}

/// Listener set shared by the backends.  Filled by the register functions
/// and turned into a [`Dispatcher`] on init.
#[derive(Default, Clone)]
pub(crate) struct Listeners {
    pub subscribe: Option<Listener>,
    pub unsubscribe: Option<Listener>,
}

impl Listeners {
    pub fn dispatcher(&self, log_channel: Option<&LogChannel>) -> Result<Dispatcher, DriverError> {
        let log_channel = log_channel.cloned().ok_or(DriverError::MissingLogChannel)?;
        let subscribe = self
            .subscribe
            .clone()
            .ok_or(DriverError::MissingListener("subscribe"))?;
        let unsubscribe = self
            .unsubscribe
            .clone()
            .ok_or(DriverError::MissingListener("unsubscribe"))?;
        Ok(Dispatcher {
            subscribe,
            unsubscribe,
            log_channel,
        })
    }
}

/// Receive side of a driver.
///
/// Runs on a background task with nobody to return an error to, so every
/// problem is reported on the log channel and the payload is dropped.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    subscribe: Listener,
    unsubscribe: Listener,
    log_channel: LogChannel,
}

impl Dispatcher {
    fn log(&self, message: String) {
        let _ = self.log_channel.send(message);
    }

    pub async fn handle(&self, payload: &[u8]) {
        let envelope: Envelope = match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.log(format!("decoding message error: {}", e));
                return;
            }
        };

        if let Err(e) = envelope.discovery.validate() {
            self.log(format!("validation error: {}", e));
            return;
        }

        match envelope.message {
            Message::Hi => (self.subscribe)(envelope.discovery).await,
            Message::Goodbye => (self.unsubscribe)(envelope.discovery).await,
            Message::Unknown => self.log("incompatible message".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use tokio::sync::{mpsc, Mutex};

    type Seen = Arc<Mutex<Vec<(String, Discovery)>>>;

    fn recording(kind: &'static str, seen: Seen) -> Listener {
        Arc::new(move |discovery: Discovery| {
            let seen = seen.clone();
            async move {
                seen.lock().await.push((kind.to_string(), discovery));
            }
            .boxed()
        })
    }

    fn setup() -> (Dispatcher, Seen, mpsc::UnboundedReceiver<String>) {
        let seen: Seen = Arc::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let listeners = Listeners {
            subscribe: Some(recording("hi", seen.clone())),
            unsubscribe: Some(recording("goodbye", seen.clone())),
        };
        (listeners.dispatcher(Some(&tx)).unwrap(), seen, rx)
    }

    #[tokio::test]
    async fn dispatches_by_message() {
        let (dispatcher, seen, mut rx) = setup();
        let discovery = Discovery::new("node1", vec!["service:web".into()]);

        dispatcher
            .handle(&Envelope::hi(discovery.clone()).to_bytes().unwrap())
            .await;
        dispatcher
            .handle(&Envelope::goodbye(discovery.clone()).to_bytes().unwrap())
            .await;

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("hi".to_string(), discovery.clone()));
        assert_eq!(seen[1], ("goodbye".to_string(), discovery));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_payloads_are_logged_and_dropped() {
        let (dispatcher, seen, mut rx) = setup();

        dispatcher.handle(b"not json").await;
        assert!(rx.recv().await.unwrap().starts_with("decoding message error"));

        dispatcher
            .handle(br#"{"discovery":{"hostname":"","labels":[]},"message":"hi"}"#)
            .await;
        assert!(rx.recv().await.unwrap().starts_with("validation error"));

        dispatcher
            .handle(br#"{"discovery":{"hostname":"a","labels":[]},"message":"ping"}"#)
            .await;
        assert_eq!(rx.recv().await.unwrap(), "incompatible message");

        assert!(seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn null_labels_are_dispatched() {
        let (dispatcher, seen, mut rx) = setup();

        dispatcher
            .handle(br#"{"discovery":{"hostname":"bare","labels":null,"last_check":0},"message":"hi"}"#)
            .await;

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], ("hi".to_string(), Discovery::new("bare", vec![])));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dispatcher_requires_log_channel_and_listeners() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let noop: Listener = Arc::new(|_: Discovery| async {}.boxed());

        let empty = Listeners::default();
        assert!(matches!(
            empty.dispatcher(Some(&tx)),
            Err(DriverError::MissingListener("subscribe"))
        ));

        let only_hi = Listeners {
            subscribe: Some(noop.clone()),
            unsubscribe: None,
        };
        assert!(matches!(
            only_hi.dispatcher(Some(&tx)),
            Err(DriverError::MissingListener("unsubscribe"))
        ));

        let full = Listeners {
            subscribe: Some(noop.clone()),
            unsubscribe: Some(noop),
        };
        assert!(matches!(
            full.dispatcher(None),
            Err(DriverError::MissingLogChannel)
        ));
    }
}
