//! NATS driver: discovery packets are published to a NATS subject every
//! node subscribes to.

use async_nats::client::PublishErrorKind;
use async_nats::PublishError;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{Driver, DriverError, Listener, Listeners};
use crate::registry::LogChannel;
use crate::types::{Discovery, Envelope, Message};

struct Connection {
    client: async_nats::Client,
    receiver: JoinHandle<()>,
}

pub struct NatsDriver {
    url: String,
    channel: String,
    log_channel: Option<LogChannel>,
    listeners: Listeners,
    conn: Mutex<Option<Connection>>,
}

impl NatsDriver {
    pub fn new(url: String, channel: String, log_channel: Option<LogChannel>) -> Self {
        Self {
            url,
            channel,
            log_channel,
            listeners: Listeners::default(),
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<Connection, DriverError> {
        let dispatcher = self.listeners.dispatcher(self.log_channel.as_ref())?;

        let client = async_nats::connect(self.url.as_str()).await?;
        let mut subscriber = client.subscribe(self.channel.clone()).await?;
        info!("Subscribed to NATS subject {}", self.channel);

        let receiver = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                dispatcher.handle(&message.payload).await;
            }
            debug!("NATS subscription ended");
        });

        Ok(Connection { client, receiver })
    }

    async fn publish(&self, envelope: &Envelope) -> Result<(), DriverError> {
        let data = envelope.to_bytes()?;
        let mut conn = self.conn.lock().await;

        let client = conn
            .as_ref()
            .map(|c| c.client.clone())
            .ok_or(DriverError::NotInitialized)?;
        let err = match client.publish(self.channel.clone(), data.clone().into()).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if !should_reconnect(envelope.message, &err) {
            return Err(err.into());
        }
        warn!("NATS connection closed ({}), reconnecting", err);
        if let Some(old) = conn.take() {
            old.receiver.abort();
        }
        let fresh = self.connect().await?;
        let client = fresh.client.clone();
        *conn = Some(fresh);

        client.publish(self.channel.clone(), data.into()).await?;
        Ok(())
    }
}

/// A send error means the connection task is gone.  Only `hi` packets get
/// one more try on a fresh connection, a goodbye is sent on the way out.
fn should_reconnect(message: Message, err: &PublishError) -> bool {
    message == Message::Hi && matches!(err.kind(), PublishErrorKind::Send)
}

#[async_trait]
impl Driver for NatsDriver {
    async fn init(&self) -> Result<(), DriverError> {
        if self.log_channel.is_none() {
            return Err(DriverError::MissingLogChannel);
        }
        if self.url.is_empty() {
            return Err(DriverError::InvalidSettings("NATS URL cannot be empty".into()));
        }

        let fresh = self.connect().await?;
        if let Some(old) = self.conn.lock().await.replace(fresh) {
            old.receiver.abort();
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        let Some(conn) = self.conn.lock().await.take() else {
            return Ok(());
        };
        // Push out whatever is still buffered, the goodbye packet included.
        let flushed = conn.client.flush().await;
        conn.receiver.abort();
        flushed?;
        Ok(())
    }

    fn register_subscribe_function(&mut self, listener: Listener) {
        self.listeners.subscribe = Some(listener);
    }

    fn register_unsubscribe_function(&mut self, listener: Listener) {
        self.listeners.unsubscribe = Some(listener);
    }

    async fn send_discovery_packet(&self, discovery: &Discovery) -> Result<(), DriverError> {
        self.publish(&Envelope::hi(discovery.clone())).await
    }

    async fn send_goodbye_packet(&self, discovery: &Discovery) -> Result<(), DriverError> {
        self.publish(&Envelope::goodbye(discovery.clone())).await
    }
}
