//! Redis driver: discovery packets travel over Redis Pub/Sub.
//!
//! Publishing goes through a [`ConnectionManager`], which reconnects by
//! itself.  The subscription lives on its own connection, and the receive
//! task subscribes again whenever that connection drops.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{info, warn};
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, RedisError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::{Dispatcher, Driver, DriverError, Listener, Listeners};
use crate::registry::LogChannel;
use crate::types::{Discovery, Envelope};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

struct Connection {
    conn: ConnectionManager,
    receiver: JoinHandle<()>,
}

pub struct RedisDriver {
    host: String,
    port: u16,
    password: String,
    db: i64,
    channel: String,
    log_channel: Option<LogChannel>,
    listeners: Listeners,
    conn: Mutex<Option<Connection>>,
}

impl RedisDriver {
    pub fn new(
        host: String,
        port: u16,
        password: String,
        db: i64,
        channel: String,
        log_channel: Option<LogChannel>,
    ) -> Self {
        Self {
            host,
            port,
            password,
            db,
            channel,
            log_channel,
            listeners: Listeners::default(),
            conn: Mutex::new(None),
        }
    }

    fn validate(&self) -> Result<(), DriverError> {
        if self.log_channel.is_none() {
            return Err(DriverError::MissingLogChannel);
        }
        if self.host.is_empty() {
            return Err(DriverError::InvalidSettings("Redis host cannot be empty".into()));
        }
        if self.channel.is_empty() {
            return Err(DriverError::InvalidSettings("Redis channel cannot be empty".into()));
        }
        if self.port == 0 {
            return Err(DriverError::InvalidSettings("Redis port cannot be 0".into()));
        }
        Ok(())
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.db,
                password: (!self.password.is_empty()).then(|| self.password.clone()),
                ..Default::default()
            },
        }
    }

    async fn publish(&self, envelope: &Envelope) -> Result<(), DriverError> {
        let data = envelope.to_bytes()?;
        let mut conn = self
            .conn
            .lock()
            .await
            .as_ref()
            .map(|c| c.conn.clone())
            .ok_or(DriverError::NotInitialized)?;

        // ConnectionManager reconnects for the next call, the packet itself
        // is not resent.
        conn.publish::<_, _, ()>(&self.channel, data).await?;
        Ok(())
    }
}

async fn subscribe(client: &redis::Client, channel: &str) -> Result<PubSub, RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    Ok(pubsub)
}

/// Feeds received messages to the dispatcher until aborted.  A dropped
/// subscription is re-established after [`RESUBSCRIBE_DELAY`].
fn spawn_receiver(
    client: redis::Client,
    channel: String,
    dispatcher: Dispatcher,
    mut pubsub: Option<PubSub>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let current = match pubsub.take() {
                Some(current) => current,
                None => match subscribe(&client, &channel).await {
                    Ok(current) => {
                        info!("Resubscribed to Redis channel {}", channel);
                        current
                    }
                    Err(e) => {
                        warn!("Redis subscribe error, retrying: {}", e);
                        sleep(RESUBSCRIBE_DELAY).await;
                        continue;
                    }
                },
            };

            let mut stream = current.into_on_message();
            while let Some(message) = stream.next().await {
                dispatcher.handle(message.get_payload_bytes()).await;
            }
            warn!("Redis subscription on {} ended, reconnecting", channel);
            sleep(RESUBSCRIBE_DELAY).await;
        }
    })
}

#[async_trait]
impl Driver for RedisDriver {
    async fn init(&self) -> Result<(), DriverError> {
        self.validate()?;
        let dispatcher = self.listeners.dispatcher(self.log_channel.as_ref())?;

        let client = redis::Client::open(self.connection_info())?;
        let conn = ConnectionManager::new(client.clone()).await?;

        // The first subscription has to succeed, later ones are retried.
        let pubsub = subscribe(&client, &self.channel).await?;
        info!("Subscribed to Redis channel {}", self.channel);

        let receiver = spawn_receiver(client, self.channel.clone(), dispatcher, Some(pubsub));

        if let Some(old) = self.conn.lock().await.replace(Connection { conn, receiver }) {
            old.receiver.abort();
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.receiver.abort();
        }
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
