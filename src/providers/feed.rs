use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::FeedConfig;

/// Capacity of the inbound message channel. The consumer coalesces into a
/// last-write-wins buffer immediately, so a modest bound suffices even at
/// feed-native message rates.
const MESSAGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Not connected to feed")]
    NotConnected,
    #[error("Feed connection failed: {0}")]
    Connection(String),
    #[error("Feed subscription failed: {0}")]
    Subscription(String),
}

impl FeedError {
    /// Whether this failure means the connection itself is gone, which
    /// warrants a reconnect + resubscribe rather than a plain retry.
    pub fn is_no_connection(&self) -> bool {
        matches!(self, FeedError::NotConnected | FeedError::Connection(_))
    }
}

/// A raw message delivered by the feed: the concrete topic it arrived on and
/// the untouched payload bytes.
#[derive(Debug, Clone)]
pub struct FeedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Publish/subscribe vehicle position source.
///
/// `connect` yields the receiving half of the message stream; the stream
/// closing signals that the underlying connection was lost. Implementations
/// must tolerate subscribe/unsubscribe calls racing with message delivery.
#[async_trait]
pub trait VehicleFeed: Send + Sync {
    async fn connect(&self) -> Result<mpsc::Receiver<FeedMessage>, FeedError>;
    async fn disconnect(&self) -> Result<(), FeedError>;
    async fn subscribe(&self, topic: &str) -> Result<(), FeedError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), FeedError>;
}

/// MQTT-backed vehicle feed.
pub struct MqttFeed {
    config: FeedConfig,
    client: parking_lot::Mutex<Option<AsyncClient>>,
}

impl MqttFeed {
    pub fn new(config: FeedConfig) -> Self {
        Self {
            config,
            client: parking_lot::Mutex::new(None),
        }
    }

    fn current_client(&self) -> Result<AsyncClient, FeedError> {
        self.client.lock().clone().ok_or(FeedError::NotConnected)
    }
}

#[async_trait]
impl VehicleFeed for MqttFeed {
    async fn connect(&self) -> Result<mpsc::Receiver<FeedMessage>, FeedError> {
        let client_id = format!("transit-live-{}", Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, self.config.host.as_str(), self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs));
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, MESSAGE_CHANNEL_CAPACITY);

        // Drive the event loop until the broker acknowledges the connection,
        // so a returned receiver always belongs to an established session.
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => continue,
                Err(e) => return Err(FeedError::Connection(e.to_string())),
            }
        }

        info!(host = %self.config.host, port = self.config.port, "Connected to vehicle feed");
        *self.client.lock() = Some(client);

        let (tx, rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = FeedMessage {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                        };
                        if tx.send(message).await.is_err() {
                            // Receiver dropped: the manager tore the
                            // connection down, nothing left to pump.
                            debug!("Feed message receiver dropped, stopping pump");
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Dropping the sender closes the stream, which the
                        // consumer treats as connection loss.
                        warn!(error = %e, "Feed connection lost");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn disconnect(&self) -> Result<(), FeedError> {
        let client = self.client.lock().take();
        if let Some(client) = client {
            client
                .disconnect()
                .await
                .map_err(|e| FeedError::Connection(e.to_string()))?;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), FeedError> {
        let client = self.current_client()?;
        client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| FeedError::Subscription(e.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), FeedError> {
        let client = self.current_client()?;
        client
            .unsubscribe(topic)
            .await
            .map_err(|e| FeedError::Subscription(e.to_string()))
    }
}
