//! Broker primitives used to resolve a delivery.

use crate::error::ConsumerError;
use async_trait::async_trait;
use lapin::{
    options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions},
    BasicProperties, Channel,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

/// Exchange and routing key of the delayed-retry path.
///
/// The target queue is expected to have no consumers and to dead-letter
/// expired messages back to the main queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRoute {
    pub exchange: String,
    pub routing_key: String,
}

impl DelayRoute {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self { exchange: exchange.into(), routing_key: routing_key.into() }
    }
}

impl Default for DelayRoute {
    fn default() -> Self {
        Self::new("retry.exchange", "retry.key")
    }
}

impl std::fmt::Display for DelayRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.exchange, self.routing_key)
    }
}

/// Per-message expiration in the AMQP wire form: milliseconds as a decimal string.
pub fn expiration_millis(delay: Duration) -> String {
    delay.as_millis().to_string()
}

/// The acknowledgement and publish operations the dispatcher needs.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Acknowledges the delivery; the broker forgets the message.
    async fn ack(&self, delivery_tag: u64) -> Result<(), ConsumerError>;

    /// Rejects the delivery without requeue; dead-letter routing decides what happens next.
    async fn reject(&self, delivery_tag: u64) -> Result<(), ConsumerError>;

    /// Publishes a durable JSON message to `route` that expires after `delay`.
    /// Returns only once the broker has confirmed the publish.
    async fn publish_delayed(&self, route: &DelayRoute, body: &[u8], delay: Duration) -> Result<(), ConsumerError>;
}

/// [`Broker`] backed by a `lapin` channel.
#[derive(Clone)]
pub struct LapinBroker {
    channel: Channel,
}

impl LapinBroker {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), ConsumerError> {
        self.channel.basic_ack(delivery_tag, BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64) -> Result<(), ConsumerError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { requeue: false, ..Default::default() })
            .await?;
        Ok(())
    }

    async fn publish_delayed(&self, route: &DelayRoute, body: &[u8], delay: Duration) -> Result<(), ConsumerError> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT)
            .with_expiration(expiration_millis(delay).into());

        let confirmation = self
            .channel
            .basic_publish(
                &route.exchange,
                &route.routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(ConsumerError::PublishNotConfirmed { route: route.to_string() });
        }
        Ok(())
    }
}
