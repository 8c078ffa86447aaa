//! MQTT output for device facts and input for device commands.

mod client;
mod topics;

pub use client::{MqttClient, MqttMessage};
pub use topics::{Fact, Topics};

use crate::error::Result;
use async_trait::async_trait;
use log::{debug, info};
use rumqttc::{AsyncClient, QoS};

/// An outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: String,
    /// Durability flag; maps to the MQTT retain bit.
    pub retain: bool,
}

/// Sink for outbound messages. Delivery is at-least-once.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: Message) -> Result<()>;
}

/// Publishes through a `rumqttc` client with QoS 1.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, message: Message) -> Result<()> {
        debug!("[MQTT] Publishing to {}: {}", message.topic, message.payload);
        self.client
            .publish(
                message.topic,
                QoS::AtLeastOnce,
                message.retain,
                message.payload.into_bytes(),
            )
            .await?;
        Ok(())
    }
}

/// Writes messages to the log instead of a broker.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, message: Message) -> Result<()> {
        info!(
            "{} = {}{}",
            message.topic,
            message.payload,
            if message.retain { " (retained)" } else { "" }
        );
        Ok(())
    }
}
