//! Broker boundary.
//!
//! The dispatch runtime only sees [`MqttSubscriber`]; the rumqttc adapter
//! lives in [`mqtt`] behind the `mqtt` feature and tests drive the runtime
//! with scripted subscribers.

#[cfg(feature = "mqtt")]
pub mod mqtt;

use crate::config::{ActionConfig, MqttConfig, MqttTlsConfig};
use async_trait::async_trait;
use std::fmt;
use std::result::Result as StdResult;
use std::time::Duration;

/// One delivered message.
///
/// `id` is a per-subscriber delivery sequence used in logs; `packet_id`
/// is the broker's packet identifier needed to acknowledge qos > 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub packet_id: Option<u16>,
    pub id: u64,
}

impl MqttMessage {
    pub fn new(
        topic: impl Into<String>,
        payload: Vec<u8>,
        qos: u8,
        retain: bool,
        packet_id: Option<u16>,
        id: u64,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
            retain,
            packet_id,
            id,
        }
    }
}

#[async_trait]
pub trait MqttSubscriber: Send + 'static {
    /// Establishes the broker session. Called once at startup.
    async fn connect(&mut self) -> StdResult<(), MqttSubscriberError>;

    async fn subscribe(&mut self, topic: &str, qos: u8) -> StdResult<(), MqttSubscriberError>;

    /// Waits for the next message. `Ok(None)` means nothing is ready yet.
    async fn next_message(&mut self) -> StdResult<Option<MqttMessage>, MqttSubscriberError>;

    async fn ack(&mut self, _packet_id: Option<u16>) -> StdResult<(), MqttSubscriberError> {
        Ok(())
    }

    /// Re-establishes a lost session. The caller resubscribes afterwards.
    async fn reconnect(&mut self) -> StdResult<(), MqttSubscriberError> {
        self.connect().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSubscriberError {
    message: String,
}

impl MqttSubscriberError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for MqttSubscriberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for MqttSubscriberError {}

/// Everything a subscriber adapter needs for one action's subscription.
#[derive(Clone, Debug)]
pub struct MqttSubscriberConfig {
    pub action: String,
    pub url: String,
    pub topic: String,
    pub qos: u8,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub tls: Option<MqttTlsConfig>,
}

impl MqttSubscriberConfig {
    pub fn for_action(mqtt: &MqttConfig, action: &ActionConfig) -> Self {
        // one broker session per action, so client ids must differ
        let client_id = mqtt
            .client_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .map(|id| format!("{id}-{}", action.name));

        Self {
            action: action.name.clone(),
            url: mqtt.url.clone(),
            topic: action.topic.clone(),
            qos: action.qos,
            client_id,
            username: mqtt.username.clone(),
            password: mqtt.password.clone(),
            keep_alive: Duration::from_secs(mqtt.keep_alive_secs.max(5)),
            connect_timeout: mqtt.connect_timeout(),
            tls: mqtt.tls.clone(),
        }
    }
}
