#![forbid(unsafe_code)]

use crate::config::MqttTlsConfig;
use crate::transport::{MqttMessage, MqttSubscriber, MqttSubscriberConfig, MqttSubscriberError};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, Publish, QoS,
    SubscribeReasonCode, Transport,
};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::result::Result as StdResult;
use tokio::time::timeout;
use url::Url;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 10;

/// rumqttc-backed subscriber for one action.
pub struct RumqttcMqttSubscriber {
    config: MqttSubscriberConfig,
    client: AsyncClient,
    eventloop: EventLoop,
    pending: HashMap<u16, Publish>,
    backlog: VecDeque<Publish>,
    next_id: u64,
}

impl RumqttcMqttSubscriber {
    /// Prepares the client. No network traffic happens until `connect`.
    pub fn new(config: MqttSubscriberConfig) -> StdResult<Self, MqttSubscriberError> {
        let (client, eventloop) = build_client(&config)?;
        Ok(Self {
            config,
            client,
            eventloop,
            pending: HashMap::new(),
            backlog: VecDeque::new(),
            next_id: 0,
        })
    }

    fn track_delivery(&mut self, publish: Publish) -> MqttMessage {
        let packet_id = match publish.qos {
            QoS::AtMostOnce => None,
            _ if publish.pkid == 0 => None,
            _ => {
                self.pending.insert(publish.pkid, publish.clone());
                Some(publish.pkid)
            }
        };

        self.next_id += 1;
        MqttMessage::new(
            publish.topic.clone(),
            publish.payload.to_vec(),
            publish.qos as u8,
            publish.retain,
            packet_id,
            self.next_id,
        )
    }

    async fn await_connack(&mut self) -> StdResult<(), MqttSubscriberError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return if ack.code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(MqttSubscriberError::new(format!(
                            "broker refused connection: {:?}",
                            ack.code
                        )))
                    };
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => self.backlog.push_back(publish),
                Ok(_) => continue,
                Err(err) => {
                    return Err(MqttSubscriberError::new(format!(
                        "mqtt connect to `{}` failed: {err}",
                        self.config.url
                    )))
                }
            }
        }
    }

    async fn await_suback(&mut self, topic: &str) -> StdResult<(), MqttSubscriberError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        return Err(MqttSubscriberError::new(format!(
                            "broker rejected subscription to `{topic}`"
                        )));
                    }
                    return Ok(());
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => self.backlog.push_back(publish),
                Ok(_) => continue,
                Err(err) => {
                    return Err(MqttSubscriberError::new(format!(
                        "mqtt subscribe to `{topic}` failed: {err}"
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl MqttSubscriber for RumqttcMqttSubscriber {
    async fn connect(&mut self) -> StdResult<(), MqttSubscriberError> {
        let limit = self.config.connect_timeout;
        timeout(limit, self.await_connack())
            .await
            .map_err(|_| {
                MqttSubscriberError::new(format!(
                    "mqtt connect to `{}` timed out after {}s",
                    self.config.url,
                    limit.as_secs()
                ))
            })?
    }

    async fn subscribe(&mut self, topic: &str, qos: u8) -> StdResult<(), MqttSubscriberError> {
        let qos = qos_from_u8(qos)?;
        self.client
            .subscribe(topic.to_string(), qos)
            .await
            .map_err(|err| {
                MqttSubscriberError::new(format!("failed to subscribe to `{topic}`: {err}"))
            })?;

        let limit = self.config.connect_timeout;
        timeout(limit, self.await_suback(topic))
            .await
            .map_err(|_| {
                MqttSubscriberError::new(format!("no subscription ack for `{topic}`"))
            })?
    }

    async fn next_message(&mut self) -> StdResult<Option<MqttMessage>, MqttSubscriberError> {
        if let Some(publish) = self.backlog.pop_front() {
            return Ok(Some(self.track_delivery(publish)));
        }

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(Some(self.track_delivery(publish)));
                }
                Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => continue,
                Err(err) => {
                    return Err(MqttSubscriberError::new(format!(
                        "mqtt event loop error: {err}"
                    )))
                }
            }
        }
    }

    async fn ack(&mut self, packet_id: Option<u16>) -> StdResult<(), MqttSubscriberError> {
        if let Some(id) = packet_id {
            if let Some(publish) = self.pending.remove(&id) {
                self.client.ack(&publish).await.map_err(|err| {
                    MqttSubscriberError::new(format!("mqtt ack failed for packet {id}: {err}"))
                })?;
            }
        }

        Ok(())
    }

    async fn reconnect(&mut self) -> StdResult<(), MqttSubscriberError> {
        let (client, eventloop) = build_client(&self.config)?;
        self.client = client;
        self.eventloop = eventloop;
        self.pending.clear();
        self.backlog.clear();
        self.connect().await
    }
}

fn build_client(
    config: &MqttSubscriberConfig,
) -> StdResult<(AsyncClient, EventLoop), MqttSubscriberError> {
    let options = build_mqtt_options(config)?;
    Ok(AsyncClient::new(options, CHANNEL_CAPACITY))
}

fn build_mqtt_options(config: &MqttSubscriberConfig) -> StdResult<MqttOptions, MqttSubscriberError> {
    let parsed = Url::parse(&config.url).map_err(|err| {
        MqttSubscriberError::new(format!("invalid mqtt url `{}`: {err}", config.url))
    })?;

    let host = parsed
        .host_str()
        .ok_or_else(|| MqttSubscriberError::new("mqtt url must specify host"))?;

    let scheme = parsed.scheme().to_ascii_lowercase();
    let default_port = match scheme.as_str() {
        "mqtt" | "tcp" => 1883,
        "mqtts" | "ssl" => 8883,
        other => {
            return Err(MqttSubscriberError::new(format!(
                "unsupported mqtt url scheme `{other}`"
            )))
        }
    };
    let port = parsed.port().unwrap_or(default_port);

    let client_id = config
        .client_id
        .clone()
        .unwrap_or_else(|| format!("tsm-dispatcher-{}-{}", config.action, Uuid::new_v4()));

    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(config.keep_alive);

    if let Some(user) = config.username.as_deref() {
        options.set_credentials(user, config.password.as_deref().unwrap_or(""));
    }

    if matches!(scheme.as_str(), "mqtts" | "ssl") || config.tls.is_some() {
        options.set_transport(build_transport_from_tls(config.tls.as_ref())?);
    }

    options.set_manual_acks(config.qos > 0);

    Ok(options)
}

fn build_transport_from_tls(
    tls: Option<&MqttTlsConfig>,
) -> StdResult<Transport, MqttSubscriberError> {
    let Some(tls) = tls else {
        return Ok(Transport::tls_with_default_config());
    };

    let client_auth = match (&tls.cert, &tls.key) {
        (Some(cert), Some(key)) => Some((read_file(cert, "cert")?, read_file(key, "key")?)),
        (None, None) => None,
        _ => {
            return Err(MqttSubscriberError::new(
                "mqtt tls client auth needs both `cert` and `key`",
            ))
        }
    };

    match &tls.ca {
        Some(ca) => Ok(Transport::tls(read_file(ca, "ca")?, client_auth, None)),
        None => Ok(Transport::tls_with_default_config()),
    }
}

fn read_file(path: &Path, what: &str) -> StdResult<Vec<u8>, MqttSubscriberError> {
    fs::read(path).map_err(|err| {
        MqttSubscriberError::new(format!(
            "failed to read mqtt tls {what} `{}`: {err}",
            path.display()
        ))
    })
}

fn qos_from_u8(qos: u8) -> StdResult<QoS, MqttSubscriberError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(MqttSubscriberError::new(format!(
            "unsupported mqtt qos `{other}`"
        ))),
    }
}
