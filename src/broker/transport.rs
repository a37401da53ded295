use crate::broker::BrokerError;
use crate::config::BrokerConfig;
use crate::models::InboundMessage;
use async_trait::async_trait;
use log::{debug, info};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use tokio::time::{timeout, Duration};

const REQUEST_CHANNEL_CAPACITY: usize = 256;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Publish/subscribe half of an established connection.
#[async_trait]
pub trait TransportClient: Send + Sync {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError>;

    /// Returns once the transport has accepted the message.
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;
}

/// Inbound half of an established connection.
#[async_trait]
pub trait TransportEvents: Send {
    /// Next inbound publish. An error means the connection is gone.
    async fn next_message(&mut self) -> Result<InboundMessage, BrokerError>;
}

/// Opens connections to one broker. Each call yields a fresh connection.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn TransportClient>, Box<dyn TransportEvents>), BrokerError>;
}

pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &BrokerConfig, client_id: &str) -> Arc<dyn Transport>;
}

/// Builds `rumqttc` transports.
#[derive(Debug, Default, Clone, Copy)]
pub struct MqttTransportFactory;

impl TransportFactory for MqttTransportFactory {
    fn create(&self, config: &BrokerConfig, client_id: &str) -> Arc<dyn Transport> {
        Arc::new(MqttTransport::new(config, client_id))
    }
}

pub struct MqttTransport {
    options: MqttOptions,
}

impl MqttTransport {
    pub fn new(config: &BrokerConfig, client_id: &str) -> Self {
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        // Persistent session so the broker keeps our subscriptions across reconnects.
        options.set_clean_session(false);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        Self { options }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn TransportClient>, Box<dyn TransportEvents>), BrokerError> {
        let (host, port) = self.options.broker_address();
        debug!("Configuring MQTT broker at {}:{}...", host, port);

        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CHANNEL_CAPACITY);

        let ack = timeout(CONNECT_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack),
                    Ok(_) => continue,
                    Err(e) => return Err(BrokerError::Connection(e.to_string())),
                }
            }
        })
        .await
        .map_err(|_| BrokerError::Connection(format!("timed out connecting to {}:{}", host, port)))??;

        if ack.code != ConnectReturnCode::Success {
            return Err(BrokerError::Connection(format!(
                "broker {}:{} refused connection: {:?}",
                host, port, ack.code
            )));
        }

        info!(
            "Connected to MQTT broker {}:{} (session present: {}).",
            host, port, ack.session_present
        );

        Ok((Arc::new(MqttClient { client }), Box::new(MqttEvents { eventloop })))
    }
}

struct MqttClient {
    client: AsyncClient,
}

#[async_trait]
impl TransportClient for MqttClient {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        self.client
            .subscribe(topic, qos)
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

struct MqttEvents {
    eventloop: EventLoop,
}

#[async_trait]
impl TransportEvents for MqttEvents {
    async fn next_message(&mut self) -> Result<InboundMessage, BrokerError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(InboundMessage::new(publish.topic.clone(), publish.payload.to_vec()));
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    debug!("Subscription acknowledged.");
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    return Err(BrokerError::ConnectionLost("broker sent disconnect".to_string()));
                }
                Ok(_) => {}
                Err(e) => return Err(BrokerError::ConnectionLost(e.to_string())),
            }
        }
    }
}
