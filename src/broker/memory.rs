//! In-process broker used by the tests in place of a real MQTT server.

use crate::broker::transport::{Transport, TransportClient, TransportEvents, TransportFactory};
use crate::broker::{topic_matches, BrokerError};
use crate::config::BrokerConfig;
use crate::models::InboundMessage;
use async_trait::async_trait;
use rumqttc::QoS;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

#[derive(Default)]
struct Inner {
    offline: bool,
    connect_delay: Duration,
    stall_publishes: bool,
    connects: u64,
    next_id: u64,
    connections: HashMap<u64, Connection>,
    published: Vec<InboundMessage>,
    watchers: Vec<(String, mpsc::UnboundedSender<InboundMessage>)>,
}

struct Connection {
    filters: Vec<(String, QoS)>,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

impl Inner {
    fn deliver(&mut self, message: &InboundMessage) {
        for connection in self.connections.values() {
            if connection.filters.iter().any(|(f, _)| topic_matches(f, &message.topic)) {
                let _ = connection.tx.send(message.clone());
            }
        }
        self.watchers.retain(|(filter, tx)| {
            !topic_matches(filter, &message.topic) || tx.send(message.clone()).is_ok()
        });
    }
}

#[derive(Clone, Default)]
pub(crate) struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        f(&mut inner)
    }

    /// Refuses new connections and drops the current ones while offline.
    pub fn set_online(&self, online: bool) {
        self.with(|inner| {
            inner.offline = !online;
            if !online {
                inner.connections.clear();
            }
        });
    }

    /// Makes every connection attempt take `delay` before it resolves.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.with(|inner| inner.connect_delay = delay);
    }

    /// Leaves every publish pending forever, like a client whose outgoing
    /// queue is full.
    pub fn stall_publishes(&self, stall: bool) {
        self.with(|inner| inner.stall_publishes = stall);
    }

    /// Drops every open connection, as if the network went away.
    pub fn drop_connections(&self) {
        self.with(|inner| inner.connections.clear());
    }

    pub fn connect_count(&self) -> u64 {
        self.with(|inner| inner.connects)
    }

    pub fn connection_count(&self) -> usize {
        self.with(|inner| inner.connections.len())
    }

    /// Filters subscribed on currently open connections.
    pub fn active_filters(&self) -> Vec<String> {
        self.with(|inner| {
            inner
                .connections
                .values()
                .flat_map(|c| c.filters.iter().map(|(f, _)| f.clone()))
                .collect()
        })
    }

    /// QoS of the most recent subscription to exactly `filter`.
    pub fn subscription_qos(&self, filter: &str) -> Option<QoS> {
        self.with(|inner| {
            inner
                .connections
                .values()
                .flat_map(|c| c.filters.iter())
                .filter(|(f, _)| f == filter)
                .map(|(_, qos)| *qos)
                .last()
        })
    }

    /// Publishes as an outside client would.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let message = InboundMessage::new(topic, payload);
        self.with(|inner| inner.deliver(&message));
    }

    /// Receives every message published to topics matching `filter`.
    pub fn watch(&self, filter: &str) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.with(|inner| inner.watchers.push((filter.to_string(), tx)));
        rx
    }

    /// Messages published by gateway clients, oldest first.
    pub fn published(&self) -> Vec<InboundMessage> {
        self.with(|inner| inner.published.clone())
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn TransportClient>, Box<dyn TransportEvents>), BrokerError> {
        let delay = self.with(|inner| inner.connect_delay);
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.with(|inner| {
            inner.connects += 1;
            if inner.offline {
                return Err(BrokerError::Connection("broker offline".to_string()));
            }
            inner.next_id += 1;
            let id = inner.next_id;
            inner.connections.insert(
                id,
                Connection {
                    filters: Vec::new(),
                    tx,
                },
            );
            Ok(id)
        })?;

        let client = MemoryClient {
            broker: self.clone(),
            id,
        };
        Ok((Arc::new(client), Box::new(MemoryEvents { rx })))
    }
}

impl TransportFactory for MemoryBroker {
    fn create(&self, _config: &BrokerConfig, _client_id: &str) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }
}

/// One memory broker per broker host.
#[derive(Clone, Default)]
pub(crate) struct MemoryNetwork {
    brokers: Arc<Mutex<HashMap<String, MemoryBroker>>>,
}

impl MemoryNetwork {
    pub fn broker(&self, host: &str) -> MemoryBroker {
        self.brokers
            .lock()
            .unwrap()
            .entry(host.to_string())
            .or_default()
            .clone()
    }
}

impl TransportFactory for MemoryNetwork {
    fn create(&self, config: &BrokerConfig, _client_id: &str) -> Arc<dyn Transport> {
        Arc::new(self.broker(&config.host))
    }
}

struct MemoryClient {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl TransportClient for MemoryClient {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        self.broker.with(|inner| match inner.connections.get_mut(&self.id) {
            Some(connection) => {
                connection.filters.push((topic.to_string(), qos));
                Ok(())
            }
            None => Err(BrokerError::Subscribe("connection closed".to_string())),
        })
    }

    async fn publish(
        &self,
        topic: &str,
        _qos: QoS,
        _retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        if self.broker.with(|inner| inner.stall_publishes) {
            futures::future::pending::<()>().await;
        }
        self.broker.with(|inner| {
            if !inner.connections.contains_key(&self.id) {
                return Err(BrokerError::Publish("connection closed".to_string()));
            }
            let message = InboundMessage::new(topic, payload);
            inner.published.push(message.clone());
            inner.deliver(&message);
            Ok(())
        })
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.broker.with(|inner| inner.connections.remove(&self.id));
        Ok(())
    }
}

struct MemoryEvents {
    rx: mpsc::UnboundedReceiver<InboundMessage>,
}

#[async_trait]
impl TransportEvents for MemoryEvents {
    async fn next_message(&mut self) -> Result<InboundMessage, BrokerError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| BrokerError::ConnectionLost("connection closed".to_string()))
    }
}
