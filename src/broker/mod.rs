//! Upstream broker connections: one session per configured broker and a
//! manager that routes outbound publishes to them by name.

pub mod manager;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod memory;

use thiserror::Error;

pub use manager::{BrokerDirectory, BrokerManager};
pub use session::{BrokerSession, MessageHandler, SessionState};
pub use transport::{MqttTransportFactory, Transport, TransportClient, TransportEvents, TransportFactory};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Connection to broker lost: {0}")]
    ConnectionLost(String),
    #[error("Broker session {0} is not connected")]
    NotConnected(String),
    #[error("Publish error: {0}")]
    Publish(String),
    #[error("Subscribe error: {0}")]
    Subscribe(String),
    #[error("Broker session {0} is closed")]
    Closed(String),
    #[error("Unknown broker: {0}")]
    UnknownBroker(String),
}

/// MQTT topic filter matching with `+` (one level) and `#` (remaining levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
