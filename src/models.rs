use rumqttc::QoS;

/// Who this gateway is on the broker. Fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayIdentity {
    name: String,
    topic_prefix: String,
}

impl GatewayIdentity {
    pub fn new(name: impl Into<String>, topic_prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topic_prefix: topic_prefix.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic_prefix(&self) -> &str {
        &self.topic_prefix
    }

    /// `<prefix>/<name>/<suffix>` using the given broker prefix.
    pub fn topic_with_prefix(&self, prefix: &str, suffix: &str) -> String {
        format!("{}/{}/{}", prefix, self.name, suffix.trim_start_matches('/'))
    }

    /// `<prefix>/<name>/<suffix>` using the gateway's own prefix.
    pub fn topic(&self, suffix: &str) -> String {
        self.topic_with_prefix(&self.topic_prefix, suffix)
    }

    /// Persistent MQTT client id for a broker with the given prefix.
    pub fn client_id(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.name)
    }
}

/// One publish handed to the broker manager. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEnvelope {
    pub broker_name: String,
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Vec<u8>,
    /// Label of the session to publish on. When unset, or when the group has
    /// no such session, the group's preferred session is used.
    pub session: Option<String>,
}

impl OutboundEnvelope {
    pub fn new(broker_name: &str, topic: String, qos: QoS, payload: Vec<u8>) -> Self {
        Self {
            broker_name: broker_name.to_string(),
            topic,
            qos,
            retain: false,
            payload,
            session: None,
        }
    }

    pub fn retained(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Pins the envelope to one session of its broker group.
    pub fn on_session(mut self, label: Option<String>) -> Self {
        self.session = label;
        self
    }
}

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Label of the broker session that delivered the message.
    pub origin: Option<String>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            origin: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_topics_and_client_id() {
        let identity = GatewayIdentity::new("edge1", "prefix");
        assert_eq!(identity.topic("http/request"), "prefix/edge1/http/request");
        assert_eq!(
            identity.topic_with_prefix("other", "/http/response"),
            "other/edge1/http/response"
        );
        assert_eq!(identity.client_id("prefix"), "prefixedge1");
    }

    #[test]
    fn empty_prefix_keeps_leading_separator() {
        let identity = GatewayIdentity::new("edge1", "");
        assert_eq!(identity.topic("http/request"), "/edge1/http/request");
    }
}
