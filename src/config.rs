use dotenvy::dotenv;
use rumqttc::QoS;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Configuration field {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

/// Validated gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub gateway: GatewaySection,
    pub brokers: Vec<BrokerConfig>,
    pub http: Option<HttpBridgeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    pub name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// One upstream broker definition. Several definitions may share a `name`
/// and differ in `priority`; lower numbers are preferred.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub name: String,
    pub priority: u32,
    pub host: String,
    pub port: u16,
    pub topic_prefix: String,
    pub qos: u8,
    pub retry_interval_secs: u64,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BrokerConfig {
    pub fn new(name: &str, host: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            priority: 1,
            host: host.to_string(),
            port,
            topic_prefix: String::new(),
            qos: 0,
            retry_interval_secs: default_retry_interval(),
            keep_alive_secs: default_keep_alive(),
            username: None,
            password: None,
        }
    }

    /// `None` when the broker is configured not to retry.
    pub fn retry_interval(&self) -> Option<Duration> {
        if self.retry_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.retry_interval_secs))
        }
    }

    pub fn qos(&self) -> QoS {
        qos_from_u8(self.qos).unwrap_or(QoS::AtMostOnce)
    }

    /// `name/priority`, unique per gateway.
    pub fn label(&self) -> String {
        format!("{}/{}", self.name, self.priority)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HttpBridgeConfig {
    pub broker: Option<String>,
    /// Falls back to the bridge broker's own `qos` when unset.
    pub qos: Option<u8>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_http_timeout", rename = "timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retain: bool,
}

impl Default for HttpBridgeConfig {
    fn default() -> Self {
        Self {
            broker: None,
            qos: None,
            enabled: false,
            timeout_secs: default_http_timeout(),
            retain: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    gateway: Option<GatewaySection>,
    #[serde(default)]
    broker: BTreeMap<String, Vec<RawBroker>>,
    http: Option<HttpBridgeConfig>,
}

#[derive(Debug, Deserialize)]
struct RawBroker {
    host: Option<String>,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    topic_prefix: String,
    #[serde(default)]
    qos: u8,
    #[serde(default = "default_retry_interval")]
    retry_interval: u64,
    #[serde(default = "default_keep_alive")]
    keep_alive: u64,
    username: Option<String>,
    password: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    DEFAULT_MQTT_PORT
}

fn default_retry_interval() -> u64 {
    10
}

fn default_keep_alive() -> u64 {
    60
}

fn default_http_timeout() -> u64 {
    10
}

pub fn qos_from_u8(qos: u8) -> Option<QoS> {
    match qos {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Splits a `name/priority` broker key. A key without `/` has priority 1.
fn parse_broker_key(key: &str) -> Result<(String, u32), ConfigError> {
    let (name, priority) = match key.rsplit_once('/') {
        Some((name, priority)) => {
            let priority = priority.parse::<u32>().map_err(|_| {
                ConfigError::ParsingError(format!("broker priority in '{}' must be a number", key))
            })?;
            (name, priority)
        }
        None => (key, 1),
    };

    if name.is_empty() {
        return Err(ConfigError::MissingOrInvalid(format!("broker name in '{}'", key)));
    }
    Ok((name.to_string(), priority))
}

impl Config {
    /// Loads `.env`, then the TOML file named by `GATEWAY_CONFIG`.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();

        let path = env::var("GATEWAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_file(path)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content)?;

        let gateway = raw
            .gateway
            .ok_or_else(|| ConfigError::MissingOrInvalid("gateway".to_string()))?;

        let mut brokers = Vec::new();
        for (key, entries) in raw.broker {
            let (name, priority) = parse_broker_key(&key)?;
            for entry in entries {
                brokers.push(BrokerConfig {
                    name: name.clone(),
                    priority,
                    host: entry
                        .host
                        .ok_or_else(|| ConfigError::MissingOrInvalid(format!("broker.{}.host", key)))?,
                    port: entry.port,
                    topic_prefix: entry.topic_prefix,
                    qos: entry.qos,
                    retry_interval_secs: entry.retry_interval,
                    keep_alive_secs: entry.keep_alive,
                    username: entry.username,
                    password: entry.password,
                });
            }
        }
        brokers.sort_by(|a, b| a.name.cmp(&b.name).then(a.priority.cmp(&b.priority)));

        let config = Self {
            gateway,
            brokers,
            http: raw.http,
        };
        config.validate()?;
        Ok(config)
    }

    /// Gateway-level checks. The `[http]` block is validated when the bridge
    /// module starts, so a bad block only disables that module.
    fn validate(&self) -> Result<(), ConfigError> {
        let name = &self.gateway.name;
        if name.is_empty() || name.contains(['/', '+', '#']) {
            return Err(ConfigError::MissingOrInvalid("gateway.name".to_string()));
        }

        for broker in &self.brokers {
            if broker.host.is_empty() {
                return Err(ConfigError::MissingOrInvalid(format!("broker.{}.host", broker.label())));
            }
            if broker.port == 0 {
                return Err(ConfigError::ParsingError(format!(
                    "broker.{}.port must be between 1 and 65535",
                    broker.label()
                )));
            }
            if qos_from_u8(broker.qos).is_none() {
                return Err(ConfigError::ParsingError(format!(
                    "broker.{}.qos must be 0, 1 or 2",
                    broker.label()
                )));
            }
        }

        let mut labels: Vec<String> = self.brokers.iter().map(BrokerConfig::label).collect();
        labels.dedup();
        if labels.len() != self.brokers.len() {
            return Err(ConfigError::ParsingError(
                "each broker name/priority pair may only be defined once".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[gateway]

    name = "httppostconnect"

[[broker."mosquitto/1"]]

    host = "localhost"
    port = 1883
    topic_prefix = "prefix"

    retry_interval = 10

[[broker."mosquitto/2"]]

    host = "backup.local"

[http]
    broker = "mosquitto"
    qos = 2
    enabled = true
"#;

    #[test]
    fn parses_brokers_and_http_block() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.gateway.name, "httppostconnect");
        assert_eq!(config.gateway.log_level, "info");
        assert_eq!(config.brokers.len(), 2);

        let primary = &config.brokers[0];
        assert_eq!(primary.name, "mosquitto");
        assert_eq!(primary.priority, 1);
        assert_eq!(primary.topic_prefix, "prefix");
        assert_eq!(primary.retry_interval(), Some(Duration::from_secs(10)));

        let backup = &config.brokers[1];
        assert_eq!(backup.priority, 2);
        assert_eq!(backup.port, DEFAULT_MQTT_PORT);
        assert_eq!(backup.topic_prefix, "");

        let http = config.http.unwrap();
        assert_eq!(http.broker.as_deref(), Some("mosquitto"));
        assert_eq!(http.qos, Some(2));
        assert!(http.enabled);
        assert_eq!(http.timeout_secs, 10);
    }

    #[test]
    fn broker_key_without_priority_defaults_to_one() {
        assert_eq!(parse_broker_key("local").unwrap(), ("local".to_string(), 1));
        assert!(parse_broker_key("local/x").is_err());
        assert!(parse_broker_key("/3").is_err());
    }

    #[test]
    fn zero_retry_interval_disables_retry() {
        let mut broker = BrokerConfig::new("b", "localhost", 1883);
        broker.retry_interval_secs = 0;
        assert_eq!(broker.retry_interval(), None);
    }

    #[test]
    fn rejects_missing_gateway_and_bad_names() {
        assert!(matches!(
            Config::from_toml_str("[[broker.\"a/1\"]]\nhost = \"h\"\n"),
            Err(ConfigError::MissingOrInvalid(_))
        ));
        assert!(Config::from_toml_str("[gateway]\nname = \"a/b\"\n").is_err());
        assert!(Config::from_toml_str("[gateway]\nname = \"\"\n").is_err());
    }

    #[test]
    fn rejects_bad_broker_fields() {
        let missing_host = "[gateway]\nname = \"g\"\n[[broker.\"a/1\"]]\nport = 1883\n";
        assert!(Config::from_toml_str(missing_host).is_err());

        let bad_qos = "[gateway]\nname = \"g\"\n[[broker.\"a/1\"]]\nhost = \"h\"\nqos = 3\n";
        assert!(matches!(
            Config::from_toml_str(bad_qos),
            Err(ConfigError::ParsingError(_))
        ));

        let duplicate =
            "[gateway]\nname = \"g\"\n[[broker.\"a/1\"]]\nhost = \"h\"\n[[broker.\"a/1\"]]\nhost = \"i\"\n";
        assert!(Config::from_toml_str(duplicate).is_err());
    }

    #[test]
    fn gateway_without_brokers_still_parses() {
        // The gateway itself refuses to start without a broker.
        let config = Config::from_toml_str("[gateway]\nname = \"g\"\n").unwrap();
        assert!(config.brokers.is_empty());
        assert!(config.http.is_none());
    }

    #[test]
    fn http_qos_is_optional_and_broker_qos_is_kept() {
        let content = "[gateway]\nname = \"g\"\n[[broker.\"a/1\"]]\nhost = \"h\"\nqos = 1\n[http]\nbroker = \"a\"\n";
        let config = Config::from_toml_str(content).unwrap();
        assert_eq!(config.brokers[0].qos(), QoS::AtLeastOnce);
        let http = config.http.unwrap();
        assert_eq!(http.qos, None);
        assert!(!http.enabled);
    }
}
