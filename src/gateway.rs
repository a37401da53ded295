//! Gateway core: identity, broker manager and protocol modules wired to one
//! routing channel.

use crate::broker::{BrokerDirectory, BrokerError, BrokerManager, MqttTransportFactory, TransportFactory};
use crate::config::Config;
use crate::http_bridge::HttpBridge;
use crate::models::{GatewayIdentity, OutboundEnvelope};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

const ROUTING_CHANNEL_CAPACITY: usize = 1024;
const MODULE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("No broker configured")]
    NoBrokers,
    #[error("Routing channel is closed")]
    RoutingClosed,
}

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("Invalid module configuration: {0}")]
    Config(String),
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("Module failed to start: {0}")]
    Start(String),
}

/// Write-only handle onto the gateway's routing channel.
#[derive(Clone, Debug)]
pub struct RoutingHandle {
    tx: mpsc::Sender<OutboundEnvelope>,
}

impl RoutingHandle {
    pub fn new(tx: mpsc::Sender<OutboundEnvelope>) -> Self {
        Self { tx }
    }

    pub async fn submit(&self, envelope: OutboundEnvelope) -> Result<(), GatewayError> {
        self.tx.send(envelope).await.map_err(|_| GatewayError::RoutingClosed)
    }
}

/// Everything a protocol module gets from the gateway.
#[derive(Clone)]
pub struct ModuleContext {
    pub identity: Arc<GatewayIdentity>,
    pub router: RoutingHandle,
    pub brokers: BrokerDirectory,
    pub shutdown: watch::Receiver<bool>,
}

/// A bridge between one local protocol and the routing channel.
#[async_trait]
pub trait ProtocolModule: Send + Sync {
    fn name(&self) -> &str;

    /// Starts the module. The returned task finishes once the module has
    /// stopped after `ctx.shutdown` turns true.
    async fn start(&self, ctx: ModuleContext) -> Result<JoinHandle<()>, ModuleError>;
}

/// Modules enabled by the configuration.
pub fn configured_modules(config: &Config) -> Vec<Arc<dyn ProtocolModule>> {
    let mut modules: Vec<Arc<dyn ProtocolModule>> = Vec::new();
    match &config.http {
        Some(http) if http.enabled => modules.push(Arc::new(HttpBridge::new(http.clone()))),
        Some(_) => info!("HTTP bridge disabled by configuration."),
        None => {}
    }
    modules
}

struct RunningModule {
    name: String,
    task: JoinHandle<()>,
}

pub struct Gateway {
    identity: Arc<GatewayIdentity>,
    manager: BrokerManager,
    modules: Vec<RunningModule>,
    shutdown: watch::Sender<bool>,
}

impl Gateway {
    /// Starts a gateway against real MQTT brokers with the configured modules.
    pub async fn start(config: &Config) -> Result<Self, GatewayError> {
        Self::start_with(config, &MqttTransportFactory, configured_modules(config)).await
    }

    pub async fn start_with(
        config: &Config,
        factory: &dyn TransportFactory,
        modules: Vec<Arc<dyn ProtocolModule>>,
    ) -> Result<Self, GatewayError> {
        let primary = config.brokers.first().ok_or(GatewayError::NoBrokers)?;
        let identity = Arc::new(GatewayIdentity::new(
            config.gateway.name.clone(),
            primary.topic_prefix.clone(),
        ));
        info!("Starting gateway '{}'...", identity.name());

        let (tx, rx) = mpsc::channel(ROUTING_CHANNEL_CAPACITY);
        let router = RoutingHandle::new(tx);
        let manager = BrokerManager::new(&config.brokers, &identity, factory);
        manager.start(rx).await;

        let (shutdown, _) = watch::channel(false);
        let mut running = Vec::new();
        for module in modules {
            let ctx = ModuleContext {
                identity: identity.clone(),
                router: router.clone(),
                brokers: manager.directory(),
                shutdown: shutdown.subscribe(),
            };
            match module.start(ctx).await {
                Ok(task) => {
                    info!("Module '{}' started.", module.name());
                    running.push(RunningModule {
                        name: module.name().to_string(),
                        task,
                    });
                }
                Err(e) => error!("Module '{}' failed to start: {}", module.name(), e),
            }
        }

        Ok(Self {
            identity,
            manager,
            modules: running,
            shutdown,
        })
    }

    pub fn identity(&self) -> &GatewayIdentity {
        &self.identity
    }

    pub fn brokers(&self) -> BrokerDirectory {
        self.manager.directory()
    }

    pub fn running_modules(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name.as_str()).collect()
    }

    /// Signals every module, waits for them, then shuts the brokers down.
    pub async fn shutdown(self) {
        info!("Shutting down gateway '{}'...", self.identity.name());
        self.shutdown.send_replace(true);

        for module in self.modules {
            let abort = module.task.abort_handle();
            match timeout(MODULE_STOP_TIMEOUT, module.task).await {
                Ok(Ok(())) => info!("Module '{}' stopped.", module.name),
                Ok(Err(e)) => error!("Module '{}' task failed: {:?}", module.name, e),
                Err(_) => {
                    warn!("Module '{}' did not stop in time; aborting.", module.name);
                    abort.abort();
                }
            }
        }

        self.manager.shutdown().await;
        info!("Gateway '{}' shut down.", self.identity.name());
    }
}
