//! HTTP bridge: turns `<prefix>/<gateway>/http/request` messages into real
//! HTTP calls and publishes the outcome on `<prefix>/<gateway>/http/response`.

pub mod executor;
pub mod wire;


use crate::config::{qos_from_u8, HttpBridgeConfig};
use crate::gateway::{ModuleContext, ModuleError, ProtocolModule, RoutingHandle};
use crate::models::{InboundMessage, OutboundEnvelope};
use async_trait::async_trait;
use futures::FutureExt;
use rumqttc::QoS;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, warn};

pub use executor::HttpExecutor;
pub use wire::{decode_request, DecodedRequest, HttpCallRequest, HttpCallResponse, INVALID_RESPONSE_CODE};

pub const REQUEST_TOPIC_SUFFIX: &str = "http/request";
pub const RESPONSE_TOPIC_SUFFIX: &str = "http/response";

/// How long in-flight calls may keep running after shutdown is signalled.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Why a request could not be bridged. Every variant is reported on the
/// wire as `INVALID_RESPONSE_CODE`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
    #[error("Missing or invalid field: {0}")]
    MissingField(&'static str),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),
    #[error("Invalid body: {0}")]
    InvalidBody(String),
    #[error("HTTP call failed: {0}")]
    Transport(String),
}

/// Runs one request through decode, validate and execute. Always yields
/// exactly one response.
pub async fn handle_request(executor: &HttpExecutor, payload: &[u8]) -> HttpCallResponse {
    match decode_request(payload) {
        DecodedRequest::Valid(request) => match executor.execute(&request).await {
            Ok(response) => {
                debug!(id = %response.id, status = response.status, "HTTP call completed");
                response
            }
            Err(e) => {
                warn!(id = %request.id, url = %request.url, "HTTP call failed: {}", e);
                HttpCallResponse::invalid(request.id)
            }
        },
        DecodedRequest::Malformed { id, error } => {
            warn!(id = %id, "Rejected malformed HTTP request: {}", error);
            HttpCallResponse::invalid(id)
        }
    }
}

/// The HTTP bridge protocol module.
pub struct HttpBridge {
    config: HttpBridgeConfig,
}

impl HttpBridge {
    pub fn new(config: HttpBridgeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProtocolModule for HttpBridge {
    fn name(&self) -> &str {
        "http"
    }

    async fn start(&self, ctx: ModuleContext) -> Result<JoinHandle<()>, ModuleError> {
        let broker = self
            .config
            .broker
            .clone()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| ModuleError::Config("http.broker is required".to_string()))?;
        let prefix = ctx
            .brokers
            .topic_prefix(&broker)
            .ok_or_else(|| ModuleError::Config(format!("http.broker '{}' is not configured", broker)))?
            .to_string();
        let qos = match self.config.qos {
            Some(qos) => qos_from_u8(qos)
                .ok_or_else(|| ModuleError::Config("http.qos must be 0, 1 or 2".to_string()))?,
            None => ctx.brokers.default_qos(&broker).unwrap_or(QoS::AtMostOnce),
        };
        if self.config.timeout_secs == 0 {
            return Err(ModuleError::Config("http.timeout must be positive".to_string()));
        }

        let executor = HttpExecutor::new(Duration::from_secs(self.config.timeout_secs))
            .map_err(|e| ModuleError::Start(e.to_string()))?;
        let request_topic = ctx.identity.topic_with_prefix(&prefix, REQUEST_TOPIC_SUFFIX);
        let response_topic = ctx.identity.topic_with_prefix(&prefix, RESPONSE_TOPIC_SUFFIX);

        let worker = Arc::new(BridgeWorker {
            executor,
            router: ctx.router.clone(),
            broker: broker.clone(),
            response_topic,
            qos,
            retain: self.config.retain,
            shutdown: ctx.shutdown.clone(),
            in_flight: InFlight::default(),
        });

        let handler_worker = worker.clone();
        ctx.brokers
            .subscribe(
                &broker,
                &request_topic,
                qos,
                Arc::new(move |message| handler_worker.clone().handle(message).boxed()),
            )
            .await?;
        info!(topic = %request_topic, broker = %broker, "HTTP bridge listening");

        let mut shutdown = ctx.shutdown;
        Ok(tokio::spawn(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            if timeout(SHUTDOWN_GRACE * 2, worker.in_flight.wait_idle()).await.is_err() {
                warn!("HTTP bridge stopped with calls still in flight");
            }
        }))
    }
}

struct BridgeWorker {
    executor: HttpExecutor,
    router: RoutingHandle,
    broker: String,
    response_topic: String,
    qos: QoS,
    retain: bool,
    shutdown: watch::Receiver<bool>,
    in_flight: InFlight,
}

impl BridgeWorker {
    async fn handle(self: Arc<Self>, message: InboundMessage) {
        if *self.shutdown.borrow() {
            debug!("Ignoring HTTP request received during shutdown");
            return;
        }
        let _guard = self.in_flight.enter();

        let mut shutdown = self.shutdown.clone();
        let response = tokio::select! {
            response = handle_request(&self.executor, &message.payload) => response,
            _ = grace_expired(&mut shutdown) => {
                warn!("Abandoned in-flight HTTP call after shutdown grace period");
                return;
            }
        };

        let payload = match serde_json::to_vec(&response) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode HTTP response: {}", e);
                return;
            }
        };
        // Answer on the broker the request arrived on.
        let envelope = OutboundEnvelope::new(&self.broker, self.response_topic.clone(), self.qos, payload)
            .retained(self.retain)
            .on_session(message.origin);
        if let Err(e) = self.router.submit(envelope).await {
            error!(id = %response.id, "Failed to route HTTP response: {}", e);
        }
    }
}

async fn grace_expired(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
    sleep(SHUTDOWN_GRACE).await;
}

/// Counts running handlers so shutdown can wait for them.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard<'a>(&'a InFlight);

impl InFlight {
    fn enter(&self) -> InFlightGuard<'_> {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}
