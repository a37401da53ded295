use crate::broker::session::{BrokerSession, MessageHandler};
use crate::broker::transport::TransportFactory;
use crate::broker::BrokerError;
use crate::config::BrokerConfig;
use crate::models::{GatewayIdentity, OutboundEnvelope};
use futures::future::join_all;
use log::{debug, error, info, warn};
use rumqttc::QoS;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;

const PUBLISH_RETRY_DELAY_MS: u64 = 1000;
const PUBLISH_RETRIES: usize = 2;
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Read-only view of the sessions, grouped by broker name and ordered by
/// priority.
#[derive(Clone, Default)]
pub struct BrokerDirectory {
    groups: Arc<BTreeMap<String, Vec<Arc<BrokerSession>>>>,
}

impl BrokerDirectory {
    pub fn sessions(&self, name: &str) -> &[Arc<BrokerSession>] {
        self.groups.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn all_sessions(&self) -> impl Iterator<Item = &Arc<BrokerSession>> {
        self.groups.values().flatten()
    }

    /// The connected session with the best priority, or the best-priority
    /// session when none is connected.
    pub fn select(&self, name: &str) -> Option<Arc<BrokerSession>> {
        let sessions = self.groups.get(name)?;
        sessions
            .iter()
            .find(|s| s.is_connected())
            .or_else(|| sessions.first())
            .cloned()
    }

    /// The session labelled `label` when the group has it, otherwise the
    /// group's preferred session.
    pub fn select_for(&self, name: &str, label: Option<&str>) -> Option<Arc<BrokerSession>> {
        label
            .and_then(|label| self.sessions(name).iter().find(|s| s.label() == label).cloned())
            .or_else(|| self.select(name))
    }

    /// QoS configured on the preferred session of a broker group.
    pub fn default_qos(&self, name: &str) -> Option<QoS> {
        self.sessions(name).first().map(|s| s.config().qos())
    }

    /// Topic prefix of the preferred session of a broker group.
    pub fn topic_prefix(&self, name: &str) -> Option<&str> {
        self.groups
            .get(name)
            .and_then(|sessions| sessions.first())
            .map(|s| s.config().topic_prefix.as_str())
    }

    /// Registers `handler` on every session of the named broker group.
    pub async fn subscribe(
        &self,
        name: &str,
        filter: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), BrokerError> {
        let sessions = self
            .groups
            .get(name)
            .ok_or_else(|| BrokerError::UnknownBroker(name.to_string()))?;
        for session in sessions {
            session.subscribe(filter, qos, handler.clone()).await?;
        }
        Ok(())
    }
}

/// Owns every broker session of one gateway and fans outbound envelopes out
/// to them.
pub struct BrokerManager {
    directory: BrokerDirectory,
    shutdown: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerManager {
    /// Creates and starts one session per broker definition.
    pub fn new(
        configs: &[BrokerConfig],
        identity: &GatewayIdentity,
        factory: &dyn TransportFactory,
    ) -> Self {
        let mut groups: BTreeMap<String, Vec<Arc<BrokerSession>>> = BTreeMap::new();
        for config in configs {
            let client_id = identity.client_id(&config.topic_prefix);
            let transport = factory.create(config, &client_id);
            let session = BrokerSession::new(config.clone(), transport);
            session.start();
            groups.entry(config.name.clone()).or_default().push(session);
        }
        for sessions in groups.values_mut() {
            sessions.sort_by_key(|s| s.config().priority);
        }

        Self {
            directory: BrokerDirectory {
                groups: Arc::new(groups),
            },
            shutdown: watch::channel(false).0,
            dispatcher: Mutex::new(None),
        }
    }

    pub fn directory(&self) -> BrokerDirectory {
        self.directory.clone()
    }

    /// Starts consuming the routing channel.
    pub async fn start(&self, routing: mpsc::Receiver<OutboundEnvelope>) {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.is_some() {
            warn!("Broker manager already started.");
            return;
        }
        let directory = self.directory.clone();
        let shutdown = self.shutdown.subscribe();
        *dispatcher = Some(tokio::spawn(dispatch(directory, routing, shutdown)));
        info!("Broker manager started.");
    }

    /// Stops accepting envelopes, waits for queued publishes, then closes
    /// every session.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        if let Some(task) = self.dispatcher.lock().await.take() {
            if let Err(e) = task.await {
                error!("Broker manager dispatch task failed: {:?}", e);
            }
        }

        join_all(self.directory.all_sessions().map(|s| s.close())).await;
        info!("Broker manager shut down.");
    }
}

struct Worker {
    queue: mpsc::UnboundedSender<OutboundEnvelope>,
    task: JoinHandle<()>,
}

async fn dispatch(
    directory: BrokerDirectory,
    mut routing: mpsc::Receiver<OutboundEnvelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut workers: HashMap<String, Worker> = HashMap::new();

    loop {
        let envelope = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            envelope = routing.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };
        route(&directory, &mut workers, envelope);
    }

    // Envelopes already queued by producers still go out.
    routing.close();
    while let Some(envelope) = routing.recv().await {
        route(&directory, &mut workers, envelope);
    }

    let tasks: Vec<JoinHandle<()>> = workers.into_values().map(|w| w.task).collect();
    let abort_handles: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
    if timeout(SHUTDOWN_TIMEOUT, join_all(tasks)).await.is_err() {
        warn!("Timed out waiting for in-flight publishes; aborting them.");
        for handle in abort_handles {
            handle.abort();
        }
    }
}

fn route(directory: &BrokerDirectory, workers: &mut HashMap<String, Worker>, envelope: OutboundEnvelope) {
    let Some(session) = directory.select_for(&envelope.broker_name, envelope.session.as_deref()) else {
        error!(
            "Routing error: no broker named '{}', dropping message for topic '{}'.",
            envelope.broker_name, envelope.topic
        );
        return;
    };

    let worker = workers.entry(session.label().to_string()).or_insert_with(|| {
        let (queue, rx) = mpsc::unbounded_channel();
        Worker {
            queue,
            task: tokio::spawn(publish_worker(session.clone(), rx)),
        }
    });

    if worker.queue.send(envelope).is_err() {
        error!("Publish worker for {} is gone; message dropped.", session.label());
    }
}

/// Publishes one session's envelopes in the order they were routed.
async fn publish_worker(session: Arc<BrokerSession>, mut queue: mpsc::UnboundedReceiver<OutboundEnvelope>) {
    while let Some(envelope) = queue.recv().await {
        let strategy = FixedInterval::from_millis(PUBLISH_RETRY_DELAY_MS).take(PUBLISH_RETRIES);
        let result = RetryIf::spawn(
            strategy,
            || {
                session.publish(
                    &envelope.topic,
                    envelope.qos,
                    envelope.retain,
                    envelope.payload.clone(),
                )
            },
            |e: &BrokerError| !matches!(e, BrokerError::Closed(_)),
        )
        .await;

        match result {
            Ok(()) => debug!("Routed message to '{}' via {}.", envelope.topic, session.label()),
            Err(e) => error!(
                "Failed to publish message to topic '{}' via {}, dropping it: {}",
                envelope.topic,
                session.label(),
                e
            ),
        }
    }
}
