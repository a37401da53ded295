use crate::broker::transport::{Transport, TransportClient, TransportEvents};
use crate::broker::{topic_matches, BrokerError};
use crate::config::BrokerConfig;
use crate::models::InboundMessage;
use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use rumqttc::QoS;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_retry::strategy::FixedInterval;

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Callback for messages on a subscribed topic. Each invocation runs on its
/// own task.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

struct Subscription {
    filter: String,
    qos: QoS,
    handlers: Vec<MessageHandler>,
}

/// One managed connection to one upstream broker.
///
/// Only the session's own run loop writes the connection handle and the
/// state; everything else reads.
pub struct BrokerSession {
    config: BrokerConfig,
    label: String,
    transport: Arc<dyn Transport>,
    client: Mutex<Option<Arc<dyn TransportClient>>>,
    publish_lock: Mutex<()>,
    subscriptions: RwLock<Vec<Subscription>>,
    state: watch::Sender<SessionState>,
    last_error: RwLock<Option<BrokerError>>,
    connect_attempts: AtomicU64,
    shutdown: watch::Sender<bool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BrokerSession {
    pub fn new(config: BrokerConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let label = config.label();
        Arc::new(Self {
            config,
            label,
            transport,
            client: Mutex::new(None),
            publish_lock: Mutex::new(()),
            subscriptions: RwLock::new(Vec::new()),
            state: watch::channel(SessionState::Connecting).0,
            last_error: RwLock::new(None),
            connect_attempts: AtomicU64::new(0),
            shutdown: watch::channel(false).0,
            task: std::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Every state transition, without repeats.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Number of connection attempts made so far, including the first.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<BrokerError> {
        self.last_error.read().ok().and_then(|e| e.clone())
    }

    /// Resolves once the session reaches `state`.
    pub async fn wait_for_state(&self, state: SessionState) {
        let mut changes = self.state.subscribe();
        let _ = changes.wait_for(|current| *current == state).await;
    }

    /// Spawns the connect/reconnect loop. Calling it twice has no effect.
    pub fn start(self: &Arc<Self>) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.is_some() || *self.shutdown.borrow() {
            return;
        }
        info!("Starting broker session {}...", self.label);
        let session = self.clone();
        *task = Some(tokio::spawn(async move { session.run().await }));
    }

    /// Registers `handler` for `filter`. The subscription is issued now if
    /// connected and re-issued after every reconnect.
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), BrokerError> {
        if self.state() == SessionState::Closed {
            return Err(BrokerError::Closed(self.label.clone()));
        }

        let qos = {
            let mut subscriptions = self
                .subscriptions
                .write()
                .map_err(|_| BrokerError::Subscribe("subscription registry poisoned".to_string()))?;
            match subscriptions.iter_mut().find(|s| s.filter == filter) {
                Some(existing) => {
                    existing.handlers.push(handler);
                    existing.qos = max_qos(existing.qos, qos);
                    existing.qos
                }
                None => {
                    subscriptions.push(Subscription {
                        filter: filter.to_string(),
                        qos,
                        handlers: vec![handler],
                    });
                    qos
                }
            }
        };

        // Registered before checking the client: the run loop stores the
        // client before reading the registry, so one of the two issues it.
        let client = self.client.lock().await.clone();
        if let Some(client) = client {
            match client.subscribe(filter, qos).await {
                Ok(()) => info!("Subscribed to '{}' on {}.", filter, self.label),
                Err(e) => warn!(
                    "Failed to subscribe to '{}' on {}, will retry on reconnect: {}",
                    filter, self.label, e
                ),
            }
        } else {
            debug!("Subscription to '{}' on {} deferred until connected.", filter, self.label);
        }
        Ok(())
    }

    /// Sends one message. Calls are serialized in submission order; the
    /// connection handle itself is only held long enough to clone it.
    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let _order = self.publish_lock.lock().await;
        let client = self.client.lock().await.clone();
        match client {
            Some(client) => {
                client.publish(topic, qos, retain, payload).await?;
                debug!("Message published to '{}' on {}.", topic, self.label);
                Ok(())
            }
            None if self.state() == SessionState::Closed => Err(BrokerError::Closed(self.label.clone())),
            None => Err(BrokerError::NotConnected(self.label.clone())),
        }
    }

    /// Stops the run loop and leaves the session `Closed`.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);

        let task = self.task.lock().ok().and_then(|mut task| task.take());
        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    error!("Broker session {} task failed: {:?}", self.label, e);
                }
            }
            None => self.set_state(SessionState::Closed),
        }
        info!("Broker session {} closed.", self.label);
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut delays = self.config.retry_interval().map(FixedInterval::new);

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            self.set_state(SessionState::Connecting);
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);

            let connected = tokio::select! {
                result = self.transport.connect() => result,
                _ = shutdown.changed() => break,
            };

            match connected {
                Ok((client, events)) => {
                    self.on_connected(client).await;
                    let result = self.pump(events, &mut shutdown).await;
                    self.client.lock().await.take();
                    match result {
                        Ok(()) => break,
                        Err(e) => {
                            warn!("Lost connection to broker {}: {}", self.label, e);
                            self.record_error(e);
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to connect to broker {}: {}", self.label, e);
                    self.record_error(e);
                }
            }

            self.set_state(SessionState::Disconnected);

            let Some(delay) = delays.as_mut().and_then(Iterator::next) else {
                warn!("Retry disabled for broker {}; staying disconnected.", self.label);
                let _ = shutdown.wait_for(|closed| *closed).await;
                break;
            };

            info!("Reconnecting to broker {} in {:?}...", self.label, delay);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.set_state(SessionState::Closed);
    }

    async fn on_connected(&self, client: Arc<dyn TransportClient>) {
        *self.client.lock().await = Some(client.clone());

        let filters: Vec<(String, QoS)> = match self.subscriptions.read() {
            Ok(subscriptions) => subscriptions.iter().map(|s| (s.filter.clone(), s.qos)).collect(),
            Err(_) => Vec::new(),
        };
        for (filter, qos) in filters {
            match client.subscribe(&filter, qos).await {
                Ok(()) => info!("Subscribed to '{}' on {}.", filter, self.label),
                Err(e) => error!("Failed to subscribe to '{}' on {}: {}", filter, self.label, e),
            }
        }

        self.set_state(SessionState::Connected);
    }

    /// Delivers inbound messages until the connection drops (`Err`) or the
    /// session is shut down (`Ok`).
    async fn pump(
        &self,
        mut events: Box<dyn TransportEvents>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), BrokerError> {
        loop {
            tokio::select! {
                message = events.next_message() => self.dispatch(message?),
                _ = shutdown.changed() => break,
            }
        }

        let client = self.client.lock().await.take();
        if let Some(client) = client {
            match timeout(DISCONNECT_TIMEOUT, client.disconnect())
                .await
                .unwrap_or_else(|_| Err(BrokerError::Connection("disconnect timed out".to_string())))
            {
                // The event stream must keep being polled for the disconnect to go out.
                Ok(()) => {
                    let _ = timeout(DISCONNECT_TIMEOUT, async {
                        while events.next_message().await.is_ok() {}
                    })
                    .await;
                }
                Err(e) => debug!("Disconnect from {} failed: {}", self.label, e),
            }
        }
        Ok(())
    }

    fn dispatch(&self, mut message: InboundMessage) {
        message.origin = Some(self.label.clone());
        let handlers: Vec<MessageHandler> = match self.subscriptions.read() {
            Ok(subscriptions) => subscriptions
                .iter()
                .filter(|s| topic_matches(&s.filter, &message.topic))
                .flat_map(|s| s.handlers.iter().cloned())
                .collect(),
            Err(_) => Vec::new(),
        };

        if handlers.is_empty() {
            warn!("Unknown topic received on {}: {}", self.label, message.topic);
            return;
        }

        for handler in handlers {
            tokio::spawn(handler(message.clone()));
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("Broker session {}: {:?} -> {:?}", self.label, current, state);
            *current = state;
            true
        });
    }

    fn record_error(&self, error: BrokerError) {
        if let Ok(mut last_error) = self.last_error.write() {
            *last_error = Some(error);
        }
    }
}

fn max_qos(a: QoS, b: QoS) -> QoS {
    if (a as u8) >= (b as u8) {
        a
    } else {
        b
    }
}
