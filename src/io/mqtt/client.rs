// src/io/mqtt/client.rs
//
// MQTT broker channel.
//
// The rumqttc event loop runs in its own task and its `poll` is never
// cancelled, so a reconnect (TCP, TLS, CONNECT/CONNACK) or a partially written
// batch always completes. Inbound publishes reach the bridge through a
// bounded queue that `pump` drains within its time bound.

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::io::{BridgeError, BrokerChannel, InboundMessage};
use crate::settings::BrokerConfig;

// ============================================================================
// Options
// ============================================================================

/// Build client options from configuration.
///
/// When TLS is required the server certificate is always validated against
/// the platform trust roots.
pub fn mqtt_options(config: &BrokerConfig, client_id: &str) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(true);

    if let Some((username, password)) = config.credentials() {
        options.set_credentials(username, password);
    }

    if config.tls_required() {
        options.set_transport(Transport::tls_with_default_config());
    }

    options
}

// ============================================================================
// Event Loop Task
// ============================================================================

/// State shared between the channel and its event loop task.
#[derive(Default)]
struct ConnectionState {
    connected: AtomicBool,
    /// Set once shutdown begins; connection errors then end the task
    stopping: AtomicBool,
    /// Filters renewed on every CONNACK
    subscriptions: Mutex<Vec<String>>,
}

impl ConnectionState {
    fn subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct EventLoopTask {
    eventloop: EventLoop,
    client: AsyncClient,
    endpoint: String,
    state: Arc<ConnectionState>,
    inbound: mpsc::Sender<InboundMessage>,
    reconnect_delay: Duration,
}

impl EventLoopTask {
    /// Poll until DISCONNECT has been sent, the channel is dropped, or a
    /// connection error occurs during shutdown.
    async fn run(mut self) {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!(endpoint = %self.endpoint, "DISCONNECT sent");
                    break;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                    if self.inbound.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => self.on_connack(),
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!(endpoint = %self.endpoint, "broker sent DISCONNECT");
                    self.state.connected.store(false, Ordering::Release);
                }
                Ok(_) => {}
                Err(e) => {
                    self.state.connected.store(false, Ordering::Release);
                    if self.state.stopping.load(Ordering::Acquire) {
                        break;
                    }
                    self.connection_lost(e).await;
                }
            }
        }

        self.state.connected.store(false, Ordering::Release);
        debug!(endpoint = %self.endpoint, "event loop stopped");
    }

    fn on_connack(&self) {
        info!(endpoint = %self.endpoint, "reconnected to broker");
        self.state.connected.store(true, Ordering::Release);

        // Clean session: the broker forgot our subscriptions
        for filter in self.state.subscriptions().iter() {
            if let Err(e) = self.client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                warn!(endpoint = %self.endpoint, "failed to renew subscription '{}': {}", filter, e);
            }
        }
    }

    /// rumqttc reconnects on the next poll; wait out the delay first.
    fn connection_lost(&self, error: ConnectionError) -> tokio::time::Sleep {
        warn!(
            endpoint = %self.endpoint,
            "connection error: {}; retrying in {} ms",
            error,
            self.reconnect_delay.as_millis()
        );
        tokio::time::sleep(self.reconnect_delay)
    }
}

// ============================================================================
// MQTT Broker
// ============================================================================

/// Connected MQTT client. Its event loop runs in a background task.
pub struct MqttBroker {
    client: AsyncClient,
    endpoint: String,
    state: Arc<ConnectionState>,
    inbound: mpsc::Receiver<InboundMessage>,
    task: Option<JoinHandle<()>>,
}

impl MqttBroker {
    /// Connect, wait for the broker's CONNACK, then start the event loop task.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BridgeError> {
        let endpoint = config.endpoint();
        let client_id = config.resolved_client_id();

        let options = mqtt_options(config, &client_id);
        let capacity = config.request_capacity.max(1);
        let (client, mut eventloop) = AsyncClient::new(options, capacity);

        let timeout = Duration::from_millis(config.connect_timeout_ms);
        match tokio::time::timeout(timeout, wait_for_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BridgeError::broker_connect(&endpoint, e.to_string())),
            Err(_) => {
                return Err(BridgeError::broker_connect(
                    &endpoint,
                    format!("no CONNACK within {} ms", config.connect_timeout_ms),
                ))
            }
        }

        info!(%endpoint, %client_id, tls = config.tls_required(), "connected to broker");

        let state = Arc::new(ConnectionState::default());
        state.connected.store(true, Ordering::Release);

        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let task = tokio::spawn(
            EventLoopTask {
                eventloop,
                client: client.clone(),
                endpoint: endpoint.clone(),
                state: state.clone(),
                inbound: inbound_tx,
                reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            }
            .run(),
        );

        Ok(Self {
            client,
            endpoint,
            state,
            inbound: inbound_rx,
            task: Some(task),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

#[async_trait]
impl BrokerChannel for MqttBroker {
    fn subscribe(&mut self, topic_filter: &str) -> Result<(), BridgeError> {
        self.client
            .try_subscribe(topic_filter, QoS::AtMostOnce)
            .map_err(|e| {
                BridgeError::broker_connect(
                    &self.endpoint,
                    format!("subscribe to '{}': {}", topic_filter, e),
                )
            })?;

        let mut subscriptions = self.state.subscriptions();
        if !subscriptions.iter().any(|s| s == topic_filter) {
            subscriptions.push(topic_filter.to_string());
        }
        info!(endpoint = %self.endpoint, "subscribed to '{}'", topic_filter);
        Ok(())
    }

    fn publish(&mut self, topic: &str, body: Vec<u8>) -> Result<(), BridgeError> {
        if !self.is_connected() {
            return Err(BridgeError::broker_publish(&self.endpoint, topic, "not connected"));
        }

        self.client
            .try_publish(topic, QoS::AtMostOnce, false, body)
            .map_err(|e| BridgeError::broker_publish(&self.endpoint, topic, e.to_string()))
    }

    async fn pump(&mut self, max_wait: Duration) -> Vec<InboundMessage> {
        let deadline = Instant::now() + max_wait;
        let mut inbound = Vec::new();

        loop {
            match tokio::time::timeout_at(deadline, self.inbound.recv()).await {
                Ok(Some(message)) => inbound.push(message),
                Ok(None) => {
                    // Event loop task is gone; keep the cycle's pacing
                    tokio::time::sleep_until(deadline).await;
                    break;
                }
                Err(_) => break,
            }
        }

        inbound
    }

    async fn shutdown(&mut self, timeout: Duration) {
        self.state.stopping.store(true, Ordering::Release);
        let Some(mut task) = self.task.take() else {
            return;
        };

        if !self.is_connected() {
            task.abort();
            info!(endpoint = %self.endpoint, "broker channel closed while disconnected");
            return;
        }

        // Queued behind any pending publishes, so they are flushed first
        if let Err(e) = self.client.try_disconnect() {
            warn!(endpoint = %self.endpoint, "failed to queue DISCONNECT: {}", e);
            task.abort();
            return;
        }

        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            warn!(endpoint = %self.endpoint, "timed out flushing publishes on shutdown");
            task.abort();
        }
        self.state.connected.store(false, Ordering::Release);
        info!(endpoint = %self.endpoint, "disconnected from broker");
    }
}

// ============================================================================
// Tests
// ============================================================================
