//! MQTT transport built on `rumqttc`
//!
//! The rumqttc event loop runs on a background task. Incoming publishes are
//! forwarded to the `Inbox`, and `connect()` resolves on the first CONNACK.
//!
//! Sessions are clean, so the broker forgets subscriptions when the link
//! drops. The transport remembers its filters and subscribes them again on
//! every later CONNACK, then bumps the `reconnects` counter.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectionError, Event, LastWill, MqttOptions, Outgoing, Packet, QoS,
    SubscribeFilter,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::topic::validate_filter;
use crate::{ConnectOptions, Inbox, Transport, TransportMessage};

/// Broker endpoint settings
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub keep_alive: Duration,
    /// Capacity of the rumqttc request channel
    pub capacity: usize,
}

impl MqttSettings {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
            keep_alive: Duration::from_secs(30),
            capacity: 64,
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Topic filters currently subscribed, in subscription order
#[derive(Debug, Default)]
struct SubscriptionSet {
    filters: Vec<String>,
}

impl SubscriptionSet {
    fn add(&mut self, filter: &str) -> bool {
        if self.filters.iter().any(|f| f == filter) {
            return false;
        }
        self.filters.push(filter.to_string());
        true
    }

    fn remove(&mut self, filter: &str) -> bool {
        let before = self.filters.len();
        self.filters.retain(|f| f != filter);
        self.filters.len() != before
    }

    fn snapshot(&self) -> Vec<String> {
        self.filters.clone()
    }

    fn clear(&mut self) {
        self.filters.clear();
    }
}

type Subscriptions = Arc<Mutex<SubscriptionSet>>;

fn lock(subscriptions: &Subscriptions) -> std::sync::MutexGuard<'_, SubscriptionSet> {
    subscriptions.lock().unwrap_or_else(|e| e.into_inner())
}

/// MQTT connection to a broker
pub struct MqttTransport {
    settings: MqttSettings,
    client: Mutex<Option<AsyncClient>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    subscriptions: Subscriptions,
    reconnects: Arc<watch::Sender<u64>>,
}

impl MqttTransport {
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings,
            client: Mutex::new(None),
            event_loop: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            subscriptions: Arc::default(),
            reconnects: Arc::new(watch::channel(0).0),
        }
    }

    fn client(&self) -> Result<AsyncClient> {
        self.client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    fn mqtt_options(&self, options: &ConnectOptions) -> MqttOptions {
        let mut mqtt = MqttOptions::new(
            options.client_id.clone(),
            self.settings.host.clone(),
            self.settings.port,
        );
        mqtt.set_keep_alive(self.settings.keep_alive);
        mqtt.set_clean_session(true);

        if let (Some(user), Some(pass)) = (&options.username, &options.password) {
            mqtt.set_credentials(user.clone(), pass.clone());
        }

        if let Some(will) = &options.last_will {
            mqtt.set_last_will(LastWill::new(
                will.topic.clone(),
                will.payload.clone(),
                QoS::AtLeastOnce,
                will.retain,
            ));
        }

        if self.settings.tls {
            mqtt.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        mqtt
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<Inbox> {
        let broker = self.settings.address();
        info!("Connecting to MQTT broker {}", broker);

        let (client, mut event_loop) =
            AsyncClient::new(self.mqtt_options(options), self.settings.capacity);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel::<std::result::Result<(), ConnectionError>>();
        let connected = self.connected.clone();
        let subscriptions = self.subscriptions.clone();
        let reconnects = self.reconnects.clone();
        let loop_client = client.clone();
        lock(&subscriptions).clear();

        let handle = tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected.store(true, Ordering::SeqCst);
                        match ready_tx.take() {
                            Some(tx) => {
                                let _ = tx.send(Ok(()));
                            }
                            None => {
                                let filters = lock(&subscriptions).snapshot();
                                info!(
                                    "Reconnected to MQTT broker, restoring {} subscription(s)",
                                    filters.len()
                                );
                                // Requests go through the channel this loop drains
                                tokio::spawn(restore_subscriptions(
                                    loop_client.clone(),
                                    filters,
                                    reconnects.clone(),
                                ));
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = TransportMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                            retain: publish.retain,
                        };
                        if inbox_tx.send(message).is_err() {
                            debug!("Inbox dropped, stopping MQTT event loop");
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect))
                    | Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        connected.store(false, Ordering::SeqCst);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        connected.store(false, Ordering::SeqCst);
                        match ready_tx.take() {
                            Some(tx) => {
                                let _ = tx.send(Err(e));
                                break;
                            }
                            None => {
                                // rumqttc reconnects on the next poll
                                warn!("MQTT connection error: {}", e);
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            }
        });

        match ready_rx.await {
            Ok(Ok(())) => {
                info!("Connected to MQTT broker {}", broker);
                *self.client.lock().unwrap_or_else(|e| e.into_inner()) = Some(client);
                *self.event_loop.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                Ok(inbox_rx)
            }
            Ok(Err(e)) => Err(TransportError::Connection {
                broker,
                reason: e.to_string(),
            }),
            Err(_) => Err(TransportError::Connection {
                broker,
                reason: "event loop terminated".to_string(),
            }),
        }
    }

    async fn publish(&self, message: TransportMessage) -> Result<()> {
        self.client()?
            .publish(message.topic, QoS::AtLeastOnce, message.retain, message.payload)
            .await
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    async fn subscribe(&self, filter: &str) -> Result<()> {
        validate_filter(filter)?;
        self.client()?
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Client(e.to_string()))?;
        lock(&self.subscriptions).add(filter);
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.client()?
            .unsubscribe(filter)
            .await
            .map_err(|e| TransportError::Client(e.to_string()))?;
        lock(&self.subscriptions).remove(filter);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        lock(&self.subscriptions).clear();
        let client = self.client.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(client) = client {
            client
                .disconnect()
                .await
                .map_err(|e| TransportError::Client(e.to_string()))?;
        }

        let handle = self
            .event_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut handle) = handle {
            // Give the event loop a moment to flush the DISCONNECT packet
            if tokio::time::timeout(Duration::from_secs(3), &mut handle)
                .await
                .is_err()
            {
                warn!("MQTT event loop did not stop in time");
                handle.abort();
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        info!("Disconnected from MQTT broker {}", self.settings.address());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn reconnects(&self) -> Option<watch::Receiver<u64>> {
        Some(self.reconnects.subscribe())
    }
}

/// Subscribe the remembered filters on a fresh broker session, then notify
/// reconnect watchers
async fn restore_subscriptions(
    client: AsyncClient,
    filters: Vec<String>,
    reconnects: Arc<watch::Sender<u64>>,
) {
    if !filters.is_empty() {
        let filters = filters
            .into_iter()
            .map(|f| SubscribeFilter::new(f, QoS::AtLeastOnce));
        if let Err(e) = client.subscribe_many(filters).await {
            warn!("Failed to restore subscriptions after reconnect: {}", e);
        }
    }
    reconnects.send_modify(|n| *n += 1);
}
