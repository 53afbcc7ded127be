//! In-process broker and transport
//!
//! `MemoryBroker` is a minimal publish/subscribe hub living inside the
//! process. Every `MemoryTransport` created from it behaves like an MQTT
//! client connection: topic filters with wildcards, retained messages that are
//! replayed on subscribe, and a last-will that the broker publishes when a
//! connection is aborted instead of disconnected.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::topic::{topic_matches, validate_filter};
use crate::{ConnectOptions, Inbox, Transport, TransportMessage};

#[derive(Debug)]
struct Connection {
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<TransportMessage>,
    last_will: Option<TransportMessage>,
}

#[derive(Debug, Default)]
struct BrokerState {
    connections: HashMap<String, Connection>,
    retained: BTreeMap<String, Vec<u8>>,
}

impl BrokerState {
    fn route(&mut self, message: &TransportMessage) -> usize {
        if message.retain {
            if message.payload.is_empty() {
                self.retained.remove(&message.topic);
            } else {
                self.retained
                    .insert(message.topic.clone(), message.payload.clone());
            }
        }

        let mut delivered = 0;
        self.connections.retain(|client_id, conn| {
            if !conn.filters.iter().any(|f| topic_matches(f, &message.topic)) {
                return true;
            }
            match conn.tx.send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    debug!("Dropping closed in-memory connection {}", client_id);
                    false
                }
            }
        });
        delivered
    }
}

/// Shared in-process broker; cheap to clone
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Create a new empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport bound to this broker.
    ///
    /// The transport is not connected until `Transport::connect` is called.
    pub fn transport(&self, client_id: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            client_id: Mutex::new(client_id.into()),
            published: AtomicUsize::new(0),
            reconnects: watch::channel(0).0,
        }
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Payload currently retained on `topic`
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.lock().retained.get(topic).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only means another holder panicked mid-route; the
        // state itself stays consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A client connection to a `MemoryBroker`
#[derive(Debug)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    client_id: Mutex<String>,
    published: AtomicUsize,
    reconnects: watch::Sender<u64>,
}

impl MemoryTransport {
    /// Number of messages this transport has published since creation
    pub fn publish_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    /// Simulate an abrupt connection loss: the connection is dropped and the
    /// broker publishes the last-will, if any.
    pub fn abort(&self) {
        let client_id = self.client_id();
        let mut state = self.broker.lock();
        if let Some(conn) = state.connections.remove(&client_id) {
            if let Some(will) = conn.last_will {
                debug!("Publishing last-will of {} on {}", client_id, will.topic);
                state.route(&will);
            }
        }
    }

    /// Simulate a connection drop the client recovers from by itself: the
    /// broker publishes the last-will, subscriptions survive and reconnect
    /// watchers are notified. No-op when not connected.
    pub fn simulate_reconnect(&self) {
        let client_id = self.client_id();
        {
            let mut state = self.broker.lock();
            let will = match state.connections.get(&client_id) {
                Some(conn) => conn.last_will.clone(),
                None => return,
            };
            if let Some(will) = will {
                debug!("Publishing last-will of {} on {}", client_id, will.topic);
                state.route(&will);
            }
        }
        debug!("In-memory client {} reconnected", client_id);
        self.reconnects.send_modify(|n| *n += 1);
    }

    fn client_id(&self) -> String {
        self.client_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<Inbox> {
        let (tx, rx) = mpsc::unbounded_channel();

        if !options.client_id.is_empty() {
            *self.client_id.lock().unwrap_or_else(|e| e.into_inner()) = options.client_id.clone();
        }
        let client_id = self.client_id();

        let mut state = self.broker.lock();
        // Same client id takes over an existing session, as with MQTT
        state.connections.insert(
            client_id.clone(),
            Connection {
                filters: Vec::new(),
                tx,
                last_will: options.last_will.clone(),
            },
        );
        debug!("In-memory client {} connected", client_id);

        Ok(rx)
    }

    async fn publish(&self, message: TransportMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        self.published.fetch_add(1, Ordering::SeqCst);
        let delivered = self.broker.lock().route(&message);
        trace!("Published {} to {} subscriber(s)", message.topic, delivered);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<()> {
        validate_filter(filter)?;
        let client_id = self.client_id();

        let mut state = self.broker.lock();
        let retained: Vec<TransportMessage> = state
            .retained
            .iter()
            .filter(|(topic, _)| topic_matches(filter, topic))
            .map(|(topic, payload)| TransportMessage::retained(topic.clone(), payload.clone()))
            .collect();

        let conn = state
            .connections
            .get_mut(&client_id)
            .ok_or(TransportError::NotConnected)?;

        if !conn.filters.iter().any(|f| f == filter) {
            conn.filters.push(filter.to_string());
        }

        for message in retained {
            conn.tx.send(message).map_err(|_| TransportError::Closed)?;
        }

        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        let client_id = self.client_id();
        let mut state = self.broker.lock();
        let conn = state
            .connections
            .get_mut(&client_id)
            .ok_or(TransportError::NotConnected)?;
        conn.filters.retain(|f| f != filter);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let client_id = self.client_id();
        self.broker.lock().connections.remove(&client_id);
        debug!("In-memory client {} disconnected", client_id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let client_id = self.client_id();
        self.broker.lock().connections.contains_key(&client_id)
    }

    fn reconnects(&self) -> Option<watch::Receiver<u64>> {
        Some(self.reconnects.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers_only() {
        let broker = MemoryBroker::new();
        let a = broker.transport("a");
        let b = broker.transport("b");

        let mut inbox_a = a.connect(&ConnectOptions::new("a")).await.unwrap();
        let mut inbox_b = b.connect(&ConnectOptions::new("b")).await.unwrap();
        a.subscribe("test/+/__agentInfo__").await.unwrap();
        b.subscribe("other/#").await.unwrap();

        b.publish(TransportMessage::new("test/agent1/__agentInfo__", b"{}".to_vec()))
            .await
            .unwrap();

        let received = inbox_a.recv().await.unwrap();
        assert_eq!(received.topic, "test/agent1/__agentInfo__");
        assert!(inbox_b.try_recv().is_err());
        assert_eq!(b.publish_count(), 1);
    }

    #[tokio::test]
    async fn test_retained_replayed_on_subscribe() {
        let broker = MemoryBroker::new();
        let agent = broker.transport("agent");
        agent.connect(&ConnectOptions::new("agent")).await.unwrap();
        agent
            .publish(TransportMessage::retained("d/agent/__agentInfo__", b"online".to_vec()))
            .await
            .unwrap();

        let client = broker.transport("client");
        let mut inbox = client.connect(&ConnectOptions::new("client")).await.unwrap();
        client.subscribe("d/+/__agentInfo__").await.unwrap();

        let received = inbox.recv().await.unwrap();
        assert_eq!(received.payload, b"online".to_vec());
        assert!(received.retain);
    }

    #[tokio::test]
    async fn test_empty_retained_payload_clears_topic() {
        let broker = MemoryBroker::new();
        let t = broker.transport("t");
        t.connect(&ConnectOptions::new("t")).await.unwrap();
        t.publish(TransportMessage::retained("x/y", b"1".to_vec())).await.unwrap();
        assert!(broker.retained("x/y").is_some());

        t.publish(TransportMessage::retained("x/y", Vec::new())).await.unwrap();
        assert!(broker.retained("x/y").is_none());
    }

    #[tokio::test]
    async fn test_abort_publishes_last_will() {
        let broker = MemoryBroker::new();
        let watcher = broker.transport("watcher");
        let mut inbox = watcher.connect(&ConnectOptions::new("watcher")).await.unwrap();
        watcher.subscribe("d/+/__agentInfo__").await.unwrap();

        let agent = broker.transport("agent");
        let will = TransportMessage::retained("d/agent/__agentInfo__", b"offline".to_vec());
        agent
            .connect(&ConnectOptions::new("agent").with_last_will(will))
            .await
            .unwrap();

        agent.abort();

        let received = inbox.recv().await.unwrap();
        assert_eq!(received.payload, b"offline".to_vec());
        assert!(!agent.is_connected());
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let broker = MemoryBroker::new();
        let t = broker.transport("t");
        let result = t.publish(TransportMessage::new("a/b", b"x".to_vec())).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
        assert_eq!(t.publish_count(), 0);
    }

    #[tokio::test]
    async fn test_simulated_reconnect_keeps_subscriptions() {
        let broker = MemoryBroker::new();
        let watcher = broker.transport("watcher");
        let mut watcher_inbox = watcher.connect(&ConnectOptions::new("watcher")).await.unwrap();
        watcher.subscribe("w").await.unwrap();

        let t = broker.transport("t");
        let mut inbox = t
            .connect(&ConnectOptions::new("t").with_last_will(TransportMessage::new("w", b"gone".to_vec())))
            .await
            .unwrap();
        t.subscribe("d/#").await.unwrap();
        let mut reconnects = t.reconnects().unwrap();

        t.simulate_reconnect();
        reconnects.changed().await.unwrap();
        assert_eq!(*reconnects.borrow(), 1);
        assert_eq!(watcher_inbox.recv().await.unwrap().payload, b"gone".to_vec());

        watcher.publish(TransportMessage::new("d/x", b"1".to_vec())).await.unwrap();
        assert_eq!(inbox.recv().await.unwrap().topic, "d/x");
    }

    #[tokio::test]
    async fn test_disconnect_skips_last_will() {
        let broker = MemoryBroker::new();
        let watcher = broker.transport("watcher");
        let mut inbox = watcher.connect(&ConnectOptions::new("watcher")).await.unwrap();
        watcher.subscribe("#").await.unwrap();

        let t = broker.transport("t");
        t.connect(&ConnectOptions::new("t").with_last_will(TransportMessage::new("w", b"x".to_vec())))
            .await
            .unwrap();
        t.disconnect().await.unwrap();

        assert!(inbox.try_recv().is_err());
        assert_eq!(broker.connection_count(), 1);
    }
}
