//! VRPC Transport: publish/subscribe abstraction for the VRPC client
//!
//! This crate defines the `Transport` trait consumed by the VRPC client core.
//! The client never talks to a broker directly: it connects, subscribes to
//! topic filters, publishes opaque payloads and receives every delivered
//! message through a single inbound channel.
//!
//! # Implementations
//!
//! - **MemoryTransport**: In-process broker (`MemoryBroker`) with retained
//!   messages and last-will support, used for tests and local wiring
//! - **MqttTransport**: MQTT 3.1.1 connectivity via `rumqttc` (feature `mqtt`)
//!
//! # Example
//!
//! ```rust,no_run
//! use vrpc_transport::{ConnectOptions, MemoryBroker, Transport};
//!
//! # async fn example() -> Result<(), vrpc_transport::TransportError> {
//! let broker = MemoryBroker::new();
//! let transport = broker.transport("client-1");
//!
//! let mut inbox = transport.connect(&ConnectOptions::new("client-1")).await?;
//! transport.subscribe("public.vrpc/+/__agentInfo__").await?;
//!
//! while let Some(message) = inbox.recv().await {
//!     println!("{} -> {} bytes", message.topic, message.payload.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod memory;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod topic;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

pub use error::{Result, TransportError};
pub use memory::{MemoryBroker, MemoryTransport};
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttSettings, MqttTransport};
pub use topic::topic_matches;

/// A message delivered by (or handed to) the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    /// Concrete topic the message was published on
    pub topic: String,

    /// Opaque payload bytes
    pub payload: Vec<u8>,

    /// Whether the broker keeps this message for late subscribers
    pub retain: bool,
}

impl TransportMessage {
    /// Create a non-retained message
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    /// Create a retained message
    pub fn retained(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            retain: true,
            ..Self::new(topic, payload)
        }
    }
}

/// Message the broker publishes on behalf of a client that vanished without
/// disconnecting
pub type LastWill = TransportMessage;

/// Connection parameters shared by all transports
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Client identifier announced to the broker
    pub client_id: String,

    /// Optional credentials
    pub username: Option<String>,
    pub password: Option<String>,

    /// Message published by the broker on abrupt connection loss
    pub last_will: Option<LastWill>,
}

impl ConnectOptions {
    /// Create options for the given client id
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    /// Attach credentials
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Attach a last-will message
    pub fn with_last_will(mut self, will: LastWill) -> Self {
        self.last_will = Some(will);
        self
    }
}

/// Receiving half of a transport connection; every message matching any of
/// the active subscriptions arrives here exactly once
pub type Inbox = mpsc::UnboundedReceiver<TransportMessage>;

/// Publish/subscribe transport consumed by the VRPC client.
///
/// Implementations must be `Send + Sync + 'static` and `publish` must be safe
/// to call concurrently from many in-flight calls.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to the broker and return the inbound message channel.
    ///
    /// Resolves once the broker accepted the connection.
    async fn connect(&self, options: &ConnectOptions) -> Result<Inbox>;

    /// Publish a message
    async fn publish(&self, message: TransportMessage) -> Result<()>;

    /// Subscribe to a topic filter (`+` and `#` wildcards allowed)
    async fn subscribe(&self, filter: &str) -> Result<()>;

    /// Remove a previously added topic filter
    async fn unsubscribe(&self, filter: &str) -> Result<()>;

    /// Orderly disconnect; the last-will is NOT published
    async fn disconnect(&self) -> Result<()>;

    /// Whether the transport currently holds a live connection
    fn is_connected(&self) -> bool;

    /// Counter bumped each time the transport re-establishes a dropped
    /// connection on its own, after its subscriptions are restored.
    ///
    /// `None` for transports that never reconnect.
    fn reconnects(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}
