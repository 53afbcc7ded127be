//! Discovery events and subscriptions
//!
//! Discovery is an unbounded stream, so it is modelled as a broadcast
//! channel: each subscriber owns its receiver, and dropping (or cancelling)
//! one subscription stops delivery to it alone.

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::codec::AgentStatus;

/// `agent` event: an agent announced itself (online or offline)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub domain: String,
    pub agent: String,
    pub status: AgentStatus,
    pub hostname: String,
    pub version: String,
}

/// `class` event: a class announcement (full replacement of earlier ones)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassEvent {
    pub domain: String,
    pub agent: String,
    pub class_name: String,
    pub instances: Vec<String>,
    pub static_functions: Vec<String>,
    pub member_functions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DiscoveryEvent {
    Agent(AgentEvent),
    Class(ClassEvent),
}

impl DiscoveryEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DiscoveryEvent::Agent(_) => EventKind::Agent,
            DiscoveryEvent::Class(_) => EventKind::Class,
        }
    }
}

/// Event names accepted by `VrpcRemote::on`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Agent,
    Class,
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Agent => "agent",
            EventKind::Class => "class",
        }
    }
}

/// Pull-style subscription to discovery events
pub struct DiscoveryStream {
    rx: broadcast::Receiver<DiscoveryEvent>,
}

impl DiscoveryStream {
    pub(crate) fn new(rx: broadcast::Receiver<DiscoveryEvent>) -> Self {
        Self { rx }
    }

    /// Next event; `None` once the client is dropped.
    ///
    /// A subscriber that falls behind the channel capacity skips the events
    /// it missed and keeps going.
    pub async fn recv(&mut self) -> Option<DiscoveryEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Discovery subscriber lagged, skipped {} event(s)", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Handle of a callback subscription created by `VrpcRemote::on`.
///
/// Delivery stops when the handle is cancelled or dropped.
pub struct EventSubscription {
    kind: EventKind,
    task: JoinHandle<()>,
}

impl EventSubscription {
    pub(crate) fn spawn<F>(kind: EventKind, mut stream: DiscoveryStream, handler: F) -> Self
    where
        F: Fn(&DiscoveryEvent) + Send + 'static,
    {
        let task = tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                if event.kind() == kind {
                    handler(&event);
                }
            }
        });
        Self { kind, task }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Stop delivery to this subscription
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
