//! `VrpcRemote`: the client facade
//!
//! Owns the transport and the discovery event channel for the lifetime of the
//! client, and one [`Session`] per successful `connect()`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;
use vrpc_transport::Transport;

use crate::config::RemoteConfig;
use crate::dispatcher::{GenericCall, StaticCall};
use crate::error::{Result, VrpcError};
use crate::events::{DiscoveryEvent, DiscoveryStream, EventKind, EventSubscription};
use crate::proxy::{CreateOptions, Proxy};
use crate::registry::{AgentRecord, ClassInfo};
use crate::session::Session;
use crate::value::Value;

/// Asynchronous VRPC client
pub struct VrpcRemote {
    config: RemoteConfig,
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<DiscoveryEvent>,
    session: Mutex<Option<Arc<Session>>>,
}

impl VrpcRemote {
    /// Create a client over an arbitrary transport
    pub fn new(config: RemoteConfig, transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            transport,
            events,
            session: Mutex::new(None),
        }
    }

    /// Create a client connecting to the broker named in `config.broker`
    #[cfg(feature = "mqtt")]
    pub fn mqtt(config: RemoteConfig) -> Result<Self> {
        use vrpc_transport::{MqttSettings, MqttTransport};

        let address = config.broker_address()?;
        let settings = MqttSettings::new(address.host, address.port, address.tls);
        Ok(Self::new(config, Arc::new(MqttTransport::new(settings))))
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Connect and start discovery; a no-op when already connected
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        if guard.as_ref().is_some_and(|s| s.is_open()) {
            debug!("Already connected");
            return Ok(());
        }
        let session =
            Session::open(self.config.clone(), self.transport.clone(), self.events.clone()).await?;
        *guard = Some(session);
        Ok(())
    }

    /// Reject pending calls, forget session state and disconnect
    pub async fn disconnect(&self) -> Result<()> {
        let session = self.session.lock().await.take();
        match session {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.current().await.is_some_and(|s| s.is_open())
    }

    /// Invoke `handler` for every discovery event of `kind`
    pub fn on<F>(&self, kind: EventKind, handler: F) -> EventSubscription
    where
        F: Fn(&DiscoveryEvent) + Send + 'static,
    {
        EventSubscription::spawn(kind, self.subscribe(), handler)
    }

    /// Pull-style stream of all discovery events
    pub fn subscribe(&self) -> DiscoveryStream {
        DiscoveryStream::new(self.events.subscribe())
    }

    pub async fn agents(&self) -> Vec<AgentRecord> {
        match self.current().await {
            Some(s) => s.registry().agents(),
            None => Vec::new(),
        }
    }

    pub async fn agent(&self, agent: &str) -> Option<AgentRecord> {
        self.current().await?.registry().agent(agent)
    }

    pub async fn classes(&self, agent: &str) -> Vec<ClassInfo> {
        match self.current().await {
            Some(s) => s.registry().classes(agent),
            None => Vec::new(),
        }
    }

    pub async fn class_info(&self, agent: &str, class_name: &str) -> Option<ClassInfo> {
        self.current().await?.registry().class_info(agent, class_name)
    }

    /// Instances announced by the agent for a class
    pub async fn instances(&self, agent: &str, class_name: &str) -> Vec<String> {
        self.class_info(agent, class_name)
            .await
            .map(|c| c.instances)
            .unwrap_or_default()
    }

    /// Wait until `agent` has announced `class_name`
    pub async fn wait_for_class(
        &self,
        agent: &str,
        class_name: &str,
        timeout: Duration,
    ) -> Result<ClassInfo> {
        // Subscribe before looking, so an announcement in between is not lost
        let mut stream = self.subscribe();
        if let Some(info) = self.class_info(agent, class_name).await {
            return Ok(info);
        }

        let wait = async {
            while let Some(event) = stream.recv().await {
                if let DiscoveryEvent::Class(class) = event {
                    if class.agent == agent && class.class_name == class_name {
                        return self.class_info(agent, class_name).await;
                    }
                }
            }
            None
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(info)) => Ok(info),
            Ok(None) => Err(VrpcError::NotConnected),
            Err(_) => Err(VrpcError::DiscoveryTimeout {
                agent: agent.to_string(),
                class_name: class_name.to_string(),
                timeout,
            }),
        }
    }

    pub async fn call_static(&self, call: StaticCall) -> Result<Value> {
        self.session().await?.call_static(call).await
    }

    pub async fn call_generic(&self, call: GenericCall) -> Result<Value> {
        self.call_static(call.into_static()).await
    }

    /// Create (or attach to) a remote instance
    pub async fn create(&self, options: CreateOptions) -> Result<Proxy> {
        self.session().await?.create(options).await
    }

    /// Delete a remote instance; every proxy of it becomes inert
    pub async fn delete(&self, instance: &str) -> Result<bool> {
        self.session().await?.delete(instance).await
    }

    /// Value bound by an earlier static call
    pub async fn static_binding(&self, name: &str) -> Option<Value> {
        self.current().await?.static_store().get(name)
    }

    /// Instance ids currently routed by this client
    pub async fn proxies(&self) -> Vec<String> {
        match self.current().await {
            Some(s) => s.proxies().instances(),
            None => Vec::new(),
        }
    }

    pub async fn pending_calls(&self) -> usize {
        match self.current().await {
            Some(s) => s.pending_calls(),
            None => 0,
        }
    }

    async fn current(&self) -> Option<Arc<Session>> {
        self.session.lock().await.clone()
    }

    async fn session(&self) -> Result<Arc<Session>> {
        match self.current().await {
            Some(session) if session.is_open() => Ok(session),
            _ => Err(VrpcError::NotConnected),
        }
    }
}
