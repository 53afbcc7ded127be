//! Connection session: all state scoped to one live transport connection
//!
//! A session is created by `VrpcRemote::connect` and torn down by
//! `VrpcRemote::disconnect`. It owns the discovery registry, the correlation
//! table, the proxy routing table and the static-call value store, plus the
//! router task feeding inbound messages into them and, for transports that
//! reconnect by themselves, a task announcing presence again afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vrpc_transport::{ConnectOptions, Inbox, Transport, TransportMessage};

use crate::codec::{
    decode, encode, AgentStatus, ClientInfoPayload, Inbound, Topics, CREATE_SHARED, DELETE,
    PROTOCOL_VERSION,
};
use crate::config::RemoteConfig;
use crate::correlation::{CallTarget, CorrelationTable};
use crate::dispatcher::{auto_binding, CallDispatcher, Invocation, StaticCall};
use crate::error::{Result, VrpcError};
use crate::events::DiscoveryEvent;
use crate::proxy::{CreateOptions, Proxy, ProxyManager, ProxyShared};
use crate::registry::DiscoveryRegistry;
use crate::store::ValueStore;
use crate::value::{Arg, Value};

pub(crate) struct Session {
    config: RemoteConfig,
    transport: Arc<dyn Transport>,
    client_id: String,
    hostname: String,
    topics: Topics,
    table: Arc<CorrelationTable>,
    dispatcher: CallDispatcher,
    registry: Arc<DiscoveryRegistry>,
    proxies: ProxyManager,
    static_store: ValueStore,
    open: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Connect the transport and start routing inbound messages
    pub async fn open(
        config: RemoteConfig,
        transport: Arc<dyn Transport>,
        events: broadcast::Sender<DiscoveryEvent>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(generate_client_id);
        let hostname = local_hostname();
        let topics = Topics::new(config.domain.clone());
        let reply_topic = topics.reply(&hostname, &client_id);

        let table = Arc::new(CorrelationTable::new(client_id.clone()));
        let registry = Arc::new(DiscoveryRegistry::new(
            config.domain.clone(),
            events,
            config.purge_offline_agents,
        ));
        let dispatcher = CallDispatcher::new(
            transport.clone(),
            topics.clone(),
            reply_topic.clone(),
            table.clone(),
            config.timeout(),
        );

        let session = Arc::new(Self {
            config,
            transport,
            client_id,
            hostname,
            topics,
            table,
            dispatcher,
            registry,
            proxies: ProxyManager::new(),
            static_store: ValueStore::new(),
            open: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        session.start(reply_topic).await?;
        Ok(session)
    }

    async fn start(&self, reply_topic: String) -> Result<()> {
        let mut options = ConnectOptions::new(self.client_id.clone())
            .with_last_will(TransportMessage::new(
                self.client_info_topic(),
                encode(&self.presence(AgentStatus::Offline))?,
            ));
        if let Some((user, pass)) = self.config.credentials() {
            options = options.with_credentials(user, pass);
        }

        info!(
            "Connecting to domain {} as {} (broker {})",
            self.config.domain, self.client_id, self.config.broker
        );
        let reconnects = self.transport.reconnects();
        let inbox = self.transport.connect(&options).await?;

        let router = tokio::spawn(route_inbound(
            inbox,
            self.topics.clone(),
            reply_topic.clone(),
            self.table.clone(),
            self.registry.clone(),
        ));
        self.spawned(router);

        self.transport.subscribe(&reply_topic).await?;
        self.transport
            .subscribe(&self.topics.agent_info_filter())
            .await?;
        self.transport
            .subscribe(&self.topics.class_info_filter())
            .await?;

        let online = TransportMessage::new(
            self.client_info_topic(),
            encode(&self.presence(AgentStatus::Online))?,
        );
        self.transport.publish(online.clone()).await?;
        if let Some(reconnects) = reconnects {
            let announcer = tokio::spawn(announce_on_reconnect(
                reconnects,
                self.transport.clone(),
                online,
            ));
            self.spawned(announcer);
        }

        self.open.store(true, Ordering::SeqCst);
        info!("Connected to domain {}", self.config.domain);
        Ok(())
    }

    /// Tear down: reject pending calls, forget all session state, disconnect
    pub async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let rejected = self.table.reject_all(|| VrpcError::NotConnected);
        if rejected > 0 {
            warn!("Disconnecting with {} call(s) in flight", rejected);
        }

        self.abort_tasks();

        self.registry.clear();
        self.proxies.clear();
        self.static_store.clear();

        if let Err(e) = self
            .transport
            .publish(TransportMessage::new(
                self.client_info_topic(),
                encode(&self.presence(AgentStatus::Offline))?,
            ))
            .await
        {
            debug!("Could not announce offline presence: {}", e);
        }
        self.transport.disconnect().await?;
        info!("Disconnected from domain {}", self.config.domain);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &DiscoveryRegistry {
        &self.registry
    }

    pub fn proxies(&self) -> &ProxyManager {
        &self.proxies
    }

    pub fn static_store(&self) -> &ValueStore {
        &self.static_store
    }

    pub fn pending_calls(&self) -> usize {
        self.table.len()
    }

    pub async fn call_static(&self, call: StaticCall) -> Result<Value> {
        self.ensure_open()?;
        let agent = self.resolve_agent(call.agent)?;
        let bind = self.binding_name(call.bind, &call.function, &call.args);

        let invocation = Invocation {
            target: CallTarget::new_static(agent, call.class_name, call.function),
            args: call.args,
            bind,
            timeout: call.timeout,
        };
        self.dispatcher.invoke(invocation, &self.static_store).await
    }

    pub async fn call_member(
        &self,
        proxy: &ProxyShared,
        function: &str,
        args: Vec<Arg>,
        bind: Option<String>,
        timeout: Option<std::time::Duration>,
    ) -> Result<Value> {
        if proxy.is_deleted() || !self.proxies.contains(&proxy.instance) {
            return Err(VrpcError::InstanceNotFound(proxy.instance.clone()));
        }
        self.ensure_open()?;

        let bind = self.binding_name(bind, function, &args);
        let invocation = Invocation {
            target: CallTarget::new_member(
                proxy.agent.clone(),
                proxy.class_name.clone(),
                proxy.instance.clone(),
                function,
            ),
            args,
            bind,
            timeout,
        };
        // A delete that lands while this call is being set up either sees the
        // pending entry or is seen by this check; nothing goes out after it
        let instance = &proxy.instance;
        self.dispatcher
            .invoke_checked(invocation, &proxy.store, || {
                if proxy.is_deleted() || !self.proxies.contains(instance) {
                    Err(VrpcError::InstanceNotFound(instance.clone()))
                } else {
                    Ok(())
                }
            })
            .await
    }

    pub async fn create(self: &Arc<Self>, options: CreateOptions) -> Result<Proxy> {
        self.ensure_open()?;
        let agent = self.resolve_agent(options.agent)?;
        let requested = options
            .instance
            .unwrap_or_else(|| generate_instance_id(&options.class_name));

        let mut args = Vec::with_capacity(options.args.len() + 1);
        args.push(Arg::Literal(Value::String(requested.clone())));
        args.extend(options.args);

        let invocation = Invocation {
            target: CallTarget::new_static(agent.clone(), options.class_name.clone(), CREATE_SHARED),
            args,
            bind: None,
            timeout: None,
        };
        let result = self
            .dispatcher
            .invoke(invocation, &self.static_store)
            .await?;

        let instance = match result {
            Value::String(id) if !id.is_empty() => id,
            _ => requested,
        };

        let functions = self
            .registry
            .class_info(&agent, &options.class_name)
            .map(|c| c.member_functions)
            .unwrap_or_default();

        let shared = Arc::new(ProxyShared::new(
            agent,
            options.class_name,
            instance,
            functions,
        ));
        self.proxies.register(&shared);
        info!(
            "Created instance {} of {}/{}",
            shared.instance, shared.agent, shared.class_name
        );

        Ok(Proxy::new(shared, self.clone()))
    }

    pub async fn delete(&self, instance: &str) -> Result<bool> {
        self.ensure_open()?;
        let entry = self
            .proxies
            .lookup(instance)
            .ok_or_else(|| VrpcError::InstanceNotFound(instance.to_string()))?;

        let invocation = Invocation {
            target: CallTarget::new_static(entry.agent, entry.class_name, DELETE),
            args: vec![Arg::Literal(Value::String(instance.to_string()))],
            bind: None,
            timeout: None,
        };
        let result = self
            .dispatcher
            .invoke(invocation, &self.static_store)
            .await?;

        let deleted = match result {
            Value::Bool(b) => b,
            other => {
                return Err(VrpcError::Protocol(format!(
                    "Unexpected reply to {}: {}",
                    DELETE, other
                )))
            }
        };

        // Either way the agent no longer holds the instance
        self.proxies.remove(instance);
        let orphaned = self.table.reject_matching(
            |target| target.instance.as_deref() == Some(instance),
            || VrpcError::InstanceNotFound(instance.to_string()),
        );
        if orphaned > 0 {
            debug!("Rejected {} in-flight call(s) on deleted {}", orphaned, instance);
        }
        info!("Deleted instance {} (agent reported {})", instance, deleted);

        Ok(deleted)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(VrpcError::NotConnected)
        }
    }

    fn resolve_agent(&self, explicit: Option<String>) -> Result<String> {
        match explicit {
            Some(agent) if !agent.is_empty() => Ok(agent),
            _ if !self.config.agent.is_empty() => Ok(self.config.agent.clone()),
            _ => Err(VrpcError::Config(
                "No target agent: set `agent` in the configuration or per call".to_string(),
            )),
        }
    }

    fn binding_name(&self, explicit: Option<String>, function: &str, args: &[Arg]) -> Option<String> {
        match explicit {
            Some(name) => Some(name),
            None if self.config.auto_bind => auto_binding(function, args),
            None => None,
        }
    }

    fn spawned(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    fn abort_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
    }

    fn client_info_topic(&self) -> String {
        self.topics.client_info(&self.hostname, &self.client_id)
    }

    fn presence(&self, status: AgentStatus) -> ClientInfoPayload {
        ClientInfoPayload {
            status,
            hostname: self.hostname.clone(),
            user: local_user(),
            v: PROTOCOL_VERSION,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// The broker published our last-will when the link dropped; say we are
/// back once the transport has reconnected
async fn announce_on_reconnect(
    mut reconnects: watch::Receiver<u64>,
    transport: Arc<dyn Transport>,
    online: TransportMessage,
) {
    while reconnects.changed().await.is_ok() {
        info!("Transport reconnected, announcing presence on {}", online.topic);
        if let Err(e) = transport.publish(online.clone()).await {
            warn!("Could not announce presence after reconnect: {}", e);
        }
    }
}

/// Feed inbound transport messages into the correlation table and registry
async fn route_inbound(
    mut inbox: Inbox,
    topics: Topics,
    reply_topic: String,
    table: Arc<CorrelationTable>,
    registry: Arc<DiscoveryRegistry>,
) {
    while let Some(message) = inbox.recv().await {
        match decode(&topics, &reply_topic, &message.topic, &message.payload) {
            Ok(Inbound::Response(response)) => {
                let id = response.i.clone();
                match response.into_result() {
                    Ok(value) => table.resolve(&id, value),
                    Err(error) => table.reject(&id, error),
                };
            }
            Ok(Inbound::AgentInfo { agent, info }) => {
                if info.v.is_some_and(|v| v != PROTOCOL_VERSION) {
                    warn!(
                        "Agent {} speaks protocol v{:?}, expected v{}",
                        agent, info.v, PROTOCOL_VERSION
                    );
                }
                registry.on_agent_announcement(&agent, info);
            }
            Ok(Inbound::ClassInfo { agent, info }) => registry.on_class_announcement(&agent, info),
            Ok(Inbound::Ignored) => {}
            Err(e) => warn!("Dropping malformed message on {}: {}", message.topic, e),
        }
    }
    debug!("Inbound channel closed, router stopped");
}

fn generate_client_id() -> String {
    format!("vc3{}", &Uuid::new_v4().simple().to_string()[..20])
}

fn generate_instance_id(class_name: &str) -> String {
    format!("{}-{}", class_name, &Uuid::new_v4().simple().to_string()[..12])
}

fn local_hostname() -> String {
    sysinfo::System::host_name()
        .filter(|h| !h.is_empty())
        .map(|h| h.replace(['/', '+', '#'], "_"))
        .unwrap_or_else(|| "localhost".to_string())
}

fn local_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}
