//! Proxy Manager: client-side handles of remote instances
//!
//! A `Proxy` is owned by the caller that created it. The manager only keeps
//! a non-owning routing entry per instance id, used to validate calls and to
//! delete instances. Once an instance is deleted, every proxy for it is inert:
//! calls fail with `InstanceNotFound` before anything reaches the transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use crate::error::{Result, VrpcError};
use crate::session::Session;
use crate::store::ValueStore;
use crate::value::{Arg, Map, Value};

/// Options for `VrpcRemote::create`
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOptions {
    pub class_name: String,
    /// Instance id; generated when absent
    pub instance: Option<String>,
    /// Constructor arguments
    pub args: Vec<Arg>,
    /// Target agent (defaults to the configured agent)
    pub agent: Option<String>,
}

impl CreateOptions {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            instance: None,
            args: Vec::new(),
            agent: None,
        }
    }

    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }
}

/// State shared between a `Proxy` and its routing entry
#[derive(Debug)]
pub(crate) struct ProxyShared {
    pub agent: String,
    pub class_name: String,
    pub instance: String,
    /// Member functions known when the proxy was created
    pub functions: Vec<String>,
    pub store: ValueStore,
    deleted: AtomicBool,
}

impl ProxyShared {
    pub fn new(agent: String, class_name: String, instance: String, functions: Vec<String>) -> Self {
        Self {
            agent,
            class_name,
            instance,
            functions,
            store: ValueStore::new(),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }
}

/// Routing entry of one instance
#[derive(Debug, Clone)]
pub(crate) struct ProxyEntry {
    pub agent: String,
    pub class_name: String,
    proxy: Weak<ProxyShared>,
}

/// Non-owning routing table keyed by instance id
#[derive(Debug, Default)]
pub(crate) struct ProxyManager {
    entries: RwLock<HashMap<String, ProxyEntry>>,
}

impl ProxyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, shared: &Arc<ProxyShared>) {
        self.write().insert(
            shared.instance.clone(),
            ProxyEntry {
                agent: shared.agent.clone(),
                class_name: shared.class_name.clone(),
                proxy: Arc::downgrade(shared),
            },
        );
    }

    pub fn lookup(&self, instance: &str) -> Option<ProxyEntry> {
        self.read().get(instance).cloned()
    }

    pub fn contains(&self, instance: &str) -> bool {
        self.read().contains_key(instance)
    }

    /// Drop the routing entry and make the proxy (if still alive) inert
    pub fn remove(&self, instance: &str) -> Option<ProxyEntry> {
        let entry = self.write().remove(instance)?;
        if let Some(shared) = entry.proxy.upgrade() {
            shared.mark_deleted();
        }
        Some(entry)
    }

    pub fn instances(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ProxyEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ProxyEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle of one remote instance.
///
/// All calls go through one generic entry point; `method()` hands out thin
/// named wrappers over it.
pub struct Proxy {
    shared: Arc<ProxyShared>,
    session: Arc<Session>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("agent", &self.shared.agent)
            .field("class_name", &self.shared.class_name)
            .field("instance", &self.shared.instance)
            .finish()
    }
}

impl Proxy {
    pub(crate) fn new(shared: Arc<ProxyShared>, session: Arc<Session>) -> Self {
        Self { shared, session }
    }

    pub fn instance(&self) -> &str {
        &self.shared.instance
    }

    pub fn class_name(&self) -> &str {
        &self.shared.class_name
    }

    pub fn agent(&self) -> &str {
        &self.shared.agent
    }

    /// Member functions announced for the class when this proxy was created
    pub fn functions(&self) -> &[String] {
        &self.shared.functions
    }

    pub fn is_deleted(&self) -> bool {
        self.shared.is_deleted()
    }

    /// Value bound in this proxy's store
    pub fn binding(&self, name: &str) -> Option<Value> {
        self.shared.store.get(name)
    }

    /// Call a member function.
    ///
    /// With automatic binding on, the result is bound under the function name.
    pub async fn call(&self, function: &str, args: Vec<Arg>) -> Result<Value> {
        self.session
            .call_member(&self.shared, function, args, None, None)
            .await
    }

    /// Call a member function and bind the result under `bind`
    pub async fn call_bound(&self, bind: &str, function: &str, args: Vec<Arg>) -> Result<Value> {
        self.session
            .call_member(&self.shared, function, args, Some(bind.to_string()), None)
            .await
    }

    /// Call a member function with an explicit deadline
    pub async fn call_with_timeout(&self, function: &str, args: Vec<Arg>, timeout: Duration) -> Result<Value> {
        self.session
            .call_member(&self.shared, function, args, None, Some(timeout))
            .await
    }

    /// Call through the generic member entry point with a logical target name
    pub async fn call_generic(&self, target: &str, args: Vec<Arg>, kwargs: Map) -> Result<Value> {
        let args = crate::dispatcher::generic_args(target.to_string(), args, kwargs);
        self.session
            .call_member(&self.shared, crate::codec::GENERIC_CALL, args, None, None)
            .await
    }

    /// Named convenience handle for one member function.
    ///
    /// Rejects names missing from a non-empty capability list.
    pub fn method(&self, name: &str) -> Result<RemoteMethod<'_>> {
        if !self.shared.functions.is_empty() && !self.shared.functions.iter().any(|f| f == name) {
            return Err(VrpcError::FunctionNotFound(format!(
                "could not find function \"{}\"",
                name
            )));
        }
        Ok(RemoteMethod {
            proxy: self,
            name: name.to_string(),
        })
    }
}

/// A member function bound to its proxy
#[derive(Debug)]
pub struct RemoteMethod<'a> {
    proxy: &'a Proxy,
    name: String,
}

impl RemoteMethod<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn invoke(&self, args: Vec<Arg>) -> Result<Value> {
        self.proxy.call(&self.name, args).await
    }
}
