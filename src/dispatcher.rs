//! Call Dispatcher: build, publish and await remote calls
//!
//! Every call follows the same path:
//!
//! 1. resolve back-references against the caller's `ValueStore`
//! 2. register a correlation id
//! 3. encode the request envelope and publish it on the agent-scoped topic
//! 4. await the response with a bounded timeout
//! 5. bind the result (if requested) in the same store
//!
//! Dispatch never serializes on response arrival, so independent calls run
//! concurrently over the one shared transport.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use vrpc_transport::{Transport, TransportMessage};

use crate::codec::{encode, RequestEnvelope, Topics, GENERIC_CALL, PROTOCOL_VERSION};
use crate::correlation::{CallTarget, CorrelationTable};
use crate::error::{Result, VrpcError};
use crate::store::ValueStore;
use crate::value::{Arg, Map, Value};

/// A static (class-level) call
///
/// ```
/// use vrpc::StaticCall;
///
/// let call = StaticCall::new("Session", "call")
///     .arg("rnorm")
///     .arg(10)
///     .bind("draws");
/// assert_eq!(call.args.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct StaticCall {
    pub class_name: String,
    pub function: String,
    pub args: Vec<Arg>,
    /// Name to bind the result under (overrides automatic binding)
    pub bind: Option<String>,
    /// Target agent (defaults to the configured agent)
    pub agent: Option<String>,
    /// Deadline (defaults to the configured timeout)
    pub timeout: Option<Duration>,
}

impl StaticCall {
    pub fn new(class_name: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            function: function.into(),
            args: Vec::new(),
            bind: None,
            agent: None,
            timeout: None,
        }
    }

    /// Append a literal (or any `Into<Arg>`) argument
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append a back-reference to a result bound in the session store
    pub fn reference(mut self, name: impl Into<String>) -> Self {
        self.args.push(Arg::Reference(name.into()));
        self
    }

    pub fn bind(mut self, name: impl Into<String>) -> Self {
        self.bind = Some(name.into());
        self
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A call through the generic `call` entry point, naming the logical target
/// (e.g. `stats::rnorm`) instead of a registered function
#[derive(Debug, Clone, PartialEq)]
pub struct GenericCall {
    pub class_name: String,
    pub target: String,
    pub args: Vec<Arg>,
    /// Keyword arguments, sent as one trailing mapping when non-empty
    pub kwargs: Map,
    pub bind: Option<String>,
    pub agent: Option<String>,
    pub timeout: Option<Duration>,
}

impl GenericCall {
    pub fn new(class_name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            target: target.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            bind: None,
            agent: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn bind(mut self, name: impl Into<String>) -> Self {
        self.bind = Some(name.into());
        self
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Lower into a static call of the `call` entry point
    pub fn into_static(self) -> StaticCall {
        StaticCall {
            class_name: self.class_name,
            function: GENERIC_CALL.to_string(),
            args: generic_args(self.target, self.args, self.kwargs),
            bind: self.bind,
            agent: self.agent,
            timeout: self.timeout,
        }
    }
}

/// Argument list of the generic entry point: target, positionals, kwargs
pub(crate) fn generic_args(target: String, args: Vec<Arg>, kwargs: Map) -> Vec<Arg> {
    let mut out = Vec::with_capacity(args.len() + 2);
    out.push(Arg::Literal(Value::String(target)));
    out.extend(args);
    if !kwargs.is_empty() {
        out.push(Arg::Literal(Value::Object(kwargs)));
    }
    out
}

/// Binding name used when automatic binding is on: the function name, or the
/// logical target for the generic entry point
pub(crate) fn auto_binding(function: &str, args: &[Arg]) -> Option<String> {
    if function != GENERIC_CALL {
        return Some(function.to_string());
    }
    match args.first() {
        Some(Arg::Literal(Value::String(target))) => Some(target.clone()),
        _ => None,
    }
}

/// A fully addressed call, ready for dispatch
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub target: CallTarget,
    pub args: Vec<Arg>,
    pub bind: Option<String>,
    pub timeout: Option<Duration>,
}

/// Discards the pending entry if the awaiting call is dropped mid-flight
struct PendingGuard<'a> {
    table: &'a CorrelationTable,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.discard(&self.id);
    }
}

pub struct CallDispatcher {
    transport: Arc<dyn Transport>,
    topics: Topics,
    reply_topic: String,
    table: Arc<CorrelationTable>,
    timeout: Duration,
}

impl CallDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        topics: Topics,
        reply_topic: impl Into<String>,
        table: Arc<CorrelationTable>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            topics,
            reply_topic: reply_topic.into(),
            table,
            timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve arguments against `store`, dispatch, and bind the result
    pub(crate) async fn invoke(&self, invocation: Invocation, store: &ValueStore) -> Result<Value> {
        self.invoke_checked(invocation, store, || Ok(())).await
    }

    /// Like `invoke`, but `admit` runs once the call is registered and may
    /// still refuse it before anything is published
    pub(crate) async fn invoke_checked<F>(
        &self,
        invocation: Invocation,
        store: &ValueStore,
        admit: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Result<()>,
    {
        let args = store.resolve_all(&invocation.args)?;
        let value = self
            .dispatch_checked(invocation.target, args, invocation.timeout, admit)
            .await?;
        if let Some(name) = invocation.bind {
            store.bind(name, value.clone());
        }
        Ok(value)
    }

    /// Publish one request and await its response
    pub async fn dispatch(
        &self,
        target: CallTarget,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.dispatch_checked(target, args, timeout, || Ok(())).await
    }

    /// Register, run `admit`, then publish. A refused call leaves no pending
    /// entry and sends nothing.
    pub async fn dispatch_checked<F>(
        &self,
        target: CallTarget,
        args: Vec<Value>,
        timeout: Option<Duration>,
        admit: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Result<()>,
    {
        let timeout = timeout.unwrap_or(self.timeout);
        let topic = self.topics.request(
            &target.agent,
            &target.class_name,
            target.instance.as_deref(),
            &target.function,
        );
        let context = target.context().to_string();
        let function = target.function.clone();

        let (id, mut rx) = self.table.register(target);
        let _guard = PendingGuard {
            table: &self.table,
            id: id.clone(),
        };
        // Checked after registering, so a concurrent teardown that misses
        // the entry is seen here instead
        if let Err(e) = admit() {
            debug!("Call {} refused before publish: {}", id, e);
            return Err(e);
        }

        let request = RequestEnvelope {
            c: context,
            f: function,
            a: args,
            i: id.clone(),
            s: self.reply_topic.clone(),
            v: PROTOCOL_VERSION,
        };
        let payload = encode(&request)?;

        debug!("Dispatching {} -> {}", id, topic);
        if let Err(e) = self
            .transport
            .publish(TransportMessage::new(topic, payload))
            .await
        {
            warn!("Failed to publish call {}: {}", id, e);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(outcome) => outcome.unwrap_or(Err(VrpcError::NotConnected)),
            Err(_) => {
                // Either we expire it now, or a response won the race and is
                // already waiting in the channel
                self.table.expire(&id, timeout);
                rx.await.unwrap_or(Err(VrpcError::NotConnected))
            }
        }
    }
}
