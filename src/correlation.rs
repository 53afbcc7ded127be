//! Correlation Table: outstanding requests keyed by correlation id
//!
//! Many calls share one transport connection. Each call registers a pending
//! entry and awaits a oneshot receiver; the inbound router resolves or rejects
//! entries as responses arrive, in any order.
//!
//! Resolution is idempotent per id: the first of resolve/reject/expire removes
//! the entry, and every later attempt for the same id is a no-op. A response
//! arriving after its call timed out is therefore dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::VrpcError;
use crate::value::Value;

/// Outcome delivered to the awaiting call
pub type CallOutcome = std::result::Result<Value, VrpcError>;

/// What a pending call is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTarget {
    pub agent: String,
    pub class_name: String,
    /// `None` for static calls
    pub instance: Option<String>,
    pub function: String,
}

impl CallTarget {
    pub fn new_static(agent: impl Into<String>, class_name: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            class_name: class_name.into(),
            instance: None,
            function: function.into(),
        }
    }

    pub fn new_member(
        agent: impl Into<String>,
        class_name: impl Into<String>,
        instance: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        Self {
            instance: Some(instance.into()),
            ..Self::new_static(agent, class_name, function)
        }
    }

    /// Request context: instance id for member calls, class name otherwise
    pub fn context(&self) -> &str {
        self.instance.as_deref().unwrap_or(&self.class_name)
    }
}

#[derive(Debug)]
struct PendingCall {
    target: CallTarget,
    submitted: Instant,
    tx: oneshot::Sender<CallOutcome>,
}

/// Table of in-flight calls
#[derive(Debug)]
pub struct CorrelationTable {
    prefix: String,
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, PendingCall>>,
}

impl CorrelationTable {
    /// Create a table whose ids are `{prefix}-{n}`
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a pending call; returns its fresh id and the receiver to await
    pub fn register(&self, target: CallTarget) -> (String, oneshot::Receiver<CallOutcome>) {
        let id = format!(
            "{}-{}",
            self.prefix,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let (tx, rx) = oneshot::channel();

        let previous = self.lock().insert(
            id.clone(),
            PendingCall {
                target,
                submitted: Instant::now(),
                tx,
            },
        );
        debug_assert!(previous.is_none(), "correlation id reused while pending");

        (id, rx)
    }

    /// Fulfil a pending call; returns false if the id is not pending
    pub fn resolve(&self, id: &str, value: Value) -> bool {
        self.complete(id, Ok(value))
    }

    /// Fail a pending call; returns false if the id is not pending
    pub fn reject(&self, id: &str, error: VrpcError) -> bool {
        self.complete(id, Err(error))
    }

    /// Time out a pending call; returns false if it already completed
    pub fn expire(&self, id: &str, timeout: Duration) -> bool {
        let Some(call) = self.lock().remove(id) else {
            return false;
        };
        debug!(
            "Call {} ({}) expired after {:?}",
            id,
            call.target.function,
            call.submitted.elapsed()
        );
        let _ = call.tx.send(Err(VrpcError::Timeout {
            function: call.target.function,
            timeout,
        }));
        true
    }

    /// Reject every pending call (session teardown)
    pub fn reject_all(&self, make_error: impl Fn() -> VrpcError) -> usize {
        let drained: Vec<PendingCall> = self.lock().drain().map(|(_, call)| call).collect();
        let count = drained.len();
        for call in drained {
            let _ = call.tx.send(Err(make_error()));
        }
        count
    }

    /// Reject the pending calls whose target satisfies `matches`
    pub fn reject_matching(
        &self,
        matches: impl Fn(&CallTarget) -> bool,
        make_error: impl Fn() -> VrpcError,
    ) -> usize {
        let drained: Vec<PendingCall> = {
            let mut pending = self.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, call)| matches(&call.target))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        let count = drained.len();
        for call in drained {
            let _ = call.tx.send(Err(make_error()));
        }
        count
    }

    /// Forget a pending call without delivering anything (e.g. publish failed)
    pub fn discard(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Target of a pending call
    pub fn target(&self, id: &str) -> Option<CallTarget> {
        self.lock().get(id).map(|call| call.target.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn complete(&self, id: &str, outcome: CallOutcome) -> bool {
        let Some(call) = self.lock().remove(id) else {
            debug!("Dropping response for unknown or completed call {}", id);
            return false;
        };
        debug!(
            "Call {} ({}) completed in {:?}",
            id,
            call.target.function,
            call.submitted.elapsed()
        );
        // The caller may have gone away; nothing to deliver to then
        let _ = call.tx.send(outcome);
        true
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingCall>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
