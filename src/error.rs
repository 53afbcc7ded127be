/*!
 * Error types for the VRPC client
 */

use std::time::Duration;
use thiserror::Error;
use vrpc_transport::TransportError;

pub type Result<T> = std::result::Result<T, VrpcError>;

#[derive(Error, Debug)]
pub enum VrpcError {
    /// Operation attempted before a successful connect (or after disconnect)
    #[error("Client is not connected")]
    NotConnected,

    /// No response within the call's deadline
    #[error("Call to {function} timed out after {}ms", timeout.as_millis())]
    Timeout { function: String, timeout: Duration },

    /// Remote reports the target function does not exist
    #[error("{0}")]
    FunctionNotFound(String),

    /// Remote reports missing or invalid arguments
    #[error("{0}")]
    ArgumentError(String),

    /// Remote function raised during execution
    #[error("{0}")]
    RemoteExecution(String),

    /// Class not announced before `wait_for_class` gave up
    #[error("Class {class_name} of agent {agent} was not announced within {}ms", timeout.as_millis())]
    DiscoveryTimeout {
        agent: String,
        class_name: String,
        timeout: Duration,
    },

    /// Call or delete targets an unknown or already-deleted instance
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// Back-reference argument names a binding that does not exist in scope
    #[error("Unresolved reference: ${0}")]
    UnresolvedReference(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl VrpcError {
    /// Classify a message reported by a remote agent.
    ///
    /// The message is kept verbatim; callers match on it literally.
    pub fn from_remote(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.starts_with("could not find function") {
            VrpcError::FunctionNotFound(message)
        } else if is_argument_matching_error(&message) {
            VrpcError::ArgumentError(message)
        } else {
            VrpcError::RemoteExecution(message)
        }
    }

    /// Error reported by the remote agent
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            VrpcError::FunctionNotFound(_)
                | VrpcError::ArgumentError(_)
                | VrpcError::RemoteExecution(_)
        )
    }

    /// Error detected on the client side, without a remote verdict
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            VrpcError::NotConnected
                | VrpcError::Timeout { .. }
                | VrpcError::DiscoveryTimeout { .. }
                | VrpcError::InstanceNotFound(_)
                | VrpcError::UnresolvedReference(_)
        )
    }
}

/// R's argument-matching failures, raised before the function body runs
fn is_argument_matching_error(message: &str) -> bool {
    if message.starts_with("unused argument") {
        return true;
    }
    match message.strip_prefix("argument ") {
        Some(rest) => {
            (rest.starts_with('"') && rest.ends_with("is missing, with no default"))
                || rest.contains("matches multiple formal arguments")
        }
        None => false,
    }
}
