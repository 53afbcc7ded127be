//! Error types for the vrpc-transport crate

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport is not connected")]
    NotConnected,

    #[error("Invalid topic filter: {0}")]
    InvalidTopic(String),

    #[error("Connection to broker {broker} failed: {reason}")]
    Connection { broker: String, reason: String },

    #[error("Broker client error: {0}")]
    Client(String),

    #[error("Transport channel closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;
