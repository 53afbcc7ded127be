//! Message codec: topic layout and JSON envelopes of the VRPC protocol
//!
//! # Topic layout
//!
//! ```text
//! {domain}/{agent}/__agentInfo__                      agent announcement (retained)
//! {domain}/{agent}/{class}/__classInfo__              class announcement (retained)
//! {domain}/{agent}/{class}/__static__/{function}      static call request
//! {domain}/{agent}/{class}/{instance}/{function}      member call request
//! {domain}/{host}/{client}/__clientInfo__             client presence
//! {domain}/{host}/{client}                            responses for this client
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Result, VrpcError};
use crate::value::Value;

/// Protocol version spoken by this client
pub const PROTOCOL_VERSION: u32 = 3;

pub const AGENT_INFO: &str = "__agentInfo__";
pub const CLASS_INFO: &str = "__classInfo__";
pub const CLIENT_INFO: &str = "__clientInfo__";
pub const STATIC_CONTEXT: &str = "__static__";

/// Static function creating (or attaching to) a named instance
pub const CREATE_SHARED: &str = "__createShared__";
/// Static function deleting a named instance
pub const DELETE: &str = "__delete__";
/// Generic entry point taking the target name as first argument
pub const GENERIC_CALL: &str = "call";

/// Topic builders for one domain
#[derive(Debug, Clone)]
pub struct Topics {
    domain: String,
}

impl Topics {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Filter matching every agent announcement in the domain
    pub fn agent_info_filter(&self) -> String {
        format!("{}/+/{}", self.domain, AGENT_INFO)
    }

    /// Filter matching every class announcement in the domain
    pub fn class_info_filter(&self) -> String {
        format!("{}/+/+/{}", self.domain, CLASS_INFO)
    }

    /// Request topic; `instance` of `None` addresses the static context
    pub fn request(&self, agent: &str, class_name: &str, instance: Option<&str>, function: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.domain,
            agent,
            class_name,
            instance.unwrap_or(STATIC_CONTEXT),
            function
        )
    }

    /// Topic on which responses for this client arrive
    pub fn reply(&self, host: &str, client_id: &str) -> String {
        format!("{}/{}/{}", self.domain, host, client_id)
    }

    pub fn client_info(&self, host: &str, client_id: &str) -> String {
        format!("{}/{}/{}/{}", self.domain, host, client_id, CLIENT_INFO)
    }
}

/// Call request published to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Class name (static calls) or instance id (member calls)
    pub c: String,
    /// Function name
    pub f: String,
    /// Positional arguments, already resolved
    pub a: Vec<Value>,
    /// Correlation id
    pub i: String,
    /// Reply topic
    pub s: String,
    /// Protocol version
    pub v: u32,
}

/// Agent reply: the request echoed back with `r` or `e` added
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub i: String,
    #[serde(default)]
    pub c: Option<String>,
    #[serde(default)]
    pub f: Option<String>,
    #[serde(default)]
    pub r: Option<Value>,
    #[serde(default)]
    pub e: Option<String>,
}

impl ResponseEnvelope {
    /// Outcome of the call; a missing `r` on success means `null`
    pub fn into_result(self) -> std::result::Result<Value, VrpcError> {
        match self.e {
            Some(message) => Err(VrpcError::from_remote(message)),
            None => Ok(self.r.unwrap_or(Value::Null)),
        }
    }
}

/// Agent status as announced on `__agentInfo__`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
        }
    }
}

/// Payload of an agent announcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfoPayload {
    pub status: AgentStatus,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub v: Option<u32>,
}

/// Payload of a class announcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfoPayload {
    pub class_name: String,
    #[serde(default)]
    pub instances: Vec<String>,
    #[serde(default)]
    pub static_functions: Vec<String>,
    #[serde(default)]
    pub member_functions: Vec<String>,
    #[serde(default)]
    pub meta: Option<Value>,
    #[serde(default)]
    pub v: Option<u32>,
}

/// Client presence payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfoPayload {
    pub status: AgentStatus,
    pub hostname: String,
    pub user: String,
    pub v: u32,
}

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    AgentInfo {
        agent: String,
        info: AgentInfoPayload,
    },
    ClassInfo {
        agent: String,
        info: ClassInfoPayload,
    },
    Response(ResponseEnvelope),
    /// Well-formed but irrelevant to this client
    Ignored,
}

/// Encode a value as a JSON payload
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode an inbound message by topic shape.
///
/// `reply_topic` is this client's response topic.
pub fn decode(topics: &Topics, reply_topic: &str, topic: &str, payload: &[u8]) -> Result<Inbound> {
    if topic == reply_topic {
        return Ok(Inbound::Response(serde_json::from_slice(payload)?));
    }

    let levels: Vec<&str> = topic.split('/').collect();
    if levels.first() != Some(&topics.domain()) {
        return Ok(Inbound::Ignored);
    }

    match levels.as_slice() {
        [_, agent, AGENT_INFO] => {
            if payload.is_empty() {
                // Cleared retained message
                return Ok(Inbound::Ignored);
            }
            Ok(Inbound::AgentInfo {
                agent: agent.to_string(),
                info: serde_json::from_slice(payload)?,
            })
        }
        [_, agent, class_name, CLASS_INFO] => {
            if payload.is_empty() {
                return Ok(Inbound::Ignored);
            }
            let info: ClassInfoPayload = serde_json::from_slice(payload)?;
            if info.class_name != *class_name {
                return Err(VrpcError::Protocol(format!(
                    "Class announcement on {} names class '{}'",
                    topic, info.class_name
                )));
            }
            Ok(Inbound::ClassInfo {
                agent: agent.to_string(),
                info,
            })
        }
        _ => Ok(Inbound::Ignored),
    }
}
