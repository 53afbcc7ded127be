//! Discovery Registry: agents and classes known within one connection session
//!
//! The registry is fed by agent and class announcements decoded from the
//! transport. Every update is a synchronous state mutation followed by an
//! event on the discovery channel; nothing here ever blocks on the network.
//!
//! Offline agents stay visible with `status == Offline` unless the session is
//! configured to purge them.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::codec::{AgentInfoPayload, AgentStatus, ClassInfoPayload};
use crate::events::{AgentEvent, ClassEvent, DiscoveryEvent};
use crate::value::Value;

/// Functions exposed by one class of an agent
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    pub class_name: String,
    /// Instances currently registered on the agent
    pub instances: Vec<String>,
    /// Static function names, duplicates removed, announcement order
    pub static_functions: Vec<String>,
    /// Member function names, duplicates removed, announcement order
    pub member_functions: Vec<String>,
    pub meta: Option<Value>,
}

impl ClassInfo {
    fn from_payload(payload: ClassInfoPayload) -> Self {
        Self {
            class_name: payload.class_name,
            instances: dedup_ordered(payload.instances),
            static_functions: dedup_ordered(payload.static_functions),
            member_functions: dedup_ordered(payload.member_functions),
            meta: payload.meta,
        }
    }
}

/// Record of a discovered agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRecord {
    pub domain: String,
    pub agent: String,
    pub status: AgentStatus,
    pub hostname: String,
    pub version: String,
    /// Class announcements in first-seen order
    pub classes: Vec<ClassInfo>,
}

impl AgentRecord {
    fn new(domain: &str, agent: &str) -> Self {
        Self {
            domain: domain.to_string(),
            agent: agent.to_string(),
            status: AgentStatus::Offline,
            hostname: String::new(),
            version: String::new(),
            classes: Vec::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == AgentStatus::Online
    }

    pub fn class(&self, class_name: &str) -> Option<&ClassInfo> {
        self.classes.iter().find(|c| c.class_name == class_name)
    }
}

/// Connection-scoped table of agents and their classes
pub struct DiscoveryRegistry {
    domain: String,
    agents: RwLock<HashMap<String, AgentRecord>>,
    events: broadcast::Sender<DiscoveryEvent>,
    purge_offline: bool,
}

impl DiscoveryRegistry {
    /// Create an empty registry publishing onto `events`
    pub fn new(
        domain: impl Into<String>,
        events: broadcast::Sender<DiscoveryEvent>,
        purge_offline: bool,
    ) -> Self {
        Self {
            domain: domain.into(),
            agents: RwLock::new(HashMap::new()),
            events,
            purge_offline,
        }
    }

    /// Upsert an agent and emit an `agent` event
    pub fn on_agent_announcement(&self, agent: &str, info: AgentInfoPayload) {
        {
            let mut agents = self.write();
            if info.status == AgentStatus::Offline && self.purge_offline {
                info!("Agent {} went offline, removing it", agent);
                agents.remove(agent);
            } else {
                let record = agents
                    .entry(agent.to_string())
                    .or_insert_with(|| AgentRecord::new(&self.domain, agent));
                if record.status != info.status {
                    info!("Agent {} is {}", agent, info.status.as_str());
                }
                record.status = info.status;
                record.hostname = info.hostname.clone();
                record.version = info.version.clone();
            }
        }

        self.emit(DiscoveryEvent::Agent(AgentEvent {
            domain: self.domain.clone(),
            agent: agent.to_string(),
            status: info.status,
            hostname: info.hostname,
            version: info.version,
        }));
    }

    /// Upsert a class (full replacement) and emit a `class` event
    pub fn on_class_announcement(&self, agent: &str, payload: ClassInfoPayload) {
        let class = ClassInfo::from_payload(payload);
        {
            let mut agents = self.write();
            let record = agents
                .entry(agent.to_string())
                .or_insert_with(|| AgentRecord::new(&self.domain, agent));

            match record
                .classes
                .iter_mut()
                .find(|c| c.class_name == class.class_name)
            {
                Some(existing) => *existing = class.clone(),
                None => record.classes.push(class.clone()),
            }
        }
        debug!(
            "Class {}/{}: {} static, {} member function(s)",
            agent,
            class.class_name,
            class.static_functions.len(),
            class.member_functions.len()
        );

        self.emit(DiscoveryEvent::Class(ClassEvent {
            domain: self.domain.clone(),
            agent: agent.to_string(),
            class_name: class.class_name,
            instances: class.instances,
            static_functions: class.static_functions,
            member_functions: class.member_functions,
        }));
    }

    /// Snapshot of all agents, sorted by name
    pub fn agents(&self) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self.read().values().cloned().collect();
        agents.sort_by(|a, b| a.agent.cmp(&b.agent));
        agents
    }

    pub fn agent(&self, agent: &str) -> Option<AgentRecord> {
        self.read().get(agent).cloned()
    }

    pub fn classes(&self, agent: &str) -> Vec<ClassInfo> {
        self.read()
            .get(agent)
            .map(|r| r.classes.clone())
            .unwrap_or_default()
    }

    pub fn class_info(&self, agent: &str, class_name: &str) -> Option<ClassInfo> {
        self.read()
            .get(agent)
            .and_then(|r| r.class(class_name).cloned())
    }

    /// Remove everything (session teardown)
    pub fn clear(&self) {
        self.write().clear();
    }

    fn emit(&self, event: DiscoveryEvent) {
        // No receivers is fine: nobody listens yet
        let _ = self.events.send(event);
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, AgentRecord>> {
        self.agents.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, AgentRecord>> {
        self.agents.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn dedup_ordered(names: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        if !out.contains(&name) {
            out.push(name);
        }
    }
    out
}
