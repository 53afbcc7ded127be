//! In-process agent emulating the R session agent over a `MemoryBroker`

#![allow(dead_code)]

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use vrpc::codec::RequestEnvelope;
use vrpc::transport::{ConnectOptions, MemoryBroker, MemoryTransport, Transport, TransportMessage};
use vrpc::{RemoteConfig, VrpcRemote};

pub const DOMAIN: &str = "test.vrpc";
pub const AGENT: &str = "rAgent";
pub const CLASS: &str = "Session";

pub const STATIC_FUNCTIONS: &[&str] = &[
    "__createShared__",
    "__delete__",
    "call",
    "rnorm",
    "test_sys_sleep",
];

pub const MEMBER_FUNCTIONS: &[&str] = &[
    "call",
    "c",
    "mean",
    "select_dataset",
    "get_table",
    "push",
    "values",
];

#[derive(Debug, Default)]
struct InstanceState {
    dataset: Option<String>,
    pushed: Vec<Value>,
}

type Instances = Arc<Mutex<HashMap<String, InstanceState>>>;

pub struct MockAgent {
    transport: Arc<MemoryTransport>,
    instances: Instances,
    task: JoinHandle<()>,
}

impl MockAgent {
    /// Connect, announce agent and class, and start serving requests
    pub async fn start(broker: &MemoryBroker) -> Self {
        let transport = Arc::new(broker.transport("mock-agent"));
        let inbox = transport
            .connect(&ConnectOptions::new("mock-agent"))
            .await
            .unwrap();
        transport
            .subscribe(&format!("{}/{}/{}/+/+", DOMAIN, AGENT, CLASS))
            .await
            .unwrap();

        let instances: Instances = Arc::default();
        let task = tokio::spawn(serve(inbox, transport.clone(), instances.clone()));

        let agent = Self {
            transport,
            instances,
            task,
        };
        agent.announce_status("online").await;
        agent
            .announce_class(STATIC_FUNCTIONS, MEMBER_FUNCTIONS)
            .await;
        agent
    }

    pub async fn announce_status(&self, status: &str) {
        let payload = json!({
            "status": status,
            "hostname": "mock-host",
            "version": "3.0.0",
            "v": 3
        });
        self.transport
            .publish(TransportMessage::retained(
                format!("{}/{}/__agentInfo__", DOMAIN, AGENT),
                serde_json::to_vec(&payload).unwrap(),
            ))
            .await
            .unwrap();
    }

    pub async fn announce_class(&self, statics: &[&str], members: &[&str]) {
        let instances: Vec<String> = self.instances.lock().unwrap().keys().cloned().collect();
        let payload = json!({
            "className": CLASS,
            "instances": instances,
            "staticFunctions": statics,
            "memberFunctions": members,
            "meta": null,
            "v": 3
        });
        self.transport
            .publish(TransportMessage::retained(
                format!("{}/{}/{}/__classInfo__", DOMAIN, AGENT, CLASS),
                serde_json::to_vec(&payload).unwrap(),
            ))
            .await
            .unwrap();
    }

    pub fn has_instance(&self, instance: &str) -> bool {
        self.instances.lock().unwrap().contains_key(instance)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }
}

impl Drop for MockAgent {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    mut inbox: vrpc::transport::Inbox,
    transport: Arc<MemoryTransport>,
    instances: Instances,
) {
    while let Some(message) = inbox.recv().await {
        let Ok(request) = serde_json::from_slice::<RequestEnvelope>(&message.payload) else {
            continue;
        };
        let static_call = message.topic.split('/').nth(3) == Some("__static__");
        let transport = transport.clone();
        let instances = instances.clone();
        // Each request runs on its own task, like the agent's worker pool
        tokio::spawn(async move {
            let outcome = if static_call {
                handle_static(&request, &instances).await
            } else {
                handle_member(&request, &instances)
            };
            reply(&transport, &request, outcome).await;
        });
    }
}

async fn reply(transport: &MemoryTransport, request: &RequestEnvelope, outcome: Result<Value, String>) {
    let mut response = serde_json::to_value(request).unwrap();
    match outcome {
        Ok(value) => response["r"] = value,
        Err(message) => response["e"] = Value::String(message),
    }
    let _ = transport
        .publish(TransportMessage::new(
            request.s.clone(),
            serde_json::to_vec(&response).unwrap(),
        ))
        .await;
}

fn missing(name: &str) -> String {
    format!("argument \"{}\" is missing, with no default", name)
}

fn not_found(name: &str) -> String {
    format!("could not find function \"{}\"", name)
}

fn rnorm(args: &[Value]) -> Result<Value, String> {
    let n = match args.first() {
        Some(Value::Object(kwargs)) => kwargs.get("n").and_then(Value::as_u64),
        Some(value) => value.as_u64(),
        None => None,
    }
    .ok_or_else(|| missing("n"))?;
    let draws: Vec<f64> = (0..n).map(|i| (i as f64 * 0.37).sin()).collect();
    Ok(json!(draws))
}

async fn handle_static(request: &RequestEnvelope, instances: &Instances) -> Result<Value, String> {
    match request.f.as_str() {
        "__createShared__" => {
            let id = request
                .a
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| missing("instance"))?
                .to_string();
            instances.lock().unwrap().entry(id.clone()).or_default();
            Ok(json!(id))
        }
        "__delete__" => {
            let id = request.a.first().and_then(Value::as_str).unwrap_or_default();
            Ok(json!(instances.lock().unwrap().remove(id).is_some()))
        }
        "rnorm" => rnorm(&request.a),
        "test_sys_sleep" => {
            // test_sys_sleep <- function(x = 1) { Sys.sleep(x); x }
            let x = request.a.first().cloned().unwrap_or(json!(1));
            let seconds = x
                .as_f64()
                .ok_or_else(|| "invalid 'time' value".to_string())?;
            tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
            Ok(x)
        }
        "call" => {
            let (target, args) = request.a.split_first().ok_or_else(|| missing("what"))?;
            match target.as_str() {
                Some("rnorm") | Some("stats::rnorm") => rnorm(args),
                Some("stop") => Err(args
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or("error")
                    .to_string()),
                Some(other) => Err(not_found(other)),
                None => Err("invalid 'what' argument".to_string()),
            }
        }
        other => Err(not_found(other)),
    }
}

fn handle_member(request: &RequestEnvelope, instances: &Instances) -> Result<Value, String> {
    let mut instances = instances.lock().unwrap();
    let state = instances
        .get_mut(&request.c)
        .ok_or_else(|| format!("Could not find instance: {}", request.c))?;

    let (function, args) = match request.f.as_str() {
        "call" => {
            let (target, rest) = request.a.split_first().ok_or_else(|| missing("what"))?;
            (target.as_str().unwrap_or_default().to_string(), rest.to_vec())
        }
        other => (other.to_string(), request.a.clone()),
    };

    match function.as_str() {
        "c" => Ok(Value::Array(args)),
        "mean" => {
            let values = args.first().ok_or_else(|| missing("x"))?;
            let numbers: Vec<f64> = match values {
                Value::Array(items) => items.iter().filter_map(Value::as_f64).collect(),
                other => other.as_f64().into_iter().collect(),
            };
            if numbers.is_empty() {
                return Ok(json!("NA"));
            }
            let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
            Ok(json!(mean))
        }
        "select_dataset" => {
            let name = args.first().and_then(Value::as_str).ok_or_else(|| missing("name"))?;
            state.dataset = Some(name.to_string());
            Ok(json!(name))
        }
        "get_table" => {
            let rows = args.first().and_then(Value::as_u64).ok_or_else(|| missing("n"))?;
            let dataset = state
                .dataset
                .clone()
                .ok_or_else(|| "object 'dataset' not found".to_string())?;
            Ok(json!({ "dataset": dataset, "rows": rows }))
        }
        "push" => {
            let value = args.first().cloned().ok_or_else(|| missing("x"))?;
            state.pushed.push(value);
            Ok(json!(state.pushed.len()))
        }
        "values" => Ok(Value::Array(state.pushed.clone())),
        other => Err(not_found(other)),
    }
}

pub fn config() -> RemoteConfig {
    RemoteConfig::new(DOMAIN, AGENT, "mqtt://localhost:1883")
}

/// Broker, running agent and a connected client with discovery complete
pub async fn setup() -> (MemoryBroker, MockAgent, Arc<MemoryTransport>, VrpcRemote) {
    let broker = MemoryBroker::new();
    let agent = MockAgent::start(&broker).await;
    let transport = Arc::new(broker.transport("client"));
    let remote = VrpcRemote::new(config(), transport.clone());
    remote.connect().await.unwrap();
    remote
        .wait_for_class(AGENT, CLASS, Duration::from_secs(2))
        .await
        .unwrap();
    (broker, agent, transport, remote)
}
