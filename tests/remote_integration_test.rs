//! End-to-end tests of the client against an in-process agent

mod common;

use common::{setup, MockAgent, AGENT, CLASS, DOMAIN, MEMBER_FUNCTIONS};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use vrpc::codec::AgentStatus;
use vrpc::transport::MemoryBroker;
use vrpc::{
    Arg, CreateOptions, DiscoveryEvent, EventKind, GenericCall, Map, StaticCall, VrpcError,
    VrpcRemote,
};

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_discovery_events() {
    let broker = MemoryBroker::new();
    let _agent = MockAgent::start(&broker).await;
    let remote = VrpcRemote::new(common::config(), Arc::new(broker.transport("client")));

    // Subscriptions work before connect
    let agent_events = Arc::new(Mutex::new(Vec::new()));
    let sink = agent_events.clone();
    let _sub = remote.on(EventKind::Agent, move |event| {
        sink.lock().unwrap().push(event.clone());
    });
    let mut stream = remote.subscribe();

    remote.connect().await.unwrap();

    let class = tokio::time::timeout(WAIT, async {
        loop {
            if let Some(DiscoveryEvent::Class(class)) = stream.recv().await {
                return class;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(class.domain, DOMAIN);
    assert_eq!(class.agent, AGENT);
    assert_eq!(class.class_name, CLASS);
    assert_eq!(class.member_functions, MEMBER_FUNCTIONS);
    assert!(class.static_functions.contains(&"call".to_string()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = agent_events.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    match &events[0] {
        DiscoveryEvent::Agent(agent) => {
            assert_eq!(agent.agent, AGENT);
            assert_eq!(agent.status, AgentStatus::Online);
            assert_eq!(agent.hostname, "mock-host");
            assert_eq!(agent.version, "3.0.0");
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let record = remote.agent(AGENT).await.unwrap();
    assert!(record.is_online());
    assert_eq!(remote.classes(AGENT).await.len(), 1);
}

#[tokio::test]
async fn test_static_call_returns_array() {
    let (_broker, _agent, _transport, remote) = setup().await;

    let value = remote
        .call_static(StaticCall::new(CLASS, "call").arg("rnorm").arg(10))
        .await
        .unwrap();
    let draws = value.as_array().unwrap();
    assert_eq!(draws.len(), 10);
    assert!(draws.iter().all(|d| d.is_number()));

    // Bound under the generic call's target name
    assert_eq!(remote.static_binding("rnorm").await, Some(value));
}

#[tokio::test]
async fn test_independent_calls_run_in_parallel() {
    let (_broker, _agent, _transport, remote) = setup().await;

    let started = Instant::now();
    let (slow, fast) = tokio::join!(
        remote.call_static(StaticCall::new(CLASS, "test_sys_sleep").arg(0.6)),
        remote.call_static(StaticCall::new(CLASS, "test_sys_sleep").arg(0.4)),
    );
    // Each result comes back to the call that issued it
    assert_eq!(slow.unwrap(), json!(0.6));
    assert_eq!(fast.unwrap(), json!(0.4));

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(600));
    assert!(elapsed < Duration::from_secs(1), "calls were serialized: {:?}", elapsed);
    assert_eq!(remote.pending_calls().await, 0);
}

#[tokio::test]
async fn test_default_argument_result() {
    let (_broker, _agent, _transport, remote) = setup().await;

    let value = remote
        .call_static(StaticCall::new(CLASS, "test_sys_sleep"))
        .await
        .unwrap();
    assert_eq!(value, json!(1));
    assert_eq!(remote.static_binding("test_sys_sleep").await, Some(json!(1)));
}

#[tokio::test]
async fn test_unknown_function_message() {
    let (_broker, _agent, _transport, remote) = setup().await;

    let err = remote
        .call_generic(GenericCall::new(CLASS, "nonexistent").arg(1))
        .await
        .unwrap_err();
    assert!(matches!(err, VrpcError::FunctionNotFound(_)));
    assert_eq!(err.to_string(), "could not find function \"nonexistent\"");
    assert!(err.is_remote());
}

#[tokio::test]
async fn test_missing_argument_message() {
    let (_broker, _agent, _transport, remote) = setup().await;

    let err = remote
        .call_static(StaticCall::new(CLASS, "rnorm"))
        .await
        .unwrap_err();
    match err {
        VrpcError::ArgumentError(message) => {
            assert_eq!(message, "argument \"n\" is missing, with no default")
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_remote_execution_error_is_verbatim() {
    let (_broker, _agent, _transport, remote) = setup().await;

    let err = remote
        .call_generic(GenericCall::new(CLASS, "stop").arg("something broke"))
        .await
        .unwrap_err();
    assert!(matches!(err, VrpcError::RemoteExecution(_)));
    assert_eq!(err.to_string(), "something broke");
}

#[tokio::test]
async fn test_generic_call_with_kwargs() {
    let (_broker, _agent, _transport, remote) = setup().await;

    let value = remote
        .call_generic(GenericCall::new(CLASS, "stats::rnorm").kwarg("n", 5))
        .await
        .unwrap();
    assert_eq!(value.as_array().unwrap().len(), 5);
    assert!(remote.static_binding("stats::rnorm").await.is_some());
}

#[tokio::test]
async fn test_back_reference_resolves_bound_result() {
    let (_broker, _agent, _transport, remote) = setup().await;

    let proxy = remote
        .create(CreateOptions::new(CLASS).instance("s1"))
        .await
        .unwrap();
    assert_eq!(proxy.instance(), "s1");

    let c = proxy
        .call("c", vec![(-2).into(), (-1).into(), 0.into(), 2.into(), 6.into()])
        .await
        .unwrap();
    assert_eq!(c, json!([-2, -1, 0, 2, 6]));

    let by_reference = proxy.call("mean", vec![Arg::from_marker("$c")]).await.unwrap();
    let by_literal = proxy.call("mean", vec![Arg::Literal(c)]).await.unwrap();
    assert_eq!(by_reference.as_f64(), Some(1.0));
    assert_eq!(by_reference, by_literal);

    // A back-reference to a name never bound fails locally
    let err = proxy
        .call("mean", vec![Arg::reference("missing")])
        .await
        .unwrap_err();
    assert!(matches!(err, VrpcError::UnresolvedReference(name) if name == "missing"));
}

#[tokio::test]
async fn test_explicit_binding_overwrites() {
    let (_broker, _agent, _transport, remote) = setup().await;
    let proxy = remote
        .create(CreateOptions::new(CLASS).instance("s1"))
        .await
        .unwrap();

    proxy.call_bound("x", "c", vec![1.into()]).await.unwrap();
    proxy.call_bound("x", "c", vec![2.into(), 3.into()]).await.unwrap();
    assert_eq!(proxy.binding("x"), Some(json!([2, 3])));

    let mean = proxy.call("mean", vec![Arg::reference("x")]).await.unwrap();
    assert_eq!(mean.as_f64(), Some(2.5));
}

#[tokio::test]
async fn test_proxies_are_isolated() {
    let (_broker, agent, _transport, remote) = setup().await;

    let a = remote
        .create(CreateOptions::new(CLASS).instance("a"))
        .await
        .unwrap();
    let b = remote
        .create(CreateOptions::new(CLASS).instance("b"))
        .await
        .unwrap();
    assert_eq!(agent.instance_count(), 2);

    a.call("push", vec![json!("only in a").into()]).await.unwrap();
    a.call("c", vec![1.into()]).await.unwrap();

    assert_eq!(a.call("values", vec![]).await.unwrap(), json!(["only in a"]));
    assert_eq!(b.call("values", vec![]).await.unwrap(), json!([]));

    // Bindings do not leak across proxies
    assert!(a.binding("c").is_some());
    assert!(b.binding("c").is_none());
    let err = b.call("mean", vec![Arg::reference("c")]).await.unwrap_err();
    assert!(matches!(err, VrpcError::UnresolvedReference(_)));
}

#[tokio::test]
async fn test_generated_instance_id() {
    let (_broker, agent, _transport, remote) = setup().await;

    let proxy = remote.create(CreateOptions::new(CLASS)).await.unwrap();
    assert!(proxy.instance().starts_with("Session-"));
    assert!(agent.has_instance(proxy.instance()));
    assert_eq!(proxy.functions(), MEMBER_FUNCTIONS);
    assert_eq!(remote.proxies().await, vec![proxy.instance().to_string()]);
}

#[tokio::test]
async fn test_member_calls_through_generic_entry_and_methods() {
    let (_broker, _agent, _transport, remote) = setup().await;
    let proxy = remote
        .create(CreateOptions::new(CLASS).instance("s1"))
        .await
        .unwrap();

    let mut kwargs = Map::new();
    kwargs.insert("sep".into(), json!(","));
    let value = proxy
        .call_generic("c", vec![1.into(), 2.into()], kwargs)
        .await
        .unwrap();
    assert_eq!(value, json!([1, 2, {"sep": ","}]));

    let select = proxy.method("select_dataset").unwrap();
    assert_eq!(select.name(), "select_dataset");
    select.invoke(vec!["iris".into()]).await.unwrap();
    let table = proxy
        .method("get_table")
        .unwrap()
        .invoke(vec![1.into()])
        .await
        .unwrap();
    assert_eq!(table, json!({"dataset": "iris", "rows": 1}));

    let err = proxy.method("plot").unwrap_err();
    assert_eq!(err.to_string(), "could not find function \"plot\"");
}

#[tokio::test]
async fn test_deleted_instance_never_reaches_transport() {
    let (_broker, agent, transport, remote) = setup().await;
    let proxy = remote
        .create(CreateOptions::new(CLASS).instance("s1"))
        .await
        .unwrap();
    proxy.call("select_dataset", vec!["iris".into()]).await.unwrap();

    assert!(remote.delete("s1").await.unwrap());
    assert!(proxy.is_deleted());
    assert!(!agent.has_instance("s1"));

    let published = transport.publish_count();
    let err = proxy.call("get_table", vec![1.into()]).await.unwrap_err();
    assert!(matches!(err, VrpcError::InstanceNotFound(ref id) if id == "s1"));
    assert!(err.is_local());

    let err = remote.delete("s1").await.unwrap_err();
    assert!(matches!(err, VrpcError::InstanceNotFound(_)));
    assert_eq!(transport.publish_count(), published);
}

#[tokio::test]
async fn test_timeout_and_late_response() {
    let (_broker, _agent, _transport, remote) = setup().await;

    let started = Instant::now();
    let err = remote
        .call_static(
            StaticCall::new(CLASS, "test_sys_sleep")
                .arg(0.5)
                .timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(400));
    match err {
        VrpcError::Timeout { function, timeout } => {
            assert_eq!(function, "test_sys_sleep");
            assert_eq!(timeout, Duration::from_millis(100));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(remote.pending_calls().await, 0);

    // The late response is dropped and the session stays usable
    tokio::time::sleep(Duration::from_millis(600)).await;
    let value = remote
        .call_static(StaticCall::new(CLASS, "rnorm").arg(3))
        .await
        .unwrap();
    assert_eq!(value.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_disconnect_rejects_in_flight_calls() {
    let (_broker, _agent, _transport, remote) = setup().await;
    let remote = Arc::new(remote);

    let caller = remote.clone();
    let in_flight = tokio::spawn(async move {
        caller
            .call_static(StaticCall::new(CLASS, "test_sys_sleep").arg(1.0))
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(remote.pending_calls().await, 1);

    remote.disconnect().await.unwrap();
    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(err, VrpcError::NotConnected));

    assert!(remote.agents().await.is_empty());
    let err = remote
        .call_static(StaticCall::new(CLASS, "rnorm").arg(1))
        .await
        .unwrap_err();
    assert!(matches!(err, VrpcError::NotConnected));
}

#[tokio::test]
async fn test_class_reannouncement_replaces_lists() {
    let (_broker, agent, _transport, remote) = setup().await;
    let mut stream = remote.subscribe();

    agent.announce_class(&["call"], &["call", "c", "c"]).await;

    let event = tokio::time::timeout(WAIT, async {
        loop {
            if let Some(DiscoveryEvent::Class(class)) = stream.recv().await {
                return class;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event.static_functions, vec!["call"]);
    assert_eq!(event.member_functions, vec!["call", "c"]);

    let info = remote.class_info(AGENT, CLASS).await.unwrap();
    assert_eq!(info.member_functions, vec!["call", "c"]);
    assert_eq!(remote.classes(AGENT).await.len(), 1);
}

#[tokio::test]
async fn test_offline_agent_is_retained() {
    let (_broker, agent, _transport, remote) = setup().await;
    let mut stream = remote.subscribe();

    agent.announce_status("offline").await;

    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(DiscoveryEvent::Agent(a)) = stream.recv().await {
                if a.status == AgentStatus::Offline {
                    return;
                }
            }
        }
    })
    .await
    .unwrap();

    let record = remote.agent(AGENT).await.unwrap();
    assert!(!record.is_online());
    assert_eq!(record.classes.len(), 1);
}

#[tokio::test]
async fn test_offline_agent_purged_when_configured() {
    let broker = MemoryBroker::new();
    let agent = MockAgent::start(&broker).await;
    let mut config = common::config();
    config.purge_offline_agents = true;
    let remote = VrpcRemote::new(config, Arc::new(broker.transport("client")));
    remote.connect().await.unwrap();
    remote.wait_for_class(AGENT, CLASS, WAIT).await.unwrap();

    let mut stream = remote.subscribe();
    agent.announce_status("offline").await;
    tokio::time::timeout(WAIT, stream.recv()).await.unwrap();

    assert!(remote.agent(AGENT).await.is_none());
}

#[tokio::test]
async fn test_cancelled_subscription_stops_only_itself() {
    let (_broker, agent, _transport, remote) = setup().await;

    let first = Arc::new(Mutex::new(0));
    let second = Arc::new(Mutex::new(0));
    let (f, s) = (first.clone(), second.clone());
    let sub1 = remote.on(EventKind::Class, move |_| *f.lock().unwrap() += 1);
    let _sub2 = remote.on(EventKind::Class, move |_| *s.lock().unwrap() += 1);
    sub1.cancel();

    agent.announce_class(&["call"], &["call"]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(*first.lock().unwrap(), 0);
    assert_eq!(*second.lock().unwrap(), 1);
}
