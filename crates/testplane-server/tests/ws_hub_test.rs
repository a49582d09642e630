// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hub tests over real sockets: the full runtime on ephemeral ports, the
//! agent crate as the worker peer, and the XML-RPC facade spoken over HTTP.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use testplane_agent::library::testing::EchoLibrary;
use testplane_agent::{Agent, AgentConfig, KeywordLibrary, SessionEnd};
use testplane_core::{
    EndpointRecord, EndpointStatus, MemoryStore, Store, TaskRecord, TaskStatus,
};
use testplane_proxy::{KeywordResult, proxy_path};
use testplane_server::config::Config;
use testplane_server::heartbeat::HeartbeatConfig;
use testplane_server::rooms::room_id;
use testplane_server::runner::MockRunner;
use testplane_server::runtime::ServerRuntime;

async fn start_runtime() -> ServerRuntime {
    let config = Config {
        http_addr: "127.0.0.1:0".parse().unwrap(),
        facade_addr: "127.0.0.1:0".parse().unwrap(),
        data_dir: std::env::temp_dir().join(format!("testplane-hub-{}", Uuid::new_v4())),
        ..Config::default()
    };
    ServerRuntime::builder()
        .store(Arc::new(MemoryStore::new()))
        .runner(Arc::new(MockRunner::new()))
        .config(config)
        .heartbeat_config(HeartbeatConfig {
            poll_interval: Duration::from_millis(200),
            probe_timeout: Duration::from_secs(1),
        })
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
}

fn agent_config(runtime: &ServerRuntime, uid: Uuid) -> AgentConfig {
    let mut config = AgentConfig::new(
        format!("ws://{}", runtime.http_addr()),
        "org-hub",
        uid.to_string(),
    );
    config.reconnect_delay = Duration::from_millis(100);
    config.max_sessions = Some(1);
    config
}

async fn wait_for<F, Fut>(what: &str, mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if predicate().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn insert_offline_endpoint(runtime: &ServerRuntime, uid: Uuid) {
    let ctx = runtime.context();
    let mut endpoint = EndpointRecord::new(uid, "org-hub", None);
    endpoint.status = EndpointStatus::Offline;
    ctx.store.insert_endpoint(&endpoint).await.unwrap();
    ctx.store.create_queues(&endpoint).await.unwrap();
}

#[tokio::test]
async fn test_unknown_uid_first_contact_is_unauthorized() {
    let runtime = start_runtime().await;
    let uid = Uuid::new_v4();
    let agent = Agent::new(agent_config(&runtime, uid), Arc::new(EchoLibrary));

    let end = agent.serve_once().await.unwrap();
    assert_eq!(end, SessionEnd::Unauthorized);

    // Row created Unauthorized; no queues yet.
    let ctx = runtime.context();
    let row = ctx.store.endpoint(uid).await.unwrap().unwrap();
    assert_eq!(row.status, EndpointStatus::Unauthorized);
    assert_eq!(row.organization, "org-hub");
    assert!(
        ctx.store
            .queues_for_endpoint(uid)
            .await
            .unwrap()
            .is_empty()
    );

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_forbidden_endpoint_is_told_so() {
    let runtime = start_runtime().await;
    let uid = Uuid::new_v4();
    let ctx = runtime.context();
    let mut endpoint = EndpointRecord::new(uid, "org-hub", None);
    endpoint.status = EndpointStatus::Forbidden;
    ctx.store.insert_endpoint(&endpoint).await.unwrap();

    let agent = Agent::new(agent_config(&runtime, uid), Arc::new(EchoLibrary));
    let end = agent.serve_once().await.unwrap();
    assert_eq!(end, SessionEnd::Forbidden);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_admitted_agent_serves_keywords_and_goes_online() {
    let runtime = start_runtime().await;
    let uid = Uuid::new_v4();
    insert_offline_endpoint(&runtime, uid).await;

    let agent = Agent::new(agent_config(&runtime, uid), Arc::new(EchoLibrary));
    let session = tokio::spawn(async move { agent.run().await });

    let ctx = runtime.context().clone();
    let path = proxy_path(&uid.to_string(), "");
    wait_for("proxy slot to register", || {
        let ctx = ctx.clone();
        let path = path.clone();
        async move { ctx.registry.get(&path).is_some() }
    })
    .await;

    // A call across the control channel reaches the library.
    let slot = ctx.registry.get(&path).unwrap();
    let names = slot
        .call(
            "get_keyword_names",
            serde_json::json!([]),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert_eq!(names, serde_json::json!(["echo"]));

    let run = slot
        .call(
            "run_keyword",
            serde_json::json!(["echo", ["x"], {}]),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    let result: KeywordResult = serde_json::from_value(run).unwrap();
    assert_eq!(result.return_value.unwrap(), serde_json::json!(["x"]));

    // The heartbeat sweep flips the endpoint Online.
    wait_for("endpoint to go online", || {
        let ctx = ctx.clone();
        async move {
            ctx.store.endpoint(uid).await.unwrap().unwrap().status == EndpointStatus::Online
        }
    })
    .await;

    session.abort();
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_facade_forwards_xmlrpc_to_agent() {
    let runtime = start_runtime().await;
    let uid = Uuid::new_v4();
    insert_offline_endpoint(&runtime, uid).await;

    let agent = Agent::new(agent_config(&runtime, uid), Arc::new(EchoLibrary));
    let session = tokio::spawn(async move { agent.run().await });

    let ctx = runtime.context().clone();
    let path = proxy_path(&uid.to_string(), "");
    wait_for("proxy slot to register", || {
        let ctx = ctx.clone();
        let path = path.clone();
        async move { ctx.registry.get(&path).is_some() }
    })
    .await;

    let url = format!("http://{}/{}", runtime.facade_addr(), uid);
    let body = "<?xml version=\"1.0\"?><methodCall>\
        <methodName>get_keyword_names</methodName></methodCall>";
    let response = reqwest::Client::new()
        .post(&url)
        .header("content-type", "text/xml")
        .body(body)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let text = response.text().await.unwrap();
    assert!(text.contains("<methodResponse>"));
    assert!(text.contains("echo"));

    // Unknown slot path: empty keyword list, not a fault.
    let url = format!("http://{}/{}", runtime.facade_addr(), Uuid::new_v4());
    let text = reqwest::Client::new()
        .post(&url)
        .body(body)
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("<array><data></data></array>"));

    session.abort();
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_message_channel_relays_test_log() {
    let runtime = start_runtime().await;
    let uid = Uuid::new_v4();
    insert_offline_endpoint(&runtime, uid).await;
    let ctx = runtime.context().clone();

    // A running task the stream frames refer to.
    let mut task = TaskRecord::new("smoke", "suites", "org-hub", None);
    task.status = TaskStatus::Running;
    ctx.store.insert_task(&task).await.unwrap();

    let room = room_id("org-hub", None);
    let (_, mut events) = ctx.rooms.subscribe(&room);

    let agent = Agent::new(agent_config(&runtime, uid), Arc::new(EchoLibrary));
    let channel = agent.open_message_channel().await.unwrap();
    channel.send(&task.id.to_string(), "keyword done").await.unwrap();
    // Daemon-level frames are discarded by the fan-out.
    channel.send("", "daemon says hi").await.unwrap();

    wait_for("test log to arrive", || {
        let frame = events.try_recv().ok();
        async move {
            match frame {
                Some(frame) => {
                    assert_eq!(frame.event, "test log");
                    assert_eq!(frame.data["message"].as_str().unwrap(), "keyword done");
                    true
                }
                None => false,
            }
        }
    })
    .await;
    assert!(events.try_recv().is_err(), "daemon frame must not fan out");

    runtime.shutdown().await.unwrap();
}

/// Library whose keyword stalls forever, for the drop-with-pending test.
struct StallLibrary;

#[async_trait::async_trait]
impl KeywordLibrary for StallLibrary {
    fn keyword_names(&self) -> Vec<String> {
        vec!["stall".to_string()]
    }

    async fn run_keyword(
        &self,
        _name: &str,
        _args: Vec<serde_json::Value>,
        _kwargs: serde_json::Value,
    ) -> KeywordResult {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        KeywordResult::pass(serde_json::Value::Null)
    }
}

#[tokio::test]
async fn test_socket_drop_fails_pending_calls() {
    let runtime = start_runtime().await;
    let uid = Uuid::new_v4();
    insert_offline_endpoint(&runtime, uid).await;

    let agent = Agent::new(agent_config(&runtime, uid), Arc::new(StallLibrary));
    let session = tokio::spawn(async move { agent.run().await });

    let ctx = runtime.context().clone();
    let path = proxy_path(&uid.to_string(), "");
    wait_for("proxy slot to register", || {
        let ctx = ctx.clone();
        let path = path.clone();
        async move { ctx.registry.get(&path).is_some() }
    })
    .await;

    let slot = ctx.registry.get(&path).unwrap();
    let pending = {
        let slot = slot.clone();
        tokio::spawn(async move {
            slot.call(
                "run_keyword",
                serde_json::json!(["stall", [], {}]),
                Duration::from_secs(30),
            )
            .await
        })
    };
    wait_for("call to be pending", || {
        let slot = slot.clone();
        async move { slot.pending_calls() == 1 }
    })
    .await;

    // Kill the agent: the control socket drops with one call in flight.
    session.abort();

    let outcome = pending.await.unwrap();
    assert!(matches!(
        outcome,
        Err(testplane_proxy::ProxyError::Disconnected { .. })
    ));

    // The slot is gone, so the next facade lookup is a clean miss.
    wait_for("slot to be removed", || {
        let ctx = ctx.clone();
        let path = path.clone();
        async move { ctx.registry.get(&path).is_none() }
    })
    .await;

    runtime.shutdown().await.unwrap();
}
