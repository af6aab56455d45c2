//! End-to-end broker ↔ gate tests over real sockets and descriptors.
//!
//! Each test stands up one or more in-process gates with the scripted
//! interpreter and a connection manager with tightened poll intervals.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use gate_protocol::ipc::IpcConfig;
use gate_protocol::messages::StreamChannel;
use repl_gate::testing::ScriptedInterpreter;
use repl_gate::{GateConfig, GateHandle, RestartMode};
use rgw::broker::{ConnStatus, ConnectionManager, ToolRegistry};
use rgw::config::BrokerConfig;
use rgw::prefs::Preferences;

fn broker_config(dir: &Path) -> BrokerConfig {
    BrokerConfig {
        gates_dir: dir.join("gates"),
        state_dir: dir.join("state"),
        watcher_interval: Duration::from_millis(100),
        health_interval: Duration::from_millis(200),
        drain_interval: Duration::from_millis(10),
        async_deadline: Duration::from_secs(10),
        ipc: IpcConfig {
            request_recv_timeout: Duration::from_millis(300),
            ..IpcConfig::default()
        },
        ..BrokerConfig::default()
    }
}

fn manager_for(config: &BrokerConfig) -> (Arc<ConnectionManager>, Arc<ToolRegistry>) {
    let registry = Arc::new(ToolRegistry::new());
    let prefs = Arc::new(Preferences::load(config.preferences_file()));
    let manager = ConnectionManager::new(config.clone(), Arc::clone(&registry), prefs);
    manager.start(true);
    (manager, registry)
}

fn gate_config(config: &BrokerConfig, namespace: &str) -> GateConfig {
    let mut gate = GateConfig::new("e2e", namespace);
    gate.force = true;
    gate.gates_dir = Some(config.gates_dir.clone());
    gate.project_path = "/work/acme".into();
    gate.restart_mode = RestartMode::Respawn;
    gate
}

async fn start_gate(config: GateConfig) -> GateHandle {
    repl_gate::start(Arc::new(ScriptedInterpreter::new()), config)
        .await
        .expect("gate start")
        .expect("forced gate starts")
}

async fn wait_until(what: &str, deadline: Duration, mut probe: impl FnMut() -> bool) {
    let started = std::time::Instant::now();
    while !probe() {
        assert!(started.elapsed() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_discover_and_ping() {
    let dir = tempfile::tempdir().unwrap();
    let config = broker_config(dir.path());
    let gate = start_gate(gate_config(&config, "acme")).await;
    let (manager, _registry) = manager_for(&config);

    wait_until("discovery", Duration::from_secs(5), || {
        manager.connections().len() == 1
            && manager.connections()[0].status() == ConnStatus::Connected
    })
    .await;

    let connection = manager.connections()[0].clone();
    let sid = gate.session_id().simple().to_string();
    assert_eq!(connection.short_key(), &sid[..8]);
    assert_eq!(connection.display_name(), "acme");

    let pong = connection.ping().await.unwrap();
    assert_eq!(pong.pid, std::process::id() as i32);

    // The health task keeps last_seen moving strictly forward.
    let seen_before = connection.last_seen().unwrap();
    wait_until("health tick", Duration::from_secs(5), || {
        connection.last_seen().map(|t| t > seen_before).unwrap_or(false)
    })
    .await;

    manager.shutdown().await;
    gate.stop().await;
}

#[tokio::test]
async fn test_synchronous_eval() {
    let dir = tempfile::tempdir().unwrap();
    let config = broker_config(dir.path());
    let gate = start_gate(gate_config(&config, "acme")).await;
    let (manager, _registry) = manager_for(&config);

    wait_until("discovery", Duration::from_secs(5), || {
        manager.gate_attached()
    })
    .await;
    let connection = manager.connections()[0].clone();

    let calls_before = connection.tool_call_count();
    let record = connection.eval_remote("1+1", None).await;
    assert_eq!(record.value_repr, "2");
    assert_eq!(record.stdout, "");
    assert_eq!(record.stderr, "");
    assert!(record.exception.is_none());
    assert!(record.backtrace.is_none());
    assert_eq!(connection.tool_call_count(), calls_before + 1);

    manager.shutdown().await;
    gate.stop().await;
}

#[tokio::test]
async fn test_concurrent_async_evals_share_output() {
    let dir = tempfile::tempdir().unwrap();
    let config = broker_config(dir.path());
    let gate = start_gate(gate_config(&config, "acme")).await;
    let (manager, _registry) = manager_for(&config);

    wait_until("discovery", Duration::from_secs(5), || {
        manager.gate_attached()
    })
    .await;
    let connection = manager.connections()[0].clone();

    let code = "print 10 line\nvalue \"done\"";
    let chunks_a = Arc::new(Mutex::new(Vec::<String>::new()));
    let chunks_b = Arc::new(Mutex::new(Vec::<String>::new()));

    let conn_a = Arc::clone(&connection);
    let sink_a = Arc::clone(&chunks_a);
    let op_a = tokio::spawn(async move {
        let cb = move |channel: StreamChannel, text: &str| {
            if channel == StreamChannel::Stdout {
                sink_a.lock().push(text.to_string());
            }
        };
        conn_a
            .eval_remote_async(code, None, Duration::from_secs(10), Some(&cb))
            .await
    });
    let conn_b = Arc::clone(&connection);
    let sink_b = Arc::clone(&chunks_b);
    let op_b = tokio::spawn(async move {
        let cb = move |channel: StreamChannel, text: &str| {
            if channel == StreamChannel::Stdout {
                sink_b.lock().push(text.to_string());
            }
        };
        conn_b
            .eval_remote_async(code, None, Duration::from_secs(10), Some(&cb))
            .await
    });

    let record_a = op_a.await.unwrap();
    let record_b = op_b.await.unwrap();

    // Each op completes independently with exactly its own terminal event.
    assert_eq!(record_a.value_repr, "\"done\"");
    assert_eq!(record_b.value_repr, "\"done\"");
    assert!(record_a.exception.is_none());
    assert!(record_b.exception.is_none());

    // Shared stdout is broadcast: each caller observed at least its own
    // ten lines.
    assert!(chunks_a.lock().len() >= 10, "a saw {}", chunks_a.lock().len());
    assert!(chunks_b.lock().len() >= 10, "b saw {}", chunks_b.lock().len());

    manager.shutdown().await;
    gate.stop().await;
}

#[tokio::test]
async fn test_timeout_recovery_without_health_task() {
    let dir = tempfile::tempdir().unwrap();
    // Park the health loop: recovery must not depend on it.
    let mut config = broker_config(dir.path());
    config.health_interval = Duration::from_secs(3600);
    let gate = start_gate(gate_config(&config, "acme")).await;

    let registry = Arc::new(ToolRegistry::new());
    let prefs = Arc::new(Preferences::load(config.preferences_file()));
    let manager = ConnectionManager::new(config.clone(), registry, prefs);
    manager.start(false);
    wait_until("discovery", Duration::from_secs(5), || {
        manager.gate_attached()
    })
    .await;
    let connection = manager.connections()[0].clone();

    // Evaluation outlasting the 300 ms receive timeout.
    let record = connection.eval_remote("sleep 500", None).await;
    assert!(record.is_failure());
    assert!(
        record.exception.as_deref().unwrap().contains("timed out"),
        "got: {:?}",
        record.exception
    );

    // The very next synchronous op succeeds on the recreated socket.
    let pong = connection.ping().await.unwrap();
    assert_eq!(pong.pid, std::process::id() as i32);

    manager.shutdown().await;
    gate.stop().await;
}

#[tokio::test]
async fn test_catalog_change_updates_registry() {
    let dir = tempfile::tempdir().unwrap();
    let config = broker_config(dir.path());

    let mut first = gate_config(&config, "proj");
    first.tools.push(named_tool("foo"));
    let gate = start_gate(first).await;
    let sid = gate.session_id();

    let (manager, registry) = manager_for(&config);
    wait_until("initial catalog", Duration::from_secs(5), || {
        registry.find("proj.foo").is_some()
    })
    .await;
    let _ = registry.take_notifications();

    // The gate comes back with a second tool under the same session id.
    gate.stop().await;
    let mut second = gate_config(&config, "proj");
    second.session_id = Some(sid);
    second.tools.push(named_tool("foo"));
    second.tools.push(named_tool("bar"));
    let gate = start_gate(second).await;

    wait_until("catalog update", Duration::from_secs(5), || {
        registry.find("proj.foo").is_some() && registry.find("proj.bar").is_some()
    })
    .await;
    assert!(registry.has_pending_notifications());

    manager.shutdown().await;
    gate.stop().await;
}

#[tokio::test]
async fn test_restart_preserves_broker_connection() {
    let dir = tempfile::tempdir().unwrap();
    let config = broker_config(dir.path());
    let gate = start_gate(gate_config(&config, "acme")).await;
    let sid = gate.session_id();
    let (manager, _registry) = manager_for(&config);

    wait_until("discovery", Duration::from_secs(5), || {
        manager.gate_attached()
    })
    .await;
    let connection = manager.find_by_session(sid).unwrap();
    let connected_before = connection.connected_at().unwrap();

    connection.send_restart().await.unwrap();

    // The broker ends up holding a connected connection for the same
    // session id again.
    wait_until("reconnect after restart", Duration::from_secs(10), || {
        manager
            .find_by_session(sid)
            .map(|c| {
                c.status() == ConnStatus::Connected
                    && c.connected_at().map(|t| t > connected_before).unwrap_or(false)
            })
            .unwrap_or(false)
    })
    .await;

    // And it still evaluates.
    let record = manager
        .find_by_session(sid)
        .unwrap()
        .eval_remote("2+3", None)
        .await;
    assert_eq!(record.value_repr, "5");

    manager.shutdown().await;
    gate.stop().await;
}

#[tokio::test]
async fn test_dead_gate_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let config = broker_config(dir.path());
    let gate = start_gate(gate_config(&config, "acme")).await;
    let (manager, _registry) = manager_for(&config);

    wait_until("discovery", Duration::from_secs(5), || {
        manager.gate_attached()
    })
    .await;

    // Clean shutdown removes the descriptor; the health loop then drops
    // the connection entirely.
    gate.stop().await;
    wait_until("removal", Duration::from_secs(5), || {
        manager.connections().is_empty()
    })
    .await;

    manager.shutdown().await;
}

fn named_tool(name: &str) -> repl_gate::SessionToolBinding {
    use gate_protocol::tools::{ToolArg, ToolDescriptor, TypeDesc};
    repl_gate::SessionToolBinding::new(
        ToolDescriptor::new(name, format!("session tool {name}"))
            .with_arg(ToolArg::new("x", TypeDesc::String).optional()),
        Arc::new(|args, _ctx: &repl_gate::ToolContext| Ok(json!({"echo": args}))),
    )
}

#[tokio::test]
async fn test_http_eval_streams_progress_then_result() {
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    let dir = tempfile::tempdir().unwrap();
    let config = broker_config(dir.path());
    let gate = start_gate(gate_config(&config, "acme")).await;

    let ctx = rgw::BrokerContext::new(config, rgw_auth::SecurityConfig::default());
    ctx.start_background();
    wait_until("discovery", Duration::from_secs(5), || {
        ctx.manager.gate_attached()
    })
    .await;

    let body = json!({
        "jsonrpc": "2.0",
        "id": 9,
        "method": "tools/call",
        "params": {
            "name": "repl_eval",
            "arguments": {"code": "print 5 tick\nvalue \"done\""},
        },
    })
    .to_string();

    let response = rgw::http::router(Arc::clone(&ctx))
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    assert!(response.headers().contains_key(rgw::http::SESSION_HEADER));

    // Collecting the body waits for the stream to close after the final
    // JSON-RPC response event.
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let events: Vec<serde_json::Value> = text
        .split("\n\n")
        .filter_map(|chunk| chunk.strip_prefix("data: "))
        .map(|json| serde_json::from_str(json).unwrap())
        .collect();

    let progress: Vec<&serde_json::Value> = events
        .iter()
        .filter(|e| e["method"] == json!("notifications/progress"))
        .collect();
    assert!(progress.len() >= 5, "saw {} progress events", progress.len());
    let token = &progress[0]["params"]["progressToken"];
    assert!(progress.iter().all(|e| &e["params"]["progressToken"] == token));

    let finals: Vec<&serde_json::Value> =
        events.iter().filter(|e| e.get("result").is_some()).collect();
    assert_eq!(finals.len(), 1, "exactly one final response");
    assert_eq!(finals[0]["id"], json!(9));
    let text = finals[0]["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("=> \"done\""), "got: {text}");
    assert_eq!(finals[0]["result"]["isError"], json!(false));

    ctx.shutdown().await;
    gate.stop().await;
}

#[tokio::test]
async fn test_http_session_tool_streams() {
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    let dir = tempfile::tempdir().unwrap();
    let config = broker_config(dir.path());
    let mut gate_cfg = gate_config(&config, "proj");
    gate_cfg.tools.push(named_tool("echo"));
    let gate = start_gate(gate_cfg).await;

    let ctx = rgw::BrokerContext::new(config, rgw_auth::SecurityConfig::default());
    ctx.start_background();
    wait_until("tool registration", Duration::from_secs(5), || {
        ctx.registry.find("proj.echo").is_some()
    })
    .await;

    let body = json!({
        "jsonrpc": "2.0",
        "id": 3,
        "method": "tools/call",
        "params": {"name": "proj.echo", "arguments": {"x": "hi"}},
    })
    .to_string();

    let response = rgw::http::router(Arc::clone(&ctx))
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let finals: Vec<serde_json::Value> = text
        .split("\n\n")
        .filter_map(|chunk| chunk.strip_prefix("data: "))
        .map(|json| serde_json::from_str(json).unwrap())
        .filter(|e: &serde_json::Value| e.get("result").is_some())
        .collect();
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0]["result"]["isError"], json!(false));
    assert!(finals[0]["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("hi"));

    ctx.shutdown().await;
    gate.stop().await;
}
