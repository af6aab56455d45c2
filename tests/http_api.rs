//! Dispatcher tests driven through the axum router without a live listener.

use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use rgw::config::BrokerConfig;
use rgw::http::{router, SESSION_HEADER};
use rgw::BrokerContext;
use rgw_auth::{AccessMode, SecurityConfig};

fn context(dir: &Path, security: SecurityConfig) -> Arc<BrokerContext> {
    let config = BrokerConfig {
        gates_dir: dir.join("gates"),
        state_dir: dir.join("state"),
        ..BrokerConfig::default()
    };
    BrokerContext::new(config, security)
}

fn lax_context(dir: &Path) -> Arc<BrokerContext> {
    context(dir, SecurityConfig::default())
}

fn rpc_body(method: &str, params: Value) -> String {
    json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params}).to_string()
}

async fn post_rpc(
    ctx: &Arc<BrokerContext>,
    body: String,
    session: Option<&str>,
) -> (StatusCode, Option<String>, Value) {
    let mut request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(session) = session {
        request = request.header(SESSION_HEADER, session);
    }
    let response = router(Arc::clone(ctx))
        .oneshot(request.body(Body::from(body)).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let session = response
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, session, value)
}

#[tokio::test]
async fn test_initialize_assigns_session_header() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = lax_context(dir.path());

    let (status, session, body) = post_rpc(&ctx, rpc_body("initialize", json!({})), None).await;
    assert_eq!(status, StatusCode::OK);
    let session = session.expect("initialize sets Mcp-Session-Id");
    assert_eq!(body["result"]["serverInfo"]["name"], json!("repl-gateway"));
    assert_eq!(
        body["result"]["capabilities"]["tools"]["listChanged"],
        json!(true)
    );

    // The assigned id is honored on the next request.
    let (status, echoed, body) =
        post_rpc(&ctx, rpc_body("tools/list", json!({})), Some(&session)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(echoed.as_deref(), Some(session.as_str()));
    assert!(body["result"]["tools"].is_array());
}

#[tokio::test]
async fn test_session_identity_survives_context_restart() {
    let dir = tempfile::tempdir().unwrap();
    let session = {
        let ctx = lax_context(dir.path());
        let (_, session, _) = post_rpc(&ctx, rpc_body("initialize", json!({})), None).await;
        session.unwrap()
    };

    // A new context over the same state dir restores the persisted session.
    let ctx = lax_context(dir.path());
    let (status, echoed, body) = post_rpc(
        &ctx,
        rpc_body("tools/call", json!({"name": "repl_sessions", "arguments": {}})),
        Some(&session),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(echoed.as_deref(), Some(session.as_str()));
    assert!(body["result"]["content"].is_array());
    assert!(ctx.sessions.contains(session.parse().unwrap()));
}

#[tokio::test]
async fn test_get_and_delete_are_405() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = lax_context(dir.path());

    for method in ["GET", "DELETE"] {
        let response = router(Arc::clone(&ctx))
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri("/mcp")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            response.headers().get(header::ALLOW).unwrap(),
            "POST",
            "{method} must advertise Allow: POST"
        );
    }
}

#[tokio::test]
async fn test_relaxed_mode_requires_key() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(
        dir.path(),
        SecurityConfig {
            mode: AccessMode::Relaxed,
            api_keys: vec!["topsecret".to_string()],
            ..SecurityConfig::default()
        },
    );

    let (status, _, body) = post_rpc(&ctx, rpc_body("tools/list", json!({})), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    // With the key, the same request is admitted.
    let response = router(Arc::clone(&ctx))
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header(header::AUTHORIZATION, "Bearer topsecret")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(rpc_body("tools/list", json!({}))))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_tools_list_contains_builtins() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = lax_context(dir.path());

    let (_, _, body) = post_rpc(&ctx, rpc_body("tools/list", json!({})), None).await;
    let names: Vec<&str> = body["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    for expected in ["repl_eval", "repl_sessions", "repl_restart", "repl_set_option"] {
        assert!(names.contains(&expected), "missing {expected} in {names:?}");
    }
}

#[tokio::test]
async fn test_tools_call_validation_errors() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = lax_context(dir.path());

    // Unknown tool.
    let (_, _, body) = post_rpc(
        &ctx,
        rpc_body("tools/call", json!({"name": "no_such_tool", "arguments": {}})),
        None,
    )
    .await;
    assert_eq!(body["error"]["code"], json!(-32602));
    assert!(body["error"]["message"].as_str().unwrap().contains("no_such_tool"));

    // Known tool, bad arguments: message lists missing, unknown, and valid.
    let (_, _, body) = post_rpc(
        &ctx,
        rpc_body(
            "tools/call",
            json!({"name": "repl_eval", "arguments": {"bogus": 1}}),
        ),
        None,
    )
    .await;
    assert_eq!(body["error"]["code"], json!(-32602));
    let message = body["error"]["message"].as_str().unwrap();
    assert!(message.contains("code"));
    assert!(message.contains("bogus"));
    assert!(message.contains("valid parameters"));
}

#[tokio::test]
async fn test_eval_without_gate_reports_tool_error() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = lax_context(dir.path());

    // No gates connected: the call is non-streaming and fails as a tool
    // result, not a transport error.
    let (status, _, body) = post_rpc(
        &ctx,
        rpc_body("tools/call", json!({"name": "repl_eval", "arguments": {"code": "1+1"}})),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["isError"], json!(true));
    assert!(body["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("no gate session"));
}

#[tokio::test]
async fn test_resources_prompts_and_info() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = lax_context(dir.path());

    let (_, _, body) = post_rpc(&ctx, rpc_body("resources/list", json!({})), None).await;
    assert_eq!(body["result"]["resources"], json!([]));

    let (_, _, body) =
        post_rpc(&ctx, rpc_body("resources/templates/list", json!({})), None).await;
    assert_eq!(body["result"]["resourceTemplates"], json!([]));

    let (_, _, body) = post_rpc(
        &ctx,
        rpc_body("resources/read", json!({"uri": "repl://nope"})),
        None,
    )
    .await;
    assert_eq!(body["error"]["code"], json!(-32602));

    let (_, _, body) = post_rpc(&ctx, rpc_body("prompts/list", json!({})), None).await;
    assert_eq!(
        body["result"]["prompts"][0]["name"],
        json!("repl_workflow")
    );

    let (_, _, body) = post_rpc(
        &ctx,
        rpc_body("prompts/get", json!({"name": "repl_workflow"})),
        None,
    )
    .await;
    assert_eq!(body["result"]["messages"][0]["role"], json!("user"));

    let (_, _, body) = post_rpc(&ctx, rpc_body("session/info", json!({})), None).await;
    assert!(body["result"]["uptime_secs"].is_number());
    assert_eq!(body["result"]["gates"], json!([]));

    let (_, _, body) = post_rpc(
        &ctx,
        rpc_body("logging/setLevel", json!({"level": "debug"})),
        None,
    )
    .await;
    assert!(body["result"].is_object());
    assert_eq!(*ctx.log_level.lock(), "debug");
}

#[tokio::test]
async fn test_unknown_method_and_malformed_body() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = lax_context(dir.path());

    let (_, _, body) = post_rpc(&ctx, rpc_body("no/such/method", json!({})), None).await;
    assert_eq!(body["error"]["code"], json!(-32601));

    let (_, _, body) = post_rpc(&ctx, "{broken".to_string(), None).await;
    assert_eq!(body["error"]["code"], json!(-32700));

    let (_, _, body) = post_rpc(&ctx, json!({"id": 1}).to_string(), None).await;
    assert_eq!(body["error"]["code"], json!(-32600));

    let (_, _, body) = post_rpc(
        &ctx,
        rpc_body("tools/list", json!({})),
        Some("not-a-uuid"),
    )
    .await;
    assert_eq!(body["error"]["code"], json!(-32600));
}

#[tokio::test]
async fn test_notifications_initialized_returns_202() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = lax_context(dir.path());

    let (status, session, body) = post_rpc(
        &ctx,
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string(),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(session.is_some());
    assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn test_editor_response_accepts_nonce_once() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(
        dir.path(),
        SecurityConfig {
            mode: AccessMode::Relaxed,
            api_keys: vec!["k".to_string()],
            ..SecurityConfig::default()
        },
    );
    let nonce = ctx.nonces.issue("req-77");

    let post = |body: String| {
        let ctx = Arc::clone(&ctx);
        async move {
            router(ctx)
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/vscode-response")
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(Body::from(body))
                        .unwrap(),
                )
                .await
                .unwrap()
        }
    };

    // Without credentials the nonce alone admits the request.
    let response = post(json!({"nonce": nonce}).to_string()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["request_id"], json!("req-77"));

    // Nonces are single use: the replay is held to normal admission.
    let response = post(json!({"nonce": nonce}).to_string()).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
