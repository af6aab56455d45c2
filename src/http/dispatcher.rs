//! JSON-RPC over HTTP dispatcher.
//!
//! One POST path carries every method. Requests are admitted by the
//! security record, attached to an MCP session via the `Mcp-Session-Id`
//! header, and routed. Gate-backed tool calls switch the response to an
//! SSE stream; everything else answers with a single JSON body.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Map, Value};
use tower_http::trace::TraceLayer;
use tracing::debug;
use uuid::Uuid;

use rgw_auth::{authorize, bearer_token, source_ip, Credentials};

use crate::broker::registry::ToolKind;
use crate::builtins::{session_summary, tool_outcome_value, EVAL_TOOL_NAME};
use crate::http::rpc::{self, RpcRequest};
use crate::http::session::McpSession;
use crate::http::sse;
use crate::BrokerContext;

pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Built-in prompt exposed over `prompts/list` / `prompts/get`.
const WORKFLOW_PROMPT: &str = "repl_workflow";
const WORKFLOW_PROMPT_TEXT: &str = "Use repl_sessions to see connected interpreter sessions, \
then repl_eval to run code in one. Output streams back as progress notifications; the final \
event carries the result. Session-specific tools appear under the session's namespace prefix.";

pub fn router(ctx: Arc<BrokerContext>) -> Router {
    Router::new()
        .route(
            "/",
            post(handle_rpc).get(method_not_allowed).delete(method_not_allowed),
        )
        .route(
            "/mcp",
            post(handle_rpc).get(method_not_allowed).delete(method_not_allowed),
        )
        .route("/vscode-response", post(handle_editor_response))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST")],
        Json(json!({"error": "only POST is supported"})),
    )
        .into_response()
}

fn admission(ctx: &BrokerContext, headers: &HeaderMap, peer: IpAddr) -> Result<(), Response> {
    let credentials = Credentials {
        bearer: bearer_token(
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok()),
        ),
        source_ip: source_ip(
            headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()),
            peer,
        ),
    };
    authorize(&ctx.security, &credentials).map_err(|e| {
        let status =
            StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::UNAUTHORIZED);
        (status, Json(json!({"error": e.to_string()}))).into_response()
    })
}

fn rpc_response(session_id: Uuid, body: Value) -> Response {
    ([(SESSION_HEADER, session_id.to_string())], Json(body)).into_response()
}

/// Peer address recorded by `into_make_service_with_connect_info`;
/// loopback when absent (tests drive the router directly).
fn peer_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

async fn read_body(request: Request) -> (HeaderMap, Bytes) {
    let headers = request.headers().clone();
    let body = axum::body::to_bytes(request.into_body(), 4 * 1024 * 1024)
        .await
        .unwrap_or_default();
    (headers, body)
}

async fn handle_rpc(State(ctx): State<Arc<BrokerContext>>, request: Request) -> Response {
    let peer = peer_ip(&request);
    let (headers, body) = read_body(request).await;
    if let Err(denied) = admission(&ctx, &headers, peer) {
        return denied;
    }

    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return Json(rpc::error_response(
                None,
                rpc::PARSE_ERROR,
                format!("unparseable request body: {e}"),
            ))
            .into_response()
        }
    };
    let request: RpcRequest = match serde_json::from_value(parsed) {
        Ok(request) => request,
        Err(e) => {
            return Json(rpc::error_response(
                None,
                rpc::INVALID_REQUEST,
                format!("not a JSON-RPC request: {e}"),
            ))
            .into_response()
        }
    };

    let header_id = match headers.get(SESSION_HEADER) {
        None => None,
        Some(raw) => match raw.to_str().ok().and_then(|s| Uuid::try_parse(s).ok()) {
            Some(id) => Some(id),
            None => {
                return Json(rpc::error_response(
                    request.id.as_ref(),
                    rpc::INVALID_REQUEST,
                    "malformed Mcp-Session-Id header",
                ))
                .into_response()
            }
        },
    };

    debug!(method = %request.method, "rpc request");

    if request.method == "notifications/initialized" {
        let session = ctx.sessions.get_or_create(header_id, false);
        return (
            StatusCode::ACCEPTED,
            [(SESSION_HEADER, session.id.to_string())],
        )
            .into_response();
    }

    let is_initialize = request.method == "initialize";
    let session = ctx.sessions.get_or_create(header_id, is_initialize);

    match request.method.as_str() {
        "initialize" => rpc_response(
            session.id,
            rpc::response(request.id.as_ref(), initialize_result()),
        ),
        "tools/list" => rpc_response(
            session.id,
            rpc::response(request.id.as_ref(), tools_list(&ctx)),
        ),
        "tools/call" => handle_tools_call(ctx, session, request).await,
        "resources/list" => rpc_response(
            session.id,
            rpc::response(request.id.as_ref(), resources_list(&ctx)),
        ),
        "resources/read" => {
            let body = match resources_read(&ctx, &request) {
                Ok(result) => rpc::response(request.id.as_ref(), result),
                Err(message) => {
                    rpc::error_response(request.id.as_ref(), rpc::INVALID_PARAMS, message)
                }
            };
            rpc_response(session.id, body)
        }
        "resources/templates/list" => rpc_response(
            session.id,
            rpc::response(request.id.as_ref(), json!({"resourceTemplates": []})),
        ),
        "prompts/list" => rpc_response(
            session.id,
            rpc::response(
                request.id.as_ref(),
                json!({"prompts": [{
                    "name": WORKFLOW_PROMPT,
                    "description": "How to drive interpreter sessions through this broker",
                }]}),
            ),
        ),
        "prompts/get" => {
            let body = match request.param_str("name") {
                Some(WORKFLOW_PROMPT) => rpc::response(
                    request.id.as_ref(),
                    json!({
                        "description": "How to drive interpreter sessions through this broker",
                        "messages": [{
                            "role": "user",
                            "content": {"type": "text", "text": WORKFLOW_PROMPT_TEXT},
                        }],
                    }),
                ),
                Some(other) => rpc::error_response(
                    request.id.as_ref(),
                    rpc::INVALID_PARAMS,
                    format!("unknown prompt {other:?}"),
                ),
                None => rpc::error_response(
                    request.id.as_ref(),
                    rpc::INVALID_PARAMS,
                    "missing prompt name",
                ),
            };
            rpc_response(session.id, body)
        }
        "logging/setLevel" => {
            if let Some(level) = request.param_str("level") {
                *ctx.log_level.lock() = level.to_string();
            }
            rpc_response(session.id, rpc::response(request.id.as_ref(), json!({})))
        }
        "session/info" => rpc_response(
            session.id,
            rpc::response(request.id.as_ref(), session_info(&ctx)),
        ),
        other => rpc_response(
            session.id,
            rpc::error_response(
                request.id.as_ref(),
                rpc::METHOD_NOT_FOUND,
                format!("unknown method {other:?}"),
            ),
        ),
    }
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": "2024-11-05",
        "serverInfo": {
            "name": "repl-gateway",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": {
            "tools": {"listChanged": true},
            "resources": {},
            "prompts": {},
            "logging": {},
        },
    })
}

fn tools_list(ctx: &BrokerContext) -> Value {
    let tools: Vec<Value> = ctx
        .registry
        .list()
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "inputSchema": tool.input_schema,
            })
        })
        .collect();
    json!({"tools": tools})
}

async fn handle_tools_call(
    ctx: Arc<BrokerContext>,
    session: McpSession,
    request: RpcRequest,
) -> Response {
    let Some(name) = request.param_str("name") else {
        return rpc_response(
            session.id,
            rpc::error_response(
                request.id.as_ref(),
                rpc::INVALID_PARAMS,
                "missing tool name",
            ),
        );
    };
    let args: Map<String, Value> = request
        .params
        .get("arguments")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let Some(tool) = ctx.registry.find(name) else {
        return rpc_response(
            session.id,
            rpc::error_response(
                request.id.as_ref(),
                rpc::INVALID_PARAMS,
                format!("unknown tool {name:?}"),
            ),
        );
    };

    if let Err(message) = validate_arguments(&tool.input_schema, &args) {
        return rpc_response(
            session.id,
            rpc::error_response(request.id.as_ref(), rpc::INVALID_PARAMS, message),
        );
    }

    // Gate-backed calls stream; in gate-attached mode that is the eval
    // tool and every namespaced session tool.
    let streaming = ctx.manager.gate_attached()
        && (tool.name == EVAL_TOOL_NAME || matches!(tool.kind, ToolKind::Session { .. }));
    if streaming {
        return sse::stream_tool_call(ctx, session.id, request.id.clone(), tool, args).await;
    }

    let body = match &tool.kind {
        ToolKind::Builtin(builtin) => match builtin.call(&ctx, args).await {
            Ok(result) => rpc::response(request.id.as_ref(), result),
            Err(message) => rpc::response(
                request.id.as_ref(),
                json!({
                    "content": [{"type": "text", "text": message}],
                    "isError": true,
                }),
            ),
        },
        ToolKind::Session {
            session_id,
            remote_name,
            ..
        } => match ctx.manager.find_by_session(*session_id) {
            Some(connection) => {
                let outcome = connection
                    .call_session_tool_async(
                        remote_name,
                        args,
                        ctx.config.async_deadline,
                        None,
                    )
                    .await;
                rpc::response(request.id.as_ref(), tool_outcome_value(&outcome))
            }
            None => rpc::error_response(
                request.id.as_ref(),
                rpc::INTERNAL_ERROR,
                "the owning gate session is gone",
            ),
        },
    };
    rpc_response(session.id, body)
}

/// Check an argument map against a tool's input schema: every required
/// property present, no unknown properties. The message names the valid
/// keys so the caller can repair the call.
fn validate_arguments(schema: &Value, args: &Map<String, Value>) -> Result<(), String> {
    let empty = Map::new();
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|name| !args.contains_key(*name))
        .collect();
    let unknown: Vec<&String> = args.keys().filter(|k| !properties.contains_key(*k)).collect();

    if missing.is_empty() && unknown.is_empty() {
        return Ok(());
    }
    let valid: Vec<&String> = properties.keys().collect();
    let mut parts = Vec::new();
    if !missing.is_empty() {
        parts.push(format!("missing required parameters {missing:?}"));
    }
    if !unknown.is_empty() {
        parts.push(format!("unknown parameters {unknown:?}"));
    }
    Err(format!(
        "{}; valid parameters are {valid:?}",
        parts.join("; ")
    ))
}

fn resources_list(ctx: &BrokerContext) -> Value {
    let resources: Vec<Value> = ctx
        .manager
        .connections()
        .iter()
        .map(|connection| {
            json!({
                "uri": format!("repl://{}", connection.short_key()),
                "name": connection.display_name(),
                "description": format!(
                    "Interpreter session {} ({})",
                    connection.friendly_name(),
                    connection.project_path(),
                ),
                "mimeType": "application/json",
            })
        })
        .collect();
    json!({"resources": resources})
}

fn resources_read(ctx: &BrokerContext, request: &RpcRequest) -> Result<Value, String> {
    let uri = request.param_str("uri").ok_or("missing resource uri")?;
    let key = uri
        .strip_prefix("repl://")
        .ok_or_else(|| format!("unsupported resource uri {uri:?}"))?;
    let connection = ctx
        .manager
        .find(key)
        .ok_or_else(|| format!("no session matches {uri:?}"))?;
    let text = serde_json::to_string_pretty(&session_summary(&connection))
        .map_err(|e| e.to_string())?;
    Ok(json!({
        "contents": [{
            "uri": uri,
            "mimeType": "application/json",
            "text": text,
        }],
    }))
}

fn session_info(ctx: &BrokerContext) -> Value {
    let gates: Vec<Value> = ctx
        .manager
        .connections()
        .iter()
        .map(|c| session_summary(c))
        .collect();
    json!({
        "uptime_secs": ctx.started_at.elapsed().as_secs(),
        "gates": gates,
        "mcp_sessions": ctx.sessions.count(),
        "log_level": ctx.log_level.lock().clone(),
    })
}

/// Editor response endpoint: admits either a normally-authorized request
/// or one carrying a single-use nonce issued for a prior request.
async fn handle_editor_response(
    State(ctx): State<Arc<BrokerContext>>,
    request: Request,
) -> Response {
    let peer = peer_ip(&request);
    let (headers, body) = read_body(request).await;
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let nonce_request = payload
        .get("nonce")
        .and_then(Value::as_str)
        .and_then(|nonce| ctx.nonces.consume(nonce));

    if nonce_request.is_none() {
        if let Err(denied) = admission(&ctx, &headers, peer) {
            return denied;
        }
    }

    Json(json!({
        "status": "accepted",
        "request_id": nonce_request,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {"type": "string"},
                "session": {"type": "string"},
            },
            "required": ["code"],
        })
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_validate_accepts_exact_and_optional() {
        assert!(validate_arguments(&schema(), &args(json!({"code": "1"}))).is_ok());
        assert!(
            validate_arguments(&schema(), &args(json!({"code": "1", "session": "a"}))).is_ok()
        );
    }

    #[test]
    fn test_validate_reports_missing_and_unknown() {
        let err = validate_arguments(&schema(), &args(json!({"bogus": 1}))).unwrap_err();
        assert!(err.contains("missing required parameters"));
        assert!(err.contains("code"));
        assert!(err.contains("unknown parameters"));
        assert!(err.contains("bogus"));
        assert!(err.contains("valid parameters"));
        assert!(err.contains("session"));
    }

    #[test]
    fn test_initialize_result_shape() {
        let result = initialize_result();
        assert_eq!(result["serverInfo"]["name"], json!("repl-gateway"));
        assert_eq!(result["capabilities"]["tools"]["listChanged"], json!(true));
    }
}
