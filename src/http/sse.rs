//! SSE streaming for gate-backed tool calls.
//!
//! The response is a `text/event-stream` carrying JSON-RPC
//! `notifications/progress` events followed by exactly one JSON-RPC
//! response with the original request id. A heartbeat keeps the stream
//! audibly alive while a long evaluation produces no output.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use uuid::Uuid;

use gate_protocol::messages::StreamChannel;

use crate::broker::registry::{RegisteredTool, ToolKind};
use crate::builtins::{
    deadline_from_args, eval_result_value, resolve_connection, tool_outcome_value, EVAL_TOOL_NAME,
};
use crate::http::dispatcher::SESSION_HEADER;
use crate::http::rpc;
use crate::BrokerContext;

/// Progress messages are clipped to keep events small.
const PROGRESS_MESSAGE_LIMIT: usize = 240;

/// Heartbeat task tick.
const HEARTBEAT_TICK: Duration = Duration::from_secs(1);

/// Idle threshold after which the heartbeat speaks up.
const HEARTBEAT_IDLE: Duration = Duration::from_secs(5);

/// Run a gate-backed tool call as an SSE stream.
pub(crate) async fn stream_tool_call(
    ctx: Arc<BrokerContext>,
    mcp_session_id: Uuid,
    rpc_id: Option<Value>,
    tool: RegisteredTool,
    args: Map<String, Value>,
) -> Response {
    let (tx, rx) = mpsc::channel::<Value>(256);

    tokio::spawn(drive_tool_call(ctx, rpc_id, tool, args, tx));

    let body = Body::from_stream(ReceiverStream::new(rx).map(|event| {
        Ok::<Bytes, Infallible>(Bytes::from(format!("data: {event}\n\n")))
    }));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(SESSION_HEADER, mcp_session_id.to_string())
        .body(body)
        .unwrap_or_else(|_| {
            axum::response::IntoResponse::into_response(StatusCode::INTERNAL_SERVER_ERROR)
        })
}

async fn drive_tool_call(
    ctx: Arc<BrokerContext>,
    rpc_id: Option<Value>,
    tool: RegisteredTool,
    args: Map<String, Value>,
    tx: mpsc::Sender<Value>,
) {
    // Queued catalog notifications go out ahead of any progress.
    for method in ctx.registry.take_notifications() {
        let _ = tx.send(rpc::notification(&method, json!({}))).await;
    }

    let progress_token = Uuid::new_v4().simple().to_string();
    let progress_counter = Arc::new(AtomicU64::new(0));
    let last_event = Arc::new(Mutex::new(Instant::now()));

    let heartbeat = {
        let tx = tx.clone();
        let token = progress_token.clone();
        let counter = Arc::clone(&progress_counter);
        let last_event = Arc::clone(&last_event);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_TICK).await;
                if last_event.lock().elapsed() >= HEARTBEAT_IDLE {
                    let event = progress_event(&token, &counter, "still executing");
                    if tx.send(event).await.is_err() {
                        break;
                    }
                    *last_event.lock() = Instant::now();
                }
            }
        })
    };

    let progress = {
        let tx = tx.clone();
        let token = progress_token.clone();
        let counter = Arc::clone(&progress_counter);
        let last_event = Arc::clone(&last_event);
        move |channel: StreamChannel, text: &str| {
            let message = match channel {
                StreamChannel::Stderr => format!("stderr: {}", clip(text)),
                _ => clip(text),
            };
            let event = progress_event(&token, &counter, &message);
            // Best effort: a slow client drops progress, never blocks the
            // gate stream.
            if tx.try_send(event).is_ok() {
                *last_event.lock() = Instant::now();
            }
        }
    };

    let result = execute(&ctx, &tool, args, &progress).await;

    heartbeat.abort();
    if tx.send(rpc::response(rpc_id.as_ref(), result)).await.is_err() {
        // Client hung up mid-stream; the gate-side work already ran to its
        // natural end.
        debug!(tool = %tool.name, "SSE client went away before the final event");
    }
}

async fn execute(
    ctx: &Arc<BrokerContext>,
    tool: &RegisteredTool,
    args: Map<String, Value>,
    progress: &(dyn Fn(StreamChannel, &str) + Send + Sync),
) -> Value {
    match &tool.kind {
        // The designated eval tool bypasses its handler and drives the
        // gate-streaming entry point directly.
        ToolKind::Builtin(_) if tool.name == EVAL_TOOL_NAME => {
            let connection = match resolve_connection(ctx, &args) {
                Ok(connection) => connection,
                Err(message) => return error_result(&message),
            };
            let Some(code) = args.get("code").and_then(Value::as_str) else {
                return error_result("missing required parameter \"code\"");
            };
            let deadline = deadline_from_args(ctx, &args);
            let record = connection
                .eval_remote_async(code, None, deadline, Some(progress))
                .await;
            eval_result_value(&record)
        }
        ToolKind::Builtin(builtin) => match builtin.call(ctx, args).await {
            Ok(value) => value,
            Err(message) => error_result(&message),
        },
        ToolKind::Session {
            session_id,
            remote_name,
            ..
        } => {
            let Some(connection) = ctx.manager.find_by_session(*session_id) else {
                return error_result("the owning gate session is gone");
            };
            let deadline = deadline_from_args(ctx, &args);
            let outcome = connection
                .call_session_tool_async(remote_name, args, deadline, Some(progress))
                .await;
            tool_outcome_value(&outcome)
        }
    }
}

fn progress_event(token: &str, counter: &AtomicU64, message: &str) -> Value {
    rpc::notification(
        "notifications/progress",
        json!({
            "progressToken": token,
            "progress": counter.fetch_add(1, Ordering::Relaxed) + 1,
            "message": message,
        }),
    )
}

fn error_result(message: &str) -> Value {
    json!({
        "content": [{"type": "text", "text": message}],
        "isError": true,
    })
}

fn clip(text: &str) -> String {
    if text.len() <= PROGRESS_MESSAGE_LIMIT {
        return text.to_string();
    }
    let mut end = PROGRESS_MESSAGE_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}
