//! Built-in broker tools.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use gate_protocol::messages::{EvalRecord, ToolOutcome};

use crate::broker::connection::Connection;
use crate::broker::registry::BuiltinTool;
use crate::prefs::MIRROR_DEFAULT;
use crate::BrokerContext;

/// The designated gate-evaluation tool; the SSE path dispatches it
/// directly against the connection instead of going through the handler.
pub const EVAL_TOOL_NAME: &str = "repl_eval";

pub fn builtin_tools() -> Vec<Arc<dyn BuiltinTool>> {
    vec![
        Arc::new(EvalTool),
        Arc::new(SessionsTool),
        Arc::new(RestartTool),
        Arc::new(SetOptionTool),
    ]
}

/// Resolve the gate a call targets: the `session` argument when present,
/// the single connected gate otherwise.
pub(crate) fn resolve_connection(
    broker: &BrokerContext,
    args: &Map<String, Value>,
) -> Result<Arc<Connection>, String> {
    match args.get("session").and_then(Value::as_str) {
        Some(key) => broker
            .manager
            .find(key)
            .ok_or_else(|| format!("no gate session matches {key:?}")),
        None => broker
            .manager
            .default_connection()
            .ok_or_else(|| "no gate session is connected".to_string()),
    }
}

/// Render an eval record as an MCP tool result.
pub(crate) fn eval_result_value(record: &EvalRecord) -> Value {
    let mut text = String::new();
    if !record.stdout.is_empty() {
        text.push_str(&record.stdout);
        text.push('\n');
    }
    if !record.stderr.is_empty() {
        text.push_str("stderr:\n");
        text.push_str(&record.stderr);
        text.push('\n');
    }
    match &record.exception {
        Some(exception) => {
            text.push_str("error: ");
            text.push_str(exception);
            if let Some(backtrace) = &record.backtrace {
                if !backtrace.is_empty() {
                    text.push('\n');
                    text.push_str(backtrace);
                }
            }
        }
        None => {
            text.push_str("=> ");
            text.push_str(&record.value_repr);
        }
    }
    if record.dropped_chunks > 0 {
        text.push_str(&format!(
            "\n({} streamed chunks dropped)",
            record.dropped_chunks
        ));
    }
    json!({
        "content": [{"type": "text", "text": text}],
        "isError": record.exception.is_some(),
    })
}

/// Render a session-tool outcome as an MCP tool result.
pub(crate) fn tool_outcome_value(outcome: &ToolOutcome) -> Value {
    match &outcome.error {
        Some(error) => json!({
            "content": [{"type": "text", "text": error}],
            "isError": true,
        }),
        None => {
            let text = match &outcome.value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            json!({
                "content": [{"type": "text", "text": text}],
                "isError": false,
            })
        }
    }
}

/// Identity and liveness summary of one connection.
pub(crate) fn session_summary(connection: &Connection) -> Value {
    json!({
        "session_id": connection.session_id().simple().to_string(),
        "short_key": connection.short_key(),
        "name": connection.friendly_name(),
        "display_name": connection.display_name(),
        "namespace": connection.namespace(),
        "project_path": connection.project_path(),
        "status": format!("{:?}", connection.status()).to_lowercase(),
        "last_seen": connection.last_seen().map(|t| t.to_rfc3339()),
        "tool_calls": connection.tool_call_count(),
        "tools": connection
            .catalog()
            .iter()
            .map(|t| t.name.clone())
            .collect::<Vec<_>>(),
        "allow_restart": connection.allow_restart(),
        "mirror_active": connection.mirror_active(),
    })
}

struct EvalTool;

#[async_trait]
impl BuiltinTool for EvalTool {
    fn name(&self) -> &str {
        EVAL_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Evaluate code in a connected interpreter session, streaming output as it is produced"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {"type": "string", "description": "Code to evaluate"},
                "session": {"type": "string", "description": "Target session (short key, id, or display name)"},
                "timeout_secs": {"type": "number", "description": "Deadline for the evaluation"},
            },
            "required": ["code"],
        })
    }

    async fn call(
        &self,
        broker: &BrokerContext,
        args: Map<String, Value>,
    ) -> Result<Value, String> {
        let connection = resolve_connection(broker, &args)?;
        let code = args
            .get("code")
            .and_then(Value::as_str)
            .ok_or("missing required parameter \"code\"")?;
        let deadline = deadline_from_args(broker, &args);
        let record = connection
            .eval_remote_async(code, None, deadline, None)
            .await;
        Ok(eval_result_value(&record))
    }
}

struct SessionsTool;

#[async_trait]
impl BuiltinTool for SessionsTool {
    fn name(&self) -> &str {
        "repl_sessions"
    }

    fn description(&self) -> &str {
        "List interpreter sessions known to the broker"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}, "required": []})
    }

    async fn call(
        &self,
        broker: &BrokerContext,
        _args: Map<String, Value>,
    ) -> Result<Value, String> {
        let sessions: Vec<Value> = broker
            .manager
            .connections()
            .iter()
            .map(|c| session_summary(c))
            .collect();
        let text = serde_json::to_string_pretty(&sessions).map_err(|e| e.to_string())?;
        Ok(json!({
            "content": [{"type": "text", "text": text}],
            "isError": false,
        }))
    }
}

struct RestartTool;

#[async_trait]
impl BuiltinTool for RestartTool {
    fn name(&self) -> &str {
        "repl_restart"
    }

    fn description(&self) -> &str {
        "Restart an interpreter session in place, preserving its session id"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session": {"type": "string", "description": "Target session (short key, id, or display name)"},
            },
            "required": [],
        })
    }

    async fn call(
        &self,
        broker: &BrokerContext,
        args: Map<String, Value>,
    ) -> Result<Value, String> {
        let connection = resolve_connection(broker, &args)?;
        connection.send_restart().await.map_err(|e| e.to_string())?;
        Ok(json!({
            "content": [{
                "type": "text",
                "text": format!("restart acknowledged by {}", connection.display_name()),
            }],
            "isError": false,
        }))
    }
}

struct SetOptionTool;

#[async_trait]
impl BuiltinTool for SetOptionTool {
    fn name(&self) -> &str {
        "repl_set_option"
    }

    fn description(&self) -> &str {
        "Set a runtime option on an interpreter session"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session": {"type": "string", "description": "Target session (short key, id, or display name)"},
                "key": {"type": "string", "enum": ["mirror_repl"]},
                "value": {"type": "boolean"},
            },
            "required": ["key", "value"],
        })
    }

    async fn call(
        &self,
        broker: &BrokerContext,
        args: Map<String, Value>,
    ) -> Result<Value, String> {
        let connection = resolve_connection(broker, &args)?;
        let key = args
            .get("key")
            .and_then(Value::as_str)
            .ok_or("missing required parameter \"key\"")?;
        let value = args.get("value").cloned().unwrap_or(Value::Null);
        connection
            .set_option(key, value.clone())
            .await
            .map_err(|e| e.to_string())?;
        if key == "mirror_repl" {
            if let Some(on) = value.as_bool() {
                broker.prefs.set_bool(MIRROR_DEFAULT, on);
            }
        }
        Ok(json!({
            "content": [{"type": "text", "text": format!("{key} = {value}")}],
            "isError": false,
        }))
    }
}

pub(crate) fn deadline_from_args(
    broker: &BrokerContext,
    args: &Map<String, Value>,
) -> std::time::Duration {
    args.get("timeout_secs")
        .and_then(Value::as_f64)
        .filter(|secs| *secs > 0.0)
        .map(std::time::Duration::from_secs_f64)
        .unwrap_or(broker.config.async_deadline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_result_rendering() {
        let record = EvalRecord {
            stdout: "line".to_string(),
            value_repr: "42".to_string(),
            ..EvalRecord::default()
        };
        let value = eval_result_value(&record);
        assert_eq!(value["isError"], json!(false));
        let text = value["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("line"));
        assert!(text.contains("=> 42"));
    }

    #[test]
    fn test_eval_error_rendering_mentions_drops() {
        let mut record = EvalRecord::failure("boom");
        record.dropped_chunks = 3;
        let value = eval_result_value(&record);
        assert_eq!(value["isError"], json!(true));
        let text = value["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("error: boom"));
        assert!(text.contains("3 streamed chunks dropped"));
    }

    #[test]
    fn test_tool_outcome_rendering() {
        let ok = ToolOutcome {
            value: json!({"n": 1}),
            ..ToolOutcome::default()
        };
        assert_eq!(tool_outcome_value(&ok)["isError"], json!(false));

        let err = ToolOutcome::failure("denied");
        let value = tool_outcome_value(&err);
        assert_eq!(value["isError"], json!(true));
        assert_eq!(value["content"][0]["text"], json!("denied"));
    }
}
