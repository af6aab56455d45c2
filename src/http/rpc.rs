//! JSON-RPC 2.0 envelope types.

use serde::Deserialize;
use serde_json::{json, Value};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Incoming JSON-RPC request.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    /// String parameter out of `params`.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Successful response envelope.
pub fn response(id: Option<&Value>, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.cloned().unwrap_or(Value::Null),
        "result": result,
    })
}

/// Error response envelope.
pub fn error_response(id: Option<&Value>, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.cloned().unwrap_or(Value::Null),
        "error": {
            "code": code,
            "message": message.into(),
        },
    })
}

/// Server-to-client notification envelope.
pub fn notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parses_with_defaults() {
        let request: RpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"tools/list"}"#).unwrap();
        assert_eq!(request.method, "tools/list");
        assert!(request.id.is_none());
        assert!(request.params.is_null());
    }

    #[test]
    fn test_response_echoes_id() {
        let id = json!(7);
        let body = response(Some(&id), json!({"ok": true}));
        assert_eq!(body["id"], json!(7));
        assert_eq!(body["result"]["ok"], json!(true));
    }

    #[test]
    fn test_error_response_shape() {
        let body = error_response(None, INVALID_PARAMS, "bad");
        assert_eq!(body["id"], Value::Null);
        assert_eq!(body["error"]["code"], json!(INVALID_PARAMS));
        assert_eq!(body["error"]["message"], json!("bad"));
    }
}
