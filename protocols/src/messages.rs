//! Message set for the request/reply and publish channels.
//!
//! Requests travel broker → gate on the request socket; each one gets
//! exactly one reply. Streaming output and terminal events for asynchronous
//! operations travel gate → broker on the publish socket as
//! [`StreamMessage`] frames.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_json::Value;

use crate::tools::ToolDescriptor;

/// Requests issued by the broker on the request socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateRequest {
    Ping,
    Eval {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_code: Option<String>,
    },
    EvalAsync {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_code: Option<String>,
        request_id: String,
    },
    SetOption {
        key: String,
        value: Value,
    },
    GetOptions,
    SetTty {
        path: String,
    },
    RestoreTty,
    ToolCall {
        name: String,
        arguments: serde_json::Map<String, Value>,
    },
    ToolCallAsync {
        name: String,
        arguments: serde_json::Map<String, Value>,
        request_id: String,
    },
    ListTools,
    Shutdown,
    Restart,
}

/// Replies sent by the gate on the request socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateReply {
    Pong(PongInfo),
    EvalResult(EvalRecord),
    Accepted {
        request_id: String,
    },
    /// Acknowledges `shutdown` and `restart`.
    Ok,
    OptionSet {
        key: String,
        value: Value,
    },
    Options(GateOptions),
    TtyInstalled {
        tty_path: String,
        rows: u16,
        cols: u16,
    },
    ToolResult {
        value: Value,
    },
    Tools {
        tools: Vec<ToolDescriptor>,
    },
    Error {
        message: String,
    },
}

/// Everything a gate reports about itself in a `pong`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongInfo {
    pub pid: i32,
    pub uptime_secs: f64,
    pub interpreter_version: String,
    pub project_path: String,
    pub tools: Vec<ToolDescriptor>,
    pub namespace: String,
    pub allow_restart: bool,
    pub allow_mirror: bool,
    pub mirror_repl: bool,
}

/// Gate-side runtime options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GateOptions {
    pub mirror_repl: bool,
    pub allow_mirror: bool,
}

/// Result record of one evaluation, synchronous or asynchronous.
///
/// A user-code exception is data, not a transport error: it lands in
/// `exception`/`backtrace` and the record is otherwise well-formed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalRecord {
    pub stdout: String,
    pub stderr: String,
    pub value_repr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
    /// Streamed chunks the broker had to drop because the caller's inbox
    /// was full. Always zero as produced by the gate; the broker fills it
    /// in before handing the record to the caller.
    #[serde(default)]
    pub dropped_chunks: u64,
}

impl EvalRecord {
    /// Error-shaped record for transport-level failures, so callers always
    /// see one result shape.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            exception: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn is_failure(&self) -> bool {
        self.exception.is_some()
    }
}

/// Terminal record of one session-tool call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolOutcome {
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub dropped_chunks: u64,
}

impl ToolOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Channel of a publish-socket frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamChannel {
    Stdout,
    Stderr,
    EvalComplete,
    EvalError,
    ToolComplete,
    ToolError,
    ToolProgress,
    FilesChanged,
}

impl StreamChannel {
    /// Channels that carry a request id and are routed to a single inbox.
    pub fn is_tagged(self) -> bool {
        matches!(
            self,
            Self::EvalComplete
                | Self::EvalError
                | Self::ToolComplete
                | Self::ToolError
                | Self::ToolProgress
        )
    }

    /// Channels that end an asynchronous operation.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::EvalComplete | Self::EvalError | Self::ToolComplete | Self::ToolError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::EvalComplete => "eval_complete",
            Self::EvalError => "eval_error",
            Self::ToolComplete => "tool_complete",
            Self::ToolError => "tool_error",
            Self::ToolProgress => "tool_progress",
            Self::FilesChanged => "files_changed",
        }
    }
}

/// One frame on the publish channel.
///
/// `stdout`/`stderr` frames are untagged broadcasts. Tagged frames carry the
/// originating request id; terminal frames additionally carry the encoded
/// result record in the dedicated binary field rather than smuggling it
/// through the text payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessage {
    pub channel: StreamChannel,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ByteBuf>,
}

impl StreamMessage {
    /// Untagged broadcast output line.
    pub fn output(channel: StreamChannel, line: impl Into<String>) -> Self {
        Self {
            channel,
            payload: line.into(),
            request_id: None,
            result: None,
        }
    }

    /// Tagged progress text for a session-tool call.
    pub fn progress(request_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel: StreamChannel::ToolProgress,
            payload: text.into(),
            request_id: Some(request_id.into()),
            result: None,
        }
    }

    /// Tagged terminal event carrying an encoded result record.
    pub fn terminal(
        channel: StreamChannel,
        request_id: impl Into<String>,
        result: Vec<u8>,
    ) -> Self {
        Self {
            channel,
            payload: String::new(),
            request_id: Some(request_id.into()),
            result: Some(ByteBuf::from(result)),
        }
    }
}
