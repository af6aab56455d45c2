//! HTTP front: JSON-RPC dispatcher, SSE streaming, MCP session store.

pub mod dispatcher;
pub mod rpc;
pub mod session;
pub mod sse;

pub use dispatcher::{router, SESSION_HEADER};
pub use session::{McpSession, McpSessionState, SessionStore};
