//! Connection broker: discovery, per-gate connections, the connection
//! manager, and the tool registry.

pub mod connection;
pub mod discovery;
pub mod manager;
pub mod registry;

pub use connection::{ConnStatus, Connection, EvalState, ProgressFn};
pub use manager::{ChangeCallback, ConnectionManager, TaggedMessage};
pub use registry::{BuiltinTool, RegisteredTool, ToolKind, ToolRegistry};
