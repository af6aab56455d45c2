//! Gate endpoint for the repl-gateway broker.
//!
//! A gate runs *inside* an interpreter process. It binds the session's
//! request and publish sockets, writes the discovery descriptor, evaluates
//! code handed to it by the broker while streaming captured output, exposes
//! session-scoped tools, and supports in-place restart of the host process.
//!
//! The interpreter itself is abstracted behind the [`Interpreter`] trait;
//! embedders hand the gate a boxed interpreter plus a [`GateConfig`] and
//! keep the returned [`GateHandle`] alive for the life of the session.

mod error;
mod eval;
mod interpreter;
mod restart;
mod server;
mod session_tools;
pub mod testing;
#[cfg(unix)]
mod tty;

pub use error::{GateError, GateResult};
pub use interpreter::{EvalStreams, EvalValue, Interpreter};
pub use restart::{restart_pending, NAMESPACE_ENV, RESTART_ENV, SESSION_ENV};
pub use server::{start, GateConfig, GateHandle, RestartMode};
pub use session_tools::{coerce_arguments, coerce_value, SessionToolBinding, ToolContext, ToolHandler};
