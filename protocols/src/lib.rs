//! Shared protocol layer for the repl-gateway broker and its gates.
//!
//! A *gate* is the small endpoint embedded in an interpreter process. It
//! binds a request/reply socket and a publish socket, both host-local, and
//! speaks the message set defined in [`messages`]. This crate holds
//! everything both sides must agree on: the frame codec, the message and
//! tool-descriptor types, the on-disk session descriptor, and the IPC
//! transport primitives.

pub mod descriptor;
pub mod ipc;
pub mod messages;
pub mod tools;
pub mod wire;

pub use descriptor::GateDescriptor;
pub use messages::{
    EvalRecord, GateRequest, GateReply, PongInfo, StreamChannel, StreamMessage, ToolOutcome,
};
pub use tools::{StructField, ToolArg, ToolDescriptor, TypeDesc};
pub use wire::{decode, encode, WireError};
