//! Gate error types.

use thiserror::Error;

use gate_protocol::descriptor::DescriptorError;
use gate_protocol::wire::WireError;

pub type GateResult<T> = Result<T, GateError>;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("unknown option: {0}")]
    UnknownOption(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("mirroring is not permitted for this session")]
    MirrorNotAllowed,

    #[error("restart is not permitted for this session")]
    RestartNotAllowed,

    #[error("tty handoff failed: {0}")]
    Tty(String),

    #[error("tty handoff is not supported on this platform")]
    TtyUnsupported,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
