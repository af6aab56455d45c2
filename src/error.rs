//! Broker error types.

use std::time::Duration;

use thiserror::Error;

use gate_protocol::ipc::RequestError;
use gate_protocol::wire::WireError;

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("no gate session matches {0:?}")]
    UnknownSession(String),

    #[error("gate session {0} is not connected")]
    NotConnected(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("no terminal event within {0:?}")]
    Deadline(Duration),

    #[error("unexpected reply from gate: {0}")]
    UnexpectedReply(String),

    #[error("gate error: {0}")]
    Gate(String),

    #[error("restart is not permitted for session {0}")]
    RestartNotAllowed(String),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
