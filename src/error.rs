use std::fmt;

use crate::client::ClientId;

/// The crate-wide error taxonomy.
///
/// Every variant maps to the handling policy from the design doc: connection-scoped
/// errors close only that connection, configuration errors are fatal before `run`
/// returns, and `Backpressured`/`UnknownClient` are returned to the caller rather
/// than logged-and-dropped.
#[derive(thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("malformed HTTP or WebSocket frame: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("WebSocket handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("write buffer for client {0:?} is full")]
    Backpressured(ClientId),

    #[error("client {0:?} is not connected")]
    UnknownClient(ClientId),

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooBig { size: usize, limit: usize },

    #[error("connection timed out: {0}")]
    Timeout(#[from] TimeoutKind),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("reserved bits must be zero")]
    ReservedBitsSet,
    #[error("control frames must not be fragmented")]
    FragmentedControlFrame,
    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,
    #[error("frame payload of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("client frames must be masked")]
    UnmaskedClientFrame,
    #[error("received a data frame while a fragmented message was in progress")]
    UnexpectedDataFrame,
    #[error("received a continuation frame with no message in progress")]
    UnexpectedContinuation,
    #[error("malformed HTTP request: {0}")]
    MalformedHttp(String),
    #[error("malformed JSON envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),
}

impl ProtocolError {
    /// The WebSocket close code this protocol error should be reported with.
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::ReservedBitsSet
            | ProtocolError::FragmentedControlFrame
            | ProtocolError::ControlFrameTooLarge
            | ProtocolError::UnmaskedClientFrame
            | ProtocolError::UnexpectedDataFrame
            | ProtocolError::UnexpectedContinuation => 1002,
            ProtocolError::MalformedHttp(_) | ProtocolError::MalformedEnvelope(_) => 1002,
            ProtocolError::FrameTooLarge { .. } => 1009,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutKind {
    #[error("idle timeout elapsed")]
    Idle,
    #[error("no pong received within the ping timeout")]
    Ping,
}

impl TimeoutKind {
    pub fn close_code(self) -> u16 {
        match self {
            TimeoutKind::Idle => 1000,
            TimeoutKind::Ping => 1001,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
