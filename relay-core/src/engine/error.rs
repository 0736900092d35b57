//! Error kinds the interception engine distinguishes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The bytes on the wire are not the protocol this parser implements.
    /// Silent before `identified()`, a protocol violation after.
    #[error("protocol mismatch")]
    Mismatch,

    /// The protocol was identified but the peer then broke its rules.
    #[error("protocol violation: {0}")]
    Violation(String),

    /// A wrapper or buffer crossed the 10 KiB window. Fatal for the
    /// connection, which is closed with a reset.
    #[error("shadow buffer overflow")]
    BufferOverflow,

    /// Socket failure; treated like EOF on the affected direction.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// The direction a read was waiting on reached end of stream.
    #[error("end of stream")]
    Eof,

    /// The interceptor was cancelled at an await point.
    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn violation(msg: impl Into<String>) -> Self {
        EngineError::Violation(msg.into())
    }

    /// Errors that unwind a parser without being worth a log line.
    pub fn is_silent(&self) -> bool {
        matches!(self, EngineError::Cancelled | EngineError::Eof)
    }
}
