//! Consensus errors

use thiserror::Error;

/// Errors raised while admitting or executing a message.
///
/// Recoverable errors mean "try again later" and cause the message to be
/// stalled. Everything else rejects the message for good.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("no process list at height {0}")]
    NoProcessList(u32),

    #[error("end of minute already in progress")]
    EomInProgress,

    #[error("message has no leader execution")]
    NotLeaderExecutable,

    #[error("lane {0} is out of range")]
    LaneOutOfRange(usize),

    #[error("data type {0} is not supported")]
    UnsupportedDataType(u8),

    #[error("malformed data response: {0}")]
    MalformedData(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("storage error: {0}")]
    Storage(String),
}

impl ConsensusError {
    /// Whether the message should be stalled and retried
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConsensusError::NoProcessList(_) | ConsensusError::EomInProgress
        )
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
