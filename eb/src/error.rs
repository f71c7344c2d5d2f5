//! Event bus error types

use logstore::StoreError;
use thiserror::Error;

use crate::event::CodecError;

/// Errors from broker, producer and consumer operations
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Log client is closed")]
    ChannelClosed,

    #[error("Consumer task failed: {0}")]
    Task(String),
}

/// Result alias for event bus operations
pub type BusResult<T> = Result<T, BusError>;

impl BusError {
    /// Check if the store reported that a group already exists
    pub fn is_group_exists(&self) -> bool {
        matches!(self, BusError::Store(e) if e.is_group_exists())
    }

    /// Check if the store reported a missing group
    pub fn is_no_group(&self) -> bool {
        matches!(self, BusError::Store(e) if e.is_no_group())
    }

    /// Check if this error is transient and the operation may succeed on retry
    pub fn is_retryable(&self) -> bool {
        match self {
            BusError::Store(e) => e.is_retryable(),
            BusError::Codec(_) | BusError::InvalidArgument(_) | BusError::ChannelClosed | BusError::Task(_) => false,
        }
    }
}
