use crate::types::{DataType, Rank};

pub type Result<T> = std::result::Result<T, StrataError>;

#[derive(Debug, thiserror::Error)]
pub enum StrataError {
    #[error("peer {rank} disconnected unexpectedly")]
    PeerDisconnected { rank: Rank },

    #[error("message decode failed: {0}")]
    DecodeFailed(String),

    #[error("unsupported data type: {dtype:?} for operation {op}")]
    UnsupportedDType { dtype: DataType, op: &'static str },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("invalid rank {rank}: communicator size is {size}")]
    InvalidRank { rank: Rank, size: u32 },

    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("device adapter error: {message}")]
    DeviceError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{operation} failed at rank {rank}: {reason}")]
    CollectiveFailed {
        operation: &'static str,
        rank: Rank,
        reason: String,
    },

    #[error("out of resources: {0}")]
    OutOfResources(String),

    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("single-copy mapping failed: {0}")]
    Mapping(String),

    #[error("communicator split failed: {0}")]
    Split(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl StrataError {
    /// Transport failure without an underlying cause.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            source: None,
        }
    }

    /// Transport failure wrapping its cause.
    pub fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Device copy failure without an underlying cause.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::DeviceError {
            message: msg.into(),
            source: None,
        }
    }

    /// Wrap an error raised inside a collective phase, keeping the peer it
    /// concerns. Already-wrapped errors pass through untouched.
    pub(crate) fn in_collective(self, operation: &'static str, rank: Rank) -> Self {
        match self {
            e @ Self::CollectiveFailed { .. } => e,
            e => Self::CollectiveFailed {
                operation,
                rank,
                reason: e.to_string(),
            },
        }
    }
}
