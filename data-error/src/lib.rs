use thiserror::Error;

pub type Result<T> = std::result::Result<T, LeaseError>;

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage-level failure, carrying the leaser label and a message.
    #[error("Storage error: {0} {1}")]
    Storage(String, String),

    /// The requested allocation can never be satisfied by the budget.
    #[error("Out of capacity: requested {requested} bytes, limit is {limit}")]
    OutOfCapacity { requested: u64, limit: u64 },

    /// The content supplier could not produce its stream.
    #[error("Supplier error: {0}")]
    Supplier(String),

    /// The content supplier produced the wrong number of bytes.
    #[error("Content length mismatch: expected {expected} bytes, got {actual}")]
    ContentLengthMismatch { expected: u64, actual: u64 },

    /// A read/write lease could not be downgraded to a read lease.
    #[error("Downgrade error: {0}")]
    Downgrade(String),

    /// The lease was revoked, either explicitly or by eviction,
    /// and can no longer serve operations.
    #[error("Lease revoked")]
    Revoked,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
