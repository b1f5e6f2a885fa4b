use thiserror::Error;

/// Error kinds shared by every core component (spec §7).
///
/// `Outdated` is recovered internally by the CAS retry loops in
/// [`crate::registry`] and should never escape to a caller; it is kept as a
/// variant anyway because the KV client surface needs to name it, and a
/// retry loop that forgets to handle it will fail loudly instead of being
/// silently swallowed.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not connected")]
    NotConnected,

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("compare-and-swap outdated")]
    Outdated,

    #[error("no slot available")]
    Exhausted,

    #[error("os operation failed: {0}")]
    OsError(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
