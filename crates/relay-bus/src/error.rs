use relay_store::StoreError;

/// Faults surfaced by the delivery path.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// An event references a run id with no backing row. This is a data
    /// integrity fault in event production, never silently swallowed.
    #[error("event references unknown run {0}")]
    RunMissing(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out acquiring lock {namespace}/{key}")]
    Timeout { namespace: String, key: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}
