//! The shared persistent key-value store visible to every tab of an origin.

/// Errors raised by a [`SharedStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be accessed at all (blocked, disabled, private mode...).
    #[error("shared store unavailable: {0}")]
    Unavailable(String),
    /// A write was rejected because the store is full.
    #[error("shared store quota exceeded")]
    QuotaExceeded,
}

/// A synchronous string key-value store shared by all tabs, without transactions.
///
/// Implementations give no compare-and-swap; every caller must assume another tab may write
/// between its read and its write.
pub trait SharedStore: Send + Sync {
    /// Reads the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    /// Writes `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    /// Deletes `key`. Deleting a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}
