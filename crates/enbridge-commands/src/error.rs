//! Error types for the confirmation tracker.

/// Error returned by a confirmation or timeout callback.
///
/// The tracker never propagates these; they are logged and the scan moves on.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("Callback failed: {0}")]
    Failed(String),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CallbackError {
    /// Create a failure with a plain message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Tracker configuration error types.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Check interval must be greater than zero")]
    ZeroInterval,

    #[error("Default timeout must be a finite, non-negative number of seconds (got {0})")]
    InvalidTimeout(f64),

    #[error("Event capacity must be greater than zero")]
    ZeroEventCapacity,
}

/// Device state store error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
