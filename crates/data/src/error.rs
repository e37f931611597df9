use candle_sync_core::ValidationError;
use thiserror::Error;

/// Errors from the versioned candle store and its backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid store configuration: {0}")]
    Validation(#[from] ValidationError),

    #[error("corrupt row in series {key}: {reason}")]
    CorruptRow { key: String, reason: String },
}
