use thiserror::Error;

/// Error taxonomy for the relay core.
///
/// Persistence failures abort a send before publish or relay; bus failures
/// are logged and degrade cross-instance visibility only; history failures
/// never undo a join.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("message store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("broadcast bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("history unavailable: {0}")]
    HistoryUnavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::BusUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
