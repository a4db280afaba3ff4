use thiserror::Error;

/// Errors surfaced at the core boundary.
#[derive(Error, Debug)]
pub enum Error {
    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {0} already exists")]
    Duplicate(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid pair: {0}")]
    InvalidPair(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
