//! Error types for the coordinator.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOC serialization error: {0}")]
    Toc(#[from] serde_yaml::Error),

    #[error("Database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    #[error("Statement for {object_type} {name} at bytes {start_byte}..{end_byte} is not valid UTF-8")]
    StatementEncoding {
        object_type: String,
        name: String,
        start_byte: u64,
        end_byte: u64,
    },

    #[error("COPY failed for table {table}: {message}{hint}")]
    Copy {
        table: String,
        message: String,
        hint: String,
    },

    #[error("Segment agent failure detected: {0}")]
    AgentFailed(String),

    #[error("Backup run was terminated")]
    Terminated,

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
