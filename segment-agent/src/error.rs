//! Error types for the segment agent.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Table of contents error: {0}")]
    Toc(#[from] backup_coordinator::CoordinatorError),

    #[error("Failed to create pipe {path}: {source}")]
    Pipe {
        path: String,
        source: nix::Error,
    },

    #[error("Invalid oid list entry: {0:?}")]
    InvalidOid(String),

    #[error("Oid {0} is not in the table of contents")]
    UnknownOid(u32),

    #[error("Data file ended after {actual} of {expected} bytes for oid {oid}")]
    TruncatedData {
        oid: u32,
        expected: u64,
        actual: u64,
    },

    #[error("Plugin config error: {0}")]
    PluginConfig(#[from] serde_yaml::Error),

    #[error("Plugin {executable} failed: {stderr}")]
    Plugin {
        executable: String,
        stderr: String,
    },

    #[error("Agent was interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, AgentError>;
