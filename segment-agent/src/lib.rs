//! Segment Agent Library
//!
//! Per-segment helper for cluster backup and restore. In backup mode it
//! multiplexes many logical table streams, delivered over named pipes, into
//! one physical data file and records each stream's byte range in the segment
//! table of contents. In restore mode it replays recorded byte ranges back
//! onto per-oid pipes for the database to consume.

pub mod backup;
pub mod error;
pub mod logger;
pub mod pipes;
pub mod plugin;
pub mod restore;

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::error;

pub use error::{AgentError, Result};
use pipes::PipeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    Backup,
    Restore,
}

/// Everything one agent invocation needs, mirroring the CLI flag surface.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub toc_file: PathBuf,
    pub oid_file: PathBuf,
    pub pipe_file: PathBuf,
    pub data_file: PathBuf,
    pub content: i32,
    pub mode: AgentMode,
    /// Gzip level 0..=9; 0 disables compression.
    pub compression_level: u32,
    pub plugin_config: Option<PathBuf>,
}

/// Run the agent to completion or interruption.
///
/// Failure contract: on any error, including cancellation, the error sentinel
/// is deposited at `<pipe-file>_error` and every pipe this run created is
/// removed, so the coordinator's COPY commands fail fast instead of blocking
/// on an abandoned pipe.
pub async fn run(opts: AgentOptions, cancel: CancellationToken) -> Result<()> {
    let pipes = PipeSet::new(&opts.pipe_file);
    let work = async {
        match opts.mode {
            AgentMode::Backup => backup::run_backup_agent(&opts, &pipes).await,
            AgentMode::Restore => restore::run_restore_agent(&opts, &pipes).await,
        }
    };
    let result = tokio::select! {
        res = work => res,
        _ = cancel.cancelled() => Err(AgentError::Interrupted),
    };
    if let Err(e) = &result {
        error!("Agent on segment {} failed: {e}", opts.content);
        pipes.deposit_error_sentinel();
        pipes.cleanup();
    }
    result
}

/// Read the ordered oid list: one decimal oid per line, coordinator order.
pub(crate) async fn read_oid_list(path: &Path) -> Result<Vec<u32>> {
    let contents = tokio::fs::read_to_string(path).await?;
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<u32>()
                .map_err(|_| AgentError::InvalidOid(line.to_string()))
        })
        .collect()
}
