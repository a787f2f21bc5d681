//! Segment Agent - Main entry point
//!
//! Launched once per segment per backup or restore. The process exits 0 only
//! on full success; any failure, including an interrupt, leaves the error
//! sentinel behind and exits non-zero for the coordinator to detect.

use std::path::PathBuf;

use clap::{ArgGroup, Parser};
use segment_agent::{logger, AgentMode, AgentOptions};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(group(ArgGroup::new("mode").required(true).args(["backup_agent", "restore_agent"])))]
struct Args {
    /// Path of the segment table of contents (written in backup mode, read in
    /// restore mode)
    #[arg(long, value_name = "FILE")]
    toc_file: PathBuf,

    /// File listing one decimal oid per line, in coordinator order
    #[arg(long, value_name = "FILE")]
    oid_file: PathBuf,

    /// Prefix for per-oid named pipes and the error sentinel
    #[arg(long, value_name = "PREFIX")]
    pipe_file: PathBuf,

    /// Content id of this segment
    #[arg(long)]
    content: i32,

    /// The single segment data file; a .gz suffix implies gzip on read
    #[arg(long, value_name = "FILE")]
    data_file: PathBuf,

    /// Run as the backup agent
    #[arg(long)]
    backup_agent: bool,

    /// Run as the restore agent
    #[arg(long)]
    restore_agent: bool,

    /// Gzip level for the data file; 0 disables compression
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u32).range(0..=9))]
    compression_level: u32,

    /// Storage plugin configuration; when set, finished artifacts are handed
    /// to the plugin (backup) or fetched through it (restore)
    #[arg(long, value_name = "FILE")]
    plugin_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = logger::init(&args.log_level) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let mode = if args.backup_agent {
        AgentMode::Backup
    } else {
        AgentMode::Restore
    };
    let opts = AgentOptions {
        toc_file: args.toc_file,
        oid_file: args.oid_file,
        pipe_file: args.pipe_file,
        data_file: args.data_file,
        content: args.content,
        mode,
        compression_level: args.compression_level,
        plugin_config: args.plugin_config,
    };

    info!(
        "Starting segment-agent v{} on segment {} ({:?} mode)",
        env!("CARGO_PKG_VERSION"),
        opts.content,
        mode
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received interrupt, cleaning up");
            signal_cancel.cancel();
        }
    });

    match segment_agent::run(opts, cancel).await {
        Ok(()) => info!("Agent finished"),
        Err(e) => {
            error!("{e}");
            // A blocked pipe open in the background must not keep the
            // process alive; the sentinel is already on disk.
            std::process::exit(1);
        }
    }
}
