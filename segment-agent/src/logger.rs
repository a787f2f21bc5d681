//! Logging configuration using tracing.
//!
//! Events go to stderr and, when a home directory is available, to a daily
//! file under `$HOME/gpAdminLogs/`. The file log is what the coordinator's
//! COPY-failure hint points operators at, since pipe and plugin failures are
//! only visible on the segment host.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with the specified level.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = open_admin_log().map(|file| {
        tracing_subscriber::fmt::layer()
            .with_writer(Arc::new(file))
            .with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(())
}

fn admin_log_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    let dir = PathBuf::from(home).join("gpAdminLogs");
    fs::create_dir_all(&dir).ok()?;
    let name = format!(
        "segment_agent_{}.log",
        chrono::Local::now().format("%Y%m%d")
    );
    Some(dir.join(name))
}

fn open_admin_log() -> Option<fs::File> {
    let path = admin_log_path()?;
    OpenOptions::new().create(true).append(true).open(path).ok()
}
