//! Backup mode: drain per-oid pipes into the single segment data file.

use async_compression::tokio::write::GzipEncoder;
use async_compression::Level;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, info};

use backup_coordinator::toc::SegmentToc;

use crate::pipes::PipeSet;
use crate::{plugin, read_oid_list, AgentOptions, Result};

/// Drain each oid's pipe in order into the data file, recording one byte
/// range per oid. Ranges always describe uncompressed offsets; with a
/// compression level set, the gzip filter sits between the counter and the
/// file.
pub(crate) async fn run_backup_agent(opts: &AgentOptions, pipes: &PipeSet) -> Result<()> {
    let oids = read_oid_list(&opts.oid_file).await?;
    info!(
        "Backing up {} tables on segment {} into {}",
        oids.len(),
        opts.content,
        opts.data_file.display()
    );

    let file = tokio::fs::File::create(&opts.data_file).await?;
    let mut writer: Box<dyn AsyncWrite + Unpin + Send> = if opts.compression_level > 0 {
        Box::new(GzipEncoder::with_quality(
            BufWriter::new(file),
            Level::Precise(opts.compression_level as i32),
        ))
    } else {
        Box::new(BufWriter::new(file))
    };

    let mut toc = SegmentToc::new();
    let mut start_byte: u64 = 0;
    for oid in oids {
        let pipe_path = pipes.create(oid)?;
        debug!("Waiting for writer on pipe {}", pipe_path.display());
        // Blocks until the COPY command's `cat` opens the pipe for writing.
        let mut reader = tokio::fs::File::open(&pipe_path).await?;
        let bytes = tokio::io::copy(&mut reader, &mut writer).await?;
        toc.add_data_entry(oid, start_byte, start_byte + bytes);
        start_byte += bytes;
        pipes.remove(oid)?;
        debug!("Drained {bytes} bytes for oid {oid}");
    }
    // Flushes buffered bytes and, when compressing, the gzip trailer.
    writer.shutdown().await?;

    toc.write_to_file_and_make_read_only(&opts.toc_file)?;
    info!("Wrote segment table of contents to {}", opts.toc_file.display());

    if let Some(config) = &opts.plugin_config {
        plugin::backup_file(config, &opts.data_file).await?;
        plugin::backup_file(config, &opts.toc_file).await?;
    }
    Ok(())
}
