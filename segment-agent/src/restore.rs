//! Restore mode: replay recorded byte ranges onto per-oid pipes.

use std::path::Path;

use async_compression::tokio::bufread::GzipDecoder;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use backup_coordinator::toc::SegmentToc;

use crate::pipes::PipeSet;
use crate::{plugin, read_oid_list, AgentError, AgentOptions, Result};

/// Serve each requested oid's bytes, in the listed order, on its own pipe.
pub(crate) async fn run_restore_agent(opts: &AgentOptions, pipes: &PipeSet) -> Result<()> {
    if let Some(config) = &opts.plugin_config {
        plugin::restore_file(config, &opts.data_file).await?;
    }
    let toc = SegmentToc::from_file(&opts.toc_file)?;
    let oids = read_oid_list(&opts.oid_file).await?;
    info!(
        "Restoring {} tables on segment {} from {}",
        oids.len(),
        opts.content,
        opts.data_file.display()
    );

    let mut source = DataSource::open(&opts.data_file).await?;
    for oid in oids {
        let entry = *toc
            .data_entries
            .get(&oid)
            .ok_or(AgentError::UnknownOid(oid))?;
        let pipe_path = pipes.create(oid)?;
        debug!("Waiting for reader on pipe {}", pipe_path.display());
        // Blocks until the COPY FROM opens the pipe for reading.
        let mut writer = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&pipe_path)
            .await?;
        source
            .stream_range(oid, entry.start_byte, entry.end_byte, &mut writer)
            .await?;
        writer.shutdown().await?;
        drop(writer);
        pipes.remove(oid)?;
        debug!(
            "Served bytes {}..{} for oid {oid}",
            entry.start_byte, entry.end_byte
        );
    }
    Ok(())
}

/// Positioned reads over the segment data file. A `.gz` data file cannot
/// seek, so ranges are reached by reading the decompressed stream forward,
/// reopening from the start if a range ever lies behind the current position.
enum DataSource {
    Plain(File),
    Gzip {
        path: std::path::PathBuf,
        reader: GzipDecoder<BufReader<File>>,
        position: u64,
    },
}

impl DataSource {
    async fn open(path: &Path) -> Result<Self> {
        let gzipped = path.extension().is_some_and(|ext| ext == "gz");
        let file = File::open(path).await?;
        if gzipped {
            Ok(DataSource::Gzip {
                path: path.to_path_buf(),
                reader: GzipDecoder::new(BufReader::new(file)),
                position: 0,
            })
        } else {
            Ok(DataSource::Plain(file))
        }
    }

    async fn stream_range<W>(&mut self, oid: u32, start: u64, end: u64, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let expected = end - start;
        match self {
            DataSource::Plain(file) => {
                file.seek(std::io::SeekFrom::Start(start)).await?;
                let copied = tokio::io::copy(&mut (&mut *file).take(expected), writer).await?;
                check_complete(oid, expected, copied)
            }
            DataSource::Gzip {
                path,
                reader,
                position,
            } => {
                if start < *position {
                    let file = File::open(&*path).await?;
                    *reader = GzipDecoder::new(BufReader::new(file));
                    *position = 0;
                }
                let skip = start - *position;
                if skip > 0 {
                    let skipped =
                        tokio::io::copy(&mut (&mut *reader).take(skip), &mut tokio::io::sink())
                            .await?;
                    if skipped < skip {
                        return Err(AgentError::TruncatedData {
                            oid,
                            expected,
                            actual: 0,
                        });
                    }
                }
                let copied = tokio::io::copy(&mut (&mut *reader).take(expected), writer).await?;
                *position = start + copied;
                check_complete(oid, expected, copied)
            }
        }
    }
}

fn check_complete(oid: u32, expected: u64, actual: u64) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(AgentError::TruncatedData {
            oid,
            expected,
            actual,
        })
    }
}
