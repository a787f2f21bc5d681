//! Coordinator entry point - thin wiring around the library.
//!
//! Object discovery and DDL generation happen upstream; `backup` consumes an
//! already-enumerated table manifest and runs the data phase, `restore`
//! replays recorded metadata statements and data entries from a finished
//! backup set.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use backup_coordinator::config::Config;
use backup_coordinator::data::{self, DataMoverOptions};
use backup_coordinator::db::ConnectionPool;
use backup_coordinator::models::TableManifest;
use backup_coordinator::paths::{self, BackupPaths};
use backup_coordinator::toc::statements::{remove_active_role, substitute_redirect_database};
use backup_coordinator::toc::{Section, Toc};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up table data for the relations listed in a table manifest
    Backup {
        /// YAML manifest of relations and their definitions
        #[arg(long, value_name = "FILE")]
        table_manifest: PathBuf,
    },
    /// Restore metadata statements and table data from a backup set
    Restore {
        /// Timestamp of the backup set to restore
        #[arg(long)]
        timestamp: String,

        /// Restore into this database instead of the backed-up one
        #[arg(long)]
        redirect_db: Option<String>,

        /// Role held by the restoring session; its CREATE ROLE is skipped
        #[arg(long)]
        active_user: Option<String>,

        /// Restore only these schemas
        #[arg(long = "include-schema")]
        include_schemas: Vec<String>,

        /// Skip these schemas
        #[arg(long = "exclude-schema")]
        exclude_schemas: Vec<String>,

        /// Restore only these fully-qualified tables
        #[arg(long = "include-table")]
        include_tables: Vec<String>,

        /// Skip these fully-qualified tables
        #[arg(long = "exclude-table")]
        exclude_tables: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received interrupt, draining workers");
            signal_cancel.cancel();
        }
    });

    let result = match args.command {
        Command::Backup { table_manifest } => run_backup(&config, &table_manifest, &cancel).await,
        Command::Restore {
            timestamp,
            redirect_db,
            active_user,
            include_schemas,
            exclude_schemas,
            include_tables,
            exclude_tables,
        } => {
            run_restore(
                &config,
                &timestamp,
                redirect_db.as_deref(),
                active_user.as_deref(),
                &include_schemas,
                &exclude_schemas,
                &include_tables,
                &exclude_tables,
                &cancel,
            )
            .await
        }
    };

    if let Err(e) = &result {
        error!("{e:#}");
    }
    result
}

/// Watch for agent error sentinels while a single-file data phase runs; a
/// deposited sentinel means a helper died and every still-pending COPY
/// against its pipes would block or fail, so the run is cancelled early.
fn spawn_sentinel_poller(
    config: &Config,
    paths: &BackupPaths,
    cancel: &CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    if !config.backup.single_data_file || config.segments.is_empty() {
        return None;
    }
    let sentinels: Vec<_> = config
        .segments
        .iter()
        .map(|seg| paths.segment_error_sentinel(&seg.data_dir, seg.content))
        .collect();
    let cancel = cancel.clone();
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
            }
            if let Some(sentinel) = paths::find_error_sentinel(&sentinels) {
                error!(
                    "{}",
                    backup_coordinator::CoordinatorError::AgentFailed(
                        sentinel.display().to_string()
                    )
                );
                cancel.cancel();
                break;
            }
        }
    }))
}

async fn run_backup(
    config: &Config,
    table_manifest: &PathBuf,
    cancel: &CancellationToken,
) -> Result<()> {
    let manifest =
        TableManifest::from_file(table_manifest).context("reading table manifest")?;
    let compressed = config.backup.compression_level > 0;
    let paths = BackupPaths::for_new_backup(&config.backup.directory, compressed);
    info!("Starting backup {}", paths.timestamp());
    std::fs::create_dir_all(config.backup.directory.as_path())?;

    let app_name = format!("backup_coordinator_{}", paths.timestamp());
    let pool = Arc::new(
        ConnectionPool::connect(&config.connection.conninfo, config.connection.jobs, &app_name)
            .await
            .context("connecting to the coordinator node")?,
    );

    let mut toc = Toc::new();
    let opts = DataMoverOptions {
        single_data_file: config.backup.single_data_file,
        compression_program: config.compression_program(),
    };

    if data::check_tables_contain_data(&manifest.tables, &manifest.definitions) {
        let oids: Vec<u32> = manifest
            .tables
            .iter()
            .filter(|t| {
                !manifest
                    .definitions
                    .get(&t.oid)
                    .map_or(false, |d| d.is_external)
            })
            .map(|t| t.oid)
            .collect();
        paths::write_oid_list(&paths.oid_list_path(), &oids)?;

        let poller = spawn_sentinel_poller(config, &paths, cancel);
        let move_result = data::backup_data_for_all_tables(
            Arc::clone(&pool),
            &manifest.tables,
            &manifest.definitions,
            &paths,
            &opts,
            cancel,
        )
        .await;
        if let Some(poller) = poller {
            poller.abort();
        }
        let rows_copied_maps = match move_result {
            Ok(maps) => maps,
            Err(e) => {
                if cancel.is_cancelled() {
                    // Workers only stop at task boundaries; COPYs already in
                    // flight must be killed on the fleet to unblock them.
                    if let Err(term_err) = pool.terminate_hanging_copy_sessions().await {
                        warn!("Failed to terminate hanging COPY sessions: {term_err}");
                    }
                }
                bail!(e);
            }
        };
        data::add_table_data_entries_to_toc(
            &mut toc,
            &manifest.tables,
            &manifest.definitions,
            &rows_copied_maps,
        );
    }

    toc.write_to_file_and_make_read_only(&paths.master_toc_path())?;
    info!("Backup {} completed", paths.timestamp());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_restore(
    config: &Config,
    timestamp: &str,
    redirect_db: Option<&str>,
    active_user: Option<&str>,
    include_schemas: &[String],
    exclude_schemas: &[String],
    include_tables: &[String],
    exclude_tables: &[String],
    cancel: &CancellationToken,
) -> Result<()> {
    let compressed = config.backup.compression_level > 0;
    let paths = BackupPaths::new(&config.backup.directory, timestamp, compressed);
    let toc = Toc::from_file(&paths.master_toc_path())
        .with_context(|| format!("no table of contents for backup {timestamp}"))?;
    info!("Restoring backup {timestamp}");

    let app_name = format!("backup_coordinator_{timestamp}");
    let pool = Arc::new(
        ConnectionPool::connect(&config.connection.conninfo, config.connection.jobs, &app_name)
            .await
            .context("connecting to the coordinator node")?,
    );

    for section in [Section::Global, Section::Predata] {
        apply_metadata_section(&toc, section, &paths, &pool, redirect_db, active_user).await?;
    }

    let entries = toc.data_entries_matching(
        include_schemas,
        exclude_schemas,
        include_tables,
        exclude_tables,
    );
    info!("Restoring data for {} tables", entries.len());
    let opts = DataMoverOptions {
        single_data_file: config.backup.single_data_file,
        compression_program: config.compression_program(),
    };
    let poller = spawn_sentinel_poller(config, &paths, cancel);
    let restore_result =
        data::restore_data_for_all_tables(Arc::clone(&pool), &entries, &paths, &opts, cancel)
            .await;
    if let Some(poller) = poller {
        poller.abort();
    }
    if let Err(e) = restore_result {
        if cancel.is_cancelled() {
            if let Err(term_err) = pool.terminate_hanging_copy_sessions().await {
                warn!("Failed to terminate hanging COPY sessions: {term_err}");
            }
        }
        bail!(e);
    }

    apply_metadata_section(&toc, Section::Postdata, &paths, &pool, redirect_db, active_user)
        .await?;
    info!("Restore of backup {timestamp} completed");
    Ok(())
}

/// Replay one metadata section in recorded order, applying the post-filter
/// transforms before execution. A missing section file means the backup
/// carried no statements for that section.
async fn apply_metadata_section(
    toc: &Toc,
    section: Section,
    paths: &BackupPaths,
    pool: &ConnectionPool,
    redirect_db: Option<&str>,
    active_user: Option<&str>,
) -> Result<()> {
    let metadata_path = paths.metadata_file_path(section);
    if !metadata_path.is_file() {
        return Ok(());
    }
    let metadata_file = std::fs::File::open(&metadata_path)?;
    let mut statements = toc.all_sql_statements(section, &metadata_file)?;
    if let Some(new_name) = redirect_db {
        let old_name = statements
            .iter()
            .find(|s| s.object_type == "DATABASE")
            .map(|s| s.name.clone());
        if let Some(old_name) = old_name {
            statements = substitute_redirect_database(statements, &old_name, new_name);
        }
    }
    if let Some(user) = active_user {
        statements = remove_active_role(user, statements);
    }
    info!(
        "Applying {} {} statements",
        statements.len(),
        section.as_str()
    );
    for statement in &statements {
        pool.batch_execute(0, &statement.statement).await?;
    }
    Ok(())
}
