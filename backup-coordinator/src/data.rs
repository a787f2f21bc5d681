//! Parallel data movement between the fleet and backup artifacts.
//!
//! A bounded task channel holds every non-external table; N workers, each
//! pinned to one pool connection, drain it and issue one streaming COPY per
//! table. Closing the channel is the only termination signal the workers see.
//! Per-connection row counts stay worker-local and are merged after the pool
//! drains, so no cross-worker synchronization exists beyond the progress
//! counter's mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::db::CopyDispatch;
use crate::error::{CoordinatorError, Result};
use crate::filter::make_fqn;
use crate::models::{ColumnDefinition, Relation, TableDefinition};
use crate::paths::BackupPaths;
use crate::toc::{MasterDataEntry, Toc};

/// Field delimiter used by every data COPY.
const TABLE_DELIMITER: char = ',';

#[derive(Debug, Clone)]
pub struct DataMoverOptions {
    /// Route every table through a per-oid pipe into one segment data file.
    pub single_data_file: bool,
    /// Segment-side filter command for multi-file compressed backups,
    /// e.g. `gzip -c -1`. Ignored in single-file mode, where the agent owns
    /// compression.
    pub compression_program: Option<String>,
}

/// Progress for the data phase. The mutex protects exactly the two fields.
pub struct ProgressCounters {
    total_regular_tables: u64,
    state: Mutex<ProgressState>,
}

struct ProgressState {
    completed: u64,
    suppress_output: bool,
}

impl ProgressCounters {
    fn new(total_regular_tables: u64) -> Self {
        ProgressCounters {
            total_regular_tables,
            state: Mutex::new(ProgressState {
                completed: 0,
                suppress_output: false,
            }),
        }
    }

    /// Claim the next table slot; returns its ordinal and whether progress
    /// output is still wanted.
    fn begin_table(&self) -> (u64, bool) {
        let mut state = self.state.lock().expect("progress mutex poisoned");
        state.completed += 1;
        (state.completed, !state.suppress_output)
    }

    fn suppress_output(&self) {
        let mut state = self.state.lock().expect("progress mutex poisoned");
        state.suppress_output = true;
    }

    pub fn completed(&self) -> u64 {
        self.state.lock().expect("progress mutex poisoned").completed
    }
}

/// Parenthesized column list for a COPY FROM, captured at backup time so a
/// restore survives column-order drift. Empty when no columns are known.
pub fn construct_table_attributes_list(column_defs: &[ColumnDefinition]) -> String {
    if column_defs.is_empty() {
        return String::new();
    }
    let names: Vec<&str> = column_defs.iter().map(|c| c.name.as_str()).collect();
    format!("({})", names.join(","))
}

/// True when at least one table owns physical rows on the segments. When
/// every listed table is external the run degrades to metadata-only and the
/// data phase is skipped entirely.
pub fn check_tables_contain_data(
    tables: &[Relation],
    table_defs: &HashMap<u32, TableDefinition>,
) -> bool {
    let has_data = tables
        .iter()
        .any(|t| !is_external(t, table_defs));
    if !has_data {
        warn!("No tables in backup set contain data. Performing metadata-only backup instead.");
    }
    has_data
}

fn is_external(table: &Relation, table_defs: &HashMap<u32, TableDefinition>) -> bool {
    table_defs
        .get(&table.oid)
        .map_or(false, |def| def.is_external)
}

fn copy_out_query(table: &Relation, backup_file: &str, opts: &DataMoverOptions) -> String {
    let destination = if opts.single_data_file {
        format!(
            "PROGRAM '(test -p \"{backup_file}\" || (echo \"Pipe not found\">&2; exit 1)) && cat - > {backup_file}'"
        )
    } else if let Some(program) = &opts.compression_program {
        format!("PROGRAM '{program} > {backup_file}'")
    } else {
        format!("'{backup_file}'")
    };
    format!(
        "COPY {} TO {destination} WITH CSV DELIMITER '{TABLE_DELIMITER}' ON SEGMENT IGNORE EXTERNAL PARTITIONS;",
        table.fqn()
    )
}

fn copy_in_query(entry: &MasterDataEntry, source: &str, single_data_file: bool) -> String {
    let origin = if single_data_file {
        // Same rendezvous guard as the backup direction: the agent creates
        // each pipe only when it reaches that oid, so the COPY must fail fast
        // rather than race a pipe that does not exist yet.
        format!(
            "PROGRAM '(test -p \"{source}\" || (echo \"Pipe not found\">&2; exit 1)) && cat {source}'"
        )
    } else {
        format!("'{source}'")
    };
    format!(
        "COPY {}{} FROM {origin} WITH CSV DELIMITER '{TABLE_DELIMITER}' ON SEGMENT;",
        make_fqn(&entry.schema, &entry.name),
        entry.attribute_string
    )
}

fn copy_error(fqn: String, err: CoordinatorError, opts: &DataMoverOptions) -> CoordinatorError {
    let hint = if opts.single_data_file {
        BackupPaths::helper_log_hint()
    } else {
        String::new()
    };
    CoordinatorError::Copy {
        table: fqn,
        message: err.to_string(),
        hint,
    }
}

async fn backup_single_table<P: CopyDispatch + ?Sized>(
    pool: &P,
    conn_num: usize,
    table: &Relation,
    paths: &BackupPaths,
    opts: &DataMoverOptions,
    counters: &ProgressCounters,
    rows_copied: &mut HashMap<u32, u64>,
) -> Result<()> {
    let (table_num, report) = counters.begin_table();
    if report {
        info!(
            "Writing data for table {} to file (table {table_num} of {})",
            table.fqn(),
            counters.total_regular_tables
        );
    }
    let backup_file = if opts.single_data_file {
        paths.pipe_for_copy(table.oid)
    } else {
        paths.table_file_for_copy(table.oid)
    };
    let query = copy_out_query(table, &backup_file, opts);
    let rows = pool
        .execute(conn_num, &query)
        .await
        .map_err(|e| copy_error(table.fqn(), e, opts))?;
    rows_copied.insert(table.oid, rows);
    Ok(())
}

/// Back up the data of every non-external table across N workers.
///
/// Returns one row-count map per connection; the maps are disjoint because
/// each table is handed to exactly one worker. Any COPY error is fatal to the
/// run; a cancellation observed at a task boundary drains the pool without
/// starting new tables and fails the run as terminated.
pub async fn backup_data_for_all_tables<P>(
    pool: Arc<P>,
    tables: &[Relation],
    table_defs: &HashMap<u32, TableDefinition>,
    paths: &BackupPaths,
    opts: &DataMoverOptions,
    cancel: &CancellationToken,
) -> Result<Vec<HashMap<u32, u64>>>
where
    P: CopyDispatch + ?Sized + 'static,
{
    let total_external = tables
        .iter()
        .filter(|t| is_external(t, table_defs))
        .count();
    let regular_tables: Vec<Relation> = tables
        .iter()
        .filter(|t| !is_external(t, table_defs))
        .cloned()
        .collect();
    let counters = Arc::new(ProgressCounters::new(regular_tables.len() as u64));

    // Sized to the task count, so submission never blocks; dropping the
    // sender closes the channel and is the workers' sole termination signal.
    let (task_tx, task_rx) = async_channel::bounded(regular_tables.len().max(1));
    for table in regular_tables {
        task_tx
            .send(table)
            .await
            .map_err(|_| CoordinatorError::Internal("task channel closed early".to_string()))?;
    }
    drop(task_tx);

    let mut workers = Vec::with_capacity(pool.num_conns());
    for conn_num in 0..pool.num_conns() {
        let pool = Arc::clone(&pool);
        let rx = task_rx.clone();
        let counters = Arc::clone(&counters);
        let cancel = cancel.clone();
        let paths = paths.clone();
        let opts = opts.clone();
        workers.push(tokio::spawn(async move {
            let mut rows_copied: HashMap<u32, u64> = HashMap::new();
            while let Ok(table) = rx.recv().await {
                if cancel.is_cancelled() {
                    counters.suppress_output();
                    break;
                }
                backup_single_table(
                    pool.as_ref(),
                    conn_num,
                    &table,
                    &paths,
                    &opts,
                    &counters,
                    &mut rows_copied,
                )
                .await?;
            }
            Ok::<_, CoordinatorError>(rows_copied)
        }));
    }
    drop(task_rx);

    let mut rows_copied_maps = Vec::with_capacity(workers.len());
    let mut first_error = None;
    for worker in workers {
        match worker.await {
            Ok(Ok(map)) => rows_copied_maps.push(map),
            Ok(Err(e)) => {
                // Stop siblings at their next task boundary; the in-flight
                // COPYs are unblocked out-of-band.
                cancel.cancel();
                rows_copied_maps.push(HashMap::new());
                first_error.get_or_insert(e);
            }
            Err(join_err) => {
                cancel.cancel();
                rows_copied_maps.push(HashMap::new());
                first_error
                    .get_or_insert(CoordinatorError::Internal(format!("worker panicked: {join_err}")));
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    if cancel.is_cancelled() {
        return Err(CoordinatorError::Terminated);
    }

    if total_external > 0 {
        let plural = if total_external > 1 { "s" } else { "" };
        info!("Skipped data backup of {total_external} external table{plural}.");
    }
    Ok(rows_copied_maps)
}

/// Merge per-connection row counts and record one master data entry per
/// non-external table. At most one connection handled any given table, so the
/// first map containing an oid owns its count.
pub fn add_table_data_entries_to_toc(
    toc: &mut Toc,
    tables: &[Relation],
    table_defs: &HashMap<u32, TableDefinition>,
    rows_copied_maps: &[HashMap<u32, u64>],
) {
    for table in tables {
        if is_external(table, table_defs) {
            continue;
        }
        let rows_copied = rows_copied_maps
            .iter()
            .find_map(|map| map.get(&table.oid))
            .copied()
            .unwrap_or(0);
        let attributes = table_defs
            .get(&table.oid)
            .map(|def| construct_table_attributes_list(&def.column_defs))
            .unwrap_or_default();
        toc.add_master_data_entry(&table.schema, &table.name, table.oid, &attributes, rows_copied);
    }
}

/// Restore the data of every matched master data entry across N workers,
/// mirroring the backup scheduling discipline.
pub async fn restore_data_for_all_tables<P>(
    pool: Arc<P>,
    entries: &[MasterDataEntry],
    paths: &BackupPaths,
    opts: &DataMoverOptions,
    cancel: &CancellationToken,
) -> Result<()>
where
    P: CopyDispatch + ?Sized + 'static,
{
    let counters = Arc::new(ProgressCounters::new(entries.len() as u64));
    let (task_tx, task_rx) = async_channel::bounded(entries.len().max(1));
    for entry in entries {
        task_tx
            .send(entry.clone())
            .await
            .map_err(|_| CoordinatorError::Internal("task channel closed early".to_string()))?;
    }
    drop(task_tx);

    let mut workers = Vec::with_capacity(pool.num_conns());
    for conn_num in 0..pool.num_conns() {
        let pool = Arc::clone(&pool);
        let rx = task_rx.clone();
        let counters = Arc::clone(&counters);
        let cancel = cancel.clone();
        let paths = paths.clone();
        let opts = opts.clone();
        workers.push(tokio::spawn(async move {
            while let Ok(entry) = rx.recv().await {
                if cancel.is_cancelled() {
                    counters.suppress_output();
                    break;
                }
                let fqn = make_fqn(&entry.schema, &entry.name);
                let (table_num, report) = counters.begin_table();
                if report {
                    info!(
                        "Reading data for table {fqn} from file (table {table_num} of {})",
                        counters.total_regular_tables
                    );
                }
                let source = if opts.single_data_file {
                    paths.pipe_for_copy(entry.oid)
                } else {
                    paths.table_file_for_copy(entry.oid)
                };
                let query = copy_in_query(&entry, &source, opts.single_data_file);
                let rows = pool
                    .execute(conn_num, &query)
                    .await
                    .map_err(|e| copy_error(fqn.clone(), e, &opts))?;
                if rows != entry.rows_copied {
                    warn!(
                        "Expected to restore {} rows to table {fqn}, but restored {rows} instead",
                        entry.rows_copied
                    );
                }
            }
            Ok::<_, CoordinatorError>(())
        }));
    }
    drop(task_rx);

    let mut first_error = None;
    for worker in workers {
        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                cancel.cancel();
                first_error.get_or_insert(e);
            }
            Err(join_err) => {
                cancel.cancel();
                first_error
                    .get_or_insert(CoordinatorError::Internal(format!("worker panicked: {join_err}")));
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    if cancel.is_cancelled() {
        return Err(CoordinatorError::Terminated);
    }
    Ok(())
}
