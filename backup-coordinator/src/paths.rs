//! Path layout for the artifacts of one backup set.
//!
//! Two kinds of paths exist. Paths embedded in COPY command text carry the
//! dialect's placeholder tokens (`<SEG_DATA_DIR>`, `<SEGID>`) which every
//! segment substitutes with its own data directory and content id before
//! executing the command. Concrete per-segment paths, used when launching the
//! segment agent and when polling for its error sentinel, take the segment's
//! data directory and content id explicitly.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::error::Result;
use crate::toc::Section;

/// Placeholder the dialect replaces with the segment's data directory.
pub const SEG_DATA_DIR: &str = "<SEG_DATA_DIR>";
/// Placeholder the dialect replaces with the segment's content id.
pub const SEG_ID: &str = "<SEGID>";

#[derive(Debug, Clone)]
pub struct BackupPaths {
    backup_dir: PathBuf,
    timestamp: String,
    compressed: bool,
}

impl BackupPaths {
    pub fn new(backup_dir: impl Into<PathBuf>, timestamp: impl Into<String>, compressed: bool) -> Self {
        BackupPaths {
            backup_dir: backup_dir.into(),
            timestamp: timestamp.into(),
            compressed,
        }
    }

    /// Path set for a new backup, stamped with the current local time.
    pub fn for_new_backup(backup_dir: impl Into<PathBuf>, compressed: bool) -> Self {
        let timestamp = Local::now().format("%Y%m%d%H%M%S").to_string();
        BackupPaths::new(backup_dir, timestamp, compressed)
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    fn coordinator_artifact(&self, suffix: &str) -> PathBuf {
        self.backup_dir
            .join(format!("backup_{}_{}", self.timestamp, suffix))
    }

    pub fn master_toc_path(&self) -> PathBuf {
        self.coordinator_artifact("toc.yaml")
    }

    pub fn metadata_file_path(&self, section: Section) -> PathBuf {
        self.coordinator_artifact(&format!("{}.sql", section.as_str()))
    }

    pub fn oid_list_path(&self) -> PathBuf {
        self.coordinator_artifact("oids")
    }

    fn data_suffix(&self) -> &'static str {
        if self.compressed {
            ".gz"
        } else {
            ""
        }
    }

    /// Per-table data file as it appears in multi-file COPY command text.
    pub fn table_file_for_copy(&self, oid: u32) -> String {
        format!(
            "{SEG_DATA_DIR}/backup_{SEG_ID}_{}_{oid}{}",
            self.timestamp,
            self.data_suffix()
        )
    }

    /// Pipe prefix as it appears in single-file COPY command text.
    pub fn pipe_prefix_for_copy(&self) -> String {
        format!("{SEG_DATA_DIR}/backup_{SEG_ID}_{}_pipe", self.timestamp)
    }

    /// Per-oid pipe path as it appears in single-file COPY command text.
    pub fn pipe_for_copy(&self, oid: u32) -> String {
        format!("{}_{oid}", self.pipe_prefix_for_copy())
    }

    /// Concrete single data file for one segment.
    pub fn segment_data_file(&self, seg_dir: &Path, content: i32) -> PathBuf {
        seg_dir.join(format!(
            "backup_{content}_{}{}",
            self.timestamp,
            self.data_suffix()
        ))
    }

    /// Concrete segment TOC for one segment.
    pub fn segment_toc_file(&self, seg_dir: &Path, content: i32) -> PathBuf {
        seg_dir.join(format!("backup_{content}_{}_toc.yaml", self.timestamp))
    }

    /// Concrete pipe prefix for one segment, matching `pipe_prefix_for_copy`
    /// after the dialect substitutes its placeholders.
    pub fn segment_pipe_prefix(&self, seg_dir: &Path, content: i32) -> PathBuf {
        seg_dir.join(format!("backup_{content}_{}_pipe", self.timestamp))
    }

    /// The error sentinel the segment agent deposits on failure.
    pub fn segment_error_sentinel(&self, seg_dir: &Path, content: i32) -> PathBuf {
        let mut prefix = self.segment_pipe_prefix(seg_dir, content).into_os_string();
        prefix.push("_error");
        PathBuf::from(prefix)
    }

    /// Hint appended to COPY failures in single-file mode; the root cause of
    /// a pipe failure is only visible in the agent's log on the segment host.
    pub fn helper_log_hint() -> String {
        " Check $HOME/gpAdminLogs/segment_agent_* on the affected segment host for more information."
            .to_string()
    }
}

/// Write the oid list consumed by the segment agent: one decimal oid per
/// line, in the coordinator's iteration order.
pub fn write_oid_list(path: &Path, oids: &[u32]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    for oid in oids {
        writeln!(file, "{oid}")?;
    }
    Ok(())
}

/// Coordinator-side poll for agent failure: returns the first sentinel that
/// exists, if any.
pub fn find_error_sentinel(sentinels: &[PathBuf]) -> Option<PathBuf> {
    sentinels.iter().find(|p| p.is_file()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn paths(compressed: bool) -> BackupPaths {
        BackupPaths::new("/backups", "20260801120000", compressed)
    }

    #[test]
    fn copy_command_paths_carry_segment_placeholders() {
        let p = paths(false);
        assert_eq!(
            p.table_file_for_copy(16384),
            "<SEG_DATA_DIR>/backup_<SEGID>_20260801120000_16384"
        );
        assert_eq!(
            p.pipe_for_copy(7),
            "<SEG_DATA_DIR>/backup_<SEGID>_20260801120000_pipe_7"
        );
    }

    #[test]
    fn compressed_runs_add_gz_suffix_to_data_files_only() {
        let p = paths(true);
        assert!(p.table_file_for_copy(1).ends_with(".gz"));
        assert!(p
            .segment_data_file(Path::new("/seg0"), 0)
            .to_string_lossy()
            .ends_with(".gz"));
        assert!(!p.pipe_for_copy(1).ends_with(".gz"));
        assert!(!p
            .segment_toc_file(Path::new("/seg0"), 0)
            .to_string_lossy()
            .ends_with(".gz"));
    }

    #[test]
    fn segment_paths_match_copy_command_shape() {
        let p = paths(false);
        let concrete = p.segment_pipe_prefix(Path::new("/data/seg1"), 1);
        let templated = p
            .pipe_prefix_for_copy()
            .replace(SEG_DATA_DIR, "/data/seg1")
            .replace(SEG_ID, "1");
        assert_eq!(concrete.to_string_lossy(), templated);
    }

    #[test]
    fn error_sentinel_is_pipe_prefix_plus_error() {
        let p = paths(false);
        let sentinel = p.segment_error_sentinel(Path::new("/data/seg1"), 1);
        assert_eq!(
            sentinel.to_string_lossy(),
            "/data/seg1/backup_1_20260801120000_pipe_error"
        );
    }

    #[test]
    fn oid_list_is_one_decimal_per_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("oids");
        write_oid_list(&path, &[1, 2, 3]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1\n2\n3\n");
    }

    #[test]
    fn find_error_sentinel_spots_deposited_files() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("pipe_a_error");
        let present = dir.path().join("pipe_b_error");
        fs::write(&present, "").unwrap();
        assert_eq!(find_error_sentinel(&[missing.clone()]), None);
        assert_eq!(
            find_error_sentinel(&[missing, present.clone()]),
            Some(present)
        );
    }
}
