//! Named-pipe lifecycle for one agent run.
//!
//! Pipes live at `<prefix>_<oid>` and exist only while one oid's COPY is in
//! flight. On failure the set deposits the `<prefix>_error` sentinel the
//! coordinator polls for, and removes every pipe it created so that further
//! COPY attempts fail their `test -p` guard immediately instead of blocking.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tracing::warn;

use crate::error::{AgentError, Result};

pub struct PipeSet {
    prefix: PathBuf,
    created: Mutex<Vec<PathBuf>>,
}

impl PipeSet {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        PipeSet {
            prefix: prefix.into(),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn pipe_path(&self, oid: u32) -> PathBuf {
        PathBuf::from(format!("{}_{oid}", self.prefix.display()))
    }

    pub fn error_sentinel_path(&self) -> PathBuf {
        PathBuf::from(format!("{}_error", self.prefix.display()))
    }

    /// Create the pipe for one oid, tolerating a pipe that already exists
    /// (the coordinator may pre-create the first one).
    pub fn create(&self, oid: u32) -> Result<PathBuf> {
        let path = self.pipe_path(oid);
        match mkfifo(&path, Mode::from_bits_truncate(0o777)) {
            Ok(()) | Err(nix::Error::EEXIST) => {}
            Err(source) => {
                return Err(AgentError::Pipe {
                    path: path.display().to_string(),
                    source,
                })
            }
        }
        self.created
            .lock()
            .expect("pipe set mutex poisoned")
            .push(path.clone());
        Ok(path)
    }

    /// Remove one oid's pipe after its COPY is done.
    pub fn remove(&self, oid: u32) -> Result<()> {
        let path = self.pipe_path(oid);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.created
            .lock()
            .expect("pipe set mutex poisoned")
            .retain(|p| p != &path);
        Ok(())
    }

    /// Deposit the failure sentinel the coordinator polls for.
    pub fn deposit_error_sentinel(&self) {
        let path = self.error_sentinel_path();
        if let Err(e) = fs::File::create(&path) {
            warn!("Could not create error file {}: {e}", path.display());
        }
    }

    /// Remove every pipe this set created and has not yet removed.
    pub fn cleanup(&self) {
        let mut created = self.created.lock().expect("pipe set mutex poisoned");
        for path in created.drain(..) {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove pipe {}: {e}", path.display());
                }
            }
        }
    }
}

/// True when no `<prefix>_<N>` pipes remain on disk.
pub fn no_pipes_remain(prefix: &Path) -> bool {
    let Some(parent) = prefix.parent() else {
        return true;
    };
    let Some(stem) = prefix.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return true;
    };
    let Ok(entries) = fs::read_dir(parent) else {
        return true;
    };
    !entries.filter_map(|e| e.ok()).any(|entry| {
        let name = entry.file_name().to_string_lossy().into_owned();
        name.strip_prefix(&format!("{stem}_"))
            .is_some_and(|suffix| suffix.chars().all(|c| c.is_ascii_digit()) && !suffix.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;
    use tempfile::tempdir;

    #[test]
    fn create_makes_a_fifo_and_remove_deletes_it() {
        let dir = tempdir().unwrap();
        let pipes = PipeSet::new(dir.path().join("test_pipe"));
        let path = pipes.create(7).unwrap();
        assert!(fs::metadata(&path).unwrap().file_type().is_fifo());
        assert!(!no_pipes_remain(&dir.path().join("test_pipe")));
        pipes.remove(7).unwrap();
        assert!(!path.exists());
        assert!(no_pipes_remain(&dir.path().join("test_pipe")));
    }

    #[test]
    fn create_tolerates_an_existing_pipe() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("test_pipe");
        let pipes = PipeSet::new(&prefix);
        mkfifo(
            &PathBuf::from(format!("{}_1", prefix.display())),
            Mode::from_bits_truncate(0o777),
        )
        .unwrap();
        pipes.create(1).unwrap();
        pipes.cleanup();
        assert!(no_pipes_remain(&prefix));
    }

    #[test]
    fn cleanup_removes_every_created_pipe() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("test_pipe");
        let pipes = PipeSet::new(&prefix);
        for oid in [1, 2, 3] {
            pipes.create(oid).unwrap();
        }
        pipes.cleanup();
        assert!(no_pipes_remain(&prefix));
    }

    #[test]
    fn sentinel_is_prefix_plus_error_and_is_not_a_pipe() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("test_pipe");
        let pipes = PipeSet::new(&prefix);
        assert_eq!(
            pipes.error_sentinel_path(),
            PathBuf::from(format!("{}_error", prefix.display()))
        );
        pipes.deposit_error_sentinel();
        assert!(pipes.error_sentinel_path().is_file());
        // The sentinel does not count as a leftover pipe.
        assert!(no_pipes_remain(&prefix));
    }
}
