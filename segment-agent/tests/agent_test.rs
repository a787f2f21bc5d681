//! End-to-end tests for the segment agent binary.
//!
//! Each test launches the real binary the way the coordinator would, plays
//! the database's role on the other end of the pipes, and checks the on-disk
//! artifact contract: data file, segment TOC, pipe cleanup, and the error
//! sentinel.

use std::fs::{self, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{mkfifo, Pid};
use segment_agent::pipes::no_pipes_remain;
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const EXPECTED_DATA: &str = "here is some data\nhere is some data\nhere is some data\n";
const EXPECTED_TOC: &str = "dataentries:\n  1:\n    startbyte: 0\n    endbyte: 18\n  2:\n    startbyte: 18\n    endbyte: 36\n  3:\n    startbyte: 36\n    endbyte: 54\n";

struct TestEnv {
    dir: TempDir,
}

impl TestEnv {
    fn new() -> Self {
        TestEnv { dir: tempdir().unwrap() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn toc_file(&self) -> PathBuf {
        self.path("test_toc.yaml")
    }

    fn oid_file(&self) -> PathBuf {
        self.path("test_oids")
    }

    fn pipe_prefix(&self) -> PathBuf {
        self.path("test_pipe")
    }

    fn data_file(&self) -> PathBuf {
        self.path("test_data")
    }

    fn error_file(&self) -> PathBuf {
        self.path("test_pipe_error")
    }

    fn pipe(&self, oid: u32) -> PathBuf {
        self.path(&format!("test_pipe_{oid}"))
    }

    /// Launch the agent with the standard flag set plus `extra`.
    fn spawn_agent(&self, extra: &[&str]) -> Child {
        Command::new(env!("CARGO_BIN_EXE_segment-agent"))
            .arg("--toc-file")
            .arg(self.toc_file())
            .arg("--oid-file")
            .arg(self.oid_file())
            .arg("--pipe-file")
            .arg(self.pipe_prefix())
            .arg("--content")
            .arg("1")
            .args(extra)
            .env("HOME", self.dir.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    fn assert_no_errors(&self) {
        assert!(!self.error_file().exists(), "unexpected error sentinel");
        assert!(no_pipes_remain(&self.pipe_prefix()), "pipes left behind");
    }

    fn assert_errors_handled(&self) {
        assert!(self.error_file().is_file(), "missing error sentinel");
        assert!(no_pipes_remain(&self.pipe_prefix()), "pipes left behind");
    }

    fn assert_backup_artifacts(&self, compressed: bool, data_file: &Path) {
        let raw = fs::read(data_file).unwrap();
        let contents = if compressed { gunzip(&raw) } else { raw };
        assert_eq!(String::from_utf8(contents).unwrap(), EXPECTED_DATA);
        assert_eq!(fs::read_to_string(self.toc_file()).unwrap(), EXPECTED_TOC);
        let mode = fs::metadata(self.toc_file()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o444);
        self.assert_no_errors();
    }
}

fn wait_for_path(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !path.exists() {
        assert!(Instant::now() < deadline, "timed out waiting for {path:?}");
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Play the COPY command's part: wait for each pipe to appear, connect as a
/// writer, and send one table's payload.
fn write_to_pipes(env: &TestEnv, oids: &[u32]) {
    for &oid in oids {
        let pipe = env.pipe(oid);
        wait_for_path(&pipe);
        let mut writer = OpenOptions::new().write(true).open(&pipe).unwrap();
        writer.write_all(b"here is some data\n").unwrap();
    }
}

fn wait_with_timeout(mut child: Child) -> std::process::ExitStatus {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() >= deadline {
            child.kill().unwrap();
            panic!("agent did not exit in time");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn gunzip(bytes: &[u8]) -> Vec<u8> {
    futures::executor::block_on(async {
        let mut decoder = GzipDecoder::new(bytes);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).await.unwrap();
        out
    })
}

fn gzip(bytes: &[u8]) -> Vec<u8> {
    futures::executor::block_on(async {
        let mut encoder = GzipEncoder::new(Vec::new());
        encoder.write_all(bytes).await.unwrap();
        encoder.shutdown().await.unwrap();
        encoder.into_inner()
    })
}

/// Write the artifacts a finished backup leaves behind, for restore tests.
/// The oid list asks for tables 1 and 3 only.
fn setup_restore_files(env: &TestEnv, compressed: bool, data_dir: &Path) -> PathBuf {
    fs::write(env.oid_file(), "1\n3\n").unwrap();
    fs::write(env.toc_file(), EXPECTED_TOC).unwrap();
    if compressed {
        let path = data_dir.join("test_data.gz");
        fs::write(&path, gzip(EXPECTED_DATA.as_bytes())).unwrap();
        path
    } else {
        let path = data_dir.join("test_data");
        fs::write(&path, EXPECTED_DATA.as_bytes()).unwrap();
        path
    }
}

/// A stand-in storage plugin: copies files into (backup) and out of
/// (restore) a destination directory.
fn setup_plugin(env: &TestEnv, dest: &Path) -> PathBuf {
    fs::create_dir_all(dest).unwrap();
    let executable = env.path("test_plugin.sh");
    fs::write(
        &executable,
        format!(
            "#!/bin/bash\nset -e\ncase \"$1\" in\n  backup_file) cp \"$3\" \"{dest}/\" ;;\n  restore_file) cp \"{dest}/$(basename \"$3\")\" \"$3\" ;;\n  *) echo \"unknown action $1\" >&2; exit 1 ;;\nesac\n",
            dest = dest.display()
        ),
    )
    .unwrap();
    fs::set_permissions(&executable, Permissions::from_mode(0o755)).unwrap();
    let config = env.path("plugin_config.yaml");
    fs::write(&config, format!("executable: {}\n", executable.display())).unwrap();
    config
}

#[test]
fn backup_without_compression() {
    let env = TestEnv::new();
    fs::write(env.oid_file(), "1\n2\n3\n").unwrap();
    // The coordinator may have pre-created the first pipe.
    mkfifo(&env.pipe(1), Mode::from_bits_truncate(0o777)).unwrap();

    let data_file = env.data_file();
    let agent = env.spawn_agent(&[
        "--backup-agent",
        "--compression-level",
        "0",
        "--data-file",
        data_file.to_str().unwrap(),
    ]);
    write_to_pipes(&env, &[1, 2, 3]);
    assert!(wait_with_timeout(agent).success());
    env.assert_backup_artifacts(false, &data_file);
}

#[test]
fn backup_with_compression() {
    let env = TestEnv::new();
    fs::write(env.oid_file(), "1\n2\n3\n").unwrap();

    let data_file = env.path("test_data.gz");
    let agent = env.spawn_agent(&[
        "--backup-agent",
        "--compression-level",
        "1",
        "--data-file",
        data_file.to_str().unwrap(),
    ]);
    write_to_pipes(&env, &[1, 2, 3]);
    assert!(wait_with_timeout(agent).success());
    // Byte ranges in the TOC describe uncompressed offsets.
    env.assert_backup_artifacts(true, &data_file);
}

#[test]
fn backup_with_plugin_ships_artifacts() {
    let env = TestEnv::new();
    fs::write(env.oid_file(), "1\n2\n3\n").unwrap();
    let plugin_dest = env.path("plugin_dest");
    let plugin_config = setup_plugin(&env, &plugin_dest);

    let data_file = env.data_file();
    let agent = env.spawn_agent(&[
        "--backup-agent",
        "--compression-level",
        "0",
        "--data-file",
        data_file.to_str().unwrap(),
        "--plugin-config",
        plugin_config.to_str().unwrap(),
    ]);
    write_to_pipes(&env, &[1, 2, 3]);
    assert!(wait_with_timeout(agent).success());
    env.assert_backup_artifacts(false, &plugin_dest.join("test_data"));
    assert!(plugin_dest.join("test_toc.yaml").is_file());
}

#[test]
fn backup_interrupt_leaves_error_sentinel() {
    let env = TestEnv::new();
    fs::write(env.oid_file(), "1\n2\n3\n").unwrap();

    let data_file = env.data_file();
    let agent = env.spawn_agent(&[
        "--backup-agent",
        "--compression-level",
        "0",
        "--data-file",
        data_file.to_str().unwrap(),
    ]);
    std::thread::sleep(Duration::from_millis(200));
    kill(Pid::from_raw(agent.id() as i32), Signal::SIGINT).unwrap();
    assert!(!wait_with_timeout(agent).success());
    env.assert_errors_handled();
}

#[test]
fn restore_without_compression() {
    let env = TestEnv::new();
    let data_file = setup_restore_files(&env, false, env.dir.path());

    let agent = env.spawn_agent(&[
        "--restore-agent",
        "--data-file",
        data_file.to_str().unwrap(),
    ]);
    for oid in [1, 3] {
        wait_for_path(&env.pipe(oid));
        let contents = fs::read(env.pipe(oid)).unwrap();
        assert_eq!(String::from_utf8(contents).unwrap(), "here is some data\n");
    }
    assert!(wait_with_timeout(agent).success());
    assert!(!env.pipe(2).exists(), "oid 2 was not requested");
    env.assert_no_errors();
}

#[test]
fn restore_with_compression() {
    let env = TestEnv::new();
    let data_file = setup_restore_files(&env, true, env.dir.path());

    let agent = env.spawn_agent(&[
        "--restore-agent",
        "--data-file",
        data_file.to_str().unwrap(),
    ]);
    for oid in [1, 3] {
        wait_for_path(&env.pipe(oid));
        let contents = fs::read(env.pipe(oid)).unwrap();
        assert_eq!(String::from_utf8(contents).unwrap(), "here is some data\n");
    }
    assert!(wait_with_timeout(agent).success());
    assert!(!env.pipe(2).exists(), "oid 2 was not requested");
    env.assert_no_errors();
}

#[test]
fn restore_with_plugin_fetches_the_data_file() {
    let env = TestEnv::new();
    let plugin_dest = env.path("plugin_dest");
    fs::create_dir_all(&plugin_dest).unwrap();
    let plugin_config = setup_plugin(&env, &plugin_dest);
    // The data file exists only in the plugin's storage until the agent asks
    // for it.
    setup_restore_files(&env, false, &plugin_dest);
    let data_file = env.data_file();

    let agent = env.spawn_agent(&[
        "--restore-agent",
        "--data-file",
        data_file.to_str().unwrap(),
        "--plugin-config",
        plugin_config.to_str().unwrap(),
    ]);
    for oid in [1, 3] {
        wait_for_path(&env.pipe(oid));
        let contents = fs::read(env.pipe(oid)).unwrap();
        assert_eq!(String::from_utf8(contents).unwrap(), "here is some data\n");
    }
    assert!(wait_with_timeout(agent).success());
    env.assert_no_errors();
}

#[test]
fn restore_interrupt_leaves_error_sentinel() {
    let env = TestEnv::new();
    let data_file = setup_restore_files(&env, true, env.dir.path());

    let agent = env.spawn_agent(&[
        "--restore-agent",
        "--data-file",
        data_file.to_str().unwrap(),
    ]);
    std::thread::sleep(Duration::from_millis(200));
    kill(Pid::from_raw(agent.id() as i32), Signal::SIGINT).unwrap();
    assert!(!wait_with_timeout(agent).success());
    env.assert_errors_handled();
}
