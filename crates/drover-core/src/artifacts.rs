//! Durable artifact storage: crash log, repro record, snapshots.
//!
//! Layout under the artifact root:
//!
//! ```text
//! <root>/
//!   repro_steps_<ts>.json
//!   logs/test_agent_<ts>.log
//!   crash_dumps/crash_report_<ts>.jsonl
//!   state_snapshots/snapshot_<tag>_<millis>[_<n>].json
//! ```
//!
//! `<ts>` is fixed when the store is created, so one run writes one crash
//! log and one repro file. Every write is finished and flushed before the
//! call returns.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crash::CrashRecord;
use crate::recorder::ReproRecord;

/// A named state capture written by a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tag: String,
    pub taken_at: DateTime<Utc>,
    pub state: Value,
}

/// Paths for one run's artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    run_stamp: String,
}

impl ArtifactStore {
    /// Create the directory layout under `root` and stamp the run with the
    /// current local time.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        Self::create_with_stamp(root, stamp)
    }

    /// Same as [`Self::create`] with an explicit run stamp.
    pub fn create_with_stamp(root: impl Into<PathBuf>, run_stamp: impl Into<String>) -> Result<Self> {
        let store = Self {
            root: root.into(),
            run_stamp: run_stamp.into(),
        };
        for dir in [
            store.root.clone(),
            store.logs_dir(),
            store.crash_dir(),
            store.snapshot_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create artifact directory {}", dir.display()))?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn crash_dir(&self) -> PathBuf {
        self.root.join("crash_dumps")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.root.join("state_snapshots")
    }

    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join(format!("test_agent_{}.log", self.run_stamp))
    }

    pub fn crash_file(&self) -> PathBuf {
        self.crash_dir().join(format!("crash_report_{}.jsonl", self.run_stamp))
    }

    pub fn repro_file(&self) -> PathBuf {
        self.root.join(format!("repro_steps_{}.json", self.run_stamp))
    }

    // -----------------------------------------------------------------------
    // Crash log (append-only)
    // -----------------------------------------------------------------------

    /// Append one crash record as a single JSON line.
    pub fn append_crash(&self, record: &CrashRecord) -> Result<PathBuf> {
        let path = self.crash_file();
        let line = serde_json::to_string(record).context("failed to serialize crash record")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open crash log {}", path.display()))?;
        writeln!(file, "{line}")
            .and_then(|()| file.sync_data())
            .with_context(|| format!("failed to append to crash log {}", path.display()))?;
        Ok(path)
    }

    /// Read every crash record written so far. Missing file means none.
    pub fn read_crash_records(&self) -> Result<Vec<CrashRecord>> {
        let path = self.crash_file();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read crash log {}", path.display()))?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(idx, line)| {
                serde_json::from_str(line).with_context(|| {
                    format!("malformed crash record on line {} of {}", idx + 1, path.display())
                })
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Repro record (overwritten per attempt)
    // -----------------------------------------------------------------------

    /// Replace the run's repro file with `record`.
    pub fn write_repro(&self, record: &ReproRecord) -> Result<PathBuf> {
        let path = self.repro_file();
        write_json_file(&path, record)?;
        Ok(path)
    }

    /// Load the run's repro file, if one has been written.
    pub fn read_repro_record(&self) -> Result<Option<ReproRecord>> {
        let path = self.repro_file();
        if !path.exists() {
            return Ok(None);
        }
        load_repro_record(&path).map(Some)
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Write a snapshot file for `tag` and return its path.
    ///
    /// Never overwrites: a second snapshot with the same tag in the same
    /// millisecond gets a `_<n>` suffix.
    pub fn write_snapshot(&self, tag: &str, state: Value) -> Result<PathBuf> {
        let taken_at = Utc::now();
        let tag = sanitize_tag(tag);
        let stem = format!("snapshot_{tag}_{}", taken_at.timestamp_millis());
        let (path, file) = create_unique(&self.snapshot_dir(), &stem)?;
        let snapshot = Snapshot {
            tag,
            taken_at,
            state,
        };
        write_json(file, &path, &snapshot)?;
        Ok(path)
    }
}

/// Load a repro record from any path (used by replay).
pub fn load_repro_record(path: &Path) -> Result<ReproRecord> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read repro record {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("malformed repro record {}", path.display()))
}

/// Create `<stem>.json` in `dir`, or `<stem>_<n>.json` if it is taken.
fn create_unique(dir: &Path, stem: &str) -> Result<(PathBuf, File)> {
    let mut n = 0u32;
    loop {
        let name = if n == 0 {
            format!("{stem}.json")
        } else {
            format!("{stem}_{n}.json")
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => {
                return Err(e).with_context(|| format!("failed to create {}", path.display()));
            }
        }
    }
}

fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    write_json(file, path, value)
}

fn write_json<T: Serialize>(file: File, path: &Path, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    writer
        .write_all(b"\n")
        .and_then(|()| writer.flush())
        .with_context(|| format!("failed to write {}", path.display()))?;
    writer
        .get_ref()
        .sync_data()
        .with_context(|| format!("failed to sync {}", path.display()))?;
    Ok(())
}

/// Keep snapshot file names portable.
fn sanitize_tag(tag: &str) -> String {
    let cleaned: String = tag
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "untagged".to_string()
    } else {
        cleaned
    }
}
