//! Append-only local JSONL log of every [`ProcessStatus`] transition.
//!
//! The registry mirrors the same transitions over HTTP (see
//! [`crate::registry::record_status`]) so operators and other institutions
//! can see progress; this module keeps a local copy on the worker's own
//! disk so a node can be audited or replayed without the registry being
//! reachable. One line per transition, written immediately rather than
//! buffered, since a worker process runs indefinitely and a crash should
//! never lose more than the in-flight write.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::types::ProcessStatus;

pub const STATUS_LOG_FILE: &str = "status.jsonl";

pub fn status_log_path(log_dir: &Path) -> PathBuf {
    log_dir.join(STATUS_LOG_FILE)
}

/// A handle to the append-only status log for one log directory.
///
/// Safe to share across worker threads: appends are serialized through an
/// internal mutex, and each write is followed by a flush so a line is
/// never left half-written across a crash.
pub struct StatusLog {
    file: Mutex<File>,
}

impl StatusLog {
    pub fn open(log_dir: &Path) -> Result<Self> {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;

        let path = status_log_path(log_dir);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open status log {}", path.display()))?;

        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Append one transition to the log.
    pub fn append(&self, status: &ProcessStatus) -> Result<()> {
        let line = serde_json::to_string(status).context("failed to serialize ProcessStatus")?;
        let mut file = self.file.lock().expect("status log mutex poisoned");
        writeln!(file, "{line}").context("failed to write status log line")?;
        file.flush().context("failed to flush status log")?;
        Ok(())
    }

    /// Read every transition recorded so far, in append order.
    pub fn read_all(log_dir: &Path) -> Result<Vec<ProcessStatus>> {
        let path = status_log_path(log_dir);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .with_context(|| format!("failed to open status log {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut statuses = Vec::new();
        for line in reader.lines() {
            let line = line
                .with_context(|| format!("failed to read line from status log {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let status: ProcessStatus = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse status log line: {line}"))?;
            statuses.push(status);
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProcessStatusValue, Stage};
    use chrono::Utc;
    use tempfile::tempdir;

    fn sample_status(name: &str) -> ProcessStatus {
        ProcessStatus {
            name: name.to_string(),
            bucket: "aptrust.receiving.test.edu".to_string(),
            etag: "etag-1".to_string(),
            bag_date: Utc::now(),
            institution: "test.edu".to_string(),
            stage: Stage::Fetch,
            status: ProcessStatusValue::Started,
            note: "starting".to_string(),
            retry: false,
            node: "node-1".to_string(),
            pid: 1234,
        }
    }

    #[test]
    fn append_then_read_all_round_trips() {
        let td = tempdir().expect("tempdir");
        let log = StatusLog::open(td.path()).expect("open");

        log.append(&sample_status("bag1.tar")).expect("append 1");
        log.append(&sample_status("bag2.tar")).expect("append 2");

        let all = StatusLog::read_all(td.path()).expect("read");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "bag1.tar");
        assert_eq!(all[1].name, "bag2.tar");
    }

    #[test]
    fn read_all_returns_empty_when_missing() {
        let td = tempdir().expect("tempdir");
        let all = StatusLog::read_all(td.path()).expect("read");
        assert!(all.is_empty());
    }

    #[test]
    fn reopening_appends_rather_than_truncating() {
        let td = tempdir().expect("tempdir");
        {
            let log = StatusLog::open(td.path()).expect("open 1");
            log.append(&sample_status("bag1.tar")).expect("append");
        }
        {
            let log = StatusLog::open(td.path()).expect("open 2");
            log.append(&sample_status("bag2.tar")).expect("append");
        }

        let all = StatusLog::read_all(td.path()).expect("read");
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn path_helper_joins_log_dir() {
        let base = PathBuf::from("/var/log/bagman");
        assert_eq!(
            status_log_path(&base),
            PathBuf::from("/var/log/bagman").join(STATUS_LOG_FILE)
        );
    }
}
