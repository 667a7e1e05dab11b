//! Trouble-dump writer for the `trouble`/`failed_replication`/
//! `failed_fixity` topics (spec §6: "a dead-letter channel whose consumer
//! dumps structured JSON for operator inspection").
//!
//! Every envelope that lands in one of those topics is written once,
//! whole, to `<log-dir>/trouble/<inst>_<bag>.json` (spec §6's
//! "Persisted state" row), so an operator can `ls`/`cat` the directory
//! without a broker or registry connection. Grounded on the teacher's
//! `state.rs::atomic_write_json` helper: write to a sibling `.tmp` file,
//! then rename, so a crash mid-write never leaves a half-written dump.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

pub const TROUBLE_DIR: &str = "trouble";

pub fn trouble_dir(log_dir: &Path) -> PathBuf {
    log_dir.join(TROUBLE_DIR)
}

pub fn trouble_path(log_dir: &Path, institution: &str, bag_name: &str) -> PathBuf {
    trouble_dir(log_dir).join(format!("{institution}_{bag_name}.json"))
}

/// Dump `envelope` to `<log-dir>/trouble/<institution>_<bag_name>.json`.
///
/// Overwrites any prior dump for the same institution/bag: a bag that
/// lands in trouble twice (e.g. failed store, was requeued by an operator,
/// then failed replication) should show only its most recent failure.
pub fn dump<T: Serialize>(
    log_dir: &Path,
    institution: &str,
    bag_name: &str,
    envelope: &T,
) -> Result<()> {
    let dir = trouble_dir(log_dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create trouble dir {}", dir.display()))?;

    let path = trouble_path(log_dir, institution, bag_name);
    atomic_write_json(&path, envelope)
}

fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("failed to serialize trouble dump")?;

    {
        let mut f = File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(&data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to rename tmp file {} to {}",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}
