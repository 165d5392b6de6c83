//! Per-entry directories of timestamped copies.  Every rewrite snapshots the previous file
//! content first; the directory is pruned to the configured retention bound.  Snapshot names
//! sort newest-first lexically because the stamp is `YYYYMMDD_HHMMSS`.

use crate::error::{self, Result};
use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use snafu::ResultExt;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

lazy_static! {
    // The stamp is either the current `YYYYMMDD_HHMMSS` shape, the older unseparated
    // fourteen-digit shape, or a bare epoch integer from the earliest deployments.
    static ref STAMP: Regex = Regex::new(r"^(\d{8}_\d{6}|\d+)$").unwrap();
}

pub const BACKUP_DIR_MODE: u32 = 0o750;

/// Make sure the entry's backup directory exists.  Without the auto-create flag a missing
/// directory is reported instead of silently created, so a misconfigured backup root is
/// noticed before the first write disappears into it.
pub fn ensure_dir(dir: &Path, auto_create: bool) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    if !auto_create {
        return error::BackupDirMissingSnafu { path: dir }.fail();
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(BACKUP_DIR_MODE)
        .create(dir)
        .context(error::BackupDirCreateSnafu { path: dir })?;
    Ok(())
}

/// Copy the target file into the backup directory under a fresh UTC stamp, then prune.
/// Returns the snapshot filename, or None when the target doesn't exist yet (first write).
pub fn snapshot(target: &Path, dir: &Path, max_backups: usize) -> Result<Option<String>> {
    if !target.exists() {
        return Ok(None);
    }

    let base = basename(target);
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let filename = format!("{}.bak.{}", base, stamp);
    let dest = dir.join(&filename);
    fs::copy(target, &dest).context(error::BackupFailedSnafu { path: &dest })?;

    prune(dir, &base, max_backups)?;
    Ok(Some(filename))
}

/// Snapshot filenames for the entry, newest first.
pub fn list(dir: &Path, target: &Path) -> Result<Vec<String>> {
    let base = basename(target);
    let prefix = format!("{}.bak.", base);

    let mut names = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        // No directory yet means no backups yet.
        Err(_) => return Ok(names),
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) {
            names.push(name);
        }
    }
    names.sort_unstable_by(|a, b| b.cmp(a));
    Ok(names)
}

/// Strict shape check for client-supplied snapshot names; anything else could be used to read
/// or clobber unrelated files in the backup directory.
pub fn valid_backup_name(target: &Path, filename: &str) -> bool {
    let prefix = format!("{}.bak.", basename(target));
    match filename.strip_prefix(&prefix) {
        Some(stamp) => STAMP.is_match(stamp),
        None => false,
    }
}

/// Raw bytes of one snapshot.
pub fn read(dir: &Path, target: &Path, filename: &str) -> Result<Vec<u8>> {
    if !valid_backup_name(target, filename) {
        return error::BadBackupNameSnafu { filename }.fail();
    }
    let path = dir.join(filename);
    if !path.is_file() {
        return error::MissingBackupSnafu { filename }.fail();
    }
    fs::read(&path).context(error::ReadFailedSnafu { path })
}

/// Copy a snapshot back onto the target path.  Metadata enforcement is the caller's business,
/// the restore itself only moves bytes.
pub fn restore(dir: &Path, target: &Path, filename: &str) -> Result<()> {
    if !valid_backup_name(target, filename) {
        return error::BadBackupNameSnafu { filename }.fail();
    }
    let source = dir.join(filename);
    if !source.is_file() {
        return error::MissingBackupSnafu { filename }.fail();
    }
    fs::copy(&source, target)
        .map(|_| ())
        .context(error::RestoreFailedSnafu { path: target })
}

fn prune(dir: &Path, base: &str, max_backups: usize) -> Result<()> {
    let prefix = format!("{}.bak.", base);
    let mut names: Vec<PathBuf> = Vec::new();
    let entries = fs::read_dir(dir).context(error::ReadFailedSnafu { path: dir })?;
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            names.push(entry.path());
        }
    }
    names.sort_unstable_by(|a, b| b.cmp(a));

    for stale in names.iter().skip(max_backups) {
        if let Err(e) = fs::remove_file(stale) {
            warn!("could not prune old backup {}: {}", stale.display(), e);
        }
    }
    Ok(())
}

fn basename(target: &Path) -> String {
    target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
