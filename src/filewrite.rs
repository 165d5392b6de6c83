//! Writing payloads to managed files and enforcing declared ownership afterwards.
//!
//! The preferred write path is a temporary file in the target's own directory followed by a
//! rename, so readers never observe a partial payload and the rename stays on one filesystem.
//! When the directory isn't writable but the file is, a plain overwrite is the best we can do;
//! the response reports which method was used.

use crate::error::{self, Result};
use crate::pathguard;
use crate::registry::ConfigEntry;
use lazy_static::lazy_static;
use nix::unistd::{self, AccessFlags, Gid, Group, Uid, User};
use regex::Regex;
use serde::Serialize;
use snafu::ResultExt;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::process;

lazy_static! {
    static ref OCTAL_MODE: Regex = Regex::new(r"^[0-7]{3,4}$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMethod {
    Atomic,
    Plain,
}

impl WriteMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMethod::Atomic => "atomic",
            WriteMethod::Plain => "plain",
        }
    }
}

/// Write `bytes` to `path`, atomically when the directory allows it.
pub fn write(path: &Path, bytes: &[u8]) -> Result<WriteMethod> {
    let dir = path.parent().filter(|d| !d.as_os_str().is_empty());

    if let Some(dir) = dir {
        if dir.is_dir() && unistd::access(dir, AccessFlags::W_OK).is_ok() {
            match write_atomic(dir, path, bytes) {
                Ok(()) => return Ok(WriteMethod::Atomic),
                Err(e) => {
                    warn!(
                        "atomic write to {} failed ({}), falling back to plain write",
                        path.display(),
                        e
                    );
                }
            }
        }
    }

    fs::write(path, bytes).context(error::WriteFailedSnafu { path })?;
    Ok(WriteMethod::Plain)
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let base = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".tmp_{}.{}", base, process::id()));

    if let Err(e) = fs::write(&tmp, bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// The observed ownership and mode after a write, straight from stat.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppliedMeta {
    pub uid: u32,
    pub gid: u32,
    pub mode: String,
}

/// Set owner, group, and mode to the entry's declared values.  Failures here are warnings, not
/// request failures: the file content is already on disk, and the caller reports the stat
/// result we actually ended up with.
pub fn apply_meta(global_apply: bool, entry: &ConfigEntry, path: &Path) -> Result<AppliedMeta> {
    let wanted = entry.apply_meta.unwrap_or(global_apply)
        || entry.user.is_some()
        || entry.group.is_some()
        || entry.mode.is_some();

    if wanted {
        if pathguard::is_symlink(path) {
            warn!(
                "not applying metadata to {}: target is a symlink",
                path.display()
            );
        } else {
            chown_chmod(entry, path);
        }
    }

    let meta = fs::metadata(path).context(error::StatFailedSnafu { path })?;
    Ok(AppliedMeta {
        uid: meta.uid(),
        gid: meta.gid(),
        mode: format!("{:04o}", meta.mode() & 0o7777),
    })
}

fn chown_chmod(entry: &ConfigEntry, path: &Path) {
    let uid = entry.user.as_deref().and_then(resolve_uid);
    let gid = entry.group.as_deref().and_then(resolve_gid);

    if uid.is_some() || gid.is_some() {
        // Option::None leaves that axis unchanged, the chown(-1) convention.
        if let Err(e) = unistd::chown(path, uid, gid) {
            warn!("chown {} failed: {}", path.display(), e);
        }
    }

    if let Some(mode) = entry.mode.as_deref() {
        match parse_mode(mode) {
            Some(bits) => {
                if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(bits)) {
                    warn!("chmod {} failed: {}", path.display(), e);
                }
            }
            None => warn!("ignoring invalid mode '{}' for {}", mode, path.display()),
        }
    }
}

/// Accept a user name or a numeric uid string.
fn resolve_uid(name: &str) -> Option<Uid> {
    if let Ok(raw) = name.parse::<libc::uid_t>() {
        return Some(Uid::from_raw(raw));
    }
    match User::from_name(name) {
        Ok(Some(user)) => Some(user.uid),
        Ok(None) => {
            warn!("unknown user '{}'", name);
            None
        }
        Err(e) => {
            warn!("cannot look up user '{}': {}", name, e);
            None
        }
    }
}

fn resolve_gid(name: &str) -> Option<Gid> {
    if let Ok(raw) = name.parse::<libc::gid_t>() {
        return Some(Gid::from_raw(raw));
    }
    match Group::from_name(name) {
        Ok(Some(group)) => Some(group.gid),
        Ok(None) => {
            warn!("unknown group '{}'", name);
            None
        }
        Err(e) => {
            warn!("cannot look up group '{}': {}", name, e);
            None
        }
    }
}

/// Three or four octal digits, nothing else.
pub fn parse_mode(mode: &str) -> Option<u32> {
    if !OCTAL_MODE.is_match(mode) {
        return None;
    }
    u32::from_str_radix(mode, 8).ok()
}
