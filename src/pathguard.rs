//! The pathguard module pins writable paths to an allow-list of canonical roots and refuses to
//! follow symlinks.  Roots and candidate directories are compared as strings with a trailing
//! slash so that `/etc/foo` can never match a root of `/etc/foobar`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// How strictly the guard is enforced.  `Audit` logs mismatches but lets them through, which is
/// useful when introducing the agent on a host with a grown set of managed files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardMode {
    Off,
    Audit,
    On,
}

impl Default for GuardMode {
    fn default() -> Self {
        GuardMode::Audit
    }
}

impl FromStr for GuardMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_lowercase().as_str() {
            "off" => Ok(GuardMode::Off),
            "audit" => Ok(GuardMode::Audit),
            "on" => Ok(GuardMode::On),
            _ => Err(format!("invalid path_guard mode '{}'", input)),
        }
    }
}

impl GuardMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardMode::Off => "off",
            GuardMode::Audit => "audit",
            GuardMode::On => "on",
        }
    }
}

/// Resolve the real path of `p` if it exists, else of its parent directory, normalised to a
/// string with a trailing slash.  Used for allow-list roots and for the directories of
/// candidate target files.
pub fn canonicalise(p: &Path) -> io::Result<String> {
    let real = if p.exists() {
        fs::canonicalize(p)?
    } else {
        let parent = p
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = p.file_name().map(PathBuf::from).unwrap_or_default();
        fs::canonicalize(parent)?.join(file_name)
    };
    Ok(with_trailing_slash(&real))
}

/// The canonical directory containing `p`, trailing slash included.  The file itself doesn't
/// have to exist, its directory does.
pub fn canonical_dir(p: &Path) -> io::Result<String> {
    let parent = p
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(with_trailing_slash(&fs::canonicalize(parent)?))
}

fn with_trailing_slash(p: &Path) -> String {
    let mut s = p.to_string_lossy().into_owned();
    if !s.ends_with('/') {
        s.push('/');
    }
    s
}

/// Returns true if `p` is a symlink.  A missing path is not a symlink.
pub fn is_symlink(p: &Path) -> bool {
    fs::symlink_metadata(p)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}

/// Decide whether `p` may be touched.  Symlinks are rejected regardless of mode.  Any
/// resolution error counts as "not allowed", except in audit mode where it is logged and
/// allowed.
pub fn is_allowed(mode: GuardMode, roots: &[String], p: &Path) -> bool {
    if is_symlink(p) {
        warn!("path guard: refusing symlink {}", p.display());
        return false;
    }

    if mode == GuardMode::Off {
        return true;
    }

    if roots.is_empty() {
        if mode == GuardMode::Audit {
            warn!(
                "path guard: no allowed_roots configured, letting {} through (audit)",
                p.display()
            );
            return true;
        }
        return false;
    }

    let dir = match canonical_dir(p) {
        Ok(dir) => dir,
        Err(e) => {
            if mode == GuardMode::Audit {
                warn!(
                    "path guard: cannot resolve {}: {}, letting it through (audit)",
                    p.display(),
                    e
                );
                return true;
            }
            warn!("path guard: cannot resolve {}: {}", p.display(), e);
            return false;
        }
    };

    // Roots carry a trailing slash, so prefix matching can't jump from /etc/foo to /etc/foobar.
    if roots.iter().any(|root| dir.starts_with(root.as_str())) {
        return true;
    }

    if mode == GuardMode::Audit {
        warn!(
            "path guard: {} is outside the allowed roots, letting it through (audit)",
            p.display()
        );
        return true;
    }

    warn!("path guard: {} is outside the allowed roots", p.display());
    false
}
