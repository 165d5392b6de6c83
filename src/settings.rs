//! The settings module owns `global.json`: the immutable process-wide configuration loaded at
//! boot.  Keys mirror the on-disk schema of the agent's predecessor, so camelCase and
//! snake_case are mixed; serde renames paper over that.

use crate::pathguard::{self, GuardMode};
use ipnet::IpNet;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
pub const DEFAULT_SYSTEMCTL: &str = "/usr/bin/systemctl";
pub const DEFAULT_MAX_BACKUPS: usize = 10;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to read '{}': {}", path.display(), source))]
    ReadConfig {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("'{}' is not valid JSON: {}", path.display(), source))]
    ParseConfig {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Invalid CIDR '{}' in allowed_ips: {}", cidr, reason))]
    BadCidr { cidr: String, reason: String },

    #[snafu(display("Invalid address '{}' in trusted_proxies: {}", addr, source))]
    BadProxy {
        addr: String,
        source: std::net::AddrParseError,
    },

    #[snafu(display("{}", reason))]
    BadGuardMode { reason: String },

    #[snafu(display("Cannot resolve allowed root '{}': {}", path.display(), source))]
    BadRoot {
        path: PathBuf,
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// `secret` predates `api_token` in the on-disk schema and may be a single string or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Secret {
    One(String),
    Many(Vec<String>),
}

impl Secret {
    fn first(&self) -> Option<&str> {
        match self {
            Secret::One(s) => Some(s.as_str()).filter(|s| !s.is_empty()),
            Secret::Many(list) => list.iter().map(String::as_str).find(|s| !s.is_empty()),
        }
    }
}

/// The raw shape of `global.json`.  Deserialized as-is and then normalised into `GlobalConfig`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawGlobal {
    listen: Option<String>,
    ssl_enable: bool,
    ssl_cert_file: Option<PathBuf>,
    ssl_key_file: Option<PathBuf>,
    api_token: Option<String>,
    secret: Option<Secret>,
    allowed_ips: Vec<String>,
    allowed_roots: Vec<PathBuf>,
    trusted_proxies: Vec<String>,
    allow_origins: Vec<String>,
    logfile: Option<PathBuf>,
    #[serde(rename = "backupDir")]
    backup_dir: Option<PathBuf>,
    #[serde(rename = "tmpDir")]
    tmp_dir: Option<PathBuf>,
    #[serde(rename = "maxBackups")]
    max_backups: Option<usize>,
    path_guard: Option<String>,
    apply_meta: bool,
    auto_create_backups: Option<bool>,
    systemctl: Option<String>,
    systemctl_flags: Option<String>,
}

/// Immutable after load; shared by all request handlers.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub listen: String,
    pub ssl_enable: bool,
    pub ssl_cert_file: Option<PathBuf>,
    pub ssl_key_file: Option<PathBuf>,
    pub api_token: Option<String>,
    pub allowed_ips: Vec<IpNet>,
    /// Canonicalised, trailing slash included.
    pub allowed_roots: Vec<String>,
    pub trusted_proxies: Vec<IpAddr>,
    pub allow_origins: Vec<String>,
    pub logfile: Option<PathBuf>,
    pub backup_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub max_backups: usize,
    pub path_guard: GuardMode,
    pub apply_meta: bool,
    pub auto_create_backups: bool,
    pub systemctl: String,
    pub systemctl_flags: Vec<String>,
}

impl GlobalConfig {
    /// Read and normalise `global.json` from `config_dir`.  A missing file yields the defaults,
    /// so a bare host can boot the agent and lock it down later.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join("global.json");
        let raw = if path.exists() {
            let bytes = fs::read(&path).context(ReadConfigSnafu { path: &path })?;
            serde_json::from_slice(&bytes).context(ParseConfigSnafu { path: &path })?
        } else {
            info!("{} not found, using built-in defaults", path.display());
            RawGlobal::default()
        };
        Self::from_raw(raw, config_dir, |var| std::env::var(var).ok())
    }

    /// Environment lookups go through `getenv` so tests don't have to mutate the real
    /// process environment.
    fn from_raw<F>(raw: RawGlobal, config_dir: &Path, getenv: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_token = getenv("API_TOKEN")
            .filter(|t| !t.is_empty())
            .or_else(|| raw.api_token.filter(|t| !t.is_empty()))
            .or_else(|| {
                raw.secret
                    .as_ref()
                    .and_then(Secret::first)
                    .map(str::to_string)
            });

        let path_guard = match getenv("PATH_GUARD").or(raw.path_guard) {
            Some(mode) => GuardMode::from_str(&mode).map_err(|reason| Error::BadGuardMode {
                reason,
            })?,
            None => GuardMode::default(),
        };

        let systemctl_flags = getenv("SYSTEMCTL_FLAGS")
            .or(raw.systemctl_flags)
            .map(|flags| flags.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let mut allowed_ips = Vec::new();
        for cidr in raw.allowed_ips {
            allowed_ips.push(parse_cidr(&cidr)?);
        }

        let mut trusted_proxies = Vec::new();
        for addr in raw.trusted_proxies {
            trusted_proxies.push(addr.parse().context(BadProxySnafu { addr: addr.as_str() })?);
        }

        // Roots are canonicalised once at boot; entries under paths that don't resolve are a
        // configuration error worth failing loudly on.
        let mut allowed_roots = Vec::new();
        for root in raw.allowed_roots {
            let canon =
                pathguard::canonicalise(&root).context(BadRootSnafu { path: &root })?;
            allowed_roots.push(canon);
        }

        let backup_dir = absolutise(
            config_dir,
            raw.backup_dir.unwrap_or_else(|| PathBuf::from("backups")),
        );
        let tmp_dir = absolutise(config_dir, raw.tmp_dir.unwrap_or_else(|| PathBuf::from("tmp")));

        Ok(GlobalConfig {
            listen: raw.listen.unwrap_or_else(|| DEFAULT_LISTEN.to_string()),
            ssl_enable: raw.ssl_enable,
            ssl_cert_file: raw.ssl_cert_file,
            ssl_key_file: raw.ssl_key_file,
            api_token,
            allowed_ips,
            allowed_roots,
            trusted_proxies,
            allow_origins: raw.allow_origins,
            logfile: raw.logfile.map(|p| absolutise(config_dir, p)),
            backup_dir,
            tmp_dir,
            max_backups: raw.max_backups.unwrap_or(DEFAULT_MAX_BACKUPS),
            path_guard,
            apply_meta: raw.apply_meta,
            auto_create_backups: raw.auto_create_backups.unwrap_or(true),
            systemctl: raw.systemctl.unwrap_or_else(|| DEFAULT_SYSTEMCTL.to_string()),
            systemctl_flags,
        })
    }
}

/// Accept both proper CIDR blocks and bare addresses; a bare address means exactly one host.
fn parse_cidr(input: &str) -> Result<IpNet> {
    if let Ok(net) = input.parse::<IpNet>() {
        return Ok(net);
    }
    let addr: IpAddr = input.parse().map_err(|_| Error::BadCidr {
        cidr: input.to_string(),
        reason: "not a CIDR block or IP address".to_string(),
    })?;
    IpNet::new(addr, if addr.is_ipv4() { 32 } else { 128 }).map_err(|e| Error::BadCidr {
        cidr: input.to_string(),
        reason: e.to_string(),
    })
}

fn absolutise(config_dir: &Path, p: PathBuf) -> PathBuf {
    if p.is_absolute() {
        p
    } else {
        config_dir.join(p)
    }
}
