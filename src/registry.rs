//! The registry maps entry names to managed configuration files and their service bindings.
//! It is populated from `configs.json` at boot and can be replaced wholesale at runtime; readers
//! always see an atomically swapped snapshot and are never affected by concurrent writers.
//!
//! The on-disk schema grew several shapes for declaring actions over the years; all of them are
//! still accepted and normalised into one ordered token table (see [`derive_actions`]).

use crate::error::{self, Result};
use crate::settings::GlobalConfig;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use snafu::ResultExt;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

lazy_static! {
    static ref SAFE_NAME_CHAR: Regex = Regex::new(r"[^A-Za-z0-9._-]").unwrap();
}

/// One managed configuration file and its binding to a service or script.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigEntry {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service: String,
    pub category: String,
    pub actions: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apply_meta: Option<bool>,
}

/// A full snapshot of the registry.  Handlers clone the `Arc` and work against a consistent
/// view; `POST /raw/configs` and reloads publish a new snapshot underneath them.
pub type RegistryMap = HashMap<String, ConfigEntry>;

#[derive(Debug)]
pub struct Registry {
    inner: RwLock<Arc<RegistryMap>>,
}

impl Registry {
    pub fn new(map: RegistryMap) -> Self {
        Registry {
            inner: RwLock::new(Arc::new(map)),
        }
    }

    pub fn snapshot(&self) -> Result<Arc<RegistryMap>> {
        let guard = self.inner.read().map_err(|_| error::Error::RegistryLock)?;
        Ok(Arc::clone(&guard))
    }

    /// Atomically replace the current table.
    pub fn rebuild(&self, map: RegistryMap) -> Result<()> {
        let mut guard = self.inner.write().map_err(|_| error::Error::RegistryLock)?;
        *guard = Arc::new(map);
        Ok(())
    }
}

/// Entry names are path components on the API surface, so traversal shapes are banned outright.
pub fn valid_entry_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.contains("..")
}

/// Replace anything outside `[A-Za-z0-9._-]` so an entry name is safe as a directory name.
pub fn sanitize_name(name: &str) -> String {
    SAFE_NAME_CHAR.replace_all(name, "_").into_owned()
}

/// Where an entry's backups live: `<backupRoot>/<sanitised name>`.
pub fn backup_dir(global: &GlobalConfig, name: &str) -> PathBuf {
    global.backup_dir.join(sanitize_name(name))
}

/// Parse a `configs.json` payload.  Invalid JSON is rejected; entries whose names carry
/// traversal shapes are skipped with a warning, everything else becomes a normalised entry.
pub fn load_from_bytes(bytes: &[u8]) -> Result<RegistryMap> {
    // A non-object top level is as unusable as broken JSON, so both reject the same way.
    let table: serde_json::Map<String, Value> =
        serde_json::from_slice(bytes).context(error::RegistryParseSnafu)?;

    let mut registry = RegistryMap::new();
    for (name, value) in table {
        if !valid_entry_name(&name) {
            warn!("skipping registry entry with unsafe name '{}'", name);
            continue;
        }
        match parse_entry(&value) {
            Some(entry) => {
                registry.insert(name, entry);
            }
            None => warn!("skipping malformed registry entry '{}'", name),
        }
    }
    Ok(registry)
}

fn parse_entry(value: &Value) -> Option<ConfigEntry> {
    let obj = value.as_object()?;
    let path = PathBuf::from(obj.get("path")?.as_str()?);

    let service = obj
        .get("service")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let category = obj
        .get("category")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .unwrap_or("uncategorized")
        .to_string();

    let string_field = |key: &str| {
        obj.get(key).and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            // Octal modes are occasionally written as bare numbers.
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    };

    Some(ConfigEntry {
        path,
        service,
        category,
        actions: derive_actions(obj),
        user: string_field("user"),
        group: string_field("group"),
        mode: string_field("mode"),
        apply_meta: obj.get("apply_meta").and_then(Value::as_bool),
    })
}

/// Normalise the accepted action-schema shapes, in precedence order:
///  (a) `actions: { token -> [args] }`
///  (b) `commands: { token -> [args] }`
///  (c) `command_args: { token -> [args] }`, `commands: [token...]` only giving an order
///  (d) `commands: [ ... ]` containing the literal `run` -> `{ run: [] }`
/// When none apply the table is empty and the entry is file-management only.
fn derive_actions(obj: &serde_json::Map<String, Value>) -> BTreeMap<String, Vec<String>> {
    if let Some(Value::Object(map)) = obj.get("actions") {
        return args_table(map);
    }

    if let Some(Value::Object(map)) = obj.get("commands") {
        return args_table(map);
    }

    if let Some(Value::Object(map)) = obj.get("command_args") {
        return args_table(map);
    }

    if let Some(Value::Array(list)) = obj.get("commands") {
        if list.iter().any(|v| v.as_str() == Some("run")) {
            let mut table = BTreeMap::new();
            table.insert("run".to_string(), Vec::new());
            return table;
        }
    }

    BTreeMap::new()
}

fn args_table(map: &serde_json::Map<String, Value>) -> BTreeMap<String, Vec<String>> {
    let mut table = BTreeMap::new();
    for (token, args) in map {
        let args = match args {
            Value::Array(list) => list
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            // A single string is treated as a one-element argument list.
            Value::String(s) => vec![s.clone()],
            Value::Null => Vec::new(),
            _ => {
                warn!("ignoring non-list arguments for action '{}'", token);
                continue;
            }
        };
        table.insert(token.clone(), args);
    }
    table
}

/// Serialize the registry back into the on-disk `configs.json` shape.
pub fn to_disk_bytes(map: &RegistryMap) -> Result<Vec<u8>> {
    let ordered: BTreeMap<&String, &ConfigEntry> = map.iter().collect();
    let mut bytes =
        serde_json::to_vec_pretty(&ordered).context(error::ResponseSerializationSnafu)?;
    bytes.push(b'\n');
    Ok(bytes)
}
