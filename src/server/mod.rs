//! The server module owns the API surface.  Handlers stay thin: they resolve the entry, let
//! the path guard and backup store do their checks, and hand real work to the transaction
//! helpers and the action dispatcher.

mod pipeline;

use actix_web::error::ResponseError;
use actix_web::http::StatusCode;
use actix_web::{web, App, HttpResponse, HttpServer};
use percent_encoding::percent_decode_str;
use serde_json::{json, Value};
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{self, Error, Result};
use crate::registry::{self, ConfigEntry, Registry, RegistryMap};
use crate::settings::GlobalConfig;
use crate::{actions, backup, filewrite, pathguard};

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

const API_ENDPOINTS: &[(&str, &str)] = &[
    ("GET", "/"),
    ("GET", "/health"),
    ("GET", "/configs"),
    ("GET", "/config/*name"),
    ("POST", "/config/*name"),
    ("GET", "/backups/*name"),
    ("GET", "/backupcontent/*name/*filename"),
    ("POST", "/restore/*name/*filename"),
    ("POST", "/action/*name/*cmd"),
    ("GET", "/raw/configs"),
    ("POST", "/raw/configs"),
    ("POST", "/raw/configs/reload"),
    ("DELETE", "/raw/configs/:name"),
];

/// SharedData is responsible for any data needed by web handlers that isn't provided by the
/// client in the request.
pub(crate) struct SharedData {
    global: GlobalConfig,
    registry: Registry,
    configs_path: PathBuf,
}

impl SharedData {
    fn entry(&self, name: &str) -> Result<ConfigEntry> {
        self.registry
            .snapshot()?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownEntry {
                name: name.to_string(),
            })
    }

    /// Symlink and allow-list checks shared by every route that touches an entry's file.
    fn check_path(&self, path: &std::path::Path) -> Result<()> {
        if pathguard::is_symlink(path) {
            return error::SymlinkTargetSnafu { path }.fail();
        }
        if !pathguard::is_allowed(self.global.path_guard, &self.global.allowed_roots, path) {
            return error::PathDeniedSnafu { path }.fail();
        }
        Ok(())
    }
}

/// This is the primary interface of the module.  It defines the server and application that
/// actix spawns for requests.
pub async fn serve(global: GlobalConfig, initial: RegistryMap, configs_path: PathBuf) -> Result<()> {
    let listen = global.listen.clone();
    let pipeline_config = pipeline::PipelineConfig::from_global(&global);
    let shared_data = web::Data::new(SharedData {
        global,
        registry: Registry::new(initial),
        configs_path,
    });

    let http_server = HttpServer::new(move || {
        App::new()
            .app_data(shared_data.clone())
            .app_data(web::PayloadConfig::new(MAX_BODY_BYTES))
            .wrap(pipeline::Pipeline::new(Arc::clone(&pipeline_config)))
            .configure(routes)
    })
    .bind(listen.as_str())
    .context(error::BindAddressSnafu { addr: listen.as_str() })?;

    info!("listening on {}", listen);
    http_server.run().await.context(error::ServerStartSnafu)
}

/// Route bindings, shared between `serve` and the test harness.
fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index))
        .route("/health", web::get().to(health))
        .route("/configs", web::get().to(list_configs))
        .service(
            web::resource("/config/{name:.*}")
                .route(web::get().to(get_config))
                .route(web::post().to(post_config)),
        )
        .route("/backups/{name:.*}", web::get().to(list_backups))
        .route("/backupcontent/{tail:.*}", web::get().to(backup_content))
        .route("/restore/{tail:.*}", web::post().to(restore_backup))
        .route("/action/{tail:.*}", web::post().to(run_action))
        .service(
            web::resource("/raw/configs")
                .route(web::get().to(raw_configs))
                .route(web::post().to(replace_configs)),
        )
        .route("/raw/configs/reload", web::post().to(reload_configs))
        .route("/raw/configs/{name}", web::delete().to(delete_config))
        .default_service(web::route().to(not_found));
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

// Handler methods called by the router

async fn index() -> HttpResponse {
    let endpoints: Vec<Value> = API_ENDPOINTS
        .iter()
        .map(|(method, path)| json!({ "method": method, "path": path }))
        .collect();
    HttpResponse::Ok().json(json!({
        "ok": true,
        "name": "config-manager",
        "version": env!("CARGO_PKG_VERSION"),
        "api_endpoints": endpoints,
    }))
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "ok": 1, "status": "ok" }))
}

async fn list_configs(data: web::Data<SharedData>) -> Result<HttpResponse> {
    let snapshot = data.registry.snapshot()?;
    let mut names: Vec<&String> = snapshot.keys().collect();
    names.sort_unstable();

    let configs: Vec<Value> = names
        .iter()
        .map(|name| {
            let entry = &snapshot[name.as_str()];
            let mut tokens: Vec<&String> = entry.actions.keys().collect();
            tokens.sort_unstable();
            json!({
                "id": name,
                "filename": entry.path.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default(),
                "filetype": entry.path.extension().map(|e| e.to_string_lossy().into_owned()).unwrap_or_default(),
                "category": entry.category,
                "actions": tokens,
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({ "ok": true, "configs": configs })))
}

async fn get_config(name: web::Path<String>, data: web::Data<SharedData>) -> Result<HttpResponse> {
    let name = decode_name(&name)?;
    let entry = data.entry(&name)?;
    data.check_path(&entry.path)?;

    if !entry.path.is_file() {
        return error::MissingFileSnafu { path: &entry.path }.fail();
    }
    let bytes = fs::read(&entry.path).context(error::ReadFailedSnafu { path: &entry.path })?;
    Ok(HttpResponse::Ok()
        .content_type("application/octet-stream")
        .body(bytes))
}

async fn post_config(
    name: web::Path<String>,
    body: web::Bytes,
    data: web::Data<SharedData>,
) -> Result<HttpResponse> {
    let name = decode_name(&name)?;
    let entry = data.entry(&name)?;
    data.check_path(&entry.path)?;

    let payload = extract_content(&body);

    // Snapshot before touching the target; a failed backup aborts the write, which keeps the
    // "new content or untouched file" guarantee.
    let backup_dir = registry::backup_dir(&data.global, &name);
    backup::ensure_dir(&backup_dir, data.global.auto_create_backups)?;
    backup::snapshot(&entry.path, &backup_dir, data.global.max_backups)?;

    let method = filewrite::write(&entry.path, &payload)?;
    let applied = filewrite::apply_meta(data.global.apply_meta, &entry, &entry.path)?;

    Ok(HttpResponse::Ok().json(json!({
        "ok": true,
        "saved": payload.len(),
        "path": entry.path,
        "method": method.as_str(),
        "requested": {
            "user": entry.user,
            "group": entry.group,
            "mode": entry.mode,
            "apply_meta": entry.apply_meta.unwrap_or(data.global.apply_meta),
        },
        "applied": applied,
    })))
}

async fn list_backups(
    name: web::Path<String>,
    data: web::Data<SharedData>,
) -> Result<HttpResponse> {
    let name = decode_name(&name)?;
    let entry = data.entry(&name)?;
    let backup_dir = registry::backup_dir(&data.global, &name);
    let backups = backup::list(&backup_dir, &entry.path)?;
    Ok(HttpResponse::Ok().json(json!({ "ok": true, "backups": backups })))
}

async fn backup_content(
    tail: web::Path<String>,
    data: web::Data<SharedData>,
) -> Result<HttpResponse> {
    let (raw_name, filename) = match split_tail(&tail) {
        Some(parts) => parts,
        None => return Ok(not_found().await),
    };
    let name = decode_name(raw_name)?;
    let entry = data.entry(&name)?;
    let backup_dir = registry::backup_dir(&data.global, &name);
    let bytes = backup::read(&backup_dir, &entry.path, filename)?;
    Ok(HttpResponse::Ok()
        .content_type("application/octet-stream")
        .body(bytes))
}

async fn restore_backup(
    tail: web::Path<String>,
    data: web::Data<SharedData>,
) -> Result<HttpResponse> {
    let (raw_name, filename) = match split_tail(&tail) {
        Some(parts) => parts,
        None => return Ok(not_found().await),
    };
    let name = decode_name(raw_name)?;
    let entry = data.entry(&name)?;
    data.check_path(&entry.path)?;

    let backup_dir = registry::backup_dir(&data.global, &name);
    backup::restore(&backup_dir, &entry.path, filename)?;
    let applied = filewrite::apply_meta(data.global.apply_meta, &entry, &entry.path)?;

    Ok(HttpResponse::Ok().json(json!({
        "ok": true,
        "restored": filename,
        "path": entry.path,
        "applied": applied,
    })))
}

async fn run_action(tail: web::Path<String>, data: web::Data<SharedData>) -> Result<HttpResponse> {
    let (raw_name, cmd) = match split_tail(&tail) {
        Some(parts) => parts,
        None => return Ok(not_found().await),
    };
    let name = decode_name(raw_name)?;
    let entry = data.entry(&name)?;

    let outcome = actions::dispatch(&data.global, &name, &entry, cmd).await?;
    Ok(HttpResponse::Ok().json(outcome))
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

// Registry management

async fn raw_configs(data: web::Data<SharedData>) -> Result<HttpResponse> {
    let snapshot = data.registry.snapshot()?;
    let ordered: BTreeMap<&String, &ConfigEntry> = snapshot.iter().collect();
    let configs = serde_json::to_value(&ordered).context(error::ResponseSerializationSnafu)?;
    Ok(HttpResponse::Ok().json(json!({ "ok": true, "configs": configs })))
}

/// Replace the whole registry.  The payload is validated as JSON first; once it parses, the
/// raw bytes are persisted as-is and the in-memory table is rebuilt from them, skipping
/// entries with unsafe names.
async fn replace_configs(body: web::Bytes, data: web::Data<SharedData>) -> Result<HttpResponse> {
    let table = registry::load_from_bytes(&body)?;
    filewrite::write(&data.configs_path, &body)?;
    let count = table.len();
    data.registry.rebuild(table)?;
    info!("registry replaced: {} entries", count);
    Ok(HttpResponse::Ok().json(json!({ "ok": true, "count": count })))
}

async fn reload_configs(data: web::Data<SharedData>) -> Result<HttpResponse> {
    let bytes = fs::read(&data.configs_path).context(error::ReadFailedSnafu {
        path: &data.configs_path,
    })?;
    let table = registry::load_from_bytes(&bytes)?;
    let count = table.len();
    data.registry.rebuild(table)?;
    info!("registry reloaded from disk: {} entries", count);
    Ok(HttpResponse::Ok().json(json!({ "ok": true, "count": count })))
}

async fn delete_config(
    name: web::Path<String>,
    data: web::Data<SharedData>,
) -> Result<HttpResponse> {
    let name = percent_decode_str(&name).decode_utf8_lossy().into_owned();
    if !registry::valid_entry_name(&name) {
        return error::BadEntryNameSnafu { name }.fail();
    }

    let mut table = (*data.registry.snapshot()?).clone();
    if table.remove(&name).is_none() {
        return error::UnknownEntrySnafu { name }.fail();
    }

    let bytes = registry::to_disk_bytes(&table)?;
    filewrite::write(&data.configs_path, &bytes)?;
    data.registry.rebuild(table)?;
    info!("registry entry '{}' deleted", name);
    Ok(HttpResponse::Ok().json(json!({ "ok": true, "deleted": name })))
}

async fn not_found() -> HttpResponse {
    HttpResponse::NotFound().json(json!({ "ok": false, "error": "404 Not Found" }))
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

// Helpers for handler methods called by the router

/// Split the captured tail of a two-segment route into entry name and trailing segment.  The
/// split is on the LAST slash, so a name with embedded slashes stays in one piece and fails
/// the traversal check instead of silently re-segmenting the path.
fn split_tail(tail: &str) -> Option<(&str, &str)> {
    match tail.rsplit_once('/') {
        Some((name, last)) if !name.is_empty() && !last.is_empty() => Some((name, last)),
        _ => None,
    }
}

/// Entry names arrive as path segments and may be percent-encoded; decode before the
/// traversal check so `..%2f` can't sneak past it.
fn decode_name(raw: &str) -> Result<String> {
    let name = percent_decode_str(raw).decode_utf8_lossy().into_owned();
    if !registry::valid_entry_name(&name) {
        return error::TraversalNameSnafu { name }.fail();
    }
    Ok(name)
}

/// A write body is either raw file content or a JSON wrapper `{"content": "..."}`.
fn extract_content(body: &[u8]) -> Vec<u8> {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        if let Some(content) = value.get("content").and_then(Value::as_str) {
            return content.as_bytes().to_vec();
        }
    }
    body.to_vec()
}

impl ResponseError for Error {
    /// Maps our error types to the HTTP error code they should return.
    fn status_code(&self) -> StatusCode {
        use Error::*;
        match self {
            // 400 Bad Request
            BadEntryName { .. }
            | TraversalName { .. }
            | BadBackupName { .. }
            | RegistryParse { .. }
            | PathDenied { .. }
            | SymlinkTarget { .. }
            | ActionUnknown { .. }
            | ActionForbidden { .. }
            | BadActionArg { .. } => StatusCode::BAD_REQUEST,

            // 404 Not Found
            UnknownEntry { .. } | MissingFile { .. } | MissingBackup { .. } => {
                StatusCode::NOT_FOUND
            }

            // 500 Internal Server Error
            WriteFailed { .. }
            | ReadFailed { .. }
            | BackupDirMissing { .. }
            | BackupDirCreate { .. }
            | BackupFailed { .. }
            | RestoreFailed { .. }
            | StatFailed { .. }
            | ServiceNotActive { .. }
            | SpawnFailed { .. }
            | RegistryLock
            | ResponseSerialization { .. }
            | BindAddress { .. }
            | ServerStart { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(json!({ "ok": false, "error": self.to_string() }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pathguard::GuardMode;
    use actix_web::{body::to_bytes, dev::ServiceResponse, http::Method, test};
    use std::collections::HashMap;
    use std::os::unix::fs::symlink;
    use std::path::Path;
    use tempfile::TempDir;

    fn test_global(dir: &Path) -> GlobalConfig {
        GlobalConfig {
            listen: "127.0.0.1:0".to_string(),
            ssl_enable: false,
            ssl_cert_file: None,
            ssl_key_file: None,
            api_token: None,
            allowed_ips: Vec::new(),
            allowed_roots: vec![pathguard::canonicalise(dir).unwrap()],
            trusted_proxies: Vec::new(),
            allow_origins: Vec::new(),
            logfile: None,
            backup_dir: dir.join("backups"),
            tmp_dir: dir.join("tmp"),
            max_backups: 2,
            path_guard: GuardMode::On,
            apply_meta: false,
            auto_create_backups: true,
            systemctl: "/bin/true".to_string(),
            systemctl_flags: Vec::new(),
        }
    }

    fn entry_for(path: &Path) -> ConfigEntry {
        ConfigEntry {
            path: path.to_path_buf(),
            service: String::new(),
            category: "uncategorized".to_string(),
            actions: std::collections::BTreeMap::new(),
            user: None,
            group: None,
            mode: None,
            apply_meta: None,
        }
    }

    fn shared(dir: &Path, registry: RegistryMap) -> web::Data<SharedData> {
        web::Data::new(SharedData {
            global: test_global(dir),
            registry: Registry::new(registry),
            configs_path: dir.join("configs.json"),
        })
    }

    async fn body_json(res: ServiceResponse) -> Value {
        let bytes = to_bytes(res.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[actix_web::test]
    async fn health_and_index() {
        let dir = TempDir::new().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(shared(dir.path(), RegistryMap::new()))
                .configure(routes),
        )
        .await;

        let res =
            test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert!(res.status().is_success());
        let body = body_json(res).await;
        assert_eq!(body["ok"], 1);
        assert_eq!(body["status"], "ok");

        let res = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        let body = body_json(res).await;
        assert_eq!(body["name"], "config-manager");
        assert!(body["api_endpoints"].as_array().unwrap().len() >= 10);
    }

    #[actix_web::test]
    async fn unknown_route_is_json_404() {
        let dir = TempDir::new().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(shared(dir.path(), RegistryMap::new()))
                .configure(routes),
        )
        .await;

        let res =
            test::call_service(&app, test::TestRequest::get().uri("/nope").to_request()).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let body = body_json(res).await;
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"], "404 Not Found");
    }

    #[actix_web::test]
    async fn write_backs_up_and_round_trips() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("svcA.conf");
        fs::write(&target, b"old\n").unwrap();

        let mut registry = HashMap::new();
        registry.insert("svcA".to_string(), entry_for(&target));
        let app = test::init_service(
            App::new()
                .app_data(shared(dir.path(), registry))
                .configure(routes),
        )
        .await;

        // Write new content; previous content must land in exactly one backup.
        let res = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/config/svcA")
                .set_payload("hello\n")
                .to_request(),
        )
        .await;
        assert!(res.status().is_success());
        let body = body_json(res).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["method"], "atomic");
        assert_eq!(body["saved"], 6);
        assert_eq!(fs::read(&target).unwrap(), b"hello\n");

        let res = test::call_service(
            &app,
            test::TestRequest::get().uri("/backups/svcA").to_request(),
        )
        .await;
        let body = body_json(res).await;
        let backups = body["backups"].as_array().unwrap();
        assert_eq!(backups.len(), 1);
        let first = backups[0].as_str().unwrap().to_string();
        assert!(first.starts_with("svcA.conf.bak."));

        // The backup holds the pre-write bytes.
        let res = test::call_service(
            &app,
            test::TestRequest::get()
                .uri(&format!("/backupcontent/svcA/{}", first))
                .to_request(),
        )
        .await;
        let bytes = to_bytes(res.into_body()).await.unwrap();
        assert_eq!(&bytes[..], b"old\n");

        // Restore brings the old bytes back.
        let res = test::call_service(
            &app,
            test::TestRequest::post()
                .uri(&format!("/restore/svcA/{}", first))
                .to_request(),
        )
        .await;
        assert!(res.status().is_success());
        assert_eq!(fs::read(&target).unwrap(), b"old\n");
    }

    #[actix_web::test]
    async fn retention_bound_is_enforced() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("svcA.conf");
        fs::write(&target, b"v0\n").unwrap();

        let mut registry = HashMap::new();
        registry.insert("svcA".to_string(), entry_for(&target));
        let app = test::init_service(
            App::new()
                .app_data(shared(dir.path(), registry))
                .configure(routes),
        )
        .await;

        for content in ["v1\n", "v2\n", "v3\n"] {
            let res = test::call_service(
                &app,
                test::TestRequest::post()
                    .uri("/config/svcA")
                    .set_payload(content)
                    .to_request(),
            )
            .await;
            assert!(res.status().is_success());
            // Stamps have one-second resolution; space the writes out.
            tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        }

        let res = test::call_service(
            &app,
            test::TestRequest::get().uri("/backups/svcA").to_request(),
        )
        .await;
        let body = body_json(res).await;
        let backups: Vec<String> = body["backups"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert_eq!(backups.len(), 2, "maxBackups=2 must cap retention");
        let mut sorted = backups.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(backups, sorted, "newest first");
    }

    #[actix_web::test]
    async fn json_wrapper_body_is_unwrapped() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("svcA.conf");

        let mut registry = HashMap::new();
        registry.insert("svcA".to_string(), entry_for(&target));
        let app = test::init_service(
            App::new()
                .app_data(shared(dir.path(), registry))
                .configure(routes),
        )
        .await;

        let res = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/config/svcA")
                .set_payload(r#"{"content": "from json\n"}"#)
                .to_request(),
        )
        .await;
        assert!(res.status().is_success());
        assert_eq!(fs::read(&target).unwrap(), b"from json\n");
    }

    #[actix_web::test]
    async fn traversal_name_is_rejected_before_disk() {
        let dir = TempDir::new().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(shared(dir.path(), RegistryMap::new()))
                .configure(routes),
        )
        .await;

        let res = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/config/..%2fetc%2fpasswd")
                .to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body = body_json(res).await;
        assert_eq!(body["error"], "Pfad nicht erlaubt");
    }

    #[actix_web::test]
    async fn embedded_slash_in_two_segment_routes_is_rejected() {
        let dir = TempDir::new().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(shared(dir.path(), RegistryMap::new()))
                .configure(routes),
        )
        .await;

        // An extra literal slash re-segments the path; the name must still be seen whole and
        // be refused before any lookup or disk access.
        let attempts = [
            (Method::POST, "/action/foo/bar/restart"),
            (Method::POST, "/restore/svcA/sub/dir.bak.1"),
            (Method::GET, "/backupcontent/a/b/c.conf.bak.20240101_010101"),
            (Method::POST, "/action/..%2fetc/restart"),
        ];
        for (method, uri) in attempts {
            let res = test::call_service(
                &app,
                test::TestRequest::with_uri(uri).method(method).to_request(),
            )
            .await;
            assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{}", uri);
            let body = body_json(res).await;
            assert_eq!(body["error"], "Pfad nicht erlaubt", "{}", uri);
        }
    }

    #[actix_web::test]
    async fn symlink_target_is_refused_and_intact() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("real.conf");
        fs::write(&real, b"real\n").unwrap();
        let link = dir.path().join("link.conf");
        symlink(&real, &link).unwrap();

        let mut registry = HashMap::new();
        registry.insert("linked".to_string(), entry_for(&link));
        let app = test::init_service(
            App::new()
                .app_data(shared(dir.path(), registry))
                .configure(routes),
        )
        .await;

        let res = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/config/linked")
                .set_payload("clobber\n")
                .to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&real).unwrap(), b"real\n");
    }

    #[actix_web::test]
    async fn outside_roots_is_refused() {
        let dir = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let target = elsewhere.path().join("outside.conf");
        fs::write(&target, b"x").unwrap();

        let mut registry = HashMap::new();
        registry.insert("outside".to_string(), entry_for(&target));
        let app = test::init_service(
            App::new()
                .app_data(shared(dir.path(), registry))
                .configure(routes),
        )
        .await;

        let res = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/config/outside")
                .set_payload("nope")
                .to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body = body_json(res).await;
        assert_eq!(body["error"], "Pfad nicht erlaubt");
        assert_eq!(fs::read(&target).unwrap(), b"x");
    }

    #[actix_web::test]
    async fn unknown_entry_is_404() {
        let dir = TempDir::new().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(shared(dir.path(), RegistryMap::new()))
                .configure(routes),
        )
        .await;

        let res = test::call_service(
            &app,
            test::TestRequest::get().uri("/config/ghost").to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn registry_replace_and_reload() {
        let dir = TempDir::new().unwrap();
        let data = shared(dir.path(), RegistryMap::new());
        let app = test::init_service(App::new().app_data(data.clone()).configure(routes)).await;

        // Broken JSON changes nothing, on disk or in memory.
        let res = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/raw/configs")
                .set_payload("{broken")
                .to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(!dir.path().join("configs.json").exists());

        // A valid table is persisted and swapped in; the traversal-shaped entry is dropped
        // from memory but stays in the persisted bytes.
        let payload = format!(
            r#"{{"svcA": {{"path": "{}", "service": "svcA", "actions": {{"restart": []}}}},
                 "../evil": {{"path": "/etc/evil"}}}}"#,
            dir.path().join("svcA.conf").display()
        );
        let res = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/raw/configs")
                .set_payload(payload.clone())
                .to_request(),
        )
        .await;
        assert!(res.status().is_success());
        let body = body_json(res).await;
        assert_eq!(body["count"], 1);
        let on_disk = fs::read_to_string(dir.path().join("configs.json")).unwrap();
        assert!(on_disk.contains("../evil"));

        let res =
            test::call_service(&app, test::TestRequest::get().uri("/configs").to_request()).await;
        let body = body_json(res).await;
        let configs = body["configs"].as_array().unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0]["id"], "svcA");
        assert_eq!(configs[0]["filename"], "svcA.conf");
        assert_eq!(configs[0]["filetype"], "conf");
        assert_eq!(configs[0]["actions"], json!(["restart"]));

        // Delete persists, and a reload from disk then drops the deleted entry for good.
        let res = test::call_service(
            &app,
            test::TestRequest::with_uri("/raw/configs/svcA")
                .method(Method::DELETE)
                .to_request(),
        )
        .await;
        assert!(res.status().is_success());

        let res = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/raw/configs/reload")
                .to_request(),
        )
        .await;
        let body = body_json(res).await;
        assert_eq!(body["count"], 0);
    }

    #[actix_web::test]
    async fn pipeline_enforces_token_and_answers_preflight() {
        let dir = TempDir::new().unwrap();
        let data = shared(dir.path(), RegistryMap::new());
        let mut pipeline_global = test_global(dir.path());
        pipeline_global.api_token = Some("sesame".to_string());
        let pipeline_config = pipeline::PipelineConfig::from_global(&pipeline_global);

        let app = test::init_service(
            App::new()
                .app_data(data)
                .wrap(pipeline::Pipeline::new(pipeline_config))
                .configure(routes),
        )
        .await;

        let res =
            test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/health")
                .insert_header(("X-API-Token", "sesame"))
                .to_request(),
        )
        .await;
        assert!(res.status().is_success());

        let res = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/health")
                .insert_header(("Authorization", "Bearer sesame"))
                .to_request(),
        )
        .await;
        assert!(res.status().is_success());

        // Preflight needs no token and carries the CORS answer.
        let res = test::call_service(
            &app,
            test::TestRequest::with_uri("/health")
                .method(Method::OPTIONS)
                .insert_header(("Origin", "https://ui.example"))
                .to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            res.headers()
                .get("access-control-allow-origin")
                .unwrap()
                .to_str()
                .unwrap(),
            "https://ui.example"
        );
    }
}
