//! The per-request pipeline: request id, effective client IP, CORS, IP-CIDR admission,
//! constant-time token check, and the REQUEST/RESPONSE audit log lines.  Everything here runs
//! before a handler is chosen, so a rejected caller never reaches the registry or the disk.

use actix_web::body::{EitherBody, MessageBody};
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{self, HeaderName, HeaderValue};
use actix_web::http::{Method, StatusCode};
use actix_web::HttpResponse;
use chrono::Utc;
use futures_util::future::LocalBoxFuture;
use ipnet::IpNet;
use rand::Rng;
use serde_json::json;
use std::future::{ready, Ready};
use std::net::IpAddr;
use std::process;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;
use subtle::ConstantTimeEq;

use crate::settings::GlobalConfig;

const ALLOW_METHODS: &str = "GET, POST, DELETE, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, X-API-Token, Authorization";
const MAX_AGE: &str = "86400";

/// The slice of GlobalConfig the pipeline needs, pulled out so the middleware doesn't hold the
/// whole configuration.
#[derive(Debug)]
pub struct PipelineConfig {
    pub api_token: Option<String>,
    pub allowed_ips: Vec<IpNet>,
    pub trusted_proxies: Vec<IpAddr>,
    pub allow_origins: Vec<String>,
}

impl PipelineConfig {
    pub fn from_global(global: &GlobalConfig) -> Arc<Self> {
        Arc::new(PipelineConfig {
            api_token: global.api_token.clone(),
            allowed_ips: global.allowed_ips.clone(),
            trusted_proxies: global.trusted_proxies.clone(),
            allow_origins: global.allow_origins.clone(),
        })
    }
}

pub struct Pipeline {
    ctx: Arc<PipelineConfig>,
}

impl Pipeline {
    pub fn new(ctx: Arc<PipelineConfig>) -> Self {
        Pipeline { ctx }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Pipeline
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = PipelineMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(PipelineMiddleware {
            service: Rc::new(service),
            ctx: Arc::clone(&self.ctx),
        }))
    }
}

pub struct PipelineMiddleware<S> {
    service: Rc<S>,
    ctx: Arc<PipelineConfig>,
}

impl<S, B> Service<ServiceRequest> for PipelineMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let ctx = Arc::clone(&self.ctx);

        Box::pin(async move {
            let req_id = request_id();
            let started = Instant::now();

            let peer = req.peer_addr().map(|addr| addr.ip());
            let forwarded = req
                .headers()
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let ip = pick_client_ip(peer, forwarded.as_deref(), &ctx.trusted_proxies);
            let ip_str = ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".to_string());

            let method = req.method().clone();
            let path = req.path().to_string();
            let origin = req
                .headers()
                .get(header::ORIGIN)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let allow_origin = cors_origin(origin.as_deref(), &ctx.allow_origins);

            // Preflights are answered before any admission checks; they carry no credentials.
            if method == Method::OPTIONS {
                let mut response = HttpResponse::NoContent().finish();
                apply_cors(response.headers_mut(), &allow_origin);
                return Ok(req.into_response(response).map_into_right_body());
            }

            info!("REQUEST req_id={} ip={} {} {}", req_id, ip_str, method, path);

            if !ctx.allowed_ips.is_empty() && !ip_admitted(ip, &ctx.allowed_ips) {
                warn!("rejecting {} for {} {}: IP not in allowed_ips", ip_str, method, path);
                let mut response = reject(StatusCode::FORBIDDEN, "Forbidden");
                apply_cors(response.headers_mut(), &allow_origin);
                log_response(&req_id, &ip_str, &method, &path, StatusCode::FORBIDDEN, started);
                return Ok(req.into_response(response).map_into_right_body());
            }

            if let Some(expected) = &ctx.api_token {
                let provided = provided_token(&req);
                if !token_matches(provided.as_deref(), expected) {
                    warn!("rejecting {} for {} {}: bad or missing token", ip_str, method, path);
                    let mut response = reject(StatusCode::UNAUTHORIZED, "Unauthorized");
                    apply_cors(response.headers_mut(), &allow_origin);
                    log_response(
                        &req_id,
                        &ip_str,
                        &method,
                        &path,
                        StatusCode::UNAUTHORIZED,
                        started,
                    );
                    return Ok(req.into_response(response).map_into_right_body());
                }
            }

            let res = service.call(req).await?;
            let status = res.status();
            let mut res = res.map_into_left_body();
            apply_cors(res.headers_mut(), &allow_origin);
            log_response(&req_id, &ip_str, &method, &path, status, started);
            Ok(res)
        })
    }
}

fn log_response(
    req_id: &str,
    ip: &str,
    method: &Method,
    path: &str,
    status: StatusCode,
    started: Instant,
) {
    info!(
        "RESPONSE req_id={} ip={} {} {} status={} time={:.3}",
        req_id,
        ip,
        method,
        path,
        status.as_u16(),
        started.elapsed().as_secs_f64()
    );
}

fn reject(status: StatusCode, message: &str) -> HttpResponse {
    HttpResponse::build(status).json(json!({ "ok": false, "error": message }))
}

/// `<ms-time>-<pid>-<rand>`: unique enough to correlate a REQUEST line with its RESPONSE line
/// across interleaved workers.
fn request_id() -> String {
    format!(
        "{}-{}-{}",
        Utc::now().timestamp_millis(),
        process::id(),
        rand::thread_rng().gen_range(100_000..1_000_000)
    )
}

/// The socket peer is authoritative unless it is a trusted proxy, in which case the first hop
/// of X-Forwarded-For is believed instead.
fn pick_client_ip(
    peer: Option<IpAddr>,
    forwarded: Option<&str>,
    trusted_proxies: &[IpAddr],
) -> Option<IpAddr> {
    let peer = peer?;
    if trusted_proxies.contains(&peer) {
        if let Some(first_hop) = forwarded
            .and_then(|header| header.split(',').next())
            .map(str::trim)
            .and_then(|hop| hop.parse().ok())
        {
            return Some(first_hop);
        }
    }
    Some(peer)
}

fn ip_admitted(ip: Option<IpAddr>, nets: &[IpNet]) -> bool {
    match ip {
        Some(ip) => nets.iter().any(|net| net.contains(&ip)),
        // No peer address and an allow-list configured: nothing to admit on.
        None => false,
    }
}

/// Echo the Origin when no allow-list is configured, reflect allow-listed origins, and answer
/// the literal `null` for everything else.
fn cors_origin(origin: Option<&str>, allow_origins: &[String]) -> String {
    match origin {
        None => "*".to_string(),
        Some(origin) => {
            if allow_origins.is_empty() || allow_origins.iter().any(|o| o == origin) {
                origin.to_string()
            } else {
                "null".to_string()
            }
        }
    }
}

fn apply_cors(headers: &mut actix_web::http::header::HeaderMap, allow_origin: &str) {
    let pairs: [(&str, &str); 4] = [
        ("access-control-allow-origin", allow_origin),
        ("access-control-allow-methods", ALLOW_METHODS),
        ("access-control-allow-headers", ALLOW_HEADERS),
        ("access-control-max-age", MAX_AGE),
    ];
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
}

fn provided_token(req: &ServiceRequest) -> Option<String> {
    if let Some(token) = req
        .headers()
        .get("x-api-token")
        .and_then(|value| value.to_str().ok())
    {
        return Some(token.to_string());
    }
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Comparison time depends only on the token lengths, not on where the first difference sits.
fn token_matches(provided: Option<&str>, expected: &str) -> bool {
    match provided {
        Some(provided) => provided.as_bytes().ct_eq(expected.as_bytes()).into(),
        None => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_ids_have_three_parts() {
        let id = request_id();
        assert_eq!(id.split('-').count(), 3);
        assert_ne!(request_id(), request_id());
    }

    #[test]
    fn peer_is_authoritative_without_proxy() {
        let peer: IpAddr = "203.0.113.7".parse().unwrap();
        let picked = pick_client_ip(Some(peer), Some("198.51.100.1"), &[]);
        assert_eq!(picked, Some(peer));
    }

    #[test]
    fn trusted_proxy_uses_first_forwarded_hop() {
        let proxy: IpAddr = "10.0.0.1".parse().unwrap();
        let client: IpAddr = "198.51.100.1".parse().unwrap();
        let picked = pick_client_ip(
            Some(proxy),
            Some("198.51.100.1, 10.0.0.1"),
            &[proxy],
        );
        assert_eq!(picked, Some(client));
    }

    #[test]
    fn trusted_proxy_with_garbage_header_falls_back_to_peer() {
        let proxy: IpAddr = "10.0.0.1".parse().unwrap();
        let picked = pick_client_ip(Some(proxy), Some("not-an-ip"), &[proxy]);
        assert_eq!(picked, Some(proxy));
    }

    #[test]
    fn admission_checks_all_nets() {
        let nets = vec![
            "10.0.0.0/8".parse::<IpNet>().unwrap(),
            "192.168.1.5/32".parse::<IpNet>().unwrap(),
        ];
        assert!(ip_admitted(Some("10.1.2.3".parse().unwrap()), &nets));
        assert!(ip_admitted(Some("192.168.1.5".parse().unwrap()), &nets));
        assert!(!ip_admitted(Some("192.168.1.6".parse().unwrap()), &nets));
        assert!(!ip_admitted(None, &nets));
    }

    #[test]
    fn cors_reflects_or_nulls() {
        assert_eq!(cors_origin(None, &[]), "*");
        assert_eq!(cors_origin(Some("https://a.example"), &[]), "https://a.example");

        let allowed = vec!["https://a.example".to_string()];
        assert_eq!(
            cors_origin(Some("https://a.example"), &allowed),
            "https://a.example"
        );
        assert_eq!(cors_origin(Some("https://b.example"), &allowed), "null");
    }

    #[test]
    fn token_compare_decides_by_content_not_position() {
        assert!(token_matches(Some("secret"), "secret"));
        // Differing in the first and in the last byte must both simply be "no".
        assert!(!token_matches(Some("Xecret"), "secret"));
        assert!(!token_matches(Some("secreX"), "secret"));
        assert!(!token_matches(Some("secr"), "secret"));
        assert!(!token_matches(None, "secret"));
    }
}
