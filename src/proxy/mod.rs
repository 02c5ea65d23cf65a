// Proxy module - intercepting reverse proxy (the middleware process)
//
// Every request is forwarded to the configured upstream and the response is
// streamed back unbuffered. On the way through, the proxy manages the
// visitor tracking cookie, and for loggable responses (200 + HTML/feed
// content type) synthesizes a RawEvent into the disk queue. Requests for the
// dashboard path are authenticated and reverse-proxied to the sidecar.
//
// The tracking cookie is a three-state handshake: no cookie mints a new id
// and sets "?<id>" (tentative); a "?"-prefixed cookie confirms it by setting
// the bare id and marking the event as a second visit; a bare id is a
// returning visitor and leaves the cookie alone.

pub mod client;
pub mod worker;

use crate::config::{CookieConfig, ProxyConfig};
use crate::events::{new_uuid, RawEvent};
use crate::queue::DiskQueue;
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, Request, Response, StatusCode},
    response::IntoResponse,
    routing::any,
    Router,
};
use chrono::Utc;
use client::IngestClient;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use worker::FlushWorker;

/// Maximum buffered request body (50MB).
const MAX_REQUEST_BODY_SIZE: usize = 50 * 1024 * 1024;

/// Errors that can occur while proxying.
#[derive(Debug)]
pub(crate) enum ProxyError {
    BodyRead(String),
    Upstream(String),
    ResponseBuild(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let (status, message) = match self {
            ProxyError::BodyRead(msg) => (StatusCode::BAD_REQUEST, msg),
            ProxyError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            ProxyError::ResponseBuild(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        tracing::error!("proxy error: {} - {}", status, message);
        Response::builder()
            .status(status)
            .body(Body::from(message))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}

/// Shared state for the proxy server.
#[derive(Clone)]
struct ProxyState {
    client: reqwest::Client,
    queue: Arc<DiskQueue>,
    config: Arc<ProxyConfig>,
}

/// Run the proxy process until ctrl-c: event buffer, flush worker, server.
pub async fn run(config: ProxyConfig) -> Result<()> {
    let listen = config.listen;

    let queue = Arc::new(
        DiskQueue::open(&config.buffer_path, config.buffer_max_events)
            .context("open event buffer")?,
    );
    if queue.len() > 0 {
        tracing::info!("event buffer holds {} undelivered events", queue.len());
    }
    let ingest = IngestClient::new(&config.sidecar_url)?;

    // One client for upstream forwarding and the dashboard proxy. Redirects
    // are relayed to the caller, never followed here.
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .pool_max_idle_per_host(10)
        .build()
        .context("build upstream client")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let flush_worker = FlushWorker::new(
        Arc::clone(&queue),
        ingest,
        config.flush_interval,
        config.batch_size,
    );
    let worker_handle = tokio::spawn(flush_worker.run(stop_rx));

    let state = ProxyState {
        client,
        queue,
        config: Arc::new(config),
    };
    let app = Router::new()
        .route("/", any(proxy_handler))
        .route("/*path", any(proxy_handler))
        .with_state(state);

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("bind {}", listen))?;
    tracing::info!("proxy listening on {}", listen);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("proxy server")?;

    // Stop the worker after the server is done accepting requests.
    let _ = stop_tx.send(true);
    let _ = worker_handle.await;
    tracing::info!("proxy shut down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn proxy_handler(
    State(state): State<ProxyState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Result<Response<Body>, ProxyError> {
    if is_dashboard_request(&state.config, req.uri().path()) {
        return proxy_dashboard(&state, req.headers(), req.uri()).await;
    }

    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();

    let cookie_state = read_cookie_state(
        cookie_value(&headers, &state.config.cookie.name).as_deref(),
    );

    let body_bytes = axum::body::to_bytes(req.into_body(), MAX_REQUEST_BODY_SIZE)
        .await
        .map_err(|err| ProxyError::BodyRead(format!("read request body: {}", err)))?;

    let forward_url = match uri.query() {
        Some(query) => format!(
            "{}{}?{}",
            state.config.upstream_url.trim_end_matches('/'),
            uri.path(),
            query
        ),
        None => format!(
            "{}{}",
            state.config.upstream_url.trim_end_matches('/'),
            uri.path()
        ),
    };

    let mut forward_req = state
        .client
        .request(method, &forward_url)
        .body(body_bytes.to_vec());
    for (name, value) in headers.iter() {
        if name == "host" || name == "connection" || name == "transfer-encoding" {
            continue;
        }
        forward_req = forward_req.header(name, value);
    }

    let upstream = forward_req
        .send()
        .await
        .map_err(|err| ProxyError::Upstream(err.to_string()))?;

    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let mut response = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if name == "connection" || name == "transfer-encoding" {
            continue;
        }
        response = response.header(name, value);
    }
    if let Some(value) = &cookie_state.new_value {
        response = response.header(
            header::SET_COOKIE,
            build_set_cookie(&state.config.cookie, value),
        );
    }

    if is_loggable(status.as_u16(), &content_type) {
        let event = synthesize_event(&headers, &uri, peer, &content_type, &cookie_state);
        // Deliberately backpressures the request path when the buffer is full.
        if let Err(err) = state.queue.enqueue(event).await {
            tracing::warn!("enqueue event failed, dropping: {}", err);
        }
    }

    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|err| ProxyError::ResponseBuild(err.to_string()))
}

/// Authenticate and forward a dashboard request to the sidecar, streaming the
/// response back with its status and headers.
async fn proxy_dashboard(
    state: &ProxyState,
    headers: &HeaderMap,
    uri: &axum::http::Uri,
) -> Result<Response<Body>, ProxyError> {
    if !state.config.dashboard_token.is_empty() {
        let auth = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !bearer_matches(auth, &state.config.dashboard_token) {
            return Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body(Body::from("Unauthorized"))
                .map_err(|err| ProxyError::ResponseBuild(err.to_string()));
        }
    }

    let target = match uri.query() {
        Some(query) => format!(
            "{}{}?{}",
            state.config.sidecar_url.trim_end_matches('/'),
            uri.path(),
            query
        ),
        None => format!(
            "{}{}",
            state.config.sidecar_url.trim_end_matches('/'),
            uri.path()
        ),
    };

    let upstream = state
        .client
        .get(&target)
        .timeout(std::time::Duration::from_secs(5))
        .send()
        .await
        .map_err(|err| ProxyError::Upstream(err.to_string()))?;

    let mut response = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if name == "connection" || name == "transfer-encoding" {
            continue;
        }
        response = response.header(name, value);
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|err| ProxyError::ResponseBuild(err.to_string()))
}

fn is_dashboard_request(config: &ProxyConfig, path: &str) -> bool {
    if config.dashboard_path.is_empty() {
        return false;
    }
    if path == config.dashboard_path {
        return true;
    }
    path == format!("{}/favicon.ico", config.dashboard_path.trim_end_matches('/'))
}

fn bearer_matches(auth_header: &str, token: &str) -> bool {
    match auth_header.strip_prefix("Bearer ") {
        Some(presented) => presented == token,
        None => false,
    }
}

/// A response is loggable when it is a 200 with an HTML or feed content type.
fn is_loggable(status: u16, content_type: &str) -> bool {
    if status != 200 {
        return false;
    }
    let ct = content_type.to_ascii_lowercase();
    ct.starts_with("text/html")
        || ct.starts_with("application/atom+xml")
        || ct.starts_with("application/rss+xml")
}

/// Outcome of the cookie state machine for one request.
#[derive(Debug, Default, PartialEq, Eq)]
struct CookieState {
    /// Freshly minted id (first visit), "" otherwise.
    set_cookie: String,
    /// Known visitor id, "" on first visit.
    uniq: String,
    /// True when a tentative cookie is being confirmed.
    second_visit: bool,
    /// Cookie value to set on the response, None when nothing changes.
    new_value: Option<String>,
}

fn read_cookie_state(value: Option<&str>) -> CookieState {
    match value {
        None | Some("") => {
            let user_id = new_uuid();
            CookieState {
                new_value: Some(format!("?{}", user_id)),
                set_cookie: user_id,
                ..Default::default()
            }
        }
        Some(value) if value.starts_with('?') => {
            let user_id = value[1..].to_string();
            CookieState {
                new_value: Some(user_id.clone()),
                uniq: user_id,
                second_visit: true,
                ..Default::default()
            }
        }
        Some(value) => CookieState {
            uniq: value.to_string(),
            ..Default::default()
        },
    }
}

/// Find the tracking cookie in the Cookie header(s).
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header_value in headers.get_all(header::COOKIE) {
        let Ok(raw) = header_value.to_str() else {
            continue;
        };
        for pair in raw.split(';') {
            let pair = pair.trim();
            if let Some((key, value)) = pair.split_once('=') {
                if key == name {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

fn build_set_cookie(config: &CookieConfig, value: &str) -> String {
    let mut cookie = format!("{}={}", config.name, value);
    if !config.path.is_empty() {
        cookie.push_str("; Path=");
        cookie.push_str(&config.path);
    }
    if !config.domain.is_empty() {
        cookie.push_str("; Domain=");
        cookie.push_str(&config.domain);
    }
    if config.max_age != 0 {
        cookie.push_str(&format!("; Max-Age={}", config.max_age));
    }
    if config.http_only {
        cookie.push_str("; HttpOnly");
    }
    if config.secure {
        cookie.push_str("; Secure");
    }
    cookie.push_str("; SameSite=");
    cookie.push_str(config.same_site.as_str());
    cookie
}

fn synthesize_event(
    headers: &HeaderMap,
    uri: &axum::http::Uri,
    peer: SocketAddr,
    content_type: &str,
    cookie_state: &CookieState,
) -> RawEvent {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .unwrap_or("");

    RawEvent {
        event_id: new_uuid(),
        timestamp: Utc::now(),
        host: normalize_host(host),
        path: uri.path().to_string(),
        query: uri.query().unwrap_or("").to_string(),
        ip: client_ip(headers, peer),
        user_agent: header_str(headers, header::USER_AGENT),
        referrer: header_str(headers, header::REFERER),
        content_type: content_type.to_string(),
        set_cookie: cookie_state.set_cookie.clone(),
        uniq: cookie_state.uniq.clone(),
        second_visit: cookie_state.second_visit,
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// First X-Forwarded-For entry when present, else the transport peer; port
/// stripped either way.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .unwrap_or("");
    if !forwarded.is_empty() {
        return strip_port(forwarded).to_string();
    }
    peer.ip().to_string()
}

/// Lowercased host with any port removed.
fn normalize_host(host: &str) -> String {
    strip_port(host).to_ascii_lowercase()
}

/// Remove a trailing :port, handling bracketed and bare IPv6 addresses.
fn strip_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match addr.rfind(':') {
        // More than one colon and no brackets: bare IPv6, nothing to strip.
        Some(idx) if addr[..idx].contains(':') => addr,
        Some(idx) => &addr[..idx],
        None => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_first_visit_mints_tentative() {
        let state = read_cookie_state(None);
        assert_eq!(state.set_cookie.len(), 36);
        assert!(state.uniq.is_empty());
        assert!(!state.second_visit);
        assert_eq!(state.new_value.as_deref(), Some(&*format!("?{}", state.set_cookie)));
    }

    #[test]
    fn test_cookie_empty_value_treated_as_missing() {
        let state = read_cookie_state(Some(""));
        assert!(!state.set_cookie.is_empty());
        assert!(state.new_value.is_some());
    }

    #[test]
    fn test_cookie_tentative_confirms() {
        let state = read_cookie_state(Some("?abc"));
        assert_eq!(state.uniq, "abc");
        assert!(state.second_visit);
        assert!(state.set_cookie.is_empty());
        assert_eq!(state.new_value.as_deref(), Some("abc"));
    }

    #[test]
    fn test_cookie_confirmed_passes_through() {
        let state = read_cookie_state(Some("abc"));
        assert_eq!(state.uniq, "abc");
        assert!(!state.second_visit);
        assert!(state.new_value.is_none());
    }

    #[test]
    fn test_build_set_cookie_attributes() {
        let config = CookieConfig::default();
        let cookie = build_set_cookie(&config, "?xyz");
        assert!(cookie.starts_with("stats_id=?xyz"), "{}", cookie);
        assert!(cookie.contains("; Path=/"));
        assert!(cookie.contains("; Max-Age=2147483647"));
        assert!(cookie.contains("; HttpOnly"));
        assert!(!cookie.contains("; Secure"));
        assert!(cookie.ends_with("; SameSite=Lax"), "{}", cookie);
    }

    #[test]
    fn test_build_set_cookie_secure_strict() {
        let config = CookieConfig {
            secure: true,
            http_only: false,
            domain: "example.com".into(),
            same_site: crate::config::SameSite::Strict,
            ..CookieConfig::default()
        };
        let cookie = build_set_cookie(&config, "v");
        assert!(cookie.contains("; Domain=example.com"));
        assert!(cookie.contains("; Secure"));
        assert!(!cookie.contains("; HttpOnly"));
        assert!(cookie.ends_with("; SameSite=Strict"));
    }

    #[test]
    fn test_cookie_value_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "other=1; stats_id=?abc; trailing=2".parse().unwrap(),
        );
        assert_eq!(cookie_value(&headers, "stats_id").as_deref(), Some("?abc"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn test_loggable_filter() {
        assert!(is_loggable(200, "text/html"));
        assert!(is_loggable(200, "Text/HTML; charset=utf-8"));
        assert!(is_loggable(200, "application/rss+xml"));
        assert!(is_loggable(200, "application/atom+xml; charset=utf-8"));
        assert!(!is_loggable(200, "application/json"));
        assert!(!is_loggable(404, "text/html"));
        assert!(!is_loggable(301, "text/html"));
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Example.COM:8443"), "example.com");
        assert_eq!(normalize_host("example.com"), "example.com");
        assert_eq!(normalize_host("[::1]:8080"), "::1");
        assert!(!normalize_host("example.com:80").contains(':'));
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("1.2.3.4:5678"), "1.2.3.4");
        assert_eq!(strip_port("1.2.3.4"), "1.2.3.4");
        assert_eq!(strip_port("::1"), "::1");
        assert_eq!(strip_port("[2001:db8::1]:443"), "2001:db8::1");
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let peer: SocketAddr = "10.0.0.1:4321".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4, 10.0.0.9".parse().unwrap());
        assert_eq!(client_ip(&headers, peer), "1.2.3.4");

        let empty = HeaderMap::new();
        assert_eq!(client_ip(&empty, peer), "10.0.0.1");
    }

    #[test]
    fn test_dashboard_request_matching() {
        let mut config = ProxyConfig::default();
        config.dashboard_path = "/stats".into();
        assert!(is_dashboard_request(&config, "/stats"));
        assert!(is_dashboard_request(&config, "/stats/favicon.ico"));
        assert!(!is_dashboard_request(&config, "/stats/other"));
        assert!(!is_dashboard_request(&config, "/"));

        config.dashboard_path = String::new();
        assert!(!is_dashboard_request(&config, "/stats"));
    }

    #[test]
    fn test_bearer_matching() {
        assert!(bearer_matches("Bearer secret", "secret"));
        assert!(!bearer_matches("Bearer wrong", "secret"));
        assert!(!bearer_matches("secret", "secret"));
        assert!(!bearer_matches("", "secret"));
    }

    #[test]
    fn test_synthesized_event_shape() {
        let peer: SocketAddr = "10.0.0.1:4321".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "Example.COM:8080".parse().unwrap());
        headers.insert(header::USER_AGENT, "curl/8.0".parse().unwrap());
        headers.insert(header::REFERER, "https://ref.example/".parse().unwrap());
        let uri: axum::http::Uri = "/page?q=1".parse().unwrap();
        let cookie_state = read_cookie_state(Some("abc"));

        let event = synthesize_event(&headers, &uri, peer, "text/html", &cookie_state);
        assert_eq!(event.host, "example.com");
        assert_eq!(event.path, "/page");
        assert_eq!(event.query, "q=1");
        assert_eq!(event.ip, "10.0.0.1");
        assert_eq!(event.user_agent, "curl/8.0");
        assert_eq!(event.referrer, "https://ref.example/");
        assert_eq!(event.uniq, "abc");
        assert!(event.set_cookie.is_empty());
        assert!(!event.second_visit);
        assert_eq!(event.event_id.len(), 36);
    }
}
