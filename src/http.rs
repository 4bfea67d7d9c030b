//! HTTP surface: `/write`, `/query`, `/ping`, `/reload`, `/meta`.
//!
//! Filter composition follows the warp style of `server/src/http.rs` in
//! the broader pack (per-endpoint filter functions combined with `.or`,
//! state injected with `warp::any().map`). Status-code semantics are
//! ported from `original_source/service/http.go`.

use std::collections::HashMap;
use std::convert::Infallible;
use std::io::Read as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flate2::read::GzDecoder;
use tracing::{debug, error};
use warp::http::{HeaderMap, Method, StatusCode};
use warp::{Filter, Rejection, Reply};

use crate::config::ProxyConfig;
use crate::config_source::ConfigSource;
use crate::errors::RouterError;
use crate::router::Router;

const VERSION_HEADER: &str = "X-Influxdb-Version";
const VERSION: &str = "0.9";

pub struct HttpServiceState {
    pub router: Arc<Router>,
    pub source: Arc<dyn ConfigSource>,
    pub db: String,
    /// Per-request ceiling standing in for `original_source/main.go`'s
    /// `http.Server.IdleTimeout`: warp's server builder has no equivalent
    /// knob, so the timeout is applied around each handler's work instead
    /// of at the connection-keepalive level.
    pub idle_timeout: Duration,
    pub write_tracing: bool,
    pub query_tracing: bool,
}

impl HttpServiceState {
    pub fn new(router: Arc<Router>, source: Arc<dyn ConfigSource>, proxy: &ProxyConfig) -> Self {
        HttpServiceState {
            router,
            source,
            db: proxy.db.clone(),
            idle_timeout: Duration::from_secs(proxy.idle_timeout_secs),
            write_tracing: proxy.write_tracing,
            query_tracing: proxy.query_tracing,
        }
    }
}

fn with_state(
    state: Arc<HttpServiceState>,
) -> impl Filter<Extract = (Arc<HttpServiceState>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&state))
}

/// Builds the full set of routes served at `proxy.listen_addr`.
pub fn routes(state: Arc<HttpServiceState>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    write_route(state.clone())
        .or(query_route(state.clone()))
        .or(ping_route())
        .or(reload_route(state.clone()))
        .or(meta_route(state))
        .with(warp::log("cyclotron::http"))
}

fn write_route(
    state: Arc<HttpServiceState>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path("write")
        .and(warp::post())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::header::optional::<String>("content-encoding"))
        .and(warp::body::bytes())
        .and(warp::addr::remote())
        .and(with_state(state))
        .and_then(handle_write)
}

async fn handle_write(
    params: HashMap<String, String>, content_encoding: Option<String>, body: Bytes, remote_addr: Option<SocketAddr>,
    state: Arc<HttpServiceState>,
) -> Result<impl Reply, Rejection> {
    if !state.db.is_empty() {
        if params.get("db").map(String::as_str) != Some(state.db.as_str()) {
            return Ok(with_version_header(warp::reply::with_status("database not exist.", StatusCode::NOT_FOUND)));
        }
    }

    let decoded = if content_encoding.as_deref() == Some("gzip") {
        match gunzip(&body) {
            Ok(d) => d,
            Err(_) => {
                return Ok(with_version_header(warp::reply::with_status(
                    "unable to decode gzip body",
                    StatusCode::BAD_REQUEST,
                )))
            },
        }
    } else {
        body.to_vec()
    };

    let reply = match tokio::time::timeout(state.idle_timeout, state.router.write(&decoded)).await {
        Ok(()) => with_version_header(warp::reply::with_status("", StatusCode::NO_CONTENT)),
        Err(_) => with_version_header(warp::reply::with_status(
            "write timed out",
            StatusCode::SERVICE_UNAVAILABLE,
        )),
    };

    if state.write_tracing {
        debug!(
            body = %String::from_utf8_lossy(&decoded),
            client = ?remote_addr,
            "write body received by handler",
        );
    }

    Ok(reply)
}

fn query_route(
    state: Arc<HttpServiceState>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path("query")
        .and(warp::method())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::query::raw().or(warp::any().map(String::new)).unify())
        .and(warp::header::headers_cloned())
        .and(warp::body::bytes())
        .and(warp::addr::remote())
        .and(with_state(state))
        .and_then(handle_query)
}

async fn handle_query(
    method: Method, params: HashMap<String, String>, raw_query: String, headers: HeaderMap, body: Bytes,
    remote_addr: Option<SocketAddr>, state: Arc<HttpServiceState>,
) -> Result<impl Reply, Rejection> {
    if !state.db.is_empty() {
        if params.get("db").map(String::as_str) != Some(state.db.as_str()) {
            return Ok(with_version_header(warp::reply::with_status(
                Bytes::from_static(b"database not exist."),
                StatusCode::NOT_FOUND,
            )));
        }
    }

    let q = params.get("q").map(String::as_str).unwrap_or("").trim();

    let outcome = tokio::time::timeout(state.idle_timeout, state.router.query(method, q, &raw_query, body, headers)).await;

    let reply = match outcome {
        Ok(Ok(resp)) => {
            if state.query_tracing {
                debug!(query = %q, client = ?remote_addr, "query served by handler");
            }
            let mut reply = warp::reply::with_status(Bytes::from(resp.body), resp.status).into_response();
            *reply.headers_mut() = resp.headers;
            reply
                .headers_mut()
                .insert(VERSION_HEADER, warp::http::HeaderValue::from_static(VERSION));
            reply
        },
        Ok(Err(e)) => {
            let (status, message) = map_router_error(&e);
            error!(error = %e, query = %q, client = ?remote_addr, "query error");
            with_version_header(warp::reply::with_status(Bytes::from(message.into_bytes()), status)).into_response()
        },
        Err(_) => {
            error!(query = %q, client = ?remote_addr, "query timed out");
            with_version_header(warp::reply::with_status(
                Bytes::from_static(b"query timed out"),
                StatusCode::SERVICE_UNAVAILABLE,
            ))
            .into_response()
        },
    };

    Ok(reply)
}

fn map_router_error(e: &RouterError) -> (StatusCode, String) {
    match e {
        RouterError::Forbidden => (StatusCode::BAD_REQUEST, "query forbidden".to_string()),
        RouterError::IllegalQl => (StatusCode::BAD_REQUEST, "can't get measurement".to_string()),
        RouterError::BackendMiss => (StatusCode::BAD_REQUEST, "unknown measurement".to_string()),
        RouterError::DispatchFailed => (StatusCode::BAD_REQUEST, "query error".to_string()),
    }
}

fn ping_route() -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path("ping")
        .and(warp::method())
        .and_then(|method: Method| async move {
            if !matches!(method, Method::GET | Method::HEAD) {
                return Ok(with_version_header(warp::reply::with_status("", StatusCode::METHOD_NOT_ALLOWED)));
            }
            Ok(with_version_header(warp::reply::with_status("Pong", StatusCode::OK)))
        })
}

fn reload_route(
    state: Arc<HttpServiceState>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path("reload").and(warp::post()).and(with_state(state)).and_then(handle_reload)
}

async fn handle_reload(state: Arc<HttpServiceState>) -> Result<impl Reply, Rejection> {
    match state.router.reload(state.source.as_ref()).await {
        Ok(()) => Ok(with_version_header(warp::reply::with_status("", StatusCode::NO_CONTENT))),
        Err(e) => Ok(with_version_header(warp::reply::with_status(
            e.to_string(),
            StatusCode::INTERNAL_SERVER_ERROR,
        ))),
    }
}

fn meta_route(
    state: Arc<HttpServiceState>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path("meta").and(warp::get()).and(with_state(state)).and_then(handle_meta)
}

async fn handle_meta(state: Arc<HttpServiceState>) -> Result<impl Reply, Rejection> {
    let snapshot = state.router.metadata_snapshot().await;
    Ok(with_version_header(warp::reply::json(&snapshot)))
}

fn with_version_header(reply: impl Reply) -> warp::reply::Response {
    let mut response = reply.into_response();
    response
        .headers_mut()
        .insert(VERSION_HEADER, warp::http::HeaderValue::from_static(VERSION));
    response
}

fn gunzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(body);
    let mut out = Vec::with_capacity(body.len() * 2);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
