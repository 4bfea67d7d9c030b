//! `RemoteClient` — HTTP client to one TSDB backend.
//!
//! Grounded in `original_source/backend/backends.go`'s `HttpBackend` usage
//! (`WriteCompressed`, `IsActive`, `Query`); built on `reqwest` rather than
//! Go's `net/http`, whose per-host connection pooling `reqwest::Client`
//! already provides.

use std::io::Read as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flate2::read::GzEncoder;
use flate2::Compression;
use http::{HeaderMap, Method, StatusCode};

use crate::config::BackendConfig;
use crate::errors::RemoteError;

/// A streamed-through query response: status, headers, body.
pub struct QueryResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// One TSDB backend's connection: write, query, and liveness.
pub struct RemoteClient {
    http: reqwest::Client,
    url: String,
    db: String,
    zone: String,
    write_only: bool,
    request_timeout: Duration,
    query_timeout: Duration,
    active: Arc<AtomicBool>,
}

impl RemoteClient {
    pub fn new(cfg: &BackendConfig) -> Self {
        RemoteClient {
            http: reqwest::Client::new(),
            url: cfg.url.trim_end_matches('/').to_string(),
            db: cfg.db.clone(),
            zone: cfg.zone.clone(),
            write_only: cfg.write_only,
            request_timeout: Duration::from_millis(cfg.request_timeout_ms),
            query_timeout: Duration::from_millis(cfg.query_timeout_ms),
            // Backends start out believed active; the first failed probe
            // or write will flip this down.
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn is_write_only(&self) -> bool {
        self.write_only
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// POSTs a pre-gzipped write batch to `{url}/write?db={db}`.
    pub async fn write_compressed(&self, gzip_bytes: Bytes) -> Result<(), RemoteError> {
        let resp = self
            .http
            .post(format!("{}/write", self.url))
            .query(&[("db", self.db.as_str())])
            .header("Content-Encoding", "gzip")
            .timeout(self.request_timeout)
            .body(gzip_bytes)
            .send()
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::BAD_REQUEST => Err(RemoteError::BadRequest),
            StatusCode::NOT_FOUND => Err(RemoteError::NotFound),
            s => Err(RemoteError::Transient(format!("unexpected status {s}"))),
        }
    }

    /// Forwards a query request to the backend and streams the response
    /// through unchanged. Only a transport-level failure (connect, timeout,
    /// body read) becomes `Err`; any response the backend actually sent,
    /// success or not, is relayed to the caller as-is.
    pub async fn query(
        &self, method: Method, query_params: &str, body: Bytes, headers: HeaderMap,
    ) -> Result<QueryResponse, RemoteError> {
        let url = format!("{}/query?{}", self.url, query_params);
        let mut req = self
            .http
            .request(method, url)
            .timeout(self.query_timeout)
            .headers(headers);
        if !body.is_empty() {
            req = req.body(body);
        }

        let resp = req.send().await.map_err(|e| RemoteError::Transient(e.to_string()))?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(|e| RemoteError::Transient(e.to_string()))?;

        Ok(QueryResponse { status, headers, body })
    }

    /// HEAD/GET `/ping`; updates `active`. Never returns an error — a
    /// failed probe is recorded as inactive, not propagated.
    pub async fn ping(&self) {
        let url = format!("{}/ping", self.url);
        let result = self.http.head(&url).timeout(self.request_timeout).send().await;
        let healthy = match result {
            Ok(resp) if resp.status() == StatusCode::METHOD_NOT_ALLOWED => self
                .http
                .get(&url)
                .timeout(self.request_timeout)
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false),
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        };
        self.active.store(healthy, Ordering::Relaxed);
    }

    /// Spawns the background health prober, ticking every
    /// `health_check_interval_ms`. Runs until `cancel` fires.
    pub fn spawn_prober(
        self: &Arc<Self>, interval: Duration, cancel: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => client.ping().await,
                }
            }
        })
    }
}

/// Gzip-compresses a write batch. Returns a `Bytes` ready for
/// `write_compressed` or `SpoolFile::append`.
pub fn gzip_compress(payload: &[u8]) -> std::io::Result<Bytes> {
    let mut encoder = GzEncoder::new(payload, Compression::default());
    let mut out = Vec::with_capacity(payload.len() / 2);
    encoder.read_to_end(&mut out)?;
    Ok(Bytes::from(out))
}


#[cfg(test)]
mod proptests {
    use flate2::read::GzDecoder;
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn gzip_compress_round_trips_arbitrary_payloads(payload in prop::collection::vec(any::<u8>(), 0..4096)) {
            let compressed = gzip_compress(&payload).unwrap();
            let mut decoder = GzDecoder::new(&compressed[..]);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).unwrap();
            prop_assert_eq!(out, payload);
        }
    }
}
