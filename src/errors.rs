//! Error taxonomy shared across the proxy.
//!
//! Every subsystem gets its own enum; call boundaries convert between them
//! with `?` rather than stuffing every variant into one giant error type.

use thiserror::Error;

/// Errors from `RemoteClient` write/query calls against a single backend.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The peer rejected the payload outright (HTTP 400). The payload is
    /// poison: caller drops it rather than retrying.
    #[error("backend rejected payload as malformed")]
    BadRequest,

    /// The peer doesn't recognize the target database (HTTP 404). Caller
    /// drops the payload; this is a configuration fault, not a data fault.
    #[error("backend reports unknown database")]
    NotFound,

    /// Anything else: non-2xx status, timeout, connection failure. Caller
    /// spools the payload for later retry.
    #[error("transient backend failure: {0}")]
    Transient(String),
}

/// Errors from `SpoolFile` operations.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("spool integrity error: {0}")]
    Corrupt(String),

    #[error("spool io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by `BackendPipeline::write`.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The pipeline is draining or closed; the write was not accepted.
    #[error("pipeline is closed")]
    Closed,
}

/// Errors from query validation and dispatch in `Router`.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("query forbidden")]
    Forbidden,

    #[error("illegal query")]
    IllegalQl,

    #[error("unknown measurement")]
    BackendMiss,

    #[error("query error")]
    DispatchFailed,
}

/// Errors while loading metadata from a `ConfigSource`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config source transient error: {0}")]
    Transient(String),

    #[error("invalid configuration value for {0}")]
    InvalidParameter(String),

    #[error("referenced backend {0} does not exist")]
    UnknownBackend(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("(de)serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Fatal-only errors: a pipeline/backend could not be constructed at all,
/// e.g. the spool failed to open at pipeline creation time.
#[derive(Debug, Error)]
pub enum CreationError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("failed to open spool: {0}")]
    Spool(#[from] SpoolError),

    #[error("missing required pool/backend: {0}")]
    MissingResource(String),
}
