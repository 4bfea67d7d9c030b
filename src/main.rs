//! Entry point: CLI parsing, logging bootstrap, config load, and the warp
//! server loop. Ported from `original_source/main.go`'s flag/log/serve
//! sequence, with tracing + tracing-appender standing in for the original's
//! `log` + `lumberjack` rotation.

mod config;
mod config_source;
mod errors;
mod http;
mod pipeline;
mod ql;
mod remote;
mod router;
mod spool;

use std::sync::Arc;

use clap::Parser;
use config::{AppConfig, ConfigSourceSettings};
use config_source::{ConfigSource, FileConfigSource, RedisConfigSource};
use router::Router;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cyclotron", about = "A write/query proxy for a fleet of sharded time-series database backends.")]
struct Cli {
    /// Configuration file (JSON or TOML; see `config` crate docs).
    #[arg(long)]
    config: String,

    /// Log output file. Logs go to stdout when omitted.
    #[arg(long)]
    log_file_path: Option<String>,
}

fn init_tracing(log_file_path: Option<&str>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file_path {
        Some(path) => {
            let parent = std::path::Path::new(path).parent().filter(|p| !p.as_os_str().is_empty());
            let dir = parent.unwrap_or_else(|| std::path::Path::new("."));
            let file_name = std::path::Path::new(path).file_name().unwrap_or_default();
            let file_appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(non_blocking).init();
            Some(guard)
        },
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            None
        },
    }
}

fn build_config_source(settings: &ConfigSourceSettings) -> Result<Arc<dyn ConfigSource>, errors::ConfigError> {
    match settings {
        ConfigSourceSettings::Redis { url, .. } => Ok(Arc::new(RedisConfigSource::new(url)?)),
        ConfigSourceSettings::File { path } => Ok(Arc::new(FileConfigSource::new(path.clone()))),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file_path.as_deref());

    let app_config = match AppConfig::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        },
    };
    tracing::info!("config file loaded");

    let source = match build_config_source(&app_config.config_source) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to construct config source");
            std::process::exit(1);
        },
    };

    let spool_dir = std::path::PathBuf::from("spool");
    let router = match Router::new(&app_config.proxy, Arc::clone(&source), spool_dir).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "failed to load initial cluster configuration");
            std::process::exit(1);
        },
    };

    let state = Arc::new(http::HttpServiceState::new(Arc::clone(&router), source, &app_config.proxy));

    let addr: std::net::SocketAddr = match app_config.proxy.listen_addr.parse() {
        Ok(a) => a,
        Err(e) => {
            tracing::error!(error = %e, addr = %app_config.proxy.listen_addr, "invalid listen address");
            std::process::exit(1);
        },
    };

    let routes = http::routes(state);
    let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, async {
        let _ = tokio::signal::ctrl_c().await;
    });

    tracing::info!(%addr, "proxy service started");
    server.await;

    router.close().await;
}
