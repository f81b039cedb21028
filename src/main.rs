//! cachewarden
//!
//! Runs the cache runtime as a standalone service.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          cachewarden                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    Cache     │───▶│     Task     │    │   Resource   │       │
//! │  │ Coordinator  │    │  Scheduler   │    │   Governor   │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │         ▲                                                       │
//! │   /healthz  /metrics                                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cachewarden::cache::CacheCoordinator;
use cachewarden::governor::ResourceGovernor;
use cachewarden::health::HealthStatus;
use cachewarden::scheduler::{Detached, TaskScheduler};
use cachewarden::telemetry::RuntimeMetrics;
use cachewarden::RuntimeConfig;

// =============================================================================
// CLI Arguments
// =============================================================================

/// cachewarden - multi-tier cache runtime
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; defaults apply when omitted
    #[arg(long, short, env = "CACHEWARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Metrics server bind address (overrides the config file)
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Health server bind address (overrides the config file)
    #[arg(long, env = "HEALTH_ADDR")]
    health_addr: Option<String>,

    /// Interval between metric refreshes in seconds
    #[arg(long, env = "METRICS_REFRESH_SECONDS", default_value = "15")]
    metrics_refresh_seconds: u64,

    /// Grace period for shutdown in seconds
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECONDS", default_value = "30")]
    shutdown_timeout_seconds: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => RuntimeConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    if let Some(addr) = &args.metrics_addr {
        config.server.metrics_addr = addr.clone();
    }
    if let Some(addr) = &args.health_addr {
        config.server.health_addr = addr.clone();
    }
    config.validate().context("invalid configuration")?;

    info!("Starting cachewarden");
    info!("  Cache backend: {:?}", config.cache.backend);
    info!(
        "  Scheduler workers: {}-{}",
        config.scheduler.min_workers, config.scheduler.max_workers
    );

    let scheduler = TaskScheduler::new(config.scheduler.clone())?;

    let coordinator = config.cache.build_coordinator().await?;
    let executor: Arc<dyn Detached> = scheduler.clone();
    coordinator.set_executor(executor);
    coordinator.start()?;
    if config.warmer.enabled {
        info!("Cache warmer needs an embedding data store; not started by the standalone binary");
    }

    let governor = ResourceGovernor::new(config.governor.clone(), None);

    // Metrics refresh
    let refresh = Duration::from_secs(args.metrics_refresh_seconds.max(1));
    {
        let coordinator = Arc::clone(&coordinator);
        let scheduler = Arc::clone(&scheduler);
        let governor = Arc::clone(&governor);
        tokio::spawn(async move {
            let Some(metrics) = RuntimeMetrics::global() else {
                warn!("Runtime metrics unavailable, refresh loop not started");
                return;
            };
            let mut ticker = tokio::time::interval(refresh);
            loop {
                ticker.tick().await;
                metrics.observe_cache(&coordinator.stats());
                metrics.observe_scheduler(&scheduler.stats());
                metrics.observe_governor(&governor.metrics());
            }
        });
    }

    // Start health server
    let health_addr = config.server.health_addr.clone();
    let health_coordinator = Arc::clone(&coordinator);
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_coordinator).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = config.server.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    let grace = Duration::from_secs(args.shutdown_timeout_seconds);
    coordinator.stop(grace).await;
    if let Err(e) = scheduler.shutdown(grace).await {
        warn!("Scheduler shutdown: {}", e);
    }
    if let Err(e) = governor.shutdown(grace).await {
        warn!("Governor shutdown: {}", e);
    }
    if let Err(e) = coordinator.close().await {
        warn!("Closing cache backend: {}", e);
    }

    info!("cachewarden shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "redis=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// HTTP
// =============================================================================

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

async fn health_handler(
    req: Request<hyper::body::Incoming>,
    coordinator: Arc<CacheCoordinator>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/livez" => respond(StatusCode::OK, "text/plain", "ok"),
        "/healthz" | "/readyz" => {
            let report = coordinator.health_status().await;
            let status = if report.status == HealthStatus::Unhealthy {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            match serde_json::to_vec(&report) {
                Ok(body) => respond(status, "application/json", body),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string(),
                ),
            }
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    };
    Ok(response)
}

async fn metrics_handler(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.uri().path(), RuntimeMetrics::global()) {
        ("/metrics", Some(metrics)) => match metrics.encode() {
            Ok(text) => respond(StatusCode::OK, &metrics.content_type(), text),
            Err(e) => respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                e.to_string(),
            ),
        },
        ("/metrics", None) => respond(
            StatusCode::SERVICE_UNAVAILABLE,
            "text/plain",
            "metrics unavailable",
        ),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    };
    Ok(response)
}

async fn bind(addr: &str, name: &str) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid {} address {}", name, addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {} server on {}", name, addr))?;
    info!("{} server listening on {}", name, addr);
    Ok(listener)
}

async fn run_health_server(addr: &str, coordinator: Arc<CacheCoordinator>) -> anyhow::Result<()> {
    let listener = bind(addr, "Health").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("health server accept error")?;

        let io = TokioIo::new(stream);
        let coordinator = Arc::clone(&coordinator);

        tokio::spawn(async move {
            let service = service_fn(move |req| health_handler(req, Arc::clone(&coordinator)));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

async fn run_metrics_server(addr: &str) -> anyhow::Result<()> {
    let listener = bind(addr, "Metrics").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("metrics server accept error")?;

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
