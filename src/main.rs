//! Idmap Middleware
//!
//! Identity-mapping control plane for a storage appliance. Wires the
//! domain store, client session, and cache synchronizer over the
//! in-memory adapters (standalone mode) and serves the REST API plus
//! health and metrics endpoints.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use idmap_middleware::persistence::{MemoryCacheTable, MemoryDatastore, MemorySecretStore};
use idmap_middleware::services::{
    MemoryAccountRegistry, MemoryDaemonRegistry, StaticCertificateStore,
    StaticDirectoryServices, StaticLdapClient,
};
use idmap_middleware::{
    CacheSynchronizer, ClientSession, DomainStore, Error, LoopbackDaemon, RestRouter, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Idmap Middleware - Identity-Mapping Control Plane
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// SMB workgroup name of the local server
    #[arg(long, env = "WORKGROUP", default_value = "WORKGROUP")]
    workgroup: String,

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
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Idmap Middleware - Identity-Mapping Control Plane");
    info!("  Version: {}", idmap_middleware::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Workgroup: {}", args.workgroup);

    // Collaborator adapters (standalone mode)
    let datastore = Arc::new(MemoryDatastore::new());
    let directory = Arc::new(StaticDirectoryServices::new(&args.workgroup));
    let certificates = Arc::new(StaticCertificateStore::new());
    let secrets = Arc::new(MemorySecretStore::new());
    let ldap = Arc::new(StaticLdapClient::new());
    let registry = Arc::new(MemoryDaemonRegistry::new());
    let accounts = Arc::new(MemoryAccountRegistry::new());
    let daemon = LoopbackDaemon::started();
    let service_control = daemon.service_control();

    let session = ClientSession::new(daemon.clone(), service_control.clone(), accounts);
    let sync = CacheSynchronizer::new(
        datastore.clone(),
        directory.clone(),
        registry,
        service_control,
        Arc::new(MemoryCacheTable::new()),
        Arc::new(MemoryCacheTable::new()),
    );
    let store = DomainStore::new(
        datastore,
        directory,
        certificates,
        secrets,
        ldap,
        session.clone(),
        sync.clone(),
    );

    // The system domains must pre-exist before any range allocation
    store.bootstrap_system_domains().await?;
    sync.synchronize(false).await?;
    info!("System idmap domains seeded and synchronized");

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Serve the REST API
    let router = RestRouter::new(store, session, sync).build();
    let addr: SocketAddr = args
        .api_addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid REST API address: {e}")))?;

    info!("REST API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .await
        .map_err(|e| Error::Internal(format!("API server error: {e}")))?;

    info!("Middleware shutdown complete");
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

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().expect("static directive"))
        .add_directive("tower=warn".parse().expect("static directive"))
        .add_directive("axum=info".parse().expect("static directive"));

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
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ok"))
                    .expect("static response"),
                "/readyz" => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ok"))
                    .expect("static response"),
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .expect("static response"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid health server address: {e}")))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {e}")))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    // Register middleware metrics
    let _ = prometheus::register_gauge!(
        "idmap_domains_total",
        "Total number of configured idmap domains"
    );
    let _ = prometheus::register_counter!(
        "idmap_synchronize_total",
        "Total number of daemon configuration synchronizations"
    );
    let _ = prometheus::register_counter!(
        "idmap_cache_clears_total",
        "Total number of forced daemon cache clears"
    );
    let _ = prometheus::register_histogram!(
        "idmap_bulk_conversion_duration_seconds",
        "Duration of bulk SID/ID conversions"
    );

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                        error!("Failed to encode metrics: {}", e);
                    }

                    Response::builder()
                        .status(StatusCode::OK)
                        .header("Content-Type", encoder.format_type())
                        .body(Body::from(buffer))
                        .expect("static response")
                }
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .expect("static response"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {e}")))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {e}")))?;

    Ok(())
}
