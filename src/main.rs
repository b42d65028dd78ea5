// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use clap::Parser;
use dadns::{
    api,
    backends::BackendRegistry,
    catalog::Catalog,
    config::Config,
    peer_sync::PeerSyncWorker,
    pipeline::WorkerManager,
    reconciler::{HealDeps, ReconcilerWorker},
    state::AppState,
};
use tracing::{debug, error, info, warn};

/// Worker threads for the Tokio runtime.
const TOKIO_WORKER_THREADS: usize = 4;

/// Grace period for draining in-flight HTTP requests on shutdown.
const HTTP_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// DNS control-plane bridge: accepts zone pushes from control panels and
/// replicates them across authoritative DNS backends.
#[derive(Parser, Debug)]
#[command(name = "dadns", version, about)]
struct Cli {
    /// Path to the configuration file (default: search app.yaml on the
    /// standard paths)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Build Tokio runtime with custom thread names
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(TOKIO_WORKER_THREADS)
        .thread_name("dadns-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

/// Initialize logging with custom format
///
/// Respects `RUST_LOG` environment variable if set, otherwise falls back
/// to the configured `log_level`. Respects `RUST_LOG_FORMAT` environment
/// variable for output format (json or text).
fn initialize_logging(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));

    let log_format = std::env::var("RUST_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .with_ansi(true)
                .compact()
                .init();
        }
    }

    info!("Starting DaDNS server initialization");
    debug!(timezone = %config.timezone, "Logging initialized");
}

async fn async_main() -> Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(Config::load(cli.config.as_deref())?);
    initialize_logging(&config);

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        debug!("rustls crypto provider already installed");
    }

    // Backend registry: every enabled instance that passes its
    // availability probe.
    let registry = Arc::new(BackendRegistry::from_config(&config.dns).await);
    info!(backends = ?registry.names(), "Available backend instances");

    let catalog = match Catalog::open(&config.datastore).await {
        Ok(catalog) => catalog,
        Err(e) => {
            error!(error = %e, "Database connection failed");
            return Err(e);
        }
    };
    info!("Database connected");

    // Dispatch pipeline
    let workers = Arc::new(WorkerManager::new(
        std::path::Path::new(&config.queue_location),
        catalog.clone(),
        registry.clone(),
    )?);
    workers.start();
    info!(queue_root = %config.queue_location, "Worker manager started");

    // Reconciler, with the heal pass wired to the pipeline and backends
    let reconciler = Arc::new(ReconcilerWorker::new(
        config.reconciliation.clone(),
        catalog.clone(),
        workers.delete_queue(),
        Some(HealDeps { save_queue: workers.save_queue(), registry: registry.clone() }),
    )?);
    reconciler.clone().start();

    // Peer sync; shares nothing with the reconciler but the catalog
    let peer_sync = Arc::new(PeerSyncWorker::new(config.peer_sync.clone(), catalog.clone())?);
    peer_sync.clone().start();

    let state = AppState {
        config: config.clone(),
        catalog,
        registry,
        workers: workers.clone(),
        reconciler: reconciler.clone(),
        peer_sync: peer_sync.clone(),
    };
    let app = api::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.app.listen_port));
    let handle = Handle::new();
    tokio::spawn(shutdown_watcher(handle.clone()));

    info!(port = config.app.listen_port, ssl = config.app.ssl_enable, "Server starting");
    if config.app.ssl_enable {
        let tls = load_tls_config(&config).await?;
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("HTTPS server failed")?;
    } else {
        axum_server::bind(addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("HTTP server failed")?;
    }

    info!("HTTP server drained, stopping workers");
    reconciler.stop().await;
    peer_sync.stop().await;
    workers.stop().await;
    info!("Shutdown complete");
    Ok(())
}

/// Build the rustls config from `app.ssl_cert`/`ssl_key`, appending the CA
/// bundle to the certificate chain when one is configured.
async fn load_tls_config(config: &Config) -> Result<RustlsConfig> {
    let (Some(cert_path), Some(key_path)) = (&config.app.ssl_cert, &config.app.ssl_key) else {
        anyhow::bail!("app.ssl_enable is set but ssl_cert/ssl_key are not configured");
    };

    let mut cert = tokio::fs::read(cert_path)
        .await
        .with_context(|| format!("reading TLS certificate {cert_path}"))?;
    if let Some(bundle_path) = &config.app.ssl_bundle {
        let bundle = tokio::fs::read(bundle_path)
            .await
            .with_context(|| format!("reading TLS bundle {bundle_path}"))?;
        cert.extend_from_slice(b"\n");
        cert.extend_from_slice(&bundle);
    }
    let key = tokio::fs::read(key_path)
        .await
        .with_context(|| format!("reading TLS key {key_path}"))?;

    RustlsConfig::from_pem(cert, key).await.context("building TLS configuration")
}

/// Trigger a graceful HTTP drain on SIGINT/SIGTERM.
async fn shutdown_watcher(handle: Handle) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install SIGINT handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    warn!("Shutdown signal received, draining HTTP connections");
    handle.graceful_shutdown(Some(HTTP_SHUTDOWN_GRACE));
}
