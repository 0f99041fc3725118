//! GCS Envelope Proxy - transparent envelope encryption for the Cloud Storage JSON API

use clap::Parser;
use gcs_envelope_proxy::config::{Config, SessionStoreConfig};
use gcs_envelope_proxy::server::{router, ProxyState};
use gcs_envelope_proxy::TransformEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often expired resumable sessions are purged
const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// GCS Envelope Proxy - encrypts objects on upload, decrypts on download
#[derive(Parser, Debug)]
#[command(name = "gcs_envelope_proxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Upstream storage endpoint (overrides config)
    #[arg(short, long, value_name = "URL")]
    upstream: Option<String>,

    /// Bucket key mapping, e.g. "bucket1:key1,*:key2" (overrides config)
    #[arg(short, long, value_name = "MAPPING")]
    key_mapping: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration from file if specified, otherwise use default loading
    let mut config = if let Some(ref path) = cli.config {
        Config::from_file(path)?
    } else {
        Config::load()
    };

    // Initialize tracing
    let log_level = if cli.verbose {
        "gcs_envelope_proxy=trace,tower_http=trace".to_string()
    } else {
        config.log_level.clone()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // CLI overrides
    if let Some(ref addr) = cli.listen {
        config.listen_addr = addr.parse()?;
    }
    if let Some(ref upstream) = cli.upstream {
        config.upstream_endpoint = upstream.clone();
    }
    if let Some(ref mapping) = cli.key_mapping {
        config.kms_bucket_key_mapping = mapping.clone();
    }

    info!("Starting GCS Envelope Proxy");
    info!("  Version: {} (built {})", config.proxy_version, env!("GCSP_BUILD_TIME"));
    info!("  Listen address: {}", config.listen_addr);
    info!("  Upstream: {}", config.upstream_endpoint);
    info!("  Intercepted hosts: {}", config.intercept_hosts.join(", "));
    info!(
        "  Max object size: {} MB",
        config.max_object_size / 1024 / 1024
    );
    info!("  Cipher cache TTL: {}", config.cipher_cache_ttl);
    match &config.session_store {
        SessionStoreConfig::Memory => info!("  Session store: memory"),
        SessionStoreConfig::Filesystem { path } => {
            info!("  Session store: filesystem ({:?})", path)
        }
    }
    if config.encryption_disabled {
        warn!("  Encryption is DISABLED: all traffic is forwarded unmodified");
    }

    let engine = Arc::new(TransformEngine::from_config(&config).await?);

    // Periodically drop resumable sessions that were never completed
    let sessions = Arc::clone(engine.sessions());
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            match sessions.cleanup_expired().await {
                Ok(0) => {}
                Ok(n) => info!("Removed {} expired resumable sessions", n),
                Err(e) => warn!("Session cleanup failed: {}", e),
            }
        }
    });

    let state = Arc::new(ProxyState::new(engine, &config)?);
    let app = router(state, config.max_object_size as usize);

    // Start server with graceful shutdown
    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(
        "GCS Envelope Proxy listening on http://{}",
        config.listen_addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Handle shutdown signals (SIGINT, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
