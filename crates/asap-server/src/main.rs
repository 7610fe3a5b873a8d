// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use asap_core::Manifest;
use asap_metering::{InMemoryMeteringStore, MeteringStore, SqliteMeteringStore};
use asap_protocol::validate::ValidationConfig;
use asap_server::config::{MeteringBackend, ServerConfig};
use asap_server::{AppState, HandlerRegistry, build_app};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "asap-server", version, about = "ASAP protocol server daemon")]
struct Args {
    /// Bind address; overrides the config file.
    #[arg(long)]
    bind: Option<String>,

    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the agent manifest JSON.
    #[arg(long, default_value = "manifest.json")]
    manifest: PathBuf,

    /// Enable request/response debug detail.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("asap=debug")
    } else {
        EnvFilter::new("asap=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => {
            let mut config = ServerConfig::default();
            config.apply_env_overrides();
            config
        }
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if args.debug {
        config.debug = true;
    }

    let raw_manifest = std::fs::read(&args.manifest)
        .with_context(|| format!("read manifest {}", args.manifest.display()))?;
    let manifest: Manifest =
        serde_json::from_slice(&raw_manifest).context("parse manifest JSON")?;

    let handlers = Arc::new(HandlerRegistry::with_max_threads(config.max_threads));
    if handlers.known_payload_types().is_empty() {
        // The reference daemon exposes transport, discovery, and usage
        // surfaces; payload handlers are registered by the embedding
        // application.
        warn!("no payload handlers registered; asap.send will answer method-not-found");
    }

    let retention = config.metering_retention_seconds.map(Duration::from_secs);
    let metering: Option<Arc<dyn MeteringStore>> = match config.metering {
        MeteringBackend::Disabled => None,
        MeteringBackend::Memory => Some(Arc::new(match retention {
            Some(ttl) => InMemoryMeteringStore::with_retention(ttl),
            None => InMemoryMeteringStore::new(),
        })),
        MeteringBackend::Sqlite => Some(Arc::new(
            SqliteMeteringStore::open_with_retention(&config.metering_db_path, retention)
                .with_context(|| {
                    format!("open metering db {}", config.metering_db_path.display())
                })?,
        )),
    };

    let mut builder = AppState::builder(manifest, handlers)
        .validation(ValidationConfig {
            max_age_seconds: config.max_envelope_age_seconds,
            max_future_seconds: config.max_future_tolerance_seconds,
            require_nonce: config.require_nonce,
        })
        .max_request_size(config.max_request_size)
        .compression_threshold(config.compression_threshold)
        .debug(config.debug)
        .ws_settings(asap_server::WsServerSettings {
            message_rate: config.ws_messages_per_second,
            ..asap_server::WsServerSettings::default()
        });
    if let Some(store) = metering {
        builder = builder.metering(store);
    }
    if let Some(max_requests) = config.rate_limit_requests {
        builder = builder.rate_limit(
            max_requests,
            Duration::from_secs(config.rate_limit_window_seconds),
        );
    }
    let state = builder.build().context("assemble server state")?;

    let app = build_app(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    info!(bind = %config.bind, agent = %state.manifest.id, "asap-server listening");

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received; draining websockets");
            shutdown_state.shutdown_websockets();
        })
        .await
        .context("serve")
}
