// bin/agency.rs - Agency Server Binary

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use ssi_agency::notifications::{FlagStore, MemoryFlagStore, SledFlagStore};
use ssi_agency::observability::{
    MetricsConfig, TracingConfig, TracingFormat, init_metrics, init_tracing,
};
use ssi_agency::{
    Agency, AgencyConfig, IdentityProvider, LocalIdentityProvider, MemoryStorage,
    NotificationBackend, Notifier, SledStorage, Storage, StorageBackend, WebhookDispatcher, server,
};

/// SSI Agency
#[derive(Parser, Debug)]
#[command(name = "agency")]
#[command(author = "SavageS")]
#[command(version)]
#[command(about = "Store-and-forward relay for DID-addressed agent messaging", long_about = None)]
struct Args {
    /// Config file path (TOML); `AGENCY__*` environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides the configured one)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (pretty, compact, json)
    #[arg(long, default_value = "pretty")]
    log_format: TracingFormat,

    /// Enable metrics server
    #[arg(long)]
    metrics: bool,

    /// Metrics listen address
    #[arg(long, default_value = "0.0.0.0:9090")]
    metrics_addr: SocketAddr,
}

fn load_config(path: Option<&PathBuf>) -> Result<AgencyConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path.as_path()));
    }
    builder = builder.add_source(config::Environment::with_prefix("AGENCY").separator("__"));

    builder
        .build()
        .context("failed to build configuration")?
        .try_deserialize()
        .context("failed to deserialize configuration")
}

fn open_storage(config: &AgencyConfig) -> Result<Arc<dyn Storage>> {
    Ok(match (config.storage.backend, &config.storage.path) {
        (StorageBackend::Memory, _) => Arc::new(MemoryStorage::new()),
        (StorageBackend::Sled, Some(path)) => {
            info!(path = ?path, "Opening storage");
            Arc::new(SledStorage::open(path)?)
        }
        (StorageBackend::Sled, None) => {
            warn!("No storage path configured, using a temporary database");
            Arc::new(SledStorage::in_memory()?)
        }
    })
}

fn open_identity(config: &AgencyConfig) -> Result<Arc<dyn IdentityProvider>> {
    Ok(match &config.identity.path {
        Some(path) => {
            info!(path = ?path, "Opening wallet vault");
            Arc::new(LocalIdentityProvider::open_vault(path)?)
        }
        None => {
            warn!("No wallet vault configured, wallets will not survive a restart");
            Arc::new(LocalIdentityProvider::in_memory()?)
        }
    })
}

fn open_notifier(config: &AgencyConfig) -> Result<Notifier> {
    let notifications = &config.notifications;
    let store: Option<Arc<dyn FlagStore>> = match (notifications.backend, &notifications.path) {
        (NotificationBackend::Disabled, _) => None,
        (NotificationBackend::Memory, _) => Some(Arc::new(MemoryFlagStore::new())),
        (NotificationBackend::Sled, Some(path)) => Some(Arc::new(SledFlagStore::open(path)?)),
        (NotificationBackend::Sled, None) => Some(Arc::new(SledFlagStore::in_memory()?)),
    };
    if store.is_none() {
        warn!("Notifications disabled, long-polls will answer 409");
    }
    Ok(Notifier::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let tracing_config = TracingConfig {
        filter: format!("{},ssi_agency={}", args.log_level, args.log_level),
        format: args.log_format,
        with_span_events: args.log_level == "trace" || args.log_level == "debug",
        with_file: args.log_level == "debug" || args.log_level == "trace",
        with_target: true,
        with_ansi: args.log_format != TracingFormat::Json,
    };
    init_tracing(&tracing_config)?;

    let mut config = load_config(args.config.as_ref())?;
    if let Some(listen) = args.listen {
        config.listen_address = listen;
    }

    info!("Starting SSI Agency");
    info!(
        listen = %config.listen_address,
        storage = ?config.storage.backend,
        notifications = ?config.notifications.backend,
        "Configuration loaded"
    );

    // Initialize metrics if enabled
    let _metrics_handle = if args.metrics {
        let metrics_config = MetricsConfig {
            listen_addr: args.metrics_addr,
            ..Default::default()
        };

        match init_metrics(metrics_config) {
            Ok(handle) => {
                info!(addr = %args.metrics_addr, "Metrics recorder initialized");
                Some(handle)
            }
            Err(e) => {
                warn!(error = %e, "Failed to initialize metrics");
                None
            }
        }
    } else {
        None
    };

    let storage = open_storage(&config)?;
    let identity = open_identity(&config)?;
    let notifier = open_notifier(&config)?;
    let webhook = WebhookDispatcher::new(&config.webhook)?;

    let listen_address = config.listen_address.clone();
    let agency = Arc::new(Agency::wire(config, storage, identity, notifier, webhook).await?);
    info!(
        did = %agency.forward_agent_info().did,
        verkey = %agency.forward_agent_info().verkey,
        "Forward Agent"
    );

    let listener = tokio::net::TcpListener::bind(&listen_address)
        .await
        .with_context(|| format!("failed to bind {listen_address}"))?;
    info!("Press Ctrl+C to shutdown");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    if let Err(e) = server::serve(agency, listener, shutdown).await {
        tracing::error!(error = %e, "HTTP server error");
        return Err(e.into());
    }

    info!("Shutting down...");
    Ok(())
}
