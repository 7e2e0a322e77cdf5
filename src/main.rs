use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::{LoggingConfig, StoreBackend, TollgateConfig};
use tollgate::error::TollgateError;
use tollgate::http::{service_router, HttpServer, IntrospectionState, PolicyGuard};
use tollgate::ratelimit::{
    AdmissionEngine, Clock, MemoryStore, RetentionSweeper, SystemClock, UsageService, WindowStore,
};

/// Fixed-window admission control service.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = TollgateConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.http_addr {
        config.server.http_addr = addr;
    }

    init_tracing(&config.logging);

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.store.backend,
        default_policy = %config.rate_limiting.default_policy,
        "Configuration loaded"
    );

    let store = build_store(&config).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let sweeper = RetentionSweeper::spawn(
        store.clone(),
        clock.clone(),
        config.store.retention(),
        config.store.sweep_interval(),
    );

    let engine = Arc::new(
        AdmissionEngine::new(store.clone())
            .with_clock(clock.clone())
            .with_operation_timeout(config.store.operation_timeout()),
    );

    let catalog = Arc::new(config.policy_catalog()?);
    info!(policies = ?catalog.names(), "Policy catalog ready");

    let guard = PolicyGuard::new(
        engine,
        catalog.require(&config.rate_limiting.default_policy)?,
    )
    .trust_proxy(config.server.trust_proxy);

    let introspection = IntrospectionState::new(
        Arc::new(UsageService::new(store.clone(), clock)),
        store,
        catalog,
        config.rate_limiting.default_policy.clone(),
    )
    .recent_limit(config.rate_limiting.stats_recent_limit)
    .trust_proxy(config.server.trust_proxy);

    let router = service_router(introspection, guard);

    let server = HttpServer::bind(config.server.http_addr, router).await?;
    info!(addr = %server.local_addr()?, "Listening");

    server.serve_with_shutdown(shutdown_signal()).await?;

    sweeper.shutdown().await;

    info!("Tollgate stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_store(config: &TollgateConfig) -> Result<Arc<dyn WindowStore>, TollgateError> {
    match config.store.backend {
        StoreBackend::Memory => {
            info!("Using in-process window store");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            use tollgate::ratelimit::store::{RedisStore, RedisStoreConfig};

            let url = config
                .store
                .redis_url
                .as_deref()
                .ok_or_else(|| TollgateError::Config("store.redis_url is not set".to_string()))?;

            let store = RedisStore::connect_with_config(
                url,
                RedisStoreConfig {
                    key_prefix: config.store.key_prefix.clone(),
                    retention: config.store.retention(),
                },
            )
            .await
            .map_err(|e| TollgateError::Config(format!("Failed to connect to Redis: {}", e)))?;

            info!("Using Redis window store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => Err(TollgateError::Config(
            "the redis backend requires building with the `redis` feature".to_string(),
        )),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
