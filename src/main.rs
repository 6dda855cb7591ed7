use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;

use webhook_gateway::{
    init_tracing, router, EventStore, Gateway, GatewayConfig, HttpSink, InMemoryEventStore,
    SystemClock,
};

#[tokio::main]
async fn main() {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    if config.uses_insecure_secret() {
        tracing::warn!("WEBHOOK_SECRET is the built-in placeholder; set a real secret");
    }

    let store = match open_store(&config).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("failed to open event store: {e}");
            std::process::exit(1);
        }
    };

    let sink = match HttpSink::new(config.delivery_timeout) {
        Ok(sink) => sink,
        Err(e) => {
            tracing::error!("failed to build sink client: {e}");
            std::process::exit(1);
        }
    };

    let listen_addr = config.listen_addr;
    let gateway = Arc::new(Gateway::new(
        config,
        store,
        Arc::new(sink),
        Arc::new(SystemClock),
    ));
    gateway.start().await;

    let listener = match TcpListener::bind(listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind {listen_addr}: {e}");
            gateway.shutdown().await;
            std::process::exit(1);
        }
    };
    tracing::info!(
        addr = %listen_addr,
        forward_url = %gateway.config().forward_url,
        "webhook gateway listening"
    );

    if let Err(e) = axum::serve(listener, router(gateway.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("server error: {e}");
    }

    gateway.shutdown().await;
    tracing::info!("webhook gateway stopped");
}

#[cfg(feature = "postgres")]
async fn open_store(
    config: &GatewayConfig,
) -> Result<Arc<dyn EventStore>, webhook_gateway::StoreError> {
    match &config.database_url {
        Some(url) => {
            let store = webhook_gateway::PostgresEventStore::connect(url).await?;
            tracing::info!("using postgres event store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory event store");
            Ok(Arc::new(InMemoryEventStore::new()))
        }
    }
}

#[cfg(not(feature = "postgres"))]
async fn open_store(
    config: &GatewayConfig,
) -> Result<Arc<dyn EventStore>, webhook_gateway::StoreError> {
    if config.database_url.is_some() {
        tracing::warn!("DATABASE_URL is set but the postgres feature is disabled; events are kept in memory");
    }
    Ok(Arc::new(InMemoryEventStore::new()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
