//! Paymirror API Server
//!
//! Receives provider webhooks and applies them to the billing mirror.

use std::net::SocketAddr;

use paymirror_api::{config::LogFormat, create_router, AppState, Config};
use paymirror_billing::{BillingMirror, EventBus};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing(LogFormat::from_env());

    tracing::info!("Starting Paymirror API Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = paymirror_shared::connect(
        &config.database_url,
        config.database_max_connections,
        config.run_migrations,
    )
    .await?;
    tracing::info!("Database connection established");

    let billing = BillingMirror::from_env(pool.clone(), EventBus::new().with_change_logging())?;
    let (webhooks, consumer) = billing.start_webhooks();
    tracing::info!(
        queue_capacity = webhooks.config().queue_capacity,
        backfill = webhooks.config().backfill,
        "Webhook consumer started"
    );

    let app = create_router(AppState::new(webhooks, Some(pool.clone())));

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // No more requests; apply whatever is still queued
    let handled = consumer.shutdown().await?;
    tracing::info!(handled = handled, "Webhook queue drained");

    pool.close().await;
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,paymirror_billing=debug".into());

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
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
        _ = ctrl_c => tracing::info!("Received ctrl+C signal"),
        _ = terminate => tracing::info!("Received terminate signal"),
    }
}
