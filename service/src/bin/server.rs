//! Registration service.
//!
//! Consumes registration change requests from Redpanda and applies them to
//! `PostgreSQL` with capacity control.

use anyhow::Context;
use registration_postgres::{PoolSettings, PostgresRegistrationStore};
use registration_redpanda::RedpandaRequestSource;
use registration_service::{Config, RequestConsumer, RequestDispatcher, metrics};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "info,registration=debug,sqlx=warn";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = Config::from_env();
    init_tracing(config.json_logs());

    info!("Starting registration service");
    info!(
        redpanda_brokers = %config.redpanda.brokers,
        topic = %config.redpanda.topic,
        consumer_group = %config.redpanda.consumer_group,
        max_in_flight = config.dispatch.max_in_flight,
        request_timeout_ms = config.dispatch.request_timeout_ms,
        "Configuration loaded"
    );

    if config.server.metrics_enabled {
        let addr: SocketAddr = format!("{}:{}", config.server.metrics_host, config.server.metrics_port)
            .parse()
            .context("Invalid metrics listen address")?;
        metrics::install_prometheus(addr).context("Failed to start metrics exporter")?;
    } else {
        metrics::register_metrics();
    }

    info!("Connecting to registration database...");
    let store = PostgresRegistrationStore::connect_with(
        &config.database.url,
        PoolSettings {
            max_connections: config.database.max_connections,
            min_connections: config.database.min_connections,
            acquire_timeout: config.connect_timeout(),
        },
    )
    .await
    .context("Failed to connect to PostgreSQL")?;
    info!("Database connected");

    if config.database.run_migrations {
        store.migrate().await.context("Failed to run migrations")?;
        info!("Migrations applied");
    }

    let source = build_request_source(&config).context("Failed to configure Redpanda source")?;

    let dispatcher = RequestDispatcher::new(Arc::new(store)).with_request_timeout(config.request_timeout());

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let consumer = RequestConsumer::new("registration-requests", Arc::new(source), dispatcher, shutdown_rx)
        .with_retry_delay(config.retry_delay())
        .with_max_in_flight(config.dispatch.max_in_flight)
        .spawn();

    info!("Registration service running");
    shutdown_signal().await;

    let _ = shutdown_tx.send(());
    match tokio::time::timeout(config.shutdown_timeout(), consumer).await {
        Ok(Ok(())) => info!("Consumer stopped cleanly"),
        Ok(Err(e)) => error!(error = %e, "Consumer task failed"),
        Err(_) => warn!(
            timeout_secs = config.server.shutdown_timeout,
            "Consumer did not stop in time; unacknowledged requests will be redelivered"
        ),
    }

    info!("Registration service stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn build_request_source(config: &Config) -> Result<RedpandaRequestSource, registration_core::transport::TransportError> {
    let redpanda = &config.redpanda;
    let mut builder = RedpandaRequestSource::builder()
        .brokers(&redpanda.brokers)
        .topic(&redpanda.topic)
        .consumer_group(&redpanda.consumer_group)
        .auto_offset_reset(&redpanda.auto_offset_reset)
        .session_timeout_ms(redpanda.session_timeout_ms)
        .buffer_size(redpanda.buffer_size)
        .security_protocol(&redpanda.security_protocol);

    if let (Some(mechanism), Some(username), Some(password)) = (
        &redpanda.sasl_mechanism,
        &redpanda.sasl_username,
        &redpanda.sasl_password,
    ) {
        builder = builder.sasl(mechanism, username, password);
    }

    builder.build()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
