use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use booking_settlement::api::{self, AppState};
use booking_settlement::config::AppConfig;
use booking_settlement::database::booking_repository::{
    BookingRepository, InMemoryBookingRepository, PayeeDirectory, PgBookingRepository,
};
use booking_settlement::database::ledger::Ledger;
use booking_settlement::database::memory_ledger::MemoryLedger;
use booking_settlement::database::pg_ledger::PgLedger;
use booking_settlement::database::webhook_inbox::{
    MemoryWebhookInbox, PgWebhookInbox, WebhookInbox,
};
use booking_settlement::database::{init_pool_from_config, run_migrations};
use booking_settlement::health::HealthChecker;
use booking_settlement::logging::init_tracing_with;
use booking_settlement::payments::MpesaGateway;
use booking_settlement::services::notification::{LogSink, NotificationDispatcher};
use booking_settlement::services::{
    OrchestratorDeps, SettlementOrchestrator, WebhookProcessor,
};
use booking_settlement::workers::notification_dispatch::NotificationWorkerPool;
use booking_settlement::workers::timeout_sweep::{TimeoutSweepConfig, TimeoutSweepWorker};
use booking_settlement::workers::webhook_retry::WebhookRetryWorker;

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

struct Stores {
    ledger: Arc<dyn Ledger>,
    inbox: Arc<dyn WebhookInbox>,
    bookings: Arc<dyn BookingRepository>,
    payees: Arc<dyn PayeeDirectory>,
    pool: Option<sqlx::PgPool>,
}

async fn init_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    let Some(database) = &config.database else {
        warn!("Using in-memory ledger and bookings (SKIP_EXTERNALS=true)");
        let bookings = Arc::new(InMemoryBookingRepository::new());
        return Ok(Stores {
            ledger: Arc::new(MemoryLedger::new()),
            inbox: Arc::new(MemoryWebhookInbox::new()),
            bookings: bookings.clone(),
            payees: bookings,
            pool: None,
        });
    };

    info!("Initializing database connection pool...");
    let pool = init_pool_from_config(database).await.map_err(|e| {
        error!("Failed to initialize database pool: {}", e);
        e
    })?;
    if database.run_migrations {
        run_migrations(&pool).await?;
    }
    info!(
        max_connections = pool.options().get_max_connections(),
        "Database connection pool initialized"
    );

    let bookings = Arc::new(PgBookingRepository::new(pool.clone()));
    Ok(Stores {
        ledger: Arc::new(PgLedger::new(pool.clone())),
        inbox: Arc::new(PgWebhookInbox::new(pool.clone())),
        bookings: bookings.clone(),
        payees: bookings,
        pool: Some(pool),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing_with(&config.logging);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        "Starting booking settlement service"
    );

    let stores = init_stores(&config).await?;
    let gateway = Arc::new(MpesaGateway::new(config.mpesa.clone())?);
    let (notifications, notification_rx) =
        NotificationDispatcher::new(config.workers.notification_queue_capacity);

    let orchestrator = Arc::new(
        SettlementOrchestrator::new(
            OrchestratorDeps {
                ledger: stores.ledger,
                bookings: stores.bookings,
                payees: stores.payees,
                collections: gateway.clone(),
                disbursements: gateway,
                notifications,
            },
            config.settlement.clone(),
        )
        .with_market(config.mpesa.currency.clone(), config.mpesa.country_code.clone()),
    );
    let webhook_processor = Arc::new(WebhookProcessor::new(stores.inbox, orchestrator.clone()));

    // Background workers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker_handles = NotificationWorkerPool::new(
        notification_rx,
        Arc::new(LogSink),
        config.workers.notification_workers,
    )
    .spawn(shutdown_rx.clone());

    let sweep = TimeoutSweepWorker::new(
        orchestrator.clone(),
        TimeoutSweepConfig::from(&config.workers),
    );
    worker_handles.push(tokio::spawn(sweep.run(shutdown_rx.clone())));

    let retry = WebhookRetryWorker::new(
        webhook_processor.clone(),
        config.workers.webhook_retry_interval,
        config.workers.webhook_max_retries,
    );
    worker_handles.push(tokio::spawn(retry.run(shutdown_rx)));

    let app = api::router(AppState {
        orchestrator,
        webhooks: webhook_processor,
        callback_token: config.mpesa.callback_token.clone(),
        health: HealthChecker::new(stores.pool),
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(address = %addr, error = %e, "Failed to bind server address");
        e
    })?;
    info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(shutdown_tx.clone()))
        .await?;

    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Worker task ended abnormally");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
