//! EcoDeli escrow service
//!
//! Main entry point. This binary:
//! - applies the ledger schema
//! - wires the escrow, wallet and withdrawal services
//! - runs the reconciliation monitor until shutdown

use ecodeli_escrow::collaborators::InMemoryDeliveryDirectory;
use ecodeli_escrow::database::{create_pool, run_migrations};
use ecodeli_escrow::services::AuditTrailService;
use ecodeli_escrow::{AppConfig, AppError, AppResult, AppState};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> AppResult<()> {
    // Load environment variables first
    dotenv::dotenv().ok();

    // Load configuration
    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        AppError::Config(e)
    })?;

    // Initialize tracing/logging with config
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("ecodeli_escrow={},sqlx=warn", config.log_level).into()
    });
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("EcoDeli escrow service starting");
    info!("Environment: {}", config.environment);
    info!("Payment mode: {}", config.gateway.mode.as_str());
    info!(
        "Commission rate: {}, minimum escrow: {}, minimum withdrawal: {}",
        config.payment.commission_rate,
        config.payment.min_escrow_amount,
        config.payment.min_withdrawal_amount
    );
    if config.payment.allow_unconfirmed_release {
        warn!("Release from unconfirmed (PENDING) escrows is enabled");
    }

    // =========================================================================
    // DATABASE SETUP
    // =========================================================================
    info!("Connecting to database...");

    let pool = create_pool(&config.database).await.map_err(|e| {
        error!("Failed to create database pool: {}", e);
        AppError::Database(e)
    })?;

    info!("Max connections: {}", config.database.max_connections);

    info!("Running database migrations...");
    run_migrations(&pool, None).await.map_err(|e| {
        error!("Database migration failed: {}", e);
        AppError::Database(e)
    })?;
    info!("Database migrations completed successfully");

    // =========================================================================
    // SERVICES
    // =========================================================================
    if let Err(e) = std::fs::create_dir_all(&config.audit_log_dir) {
        warn!("Could not create audit log directory: {}", e);
    }
    let audit = Arc::new(AuditTrailService::new(config.audit_log_dir.clone()).map_err(|e| {
        error!("Failed to initialize audit trail: {}", e);
        AppError::Message(format!("Audit trail initialization failed: {}", e))
    })?);
    info!("Audit trail: {}", audit.log_file().display());

    // Deliveries are registered by the marketplace embedding this service
    let directory = Arc::new(InMemoryDeliveryDirectory::new());
    let state = AppState::new(pool, &config, directory, Some(audit))?;
    info!(
        "Services initialized (simulated gateway: {})",
        state.gateway.is_simulated()
    );

    // =========================================================================
    // BACKGROUND TASKS
    // =========================================================================
    let monitor = state.reconciliation_monitor(&config);
    let monitor_handle = tokio::spawn(async move {
        monitor.start().await;
    });
    info!(
        "Reconciliation monitor started ({}s interval, stale after {} min)",
        config.reconcile_interval_secs, config.stale_pending_minutes
    );

    info!("Press Ctrl+C to shutdown gracefully");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, shutting down gracefully...");
        }
        _ = monitor_handle => {
            error!("Reconciliation monitor exited unexpectedly");
        }
    }

    info!("EcoDeli escrow service shutdown complete");
    Ok(())
}
