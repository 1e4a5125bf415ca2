//! Standalone expiry sweeper.
//!
//! Connects to the Postgres event store and releases abandoned reservations
//! on a fixed interval until interrupted.

use std::sync::Arc;

use anyhow::Context;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use tokio::runtime::Handle;
use tracing::info;

use nutrishop_core::SystemClock;
use nutrishop_events::{EventEnvelope, InMemoryEventBus};
use nutrishop_infra::event_store::PostgresEventStore;
use nutrishop_infra::workers::ExpirySweeper;
use nutrishop_infra::{CheckoutConfig, CommandDispatcher, ReservationManager, StockLedger};

const DEFAULT_POOL_SIZE: u32 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    nutrishop_observability::init();

    let config = CheckoutConfig::from_env().context("invalid checkout configuration")?;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(DEFAULT_POOL_SIZE)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresEventStore::new(pool, Handle::current());
    store.migrate().await.context("event store migration failed")?;

    // Nothing subscribes here; published envelopes are dropped.
    let bus = InMemoryEventBus::<EventEnvelope<JsonValue>>::new();
    let dispatcher = Arc::new(CommandDispatcher::new(store, bus));
    let ledger = Arc::new(StockLedger::new(
        dispatcher,
        Arc::new(SystemClock),
        config.release_retry(),
    ));
    let manager = Arc::new(ReservationManager::new(ledger, &config)?);

    let sweeper = ExpirySweeper::spawn("expiry-sweeper", manager, config.sweep_interval)
        .context("failed to start expiry sweeper")?;

    info!(
        reservation_ttl_secs = config.reservation_ttl.as_secs(),
        sweep_interval_secs = config.sweep_interval.as_secs(),
        "sweeper running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    // Joining the worker blocks until its current pass finishes.
    tokio::task::spawn_blocking(move || sweeper.shutdown())
        .await
        .context("sweeper shutdown panicked")?;

    Ok(())
}
