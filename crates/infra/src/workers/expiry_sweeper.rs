//! Timer-driven expiry sweep.
//!
//! Runs `ReservationManager::sweep_expired` every interval on its own thread.
//! The sweep goes through the same conditional reservation transitions as
//! shoppers do, so no extra locking is needed here.

use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use nutrishop_events::{EventBus, EventEnvelope};

use crate::checkout::ReservationManager;
use crate::event_store::EventStore;

use super::projection_worker::WorkerHandle;

#[derive(Debug)]
pub struct ExpirySweeper;

impl ExpirySweeper {
    /// Spawn the sweep loop. The first pass runs immediately.
    pub fn spawn<S, B>(
        name: &'static str,
        manager: Arc<ReservationManager<S, B>>,
        interval: Duration,
    ) -> io::Result<WorkerHandle>
    where
        S: EventStore + 'static,
        B: EventBus<EventEnvelope<JsonValue>> + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || sweep_loop(name, &manager, interval, shutdown_rx))?;

        info!(worker = name, interval_ms = interval.as_millis() as u64, "expiry sweeper started");
        Ok(WorkerHandle::new(shutdown_tx, join))
    }
}

fn sweep_loop<S, B>(
    name: &'static str,
    manager: &ReservationManager<S, B>,
    interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
) where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    loop {
        match manager.sweep_expired() {
            Ok(report) if report.released > 0 || report.failed > 0 => {
                info!(
                    worker = name,
                    released = report.released,
                    released_quantity = report.released_quantity,
                    failed = report.failed,
                    "expired reservations swept"
                );
            }
            Ok(_) => debug!(worker = name, "nothing to sweep"),
            Err(err) => warn!(worker = name, error = %err, "expiry sweep failed"),
        }

        match shutdown_rx.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    info!(worker = name, "expiry sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::StockLedger;
    use crate::command_dispatcher::CommandDispatcher;
    use crate::config::CheckoutConfig;
    use crate::event_store::InMemoryEventStore;
    use chrono::{Duration as ChronoDuration, Utc};
    use nutrishop_checkout::ReservationStatus;
    use nutrishop_core::ManualClock;
    use nutrishop_events::InMemoryEventBus;
    use nutrishop_inventory::Sku;
    use std::time::Instant;

    #[test]
    fn sweeper_thread_reclaims_expired_stock() {
        let config = CheckoutConfig::default().with_backoff(Duration::ZERO, Duration::ZERO);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let dispatcher = Arc::new(CommandDispatcher::new(
            InMemoryEventStore::new(),
            InMemoryEventBus::<EventEnvelope<JsonValue>>::new(),
        ));
        let ledger = Arc::new(StockLedger::new(dispatcher, clock.clone(), config.release_retry()));
        let manager = Arc::new(ReservationManager::new(Arc::clone(&ledger), &config).unwrap());

        let sku = Sku::parse("WHEY-1KG").unwrap();
        ledger.register(&sku, "Whey", 5).unwrap();
        let id = manager.open(&sku, 5).unwrap().id_typed();
        clock.advance(ChronoDuration::minutes(16));

        let handle =
            ExpirySweeper::spawn("test-sweeper", Arc::clone(&manager), Duration::from_millis(10))
                .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.get(id).unwrap().status() != ReservationStatus::Released
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();

        assert_eq!(manager.get(id).unwrap().status(), ReservationStatus::Released);
        assert_eq!(ledger.get(&sku).unwrap().quantity_available(), 5);
    }
}
