//! Per-SKU stock counters.
//!
//! Each SKU is its own event stream, so mutations are atomic per SKU and
//! never span SKUs. The stream version is the optimistic token callers pass
//! back to `reserve`.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{info, warn};

use nutrishop_core::{Clock, ExpectedVersion};
use nutrishop_events::{EventBus, EventEnvelope};
use nutrishop_inventory::{
    RegisterSku, ReleaseStock, ReserveStock, Restock, Sku, StockCommand, StockRecord,
    STOCK_AGGREGATE_TYPE,
};

use crate::command_dispatcher::CommandDispatcher;
use crate::event_store::{EventStore, StoredEvent};
use crate::retry::RetryPolicy;

use super::error::LedgerError;

pub struct StockLedger<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    clock: Arc<dyn Clock>,
    release_retry: RetryPolicy,
}

impl<S, B> StockLedger<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(
        dispatcher: Arc<CommandDispatcher<S, B>>,
        clock: Arc<dyn Clock>,
        release_retry: RetryPolicy,
    ) -> Self {
        Self {
            dispatcher,
            clock,
            release_retry,
        }
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher<S, B>> {
        &self.dispatcher
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Create the stock record for a new SKU (catalog ingestion).
    pub fn register(
        &self,
        sku: &Sku,
        name: &str,
        initial_quantity: u64,
    ) -> Result<StockRecord, LedgerError> {
        let command = StockCommand::RegisterSku(RegisterSku {
            sku: sku.clone(),
            name: name.to_string(),
            initial_quantity,
            occurred_at: self.clock.now(),
        });
        self.execute(sku, ExpectedVersion::Any, command)?;

        info!(sku = %sku, initial_quantity, "sku registered");
        self.get(sku)
    }

    pub fn get(&self, sku: &Sku) -> Result<StockRecord, LedgerError> {
        let owned = sku.clone();
        let record = self
            .dispatcher
            .load(sku.stream_id(), move |_| StockRecord::empty(owned))
            .map_err(|e| LedgerError::from_dispatch(sku, e))?;
        if !record.is_registered() {
            return Err(LedgerError::UnknownSku(sku.clone()));
        }
        Ok(record)
    }

    /// Take `quantity` units if the record is still at `expected_version`.
    ///
    /// Returns the record's new version. Fails `Conflict` on a stale version
    /// and `InsufficientStock` when fewer than `quantity` units are available.
    pub fn reserve(
        &self,
        sku: &Sku,
        quantity: u64,
        expected_version: u64,
    ) -> Result<u64, LedgerError> {
        let command = StockCommand::ReserveStock(ReserveStock {
            sku: sku.clone(),
            quantity,
            occurred_at: self.clock.now(),
        });
        let committed = self.execute(sku, ExpectedVersion::Exact(expected_version), command)?;
        Ok(new_version(&committed, expected_version))
    }

    /// Give `quantity` units back.
    ///
    /// Unconditional: whether the units were really held is tracked by the
    /// caller (reservation or order status), not here. Conflicts with other
    /// writers are retried.
    pub fn release(&self, sku: &Sku, quantity: u64) -> Result<u64, LedgerError> {
        self.increment("release_stock", sku, quantity, |occurred_at| {
            StockCommand::ReleaseStock(ReleaseStock {
                sku: sku.clone(),
                quantity,
                occurred_at,
            })
        })
    }

    /// Add newly received inventory.
    pub fn restock(&self, sku: &Sku, quantity: u64) -> Result<u64, LedgerError> {
        let version = self.increment("restock", sku, quantity, |occurred_at| {
            StockCommand::Restock(Restock {
                sku: sku.clone(),
                quantity,
                occurred_at,
            })
        })?;
        info!(sku = %sku, quantity, version, "sku restocked");
        Ok(version)
    }

    fn increment(
        &self,
        operation: &str,
        sku: &Sku,
        quantity: u64,
        command: impl Fn(chrono::DateTime<chrono::Utc>) -> StockCommand,
    ) -> Result<u64, LedgerError> {
        self.release_retry
            .run(
                operation,
                |_| {
                    let committed =
                        self.execute(sku, ExpectedVersion::Any, command(self.clock.now()))?;
                    Ok(new_version(&committed, 0))
                },
                LedgerError::is_conflict,
            )
            .inspect_err(|e| {
                if e.is_conflict() {
                    warn!(sku = %sku, quantity, operation, "giving up after repeated conflicts");
                }
            })
    }

    fn execute(
        &self,
        sku: &Sku,
        expected: ExpectedVersion,
        command: StockCommand,
    ) -> Result<Vec<StoredEvent>, LedgerError> {
        let owned = sku.clone();
        self.dispatcher
            .dispatch_at(
                sku.stream_id(),
                STOCK_AGGREGATE_TYPE,
                expected,
                command,
                move |_| StockRecord::empty(owned),
            )
            .map_err(|e| LedgerError::from_dispatch(sku, e))
    }
}

fn new_version(committed: &[StoredEvent], fallback: u64) -> u64 {
    committed
        .last()
        .map(StoredEvent::stream_version)
        .unwrap_or(fallback)
}
