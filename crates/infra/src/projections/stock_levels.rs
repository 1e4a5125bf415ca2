use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use nutrishop_core::AggregateId;
use nutrishop_events::EventEnvelope;
use nutrishop_inventory::{Sku, StockEvent, STOCK_AGGREGATE_TYPE};

use crate::read_model::ReadStore;

/// Queryable stock level for the admin console.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub sku: Sku,
    pub name: String,
    pub quantity_available: u64,
    /// Stream version this row reflects.
    pub version: u64,
}

#[derive(Debug, Error)]
pub enum StockLevelsProjectionError {
    #[error("failed to deserialize stock event: {0}")]
    Deserialize(String),

    #[error("event does not belong to its stream: {0}")]
    StreamMismatch(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Stock levels projection.
///
/// Consumes published envelopes and maintains one row per SKU. Envelopes for
/// other aggregate types are ignored, so it can sit on the shared bus.
/// Rows are disposable and rebuildable from the event store.
#[derive(Debug)]
pub struct StockLevelsProjection<S>
where
    S: ReadStore<Sku, StockLevel>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> StockLevelsProjection<S>
where
    S: ReadStore<Sku, StockLevel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, sku: &Sku) -> Option<StockLevel> {
        self.store.get(sku)
    }

    /// All rows, ordered by SKU.
    pub fn list(&self) -> Vec<StockLevel> {
        let mut rows = self.store.list();
        rows.sort_by(|a, b| a.sku.cmp(&b.sku));
        rows
    }

    /// Apply a published envelope.
    ///
    /// Idempotent for at-least-once delivery: anything at or below the
    /// stream's cursor is ignored.
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), StockLevelsProjectionError> {
        if envelope.aggregate_type() != STOCK_AGGREGATE_TYPE {
            return Ok(());
        }

        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        let Ok(mut cursors) = self.cursors.write() else {
            return Ok(());
        };
        let last = cursors.get(&aggregate_id).copied().unwrap_or(0);

        if seq == 0 {
            return Err(StockLevelsProjectionError::NonMonotonicSequence { last, found: seq });
        }
        if seq <= last {
            // Duplicate or replay.
            return Ok(());
        }
        if last != 0 && seq != last + 1 {
            // The first event seen may start mid-stream; after that, no gaps.
            return Err(StockLevelsProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let event: StockEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| StockLevelsProjectionError::Deserialize(e.to_string()))?;

        let sku = event.sku().clone();
        if sku.stream_id() != aggregate_id {
            return Err(StockLevelsProjectionError::StreamMismatch(format!(
                "sku {sku} does not map to aggregate {aggregate_id}"
            )));
        }

        let mut row = self.store.get(&sku).unwrap_or_else(|| StockLevel {
            sku: sku.clone(),
            name: String::new(),
            quantity_available: 0,
            version: 0,
        });
        match event {
            StockEvent::SkuRegistered(e) => {
                row.name = e.name;
                row.quantity_available = e.initial_quantity;
            }
            StockEvent::StockReserved(e) => {
                row.quantity_available = row.quantity_available.saturating_sub(e.quantity);
            }
            StockEvent::StockReleased(e) => {
                row.quantity_available = row.quantity_available.saturating_add(e.quantity);
            }
            StockEvent::StockRestocked(e) => {
                row.quantity_available = row.quantity_available.saturating_add(e.quantity);
            }
        }
        row.version = seq;
        self.store.upsert(sku, row);

        cursors.insert(aggregate_id, seq);
        Ok(())
    }

    /// Rebuild from scratch by replaying envelopes.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), StockLevelsProjectionError> {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.clear();
        }
        self.store.clear();

        let mut envs: Vec<_> = envelopes.into_iter().collect();
        envs.sort_by_key(|e| (e.aggregate_id(), e.sequence_number()));

        for env in &envs {
            self.apply_envelope(env)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_model::InMemoryReadStore;
    use chrono::Utc;
    use nutrishop_events::Event;
    use nutrishop_inventory::{SkuRegistered, StockReserved};
    use uuid::Uuid;

    fn envelope(seq: u64, event: StockEvent) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            event.sku().stream_id(),
            STOCK_AGGREGATE_TYPE,
            event.event_type(),
            seq,
            serde_json::to_value(&event).unwrap(),
        )
    }

    fn registered(sku: &Sku, qty: u64) -> StockEvent {
        StockEvent::SkuRegistered(SkuRegistered {
            sku: sku.clone(),
            name: "Whey".to_string(),
            initial_quantity: qty,
            occurred_at: Utc::now(),
        })
    }

    fn reserved(sku: &Sku, qty: u64) -> StockEvent {
        StockEvent::StockReserved(StockReserved {
            sku: sku.clone(),
            quantity: qty,
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn duplicates_are_ignored() {
        let projection = StockLevelsProjection::new(InMemoryReadStore::new());
        let sku = Sku::parse("WHEY-1KG").unwrap();

        let first = envelope(1, registered(&sku, 5));
        let second = envelope(2, reserved(&sku, 2));
        projection.apply_envelope(&first).unwrap();
        projection.apply_envelope(&second).unwrap();
        projection.apply_envelope(&second).unwrap();

        let row = projection.get(&sku).unwrap();
        assert_eq!(row.quantity_available, 3);
        assert_eq!(row.version, 2);
        assert_eq!(row.name, "Whey");
    }

    #[test]
    fn gaps_are_rejected() {
        let projection = StockLevelsProjection::new(InMemoryReadStore::new());
        let sku = Sku::parse("WHEY-1KG").unwrap();

        projection.apply_envelope(&envelope(1, registered(&sku, 5))).unwrap();
        let err = projection
            .apply_envelope(&envelope(3, reserved(&sku, 1)))
            .unwrap_err();
        assert!(matches!(
            err,
            StockLevelsProjectionError::NonMonotonicSequence { last: 1, found: 3 }
        ));
    }

    #[test]
    fn other_aggregate_types_are_ignored() {
        let projection = StockLevelsProjection::new(InMemoryReadStore::new());
        let foreign = EventEnvelope::new(
            Uuid::now_v7(),
            AggregateId::new(),
            "orders.order",
            "orders.order.placed",
            1,
            serde_json::json!({}),
        );
        projection.apply_envelope(&foreign).unwrap();
        assert!(projection.list().is_empty());
    }

    #[test]
    fn rebuild_replays_in_stream_order() {
        let projection = StockLevelsProjection::new(InMemoryReadStore::new());
        let sku = Sku::parse("WHEY-1KG").unwrap();
        projection.apply_envelope(&envelope(1, registered(&sku, 100))).unwrap();

        projection
            .rebuild_from_scratch(vec![
                envelope(2, reserved(&sku, 1)),
                envelope(1, registered(&sku, 5)),
            ])
            .unwrap();

        assert_eq!(projection.get(&sku).unwrap().quantity_available, 4);
    }
}
