//! Turns committed reservations into orders.
//!
//! The order id is derived from the reservation set, so retrying `finalize`
//! after a crash or timeout lands on the same order stream instead of placing
//! a second order. Each reservation is marked consumed by that order before
//! the order is placed, so a hold backs at most one order.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

use nutrishop_checkout::{ReleaseReason, Reservation, ReservationId, ReservationStatus};
use nutrishop_core::{Clock, DomainError};
use nutrishop_events::{EventBus, EventEnvelope};
use nutrishop_orders::{
    CancelOrder, ConfirmOrder, Order, OrderCommand, OrderId, OrderItem, PlaceOrder,
    ORDER_AGGREGATE_TYPE,
};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::{EventStore, StoredEvent};
use crate::retry::RetryPolicy;

use super::error::CheckoutError;
use super::reservation_manager::ReservationManager;

pub struct OrderFinalizer<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    reservations: Arc<ReservationManager<S, B>>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl<S, B> OrderFinalizer<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(reservations: Arc<ReservationManager<S, B>>, retry: RetryPolicy) -> Self {
        let ledger = reservations.ledger();
        Self {
            dispatcher: Arc::clone(ledger.dispatcher()),
            clock: Arc::clone(ledger.clock()),
            reservations,
            retry,
        }
    }

    /// Place a Pending order from committed reservations.
    ///
    /// If any reservation is not committed (or already belongs to another
    /// order) the checkout is incomplete: the ones still active are released
    /// and `IncompleteCheckout` is returned. Finalizing the same set again
    /// returns the existing order.
    pub fn finalize(&self, reservation_ids: &[ReservationId]) -> Result<Order, CheckoutError> {
        let mut seen = HashSet::new();
        let ids: Vec<ReservationId> = reservation_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();
        if ids.is_empty() {
            return Err(CheckoutError::Rejected(DomainError::validation(
                "cannot finalize without reservations",
            )));
        }

        let order_id = OrderId::for_reservations(&ids);
        let existing = self.load(order_id)?;
        if existing.exists() {
            info!(order_id = %order_id, "order already finalized");
            return Ok(existing);
        }

        let mut committed: Vec<Reservation> = Vec::with_capacity(ids.len());
        let mut not_committed = Vec::new();
        let mut still_active = Vec::new();
        for id in &ids {
            match self.reservations.get(*id) {
                Ok(r) if is_available_to(&r, order_id) => committed.push(r),
                Ok(r) => {
                    if r.status() == ReservationStatus::Active {
                        still_active.push(*id);
                    }
                    not_committed.push(*id);
                }
                Err(CheckoutError::UnknownReservation(_)) => not_committed.push(*id),
                Err(other) => return Err(other),
            }
        }

        if !not_committed.is_empty() {
            let released = self.release_siblings(&still_active);
            warn!(
                order_id = %order_id,
                not_committed = not_committed.len(),
                released = released.len(),
                "checkout incomplete"
            );
            return Err(CheckoutError::IncompleteCheckout {
                not_committed,
                released,
            });
        }

        let items = committed
            .iter()
            .map(|r| -> Result<OrderItem, CheckoutError> {
                let sku = r.sku().cloned().ok_or_else(|| {
                    CheckoutError::Rejected(DomainError::invariant("committed reservation has no sku"))
                })?;
                Ok(OrderItem {
                    reservation_id: r.id_typed(),
                    sku,
                    quantity: r.quantity(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut claimed = Vec::with_capacity(committed.len());
        for r in &committed {
            let id = r.id_typed();
            match self.reservations.consume(id, order_id.0) {
                Ok(true) => claimed.push(id),
                Ok(false) => {}
                Err(err) => {
                    self.revert_claims(order_id, &claimed);
                    return Err(match err {
                        // Another order took it between our read and our claim.
                        CheckoutError::Rejected(DomainError::Conflict(_)) => {
                            warn!(order_id = %order_id, reservation_id = %id, "reservation taken by another order");
                            CheckoutError::IncompleteCheckout {
                                not_committed: vec![id],
                                released: Vec::new(),
                            }
                        }
                        other => other,
                    });
                }
            }
        }

        let command = OrderCommand::PlaceOrder(PlaceOrder {
            order_id,
            items,
            occurred_at: self.clock.now(),
        });
        match self.execute(order_id, command) {
            Ok(_) => {
                info!(order_id = %order_id, reservations = ids.len(), "order placed");
            }
            // A concurrent finalize of the same set got there first.
            Err(DispatchError::Concurrency(_))
            | Err(DispatchError::Domain(DomainError::Conflict(_))) => {
                info!(order_id = %order_id, "order placed concurrently");
            }
            Err(other) => {
                self.revert_claims(order_id, &claimed);
                return Err(self.map_error(order_id, "place_order", other));
            }
        }

        self.get(order_id)
    }

    /// Pending → Confirmed, once payment and shipping acknowledge.
    pub fn confirm(&self, order_id: OrderId) -> Result<Order, CheckoutError> {
        let committed = self.retrying("confirm_order", order_id, |occurred_at| {
            OrderCommand::ConfirmOrder(ConfirmOrder {
                order_id,
                occurred_at,
            })
        })?;
        if !committed.is_empty() {
            info!(order_id = %order_id, "order confirmed");
        }
        self.get(order_id)
    }

    /// Pending or Confirmed → Cancelled, returning every item's stock.
    ///
    /// Only the caller whose cancellation was recorded returns stock; a second
    /// cancel is rejected.
    pub fn cancel(&self, order_id: OrderId) -> Result<Order, CheckoutError> {
        self.retrying("cancel_order", order_id, |occurred_at| {
            OrderCommand::CancelOrder(CancelOrder {
                order_id,
                occurred_at,
            })
        })?;

        let order = self.get(order_id)?;
        let mut first_failure = None;
        for item in order.items() {
            if let Err(err) = self.reservations.ledger().release(&item.sku, item.quantity) {
                error!(
                    order_id = %order_id,
                    sku = %item.sku,
                    quantity = item.quantity,
                    error = %err,
                    "order cancelled but stock was not returned"
                );
                first_failure.get_or_insert(err);
            }
        }
        if let Some(err) = first_failure {
            return Err(err.into());
        }

        info!(order_id = %order_id, items = order.items().len(), "order cancelled");
        Ok(order)
    }

    pub fn get(&self, order_id: OrderId) -> Result<Order, CheckoutError> {
        let order = self.load(order_id)?;
        if !order.exists() {
            return Err(CheckoutError::UnknownOrder(order_id));
        }
        Ok(order)
    }

    fn load(&self, order_id: OrderId) -> Result<Order, CheckoutError> {
        Ok(self.dispatcher.load(order_id.0, |_| Order::empty(order_id))?)
    }

    fn revert_claims(&self, order_id: OrderId, claimed: &[ReservationId]) {
        for id in claimed {
            if let Err(err) = self.reservations.revert_consumption(*id, order_id.0) {
                error!(
                    order_id = %order_id,
                    reservation_id = %id,
                    error = %err,
                    "could not hand reservation back after failed finalize"
                );
            }
        }
    }

    fn release_siblings(&self, still_active: &[ReservationId]) -> Vec<ReservationId> {
        let mut released = Vec::with_capacity(still_active.len());
        for id in still_active {
            match self
                .reservations
                .release_with_reason(*id, ReleaseReason::IncompleteCheckout)
            {
                Ok((_, true)) => released.push(*id),
                Ok((_, false)) => {}
                Err(err) => {
                    warn!(reservation_id = %id, error = %err, "could not release sibling reservation");
                }
            }
        }
        released
    }

    fn retrying(
        &self,
        operation: &'static str,
        order_id: OrderId,
        command: impl Fn(chrono::DateTime<chrono::Utc>) -> OrderCommand,
    ) -> Result<Vec<StoredEvent>, CheckoutError> {
        self.retry
            .run(
                operation,
                |_| self.execute(order_id, command(self.clock.now())),
                DispatchError::is_concurrency,
            )
            .map_err(|e| self.map_error(order_id, operation, e))
    }

    fn execute(
        &self,
        order_id: OrderId,
        command: OrderCommand,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        self.dispatcher
            .dispatch(order_id.0, ORDER_AGGREGATE_TYPE, command, |_| {
                Order::empty(order_id)
            })
    }

    fn map_error(&self, order_id: OrderId, operation: &'static str, err: DispatchError) -> CheckoutError {
        match err {
            DispatchError::Domain(DomainError::NotFound) => CheckoutError::UnknownOrder(order_id),
            DispatchError::Concurrency(_) => CheckoutError::Conflict {
                operation,
                attempts: self.retry.max_attempts,
            },
            other => other.into(),
        }
    }
}

/// Committed, or already consumed by this same order (a retried finalize).
fn is_available_to(reservation: &Reservation, order_id: OrderId) -> bool {
    match reservation.status() {
        ReservationStatus::Committed => true,
        ReservationStatus::Consumed => reservation.consumed_by() == Some(order_id.0),
        _ => false,
    }
}
