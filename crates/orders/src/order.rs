use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nutrishop_checkout::ReservationId;
use nutrishop_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use nutrishop_events::Event;
use nutrishop_inventory::Sku;

/// Aggregate type tag used for order streams.
pub const ORDER_AGGREGATE_TYPE: &str = "orders.order";

/// Order identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub AggregateId);

impl OrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    /// Deterministic id for the order built from a set of reservations.
    ///
    /// Order-insensitive, so retrying a checkout with the same reservations
    /// addresses the same order stream.
    pub fn for_reservations(reservation_ids: &[ReservationId]) -> Self {
        let mut sorted = reservation_ids.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut key = Vec::with_capacity(sorted.len() * 16);
        for id in &sorted {
            key.extend_from_slice(id.0.as_uuid().as_bytes());
        }
        Self(AggregateId::derived(ORDER_AGGREGATE_TYPE, &key))
    }
}

impl core::fmt::Display for OrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Cancelled,
}

/// Order line: one committed reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub reservation_id: ReservationId,
    pub sku: Sku,
    pub quantity: u64,
}

/// Aggregate root: Order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    id: OrderId,
    status: OrderStatus,
    items: Vec<OrderItem>,
    placed_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl Order {
    /// Create an empty, not-yet-placed aggregate instance for rehydration.
    pub fn empty(id: OrderId) -> Self {
        Self {
            id,
            status: OrderStatus::Pending,
            items: Vec::new(),
            placed_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> OrderId {
        self.id
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn placed_at(&self) -> Option<DateTime<Utc>> {
        self.placed_at
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    pub fn reservation_ids(&self) -> Vec<ReservationId> {
        self.items.iter().map(|i| i.reservation_id).collect()
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: PlaceOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub order_id: OrderId,
    pub items: Vec<OrderItem>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConfirmOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmOrder {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCommand {
    PlaceOrder(PlaceOrder),
    ConfirmOrder(ConfirmOrder),
    CancelOrder(CancelOrder),
}

/// Event: OrderPlaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: OrderId,
    pub items: Vec<OrderItem>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderCancelled.
///
/// Carries the items so consumers can compensate stock without reloading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: OrderId,
    pub items: Vec<OrderItem>,
    pub previous_status: OrderStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    OrderPlaced(OrderPlaced),
    OrderConfirmed(OrderConfirmed),
    OrderCancelled(OrderCancelled),
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderPlaced(_) => "orders.order.placed",
            OrderEvent::OrderConfirmed(_) => "orders.order.confirmed",
            OrderEvent::OrderCancelled(_) => "orders.order.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderPlaced(e) => e.occurred_at,
            OrderEvent::OrderConfirmed(e) => e.occurred_at,
            OrderEvent::OrderCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::OrderPlaced(e) => {
                self.id = e.order_id;
                self.status = OrderStatus::Pending;
                self.items = e.items.clone();
                self.placed_at = Some(e.occurred_at);
                self.created = true;
            }
            OrderEvent::OrderConfirmed(_) => {
                self.status = OrderStatus::Confirmed;
            }
            OrderEvent::OrderCancelled(_) => {
                self.status = OrderStatus::Cancelled;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::PlaceOrder(cmd) => self.handle_place(cmd),
            OrderCommand::ConfirmOrder(cmd) => self.handle_confirm(cmd),
            OrderCommand::CancelOrder(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl Order {
    fn ensure_order_id(&self, order_id: OrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn handle_place(&self, cmd: &PlaceOrder) -> Result<Vec<OrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("order already exists"));
        }
        self.ensure_order_id(cmd.order_id)?;

        if cmd.items.is_empty() {
            return Err(DomainError::validation("cannot place order without items"));
        }
        if cmd.items.iter().any(|i| i.quantity == 0) {
            return Err(DomainError::validation("item quantity must be positive"));
        }

        Ok(vec![OrderEvent::OrderPlaced(OrderPlaced {
            order_id: cmd.order_id,
            items: cmd.items.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_confirm(&self, cmd: &ConfirmOrder) -> Result<Vec<OrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_order_id(cmd.order_id)?;

        match self.status {
            OrderStatus::Pending => Ok(vec![OrderEvent::OrderConfirmed(OrderConfirmed {
                order_id: cmd.order_id,
                occurred_at: cmd.occurred_at,
            })]),
            OrderStatus::Confirmed => Ok(vec![]),
            OrderStatus::Cancelled => Err(DomainError::invariant(
                "cancelled orders cannot be confirmed",
            )),
        }
    }

    fn handle_cancel(&self, cmd: &CancelOrder) -> Result<Vec<OrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_order_id(cmd.order_id)?;

        if self.status == OrderStatus::Cancelled {
            return Err(DomainError::invariant("order is already cancelled"));
        }

        Ok(vec![OrderEvent::OrderCancelled(OrderCancelled {
            order_id: cmd.order_id,
            items: self.items.clone(),
            previous_status: self.status,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_reservation_id() -> ReservationId {
        ReservationId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn item(sku: &str, quantity: u64) -> OrderItem {
        OrderItem {
            reservation_id: test_reservation_id(),
            sku: Sku::parse(sku).unwrap(),
            quantity,
        }
    }

    fn placed(items: Vec<OrderItem>) -> Order {
        let ids: Vec<_> = items.iter().map(|i| i.reservation_id).collect();
        let order_id = OrderId::for_reservations(&ids);
        let mut order = Order::empty(order_id);
        let events = order
            .handle(&OrderCommand::PlaceOrder(PlaceOrder {
                order_id,
                items,
                occurred_at: test_time(),
            }))
            .unwrap();
        order.apply(&events[0]);
        order
    }

    #[test]
    fn order_id_ignores_reservation_order() {
        let a = test_reservation_id();
        let b = test_reservation_id();
        assert_eq!(
            OrderId::for_reservations(&[a, b]),
            OrderId::for_reservations(&[b, a])
        );
        assert_ne!(
            OrderId::for_reservations(&[a]),
            OrderId::for_reservations(&[a, b])
        );
    }

    #[test]
    fn place_order_starts_pending_with_items_in_order() {
        let order = placed(vec![item("WHEY-1KG", 1), item("OMEGA-3", 2)]);
        assert_eq!(order.status(), OrderStatus::Pending);
        let skus: Vec<_> = order.items().iter().map(|i| i.sku.as_str()).collect();
        assert_eq!(skus, vec!["WHEY-1KG", "OMEGA-3"]);
    }

    #[test]
    fn place_order_without_items_is_rejected() {
        let order_id = OrderId::new(AggregateId::new());
        let err = Order::empty(order_id)
            .handle(&OrderCommand::PlaceOrder(PlaceOrder {
                order_id,
                items: vec![],
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn place_twice_is_a_conflict() {
        let order = placed(vec![item("A", 1)]);
        let err = order
            .handle(&OrderCommand::PlaceOrder(PlaceOrder {
                order_id: order.id_typed(),
                items: order.items().to_vec(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn full_lifecycle_pending_to_confirmed_to_cancelled() {
        let mut order = placed(vec![item("A", 3)]);
        let order_id = order.id_typed();

        let events = order
            .handle(&OrderCommand::ConfirmOrder(ConfirmOrder {
                order_id,
                occurred_at: test_time(),
            }))
            .unwrap();
        order.apply(&events[0]);
        assert_eq!(order.status(), OrderStatus::Confirmed);

        let events = order
            .handle(&OrderCommand::CancelOrder(CancelOrder {
                order_id,
                occurred_at: test_time(),
            }))
            .unwrap();
        match &events[0] {
            OrderEvent::OrderCancelled(e) => {
                assert_eq!(e.items, order.items());
                assert_eq!(e.previous_status, OrderStatus::Confirmed);
            }
            _ => panic!("Expected OrderCancelled event"),
        }
        order.apply(&events[0]);
        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert_eq!(order.version(), 3);
    }

    #[test]
    fn cancellation_is_not_reversible() {
        let mut order = placed(vec![item("A", 1)]);
        let order_id = order.id_typed();
        let events = order
            .handle(&OrderCommand::CancelOrder(CancelOrder {
                order_id,
                occurred_at: test_time(),
            }))
            .unwrap();
        order.apply(&events[0]);

        let err = order
            .handle(&OrderCommand::CancelOrder(CancelOrder {
                order_id,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));

        let err = order
            .handle(&OrderCommand::ConfirmOrder(ConfirmOrder {
                order_id,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn handle_does_not_mutate_state() {
        let order = placed(vec![item("A", 1)]);
        let before = order.clone();
        let cmd = OrderCommand::ConfirmOrder(ConfirmOrder {
            order_id: order.id_typed(),
            occurred_at: test_time(),
        });

        let first = order.handle(&cmd).unwrap();
        let second = order.handle(&cmd).unwrap();

        assert_eq!(order, before);
        assert_eq!(first, second);
    }
}
