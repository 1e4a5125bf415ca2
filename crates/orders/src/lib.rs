//! Orders domain module (event-sourced).
//!
//! This crate contains business rules for storefront orders, implemented purely
//! as deterministic domain logic (no IO, no storage).

pub mod order;

pub use order::{
    CancelOrder, ConfirmOrder, Order, OrderCancelled, OrderCommand, OrderConfirmed, OrderEvent,
    OrderId, OrderItem, OrderPlaced, OrderStatus, PlaceOrder, ORDER_AGGREGATE_TYPE,
};
