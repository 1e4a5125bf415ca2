//! Inventory domain module (event-sourced).
//!
//! Business rules for per-SKU stock counters, implemented purely as
//! deterministic domain logic (no IO, no storage).

pub mod stock;

pub use stock::{
    RegisterSku, ReleaseStock, ReserveStock, Restock, Sku, SkuRegistered, StockCommand,
    StockEvent, StockRecord, StockReleased, StockReserved, StockRestocked, STOCK_AGGREGATE_TYPE,
};
