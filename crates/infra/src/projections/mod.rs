//! Projection implementations (read model builders).
//!
//! Projections consume published envelopes and build query-optimized read
//! models. All projections are:
//! - **Rebuildable**: can be reconstructed from the event store
//! - **Idempotent**: safe for at-least-once delivery

pub mod stock_levels;

pub use stock_levels::{StockLevel, StockLevelsProjection, StockLevelsProjectionError};
