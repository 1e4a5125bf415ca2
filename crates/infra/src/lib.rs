//! Infrastructure layer: event stores, command dispatch, checkout services,
//! background workers, and read models.

pub mod checkout;
pub mod command_dispatcher;
pub mod config;
pub mod event_store;
pub mod projections;
pub mod read_model;
pub mod retry;
pub mod workers;


pub use checkout::{
    CheckoutError, LedgerError, OrderFinalizer, ReservationManager, StockLedger, SweepReport,
};
pub use command_dispatcher::{CommandDispatcher, DispatchError};
pub use config::{CheckoutConfig, ConfigError};
