//! Checkout services: stock ledger, reservations, order finalization.
//!
//! All three share one `CommandDispatcher` and one clock. There is no
//! cross-stream transaction anywhere: each step is a conditional append on a
//! single stream, and a step that follows a successful one compensates when
//! it fails.

pub mod error;
pub mod order_finalizer;
pub mod reservation_manager;
pub mod stock_ledger;

pub use error::{CheckoutError, LedgerError};
pub use order_finalizer::OrderFinalizer;
pub use reservation_manager::{ReservationManager, SweepReport};
pub use stock_ledger::StockLedger;
