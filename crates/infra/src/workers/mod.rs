//! Background worker threads.

pub mod expiry_sweeper;
pub mod projection_worker;

pub use expiry_sweeper::ExpirySweeper;
pub use projection_worker::{ProjectionWorker, WorkerHandle};
