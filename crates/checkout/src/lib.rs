//! Checkout domain module (event-sourced).
//!
//! Reservations are short-lived holds on stock taken at checkout start. This
//! crate holds their lifecycle rules; stock movement and timing live in infra.

pub mod reservation;

pub use reservation::{
    CommitReservation, ConsumeReservation, OpenReservation, ReleaseReason, ReleaseReservation,
    Reservation, ReservationCommand, ReservationCommitted, ReservationConsumed,
    ReservationConsumptionReverted, ReservationEvent, ReservationId, ReservationOpened,
    ReservationReleased, ReservationStatus, RevertConsumption, RESERVATION_AGGREGATE_TYPE,
};
