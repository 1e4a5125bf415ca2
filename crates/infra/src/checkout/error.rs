use chrono::{DateTime, Utc};
use thiserror::Error;

use nutrishop_checkout::ReservationId;
use nutrishop_core::DomainError;
use nutrishop_inventory::Sku;
use nutrishop_orders::OrderId;

use crate::command_dispatcher::DispatchError;

/// Stock ledger failure.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The record moved past the version the caller decided on.
    #[error("stock record for {sku} changed concurrently: {detail}")]
    Conflict { sku: Sku, detail: String },

    #[error("insufficient stock for {sku} (requested: {requested}, available: {available})")]
    InsufficientStock {
        sku: Sku,
        requested: u64,
        available: u64,
    },

    #[error("unknown sku {0}")]
    UnknownSku(Sku),

    #[error("sku {0} is already registered")]
    AlreadyRegistered(Sku),

    /// The stock record rejected the command for another domain reason.
    #[error("stock command rejected: {0}")]
    Rejected(DomainError),

    #[error(transparent)]
    Dispatch(DispatchError),
}

impl LedgerError {
    pub(crate) fn from_dispatch(sku: &Sku, err: DispatchError) -> Self {
        match err {
            DispatchError::Concurrency(detail) => LedgerError::Conflict {
                sku: sku.clone(),
                detail,
            },
            DispatchError::Domain(DomainError::InsufficientStock {
                requested,
                available,
            }) => LedgerError::InsufficientStock {
                sku: sku.clone(),
                requested,
                available,
            },
            DispatchError::Domain(DomainError::NotFound) => LedgerError::UnknownSku(sku.clone()),
            DispatchError::Domain(DomainError::Conflict(_)) => {
                LedgerError::AlreadyRegistered(sku.clone())
            }
            DispatchError::Domain(other) => LedgerError::Rejected(other),
            other => LedgerError::Dispatch(other),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict { .. })
    }
}

/// Failure of a checkout operation, as seen by storefront callers.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("out of stock: {sku} (requested: {requested}, available: {available})")]
    InsufficientStock {
        sku: Sku,
        requested: u64,
        available: u64,
    },

    #[error("reservation {reservation_id} expired at {expired_at}")]
    Expired {
        reservation_id: ReservationId,
        expired_at: DateTime<Utc>,
    },

    /// Some reservations were not committed; the still-active ones in
    /// `released` were given back.
    #[error("checkout incomplete: {} reservation(s) not committed", not_committed.len())]
    IncompleteCheckout {
        not_committed: Vec<ReservationId>,
        released: Vec<ReservationId>,
    },

    #[error("unknown sku {0}")]
    UnknownSku(Sku),

    #[error("unknown reservation {0}")]
    UnknownReservation(ReservationId),

    #[error("unknown order {0}")]
    UnknownOrder(OrderId),

    /// Concurrent writers kept winning until retries ran out.
    #[error("{operation} still conflicting after {attempts} attempts")]
    Conflict {
        operation: &'static str,
        attempts: u32,
    },

    #[error("rejected: {0}")]
    Rejected(DomainError),

    #[error(transparent)]
    Ledger(LedgerError),

    #[error(transparent)]
    Dispatch(DispatchError),
}

impl CheckoutError {
    /// Shopper-facing text. Out-of-stock and expiry stay distinct so the
    /// storefront can tell "pick something else" from "try again".
    pub fn user_message(&self) -> &'static str {
        match self {
            CheckoutError::InsufficientStock { .. } => {
                "Sorry, this item is out of stock in the quantity you asked for."
            }
            CheckoutError::Expired { .. } => {
                "Your reservation expired, please retry checkout."
            }
            CheckoutError::IncompleteCheckout { .. } => {
                "Some items in your cart were not confirmed, please retry checkout."
            }
            CheckoutError::UnknownSku(_) => "This product is no longer available.",
            CheckoutError::UnknownReservation(_) | CheckoutError::UnknownOrder(_) => {
                "We could not find your checkout, please start again."
            }
            CheckoutError::Conflict { .. } => {
                "The store is busy right now, please try again in a moment."
            }
            CheckoutError::Rejected(_) => "That request could not be completed.",
            CheckoutError::Ledger(_) | CheckoutError::Dispatch(_) => {
                "Something went wrong on our side, please try again."
            }
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CheckoutError::Conflict { .. } | CheckoutError::Dispatch(DispatchError::Concurrency(_))
        )
    }
}

impl From<LedgerError> for CheckoutError {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::InsufficientStock {
                sku,
                requested,
                available,
            } => CheckoutError::InsufficientStock {
                sku,
                requested,
                available,
            },
            LedgerError::UnknownSku(sku) => CheckoutError::UnknownSku(sku),
            other => CheckoutError::Ledger(other),
        }
    }
}

impl From<DispatchError> for CheckoutError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::Domain(err) => CheckoutError::Rejected(err),
            other => CheckoutError::Dispatch(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutrishop_core::AggregateId;

    #[test]
    fn out_of_stock_and_expired_read_differently() {
        let out = CheckoutError::InsufficientStock {
            sku: Sku::parse("WHEY-1KG").unwrap(),
            requested: 3,
            available: 2,
        };
        let expired = CheckoutError::Expired {
            reservation_id: ReservationId::new(AggregateId::new()),
            expired_at: Utc::now(),
        };
        assert_ne!(out.user_message(), expired.user_message());
        assert!(expired.user_message().contains("retry"));
    }

    #[test]
    fn ledger_stock_errors_surface_as_checkout_errors() {
        let sku = Sku::parse("WHEY-1KG").unwrap();
        let err: CheckoutError = LedgerError::from_dispatch(
            &sku,
            DispatchError::Domain(DomainError::insufficient_stock(4, 1)),
        )
        .into();
        assert!(matches!(
            err,
            CheckoutError::InsufficientStock {
                requested: 4,
                available: 1,
                ..
            }
        ));

        let err = LedgerError::from_dispatch(&sku, DispatchError::Concurrency("x".to_string()));
        assert!(err.is_conflict());
    }
}
