//! Short-lived stock holds taken at checkout start.
//!
//! `open` first wins the stock from the ledger, then records the hold in its
//! own reservation stream. Every later status change (commit, release, expiry
//! sweep) is a conditional append on that reservation stream, so exactly one
//! of two racing transitions takes effect.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use nutrishop_checkout::{
    CommitReservation, ConsumeReservation, OpenReservation, ReleaseReason, ReleaseReservation,
    Reservation, ReservationCommand, ReservationId, ReservationStatus, RevertConsumption,
    RESERVATION_AGGREGATE_TYPE,
};
use nutrishop_core::{AggregateId, AggregateRoot, Clock, DomainError};
use nutrishop_events::{EventBus, EventEnvelope};
use nutrishop_inventory::Sku;

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::config::{CheckoutConfig, ConfigError};
use crate::event_store::{EventStore, StoredEvent};
use crate::retry::RetryPolicy;

use super::error::{CheckoutError, LedgerError};
use super::stock_ledger::StockLedger;

/// Outcome of one expiry sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Reservations found active past their deadline.
    pub expired_found: usize,
    /// Reservations this pass moved to released (and whose stock it returned).
    pub released: usize,
    /// Units given back to the ledger.
    pub released_quantity: u64,
    /// Reservations that could not be released this pass; the next pass retries them.
    pub failed: usize,
}

pub struct ReservationManager<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    ledger: Arc<StockLedger<S, B>>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    reserve_retry: RetryPolicy,
    transition_retry: RetryPolicy,
}

impl<S, B> ReservationManager<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Shares the ledger's dispatcher and clock.
    pub fn new(ledger: Arc<StockLedger<S, B>>, config: &CheckoutConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let ttl = chrono::Duration::from_std(config.reservation_ttl)
            .map_err(|e| ConfigError::Invalid(format!("reservation ttl: {e}")))?;

        Ok(Self {
            dispatcher: Arc::clone(ledger.dispatcher()),
            clock: Arc::clone(ledger.clock()),
            ledger,
            ttl,
            reserve_retry: config.reserve_retry(),
            transition_retry: config.release_retry(),
        })
    }

    pub fn ledger(&self) -> &Arc<StockLedger<S, B>> {
        &self.ledger
    }

    /// Hold `quantity` units of `sku` for the configured TTL.
    ///
    /// Version conflicts on the stock record are retried with backoff; if the
    /// record is still contended when attempts run out, the caller is told
    /// the stock is unavailable.
    pub fn open(&self, sku: &Sku, quantity: u64) -> Result<Reservation, CheckoutError> {
        if quantity == 0 {
            return Err(CheckoutError::Rejected(DomainError::validation(
                "quantity must be positive",
            )));
        }

        let reserved = self.reserve_retry.run(
            "reserve_stock",
            |_| {
                let record = self.ledger.get(sku)?;
                self.ledger.reserve(sku, quantity, record.version())
            },
            LedgerError::is_conflict,
        );

        match reserved {
            Ok(version) => debug!(sku = %sku, quantity, version, "stock reserved"),
            Err(err) if err.is_conflict() => {
                let available = self
                    .ledger
                    .get(sku)
                    .map(|r| r.quantity_available())
                    .unwrap_or(0);
                warn!(
                    sku = %sku,
                    quantity,
                    attempts = self.reserve_retry.max_attempts,
                    "stock record still contended, reporting unavailable"
                );
                return Err(CheckoutError::InsufficientStock {
                    sku: sku.clone(),
                    requested: quantity,
                    available,
                });
            }
            Err(err) => return Err(err.into()),
        }

        let reservation_id = ReservationId::new(AggregateId::new());
        let created_at = self.clock.now();
        let command = ReservationCommand::OpenReservation(OpenReservation {
            reservation_id,
            sku: sku.clone(),
            quantity,
            created_at,
            expires_at: created_at + self.ttl,
        });

        if let Err(err) = self.execute(reservation_id, command) {
            // The stock is held but nothing records it: give it back.
            warn!(
                reservation_id = %reservation_id,
                sku = %sku,
                quantity,
                error = %err,
                "recording reservation failed, returning stock"
            );
            if let Err(release_err) = self.ledger.release(sku, quantity) {
                error!(
                    sku = %sku,
                    quantity,
                    error = %release_err,
                    "failed to return stock after aborted reservation"
                );
            }
            return Err(err.into());
        }

        info!(
            reservation_id = %reservation_id,
            sku = %sku,
            quantity,
            expires_at = %(created_at + self.ttl),
            "reservation opened"
        );
        self.get(reservation_id)
    }

    /// Active → Committed. Fails `Expired` once the deadline has passed.
    ///
    /// Committing twice is a no-op.
    pub fn commit(&self, reservation_id: ReservationId) -> Result<Reservation, CheckoutError> {
        let committed = self
            .transition_retry
            .run(
                "commit_reservation",
                |_| {
                    self.execute(
                        reservation_id,
                        ReservationCommand::CommitReservation(CommitReservation {
                            reservation_id,
                            now: self.clock.now(),
                        }),
                    )
                },
                DispatchError::is_concurrency,
            )
            .map_err(|e| self.map_error(reservation_id, "commit_reservation", e))?;

        if !committed.is_empty() {
            info!(reservation_id = %reservation_id, "reservation committed");
        }
        self.get(reservation_id)
    }

    /// Active → Released, then the stock goes back to the ledger.
    ///
    /// No-op for a reservation that is already released or committed.
    pub fn release(&self, reservation_id: ReservationId) -> Result<Reservation, CheckoutError> {
        self.release_with_reason(reservation_id, ReleaseReason::Requested)
            .map(|(reservation, _)| reservation)
    }

    /// Release with an explicit reason; the flag is true when this call made
    /// the transition (and returned the stock).
    pub fn release_with_reason(
        &self,
        reservation_id: ReservationId,
        reason: ReleaseReason,
    ) -> Result<(Reservation, bool), CheckoutError> {
        let committed = self
            .transition_retry
            .run(
                "release_reservation",
                |_| {
                    self.execute(
                        reservation_id,
                        ReservationCommand::ReleaseReservation(ReleaseReservation {
                            reservation_id,
                            reason,
                            now: self.clock.now(),
                        }),
                    )
                },
                DispatchError::is_concurrency,
            )
            .map_err(|e| self.map_error(reservation_id, "release_reservation", e))?;

        let reservation = self.get(reservation_id)?;
        if committed.is_empty() {
            debug!(
                reservation_id = %reservation_id,
                status = ?reservation.status(),
                "release was a no-op"
            );
            return Ok((reservation, false));
        }

        let sku = reservation.sku().cloned().ok_or_else(|| {
            CheckoutError::Rejected(DomainError::invariant("released reservation has no sku"))
        })?;
        if let Err(err) = self.ledger.release(&sku, reservation.quantity()) {
            error!(
                reservation_id = %reservation_id,
                sku = %sku,
                quantity = reservation.quantity(),
                error = %err,
                "reservation released but stock was not returned"
            );
            return Err(err.into());
        }

        info!(
            reservation_id = %reservation_id,
            sku = %sku,
            quantity = reservation.quantity(),
            reason = ?reason,
            "reservation released"
        );
        Ok((reservation, true))
    }

    /// Committed → Consumed by `order_id`.
    ///
    /// True when this call made the transition. Repeating it for the same
    /// order is a no-op; another order gets `Rejected(Conflict)`.
    pub fn consume(
        &self,
        reservation_id: ReservationId,
        order_id: AggregateId,
    ) -> Result<bool, CheckoutError> {
        let committed = self
            .transition_retry
            .run(
                "consume_reservation",
                |_| {
                    self.execute(
                        reservation_id,
                        ReservationCommand::ConsumeReservation(ConsumeReservation {
                            reservation_id,
                            order_id,
                            now: self.clock.now(),
                        }),
                    )
                },
                DispatchError::is_concurrency,
            )
            .map_err(|e| self.map_error(reservation_id, "consume_reservation", e))?;

        if !committed.is_empty() {
            debug!(reservation_id = %reservation_id, order_id = %order_id, "reservation consumed");
        }
        Ok(!committed.is_empty())
    }

    /// Consumed → Committed, for an order that was never placed.
    pub fn revert_consumption(
        &self,
        reservation_id: ReservationId,
        order_id: AggregateId,
    ) -> Result<(), CheckoutError> {
        self.transition_retry
            .run(
                "revert_consumption",
                |_| {
                    self.execute(
                        reservation_id,
                        ReservationCommand::RevertConsumption(RevertConsumption {
                            reservation_id,
                            order_id,
                            now: self.clock.now(),
                        }),
                    )
                },
                DispatchError::is_concurrency,
            )
            .map_err(|e| self.map_error(reservation_id, "revert_consumption", e))?;
        Ok(())
    }

    pub fn get(&self, reservation_id: ReservationId) -> Result<Reservation, CheckoutError> {
        let reservation = self
            .dispatcher
            .load(reservation_id.0, |_| Reservation::empty(reservation_id))?;
        if !reservation.exists() {
            return Err(CheckoutError::UnknownReservation(reservation_id));
        }
        Ok(reservation)
    }

    /// Status as a shopper would see it right now (`Expired` once past the deadline).
    pub fn status(&self, reservation_id: ReservationId) -> Result<ReservationStatus, CheckoutError> {
        Ok(self.get(reservation_id)?.status_at(self.clock.now()))
    }

    /// Release every active reservation whose deadline has passed.
    ///
    /// Each release is the same conditional transition `commit` uses, so a
    /// commit that lands first simply makes the release a no-op.
    pub fn sweep_expired(&self) -> Result<SweepReport, CheckoutError> {
        let now = self.clock.now();
        let ids = self
            .dispatcher
            .store()
            .list_streams(RESERVATION_AGGREGATE_TYPE)
            .map_err(DispatchError::from)?;

        let mut report = SweepReport::default();
        for id in ids {
            let reservation_id = ReservationId::new(id);
            let reservation = match self.get(reservation_id) {
                Ok(r) => r,
                Err(err) => {
                    warn!(reservation_id = %reservation_id, error = %err, "skipping unreadable reservation");
                    report.failed += 1;
                    continue;
                }
            };
            if !reservation.is_past_deadline(now) {
                continue;
            }

            report.expired_found += 1;
            match self.release_with_reason(reservation_id, ReleaseReason::Expired) {
                Ok((released, true)) => {
                    report.released += 1;
                    report.released_quantity += released.quantity();
                }
                Ok((_, false)) => {}
                Err(err) => {
                    warn!(reservation_id = %reservation_id, error = %err, "expiry release failed");
                    report.failed += 1;
                }
            }
        }

        debug!(
            expired_found = report.expired_found,
            released = report.released,
            released_quantity = report.released_quantity,
            failed = report.failed,
            "expiry sweep finished"
        );
        Ok(report)
    }

    fn execute(
        &self,
        reservation_id: ReservationId,
        command: ReservationCommand,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        self.dispatcher.dispatch(
            reservation_id.0,
            RESERVATION_AGGREGATE_TYPE,
            command,
            |_| Reservation::empty(reservation_id),
        )
    }

    fn map_error(
        &self,
        reservation_id: ReservationId,
        operation: &'static str,
        err: DispatchError,
    ) -> CheckoutError {
        match err {
            DispatchError::Domain(DomainError::Expired { expired_at }) => CheckoutError::Expired {
                reservation_id,
                expired_at,
            },
            DispatchError::Domain(DomainError::NotFound) => {
                CheckoutError::UnknownReservation(reservation_id)
            }
            DispatchError::Concurrency(_) => CheckoutError::Conflict {
                operation,
                attempts: self.transition_retry.max_attempts,
            },
            other => other.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use chrono::{Duration as ChronoDuration, Utc};
    use nutrishop_core::ManualClock;
    use nutrishop_events::InMemoryEventBus;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    type Store = InMemoryEventStore;
    type Bus = InMemoryEventBus<EventEnvelope<JsonValue>>;

    struct Fixture {
        clock: Arc<ManualClock>,
        ledger: Arc<StockLedger<Store, Bus>>,
        manager: Arc<ReservationManager<Store, Bus>>,
    }

    fn fixture() -> Fixture {
        let config = CheckoutConfig::default()
            .with_backoff(Duration::ZERO, Duration::from_millis(1))
            .with_reserve_max_attempts(50);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let dispatcher = Arc::new(CommandDispatcher::new(Store::new(), Bus::new()));
        let ledger = Arc::new(StockLedger::new(
            dispatcher,
            clock.clone(),
            config.release_retry(),
        ));
        let manager = Arc::new(ReservationManager::new(Arc::clone(&ledger), &config).unwrap());
        Fixture {
            clock,
            ledger,
            manager,
        }
    }

    fn sku(code: &str) -> Sku {
        Sku::parse(code).unwrap()
    }

    fn available(f: &Fixture, sku: &Sku) -> u64 {
        f.ledger.get(sku).unwrap().quantity_available()
    }

    #[test]
    fn open_holds_stock_until_ttl() {
        let f = fixture();
        let a = sku("WHEY-1KG");
        f.ledger.register(&a, "Whey", 5).unwrap();

        let reservation = f.manager.open(&a, 3).unwrap();

        assert_eq!(reservation.status(), ReservationStatus::Active);
        assert_eq!(
            reservation.expires_at(),
            Some(f.clock.now() + ChronoDuration::minutes(15))
        );
        assert_eq!(available(&f, &a), 2);
    }

    #[test]
    fn open_beyond_available_is_out_of_stock() {
        let f = fixture();
        let a = sku("WHEY-1KG");
        f.ledger.register(&a, "Whey", 2).unwrap();

        let err = f.manager.open(&a, 3).unwrap_err();
        assert!(matches!(err, CheckoutError::InsufficientStock { .. }));
        assert_eq!(available(&f, &a), 2);
    }

    #[test]
    fn open_unknown_sku_fails() {
        let f = fixture();
        let err = f.manager.open(&sku("NOPE"), 1).unwrap_err();
        assert!(matches!(err, CheckoutError::UnknownSku(_)));
    }

    #[test]
    fn two_concurrent_opens_of_three_against_five() {
        for _ in 0..20 {
            let f = fixture();
            let a = sku("WHEY-1KG");
            f.ledger.register(&a, "Whey", 5).unwrap();
            let barrier = Arc::new(Barrier::new(2));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let manager = Arc::clone(&f.manager);
                    let barrier = Arc::clone(&barrier);
                    let a = a.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        manager.open(&a, 3)
                    })
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            let ok = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(ok, 1, "{results:?}");
            assert!(results.iter().any(|r| matches!(
                r,
                Err(CheckoutError::InsufficientStock { .. })
            )));
            assert_eq!(available(&f, &a), 2);
        }
    }

    #[test]
    fn release_twice_returns_stock_once() {
        let f = fixture();
        let a = sku("WHEY-1KG");
        f.ledger.register(&a, "Whey", 5).unwrap();
        let reservation = f.manager.open(&a, 3).unwrap();
        let id = reservation.id_typed();

        let released = f.manager.release(id).unwrap();
        assert_eq!(released.status(), ReservationStatus::Released);
        assert_eq!(available(&f, &a), 5);

        let again = f.manager.release(id).unwrap();
        assert_eq!(again.version(), released.version());
        assert_eq!(available(&f, &a), 5);
    }

    #[test]
    fn release_after_commit_is_a_no_op() {
        let f = fixture();
        let a = sku("WHEY-1KG");
        f.ledger.register(&a, "Whey", 5).unwrap();
        let id = f.manager.open(&a, 3).unwrap().id_typed();
        f.manager.commit(id).unwrap();

        let reservation = f.manager.release(id).unwrap();
        assert_eq!(reservation.status(), ReservationStatus::Committed);
        assert_eq!(available(&f, &a), 2);
    }

    #[test]
    fn commit_after_deadline_fails_expired_without_touching_stock() {
        let f = fixture();
        let a = sku("WHEY-1KG");
        f.ledger.register(&a, "Whey", 5).unwrap();
        let id = f.manager.open(&a, 3).unwrap().id_typed();
        let stock_version = f.ledger.get(&a).unwrap().version();

        f.clock.advance(ChronoDuration::minutes(16));
        let err = f.manager.commit(id).unwrap_err();

        assert!(matches!(err, CheckoutError::Expired { .. }));
        assert_eq!(err.user_message(), "Your reservation expired, please retry checkout.");
        assert_eq!(f.manager.status(id).unwrap(), ReservationStatus::Expired);
        assert_eq!(available(&f, &a), 2);
        assert_eq!(f.ledger.get(&a).unwrap().version(), stock_version);
    }

    #[test]
    fn commit_is_idempotent() {
        let f = fixture();
        let a = sku("WHEY-1KG");
        f.ledger.register(&a, "Whey", 5).unwrap();
        let id = f.manager.open(&a, 1).unwrap().id_typed();

        let first = f.manager.commit(id).unwrap();
        let second = f.manager.commit(id).unwrap();
        assert_eq!(first.version(), second.version());
        assert_eq!(second.status(), ReservationStatus::Committed);
    }

    #[test]
    fn sweep_reclaims_expired_reservations() {
        let f = fixture();
        let a = sku("WHEY-1KG");
        f.ledger.register(&a, "Whey", 5).unwrap();
        let stale = f.manager.open(&a, 3).unwrap().id_typed();

        f.clock.advance(ChronoDuration::minutes(10));
        let fresh = f.manager.open(&a, 1).unwrap().id_typed();
        f.clock.advance(ChronoDuration::minutes(6));

        let report = f.manager.sweep_expired().unwrap();
        assert_eq!(
            report,
            SweepReport {
                expired_found: 1,
                released: 1,
                released_quantity: 3,
                failed: 0,
            }
        );
        assert_eq!(available(&f, &a), 4);

        let swept = f.manager.get(stale).unwrap();
        assert_eq!(swept.status(), ReservationStatus::Released);
        assert_eq!(swept.release_reason(), Some(ReleaseReason::Expired));
        assert_eq!(f.manager.get(fresh).unwrap().status(), ReservationStatus::Active);

        // Reclaimed stock is reservable again.
        f.manager.open(&a, 4).unwrap();

        // A second pass finds nothing new.
        let again = f.manager.sweep_expired().unwrap();
        assert_eq!(again.released, 0);
    }

    #[test]
    fn commit_after_sweep_reports_expired() {
        let f = fixture();
        let a = sku("WHEY-1KG");
        f.ledger.register(&a, "Whey", 5).unwrap();
        let id = f.manager.open(&a, 2).unwrap().id_typed();

        f.clock.advance(ChronoDuration::minutes(16));
        f.manager.sweep_expired().unwrap();

        let err = f.manager.commit(id).unwrap_err();
        assert!(matches!(err, CheckoutError::Expired { .. }));
        assert_eq!(available(&f, &a), 5);
    }

    #[test]
    fn sweep_and_commit_never_both_win() {
        for _ in 0..20 {
            let f = fixture();
            let a = sku("WHEY-1KG");
            f.ledger.register(&a, "Whey", 5).unwrap();
            let reservation = f.manager.open(&a, 2).unwrap();
            let id = reservation.id_typed();
            let deadline = reservation.expires_at().unwrap();

            // Shopper commits at the deadline (still valid); a sweeper whose
            // clock is a minute later sees the same hold as expired. Both
            // share one event store, so they race on the reservation stream.
            f.clock.set(deadline);
            let config = CheckoutConfig::default().with_backoff(Duration::ZERO, Duration::ZERO);
            let late_ledger = Arc::new(StockLedger::new(
                Arc::clone(f.ledger.dispatcher()),
                Arc::new(ManualClock::new(deadline + ChronoDuration::minutes(1))),
                config.release_retry(),
            ));
            let late_manager = Arc::new(ReservationManager::new(late_ledger, &config).unwrap());
            let barrier = Arc::new(Barrier::new(2));

            let committer = {
                let manager = Arc::clone(&f.manager);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    manager.commit(id)
                })
            };
            let sweeper = {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    late_manager.sweep_expired()
                })
            };

            let commit = committer.join().unwrap();
            let sweep = sweeper.join().unwrap().unwrap();

            let stored = f.manager.get(id).unwrap();
            // Open plus exactly one transition.
            assert_eq!(stored.version(), 2);
            match commit {
                Ok(_) => {
                    assert_eq!(stored.status(), ReservationStatus::Committed);
                    assert_eq!(sweep.released, 0);
                    assert_eq!(available(&f, &a), 3);
                }
                Err(CheckoutError::Expired { .. }) => {
                    assert_eq!(stored.status(), ReservationStatus::Released);
                    assert_eq!(stored.release_reason(), Some(ReleaseReason::Expired));
                    assert_eq!(sweep.released, 1);
                    assert_eq!(available(&f, &a), 5);
                }
                Err(other) => panic!("unexpected commit error: {other}"),
            }
        }
    }

    #[test]
    fn consumed_reservation_belongs_to_one_order() {
        let f = fixture();
        let a = sku("WHEY-1KG");
        f.ledger.register(&a, "Whey", 5).unwrap();
        let id = f.manager.open(&a, 2).unwrap().id_typed();
        f.manager.commit(id).unwrap();
        let first = AggregateId::new();
        let second = AggregateId::new();

        assert!(f.manager.consume(id, first).unwrap());
        assert!(!f.manager.consume(id, first).unwrap());
        assert!(matches!(
            f.manager.consume(id, second).unwrap_err(),
            CheckoutError::Rejected(DomainError::Conflict(_))
        ));

        f.manager.revert_consumption(id, first).unwrap();
        assert_eq!(f.manager.get(id).unwrap().status(), ReservationStatus::Committed);
        assert!(f.manager.consume(id, second).unwrap());
        assert_eq!(available(&f, &a), 3);
    }

    #[test]
    fn zero_quantity_is_rejected() {
        let f = fixture();
        let a = sku("WHEY-1KG");
        f.ledger.register(&a, "Whey", 5).unwrap();
        let err = f.manager.open(&a, 0).unwrap_err();
        assert!(matches!(err, CheckoutError::Rejected(DomainError::Validation(_))));
    }
}
