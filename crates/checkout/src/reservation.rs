use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nutrishop_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use nutrishop_events::Event;
use nutrishop_inventory::Sku;

/// Aggregate type tag used for reservation streams.
pub const RESERVATION_AGGREGATE_TYPE: &str = "checkout.reservation";

/// Reservation identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(pub AggregateId);

impl ReservationId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Reservation status lifecycle.
///
/// `Expired` is never persisted: it is the effective status of an `Active`
/// hold whose deadline has passed but which has not been reclaimed yet.
/// `Consumed` means an order has taken over the committed hold; from then on
/// the stock belongs to that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Active,
    Committed,
    Consumed,
    Released,
    Expired,
}

/// Why a hold was given back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// Shopper abandoned or checkout aborted.
    Requested,
    /// Deadline passed; reclaimed by the sweep.
    Expired,
    /// A sibling reservation in the same checkout was not committed.
    IncompleteCheckout,
}

/// Aggregate root: Reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    id: ReservationId,
    sku: Option<Sku>,
    quantity: u64,
    created_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    status: ReservationStatus,
    release_reason: Option<ReleaseReason>,
    consumed_by: Option<AggregateId>,
    version: u64,
    created: bool,
}

impl Reservation {
    /// Create an empty, not-yet-opened aggregate instance for rehydration.
    pub fn empty(id: ReservationId) -> Self {
        Self {
            id,
            sku: None,
            quantity: 0,
            created_at: None,
            expires_at: None,
            status: ReservationStatus::Active,
            release_reason: None,
            consumed_by: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> ReservationId {
        self.id
    }

    pub fn sku(&self) -> Option<&Sku> {
        self.sku.as_ref()
    }

    pub fn quantity(&self) -> u64 {
        self.quantity
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Persisted status (never `Expired`).
    pub fn status(&self) -> ReservationStatus {
        self.status
    }

    pub fn release_reason(&self) -> Option<ReleaseReason> {
        self.release_reason
    }

    /// Order stream that consumed this hold, if any.
    pub fn consumed_by(&self) -> Option<AggregateId> {
        self.consumed_by
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    /// Status as observed at `now`.
    pub fn status_at(&self, now: DateTime<Utc>) -> ReservationStatus {
        if self.is_past_deadline(now) {
            ReservationStatus::Expired
        } else {
            self.status
        }
    }

    /// Active and strictly past its deadline: eligible for the sweep.
    ///
    /// At exactly `expires_at` the hold is still live and can be committed.
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Active
            && self.expires_at.is_some_and(|deadline| now > deadline)
    }
}

impl AggregateRoot for Reservation {
    type Id = ReservationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: OpenReservation.
///
/// Issued only after the stock ledger accepted the hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenReservation {
    pub reservation_id: ReservationId,
    pub sku: Sku,
    pub quantity: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Command: CommitReservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReservation {
    pub reservation_id: ReservationId,
    pub now: DateTime<Utc>,
}

/// Command: ReleaseReservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseReservation {
    pub reservation_id: ReservationId,
    pub reason: ReleaseReason,
    pub now: DateTime<Utc>,
}

/// Command: ConsumeReservation (an order takes over a committed hold).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeReservation {
    pub reservation_id: ReservationId,
    pub order_id: AggregateId,
    pub now: DateTime<Utc>,
}

/// Command: RevertConsumption (the order was never placed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertConsumption {
    pub reservation_id: ReservationId,
    pub order_id: AggregateId,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationCommand {
    OpenReservation(OpenReservation),
    CommitReservation(CommitReservation),
    ReleaseReservation(ReleaseReservation),
    ConsumeReservation(ConsumeReservation),
    RevertConsumption(RevertConsumption),
}

/// Event: ReservationOpened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationOpened {
    pub reservation_id: ReservationId,
    pub sku: Sku,
    pub quantity: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Event: ReservationCommitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationCommitted {
    pub reservation_id: ReservationId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReservationReleased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationReleased {
    pub reservation_id: ReservationId,
    pub sku: Sku,
    pub quantity: u64,
    pub reason: ReleaseReason,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReservationConsumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationConsumed {
    pub reservation_id: ReservationId,
    pub order_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReservationConsumptionReverted (back to committed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationConsumptionReverted {
    pub reservation_id: ReservationId,
    pub order_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationEvent {
    ReservationOpened(ReservationOpened),
    ReservationCommitted(ReservationCommitted),
    ReservationReleased(ReservationReleased),
    ReservationConsumed(ReservationConsumed),
    ReservationConsumptionReverted(ReservationConsumptionReverted),
}

impl Event for ReservationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ReservationEvent::ReservationOpened(_) => "checkout.reservation.opened",
            ReservationEvent::ReservationCommitted(_) => "checkout.reservation.committed",
            ReservationEvent::ReservationReleased(_) => "checkout.reservation.released",
            ReservationEvent::ReservationConsumed(_) => "checkout.reservation.consumed",
            ReservationEvent::ReservationConsumptionReverted(_) => {
                "checkout.reservation.consumption_reverted"
            }
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ReservationEvent::ReservationOpened(e) => e.created_at,
            ReservationEvent::ReservationCommitted(e) => e.occurred_at,
            ReservationEvent::ReservationReleased(e) => e.occurred_at,
            ReservationEvent::ReservationConsumed(e) => e.occurred_at,
            ReservationEvent::ReservationConsumptionReverted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Reservation {
    type Command = ReservationCommand;
    type Event = ReservationEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ReservationEvent::ReservationOpened(e) => {
                self.id = e.reservation_id;
                self.sku = Some(e.sku.clone());
                self.quantity = e.quantity;
                self.created_at = Some(e.created_at);
                self.expires_at = Some(e.expires_at);
                self.status = ReservationStatus::Active;
                self.created = true;
            }
            ReservationEvent::ReservationCommitted(_) => {
                self.status = ReservationStatus::Committed;
            }
            ReservationEvent::ReservationReleased(e) => {
                self.status = ReservationStatus::Released;
                self.release_reason = Some(e.reason);
            }
            ReservationEvent::ReservationConsumed(e) => {
                self.status = ReservationStatus::Consumed;
                self.consumed_by = Some(e.order_id);
            }
            ReservationEvent::ReservationConsumptionReverted(_) => {
                self.status = ReservationStatus::Committed;
                self.consumed_by = None;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ReservationCommand::OpenReservation(cmd) => self.handle_open(cmd),
            ReservationCommand::CommitReservation(cmd) => self.handle_commit(cmd),
            ReservationCommand::ReleaseReservation(cmd) => self.handle_release(cmd),
            ReservationCommand::ConsumeReservation(cmd) => self.handle_consume(cmd),
            ReservationCommand::RevertConsumption(cmd) => self.handle_revert(cmd),
        }
    }
}

impl Reservation {
    fn ensure_reservation_id(&self, reservation_id: ReservationId) -> Result<(), DomainError> {
        if self.id != reservation_id {
            return Err(DomainError::invariant("reservation_id mismatch"));
        }
        Ok(())
    }

    fn deadline(&self) -> Result<DateTime<Utc>, DomainError> {
        self.expires_at
            .ok_or_else(|| DomainError::invariant("opened reservation has no deadline"))
    }

    fn handle_open(&self, cmd: &OpenReservation) -> Result<Vec<ReservationEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("reservation already exists"));
        }
        self.ensure_reservation_id(cmd.reservation_id)?;

        if cmd.quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if cmd.expires_at <= cmd.created_at {
            return Err(DomainError::validation("expires_at must be after created_at"));
        }

        Ok(vec![ReservationEvent::ReservationOpened(ReservationOpened {
            reservation_id: cmd.reservation_id,
            sku: cmd.sku.clone(),
            quantity: cmd.quantity,
            created_at: cmd.created_at,
            expires_at: cmd.expires_at,
        })])
    }

    fn handle_commit(&self, cmd: &CommitReservation) -> Result<Vec<ReservationEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_reservation_id(cmd.reservation_id)?;

        match self.status {
            ReservationStatus::Committed | ReservationStatus::Consumed => Ok(vec![]),
            ReservationStatus::Released => match self.release_reason {
                Some(ReleaseReason::Expired) => Err(DomainError::expired(self.deadline()?)),
                _ => Err(DomainError::invariant("reservation has been released")),
            },
            ReservationStatus::Active | ReservationStatus::Expired => {
                let deadline = self.deadline()?;
                if cmd.now > deadline {
                    return Err(DomainError::expired(deadline));
                }
                Ok(vec![ReservationEvent::ReservationCommitted(
                    ReservationCommitted {
                        reservation_id: cmd.reservation_id,
                        occurred_at: cmd.now,
                    },
                )])
            }
        }
    }

    fn handle_release(
        &self,
        cmd: &ReleaseReservation,
    ) -> Result<Vec<ReservationEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_reservation_id(cmd.reservation_id)?;

        match self.status {
            // No event, no stock movement. Committed holds come back only
            // through order cancellation.
            ReservationStatus::Released
            | ReservationStatus::Committed
            | ReservationStatus::Consumed => Ok(vec![]),
            ReservationStatus::Active | ReservationStatus::Expired => {
                if cmd.reason == ReleaseReason::Expired && cmd.now <= self.deadline()? {
                    return Err(DomainError::invariant("reservation has not expired yet"));
                }
                let sku = self
                    .sku
                    .clone()
                    .ok_or_else(|| DomainError::invariant("opened reservation has no sku"))?;
                Ok(vec![ReservationEvent::ReservationReleased(
                    ReservationReleased {
                        reservation_id: cmd.reservation_id,
                        sku,
                        quantity: self.quantity,
                        reason: cmd.reason,
                        occurred_at: cmd.now,
                    },
                )])
            }
        }
    }

    fn handle_consume(
        &self,
        cmd: &ConsumeReservation,
    ) -> Result<Vec<ReservationEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_reservation_id(cmd.reservation_id)?;

        match self.status {
            ReservationStatus::Committed => Ok(vec![ReservationEvent::ReservationConsumed(
                ReservationConsumed {
                    reservation_id: cmd.reservation_id,
                    order_id: cmd.order_id,
                    occurred_at: cmd.now,
                },
            )]),
            ReservationStatus::Consumed if self.consumed_by == Some(cmd.order_id) => Ok(vec![]),
            ReservationStatus::Consumed => Err(DomainError::conflict(
                "reservation already consumed by another order",
            )),
            ReservationStatus::Released => {
                Err(DomainError::invariant("reservation has been released"))
            }
            ReservationStatus::Active | ReservationStatus::Expired => {
                Err(DomainError::invariant("reservation is not committed"))
            }
        }
    }

    fn handle_revert(&self, cmd: &RevertConsumption) -> Result<Vec<ReservationEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_reservation_id(cmd.reservation_id)?;

        if self.status != ReservationStatus::Consumed || self.consumed_by != Some(cmd.order_id) {
            return Ok(vec![]);
        }
        Ok(vec![ReservationEvent::ReservationConsumptionReverted(
            ReservationConsumptionReverted {
                reservation_id: cmd.reservation_id,
                order_id: cmd.order_id,
                occurred_at: cmd.now,
            },
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_reservation_id() -> ReservationId {
        ReservationId::new(AggregateId::new())
    }

    fn opened(id: ReservationId, now: DateTime<Utc>) -> Reservation {
        let mut reservation = Reservation::empty(id);
        let events = reservation
            .handle(&ReservationCommand::OpenReservation(OpenReservation {
                reservation_id: id,
                sku: Sku::parse("CREATINE-500G").unwrap(),
                quantity: 2,
                created_at: now,
                expires_at: now + Duration::minutes(15),
            }))
            .unwrap();
        reservation.apply(&events[0]);
        reservation
    }

    fn commit(id: ReservationId, now: DateTime<Utc>) -> ReservationCommand {
        ReservationCommand::CommitReservation(CommitReservation {
            reservation_id: id,
            now,
        })
    }

    fn release(id: ReservationId, reason: ReleaseReason, now: DateTime<Utc>) -> ReservationCommand {
        ReservationCommand::ReleaseReservation(ReleaseReservation {
            reservation_id: id,
            reason,
            now,
        })
    }

    #[test]
    fn open_emits_opened_event_and_is_active() {
        let id = test_reservation_id();
        let now = Utc::now();
        let reservation = opened(id, now);

        assert_eq!(reservation.status(), ReservationStatus::Active);
        assert_eq!(reservation.quantity(), 2);
        assert_eq!(reservation.expires_at(), Some(now + Duration::minutes(15)));
        assert_eq!(reservation.version(), 1);
    }

    #[test]
    fn open_rejects_non_positive_ttl() {
        let id = test_reservation_id();
        let now = Utc::now();
        let err = Reservation::empty(id)
            .handle(&ReservationCommand::OpenReservation(OpenReservation {
                reservation_id: id,
                sku: Sku::parse("A").unwrap(),
                quantity: 1,
                created_at: now,
                expires_at: now,
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn commit_before_deadline_moves_to_committed() {
        let id = test_reservation_id();
        let now = Utc::now();
        let mut reservation = opened(id, now);

        let events = reservation.handle(&commit(id, now + Duration::minutes(1))).unwrap();
        reservation.apply(&events[0]);

        assert_eq!(reservation.status(), ReservationStatus::Committed);
    }

    #[test]
    fn commit_after_deadline_fails_with_expired() {
        let id = test_reservation_id();
        let now = Utc::now();
        let reservation = opened(id, now);

        let err = reservation
            .handle(&commit(id, now + Duration::minutes(16)))
            .unwrap_err();
        assert_eq!(err, DomainError::expired(now + Duration::minutes(15)));
        assert_eq!(
            reservation.status_at(now + Duration::minutes(16)),
            ReservationStatus::Expired
        );
    }

    #[test]
    fn commit_is_idempotent() {
        let id = test_reservation_id();
        let now = Utc::now();
        let mut reservation = opened(id, now);
        let events = reservation.handle(&commit(id, now)).unwrap();
        reservation.apply(&events[0]);

        assert!(reservation.handle(&commit(id, now)).unwrap().is_empty());
    }

    #[test]
    fn second_release_is_a_no_op() {
        let id = test_reservation_id();
        let now = Utc::now();
        let mut reservation = opened(id, now);

        let events = reservation
            .handle(&release(id, ReleaseReason::Requested, now))
            .unwrap();
        assert_eq!(events.len(), 1);
        reservation.apply(&events[0]);

        let again = reservation
            .handle(&release(id, ReleaseReason::Requested, now))
            .unwrap();
        assert!(again.is_empty());
        assert_eq!(reservation.version(), 2);
    }

    #[test]
    fn expiry_release_requires_deadline_to_have_passed() {
        let id = test_reservation_id();
        let now = Utc::now();
        let reservation = opened(id, now);

        let deadline = now + Duration::minutes(15);
        assert!(reservation
            .handle(&release(id, ReleaseReason::Expired, now))
            .is_err());
        assert!(reservation
            .handle(&release(id, ReleaseReason::Expired, deadline))
            .is_err());
        assert!(reservation
            .handle(&release(id, ReleaseReason::Expired, deadline + Duration::seconds(1)))
            .is_ok());
    }

    #[test]
    fn deadline_instant_is_still_committable() {
        let id = test_reservation_id();
        let now = Utc::now();
        let reservation = opened(id, now);
        let deadline = now + Duration::minutes(15);

        assert!(!reservation.is_past_deadline(deadline));
        assert_eq!(reservation.status_at(deadline), ReservationStatus::Active);
        assert_eq!(reservation.handle(&commit(id, deadline)).unwrap().len(), 1);

        let just_after = deadline + Duration::milliseconds(1);
        assert!(reservation.is_past_deadline(just_after));
        assert!(matches!(
            reservation.handle(&commit(id, just_after)).unwrap_err(),
            DomainError::Expired { .. }
        ));
    }

    fn consume(id: ReservationId, order_id: AggregateId, now: DateTime<Utc>) -> ReservationCommand {
        ReservationCommand::ConsumeReservation(ConsumeReservation {
            reservation_id: id,
            order_id,
            now,
        })
    }

    fn committed(id: ReservationId, now: DateTime<Utc>) -> Reservation {
        let mut reservation = opened(id, now);
        for e in reservation.handle(&commit(id, now)).unwrap() {
            reservation.apply(&e);
        }
        reservation
    }

    #[test]
    fn one_order_consumes_a_committed_reservation() {
        let id = test_reservation_id();
        let now = Utc::now();
        let mut reservation = committed(id, now);
        let order_a = AggregateId::new();
        let order_b = AggregateId::new();

        for e in reservation.handle(&consume(id, order_a, now)).unwrap() {
            reservation.apply(&e);
        }
        assert_eq!(reservation.status(), ReservationStatus::Consumed);
        assert_eq!(reservation.consumed_by(), Some(order_a));

        // Same order again: nothing to do.
        assert!(reservation.handle(&consume(id, order_a, now)).unwrap().is_empty());
        // Any other order is refused.
        assert!(matches!(
            reservation.handle(&consume(id, order_b, now)).unwrap_err(),
            DomainError::Conflict(_)
        ));
        // Commit and release leave a consumed hold alone.
        assert!(reservation.handle(&commit(id, now)).unwrap().is_empty());
        assert!(reservation
            .handle(&release(id, ReleaseReason::Requested, now))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn only_committed_reservations_can_be_consumed() {
        let id = test_reservation_id();
        let now = Utc::now();
        let active = opened(id, now);
        assert!(matches!(
            active.handle(&consume(id, AggregateId::new(), now)).unwrap_err(),
            DomainError::InvariantViolation(_)
        ));
    }

    #[test]
    fn reverting_returns_the_hold_to_committed() {
        let id = test_reservation_id();
        let now = Utc::now();
        let mut reservation = committed(id, now);
        let order_a = AggregateId::new();
        let order_b = AggregateId::new();
        for e in reservation.handle(&consume(id, order_a, now)).unwrap() {
            reservation.apply(&e);
        }

        let revert = |order_id| {
            ReservationCommand::RevertConsumption(RevertConsumption {
                reservation_id: id,
                order_id,
                now,
            })
        };
        // Only the consuming order can revert.
        assert!(reservation.handle(&revert(order_b)).unwrap().is_empty());

        for e in reservation.handle(&revert(order_a)).unwrap() {
            reservation.apply(&e);
        }
        assert_eq!(reservation.status(), ReservationStatus::Committed);
        assert_eq!(reservation.consumed_by(), None);
        assert_eq!(reservation.handle(&consume(id, order_b, now)).unwrap().len(), 1);
    }

    #[test]
    fn releasing_a_committed_reservation_is_a_no_op() {
        let id = test_reservation_id();
        let now = Utc::now();
        let mut reservation = opened(id, now);
        let events = reservation.handle(&commit(id, now)).unwrap();
        reservation.apply(&events[0]);

        let events = reservation
            .handle(&release(id, ReleaseReason::Expired, now + Duration::hours(1)))
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(reservation.status(), ReservationStatus::Committed);
    }

    #[test]
    fn commit_after_sweep_reports_expired() {
        let id = test_reservation_id();
        let now = Utc::now();
        let mut reservation = opened(id, now);
        let late = now + Duration::minutes(20);
        let events = reservation
            .handle(&release(id, ReleaseReason::Expired, late))
            .unwrap();
        reservation.apply(&events[0]);

        let err = reservation.handle(&commit(id, late)).unwrap_err();
        assert!(matches!(err, DomainError::Expired { .. }));
    }
}
