//! Reservations: hold, pick, release, prolong and the expiry sweep.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, instrument, warn};

use depotledger_core::{
    ArticleId, DomainError, EntityRef, Quantity, ReservationId, UserId, WarehouseId,
};
use depotledger_events::{EventBus, EventEnvelope};
use depotledger_inventory::stock::{Pick, ProlongReservation, ReleaseReservation, Reserve};
use depotledger_inventory::{
    ReleaseReason, Reservation, StockCommand, StockEvent, StockKey, StockMovement,
};

use super::ledger::ExitOutcome;
use super::{EngineResult, InventoryEngine, lock};
use crate::catalog::Catalog;
use crate::event_store::EventStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub article_id: ArticleId,
    pub warehouse_id: WarehouseId,
    pub quantity: Quantity,
    /// Originating sales-order line.
    pub order_line: String,
    /// Lifetime; `reservations.default_ttl_secs` when absent.
    pub ttl: Option<Duration>,
}

impl ReservationRequest {
    pub fn new(
        article_id: ArticleId,
        warehouse_id: WarehouseId,
        quantity: Quantity,
        order_line: impl Into<String>,
    ) -> Self {
        Self {
            article_id,
            warehouse_id,
            quantity,
            order_line: order_line.into(),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickOutcome {
    pub reservation: Reservation,
    pub movements: Vec<StockMovement>,
}

/// Result of one expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<ReservationId>,
    /// Units handed back to available.
    pub released: Quantity,
    /// Cells whose release could not be committed.
    pub failed: usize,
}

impl<S, B, C> InventoryEngine<S, B, C>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    C: Catalog,
{
    /// Hold available stock for a future pick.
    #[instrument(skip(self), fields(article = %request.article_id, warehouse = %request.warehouse_id))]
    pub fn reserve(&self, request: ReservationRequest) -> EngineResult<Reservation> {
        let ttl = request.ttl.unwrap_or_else(|| self.config.reservations.default_ttl());
        if ttl <= Duration::zero() {
            return Err(DomainError::validation("reservation ttl must be positive").into());
        }

        let key = StockKey::new(request.article_id, request.warehouse_id);
        let reservation_id = ReservationId::new();
        let now = Utc::now();
        let command = StockCommand::Reserve(Reserve {
            reservation_id,
            quantity: request.quantity,
            order_line: request.order_line,
            expires_at: now + ttl,
            occurred_at: now,
        });

        let (reservation, outbox) = self
            .transact(&[key], |tx| {
                tx.execute(key, &command)?;
                reservation_of(tx.cell(key)?.reservation(&reservation_id), reservation_id)
            })
            .inspect_err(|e| {
                if e.is_retryable() {
                    warn!(quantity = request.quantity, error = %e, "reservation rejected");
                }
            })?;
        self.publish(outbox);

        info!(reservation = %reservation.id, quantity = reservation.requested, "stock reserved");
        Ok(reservation)
    }

    /// Ship `quantity` against a reservation, consuming lots by the
    /// article's policy.
    #[instrument(skip(self))]
    pub fn pick(&self, reservation_id: ReservationId, quantity: Quantity, actor: UserId) -> EngineResult<PickOutcome> {
        let key = self.locate_reservation(reservation_id)?;
        let command = StockCommand::Pick(Pick {
            reservation_id,
            quantity,
            actor,
            occurred_at: Utc::now(),
        });

        let (outcome, outbox) = self.transact(&[key], |tx| {
            let events = tx.execute(key, &command)?;
            let reservation = reservation_of(tx.cell(key)?.reservation(&reservation_id), reservation_id)?;
            Ok(PickOutcome {
                reservation,
                movements: ExitOutcome::from_events(&events).movements,
            })
        })?;
        self.publish(outbox);

        info!(
            picked = quantity,
            status = %outcome.reservation.status,
            "reservation picked"
        );
        Ok(outcome)
    }

    pub fn cancel_reservation(&self, reservation_id: ReservationId) -> EngineResult<Reservation> {
        self.release(reservation_id, ReleaseReason::Cancelled, Utc::now())
    }

    /// Expire when the reservation is due at `now`, cancel otherwise.
    pub fn cancel_or_expire(&self, reservation_id: ReservationId, now: DateTime<Utc>) -> EngineResult<Reservation> {
        let key = self.locate_reservation(reservation_id)?;
        let cell = self.cell_handle(key)?;
        let due = lock(&cell, "stock cell")?
            .reservation(&reservation_id)
            .is_some_and(|r| r.expires_at <= now);
        let reason = if due {
            ReleaseReason::Expired
        } else {
            ReleaseReason::Cancelled
        };
        self.release(reservation_id, reason, now)
    }

    #[instrument(skip(self))]
    fn release(
        &self,
        reservation_id: ReservationId,
        reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> EngineResult<Reservation> {
        let key = self.locate_reservation(reservation_id)?;
        let command = StockCommand::ReleaseReservation(ReleaseReservation {
            reservation_id,
            reason,
            occurred_at: now,
        });
        let (reservation, outbox) = self.transact(&[key], |tx| {
            tx.execute(key, &command)?;
            reservation_of(tx.cell(key)?.reservation(&reservation_id), reservation_id)
        })?;
        self.publish(outbox);

        info!(status = %reservation.status, "reservation released");
        Ok(reservation)
    }

    /// Push the expiry of a live reservation back.
    #[instrument(skip(self))]
    pub fn prolong(&self, reservation_id: ReservationId, expires_at: DateTime<Utc>) -> EngineResult<Reservation> {
        let key = self.locate_reservation(reservation_id)?;
        let command = StockCommand::ProlongReservation(ProlongReservation {
            reservation_id,
            expires_at,
            occurred_at: Utc::now(),
        });
        let (reservation, outbox) = self.transact(&[key], |tx| {
            tx.execute(key, &command)?;
            reservation_of(tx.cell(key)?.reservation(&reservation_id), reservation_id)
        })?;
        self.publish(outbox);
        Ok(reservation)
    }

    pub fn reservation(&self, reservation_id: ReservationId) -> EngineResult<Reservation> {
        let key = self.locate_reservation(reservation_id)?;
        let cell = self.cell_handle(key)?;
        let cell = lock(&cell, "stock cell")?;
        reservation_of(cell.reservation(&reservation_id), reservation_id)
    }

    /// Expire every reservation due at `now`.
    ///
    /// Each cell is swept under its own lock, so a sweep never races a
    /// pick. A cell that fails to commit is logged and skipped.
    #[instrument(skip(self))]
    pub fn expire_due_reservations(&self, now: DateTime<Utc>) -> EngineResult<SweepReport> {
        let mut report = SweepReport::default();

        for (key, cell) in self.cells_where(|_| true)? {
            if lock(&cell, "stock cell")?.due_reservations(now).is_empty() {
                continue;
            }

            let swept = self.transact(&[key], |tx| {
                let mut expired = Vec::new();
                let mut released = 0;
                for reservation_id in tx.cell(key)?.due_reservations(now) {
                    let command = StockCommand::ReleaseReservation(ReleaseReservation {
                        reservation_id,
                        reason: ReleaseReason::Expired,
                        occurred_at: now,
                    });
                    for event in tx.execute(key, &command)? {
                        if let StockEvent::ReservationReleased(e) = event {
                            released += e.quantity;
                        }
                    }
                    expired.push(reservation_id);
                }
                Ok((expired, released))
            });

            match swept {
                Ok(((expired, released), outbox)) => {
                    self.publish(outbox);
                    debug!(%key, count = expired.len(), "expired reservations");
                    report.released += released;
                    report.expired.extend(expired);
                }
                Err(e) => {
                    error!(%key, error = %e, "reservation sweep failed for cell");
                    report.failed += 1;
                }
            }
        }

        if !report.expired.is_empty() {
            info!(expired = report.expired.len(), released = report.released, "reservation sweep done");
        }
        Ok(report)
    }
}

fn reservation_of(reservation: Option<&Reservation>, reservation_id: ReservationId) -> EngineResult<Reservation> {
    reservation
        .cloned()
        .ok_or_else(|| DomainError::not_found(EntityRef::Reservation(reservation_id)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use depotledger_core::ErrorKind;
    use depotledger_events::InMemoryEventBus;
    use depotledger_inventory::{Article, ReservationStatus, Warehouse};
    use rust_decimal_macros::dec;

    use crate::catalog::InMemoryCatalog;
    use crate::config::EngineConfig;
    use crate::engine::Reception;
    use crate::event_store::InMemoryEventStore;

    type Engine = InventoryEngine<InMemoryEventStore, InMemoryEventBus<EventEnvelope<JsonValue>>, InMemoryCatalog>;

    fn stocked(quantity: Quantity) -> (Engine, Article, Warehouse) {
        let article = Article::new("SKU-1", "Bolt");
        let wh = Warehouse::new("WH-A", "Main");
        let catalog = InMemoryCatalog::new();
        catalog.upsert_article(article.clone()).unwrap();
        catalog.add_warehouse(wh.clone());
        let engine = InventoryEngine::new(
            InMemoryEventStore::new(),
            InMemoryEventBus::new(),
            catalog,
            EngineConfig::default(),
        );
        engine
            .post_reception(Reception::new(article.id, wh.id, quantity, dec!(1), UserId::new()))
            .unwrap();
        (engine, article, wh)
    }

    #[test]
    fn partial_then_full_pick_completes_the_reservation() {
        let (engine, article, wh) = stocked(10);
        let actor = UserId::new();
        let r = engine
            .reserve(ReservationRequest::new(article.id, wh.id, 6, "SO-1/1"))
            .unwrap();

        let first = engine.pick(r.id, 2, actor).unwrap();
        assert_eq!(first.reservation.status, ReservationStatus::Partial);
        let level = engine.stock_level(article.id, wh.id).unwrap();
        assert_eq!((level.theoretical, level.reserved, level.available()), (8, 4, 4));

        let second = engine.pick(r.id, 4, actor).unwrap();
        assert_eq!(second.reservation.status, ReservationStatus::Picked);
        assert_eq!(engine.stock_level(article.id, wh.id).unwrap().reserved, 0);

        let err = engine.cancel_reservation(r.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
    }

    #[test]
    fn an_expired_hold_is_not_picked_before_the_sweep() {
        let (engine, article, wh) = stocked(10);
        let r = engine
            .reserve(ReservationRequest::new(article.id, wh.id, 4, "SO-1/1").with_ttl(Duration::milliseconds(20)))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(60));

        let err = engine.pick(r.id, 4, UserId::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
        assert_eq!(engine.stock_level(article.id, wh.id).unwrap().theoretical, 10);

        let expired = engine.cancel_or_expire(r.id, Utc::now()).unwrap();
        assert_eq!(expired.status, ReservationStatus::Expired);
    }

    #[test]
    fn cancel_or_expire_depends_on_the_expiry() {
        let (engine, article, wh) = stocked(10);
        let early = engine
            .reserve(ReservationRequest::new(article.id, wh.id, 3, "SO-1/1").with_ttl(Duration::minutes(5)))
            .unwrap();
        let late = engine
            .reserve(ReservationRequest::new(article.id, wh.id, 3, "SO-1/2").with_ttl(Duration::hours(5)))
            .unwrap();

        let at = Utc::now() + Duration::minutes(10);
        assert_eq!(engine.cancel_or_expire(early.id, at).unwrap().status, ReservationStatus::Expired);
        assert_eq!(engine.cancel_or_expire(late.id, at).unwrap().status, ReservationStatus::Cancelled);
        assert_eq!(engine.stock_level(article.id, wh.id).unwrap().available(), 10);
    }

    #[test]
    fn terminal_reservations_cannot_be_prolonged() {
        let (engine, article, wh) = stocked(10);
        let r = engine
            .reserve(ReservationRequest::new(article.id, wh.id, 3, "SO-1/1"))
            .unwrap();
        let later = r.expires_at + Duration::hours(1);
        assert_eq!(engine.prolong(r.id, later).unwrap().expires_at, later);

        engine.cancel_reservation(r.id).unwrap();
        let err = engine.prolong(r.id, later + Duration::hours(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
    }

    #[test]
    fn non_positive_ttl_is_rejected() {
        let (engine, article, wh) = stocked(10);
        let err = engine
            .reserve(ReservationRequest::new(article.id, wh.id, 1, "SO-1/1").with_ttl(Duration::zero()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
