//! Ledger postings: receptions, direct exits, cancellations and lot upkeep.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use tracing::{info, instrument, warn};

use depotledger_core::{
    ArticleId, DomainError, EntityRef, LotId, MovementId, Quantity, UserId, WarehouseId,
};
use depotledger_events::{EventBus, EventEnvelope, StreamId};
use depotledger_inventory::stock::{
    CancelMovement, ChangeLotStatus, ChangeSerialStatus, Exit, MergeLots, Receive,
};
use depotledger_inventory::{
    Allocation, DocumentRef, Lot, LotAttributes, LotStatus, MovementType, Selection,
    SerialStatus, SerialUnit, StockCommand, StockEvent, StockKey, StockLevel, StockMovement,
};

use super::{EngineResult, InventoryEngine, decode_stream, lock};
use crate::catalog::Catalog;
use crate::event_store::EventStore;

/// Goods arriving in a warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reception {
    pub article_id: ArticleId,
    pub warehouse_id: WarehouseId,
    pub quantity: Quantity,
    pub unit_cost: Decimal,
    pub attributes: LotAttributes,
    pub reference: Option<DocumentRef>,
    pub actor: UserId,
}

impl Reception {
    pub fn new(
        article_id: ArticleId,
        warehouse_id: WarehouseId,
        quantity: Quantity,
        unit_cost: Decimal,
        actor: UserId,
    ) -> Self {
        Self {
            article_id,
            warehouse_id,
            quantity,
            unit_cost,
            attributes: LotAttributes::default(),
            reference: None,
            actor,
        }
    }

    pub fn with_attributes(mut self, attributes: LotAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_reference(mut self, reference: DocumentRef) -> Self {
        self.reference = Some(reference);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceptionOutcome {
    pub lot: Lot,
    pub movement: StockMovement,
}

/// Stock leaving a warehouse outside any reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectExit {
    pub article_id: ArticleId,
    pub warehouse_id: WarehouseId,
    pub quantity: Quantity,
    /// Lots to draw from; the article's policy when absent.
    pub selection: Option<Selection>,
    /// `SaleExit` or `InventoryAdjustment` (breakage, samples…).
    pub movement_type: MovementType,
    pub reference: Option<DocumentRef>,
    pub actor: UserId,
}

impl DirectExit {
    pub fn sale(article_id: ArticleId, warehouse_id: WarehouseId, quantity: Quantity, actor: UserId) -> Self {
        Self {
            article_id,
            warehouse_id,
            quantity,
            selection: None,
            movement_type: MovementType::SaleExit,
            reference: None,
            actor,
        }
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = Some(selection);
        self
    }

    pub fn with_reference(mut self, reference: DocumentRef) -> Self {
        self.reference = Some(reference);
        self
    }
}

/// Lots consumed by an exit and the ledger entries recording it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    pub allocations: Vec<Allocation>,
    pub movements: Vec<StockMovement>,
}

impl ExitOutcome {
    pub(crate) fn from_events(events: &[StockEvent]) -> Self {
        let movements: Vec<StockMovement> = events
            .iter()
            .filter_map(StockEvent::as_movement)
            .filter(|m| m.quantity < 0)
            .cloned()
            .collect();
        let allocations = movements
            .iter()
            .filter_map(|m| {
                m.lot_id.map(|lot_id| Allocation {
                    lot_id,
                    quantity: -m.quantity,
                    unit_cost: m.unit_cost,
                })
            })
            .collect();
        Self {
            allocations,
            movements,
        }
    }

    pub fn quantity(&self) -> Quantity {
        self.allocations.iter().map(|a| a.quantity).sum()
    }

    pub fn value(&self) -> Decimal {
        self.movements.iter().map(|m| -m.value()).sum()
    }
}

impl<S, B, C> InventoryEngine<S, B, C>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    C: Catalog,
{
    /// Post a reception: opens one lot and records the entry.
    #[instrument(skip(self), fields(article = %reception.article_id, warehouse = %reception.warehouse_id))]
    pub fn post_reception(&self, reception: Reception) -> EngineResult<ReceptionOutcome> {
        let key = StockKey::new(reception.article_id, reception.warehouse_id);
        let lot_id = LotId::new();
        let command = StockCommand::Receive(Receive {
            lot_id,
            quantity: reception.quantity,
            unit_cost: reception.unit_cost,
            movement_type: MovementType::Reception,
            attributes: reception.attributes,
            reference: reception.reference,
            actor: reception.actor,
            occurred_at: Utc::now(),
        });

        let (outcome, outbox) = self.transact(&[key], |tx| {
            let events = tx.execute(key, &command)?;
            let movement = events
                .iter()
                .find_map(StockEvent::as_movement)
                .cloned()
                .ok_or_else(|| DomainError::invalid_movement("reception produced no ledger entry"))?;
            let lot = tx
                .cell(key)?
                .lot(&lot_id)
                .cloned()
                .ok_or_else(|| DomainError::not_found(EntityRef::Lot(lot_id)))?;
            Ok(ReceptionOutcome { lot, movement })
        })?;
        self.publish(outbox);

        info!(
            lot = %outcome.lot.id,
            quantity = outcome.movement.quantity,
            unit_cost = %outcome.movement.unit_cost,
            "reception posted"
        );
        Ok(outcome)
    }

    /// Post an exit that no reservation covers.
    #[instrument(skip(self), fields(article = %exit.article_id, warehouse = %exit.warehouse_id))]
    pub fn post_direct_exit(&self, exit: DirectExit) -> EngineResult<ExitOutcome> {
        let key = StockKey::new(exit.article_id, exit.warehouse_id);
        let (outcome, outbox) = self
            .transact(&[key], |tx| {
                let selection = exit.selection.unwrap_or(Selection::Policy {
                    policy: tx.cell(key)?.profile().valuation.allocation_policy(),
                });
                let command = StockCommand::Exit(Exit {
                    quantity: exit.quantity,
                    selection,
                    movement_type: exit.movement_type,
                    reference: exit.reference.clone(),
                    actor: exit.actor,
                    occurred_at: Utc::now(),
                });
                let events = tx.execute(key, &command)?;
                Ok(ExitOutcome::from_events(&events))
            })
            .inspect_err(|e| {
                if e.is_retryable() {
                    warn!(error = %e, "direct exit rejected");
                }
            })?;
        self.publish(outbox);

        info!(
            quantity = outcome.quantity(),
            lots = outcome.allocations.len(),
            "direct exit posted"
        );
        Ok(outcome)
    }

    /// Post the compensating entry for a reception or a sale exit.
    #[instrument(skip(self))]
    pub fn cancel_movement(&self, movement_id: MovementId, actor: UserId) -> EngineResult<StockMovement> {
        let key = self.locate_movement(movement_id)?;
        let command = StockCommand::CancelMovement(CancelMovement {
            movement_id,
            actor,
            occurred_at: Utc::now(),
        });
        let (movement, outbox) = self.transact(&[key], |tx| {
            let events = tx.execute(key, &command)?;
            events
                .iter()
                .find_map(StockEvent::as_movement)
                .cloned()
                .ok_or_else(|| DomainError::invalid_movement("cancellation produced no ledger entry").into())
        })?;
        self.publish(outbox);

        info!(reversal = %movement.id, quantity = movement.quantity, "movement cancelled");
        Ok(movement)
    }

    #[instrument(skip(self))]
    pub fn change_lot_status(&self, lot_id: LotId, status: LotStatus) -> EngineResult<Lot> {
        let key = self.locate_lot(lot_id)?;
        let command = StockCommand::ChangeLotStatus(ChangeLotStatus {
            lot_id,
            status,
            occurred_at: Utc::now(),
        });
        let (lot, outbox) = self.transact(&[key], |tx| {
            tx.execute(key, &command)?;
            lot_of(tx.cell(key)?.lot(&lot_id), lot_id)
        })?;
        self.publish(outbox);

        info!(status = %lot.status, "lot status changed");
        Ok(lot)
    }

    /// Fuse `source` into `destination`; returns the destination lot.
    ///
    /// The accepted cost gap comes from `lots.merge_cost_tolerance`.
    #[instrument(skip(self))]
    pub fn merge_lots(&self, source: LotId, destination: LotId, actor: UserId) -> EngineResult<Lot> {
        let key = self.locate_lot(source)?;
        if self.locate_lot(destination)? != key {
            return Err(DomainError::validation("merged lots must belong to the same article and warehouse").into());
        }
        let command = StockCommand::MergeLots(MergeLots {
            source_lot_id: source,
            destination_lot_id: destination,
            cost_tolerance: self.config.lots.merge_cost_tolerance,
            actor,
            occurred_at: Utc::now(),
        });
        let (lot, outbox) = self.transact(&[key], |tx| {
            tx.execute(key, &command)?;
            lot_of(tx.cell(key)?.lot(&destination), destination)
        })?;
        self.publish(outbox);

        info!(quantity = lot.quantity, unit_cost = %lot.unit_cost, "lots merged");
        Ok(lot)
    }

    /// Bookkeeping-only serial change, e.g. a sold unit coming back.
    #[instrument(skip(self))]
    pub fn change_serial_status(
        &self,
        article_id: ArticleId,
        warehouse_id: WarehouseId,
        serial: &str,
        status: SerialStatus,
    ) -> EngineResult<SerialUnit> {
        let key = StockKey::new(article_id, warehouse_id);
        if self.find_cell(key)?.is_none() {
            return Err(DomainError::not_found(EntityRef::SerialUnit(serial.to_string())).into());
        }
        let command = StockCommand::ChangeSerialStatus(ChangeSerialStatus {
            serial: serial.to_string(),
            status,
            occurred_at: Utc::now(),
        });
        let (unit, outbox) = self.transact(&[key], |tx| {
            tx.execute(key, &command)?;
            tx.cell(key)?
                .serial(serial)
                .cloned()
                .ok_or_else(|| DomainError::not_found(EntityRef::SerialUnit(serial.to_string())).into())
        })?;
        self.publish(outbox);
        Ok(unit)
    }

    /// Ledger entries of one pair, in posting order, optionally bounded
    /// (inclusive) by time.
    pub fn movements_for(
        &self,
        article_id: ArticleId,
        warehouse_id: WarehouseId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> EngineResult<Vec<StockMovement>> {
        let stream = StreamId::stock(article_id, warehouse_id);
        let history = self.store.load_stream(stream)?;
        let events: Vec<StockEvent> = decode_stream(stream, &history)?;
        Ok(events
            .into_iter()
            .filter_map(|e| match e {
                StockEvent::MovementPosted(m) => Some(m),
                _ => None,
            })
            .filter(|m| from.is_none_or(|from| m.occurred_at >= from))
            .filter(|m| to.is_none_or(|to| m.occurred_at <= to))
            .collect())
    }

    /// Current level; zero for a pair that has never moved.
    pub fn stock_level(&self, article_id: ArticleId, warehouse_id: WarehouseId) -> EngineResult<StockLevel> {
        let Some(cell) = self.find_cell(StockKey::new(article_id, warehouse_id))? else {
            return Ok(StockLevel::default());
        };
        Ok(lock(&cell, "stock cell")?.level())
    }

    /// Every lot of the pair, depleted ones included, in id order.
    pub fn lots(&self, article_id: ArticleId, warehouse_id: WarehouseId) -> EngineResult<Vec<Lot>> {
        let Some(cell) = self.find_cell(StockKey::new(article_id, warehouse_id))? else {
            return Ok(Vec::new());
        };
        Ok(lock(&cell, "stock cell")?.lots().cloned().collect())
    }

    pub fn lot(&self, lot_id: LotId) -> EngineResult<Lot> {
        let key = self.locate_lot(lot_id)?;
        let cell = self.cell_handle(key)?;
        let cell = lock(&cell, "stock cell")?;
        lot_of(cell.lot(&lot_id), lot_id)
    }

    pub fn serial_units(&self, article_id: ArticleId, warehouse_id: WarehouseId) -> EngineResult<Vec<SerialUnit>> {
        let Some(cell) = self.find_cell(StockKey::new(article_id, warehouse_id))? else {
            return Ok(Vec::new());
        };
        Ok(lock(&cell, "stock cell")?.serial_units().cloned().collect())
    }
}

fn lot_of(lot: Option<&Lot>, lot_id: LotId) -> EngineResult<Lot> {
    lot.cloned()
        .ok_or_else(|| DomainError::not_found(EntityRef::Lot(lot_id)).into())
}
