//! Physical inventory sessions.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{info, instrument, warn};

use depotledger_core::{
    Aggregate, AggregateRoot, ArticleId, DomainError, EntityRef, InventoryLineId,
    InventorySessionId, LocationId, LotId, Quantity, UserId,
};
use depotledger_events::{EventBus, EventEnvelope, StreamId};
use depotledger_inventory::count::{OpenSession, RecordCount, ValidateLine};
use depotledger_inventory::stock::{Exit, Receive};
use depotledger_inventory::{
    DocumentRef, InventoryLine, InventoryScope, InventorySession, LineDecision, LineSnapshot,
    LotAttributes, MovementType, Selection, SessionCommand, StockCell, StockCommand,
    StockEvent, StockKey, TrackingMode, ValuationMethod,
};

use super::{EngineResult, InventoryEngine, lock, write};
use crate::catalog::Catalog;
use crate::event_store::EventStore;

/// A recorded count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountEntry {
    pub session_id: InventorySessionId,
    pub line_id: InventoryLineId,
    pub theoretical: Quantity,
    pub counted: Quantity,
    /// The line must be counted again, or the variance acknowledged.
    pub recount_required: bool,
}

impl CountEntry {
    pub fn variance(&self) -> Quantity {
        self.counted - self.theoretical
    }
}

/// Position of one location in a cell, valued the way the article is.
fn snapshot(cell: &StockCell, location_id: Option<LocationId>, theoretical: Quantity) -> LineSnapshot {
    let unit_cost = match cell.profile().valuation {
        ValuationMethod::WeightedAverage => cell.average_cost(),
        _ => cell.valuation_at(location_id).unit_cost,
    };
    LineSnapshot {
        article_id: cell.key().article_id,
        location_id,
        theoretical,
        unit_cost,
    }
}

/// Ledger command moving a counted location by `delta`.
fn adjustment_command(
    cell: &StockCell,
    line: &InventoryLine,
    session_id: InventorySessionId,
    delta: Quantity,
    actor: UserId,
    occurred_at: DateTime<Utc>,
) -> StockCommand {
    let profile = cell.profile();
    let reference = Some(DocumentRef::InventoryLine {
        session_id,
        line_id: line.id,
    });
    if delta > 0 {
        StockCommand::Receive(Receive {
            lot_id: LotId::new(),
            quantity: delta,
            unit_cost: line.unit_cost,
            movement_type: MovementType::InventoryAdjustment,
            attributes: LotAttributes {
                lot_number: (profile.tracking == TrackingMode::ByLot).then(|| format!("INV-{}", line.id)),
                location_id: line.location_id,
                ..LotAttributes::default()
            },
            reference,
            actor,
            occurred_at,
        })
    } else {
        StockCommand::Exit(Exit {
            quantity: -delta,
            selection: Selection::Location {
                location_id: line.location_id,
                policy: profile.valuation.allocation_policy(),
            },
            movement_type: MovementType::InventoryAdjustment,
            reference,
            actor,
            occurred_at,
        })
    }
}

impl<S, B, C> InventoryEngine<S, B, C>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    C: Catalog,
{
    /// Snapshot every (article, location) in scope that holds stock.
    #[instrument(skip(self), fields(warehouse = %scope.warehouse_id))]
    pub fn open_inventory_session(&self, scope: InventoryScope, actor: UserId) -> EngineResult<InventorySession> {
        if self.catalog.warehouse(scope.warehouse_id).is_none() {
            return Err(DomainError::not_found(EntityRef::Warehouse(scope.warehouse_id)).into());
        }
        if let Some(zone_id) = scope.zone_id {
            let zone = self
                .catalog
                .zone(zone_id)
                .ok_or_else(|| DomainError::validation(format!("unknown zone {zone_id}")))?;
            if zone.warehouse_id != scope.warehouse_id {
                return Err(DomainError::validation(format!(
                    "zone {} is not part of warehouse {}",
                    zone.code, scope.warehouse_id
                ))
                .into());
            }
        }

        let mut lines = Vec::new();
        for (key, handle) in self.cells_of_warehouse(scope.warehouse_id)? {
            if let Some(category) = &scope.category {
                let in_category = self
                    .catalog
                    .article(key.article_id)
                    .is_some_and(|a| a.category.as_deref() == Some(category.as_str()));
                if !in_category {
                    continue;
                }
            }
            let cell = lock(&handle, "stock cell")?;
            for (location_id, quantity) in cell.quantities_by_location() {
                if quantity == 0 || !self.in_zone(&scope, location_id) {
                    continue;
                }
                lines.push(snapshot(&cell, location_id, quantity));
            }
        }
        lines.sort_by_key(|l| (l.article_id, l.location_id));

        let session_id = InventorySessionId::new();
        let mut session = InventorySession::empty(session_id);
        let events = session.handle(&SessionCommand::Open(OpenSession {
            session_id,
            scope,
            lines,
            actor,
            occurred_at: Utc::now(),
        }))?;
        let outbox = self.commit_document(StreamId::inventory_session(session_id), session.version(), &events)?;
        for event in &events {
            session.apply(event);
        }
        write(&self.index, "engine index")?.session(session_id, &events);
        write(&self.sessions, "session registry")?.insert(session_id, Arc::new(Mutex::new(session.clone())));
        self.publish(outbox);

        info!(session = %session_id, lines = session.lines().len(), "inventory session opened");
        Ok(session)
    }

    fn in_zone(&self, scope: &InventoryScope, location_id: Option<LocationId>) -> bool {
        let Some(zone_id) = scope.zone_id else {
            return true;
        };
        location_id
            .and_then(|id| self.catalog.location(id))
            .is_some_and(|l| l.zone_id == Some(zone_id))
    }

    #[instrument(skip(self))]
    pub fn start_session(&self, session_id: InventorySessionId) -> EngineResult<InventorySession> {
        let handle = self.session_handle(session_id)?;
        let (session, _) = self.run_document(
            &handle,
            StreamId::inventory_session(session_id),
            "inventory session",
            &SessionCommand::Start {
                occurred_at: Utc::now(),
            },
        )?;
        Ok(session)
    }

    /// Add a line the opening snapshot did not cover, e.g. stock found
    /// where none was expected.
    #[instrument(skip(self))]
    pub fn add_count_line(
        &self,
        session_id: InventorySessionId,
        article_id: ArticleId,
        location_id: Option<LocationId>,
    ) -> EngineResult<InventoryLine> {
        let handle = self.session_handle(session_id)?;
        let warehouse_id = lock(&handle, "inventory session")?
            .warehouse_id()
            .ok_or_else(|| DomainError::not_found(EntityRef::InventorySession(session_id)))?;
        if let Some(location_id) = location_id {
            let here = self
                .catalog
                .location(location_id)
                .is_some_and(|l| l.warehouse_id == warehouse_id);
            if !here {
                return Err(DomainError::validation(format!(
                    "location {location_id} is not in the session's warehouse"
                ))
                .into());
            }
        }

        let key = StockKey::new(article_id, warehouse_id);
        let cell = self.cell_handle(key)?;
        let line = {
            let cell = lock(&cell, "stock cell")?;
            let theoretical = cell.quantities_by_location().get(&location_id).copied().unwrap_or(0);
            snapshot(&cell, location_id, theoretical)
        };

        let (session, events) = self.run_document(
            &handle,
            StreamId::inventory_session(session_id),
            "inventory session",
            &SessionCommand::AddLine {
                snapshot: line,
                occurred_at: Utc::now(),
            },
        )?;
        write(&self.index, "engine index")?.session(session_id, &events);

        session
            .lines()
            .last()
            .cloned()
            .ok_or_else(|| DomainError::conflict("line was not added").into())
    }

    #[instrument(skip(self))]
    pub fn record_count(&self, line_id: InventoryLineId, counted: Quantity) -> EngineResult<CountEntry> {
        let session_id = self.locate_line(line_id)?;
        let handle = self.session_handle(session_id)?;
        let (session, _) = self.run_document(
            &handle,
            StreamId::inventory_session(session_id),
            "inventory session",
            &SessionCommand::RecordCount(RecordCount {
                line_id,
                counted,
                policy: self.config.counting.recount_policy(),
                occurred_at: Utc::now(),
            }),
        )?;
        let line = session
            .line(line_id)
            .ok_or_else(|| DomainError::not_found(EntityRef::InventoryLine(line_id)))?;

        if line.recount_required {
            warn!(variance = ?line.variance(), "variance calls for a recount");
        }
        Ok(CountEntry {
            session_id,
            line_id,
            theoretical: line.theoretical,
            counted,
            recount_required: line.recount_required,
        })
    }

    /// Record the decision on a counted line.
    ///
    /// `Adjust` brings the location to the counted figure in the same
    /// append as the decision. The quantity posted is measured against the
    /// stock held now, so movements since the session opened are not
    /// counted twice: a surplus enters as a new lot at the snapshot cost,
    /// a shortfall leaves the counted location by the article's policy.
    #[instrument(skip(self))]
    pub fn validate_line(
        &self,
        line_id: InventoryLineId,
        decision: LineDecision,
        acknowledge_recount: bool,
        actor: UserId,
    ) -> EngineResult<InventoryLine> {
        let session_id = self.locate_line(line_id)?;
        let handle = self.session_handle(session_id)?;
        let stream = StreamId::inventory_session(session_id);

        let (line, outbox) = {
            let mut session = lock(&handle, "inventory session")?;
            let line = session.check_validation(line_id, decision, acknowledge_recount)?.clone();
            let warehouse_id = session
                .warehouse_id()
                .ok_or_else(|| DomainError::not_found(EntityRef::InventorySession(session_id)))?;
            let now = Utc::now();
            let validate = |movements, posted| {
                SessionCommand::ValidateLine(ValidateLine {
                    line_id,
                    decision,
                    acknowledge_recount,
                    movements,
                    posted,
                    occurred_at: now,
                })
            };

            let (events, outbox) = match (decision, line.counted) {
                (LineDecision::Adjust, Some(counted)) => {
                    let key = StockKey::new(line.article_id, warehouse_id);
                    self.transact(&[key], |tx| {
                        let held = tx
                            .cell(key)?
                            .quantities_by_location()
                            .get(&line.location_id)
                            .copied()
                            .unwrap_or(0);
                        let delta = counted - held;
                        if delta != line.variance().unwrap_or(0) {
                            warn!(snapshot = line.theoretical, held, counted, "stock moved since the count snapshot");
                        }
                        let movements = if delta == 0 {
                            Vec::new()
                        } else {
                            let command = adjustment_command(tx.cell(key)?, &line, session_id, delta, actor, now);
                            tx.execute(key, &command)?
                                .iter()
                                .filter_map(|e| match e {
                                    StockEvent::MovementPosted(m) => Some(m.id),
                                    _ => None,
                                })
                                .collect()
                        };

                        let events = session.handle(&validate(movements, Some(delta)))?;
                        tx.record(stream, session.version(), &events)?;
                        Ok(events)
                    })?
                }
                _ => {
                    let events = session.handle(&validate(Vec::new(), None))?;
                    let outbox = self.commit_document(stream, session.version(), &events)?;
                    (events, outbox)
                }
            };

            for event in &events {
                session.apply(event);
            }
            let line = session
                .line(line_id)
                .cloned()
                .ok_or_else(|| DomainError::not_found(EntityRef::InventoryLine(line_id)))?;
            (line, outbox)
        };
        self.publish(outbox);

        info!(status = %line.status, variance = ?line.variance(), "inventory line validated");
        Ok(line)
    }

    /// Close once every line is validated, adjusted or excluded.
    #[instrument(skip(self))]
    pub fn close_session(&self, session_id: InventorySessionId) -> EngineResult<InventorySession> {
        let handle = self.session_handle(session_id)?;
        let (session, _) = self.run_document(
            &handle,
            StreamId::inventory_session(session_id),
            "inventory session",
            &SessionCommand::Close {
                occurred_at: Utc::now(),
            },
        )?;
        info!(adjustments = session.adjustments().len(), "inventory session closed");
        Ok(session)
    }

    /// Cancel an open session. Adjustments already posted stay posted.
    #[instrument(skip(self))]
    pub fn cancel_session(&self, session_id: InventorySessionId, reason: Option<String>) -> EngineResult<InventorySession> {
        let handle = self.session_handle(session_id)?;
        let (session, _) = self.run_document(
            &handle,
            StreamId::inventory_session(session_id),
            "inventory session",
            &SessionCommand::Cancel {
                reason,
                occurred_at: Utc::now(),
            },
        )?;
        if !session.adjustments().is_empty() {
            warn!(
                adjustments = session.adjustments().len(),
                "cancelled session keeps the adjustments it posted"
            );
        }
        Ok(session)
    }

    pub fn session(&self, session_id: InventorySessionId) -> EngineResult<InventorySession> {
        let handle = self.session_handle(session_id)?;
        let session = lock(&handle, "inventory session")?;
        Ok(session.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depotledger_core::{ErrorKind, WarehouseId};
    use depotledger_events::InMemoryEventBus;
    use depotledger_inventory::{Article, LineStatus, Location, SessionStatus, Warehouse};
    use rust_decimal_macros::dec;

    use crate::catalog::InMemoryCatalog;
    use crate::config::EngineConfig;
    use crate::engine::{DirectExit, Reception};
    use crate::event_store::InMemoryEventStore;

    type Engine = InventoryEngine<InMemoryEventStore, InMemoryEventBus<EventEnvelope<JsonValue>>, InMemoryCatalog>;

    fn engine_with(article: &Article, warehouse: &Warehouse, locations: &[Location]) -> Engine {
        let catalog = InMemoryCatalog::new();
        catalog.upsert_article(article.clone()).unwrap();
        catalog.add_warehouse(warehouse.clone());
        for location in locations {
            catalog.add_location(location.clone());
        }
        InventoryEngine::new(
            InMemoryEventStore::new(),
            InMemoryEventBus::new(),
            catalog,
            EngineConfig::default(),
        )
    }

    fn location(warehouse_id: WarehouseId, code: &str) -> Location {
        Location {
            id: LocationId::new(),
            warehouse_id,
            zone_id: None,
            code: code.into(),
        }
    }

    #[test]
    fn sessions_snapshot_each_location_separately() {
        let article = Article::new("SKU-1", "Bolt");
        let warehouse = Warehouse::new("WH-A", "Main");
        let (a1, a2) = (location(warehouse.id, "A-1"), location(warehouse.id, "A-2"));
        let engine = engine_with(&article, &warehouse, &[a1.clone(), a2.clone()]);
        let actor = UserId::new();
        for (loc, qty) in [(&a1, 30), (&a2, 70)] {
            engine
                .post_reception(
                    Reception::new(article.id, warehouse.id, qty, dec!(1), actor)
                        .with_attributes(LotAttributes::default().at(loc.id)),
                )
                .unwrap();
        }

        let session = engine
            .open_inventory_session(InventoryScope::warehouse(warehouse.id), actor)
            .unwrap();
        let mut theoretical: Vec<_> = session.lines().iter().map(|l| l.theoretical).collect();
        theoretical.sort();
        assert_eq!(theoretical, vec![30, 70]);
        assert_eq!(session.status(), SessionStatus::Draft);
    }

    #[test]
    fn surplus_is_received_at_the_snapshot_cost() {
        let article = Article::new("SKU-1", "Bolt");
        let warehouse = Warehouse::new("WH-A", "Main");
        let engine = engine_with(&article, &warehouse, &[]);
        let actor = UserId::new();
        engine
            .post_reception(Reception::new(article.id, warehouse.id, 10, dec!(4), actor))
            .unwrap();

        let session = engine
            .open_inventory_session(InventoryScope::warehouse(warehouse.id), actor)
            .unwrap();
        let line_id = session.lines()[0].id;
        let entry = engine.record_count(line_id, 11).unwrap();
        assert_eq!(entry.variance(), 1);
        assert!(!entry.recount_required);

        let line = engine.validate_line(line_id, LineDecision::Adjust, false, actor).unwrap();
        assert_eq!(line.status, LineStatus::Adjusted);
        assert_eq!(engine.stock_level(article.id, warehouse.id).unwrap().theoretical, 11);

        let adjustments = engine.session(session.id_typed()).unwrap().adjustments().to_vec();
        assert_eq!(adjustments[0].value, dec!(4));
        assert_eq!(adjustments[0].movements.len(), 1);
    }

    #[test]
    fn rejected_validation_posts_nothing() {
        let article = Article::new("SKU-1", "Bolt");
        let warehouse = Warehouse::new("WH-A", "Main");
        let engine = engine_with(&article, &warehouse, &[]);
        let actor = UserId::new();
        engine
            .post_reception(Reception::new(article.id, warehouse.id, 10, dec!(1), actor))
            .unwrap();
        let session = engine
            .open_inventory_session(InventoryScope::warehouse(warehouse.id), actor)
            .unwrap();
        let line_id = session.lines()[0].id;

        let entry = engine.record_count(line_id, 4).unwrap();
        assert!(entry.recount_required);
        let err = engine
            .validate_line(line_id, LineDecision::Adjust, false, actor)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(engine.stock_level(article.id, warehouse.id).unwrap().theoretical, 10);
    }

    #[test]
    fn sessions_close_only_when_every_line_is_decided() {
        let article = Article::new("SKU-1", "Bolt");
        let warehouse = Warehouse::new("WH-A", "Main");
        let engine = engine_with(&article, &warehouse, &[]);
        let actor = UserId::new();
        engine
            .post_reception(Reception::new(article.id, warehouse.id, 10, dec!(1), actor))
            .unwrap();
        let session = engine
            .open_inventory_session(InventoryScope::warehouse(warehouse.id), actor)
            .unwrap();
        let id = session.id_typed();
        engine.start_session(id).unwrap();
        assert!(engine.close_session(id).is_err());

        let line_id = session.lines()[0].id;
        engine.record_count(line_id, 10).unwrap();
        engine.validate_line(line_id, LineDecision::Accept, false, actor).unwrap();
        let closed = engine.close_session(id).unwrap();
        assert_eq!(closed.status(), SessionStatus::Closed);
    }

    #[test]
    fn unexpected_stock_gets_its_own_line() {
        let article = Article::new("SKU-1", "Bolt");
        let warehouse = Warehouse::new("WH-A", "Main");
        let engine = engine_with(&article, &warehouse, &[]);
        let actor = UserId::new();
        let session = engine
            .open_inventory_session(InventoryScope::warehouse(warehouse.id), actor)
            .unwrap();
        assert!(session.lines().is_empty());

        let line = engine.add_count_line(session.id_typed(), article.id, None).unwrap();
        assert_eq!(line.theoretical, 0);
        engine.record_count(line.id, 3).unwrap();
        engine
            .validate_line(line.id, LineDecision::Adjust, true, actor)
            .unwrap();
        assert_eq!(engine.stock_level(article.id, warehouse.id).unwrap().theoretical, 3);
    }

    #[test]
    fn adjustment_lands_on_the_counted_figure_after_later_movements() {
        let article = Article::new("SKU-1", "Bolt");
        let warehouse = Warehouse::new("WH-A", "Main");
        let engine = engine_with(&article, &warehouse, &[]);
        let actor = UserId::new();
        engine
            .post_reception(Reception::new(article.id, warehouse.id, 100, dec!(1), actor))
            .unwrap();
        let session = engine
            .open_inventory_session(InventoryScope::warehouse(warehouse.id), actor)
            .unwrap();
        let line_id = session.lines()[0].id;
        assert_eq!(engine.record_count(line_id, 95).unwrap().variance(), -5);

        // Two units leave between the count and its validation.
        engine
            .post_direct_exit(DirectExit::sale(article.id, warehouse.id, 2, actor))
            .unwrap();

        let line = engine.validate_line(line_id, LineDecision::Adjust, false, actor).unwrap();
        assert_eq!(line.status, LineStatus::Adjusted);
        assert_eq!(engine.stock_level(article.id, warehouse.id).unwrap().theoretical, 95);
        let adjustments = engine.session(session.id_typed()).unwrap().adjustments().to_vec();
        assert_eq!(adjustments[0].quantity, -3);
    }
}
