//! The inventory engine: the service collaborators call into.
//!
//! It owns one locked `StockCell` per (article, warehouse), plus the
//! transfer and inventory-session documents, and drives them against the
//! event store:
//!
//! ```text
//! lock document (if any) → lock cells in key order → decide on drafts
//!   → verify drafts → append every stream atomically → swap drafts in
//!   → release locks → publish
//! ```
//!
//! Nothing is written when any step before the append fails, and nothing
//! is published before the append succeeded. Different (article,
//! warehouse) pairs never contend.

mod counts;
mod error;
mod ledger;
mod notify;
mod reservations;
mod transfers;
mod valuation;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::{error, info};
use uuid::Uuid;

use depotledger_core::{
    Aggregate, AggregateRoot, ArticleId, DomainError, EntityRef, ExpectedVersion,
    InventoryLineId, InventorySessionId, LotId, MovementId, ReservationId, TransferId,
    WarehouseId,
};
use depotledger_events::{Event, EventBus, EventEnvelope, StreamId, Subscription};
use depotledger_inventory::{
    InventorySession, SessionEvent, StockCell, StockCommand, StockEvent, StockKey, Transfer,
    TransferEvent,
};

use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::event_store::{EventStore, StoredEvent, StreamAppend, UncommittedEvent};

pub use counts::CountEntry;
pub use error::{EngineError, EngineResult};
pub use ledger::{DirectExit, ExitOutcome, Reception, ReceptionOutcome};
pub use notify::StockAlert;
pub use reservations::{PickOutcome, ReservationRequest, SweepReport};
pub use transfers::{ReceiptRequest, TransferRequest};

use notify::Outbox;

type Shared<T> = Arc<Mutex<T>>;

/// Where every indexed entity lives.
#[derive(Debug, Default)]
struct Index {
    lots: HashMap<LotId, StockKey>,
    movements: HashMap<MovementId, StockKey>,
    reservations: HashMap<ReservationId, StockKey>,
    lines: HashMap<InventoryLineId, InventorySessionId>,
}

impl Index {
    fn stock(&mut self, key: StockKey, events: &[StockEvent]) {
        for event in events {
            match event {
                StockEvent::LotCreated(e) => {
                    self.lots.insert(e.lot.id, key);
                }
                StockEvent::MovementPosted(m) => {
                    self.movements.insert(m.id, key);
                }
                StockEvent::ReservationPlaced(r) => {
                    self.reservations.insert(r.id, key);
                }
                _ => {}
            }
        }
    }

    fn session(&mut self, session_id: InventorySessionId, events: &[SessionEvent]) {
        for event in events {
            match event {
                SessionEvent::Opened(e) => {
                    for line in &e.lines {
                        self.lines.insert(line.id, session_id);
                    }
                }
                SessionEvent::LineAdded { line, .. } => {
                    self.lines.insert(line.id, session_id);
                }
                _ => {}
            }
        }
    }
}

/// Inventory ledger and allocation service.
pub struct InventoryEngine<S, B, C> {
    store: S,
    bus: B,
    catalog: C,
    config: EngineConfig,
    cells: RwLock<HashMap<StockKey, Shared<StockCell>>>,
    transfers: RwLock<HashMap<TransferId, Shared<Transfer>>>,
    sessions: RwLock<HashMap<InventorySessionId, Shared<InventorySession>>>,
    index: RwLock<Index>,
}

impl<S, B, C> core::fmt::Debug for InventoryEngine<S, B, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InventoryEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Stock cells locked for one transaction.
///
/// Commands run against private drafts; the live cells only change once
/// the append succeeded.
pub(crate) struct CellTx {
    drafts: BTreeMap<StockKey, StockCell>,
    pending: BTreeMap<StockKey, Vec<StockEvent>>,
    documents: Vec<StreamAppend>,
}

impl CellTx {
    fn new(drafts: BTreeMap<StockKey, StockCell>) -> Self {
        Self {
            drafts,
            pending: BTreeMap::new(),
            documents: Vec::new(),
        }
    }

    /// Decide and apply `command` on the draft of `key`.
    pub(crate) fn execute(&mut self, key: StockKey, command: &StockCommand) -> EngineResult<Vec<StockEvent>> {
        let cell = self
            .drafts
            .get_mut(&key)
            .ok_or_else(|| DomainError::conflict(format!("{key} is not locked by this transaction")))?;
        let events = cell.execute(command)?;
        self.pending.entry(key).or_default().extend(events.iter().cloned());
        Ok(events)
    }

    pub(crate) fn cell(&self, key: StockKey) -> EngineResult<&StockCell> {
        self.drafts
            .get(&key)
            .ok_or_else(|| DomainError::conflict(format!("{key} is not locked by this transaction")).into())
    }

    /// Append document events in the same atomic write as the cells.
    pub(crate) fn record<E>(&mut self, stream: StreamId, current_version: u64, events: &[E]) -> EngineResult<()>
    where
        E: Event + Serialize,
    {
        self.documents.push(StreamAppend {
            stream,
            expected_version: ExpectedVersion::Exact(current_version),
            events: uncommitted(stream, events)?,
        });
        Ok(())
    }
}

fn uncommitted<E>(stream: StreamId, events: &[E]) -> EngineResult<Vec<UncommittedEvent>>
where
    E: Event + Serialize,
{
    events
        .iter()
        .map(|e| UncommittedEvent::from_typed(stream, Uuid::now_v7(), e).map_err(EngineError::from))
        .collect()
}

fn decode_stream<E: DeserializeOwned>(stream: StreamId, history: &[StoredEvent]) -> EngineResult<Vec<E>> {
    history
        .iter()
        .map(|stored| {
            stored.decode().map_err(|source| EngineError::Decode {
                stream,
                sequence: stored.sequence_number,
                source,
            })
        })
        .collect()
}

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> EngineResult<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| EngineError::Poisoned(what))
}

fn read<'a, T>(lock: &'a RwLock<T>, what: &'static str) -> EngineResult<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| EngineError::Poisoned(what))
}

fn write<'a, T>(lock: &'a RwLock<T>, what: &'static str) -> EngineResult<RwLockWriteGuard<'a, T>> {
    lock.write().map_err(|_| EngineError::Poisoned(what))
}

impl<S, B, C> InventoryEngine<S, B, C> {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S, B, C> InventoryEngine<S, B, C>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    C: Catalog,
{
    /// Engine over an empty store.
    pub fn new(store: S, bus: B, catalog: C, config: EngineConfig) -> Self {
        Self {
            store,
            bus,
            catalog,
            config,
            cells: RwLock::new(HashMap::new()),
            transfers: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            index: RwLock::new(Index::default()),
        }
    }

    /// Rebuild every aggregate and index from the store.
    ///
    /// Stock cells take their article profile from the catalog and are
    /// verified after replay; a cell that fails verification aborts the
    /// restore.
    pub fn restore(store: S, bus: B, catalog: C, config: EngineConfig) -> EngineResult<Self> {
        let engine = Self::new(store, bus, catalog, config);
        let mut cells = HashMap::new();
        let mut transfers = HashMap::new();
        let mut sessions = HashMap::new();
        let mut index = Index::default();

        for stream in engine.store.streams()? {
            let history = engine.store.load_stream(stream)?;
            match stream {
                StreamId::Stock {
                    article_id,
                    warehouse_id,
                } => {
                    let key = StockKey::new(article_id, warehouse_id);
                    let article = engine
                        .catalog
                        .article(article_id)
                        .ok_or_else(|| DomainError::not_found(EntityRef::Article(article_id)))?;
                    let events: Vec<StockEvent> = decode_stream(stream, &history)?;
                    let cell = StockCell::empty(key, article.profile()).replay(&events);
                    if let Err(e) = cell.verify() {
                        error!(%key, error = %e, "stock cell failed verification on restore");
                        return Err(e.into());
                    }
                    index.stock(key, &events);
                    cells.insert(key, Arc::new(Mutex::new(cell)));
                }
                StreamId::Transfer { transfer_id } => {
                    let events: Vec<TransferEvent> = decode_stream(stream, &history)?;
                    let transfer = Transfer::empty(transfer_id).replay(&events);
                    transfers.insert(transfer_id, Arc::new(Mutex::new(transfer)));
                }
                StreamId::InventorySession { session_id } => {
                    let events: Vec<SessionEvent> = decode_stream(stream, &history)?;
                    index.session(session_id, &events);
                    let session = InventorySession::empty(session_id).replay(&events);
                    sessions.insert(session_id, Arc::new(Mutex::new(session)));
                }
            }
        }

        info!(
            cells = cells.len(),
            transfers = transfers.len(),
            sessions = sessions.len(),
            "inventory engine restored"
        );

        *write(&engine.cells, "cell registry")? = cells;
        *write(&engine.transfers, "transfer registry")? = transfers;
        *write(&engine.sessions, "session registry")? = sessions;
        *write(&engine.index, "engine index")? = index;
        Ok(engine)
    }

    /// Subscribe to committed events and stock alerts.
    pub fn subscribe(&self) -> Subscription<EventEnvelope<JsonValue>> {
        self.bus.subscribe()
    }

    /// Existing cell, or a fresh one for a pair that has never moved.
    ///
    /// A ledger append for an unknown article or warehouse is malformed.
    fn cell_handle(&self, key: StockKey) -> EngineResult<Shared<StockCell>> {
        if let Some(cell) = read(&self.cells, "cell registry")?.get(&key) {
            return Ok(Arc::clone(cell));
        }
        let article = self.catalog.article(key.article_id).ok_or_else(|| {
            DomainError::invalid_movement(format!("unknown article {}", key.article_id))
        })?;
        if self.catalog.warehouse(key.warehouse_id).is_none() {
            return Err(DomainError::invalid_movement(format!("unknown warehouse {}", key.warehouse_id)).into());
        }

        let mut cells = write(&self.cells, "cell registry")?;
        let cell = cells
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(StockCell::empty(key, article.profile()))));
        Ok(Arc::clone(cell))
    }

    fn find_cell(&self, key: StockKey) -> EngineResult<Option<Shared<StockCell>>> {
        Ok(read(&self.cells, "cell registry")?.get(&key).cloned())
    }

    /// Every cell of one article, or of one warehouse, in key order.
    fn cells_where(&self, keep: impl Fn(&StockKey) -> bool) -> EngineResult<Vec<(StockKey, Shared<StockCell>)>> {
        let cells = read(&self.cells, "cell registry")?;
        let mut out: Vec<(StockKey, Shared<StockCell>)> = cells
            .iter()
            .filter(|(key, _)| keep(key))
            .map(|(key, cell)| (*key, Arc::clone(cell)))
            .collect();
        out.sort_by_key(|(key, _)| *key);
        Ok(out)
    }

    fn cells_of_article(&self, article_id: ArticleId) -> EngineResult<Vec<(StockKey, Shared<StockCell>)>> {
        self.cells_where(|key| key.article_id == article_id)
    }

    fn cells_of_warehouse(&self, warehouse_id: WarehouseId) -> EngineResult<Vec<(StockKey, Shared<StockCell>)>> {
        self.cells_where(|key| key.warehouse_id == warehouse_id)
    }

    fn locate_lot(&self, lot_id: LotId) -> EngineResult<StockKey> {
        read(&self.index, "engine index")?
            .lots
            .get(&lot_id)
            .copied()
            .ok_or_else(|| DomainError::not_found(EntityRef::Lot(lot_id)).into())
    }

    fn locate_movement(&self, movement_id: MovementId) -> EngineResult<StockKey> {
        read(&self.index, "engine index")?
            .movements
            .get(&movement_id)
            .copied()
            .ok_or_else(|| DomainError::not_found(EntityRef::Movement(movement_id)).into())
    }

    fn locate_reservation(&self, reservation_id: ReservationId) -> EngineResult<StockKey> {
        read(&self.index, "engine index")?
            .reservations
            .get(&reservation_id)
            .copied()
            .ok_or_else(|| DomainError::not_found(EntityRef::Reservation(reservation_id)).into())
    }

    fn locate_line(&self, line_id: InventoryLineId) -> EngineResult<InventorySessionId> {
        read(&self.index, "engine index")?
            .lines
            .get(&line_id)
            .copied()
            .ok_or_else(|| DomainError::not_found(EntityRef::InventoryLine(line_id)).into())
    }

    fn transfer_handle(&self, transfer_id: TransferId) -> EngineResult<Shared<Transfer>> {
        read(&self.transfers, "transfer registry")?
            .get(&transfer_id)
            .cloned()
            .ok_or_else(|| DomainError::not_found(EntityRef::Transfer(transfer_id)).into())
    }

    fn session_handle(&self, session_id: InventorySessionId) -> EngineResult<Shared<InventorySession>> {
        read(&self.sessions, "session registry")?
            .get(&session_id)
            .cloned()
            .ok_or_else(|| DomainError::not_found(EntityRef::InventorySession(session_id)).into())
    }

    /// Run `work` with the cells of `keys` locked, then commit.
    ///
    /// Cells are locked in sorted key order, so overlapping transactions
    /// cannot deadlock. Document locks must be taken before calling this.
    fn transact<T, F>(&self, keys: &[StockKey], work: F) -> EngineResult<(T, Outbox)>
    where
        F: FnOnce(&mut CellTx) -> EngineResult<T>,
    {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let handles = keys
            .iter()
            .map(|key| Ok((*key, self.cell_handle(*key)?)))
            .collect::<EngineResult<Vec<_>>>()?;
        let mut guards = Vec::with_capacity(handles.len());
        for (key, handle) in &handles {
            guards.push((*key, lock(handle, "stock cell")?));
        }

        let mut tx = CellTx::new(guards.iter().map(|(key, cell)| (*key, (**cell).clone())).collect());
        let value = work(&mut tx)?;
        let CellTx {
            mut drafts,
            pending,
            documents,
        } = tx;

        for key in pending.keys() {
            if let Some(draft) = drafts.get(key) {
                if let Err(e) = draft.verify() {
                    error!(%key, error = %e, "refusing to commit an inconsistent stock cell");
                    return Err(e.into());
                }
            }
        }

        let mut batches = Vec::with_capacity(pending.len() + documents.len());
        for (key, cell) in &guards {
            if let Some(events) = pending.get(key).filter(|events| !events.is_empty()) {
                batches.push(StreamAppend {
                    stream: key.stream(),
                    expected_version: ExpectedVersion::Exact(cell.version()),
                    events: uncommitted(key.stream(), events)?,
                });
            }
        }
        batches.extend(documents);

        let committed = if batches.is_empty() {
            Vec::new()
        } else {
            self.store.append_all(batches)?
        };

        let mut outbox = Outbox::new(committed);
        for (key, cell) in guards.iter_mut() {
            if !pending.contains_key(key) {
                continue;
            }
            let Some(draft) = drafts.remove(key) else {
                continue;
            };
            let before = cell.level().available();
            **cell = draft;
            if let Some(article) = self.catalog.article(key.article_id) {
                outbox.check_thresholds(*key, &article.thresholds, before, &**cell);
            }
        }

        let mut index = write(&self.index, "engine index")?;
        for (key, events) in &pending {
            index.stock(*key, events);
        }

        Ok((value, outbox))
    }

    /// Append document events that touch no stock cell.
    fn commit_document<E>(&self, stream: StreamId, current_version: u64, events: &[E]) -> EngineResult<Outbox>
    where
        E: Event + Serialize,
    {
        if events.is_empty() {
            return Ok(Outbox::default());
        }
        let committed = self
            .store
            .append(uncommitted(stream, events)?, ExpectedVersion::Exact(current_version))?;
        Ok(Outbox::new(committed))
    }

    /// Run a command that only touches a document stream.
    fn run_document<A>(
        &self,
        handle: &Shared<A>,
        stream: StreamId,
        what: &'static str,
        command: &A::Command,
    ) -> EngineResult<(A, Vec<A::Event>)>
    where
        A: Aggregate + Clone,
        A::Event: Event + Serialize,
    {
        let (document, events, outbox) = {
            let mut document = lock(handle, what)?;
            let events = document.handle(command)?;
            let outbox = self.commit_document(stream, document.version(), &events)?;
            for event in &events {
                document.apply(event);
            }
            (document.clone(), events, outbox)
        };
        self.publish(outbox);
        Ok((document, events))
    }

    /// Publish committed events and alerts. Call with no lock held.
    fn publish(&self, outbox: Outbox) {
        if outbox.is_empty() {
            return;
        }
        outbox.publish(&self.bus);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depotledger_events::InMemoryEventBus;
    use depotledger_inventory::{Article, Warehouse};

    use crate::catalog::InMemoryCatalog;
    use crate::event_store::InMemoryEventStore;

    #[test]
    fn ledger_appends_for_unknown_pairs_are_malformed() {
        let catalog = InMemoryCatalog::new();
        let article = Article::new("SKU-1", "Bolt");
        catalog.upsert_article(article.clone()).unwrap();
        let engine = InventoryEngine::new(
            InMemoryEventStore::new(),
            InMemoryEventBus::new(),
            catalog,
            EngineConfig::default(),
        );

        let err = engine
            .cell_handle(StockKey::new(article.id, WarehouseId::new()))
            .unwrap_err();
        assert_eq!(err.kind(), depotledger_core::ErrorKind::InvalidMovement);
    }

    #[test]
    fn empty_transactions_write_nothing() {
        let catalog = InMemoryCatalog::new();
        let article = Article::new("SKU-1", "Bolt");
        let warehouse = Warehouse::new("WH-A", "Main");
        catalog.upsert_article(article.clone()).unwrap();
        catalog.add_warehouse(warehouse.clone());
        let engine = InventoryEngine::new(
            InMemoryEventStore::new(),
            InMemoryEventBus::new(),
            catalog,
            EngineConfig::default(),
        );

        let key = StockKey::new(article.id, warehouse.id);
        let (level, outbox) = engine
            .transact(&[key, key], |tx| Ok(tx.cell(key)?.level()))
            .unwrap();

        assert_eq!(level.theoretical, 0);
        assert!(outbox.is_empty());
        assert!(engine.store.streams().unwrap().is_empty());
    }
}
