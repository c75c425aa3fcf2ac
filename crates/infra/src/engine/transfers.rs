//! Interdepot transfers.
//!
//! The transfer document and the stock cells it touches are committed in
//! one append: shipping writes the transfer-out exits of every line plus
//! the `Shipped` event, receiving writes the transfer-in entries plus the
//! `Received` event and its variances.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use tracing::{info, instrument, warn};

use depotledger_core::{
    Aggregate, AggregateRoot, DomainError, EntityRef, LineShortage, LocationId, LotId, Quantity,
    TransferId, UserId, WarehouseId,
};
use depotledger_events::{EventBus, EventEnvelope, StreamId};
use depotledger_inventory::stock::{Exit, Receive};
use depotledger_inventory::transfer::{
    CreateTransfer, LineReceipt, LineShipment, RecordReceipt, RecordShipment, ResolveVariance,
};
use depotledger_inventory::{
    DocumentRef, LotAttributes, MovementType, Selection, ShippedPiece, StockCell, StockCommand,
    StockEvent, StockKey, TrackingMode, TransitVariance, Transfer, TransferCommand, TransferEvent,
    TransferLine, TransferLineRequest, TransferStatus,
};

use super::{EngineResult, InventoryEngine, lock, read, write};
use crate::catalog::Catalog;
use crate::event_store::EventStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub source: WarehouseId,
    pub destination: WarehouseId,
    pub lines: Vec<TransferLineRequest>,
    pub actor: UserId,
}

/// What arrived at the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptRequest {
    pub transfer_id: TransferId,
    /// Received quantity per line number; unlisted lines arrived in full.
    pub received: BTreeMap<u32, Quantity>,
    /// Location the new lots are put away to.
    pub location_id: Option<LocationId>,
    pub actor: UserId,
}

impl ReceiptRequest {
    /// Everything shipped arrived.
    pub fn complete(transfer_id: TransferId, actor: UserId) -> Self {
        Self {
            transfer_id,
            received: BTreeMap::new(),
            location_id: None,
            actor,
        }
    }

    pub fn with_line(mut self, line_no: u32, quantity: Quantity) -> Self {
        self.received.insert(line_no, quantity);
        self
    }

    pub fn at(mut self, location_id: LocationId) -> Self {
        self.location_id = Some(location_id);
        self
    }
}

impl<S, B, C> InventoryEngine<S, B, C>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    C: Catalog,
{
    #[instrument(skip(self), fields(source = %request.source, destination = %request.destination))]
    pub fn create_transfer(&self, request: TransferRequest) -> EngineResult<Transfer> {
        for warehouse_id in [request.source, request.destination] {
            if self.catalog.warehouse(warehouse_id).is_none() {
                return Err(DomainError::not_found(EntityRef::Warehouse(warehouse_id)).into());
            }
        }
        for line in &request.lines {
            if self.catalog.article(line.article_id).is_none() {
                return Err(DomainError::not_found(EntityRef::Article(line.article_id)).into());
            }
            if let Some(lot_id) = line.lot_id {
                if self.locate_lot(lot_id)? != StockKey::new(line.article_id, request.source) {
                    return Err(DomainError::validation(format!(
                        "lot {lot_id} is not held at the source warehouse for that article"
                    ))
                    .into());
                }
            }
        }

        let transfer_id = TransferId::new();
        let mut transfer = Transfer::empty(transfer_id);
        let events = transfer.handle(&TransferCommand::Create(CreateTransfer {
            transfer_id,
            source: request.source,
            destination: request.destination,
            lines: request.lines,
            actor: request.actor,
            occurred_at: Utc::now(),
        }))?;
        let outbox = self.commit_document(StreamId::transfer(transfer_id), transfer.version(), &events)?;
        for event in &events {
            transfer.apply(event);
        }
        write(&self.transfers, "transfer registry")?.insert(transfer_id, Arc::new(Mutex::new(transfer.clone())));
        self.publish(outbox);

        info!(transfer = %transfer_id, lines = transfer.lines().len(), "transfer created");
        Ok(transfer)
    }

    /// Check that the source covers every line, then validate.
    ///
    /// The whole document is rejected when any line is short, listing all
    /// of them.
    #[instrument(skip(self))]
    pub fn validate_transfer(&self, transfer_id: TransferId) -> EngineResult<Transfer> {
        let handle = self.transfer_handle(transfer_id)?;
        let (transfer, outbox) = {
            let mut transfer = lock(&handle, "transfer")?;
            let events = transfer.handle(&TransferCommand::Validate {
                occurred_at: Utc::now(),
            })?;

            let short = self.shortages(&transfer)?;
            if !short.is_empty() {
                warn!(short_lines = short.len(), "transfer cannot be covered by its source");
                return Err(DomainError::TransferShortage {
                    transfer: transfer_id,
                    lines: short,
                }
                .into());
            }

            let outbox = self.commit_document(StreamId::transfer(transfer_id), transfer.version(), &events)?;
            for event in &events {
                transfer.apply(event);
            }
            (transfer.clone(), outbox)
        };
        self.publish(outbox);

        info!("transfer validated");
        Ok(transfer)
    }

    /// Lines the source cannot cover right now.
    ///
    /// Lines naming a lot ship before policy lines, so each is checked
    /// against its own lot, shared with any other line naming that lot.
    /// All lines of an article then compete for the article's
    /// allocatable availability.
    fn shortages(&self, transfer: &Transfer) -> EngineResult<Vec<LineShortage>> {
        let mut short = Vec::new();
        for (article_id, requested) in transfer.requested_by_article() {
            let key = StockKey::new(article_id, transfer.source());
            let cell = match self.find_cell(key)? {
                Some(cell) => Some(lock(&cell, "stock cell")?.clone()),
                None => None,
            };
            let available = cell.as_ref().map_or(0, |cell| {
                let allocatable: Quantity = cell.lots().filter(|l| l.is_allocatable()).map(|l| l.quantity).sum();
                allocatable.min(cell.level().available())
            });

            let lines: Vec<&TransferLine> = transfer.lines().iter().filter(|l| l.article_id == article_id).collect();
            let mut per_lot: BTreeMap<LotId, Quantity> = BTreeMap::new();
            for line in &lines {
                if let Some(lot_id) = line.lot_id {
                    *per_lot.entry(lot_id).or_insert(0) += line.requested;
                }
            }

            for line in lines {
                let lot_short = line.lot_id.and_then(|lot_id| {
                    let in_lot = cell
                        .as_ref()
                        .and_then(|cell| cell.lot(&lot_id))
                        .filter(|lot| lot.is_allocatable())
                        .map_or(0, |lot| lot.quantity)
                        .min(available);
                    let wanted = per_lot.get(&lot_id).copied().unwrap_or(line.requested);
                    (wanted > in_lot).then_some(in_lot)
                });
                let shortfall = lot_short.or_else(|| (requested > available).then_some(available));
                if let Some(available) = shortfall {
                    short.push(LineShortage {
                        line_no: line.line_no,
                        article_id,
                        requested: line.requested,
                        available,
                    });
                }
            }
        }
        Ok(short)
    }

    /// Post the transfer-out exits of every line; all or nothing.
    #[instrument(skip(self))]
    pub fn ship_transfer(&self, transfer_id: TransferId, actor: UserId) -> EngineResult<Transfer> {
        let handle = self.transfer_handle(transfer_id)?;
        let (transfer, outbox) = {
            let mut transfer = lock(&handle, "transfer")?;
            if !transfer.status().can_transition_to(TransferStatus::Shipped) {
                return Err(DomainError::transition(EntityRef::Transfer(transfer_id), transfer.status(), "ship").into());
            }

            let source = transfer.source();
            let keys: Vec<StockKey> = transfer
                .lines()
                .iter()
                .map(|l| StockKey::new(l.article_id, source))
                .collect();
            let now = Utc::now();

            let (events, outbox) = self
                .transact(&keys, |tx| {
                    // Named lots first, so a policy line cannot drain them.
                    let mut ordered: Vec<&TransferLine> = transfer.lines().iter().collect();
                    ordered.sort_by_key(|l| (l.lot_id.is_none(), l.line_no));

                    let mut shipments = Vec::with_capacity(ordered.len());
                    for line in ordered {
                        let key = StockKey::new(line.article_id, source);
                        let selection = match line.lot_id {
                            Some(lot_id) => Selection::Lot { lot_id },
                            None => Selection::Policy {
                                policy: tx.cell(key)?.profile().valuation.allocation_policy(),
                            },
                        };
                        let exit = StockCommand::Exit(Exit {
                            quantity: line.requested,
                            selection,
                            movement_type: MovementType::TransferOut,
                            reference: Some(DocumentRef::TransferLine {
                                transfer_id,
                                line_no: line.line_no,
                            }),
                            actor,
                            occurred_at: now,
                        });
                        let events = tx.execute(key, &exit)?;
                        shipments.push(LineShipment {
                            line_no: line.line_no,
                            pieces: shipped_pieces(tx.cell(key)?, &events)?,
                        });
                    }

                    let events = transfer.handle(&TransferCommand::RecordShipment(RecordShipment {
                        lines: shipments,
                        occurred_at: now,
                    }))?;
                    tx.record(StreamId::transfer(transfer_id), transfer.version(), &events)?;
                    Ok(events)
                })
                .inspect_err(|e| warn!(error = %e, "transfer shipment rejected"))?;

            for event in &events {
                transfer.apply(event);
            }
            (transfer.clone(), outbox)
        };
        self.publish(outbox);

        info!(shipped_value = %transfer.lines().iter().map(TransferLine::shipped_value).sum::<Decimal>(), "transfer shipped");
        Ok(transfer)
    }

    /// Post the transfer-in entries and record any loss in transit.
    #[instrument(skip(self), fields(transfer = %request.transfer_id))]
    pub fn receive_transfer(&self, request: ReceiptRequest) -> EngineResult<Transfer> {
        let handle = self.transfer_handle(request.transfer_id)?;
        let transfer_id = request.transfer_id;
        let preserve = self.config.transfers.preserve_lot_identity;
        let policy = self.config.transfers.shortfall_policy;

        let (transfer, outbox) = {
            let mut transfer = lock(&handle, "transfer")?;
            if !transfer.status().can_transition_to(TransferStatus::Received) {
                return Err(
                    DomainError::transition(EntityRef::Transfer(transfer_id), transfer.status(), "receive").into(),
                );
            }
            if let Some(location_id) = request.location_id {
                let at_destination = self
                    .catalog
                    .location(location_id)
                    .is_some_and(|l| l.warehouse_id == transfer.destination());
                if !at_destination {
                    return Err(DomainError::validation(format!(
                        "location {location_id} is not in the destination warehouse"
                    ))
                    .into());
                }
            }
            for line_no in request.received.keys() {
                if transfer.line(*line_no).is_none() {
                    return Err(DomainError::not_found(EntityRef::TransferLine(transfer_id, *line_no)).into());
                }
            }

            let destination = transfer.destination();
            let keys: Vec<StockKey> = transfer
                .lines()
                .iter()
                .map(|l| StockKey::new(l.article_id, destination))
                .collect();
            let now = Utc::now();

            let (events, outbox) = self.transact(&keys, |tx| {
                let mut receipts = Vec::with_capacity(transfer.lines().len());
                for line in transfer.lines() {
                    let key = StockKey::new(line.article_id, destination);
                    let quantity = request.received.get(&line.line_no).copied().unwrap_or(line.shipped);
                    let arrival = Arrival {
                        transfer_id,
                        location_id: request.location_id,
                        tracking: tx.cell(key)?.profile().tracking,
                        actor: request.actor,
                        occurred_at: now,
                    };
                    let receives = if preserve {
                        arrival.lot_per_piece(line, quantity)
                    } else {
                        arrival.lot_per_line(line, quantity).into_iter().collect()
                    };

                    let mut destination_lots = Vec::with_capacity(receives.len());
                    for receive in receives {
                        destination_lots.push(receive.lot_id);
                        tx.execute(key, &StockCommand::Receive(receive))?;
                    }
                    receipts.push(LineReceipt {
                        line_no: line.line_no,
                        quantity,
                        destination_lots,
                    });
                }

                let events = transfer.handle(&TransferCommand::RecordReceipt(RecordReceipt {
                    lines: receipts,
                    policy,
                    occurred_at: now,
                }))?;
                tx.record(StreamId::transfer(transfer_id), transfer.version(), &events)?;
                Ok(events)
            })?;

            for event in &events {
                if let TransferEvent::Received(received) = event {
                    for variance in &received.variances {
                        warn!(
                            line = variance.line_no,
                            missing = variance.quantity,
                            value = %variance.value,
                            status = %variance.status,
                            "loss in transit recorded"
                        );
                    }
                }
                transfer.apply(event);
            }
            (transfer.clone(), outbox)
        };
        self.publish(outbox);

        info!("transfer received");
        Ok(transfer)
    }

    /// Cancel before shipping; nothing was posted, so nothing is reversed.
    #[instrument(skip(self))]
    pub fn cancel_transfer(&self, transfer_id: TransferId, reason: Option<String>) -> EngineResult<Transfer> {
        let handle = self.transfer_handle(transfer_id)?;
        let (transfer, _) = self.run_document(
            &handle,
            StreamId::transfer(transfer_id),
            "transfer",
            &TransferCommand::Cancel {
                reason,
                occurred_at: Utc::now(),
            },
        )?;
        info!("transfer cancelled");
        Ok(transfer)
    }

    /// Close the human review of a loss in transit.
    #[instrument(skip(self))]
    pub fn resolve_transit_variance(
        &self,
        transfer_id: TransferId,
        line_no: u32,
        note: String,
    ) -> EngineResult<Transfer> {
        let handle = self.transfer_handle(transfer_id)?;
        let (transfer, _) = self.run_document(
            &handle,
            StreamId::transfer(transfer_id),
            "transfer",
            &TransferCommand::ResolveVariance(ResolveVariance {
                line_no,
                note,
                occurred_at: Utc::now(),
            }),
        )?;
        info!("transit variance resolved");
        Ok(transfer)
    }

    pub fn transfer(&self, transfer_id: TransferId) -> EngineResult<Transfer> {
        let handle = self.transfer_handle(transfer_id)?;
        let transfer = lock(&handle, "transfer")?;
        Ok(transfer.clone())
    }

    /// Variances still awaiting resolution, over every transfer.
    pub fn open_transit_variances(&self) -> EngineResult<Vec<(TransferId, TransitVariance)>> {
        let handles: Vec<_> = read(&self.transfers, "transfer registry")?
            .iter()
            .map(|(id, handle)| (*id, Arc::clone(handle)))
            .collect();
        let mut out = Vec::new();
        for (transfer_id, handle) in handles {
            let transfer = lock(&handle, "transfer")?;
            out.extend(transfer.open_variances().map(|v| (transfer_id, v.clone())));
        }
        out.sort_by_key(|(id, v)| (*id, v.line_no));
        Ok(out)
    }
}

/// Slices of source lots that left with one exit.
fn shipped_pieces(cell: &StockCell, events: &[StockEvent]) -> EngineResult<Vec<ShippedPiece>> {
    let mut pieces: Vec<ShippedPiece> = Vec::new();
    for event in events {
        match event {
            StockEvent::MovementPosted(m) => {
                let lot_id = m
                    .lot_id
                    .ok_or_else(|| DomainError::invalid_movement("transfer exit without a lot"))?;
                let lot = cell
                    .lot(&lot_id)
                    .ok_or_else(|| DomainError::not_found(EntityRef::Lot(lot_id)))?;
                pieces.push(ShippedPiece {
                    source_lot_id: lot_id,
                    quantity: -m.quantity,
                    unit_cost: m.unit_cost,
                    lot_number: lot.lot_number.clone(),
                    manufactured_on: lot.manufactured_on,
                    expires_on: lot.expires_on,
                    received_at: lot.received_at,
                    serials: Vec::new(),
                });
            }
            StockEvent::SerialUnitsShipped(e) => {
                if let Some(piece) = pieces.iter_mut().rev().find(|p| p.source_lot_id == e.lot_id) {
                    piece.serials.extend(e.serials.iter().cloned());
                }
            }
            _ => {}
        }
    }
    Ok(pieces)
}

/// Context shared by the entries of one receipt.
struct Arrival {
    transfer_id: TransferId,
    location_id: Option<LocationId>,
    tracking: TrackingMode,
    actor: UserId,
    occurred_at: DateTime<Utc>,
}

impl Arrival {
    fn receive(&self, line_no: u32, quantity: Quantity, unit_cost: Decimal, attributes: LotAttributes) -> Receive {
        Receive {
            lot_id: LotId::new(),
            quantity,
            unit_cost,
            movement_type: MovementType::TransferIn,
            attributes,
            reference: Some(DocumentRef::TransferLine {
                transfer_id: self.transfer_id,
                line_no,
            }),
            actor: self.actor,
            occurred_at: self.occurred_at,
        }
    }

    /// One destination lot per source lot, inheriting its identity.
    fn lot_per_piece(&self, line: &TransferLine, quantity: Quantity) -> Vec<Receive> {
        line.arrived_pieces(quantity)
            .into_iter()
            .filter(|piece| piece.quantity > 0)
            .map(|piece| {
                let attributes = LotAttributes {
                    lot_number: piece.lot_number,
                    location_id: self.location_id,
                    manufactured_on: piece.manufactured_on,
                    expires_on: piece.expires_on,
                    received_at: Some(piece.received_at),
                    origin_lot_id: Some(piece.source_lot_id),
                    serials: piece.serials,
                };
                self.receive(line.line_no, piece.quantity, piece.unit_cost, attributes)
            })
            .collect()
    }

    /// A single new lot for the line at the weighted cost of what arrived.
    fn lot_per_line(&self, line: &TransferLine, quantity: Quantity) -> Option<Receive> {
        let pieces = line.arrived_pieces(quantity);
        let arrived: Quantity = pieces.iter().map(|p| p.quantity).sum();
        if arrived <= 0 {
            return None;
        }
        let value: Decimal = pieces.iter().map(ShippedPiece::value).sum();
        let lot_number = (self.tracking == TrackingMode::ByLot)
            .then(|| format!("TR-{}-{}", self.transfer_id, line.line_no));
        let attributes = LotAttributes {
            lot_number,
            location_id: self.location_id,
            manufactured_on: pieces.iter().filter_map(|p| p.manufactured_on).min(),
            expires_on: pieces.iter().filter_map(|p| p.expires_on).min(),
            received_at: None,
            origin_lot_id: None,
            serials: pieces.iter().flat_map(|p| p.serials.iter().cloned()).collect(),
        };
        Some(self.receive(line.line_no, arrived, value / Decimal::from(arrived), attributes))
    }
}
