//! Stock aggregate for one (article, warehouse) pair.
//!
//! The aggregate's event stream is the ledger for that pair: every quantity
//! change is a `MovementPosted` event, and lots, serial units and
//! reservations are folded from the same stream. Replaying the stream into
//! `StockCell::empty` reproduces the aggregate exactly.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use depotledger_core::{
    Aggregate, AggregateRoot, ArticleId, DomainError, DomainResult, EntityRef, LocationId, LotId,
    MovementId, ReservationId, UserId, WarehouseId,
};
use depotledger_events::{Event, StreamId};

use crate::allocation::{self, Allocation, Selection, Shortfall};
use crate::article::{ArticleProfile, TrackingMode, ValuationMethod};
use crate::lot::{Lot, LotAttributes, LotStatus};
use crate::movement::{DocumentRef, MovementType, StockMovement};
use crate::reservation::{ReleaseReason, Reservation, ReservationStatus};
use crate::serial::{SerialStatus, SerialUnit};
use crate::valuation::{ValuationSnapshot, round_cost, weighted_average_cost};

/// Identity of a stock aggregate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StockKey {
    pub article_id: ArticleId,
    pub warehouse_id: WarehouseId,
}

impl StockKey {
    pub fn new(article_id: ArticleId, warehouse_id: WarehouseId) -> Self {
        Self {
            article_id,
            warehouse_id,
        }
    }

    pub fn stream(&self) -> StreamId {
        StreamId::stock(self.article_id, self.warehouse_id)
    }
}

impl core::fmt::Display for StockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}@{}", self.article_id, self.warehouse_id)
    }
}

/// Theoretical and reserved quantities; available is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StockLevel {
    /// Sum of all ledger deltas.
    pub theoretical: i64,
    /// Sum of outstanding reservation quantities.
    pub reserved: i64,
}

impl StockLevel {
    pub fn available(&self) -> i64 {
        self.theoretical - self.reserved
    }
}

/// Command: post an entry that creates a new lot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receive {
    pub lot_id: LotId,
    pub quantity: i64,
    pub unit_cost: Decimal,
    /// `Reception`, `TransferIn` or a positive `InventoryAdjustment`.
    pub movement_type: MovementType,
    pub attributes: LotAttributes,
    pub reference: Option<DocumentRef>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: post an exit drawn from lots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exit {
    pub quantity: i64,
    pub selection: Selection,
    /// `SaleExit`, `TransferOut` or a negative `InventoryAdjustment`.
    pub movement_type: MovementType,
    pub reference: Option<DocumentRef>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLotStatus {
    pub lot_id: LotId,
    pub status: LotStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeLots {
    pub source_lot_id: LotId,
    pub destination_lot_id: LotId,
    /// Largest accepted relative unit-cost gap.
    pub cost_tolerance: Decimal,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelMovement {
    pub movement_id: MovementId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Bookkeeping-only serial status change (e.g. sold → returned).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSerialStatus {
    pub serial: String,
    pub status: SerialStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reserve {
    pub reservation_id: ReservationId,
    pub quantity: i64,
    pub order_line: String,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pick {
    pub reservation_id: ReservationId,
    pub quantity: i64,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseReservation {
    pub reservation_id: ReservationId,
    pub reason: ReleaseReason,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProlongReservation {
    pub reservation_id: ReservationId,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockCommand {
    Receive(Receive),
    Exit(Exit),
    ChangeLotStatus(ChangeLotStatus),
    MergeLots(MergeLots),
    CancelMovement(CancelMovement),
    ChangeSerialStatus(ChangeSerialStatus),
    Reserve(Reserve),
    Pick(Pick),
    ReleaseReservation(ReleaseReservation),
    ProlongReservation(ProlongReservation),
}

/// Event: a lot was opened (at quantity 0; its entry movement follows).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotCreated {
    pub lot: Lot,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotStatusChanged {
    pub lot_id: LotId,
    pub from: LotStatus,
    pub to: LotStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: destination lot absorbs the source lot's capacity and cost.
///
/// The quantity itself moves through the two `LotFusion` movements that
/// follow this event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotsMerged {
    pub source_lot_id: LotId,
    pub destination_lot_id: LotId,
    pub quantity: i64,
    /// Destination unit cost after the merge.
    pub unit_cost: Decimal,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialUnitsRegistered {
    pub lot_id: LotId,
    pub serials: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialUnitsChanged {
    pub serials: Vec<String>,
    pub status: SerialStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: serial units left this warehouse on a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialUnitsShipped {
    pub lot_id: LotId,
    pub serials: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationPicked {
    pub reservation_id: ReservationId,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationReleased {
    pub reservation_id: ReservationId,
    pub reason: ReleaseReason,
    /// Outstanding quantity handed back to available.
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationProlonged {
    pub reservation_id: ReservationId,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockEvent {
    LotCreated(LotCreated),
    MovementPosted(StockMovement),
    LotStatusChanged(LotStatusChanged),
    LotsMerged(LotsMerged),
    SerialUnitsRegistered(SerialUnitsRegistered),
    SerialUnitsChanged(SerialUnitsChanged),
    SerialUnitsShipped(SerialUnitsShipped),
    ReservationPlaced(Reservation),
    ReservationPicked(ReservationPicked),
    ReservationReleased(ReservationReleased),
    ReservationProlonged(ReservationProlonged),
}

impl StockEvent {
    pub fn as_movement(&self) -> Option<&StockMovement> {
        match self {
            StockEvent::MovementPosted(m) => Some(m),
            _ => None,
        }
    }
}

impl Event for StockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StockEvent::LotCreated(_) => "inventory.stock.lot_created",
            StockEvent::MovementPosted(_) => "inventory.stock.movement_posted",
            StockEvent::LotStatusChanged(_) => "inventory.stock.lot_status_changed",
            StockEvent::LotsMerged(_) => "inventory.stock.lots_merged",
            StockEvent::SerialUnitsRegistered(_) => "inventory.stock.serial_units_registered",
            StockEvent::SerialUnitsChanged(_) => "inventory.stock.serial_units_changed",
            StockEvent::SerialUnitsShipped(_) => "inventory.stock.serial_units_shipped",
            StockEvent::ReservationPlaced(_) => "inventory.stock.reservation_placed",
            StockEvent::ReservationPicked(_) => "inventory.stock.reservation_picked",
            StockEvent::ReservationReleased(_) => "inventory.stock.reservation_released",
            StockEvent::ReservationProlonged(_) => "inventory.stock.reservation_prolonged",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            StockEvent::LotCreated(e) => e.occurred_at,
            StockEvent::MovementPosted(m) => m.occurred_at,
            StockEvent::LotStatusChanged(e) => e.occurred_at,
            StockEvent::LotsMerged(e) => e.occurred_at,
            StockEvent::SerialUnitsRegistered(e) => e.occurred_at,
            StockEvent::SerialUnitsChanged(e) => e.occurred_at,
            StockEvent::SerialUnitsShipped(e) => e.occurred_at,
            StockEvent::ReservationPlaced(r) => r.created_at,
            StockEvent::ReservationPicked(e) => e.occurred_at,
            StockEvent::ReservationReleased(e) => e.occurred_at,
            StockEvent::ReservationProlonged(e) => e.occurred_at,
        }
    }
}

/// Aggregate root: stock of one article in one warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockCell {
    key: StockKey,
    profile: ArticleProfile,
    level: StockLevel,
    /// Weighted-average unit cost (CUMP), maintained for every article.
    average_cost: Decimal,
    lots: BTreeMap<LotId, Lot>,
    serials: BTreeMap<String, SerialUnit>,
    reservations: BTreeMap<ReservationId, Reservation>,
    movements: BTreeMap<MovementId, StockMovement>,
    reversed: BTreeSet<MovementId>,
    version: u64,
}

impl StockCell {
    /// Empty aggregate for a pair that has never moved, or for rehydration.
    pub fn empty(key: StockKey, profile: ArticleProfile) -> Self {
        Self {
            key,
            profile,
            level: StockLevel::default(),
            average_cost: Decimal::ZERO,
            lots: BTreeMap::new(),
            serials: BTreeMap::new(),
            reservations: BTreeMap::new(),
            movements: BTreeMap::new(),
            reversed: BTreeSet::new(),
            version: 0,
        }
    }

    pub fn key(&self) -> StockKey {
        self.key
    }

    pub fn profile(&self) -> ArticleProfile {
        self.profile
    }

    pub fn level(&self) -> StockLevel {
        self.level
    }

    pub fn average_cost(&self) -> Decimal {
        self.average_cost
    }

    pub fn lot(&self, lot_id: &LotId) -> Option<&Lot> {
        self.lots.get(lot_id)
    }

    pub fn lots(&self) -> impl Iterator<Item = &Lot> {
        self.lots.values()
    }

    pub fn serial(&self, serial: &str) -> Option<&SerialUnit> {
        self.serials.get(serial)
    }

    pub fn serial_units(&self) -> impl Iterator<Item = &SerialUnit> {
        self.serials.values()
    }

    pub fn reservation(&self, reservation_id: &ReservationId) -> Option<&Reservation> {
        self.reservations.get(reservation_id)
    }

    pub fn reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values()
    }

    pub fn movement(&self, movement_id: &MovementId) -> Option<&StockMovement> {
        self.movements.get(movement_id)
    }

    /// Reservations whose expiry has passed but which still hold stock.
    pub fn due_reservations(&self, now: DateTime<Utc>) -> Vec<ReservationId> {
        self.reservations
            .values()
            .filter(|r| r.is_due(now))
            .map(|r| r.id)
            .collect()
    }

    /// Theoretical quantity per location, over lots that hold stock.
    pub fn quantities_by_location(&self) -> BTreeMap<Option<LocationId>, i64> {
        let mut out = BTreeMap::new();
        for lot in self.lots.values().filter(|l| l.holds_stock()) {
            *out.entry(lot.location_id).or_insert(0) += lot.quantity;
        }
        out
    }

    /// Valuation of the whole position.
    ///
    /// FIFO/FEFO positions are the sum of their lots; weighted-average
    /// positions are valued at the current CUMP.
    pub fn valuation(&self) -> ValuationSnapshot {
        match self.profile.valuation {
            ValuationMethod::WeightedAverage => ValuationSnapshot::new(
                self.level.theoretical,
                Decimal::from(self.level.theoretical) * self.average_cost,
            ),
            ValuationMethod::Fifo | ValuationMethod::Fefo => ValuationSnapshot::of_lots(self.lots.values()),
        }
    }

    /// Valuation of the stock held at one location.
    pub fn valuation_at(&self, location_id: Option<LocationId>) -> ValuationSnapshot {
        let here = self.lots.values().filter(|l| l.location_id == location_id);
        match self.profile.valuation {
            ValuationMethod::WeightedAverage => {
                let quantity: i64 = here.filter(|l| l.holds_stock()).map(|l| l.quantity).sum();
                ValuationSnapshot::new(quantity, Decimal::from(quantity) * self.average_cost)
            }
            ValuationMethod::Fifo | ValuationMethod::Fefo => ValuationSnapshot::of_lots(here),
        }
    }

    /// Check every cross-structure invariant of the aggregate.
    ///
    /// A failure means ledger, lots and reservations disagree; callers must
    /// refuse to commit and surface it.
    pub fn verify(&self) -> DomainResult<()> {
        let theoretical = self.level.theoretical;
        let reserved = self.level.reserved;

        if theoretical < 0 {
            return Err(self.mismatch(format!("theoretical quantity is negative ({theoretical})")));
        }

        let lot_total: i64 = self
            .lots
            .values()
            .filter(|l| l.holds_stock())
            .map(|l| l.quantity)
            .sum();
        if lot_total != theoretical {
            return Err(self.mismatch(format!(
                "lots hold {lot_total} units but the ledger totals {theoretical}"
            )));
        }

        for lot in self.lots.values() {
            if lot.quantity < 0 || lot.quantity > lot.initial_quantity {
                return Err(self.mismatch(format!(
                    "lot {} holds {} of an initial {}",
                    lot.id, lot.quantity, lot.initial_quantity
                )));
            }
            if lot.status == LotStatus::Depleted && lot.quantity != 0 {
                return Err(self.mismatch(format!("lot {} is depleted but holds stock", lot.id)));
            }
        }

        let outstanding: i64 = self.reservations.values().map(Reservation::outstanding).sum();
        if outstanding != reserved {
            return Err(self.mismatch(format!(
                "reservations hold {outstanding} units but the aggregate reserves {reserved}"
            )));
        }
        if reserved < 0 || reserved > theoretical {
            return Err(self.mismatch(format!(
                "reserved {reserved} is outside 0..={theoretical}"
            )));
        }

        if self.profile.tracking == TrackingMode::BySerial {
            let in_stock = self
                .serials
                .values()
                .filter(|s| s.status == SerialStatus::InStock)
                .count() as i64;
            if in_stock != theoretical {
                return Err(self.mismatch(format!(
                    "{in_stock} serial units in stock but the ledger totals {theoretical}"
                )));
            }
        }

        Ok(())
    }

    fn mismatch(&self, detail: String) -> DomainError {
        DomainError::ReconciliationMismatch {
            article: self.key.article_id,
            warehouse: self.key.warehouse_id,
            detail,
        }
    }

    fn lot_or_not_found(&self, lot_id: LotId) -> DomainResult<&Lot> {
        self.lots
            .get(&lot_id)
            .ok_or_else(|| DomainError::not_found(EntityRef::Lot(lot_id)))
    }

    fn reservation_or_not_found(&self, reservation_id: ReservationId) -> DomainResult<&Reservation> {
        self.reservations
            .get(&reservation_id)
            .ok_or_else(|| DomainError::not_found(EntityRef::Reservation(reservation_id)))
    }

    fn ensure_available(&self, quantity: i64) -> DomainResult<()> {
        let available = self.level.available();
        if quantity > available {
            return Err(DomainError::InsufficientAvailability {
                article: self.key.article_id,
                warehouse: self.key.warehouse_id,
                requested: quantity,
                available,
            });
        }
        Ok(())
    }

    fn insufficient_stock(&self, shortfall: Shortfall) -> DomainError {
        DomainError::InsufficientStock {
            article: self.key.article_id,
            warehouse: self.key.warehouse_id,
            requested: shortfall.requested,
            available: shortfall.available,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn new_movement(
        &self,
        lot_id: Option<LotId>,
        quantity: i64,
        unit_cost: Decimal,
        movement_type: MovementType,
        reference: Option<DocumentRef>,
        actor: UserId,
        occurred_at: DateTime<Utc>,
    ) -> StockMovement {
        StockMovement {
            id: MovementId::new(),
            article_id: self.key.article_id,
            warehouse_id: self.key.warehouse_id,
            lot_id,
            quantity,
            unit_cost,
            movement_type,
            occurred_at,
            actor,
            reference,
        }
    }

    /// Cost assigned to units leaving a lot.
    fn exit_cost(&self, slice: &Allocation) -> Decimal {
        match self.profile.valuation {
            ValuationMethod::WeightedAverage => self.average_cost,
            ValuationMethod::Fifo | ValuationMethod::Fefo => slice.unit_cost,
        }
    }

    fn in_stock_serials(&self, lot_id: LotId, count: i64) -> Vec<String> {
        self.serials
            .values()
            .filter(|s| s.lot_id == Some(lot_id) && s.status == SerialStatus::InStock)
            .take(count.max(0) as usize)
            .map(|s| s.serial.clone())
            .collect()
    }

    fn exit_events(
        &self,
        slices: &[Allocation],
        movement_type: MovementType,
        reference: Option<DocumentRef>,
        actor: UserId,
        occurred_at: DateTime<Utc>,
    ) -> Vec<StockEvent> {
        let mut events = Vec::with_capacity(slices.len());
        for slice in slices {
            events.push(StockEvent::MovementPosted(self.new_movement(
                Some(slice.lot_id),
                -slice.quantity,
                self.exit_cost(slice),
                movement_type,
                reference.clone(),
                actor,
                occurred_at,
            )));

            if self.profile.tracking == TrackingMode::BySerial {
                let serials = self.in_stock_serials(slice.lot_id, slice.quantity);
                events.push(match movement_type {
                    MovementType::TransferOut => StockEvent::SerialUnitsShipped(SerialUnitsShipped {
                        lot_id: slice.lot_id,
                        serials,
                        occurred_at,
                    }),
                    MovementType::SaleExit => StockEvent::SerialUnitsChanged(SerialUnitsChanged {
                        serials,
                        status: SerialStatus::Sold,
                        occurred_at,
                    }),
                    _ => StockEvent::SerialUnitsChanged(SerialUnitsChanged {
                        serials,
                        status: SerialStatus::Scrapped,
                        occurred_at,
                    }),
                });
            }
        }
        events
    }

    fn check_new_serials(&self, serials: &[String], quantity: i64) -> DomainResult<()> {
        if serials.len() as i64 != quantity {
            return Err(DomainError::validation(format!(
                "serial-tracked entry of {quantity} units carries {} serial numbers",
                serials.len()
            )));
        }
        let mut seen = BTreeSet::new();
        for serial in serials {
            if serial.trim().is_empty() {
                return Err(DomainError::validation("serial number cannot be empty"));
            }
            if !seen.insert(serial.as_str()) {
                return Err(DomainError::validation(format!("serial {serial} listed twice")));
            }
            if matches!(self.serials.get(serial), Some(u) if u.status == SerialStatus::InStock) {
                return Err(DomainError::conflict(format!("serial {serial} is already in stock")));
            }
        }
        Ok(())
    }

    fn handle_receive(&self, cmd: &Receive) -> DomainResult<Vec<StockEvent>> {
        if cmd.quantity <= 0 {
            return Err(DomainError::invalid_movement("entry quantity must be positive"));
        }
        if cmd.unit_cost.is_sign_negative() {
            return Err(DomainError::invalid_movement("unit cost cannot be negative"));
        }
        if !matches!(
            cmd.movement_type,
            MovementType::Reception | MovementType::TransferIn | MovementType::InventoryAdjustment
        ) {
            return Err(DomainError::invalid_movement(format!(
                "{} cannot open a lot",
                cmd.movement_type
            )));
        }
        if self.lots.contains_key(&cmd.lot_id) {
            return Err(DomainError::conflict(format!("lot {} already exists", cmd.lot_id)));
        }

        let attrs = &cmd.attributes;
        match self.profile.tracking {
            TrackingMode::None => {
                if !attrs.serials.is_empty() {
                    return Err(DomainError::validation(
                        "untracked article cannot carry serial numbers",
                    ));
                }
            }
            TrackingMode::ByLot => {
                let numbered = attrs
                    .lot_number
                    .as_deref()
                    .is_some_and(|n| !n.trim().is_empty());
                if !numbered {
                    return Err(DomainError::validation("lot-tracked article requires a lot number"));
                }
            }
            TrackingMode::BySerial => self.check_new_serials(&attrs.serials, cmd.quantity)?,
        }

        let lot = Lot {
            id: cmd.lot_id,
            article_id: self.key.article_id,
            warehouse_id: self.key.warehouse_id,
            location_id: attrs.location_id,
            lot_number: attrs.lot_number.clone(),
            initial_quantity: cmd.quantity,
            quantity: 0,
            unit_cost: cmd.unit_cost,
            manufactured_on: attrs.manufactured_on,
            received_at: attrs.received_at.unwrap_or(cmd.occurred_at),
            expires_on: attrs.expires_on,
            status: LotStatus::Available,
            origin_lot_id: attrs.origin_lot_id,
        };

        let mut events = vec![
            StockEvent::LotCreated(LotCreated {
                lot,
                occurred_at: cmd.occurred_at,
            }),
            StockEvent::MovementPosted(self.new_movement(
                Some(cmd.lot_id),
                cmd.quantity,
                cmd.unit_cost,
                cmd.movement_type,
                cmd.reference.clone(),
                cmd.actor,
                cmd.occurred_at,
            )),
        ];
        if !attrs.serials.is_empty() {
            events.push(StockEvent::SerialUnitsRegistered(SerialUnitsRegistered {
                lot_id: cmd.lot_id,
                serials: attrs.serials.clone(),
                occurred_at: cmd.occurred_at,
            }));
        }
        Ok(events)
    }

    fn handle_exit(&self, cmd: &Exit) -> DomainResult<Vec<StockEvent>> {
        if cmd.quantity <= 0 {
            return Err(DomainError::invalid_movement("exit quantity must be positive"));
        }
        if !matches!(
            cmd.movement_type,
            MovementType::SaleExit | MovementType::TransferOut | MovementType::InventoryAdjustment
        ) {
            return Err(DomainError::invalid_movement(format!(
                "{} is not an exit type",
                cmd.movement_type
            )));
        }
        if let Selection::Lot { lot_id } = cmd.selection {
            self.lot_or_not_found(lot_id)?;
        }

        self.ensure_available(cmd.quantity)?;
        let slices = allocation::allocate_from(self.lots.values(), cmd.quantity, cmd.selection)
            .map_err(|s| self.insufficient_stock(s))?;

        Ok(self.exit_events(
            &slices,
            cmd.movement_type,
            cmd.reference.clone(),
            cmd.actor,
            cmd.occurred_at,
        ))
    }

    fn handle_change_lot_status(&self, cmd: &ChangeLotStatus) -> DomainResult<Vec<StockEvent>> {
        let lot = self.lot_or_not_found(cmd.lot_id)?;
        let manual = cmd.status != LotStatus::Depleted && lot.status != LotStatus::Depleted;
        if !manual || !lot.status.can_transition_to(cmd.status) {
            return Err(DomainError::transition(
                EntityRef::Lot(lot.id),
                lot.status,
                format!("set status to {}", cmd.status),
            ));
        }
        Ok(vec![StockEvent::LotStatusChanged(LotStatusChanged {
            lot_id: lot.id,
            from: lot.status,
            to: cmd.status,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_merge(&self, cmd: &MergeLots) -> DomainResult<Vec<StockEvent>> {
        if cmd.source_lot_id == cmd.destination_lot_id {
            return Err(DomainError::validation("a lot cannot be merged into itself"));
        }
        let source = self.lot_or_not_found(cmd.source_lot_id)?;
        let destination = self.lot_or_not_found(cmd.destination_lot_id)?;
        for lot in [source, destination] {
            if !lot.holds_stock() {
                return Err(DomainError::transition(EntityRef::Lot(lot.id), lot.status, "merge"));
            }
        }
        if source.location_id != destination.location_id {
            return Err(DomainError::validation("merged lots must share a location"));
        }
        if !allocation::costs_within_tolerance(source.unit_cost, destination.unit_cost, cmd.cost_tolerance) {
            return Err(DomainError::validation(format!(
                "unit costs {} and {} differ by more than the {} tolerance",
                source.unit_cost, destination.unit_cost, cmd.cost_tolerance
            )));
        }

        let quantity = source.quantity;
        let combined = Decimal::from(quantity + destination.quantity);
        let unit_cost = round_cost((source.value() + destination.value()) / combined);
        let reference = Some(DocumentRef::LotMerge {
            source: source.id,
            destination: destination.id,
        });

        Ok(vec![
            StockEvent::LotsMerged(LotsMerged {
                source_lot_id: source.id,
                destination_lot_id: destination.id,
                quantity,
                unit_cost,
                occurred_at: cmd.occurred_at,
            }),
            StockEvent::MovementPosted(self.new_movement(
                Some(source.id),
                -quantity,
                source.unit_cost,
                MovementType::LotFusion,
                reference.clone(),
                cmd.actor,
                cmd.occurred_at,
            )),
            StockEvent::MovementPosted(self.new_movement(
                Some(destination.id),
                quantity,
                source.unit_cost,
                MovementType::LotFusion,
                reference,
                cmd.actor,
                cmd.occurred_at,
            )),
        ])
    }

    fn handle_cancel(&self, cmd: &CancelMovement) -> DomainResult<Vec<StockEvent>> {
        let original = self
            .movements
            .get(&cmd.movement_id)
            .ok_or_else(|| DomainError::not_found(EntityRef::Movement(cmd.movement_id)))?;

        if !original.movement_type.is_reversible() {
            return Err(DomainError::transition(
                EntityRef::Movement(original.id),
                original.movement_type,
                "reverse",
            ));
        }
        if self.reversed.contains(&original.id) {
            return Err(DomainError::transition(
                EntityRef::Movement(original.id),
                "reversed",
                "reverse",
            ));
        }
        if self.profile.tracking == TrackingMode::BySerial {
            return Err(DomainError::validation(
                "serial-tracked movements are corrected through serial returns",
            ));
        }

        let lot_id = original
            .lot_id
            .ok_or_else(|| DomainError::invalid_movement("movement has no lot to reverse against"))?;
        let lot = self.lot_or_not_found(lot_id)?;
        let delta = -original.quantity;

        if delta < 0 {
            self.ensure_available(-delta)?;
            if lot.quantity < -delta {
                return Err(self.insufficient_stock(Shortfall {
                    requested: -delta,
                    available: lot.quantity,
                }));
            }
        } else if lot.quantity + delta > lot.initial_quantity {
            return Err(DomainError::invalid_movement(format!(
                "restoring {delta} units would overfill lot {lot_id}"
            )));
        }

        Ok(vec![StockEvent::MovementPosted(self.new_movement(
            Some(lot_id),
            delta,
            original.unit_cost,
            MovementType::Cancellation,
            Some(DocumentRef::Reversal {
                movement_id: original.id,
            }),
            cmd.actor,
            cmd.occurred_at,
        ))])
    }

    fn handle_change_serial(&self, cmd: &ChangeSerialStatus) -> DomainResult<Vec<StockEvent>> {
        let unit = self
            .serials
            .get(&cmd.serial)
            .ok_or_else(|| DomainError::not_found(EntityRef::SerialUnit(cmd.serial.clone())))?;
        if !unit.status.can_transition_to(cmd.status) {
            return Err(DomainError::transition(
                EntityRef::SerialUnit(unit.serial.clone()),
                unit.status,
                format!("become {}", cmd.status),
            ));
        }
        if unit.status.moves_stock(cmd.status) {
            return Err(DomainError::validation(format!(
                "{} -> {} requires a stock movement",
                unit.status, cmd.status
            )));
        }
        Ok(vec![StockEvent::SerialUnitsChanged(SerialUnitsChanged {
            serials: vec![unit.serial.clone()],
            status: cmd.status,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reserve(&self, cmd: &Reserve) -> DomainResult<Vec<StockEvent>> {
        if cmd.quantity <= 0 {
            return Err(DomainError::validation("reserved quantity must be positive"));
        }
        if cmd.expires_at <= cmd.occurred_at {
            return Err(DomainError::validation("reservation must expire in the future"));
        }
        if self.reservations.contains_key(&cmd.reservation_id) {
            return Err(DomainError::conflict(format!(
                "reservation {} already exists",
                cmd.reservation_id
            )));
        }
        self.ensure_available(cmd.quantity)?;

        Ok(vec![StockEvent::ReservationPlaced(Reservation {
            id: cmd.reservation_id,
            article_id: self.key.article_id,
            warehouse_id: self.key.warehouse_id,
            requested: cmd.quantity,
            picked: 0,
            status: ReservationStatus::Active,
            order_line: cmd.order_line.clone(),
            created_at: cmd.occurred_at,
            expires_at: cmd.expires_at,
        })])
    }

    fn handle_pick(&self, cmd: &Pick) -> DomainResult<Vec<StockEvent>> {
        let reservation = self.reservation_or_not_found(cmd.reservation_id)?;
        if cmd.quantity <= 0 {
            return Err(DomainError::validation("picked quantity must be positive"));
        }
        let next = reservation.status_after_pick(cmd.quantity);
        if !reservation.status.can_transition_to(next) || reservation.is_due(cmd.occurred_at) {
            return Err(DomainError::transition(
                EntityRef::Reservation(reservation.id),
                reservation.status,
                "pick",
            ));
        }
        if cmd.quantity > reservation.outstanding() {
            return Err(DomainError::validation(format!(
                "pick of {} exceeds the {} units outstanding on reservation {}",
                cmd.quantity,
                reservation.outstanding(),
                reservation.id
            )));
        }

        let policy = self.profile.valuation.allocation_policy();
        let slices = allocation::allocate(self.lots.values(), cmd.quantity, policy)
            .map_err(|s| self.insufficient_stock(s))?;

        let mut events = self.exit_events(
            &slices,
            MovementType::SaleExit,
            Some(DocumentRef::Reservation {
                reservation_id: reservation.id,
            }),
            cmd.actor,
            cmd.occurred_at,
        );
        events.push(StockEvent::ReservationPicked(ReservationPicked {
            reservation_id: reservation.id,
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        }));
        Ok(events)
    }

    fn handle_release(&self, cmd: &ReleaseReservation) -> DomainResult<Vec<StockEvent>> {
        let reservation = self.reservation_or_not_found(cmd.reservation_id)?;
        let next = cmd.reason.status();
        if !reservation.status.can_transition_to(next) {
            let action = match cmd.reason {
                ReleaseReason::Expired => "expire",
                ReleaseReason::Cancelled => "cancel",
            };
            return Err(DomainError::transition(
                EntityRef::Reservation(reservation.id),
                reservation.status,
                action,
            ));
        }
        if cmd.reason == ReleaseReason::Expired && reservation.expires_at > cmd.occurred_at {
            return Err(DomainError::validation(format!(
                "reservation {} does not expire until {}",
                reservation.id, reservation.expires_at
            )));
        }
        Ok(vec![StockEvent::ReservationReleased(ReservationReleased {
            reservation_id: reservation.id,
            reason: cmd.reason,
            quantity: reservation.outstanding(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_prolong(&self, cmd: &ProlongReservation) -> DomainResult<Vec<StockEvent>> {
        let reservation = self.reservation_or_not_found(cmd.reservation_id)?;
        if reservation.status.is_terminal() {
            return Err(DomainError::transition(
                EntityRef::Reservation(reservation.id),
                reservation.status,
                "prolong",
            ));
        }
        if cmd.expires_at <= cmd.occurred_at {
            return Err(DomainError::validation("new expiry must be in the future"));
        }
        Ok(vec![StockEvent::ReservationProlonged(ReservationProlonged {
            reservation_id: reservation.id,
            expires_at: cmd.expires_at,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn apply_movement(&mut self, movement: &StockMovement) {
        if movement.is_entry() && movement.movement_type.revalues_on_entry() {
            self.average_cost = weighted_average_cost(
                self.level.theoretical,
                self.average_cost,
                movement.quantity,
                movement.unit_cost,
            );
        }
        self.level.theoretical += movement.quantity;

        if let Some(lot) = movement.lot_id.and_then(|id| self.lots.get_mut(&id)) {
            lot.quantity += movement.quantity;
            if lot.quantity == 0 {
                lot.status = LotStatus::Depleted;
            } else if lot.status == LotStatus::Depleted {
                lot.status = LotStatus::Available;
            }
        }

        if let Some(original) = movement.reverses() {
            self.reversed.insert(original);
        }
        self.movements.insert(movement.id, movement.clone());
    }
}

impl AggregateRoot for StockCell {
    type Id = StockKey;

    fn id(&self) -> &Self::Id {
        &self.key
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Aggregate for StockCell {
    type Command = StockCommand;
    type Event = StockEvent;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            StockEvent::LotCreated(e) => {
                self.lots.insert(e.lot.id, e.lot.clone());
            }
            StockEvent::MovementPosted(m) => self.apply_movement(m),
            StockEvent::LotStatusChanged(e) => {
                if let Some(lot) = self.lots.get_mut(&e.lot_id) {
                    lot.status = e.to;
                }
            }
            StockEvent::LotsMerged(e) => {
                if let Some(dest) = self.lots.get_mut(&e.destination_lot_id) {
                    dest.initial_quantity += e.quantity;
                    dest.unit_cost = e.unit_cost;
                }
                for unit in self.serials.values_mut() {
                    if unit.lot_id == Some(e.source_lot_id) {
                        unit.lot_id = Some(e.destination_lot_id);
                    }
                }
            }
            StockEvent::SerialUnitsRegistered(e) => {
                for serial in &e.serials {
                    self.serials.insert(
                        serial.clone(),
                        SerialUnit {
                            serial: serial.clone(),
                            article_id: self.key.article_id,
                            warehouse_id: self.key.warehouse_id,
                            lot_id: Some(e.lot_id),
                            status: SerialStatus::InStock,
                        },
                    );
                }
            }
            StockEvent::SerialUnitsChanged(e) => {
                for serial in &e.serials {
                    if let Some(unit) = self.serials.get_mut(serial) {
                        unit.status = e.status;
                    }
                }
            }
            StockEvent::SerialUnitsShipped(e) => {
                for serial in &e.serials {
                    self.serials.remove(serial);
                }
            }
            StockEvent::ReservationPlaced(r) => {
                self.level.reserved += r.outstanding();
                self.reservations.insert(r.id, r.clone());
            }
            StockEvent::ReservationPicked(e) => {
                if let Some(r) = self.reservations.get_mut(&e.reservation_id) {
                    r.status = r.status_after_pick(e.quantity);
                    r.picked += e.quantity;
                }
                self.level.reserved -= e.quantity;
            }
            StockEvent::ReservationReleased(e) => {
                if let Some(r) = self.reservations.get_mut(&e.reservation_id) {
                    r.status = e.reason.status();
                }
                self.level.reserved -= e.quantity;
            }
            StockEvent::ReservationProlonged(e) => {
                if let Some(r) = self.reservations.get_mut(&e.reservation_id) {
                    r.expires_at = e.expires_at;
                }
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> DomainResult<Vec<Self::Event>> {
        match command {
            StockCommand::Receive(cmd) => self.handle_receive(cmd),
            StockCommand::Exit(cmd) => self.handle_exit(cmd),
            StockCommand::ChangeLotStatus(cmd) => self.handle_change_lot_status(cmd),
            StockCommand::MergeLots(cmd) => self.handle_merge(cmd),
            StockCommand::CancelMovement(cmd) => self.handle_cancel(cmd),
            StockCommand::ChangeSerialStatus(cmd) => self.handle_change_serial(cmd),
            StockCommand::Reserve(cmd) => self.handle_reserve(cmd),
            StockCommand::Pick(cmd) => self.handle_pick(cmd),
            StockCommand::ReleaseReservation(cmd) => self.handle_release(cmd),
            StockCommand::ProlongReservation(cmd) => self.handle_prolong(cmd),
        }
    }
}
