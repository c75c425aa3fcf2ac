//! Interdepot transfers.
//!
//! The aggregate only tracks the document: lines, what was shipped and what
//! arrived. The ledger postings at both ends are made on the stock cells by
//! the caller, which then records the outcome here.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use depotledger_core::{
    Aggregate, AggregateRoot, ArticleId, DomainError, DomainResult, EntityRef, LotId, TransferId,
    UserId, WarehouseId,
};
use depotledger_events::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Draft,
    Validated,
    Shipped,
    Received,
    Cancelled,
}

impl TransferStatus {
    /// Shipped transfers cannot be cancelled: they must be received and
    /// corrected through an inventory count.
    const TRANSITIONS: &'static [(TransferStatus, TransferStatus)] = &[
        (TransferStatus::Draft, TransferStatus::Validated),
        (TransferStatus::Draft, TransferStatus::Cancelled),
        (TransferStatus::Validated, TransferStatus::Shipped),
        (TransferStatus::Validated, TransferStatus::Cancelled),
        (TransferStatus::Shipped, TransferStatus::Received),
    ];

    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        Self::TRANSITIONS.contains(&(self, next))
    }
}

impl core::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            TransferStatus::Draft => "draft",
            TransferStatus::Validated => "validated",
            TransferStatus::Shipped => "shipped",
            TransferStatus::Received => "received",
            TransferStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What happens to a quantity lost in transit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShortfallPolicy {
    /// Variance stays open until someone resolves it.
    #[default]
    ReviewRequired,
    /// Variance is recorded as already acknowledged.
    AutoAcknowledge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceStatus {
    Open,
    Acknowledged,
    Resolved,
}

impl VarianceStatus {
    const TRANSITIONS: &'static [(VarianceStatus, VarianceStatus)] = &[
        (VarianceStatus::Open, VarianceStatus::Acknowledged),
        (VarianceStatus::Open, VarianceStatus::Resolved),
        (VarianceStatus::Acknowledged, VarianceStatus::Resolved),
    ];

    pub fn can_transition_to(self, next: VarianceStatus) -> bool {
        Self::TRANSITIONS.contains(&(self, next))
    }
}

impl core::fmt::Display for VarianceStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            VarianceStatus::Open => "open",
            VarianceStatus::Acknowledged => "acknowledged",
            VarianceStatus::Resolved => "resolved",
        };
        f.write_str(s)
    }
}

/// Caller-supplied line of a new transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLineRequest {
    pub article_id: ArticleId,
    /// Ship from exactly this lot instead of by policy.
    pub lot_id: Option<LotId>,
    pub quantity: i64,
}

/// A slice of one source lot that left on a transfer line.
///
/// Carries the source lot's attributes so the destination can recreate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippedPiece {
    pub source_lot_id: LotId,
    pub quantity: i64,
    pub unit_cost: Decimal,
    pub lot_number: Option<String>,
    pub manufactured_on: Option<NaiveDate>,
    pub expires_on: Option<NaiveDate>,
    pub received_at: DateTime<Utc>,
    pub serials: Vec<String>,
}

impl ShippedPiece {
    pub fn value(&self) -> Decimal {
        Decimal::from(self.quantity) * self.unit_cost
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLine {
    /// 1-based position in the document.
    pub line_no: u32,
    pub article_id: ArticleId,
    pub lot_id: Option<LotId>,
    pub requested: i64,
    pub shipped: i64,
    pub received: i64,
    pub pieces: Vec<ShippedPiece>,
    /// Lots opened at the destination for this line.
    pub destination_lots: Vec<LotId>,
}

impl TransferLine {
    pub fn shipped_value(&self) -> Decimal {
        self.pieces.iter().map(ShippedPiece::value).sum()
    }

    /// Weighted unit cost of everything shipped on this line.
    pub fn shipped_unit_cost(&self) -> Decimal {
        if self.shipped == 0 {
            Decimal::ZERO
        } else {
            self.shipped_value() / Decimal::from(self.shipped)
        }
    }

    /// Pieces that arrived when only `quantity` of the shipment did.
    ///
    /// Losses are attributed to the last pieces shipped.
    pub fn arrived_pieces(&self, quantity: i64) -> Vec<ShippedPiece> {
        let mut remaining = quantity.max(0);
        let mut out = Vec::new();
        for piece in &self.pieces {
            if remaining == 0 {
                break;
            }
            let taken = remaining.min(piece.quantity);
            let mut arrived = piece.clone();
            arrived.quantity = taken;
            arrived.serials.truncate(taken as usize);
            out.push(arrived);
            remaining -= taken;
        }
        out
    }

    pub fn shortfall(&self) -> i64 {
        self.shipped - self.received
    }
}

/// Quantity shipped but never received, awaiting human reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitVariance {
    pub line_no: u32,
    pub article_id: ArticleId,
    pub shipped: i64,
    pub received: i64,
    pub quantity: i64,
    /// Shipped value of the missing units.
    pub value: Decimal,
    pub status: VarianceStatus,
    pub note: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Outcome of shipping one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineShipment {
    pub line_no: u32,
    pub pieces: Vec<ShippedPiece>,
}

/// Outcome of receiving one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineReceipt {
    pub line_no: u32,
    pub quantity: i64,
    pub destination_lots: Vec<LotId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransfer {
    pub transfer_id: TransferId,
    pub source: WarehouseId,
    pub destination: WarehouseId,
    pub lines: Vec<TransferLineRequest>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordShipment {
    pub lines: Vec<LineShipment>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordReceipt {
    pub lines: Vec<LineReceipt>,
    pub policy: ShortfallPolicy,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveVariance {
    pub line_no: u32,
    pub note: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferCommand {
    Create(CreateTransfer),
    Validate { occurred_at: DateTime<Utc> },
    RecordShipment(RecordShipment),
    RecordReceipt(RecordReceipt),
    Cancel { reason: Option<String>, occurred_at: DateTime<Utc> },
    ResolveVariance(ResolveVariance),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCreated {
    pub transfer_id: TransferId,
    pub source: WarehouseId,
    pub destination: WarehouseId,
    pub lines: Vec<TransferLine>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferShipped {
    pub lines: Vec<LineShipment>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceived {
    pub lines: Vec<LineReceipt>,
    pub variances: Vec<TransitVariance>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitVarianceResolved {
    pub line_no: u32,
    pub note: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferEvent {
    Created(TransferCreated),
    Validated { occurred_at: DateTime<Utc> },
    Shipped(TransferShipped),
    Received(TransferReceived),
    Cancelled { reason: Option<String>, occurred_at: DateTime<Utc> },
    VarianceResolved(TransitVarianceResolved),
}

impl Event for TransferEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TransferEvent::Created(_) => "inventory.transfer.created",
            TransferEvent::Validated { .. } => "inventory.transfer.validated",
            TransferEvent::Shipped(_) => "inventory.transfer.shipped",
            TransferEvent::Received(_) => "inventory.transfer.received",
            TransferEvent::Cancelled { .. } => "inventory.transfer.cancelled",
            TransferEvent::VarianceResolved(_) => "inventory.transfer.variance_resolved",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            TransferEvent::Created(e) => e.occurred_at,
            TransferEvent::Validated { occurred_at } => *occurred_at,
            TransferEvent::Shipped(e) => e.occurred_at,
            TransferEvent::Received(e) => e.occurred_at,
            TransferEvent::Cancelled { occurred_at, .. } => *occurred_at,
            TransferEvent::VarianceResolved(e) => e.occurred_at,
        }
    }
}

/// Aggregate root: Transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    id: TransferId,
    source: WarehouseId,
    destination: WarehouseId,
    status: TransferStatus,
    lines: Vec<TransferLine>,
    variances: Vec<TransitVariance>,
    created_by: Option<UserId>,
    created_at: Option<DateTime<Utc>>,
    cancel_reason: Option<String>,
    version: u64,
    created: bool,
}

impl Transfer {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: TransferId) -> Self {
        Self {
            id,
            source: WarehouseId::default(),
            destination: WarehouseId::default(),
            status: TransferStatus::Draft,
            lines: Vec::new(),
            variances: Vec::new(),
            created_by: None,
            created_at: None,
            cancel_reason: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> TransferId {
        self.id
    }

    pub fn source(&self) -> WarehouseId {
        self.source
    }

    pub fn destination(&self) -> WarehouseId {
        self.destination
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn lines(&self) -> &[TransferLine] {
        &self.lines
    }

    pub fn line(&self, line_no: u32) -> Option<&TransferLine> {
        self.lines.iter().find(|l| l.line_no == line_no)
    }

    pub fn variances(&self) -> &[TransitVariance] {
        &self.variances
    }

    pub fn open_variances(&self) -> impl Iterator<Item = &TransitVariance> {
        self.variances
            .iter()
            .filter(|v| v.status != VarianceStatus::Resolved)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    /// Requested quantity per article, summed over lines.
    pub fn requested_by_article(&self) -> Vec<(ArticleId, i64)> {
        let mut totals: Vec<(ArticleId, i64)> = Vec::new();
        for line in &self.lines {
            match totals.iter_mut().find(|(a, _)| *a == line.article_id) {
                Some((_, q)) => *q += line.requested,
                None => totals.push((line.article_id, line.requested)),
            }
        }
        totals
    }

    fn entity(&self) -> EntityRef {
        EntityRef::Transfer(self.id)
    }

    fn ensure_created(&self) -> DomainResult<()> {
        if self.created {
            Ok(())
        } else {
            Err(DomainError::not_found(self.entity()))
        }
    }

    fn ensure_transition(&self, next: TransferStatus, action: &str) -> DomainResult<()> {
        self.ensure_created()?;
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::transition(self.entity(), self.status, action))
        }
    }

    fn handle_create(&self, cmd: &CreateTransfer) -> DomainResult<Vec<TransferEvent>> {
        if self.created {
            return Err(DomainError::conflict(format!("transfer {} already exists", self.id)));
        }
        if cmd.source == cmd.destination {
            return Err(DomainError::validation("source and destination must differ"));
        }
        if cmd.lines.is_empty() {
            return Err(DomainError::validation("a transfer needs at least one line"));
        }

        let mut lines = Vec::with_capacity(cmd.lines.len());
        for (idx, request) in cmd.lines.iter().enumerate() {
            let line_no = idx as u32 + 1;
            if request.quantity <= 0 {
                return Err(DomainError::validation(format!(
                    "line {line_no}: quantity must be positive"
                )));
            }
            lines.push(TransferLine {
                line_no,
                article_id: request.article_id,
                lot_id: request.lot_id,
                requested: request.quantity,
                shipped: 0,
                received: 0,
                pieces: Vec::new(),
                destination_lots: Vec::new(),
            });
        }

        Ok(vec![TransferEvent::Created(TransferCreated {
            transfer_id: cmd.transfer_id,
            source: cmd.source,
            destination: cmd.destination,
            lines,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_shipment(&self, cmd: &RecordShipment) -> DomainResult<Vec<TransferEvent>> {
        self.ensure_transition(TransferStatus::Shipped, "ship")?;

        for line in &self.lines {
            let mut shipments = cmd.lines.iter().filter(|s| s.line_no == line.line_no);
            let (Some(shipment), None) = (shipments.next(), shipments.next()) else {
                return Err(DomainError::validation(format!(
                    "line {} must be shipped exactly once",
                    line.line_no
                )));
            };
            let shipped: i64 = shipment.pieces.iter().map(|p| p.quantity).sum();
            if shipped != line.requested || shipment.pieces.iter().any(|p| p.quantity <= 0) {
                return Err(DomainError::validation(format!(
                    "line {} ships {shipped} of {} requested",
                    line.line_no, line.requested
                )));
            }
        }
        if cmd.lines.len() != self.lines.len() {
            return Err(DomainError::validation("shipment names unknown lines"));
        }

        Ok(vec![TransferEvent::Shipped(TransferShipped {
            lines: cmd.lines.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_receipt(&self, cmd: &RecordReceipt) -> DomainResult<Vec<TransferEvent>> {
        self.ensure_transition(TransferStatus::Received, "receive")?;
        if cmd.lines.len() != self.lines.len() {
            return Err(DomainError::validation("every line must be accounted for on receipt"));
        }

        let status = match cmd.policy {
            ShortfallPolicy::ReviewRequired => VarianceStatus::Open,
            ShortfallPolicy::AutoAcknowledge => VarianceStatus::Acknowledged,
        };

        let mut variances = Vec::new();
        for line in &self.lines {
            let receipt = cmd
                .lines
                .iter()
                .find(|r| r.line_no == line.line_no)
                .ok_or_else(|| DomainError::not_found(EntityRef::TransferLine(self.id, line.line_no)))?;

            if receipt.quantity < 0 || receipt.quantity > line.shipped {
                return Err(DomainError::validation(format!(
                    "line {}: received {} of {} shipped",
                    line.line_no, receipt.quantity, line.shipped
                )));
            }

            let missing = line.shipped - receipt.quantity;
            if missing > 0 {
                let arrived: Decimal = line
                    .arrived_pieces(receipt.quantity)
                    .iter()
                    .map(ShippedPiece::value)
                    .sum();
                variances.push(TransitVariance {
                    line_no: line.line_no,
                    article_id: line.article_id,
                    shipped: line.shipped,
                    received: receipt.quantity,
                    quantity: missing,
                    value: line.shipped_value() - arrived,
                    status,
                    note: None,
                    recorded_at: cmd.occurred_at,
                    resolved_at: None,
                });
            }
        }

        Ok(vec![TransferEvent::Received(TransferReceived {
            lines: cmd.lines.clone(),
            variances,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_resolve(&self, cmd: &ResolveVariance) -> DomainResult<Vec<TransferEvent>> {
        self.ensure_created()?;
        let variance = self
            .variances
            .iter()
            .find(|v| v.line_no == cmd.line_no)
            .ok_or_else(|| DomainError::not_found(EntityRef::TransferLine(self.id, cmd.line_no)))?;
        if !variance.status.can_transition_to(VarianceStatus::Resolved) {
            return Err(DomainError::transition(
                EntityRef::TransferLine(self.id, cmd.line_no),
                variance.status,
                "resolve",
            ));
        }
        if cmd.note.trim().is_empty() {
            return Err(DomainError::validation("resolving a variance needs a note"));
        }
        Ok(vec![TransferEvent::VarianceResolved(TransitVarianceResolved {
            line_no: cmd.line_no,
            note: cmd.note.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

impl AggregateRoot for Transfer {
    type Id = TransferId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Aggregate for Transfer {
    type Command = TransferCommand;
    type Event = TransferEvent;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            TransferEvent::Created(e) => {
                self.id = e.transfer_id;
                self.source = e.source;
                self.destination = e.destination;
                self.lines = e.lines.clone();
                self.created_by = Some(e.actor);
                self.created_at = Some(e.occurred_at);
                self.status = TransferStatus::Draft;
                self.created = true;
            }
            TransferEvent::Validated { .. } => self.status = TransferStatus::Validated,
            TransferEvent::Shipped(e) => {
                for shipment in &e.lines {
                    if let Some(line) = self.lines.iter_mut().find(|l| l.line_no == shipment.line_no) {
                        line.shipped = shipment.pieces.iter().map(|p| p.quantity).sum();
                        line.pieces = shipment.pieces.clone();
                    }
                }
                self.status = TransferStatus::Shipped;
            }
            TransferEvent::Received(e) => {
                for receipt in &e.lines {
                    if let Some(line) = self.lines.iter_mut().find(|l| l.line_no == receipt.line_no) {
                        line.received = receipt.quantity;
                        line.destination_lots = receipt.destination_lots.clone();
                    }
                }
                self.variances.extend(e.variances.iter().cloned());
                self.status = TransferStatus::Received;
            }
            TransferEvent::Cancelled { reason, .. } => {
                self.cancel_reason = reason.clone();
                self.status = TransferStatus::Cancelled;
            }
            TransferEvent::VarianceResolved(e) => {
                if let Some(v) = self.variances.iter_mut().find(|v| v.line_no == e.line_no) {
                    v.status = VarianceStatus::Resolved;
                    v.note = Some(e.note.clone());
                    v.resolved_at = Some(e.occurred_at);
                }
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> DomainResult<Vec<Self::Event>> {
        match command {
            TransferCommand::Create(cmd) => self.handle_create(cmd),
            TransferCommand::Validate { occurred_at } => {
                self.ensure_transition(TransferStatus::Validated, "validate")?;
                Ok(vec![TransferEvent::Validated {
                    occurred_at: *occurred_at,
                }])
            }
            TransferCommand::RecordShipment(cmd) => self.handle_shipment(cmd),
            TransferCommand::RecordReceipt(cmd) => self.handle_receipt(cmd),
            TransferCommand::Cancel { reason, occurred_at } => {
                self.ensure_transition(TransferStatus::Cancelled, "cancel")?;
                Ok(vec![TransferEvent::Cancelled {
                    reason: reason.clone(),
                    occurred_at: *occurred_at,
                }])
            }
            TransferCommand::ResolveVariance(cmd) => self.handle_resolve(cmd),
        }
    }
}
