//! Ledger entries.
//!
//! A `StockMovement` is immutable once posted. Corrections are new,
//! compensating movements.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use depotledger_core::{
    ArticleId, InventoryLineId, InventorySessionId, LotId, MovementId, ReservationId, TransferId,
    UserId, WarehouseId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    Reception,
    SaleExit,
    TransferOut,
    TransferIn,
    InventoryAdjustment,
    Cancellation,
    /// One leg of a lot merge; the pair nets to zero.
    LotFusion,
}

impl MovementType {
    /// Sign a movement of this type must carry, if fixed.
    pub fn required_sign(self) -> Option<i64> {
        match self {
            MovementType::Reception | MovementType::TransferIn => Some(1),
            MovementType::SaleExit | MovementType::TransferOut => Some(-1),
            MovementType::InventoryAdjustment
            | MovementType::Cancellation
            | MovementType::LotFusion => None,
        }
    }

    pub fn is_reversible(self) -> bool {
        matches!(self, MovementType::Reception | MovementType::SaleExit)
    }

    /// Entries of these types feed the weighted-average cost.
    pub fn revalues_on_entry(self) -> bool {
        self != MovementType::LotFusion
    }
}

impl core::fmt::Display for MovementType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            MovementType::Reception => "reception",
            MovementType::SaleExit => "sale_exit",
            MovementType::TransferOut => "transfer_out",
            MovementType::TransferIn => "transfer_in",
            MovementType::InventoryAdjustment => "inventory_adjustment",
            MovementType::Cancellation => "cancellation",
            MovementType::LotFusion => "lot_fusion",
        };
        f.write_str(s)
    }
}

/// Business document a movement originates from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentRef {
    PurchaseReceipt { reference: String },
    SalesOrderLine { reference: String },
    Reservation { reservation_id: ReservationId },
    TransferLine { transfer_id: TransferId, line_no: u32 },
    InventoryLine {
        session_id: InventorySessionId,
        line_id: InventoryLineId,
    },
    Reversal { movement_id: MovementId },
    LotMerge { source: LotId, destination: LotId },
    Reason { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: MovementId,
    pub article_id: ArticleId,
    pub warehouse_id: WarehouseId,
    pub lot_id: Option<LotId>,
    /// Signed delta: entries positive, exits negative, never zero.
    pub quantity: i64,
    pub unit_cost: Decimal,
    pub movement_type: MovementType,
    pub occurred_at: DateTime<Utc>,
    pub actor: UserId,
    pub reference: Option<DocumentRef>,
}

impl StockMovement {
    pub fn is_entry(&self) -> bool {
        self.quantity > 0
    }

    pub fn value(&self) -> Decimal {
        Decimal::from(self.quantity) * self.unit_cost
    }

    /// Movement this one compensates, if it is a reversal.
    pub fn reverses(&self) -> Option<MovementId> {
        match self.reference {
            Some(DocumentRef::Reversal { movement_id }) => Some(movement_id),
            _ => None,
        }
    }
}
