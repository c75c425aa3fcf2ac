//! Serial units of serial-tracked articles.

use serde::{Deserialize, Serialize};

use depotledger_core::{ArticleId, LotId, WarehouseId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialStatus {
    InStock,
    Sold,
    Returned,
    Scrapped,
}

impl SerialStatus {
    const TRANSITIONS: &'static [(SerialStatus, SerialStatus)] = &[
        (SerialStatus::InStock, SerialStatus::Sold),
        (SerialStatus::InStock, SerialStatus::Scrapped),
        (SerialStatus::Sold, SerialStatus::Returned),
        (SerialStatus::Returned, SerialStatus::InStock),
        (SerialStatus::Returned, SerialStatus::Scrapped),
    ];

    pub fn can_transition_to(self, next: SerialStatus) -> bool {
        Self::TRANSITIONS.contains(&(self, next))
    }

    /// Transitions that move a unit in or out of stock must come with a
    /// ledger movement; the rest are bookkeeping only.
    pub fn moves_stock(self, next: SerialStatus) -> bool {
        self == SerialStatus::InStock || next == SerialStatus::InStock
    }
}

impl core::fmt::Display for SerialStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            SerialStatus::InStock => "in_stock",
            SerialStatus::Sold => "sold",
            SerialStatus::Returned => "returned",
            SerialStatus::Scrapped => "scrapped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialUnit {
    pub serial: String,
    pub article_id: ArticleId,
    pub warehouse_id: WarehouseId,
    pub lot_id: Option<LotId>,
    pub status: SerialStatus,
}
