//! Stream identities.
//!
//! Each aggregate instance owns exactly one append-only stream. For stock,
//! the stream of an (article, warehouse) pair *is* its ledger.

use serde::{Deserialize, Serialize};

use depotledger_core::{ArticleId, InventorySessionId, TransferId, WarehouseId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamId {
    Stock {
        article_id: ArticleId,
        warehouse_id: WarehouseId,
    },
    Transfer {
        transfer_id: TransferId,
    },
    InventorySession {
        session_id: InventorySessionId,
    },
}

impl StreamId {
    pub fn stock(article_id: ArticleId, warehouse_id: WarehouseId) -> Self {
        StreamId::Stock {
            article_id,
            warehouse_id,
        }
    }

    pub fn transfer(transfer_id: TransferId) -> Self {
        StreamId::Transfer { transfer_id }
    }

    pub fn inventory_session(session_id: InventorySessionId) -> Self {
        StreamId::InventorySession { session_id }
    }

    /// Aggregate type recorded on every event of the stream.
    pub fn aggregate_type(&self) -> &'static str {
        match self {
            StreamId::Stock { .. } => "inventory.stock",
            StreamId::Transfer { .. } => "inventory.transfer",
            StreamId::InventorySession { .. } => "inventory.session",
        }
    }
}

impl core::fmt::Display for StreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StreamId::Stock {
                article_id,
                warehouse_id,
            } => write!(f, "stock-{article_id}-{warehouse_id}"),
            StreamId::Transfer { transfer_id } => write!(f, "transfer-{transfer_id}"),
            StreamId::InventorySession { session_id } => write!(f, "session-{session_id}"),
        }
    }
}
