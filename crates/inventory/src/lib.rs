//! Inventory domain (event-sourced).
//!
//! Articles, lots, serial units, the stock ledger per (article, warehouse),
//! lot allocation, reservations, interdepot transfers, physical counts and
//! valuation. Pure, deterministic domain logic: no IO, no locking, no
//! storage. The engine in `depotledger-infra` drives these aggregates.

pub mod allocation;
pub mod article;
pub mod count;
pub mod lot;
pub mod movement;
pub mod reservation;
pub mod serial;
pub mod site;
pub mod stock;
pub mod transfer;
pub mod valuation;

pub use allocation::{Allocation, AllocationPolicy, Selection, Shortfall};
pub use article::{AlertLevel, Article, ArticleProfile, StockThresholds, TrackingMode, ValuationMethod};
pub use count::{
    Adjustment, InventoryLine, InventoryScope, InventorySession, LineDecision, LineSnapshot,
    LineStatus, RecountPolicy, SessionCommand, SessionEvent, SessionStatus,
};
pub use lot::{Lot, LotAttributes, LotStatus};
pub use movement::{DocumentRef, MovementType, StockMovement};
pub use reservation::{ReleaseReason, Reservation, ReservationStatus};
pub use serial::{SerialStatus, SerialUnit};
pub use site::{Location, Warehouse, Zone};
pub use stock::{StockCell, StockCommand, StockEvent, StockKey, StockLevel};
pub use transfer::{
    ShippedPiece, ShortfallPolicy, TransitVariance, Transfer, TransferCommand, TransferEvent,
    TransferLine, TransferLineRequest, TransferStatus, VarianceStatus,
};
pub use valuation::{ValuationSnapshot, weighted_average_cost};
