//! `depotledger-core`: domain foundation building blocks.
//!
//! Identifiers, the aggregate execution traits and the structured error
//! taxonomy shared by every inventory module. No infrastructure concerns.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult, EntityRef, ErrorKind, LineShortage};
pub use id::{
    AdjustmentId, ArticleId, InventoryLineId, InventorySessionId, LocationId, LotId, MovementId,
    ReservationId, TransferId, UserId, WarehouseId, ZoneId,
};

/// Quantity in stock-keeping units. Entries are positive, exits negative.
pub type Quantity = i64;
