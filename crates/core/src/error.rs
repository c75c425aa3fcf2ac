//! Domain error model.
//!
//! Every failure surfaced to a collaborator carries a taxonomy kind plus the
//! identifiers of the entities involved.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::{
    ArticleId, InventoryLineId, InventorySessionId, LocationId, LotId, MovementId, ReservationId,
    TransferId, WarehouseId,
};

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Reference to the entity an error is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityRef {
    Article(ArticleId),
    Warehouse(WarehouseId),
    Location(LocationId),
    Lot(LotId),
    SerialUnit(String),
    Movement(MovementId),
    Reservation(ReservationId),
    Transfer(TransferId),
    TransferLine(TransferId, u32),
    InventorySession(InventorySessionId),
    InventoryLine(InventoryLineId),
}

impl core::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EntityRef::Article(id) => write!(f, "article {id}"),
            EntityRef::Warehouse(id) => write!(f, "warehouse {id}"),
            EntityRef::Location(id) => write!(f, "location {id}"),
            EntityRef::Lot(id) => write!(f, "lot {id}"),
            EntityRef::SerialUnit(serial) => write!(f, "serial unit {serial}"),
            EntityRef::Movement(id) => write!(f, "movement {id}"),
            EntityRef::Reservation(id) => write!(f, "reservation {id}"),
            EntityRef::Transfer(id) => write!(f, "transfer {id}"),
            EntityRef::TransferLine(id, line) => write!(f, "transfer {id} line {line}"),
            EntityRef::InventorySession(id) => write!(f, "inventory session {id}"),
            EntityRef::InventoryLine(id) => write!(f, "inventory line {id}"),
        }
    }
}

/// A transfer line that the source warehouse cannot cover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineShortage {
    pub line_no: u32,
    pub article_id: ArticleId,
    pub requested: i64,
    pub available: i64,
}

/// Coarse classification used by callers to decide how to react.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InsufficientStock,
    InsufficientAvailability,
    InvalidStateTransition,
    InvalidMovement,
    ReconciliationMismatch,
    Validation,
    NotFound,
    Conflict,
    /// Storage or locking failure outside the domain rules.
    Internal,
}

/// Domain-level error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Eligible lots cannot cover the requested quantity.
    #[error(
        "insufficient stock for article {article} in warehouse {warehouse}: requested {requested}, eligible {available}"
    )]
    InsufficientStock {
        article: ArticleId,
        warehouse: WarehouseId,
        requested: i64,
        available: i64,
    },

    /// Theoretical minus reserved quantity cannot cover the request.
    #[error(
        "insufficient availability for article {article} in warehouse {warehouse}: requested {requested}, available {available}"
    )]
    InsufficientAvailability {
        article: ArticleId,
        warehouse: WarehouseId,
        requested: i64,
        available: i64,
    },

    /// Transfer validation failed; every short line is listed.
    #[error("transfer {transfer} cannot be covered: {} short line(s)", .lines.len())]
    TransferShortage {
        transfer: TransferId,
        lines: Vec<LineShortage>,
    },

    /// Operation not allowed in the entity's current lifecycle state.
    #[error("{entity}: cannot {action} while {from}")]
    InvalidStateTransition {
        entity: EntityRef,
        from: String,
        action: String,
    },

    /// Malformed ledger append.
    #[error("invalid movement: {0}")]
    InvalidMovement(String),

    /// Lots, ledger and aggregate disagree. Never corrected silently.
    #[error("reconciliation mismatch for article {article} in warehouse {warehouse}: {detail}")]
    ReconciliationMismatch {
        article: ArticleId,
        warehouse: WarehouseId,
        detail: String,
    },

    /// The line's first count tripped the recount rule.
    #[error("inventory line {line} requires a second count before validation")]
    RecountRequired { line: InventoryLineId },

    /// A value failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(EntityRef),

    /// Stale version / concurrent writer.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_movement(msg: impl Into<String>) -> Self {
        Self::InvalidMovement(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(entity: EntityRef) -> Self {
        Self::NotFound(entity)
    }

    pub fn transition(
        entity: EntityRef,
        from: impl core::fmt::Display,
        action: impl Into<String>,
    ) -> Self {
        Self::InvalidStateTransition {
            entity,
            from: from.to_string(),
            action: action.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            DomainError::InsufficientAvailability { .. } | DomainError::TransferShortage { .. } => {
                ErrorKind::InsufficientAvailability
            }
            DomainError::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            DomainError::InvalidMovement(_) => ErrorKind::InvalidMovement,
            DomainError::ReconciliationMismatch { .. } => ErrorKind::ReconciliationMismatch,
            DomainError::RecountRequired { .. } | DomainError::Validation(_) => ErrorKind::Validation,
            DomainError::NotFound(_) => ErrorKind::NotFound,
            DomainError::Conflict(_) => ErrorKind::Conflict,
        }
    }

    /// Quantity shortages may succeed later or with a smaller request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InsufficientStock | ErrorKind::InsufficientAvailability
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortage_kinds_are_retryable_and_others_are_not() {
        let short = DomainError::InsufficientAvailability {
            article: ArticleId::new(),
            warehouse: WarehouseId::new(),
            requested: 6,
            available: 4,
        };
        assert!(short.is_retryable());

        let transition = DomainError::transition(
            EntityRef::Reservation(ReservationId::new()),
            "cancelled",
            "pick",
        );
        assert_eq!(transition.kind(), ErrorKind::InvalidStateTransition);
        assert!(!transition.is_retryable());
    }

    #[test]
    fn transfer_shortage_reports_line_count() {
        let err = DomainError::TransferShortage {
            transfer: TransferId::new(),
            lines: vec![LineShortage {
                line_no: 2,
                article_id: ArticleId::new(),
                requested: 10,
                available: 3,
            }],
        };
        assert!(err.to_string().ends_with("1 short line(s)"));
        assert_eq!(err.kind(), ErrorKind::InsufficientAvailability);
    }
}
