//! Reservations: holds on available stock for a future pick.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use depotledger_core::{ArticleId, ReservationId, WarehouseId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    /// Some, not all, of the requested quantity has been picked.
    Partial,
    /// Fully picked.
    Picked,
    Expired,
    Cancelled,
}

impl ReservationStatus {
    const TRANSITIONS: &'static [(ReservationStatus, ReservationStatus)] = &[
        (ReservationStatus::Active, ReservationStatus::Partial),
        (ReservationStatus::Active, ReservationStatus::Picked),
        (ReservationStatus::Partial, ReservationStatus::Partial),
        (ReservationStatus::Partial, ReservationStatus::Picked),
        (ReservationStatus::Active, ReservationStatus::Expired),
        (ReservationStatus::Active, ReservationStatus::Cancelled),
        (ReservationStatus::Partial, ReservationStatus::Expired),
        (ReservationStatus::Partial, ReservationStatus::Cancelled),
    ];

    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        Self::TRANSITIONS.contains(&(self, next))
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReservationStatus::Picked | ReservationStatus::Expired | ReservationStatus::Cancelled
        )
    }
}

impl core::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Partial => "partial",
            ReservationStatus::Picked => "picked",
            ReservationStatus::Expired => "expired",
            ReservationStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why the unpicked remainder of a reservation went back to available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Expired,
    Cancelled,
}

impl ReleaseReason {
    pub fn status(self) -> ReservationStatus {
        match self {
            ReleaseReason::Expired => ReservationStatus::Expired,
            ReleaseReason::Cancelled => ReservationStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub article_id: ArticleId,
    pub warehouse_id: WarehouseId,
    pub requested: i64,
    pub picked: i64,
    pub status: ReservationStatus,
    /// Originating sales-order line, opaque to the core.
    pub order_line: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    /// Quantity still held against availability.
    pub fn outstanding(&self) -> i64 {
        if self.status.is_terminal() {
            0
        } else {
            self.requested - self.picked
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.expires_at <= now
    }

    /// Status reached after picking `quantity` more units.
    pub fn status_after_pick(&self, quantity: i64) -> ReservationStatus {
        if self.picked + quantity >= self.requested {
            ReservationStatus::Picked
        } else {
            ReservationStatus::Partial
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn reservation(requested: i64, picked: i64, status: ReservationStatus) -> Reservation {
        let now = Utc::now();
        Reservation {
            id: ReservationId::new(),
            article_id: ArticleId::new(),
            warehouse_id: WarehouseId::new(),
            requested,
            picked,
            status,
            order_line: "SO-1/1".to_string(),
            created_at: now,
            expires_at: now + Duration::hours(1),
        }
    }

    #[test]
    fn terminal_states_accept_no_transition() {
        for terminal in [
            ReservationStatus::Picked,
            ReservationStatus::Expired,
            ReservationStatus::Cancelled,
        ] {
            for next in [
                ReservationStatus::Active,
                ReservationStatus::Partial,
                ReservationStatus::Picked,
                ReservationStatus::Expired,
                ReservationStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn outstanding_quantity_drops_to_zero_when_terminal() {
        assert_eq!(reservation(10, 4, ReservationStatus::Partial).outstanding(), 6);
        assert_eq!(reservation(10, 4, ReservationStatus::Cancelled).outstanding(), 0);
    }

    #[test]
    fn picking_the_remainder_completes_the_reservation() {
        let r = reservation(10, 4, ReservationStatus::Partial);
        assert_eq!(r.status_after_pick(3), ReservationStatus::Partial);
        assert_eq!(r.status_after_pick(6), ReservationStatus::Picked);
    }
}
