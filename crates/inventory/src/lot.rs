//! Lots: batches of one article sharing a receipt, a cost and an expiry.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use depotledger_core::{ArticleId, LocationId, LotId, WarehouseId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LotStatus {
    Available,
    Blocked,
    Quarantine,
    Depleted,
}

impl LotStatus {
    /// Every permitted (from, to) pair. Anything else is rejected.
    ///
    /// Entering and leaving `Depleted` is driven by quantity, never by a
    /// status command.
    const TRANSITIONS: &'static [(LotStatus, LotStatus)] = &[
        (LotStatus::Available, LotStatus::Blocked),
        (LotStatus::Available, LotStatus::Quarantine),
        (LotStatus::Blocked, LotStatus::Available),
        (LotStatus::Blocked, LotStatus::Quarantine),
        (LotStatus::Quarantine, LotStatus::Available),
        (LotStatus::Quarantine, LotStatus::Blocked),
        (LotStatus::Available, LotStatus::Depleted),
        (LotStatus::Blocked, LotStatus::Depleted),
        (LotStatus::Quarantine, LotStatus::Depleted),
        (LotStatus::Depleted, LotStatus::Available),
    ];

    pub fn can_transition_to(self, next: LotStatus) -> bool {
        Self::TRANSITIONS.contains(&(self, next))
    }

    /// Whether lots in this status count toward theoretical stock.
    pub fn holds_stock(self) -> bool {
        self != LotStatus::Depleted
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LotStatus::Available => "available",
            LotStatus::Blocked => "blocked",
            LotStatus::Quarantine => "quarantine",
            LotStatus::Depleted => "depleted",
        }
    }
}

impl core::fmt::Display for LotStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied attributes of a lot being received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LotAttributes {
    pub lot_number: Option<String>,
    pub location_id: Option<LocationId>,
    pub manufactured_on: Option<NaiveDate>,
    pub expires_on: Option<NaiveDate>,
    /// Receipt time used for FIFO ordering; defaults to the posting time.
    pub received_at: Option<DateTime<Utc>>,
    /// Lot this one was split from in another warehouse.
    pub origin_lot_id: Option<LotId>,
    /// Serial numbers, required for serial-tracked articles.
    pub serials: Vec<String>,
}

impl LotAttributes {
    pub fn numbered(lot_number: impl Into<String>) -> Self {
        Self {
            lot_number: Some(lot_number.into()),
            ..Self::default()
        }
    }

    pub fn at(mut self, location_id: LocationId) -> Self {
        self.location_id = Some(location_id);
        self
    }

    pub fn expiring(mut self, expires_on: NaiveDate) -> Self {
        self.expires_on = Some(expires_on);
        self
    }

    pub fn received(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = Some(received_at);
        self
    }

    pub fn with_serials<I, S>(mut self, serials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.serials = serials.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lot {
    pub id: LotId,
    pub article_id: ArticleId,
    pub warehouse_id: WarehouseId,
    pub location_id: Option<LocationId>,
    pub lot_number: Option<String>,
    pub initial_quantity: i64,
    /// Current quantity; only ever changed by ledger movements.
    pub quantity: i64,
    pub unit_cost: Decimal,
    pub manufactured_on: Option<NaiveDate>,
    pub received_at: DateTime<Utc>,
    pub expires_on: Option<NaiveDate>,
    pub status: LotStatus,
    pub origin_lot_id: Option<LotId>,
}

impl Lot {
    pub fn is_allocatable(&self) -> bool {
        self.status == LotStatus::Available && self.quantity > 0
    }

    pub fn holds_stock(&self) -> bool {
        self.status.holds_stock()
    }

    pub fn value(&self) -> Decimal {
        Decimal::from(self.quantity) * self.unit_cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depleted_is_left_only_towards_available() {
        assert!(LotStatus::Depleted.can_transition_to(LotStatus::Available));
        assert!(!LotStatus::Depleted.can_transition_to(LotStatus::Blocked));
        assert!(!LotStatus::Available.can_transition_to(LotStatus::Available));
    }

    #[test]
    fn every_holding_status_can_deplete() {
        for status in [LotStatus::Available, LotStatus::Blocked, LotStatus::Quarantine] {
            assert!(status.can_transition_to(LotStatus::Depleted), "{status}");
        }
    }
}
