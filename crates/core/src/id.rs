//! Strongly-typed identifiers used across the inventory domain.
//!
//! Every entity refers to others through these ids; no entity holds a live
//! reference to its container.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $t:ident, $name:literal) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(Uuid);

        impl $t {
            /// Create a new time-ordered (UUIDv7) identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::validation(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

uuid_id!(
    /// Actor recorded on ledger entries.
    UserId,
    "UserId"
);
uuid_id!(ArticleId, "ArticleId");
uuid_id!(WarehouseId, "WarehouseId");
uuid_id!(ZoneId, "ZoneId");
uuid_id!(LocationId, "LocationId");
uuid_id!(LotId, "LotId");
uuid_id!(
    /// Identity of one immutable ledger entry.
    MovementId,
    "MovementId"
);
uuid_id!(ReservationId, "ReservationId");
uuid_id!(TransferId, "TransferId");
uuid_id!(InventorySessionId, "InventorySessionId");
uuid_id!(InventoryLineId, "InventoryLineId");
uuid_id!(AdjustmentId, "AdjustmentId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_parse_back_from_display() {
        let id = LotId::new();
        let parsed: LotId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn malformed_id_is_a_validation_error() {
        let err = "not-a-uuid".parse::<ArticleId>().unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.starts_with("ArticleId")));
    }
}
