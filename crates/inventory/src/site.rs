//! Physical containment: warehouse → zone → location.

use serde::{Deserialize, Serialize};

use depotledger_core::{LocationId, WarehouseId, ZoneId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warehouse {
    pub id: WarehouseId,
    pub code: String,
    pub name: String,
}

impl Warehouse {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: WarehouseId::new(),
            code: code.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub warehouse_id: WarehouseId,
    pub code: String,
}

/// A bin/shelf. Lots and serial units sit in exactly one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub warehouse_id: WarehouseId,
    pub zone_id: Option<ZoneId>,
    pub code: String,
}
