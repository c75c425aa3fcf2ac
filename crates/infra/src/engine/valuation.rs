//! Stock valuation queries.

use serde_json::Value as JsonValue;
use tracing::{error, instrument};

use depotledger_core::{ArticleId, WarehouseId};
use depotledger_events::{EventBus, EventEnvelope};
use depotledger_inventory::{StockCell, StockKey, ValuationSnapshot};

use super::{EngineResult, InventoryEngine, Shared, lock};
use crate::catalog::Catalog;
use crate::event_store::EventStore;

impl<S, B, C> InventoryEngine<S, B, C>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    C: Catalog,
{
    /// Quantity and value on hand, for one warehouse or all of them.
    ///
    /// A cell whose lots no longer add up to its ledger is reported as an
    /// error instead of being valued.
    #[instrument(skip(self))]
    pub fn valuation_snapshot(
        &self,
        article_id: ArticleId,
        warehouse_id: Option<WarehouseId>,
    ) -> EngineResult<ValuationSnapshot> {
        let cells = match warehouse_id {
            Some(warehouse_id) => {
                let key = StockKey::new(article_id, warehouse_id);
                self.find_cell(key)?.map(|cell| (key, cell)).into_iter().collect()
            }
            None => self.cells_of_article(article_id)?,
        };

        let mut total = ValuationSnapshot::default();
        for (key, cell) in cells {
            total = total.combine(value_of(key, &cell)?);
        }
        Ok(total)
    }
}

fn value_of(key: StockKey, cell: &Shared<StockCell>) -> EngineResult<ValuationSnapshot> {
    let cell = lock(cell, "stock cell")?;
    if let Err(e) = cell.verify() {
        error!(%key, error = %e, "stock cell does not reconcile with its ledger");
        return Err(e.into());
    }
    Ok(cell.valuation())
}
