//! Post-commit publication.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;
use uuid::Uuid;

use depotledger_core::{AggregateRoot, ArticleId, WarehouseId};
use depotledger_events::{EventBus, EventEnvelope};
use depotledger_inventory::{AlertLevel, StockCell, StockKey, StockThresholds};

use crate::event_store::StoredEvent;

pub const STOCK_ALERT: &str = "inventory.stock.alert";

/// Available stock fell under a replenishment threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAlert {
    pub article_id: ArticleId,
    pub warehouse_id: WarehouseId,
    pub level: AlertLevel,
    pub available: i64,
    pub threshold: i64,
}

/// Everything a committed transaction has to announce.
#[derive(Debug, Default)]
#[must_use]
pub(crate) struct Outbox {
    committed: Vec<StoredEvent>,
    alerts: Vec<(StockAlert, u64)>,
}

impl Outbox {
    pub(crate) fn new(committed: Vec<StoredEvent>) -> Self {
        Self {
            committed,
            alerts: Vec::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.committed.is_empty() && self.alerts.is_empty()
    }

    /// Queue an alert when `cell` lost availability and now sits under a
    /// threshold.
    pub(crate) fn check_thresholds(
        &mut self,
        key: StockKey,
        thresholds: &StockThresholds,
        available_before: i64,
        cell: &StockCell,
    ) {
        let available = cell.level().available();
        if available >= available_before {
            return;
        }
        if let Some((level, threshold)) = thresholds.classify(available) {
            self.alerts.push((
                StockAlert {
                    article_id: key.article_id,
                    warehouse_id: key.warehouse_id,
                    level,
                    available,
                    threshold,
                },
                cell.version(),
            ));
        }
    }

    pub(crate) fn publish<B>(self, bus: &B)
    where
        B: EventBus<EventEnvelope<JsonValue>>,
    {
        for stored in &self.committed {
            if let Err(err) = bus.publish(stored.to_envelope()) {
                warn!(
                    stream = %stored.stream,
                    sequence = stored.sequence_number,
                    error = ?err,
                    "failed to publish committed event"
                );
            }
        }

        for (alert, revision) in self.alerts {
            let payload = match serde_json::to_value(alert) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "failed to encode stock alert");
                    continue;
                }
            };
            let key = StockKey::new(alert.article_id, alert.warehouse_id);
            let envelope = EventEnvelope::new(Uuid::now_v7(), key.stream(), revision, STOCK_ALERT, Utc::now(), payload);
            if let Err(err) = bus.publish(envelope) {
                warn!(%key, error = ?err, "failed to publish stock alert");
            }
        }
    }
}
