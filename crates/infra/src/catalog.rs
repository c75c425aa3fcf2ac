//! Reference data owned by the product-catalog and site collaborators.
//!
//! The engine only reads it: article tracking/valuation/thresholds,
//! warehouses and the zone/location hierarchy.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use depotledger_core::{ArticleId, DomainResult, LocationId, WarehouseId, ZoneId};
use depotledger_inventory::{Article, Location, Warehouse, Zone};

/// Read access to articles and sites.
pub trait Catalog: Send + Sync {
    fn article(&self, id: ArticleId) -> Option<Article>;
    fn warehouse(&self, id: WarehouseId) -> Option<Warehouse>;
    fn zone(&self, id: ZoneId) -> Option<Zone>;
    fn location(&self, id: LocationId) -> Option<Location>;
    fn articles(&self) -> Vec<Article>;
}

impl<S> Catalog for Arc<S>
where
    S: Catalog + ?Sized,
{
    fn article(&self, id: ArticleId) -> Option<Article> {
        (**self).article(id)
    }

    fn warehouse(&self, id: WarehouseId) -> Option<Warehouse> {
        (**self).warehouse(id)
    }

    fn zone(&self, id: ZoneId) -> Option<Zone> {
        (**self).zone(id)
    }

    fn location(&self, id: LocationId) -> Option<Location> {
        (**self).location(id)
    }

    fn articles(&self) -> Vec<Article> {
        (**self).articles()
    }
}

#[derive(Debug, Default)]
struct Tables {
    articles: HashMap<ArticleId, Article>,
    warehouses: HashMap<WarehouseId, Warehouse>,
    zones: HashMap<ZoneId, Zone>,
    locations: HashMap<LocationId, Location>,
}

/// In-memory catalog for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    inner: RwLock<Tables>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_article(&self, article: Article) -> DomainResult<()> {
        article.validate()?;
        if let Ok(mut t) = self.inner.write() {
            t.articles.insert(article.id, article);
        }
        Ok(())
    }

    pub fn add_warehouse(&self, warehouse: Warehouse) {
        if let Ok(mut t) = self.inner.write() {
            t.warehouses.insert(warehouse.id, warehouse);
        }
    }

    pub fn add_zone(&self, zone: Zone) {
        if let Ok(mut t) = self.inner.write() {
            t.zones.insert(zone.id, zone);
        }
    }

    pub fn add_location(&self, location: Location) {
        if let Ok(mut t) = self.inner.write() {
            t.locations.insert(location.id, location);
        }
    }
}

impl Catalog for InMemoryCatalog {
    fn article(&self, id: ArticleId) -> Option<Article> {
        let t = self.inner.read().ok()?;
        t.articles.get(&id).cloned()
    }

    fn warehouse(&self, id: WarehouseId) -> Option<Warehouse> {
        let t = self.inner.read().ok()?;
        t.warehouses.get(&id).cloned()
    }

    fn zone(&self, id: ZoneId) -> Option<Zone> {
        let t = self.inner.read().ok()?;
        t.zones.get(&id).cloned()
    }

    fn location(&self, id: LocationId) -> Option<Location> {
        let t = self.inner.read().ok()?;
        t.locations.get(&id).cloned()
    }

    fn articles(&self) -> Vec<Article> {
        let t = match self.inner.read() {
            Ok(t) => t,
            Err(_) => return vec![],
        };
        let mut out: Vec<Article> = t.articles.values().cloned().collect();
        out.sort_by(|a, b| a.sku.cmp(&b.sku));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depotledger_inventory::StockThresholds;

    #[test]
    fn articles_with_inconsistent_thresholds_are_refused() {
        let catalog = InMemoryCatalog::new();
        let article = Article::new("SKU-1", "Bolt").with_thresholds(StockThresholds {
            minimum: Some(20),
            safety: Some(5),
            maximum: Some(10),
        });
        assert!(catalog.upsert_article(article).is_err());
        assert!(catalog.articles().is_empty());
    }

    #[test]
    fn lookups_return_what_was_stored() {
        let catalog = InMemoryCatalog::new();
        let wh = Warehouse::new("WH-A", "Main depot");
        let article = Article::new("SKU-2", "Nut");
        catalog.add_warehouse(wh.clone());
        catalog.upsert_article(article.clone()).unwrap();

        assert_eq!(catalog.warehouse(wh.id), Some(wh));
        assert_eq!(catalog.article(article.id).map(|a| a.sku), Some("SKU-2".to_string()));
        assert!(catalog.location(LocationId::new()).is_none());
    }
}
