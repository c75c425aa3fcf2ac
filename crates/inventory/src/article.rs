//! Article reference data as seen by the stock core.
//!
//! The product catalog owns these attributes; the core only reads tracking
//! mode, valuation method and replenishment thresholds.

use serde::{Deserialize, Serialize};

use depotledger_core::{ArticleId, DomainError, DomainResult};

use crate::allocation::AllocationPolicy;

/// How individual units of an article are identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    #[default]
    None,
    ByLot,
    BySerial,
}

/// Cost-accounting method used to value exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValuationMethod {
    #[default]
    Fifo,
    Fefo,
    /// CUMP: weighted average recomputed on every entry.
    WeightedAverage,
}

impl ValuationMethod {
    /// Lot consumption order implied by the method.
    ///
    /// Weighted-average articles still consume lots oldest-first so lot
    /// quantities stay meaningful.
    pub fn allocation_policy(self) -> AllocationPolicy {
        match self {
            ValuationMethod::Fefo => AllocationPolicy::Fefo,
            ValuationMethod::Fifo | ValuationMethod::WeightedAverage => AllocationPolicy::Fifo,
        }
    }
}

/// Severity of a low-stock condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    /// Below the reorder point.
    BelowMinimum,
    /// Below the safety stock (more severe than `BelowMinimum`).
    BelowSafety,
}

/// Replenishment thresholds, in units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StockThresholds {
    pub minimum: Option<i64>,
    pub safety: Option<i64>,
    pub maximum: Option<i64>,
}

impl StockThresholds {
    pub fn validate(&self) -> DomainResult<()> {
        for (name, value) in [
            ("minimum", self.minimum),
            ("safety", self.safety),
            ("maximum", self.maximum),
        ] {
            if matches!(value, Some(v) if v < 0) {
                return Err(DomainError::validation(format!("{name} threshold cannot be negative")));
            }
        }
        if let (Some(min), Some(max)) = (self.minimum, self.maximum) {
            if min > max {
                return Err(DomainError::validation("minimum threshold exceeds maximum"));
            }
        }
        Ok(())
    }

    /// Most severe threshold breached by `available`, if any.
    pub fn classify(&self, available: i64) -> Option<(AlertLevel, i64)> {
        if let Some(safety) = self.safety {
            if available < safety {
                return Some((AlertLevel::BelowSafety, safety));
            }
        }
        match self.minimum {
            Some(minimum) if available < minimum => Some((AlertLevel::BelowMinimum, minimum)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub id: ArticleId,
    pub sku: String,
    pub name: String,
    pub category: Option<String>,
    pub tracking: TrackingMode,
    pub valuation: ValuationMethod,
    pub thresholds: StockThresholds,
}

impl Article {
    pub fn new(sku: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ArticleId::new(),
            sku: sku.into(),
            name: name.into(),
            category: None,
            tracking: TrackingMode::default(),
            valuation: ValuationMethod::default(),
            thresholds: StockThresholds::default(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_tracking(mut self, tracking: TrackingMode) -> Self {
        self.tracking = tracking;
        self
    }

    pub fn with_valuation(mut self, valuation: ValuationMethod) -> Self {
        self.valuation = valuation;
        self
    }

    pub fn with_thresholds(mut self, thresholds: StockThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.sku.trim().is_empty() {
            return Err(DomainError::validation("sku cannot be empty"));
        }
        self.thresholds.validate()
    }

    pub fn profile(&self) -> ArticleProfile {
        ArticleProfile {
            tracking: self.tracking,
            valuation: self.valuation,
        }
    }
}

/// The slice of article attributes a stock aggregate decides with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ArticleProfile {
    pub tracking: TrackingMode,
    pub valuation: ValuationMethod,
}
