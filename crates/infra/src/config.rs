//! Engine configuration.
//!
//! Loaded hierarchically:
//! 1. Defaults in code
//! 2. Optional `config/{DEPOT_ENVIRONMENT}` file (toml/yaml/json)
//! 3. `DEPOT__SECTION__KEY` environment overrides

use std::time::Duration;

use config::{ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

use depotledger_inventory::{RecountPolicy, ShortfallPolicy};
use depotledger_observability::LoggingConfig;

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub lots: LotsConfig,
    pub reservations: ReservationsConfig,
    pub transfers: TransfersConfig,
    pub counting: CountingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LotsConfig {
    /// Largest relative unit-cost gap accepted when merging two lots.
    /// Zero requires identical costs.
    pub merge_cost_tolerance: Decimal,
}

impl Default for LotsConfig {
    fn default() -> Self {
        Self {
            merge_cost_tolerance: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReservationsConfig {
    /// Lifetime of a reservation when the caller gives none.
    pub default_ttl_secs: u64,
    /// Period of the background expiry sweep.
    pub sweep_interval_secs: u64,
}

impl Default for ReservationsConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 86_400,
            sweep_interval_secs: 60,
        }
    }
}

impl ReservationsConfig {
    pub fn default_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.default_ttl_secs).unwrap_or(i64::MAX / 1000))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransfersConfig {
    /// Destination lots inherit number, cost and dates from their source lot.
    pub preserve_lot_identity: bool,
    pub shortfall_policy: ShortfallPolicy,
}

impl Default for TransfersConfig {
    fn default() -> Self {
        Self {
            preserve_lot_identity: true,
            shortfall_policy: ShortfallPolicy::ReviewRequired,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CountingConfig {
    pub recount_variance_ratio: Decimal,
    pub recount_variance_value: Option<Decimal>,
}

impl Default for CountingConfig {
    fn default() -> Self {
        let policy = RecountPolicy::default();
        Self {
            recount_variance_ratio: policy.variance_ratio,
            recount_variance_value: policy.variance_value,
        }
    }
}

impl CountingConfig {
    pub fn recount_policy(&self) -> RecountPolicy {
        RecountPolicy {
            variance_ratio: self.recount_variance_ratio,
            variance_value: self.recount_variance_value,
        }
    }
}

impl EngineConfig {
    /// Load configuration from files and environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let environment = std::env::var("DEPOT_ENVIRONMENT").unwrap_or_else(|_| "development".into());
        Self::load_from(&format!("config/{environment}"))
    }

    /// Same as [`EngineConfig::load`] with an explicit file stem.
    pub fn load_from(file: &str) -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .set_default("lots.merge_cost_tolerance", "0")?
            .set_default("reservations.default_ttl_secs", 86_400)?
            .set_default("reservations.sweep_interval_secs", 60)?
            .set_default("transfers.preserve_lot_identity", true)?
            .set_default("transfers.shortfall_policy", "review_required")?
            .set_default("counting.recount_variance_ratio", "0.10")?
            .set_default("logging.filter", "info")?
            .set_default("logging.json", false)?
            .add_source(File::with_name(file).required(false))
            .add_source(
                Environment::with_prefix("DEPOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
