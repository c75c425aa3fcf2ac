//! Stock valuation figures.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::lot::Lot;

/// Quantity, total value and resulting unit cost of a stock position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ValuationSnapshot {
    pub quantity: i64,
    pub value: Decimal,
    pub unit_cost: Decimal,
}

impl ValuationSnapshot {
    pub fn new(quantity: i64, value: Decimal) -> Self {
        let unit_cost = if quantity == 0 {
            Decimal::ZERO
        } else {
            value / Decimal::from(quantity)
        };
        Self {
            quantity,
            value,
            unit_cost,
        }
    }

    /// Sum of two positions (e.g. two warehouses).
    pub fn combine(self, other: ValuationSnapshot) -> ValuationSnapshot {
        ValuationSnapshot::new(self.quantity + other.quantity, self.value + other.value)
    }

    /// Σ quantity × own cost over the lots that still hold stock.
    pub fn of_lots<'a, I>(lots: I) -> ValuationSnapshot
    where
        I: IntoIterator<Item = &'a Lot>,
    {
        let (quantity, value) = lots
            .into_iter()
            .filter(|lot| lot.holds_stock())
            .fold((0i64, Decimal::ZERO), |(q, v), lot| (q + lot.quantity, v + lot.value()));
        ValuationSnapshot::new(quantity, value)
    }
}

/// Decimal places kept on a unit cost derived by division.
pub const COST_SCALE: u32 = 6;

/// Round a derived unit cost to [`COST_SCALE`], half away from zero.
///
/// The stored value of `q` units then differs from the exact value by at
/// most `q × 0.5e-6`.
pub fn round_cost(unit_cost: Decimal) -> Decimal {
    unit_cost.round_dp_with_strategy(COST_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// CUMP after an entry: `(Q·C + q·c) / (Q + q)`.
///
/// An empty position simply takes the incoming cost.
pub fn weighted_average_cost(
    existing_quantity: i64,
    existing_unit_cost: Decimal,
    incoming_quantity: i64,
    incoming_unit_cost: Decimal,
) -> Decimal {
    let total = existing_quantity + incoming_quantity;
    if existing_quantity <= 0 || total <= 0 {
        return incoming_unit_cost;
    }
    let existing_value = Decimal::from(existing_quantity) * existing_unit_cost;
    let incoming_value = Decimal::from(incoming_quantity) * incoming_unit_cost;
    (existing_value + incoming_value) / Decimal::from(total)
}
