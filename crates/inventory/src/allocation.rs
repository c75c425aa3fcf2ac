//! Lot selection (FIFO / FEFO).
//!
//! Pure functions over lot snapshots. The caller turns the returned
//! allocation into ledger movements; nothing here mutates a lot.

use core::cmp::Ordering;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use depotledger_core::{LocationId, LotId};

use crate::lot::Lot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    /// Oldest receipt first.
    #[default]
    Fifo,
    /// Earliest expiry first (no expiry last), then oldest receipt.
    Fefo,
}

/// Which lots an exit may draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Selection {
    /// Any AVAILABLE lot, ordered by policy.
    Policy { policy: AllocationPolicy },
    /// Exactly this lot, which must be AVAILABLE.
    Lot { lot_id: LotId },
    /// Any lot holding stock at one location, whatever its status.
    ///
    /// Used for count adjustments: blocked or quarantined stock can go
    /// missing too.
    Location {
        location_id: Option<LocationId>,
        policy: AllocationPolicy,
    },
}

/// One slice of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub lot_id: LotId,
    pub quantity: i64,
    pub unit_cost: Decimal,
}

/// Eligible lots cannot cover the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shortfall {
    pub requested: i64,
    pub available: i64,
}

fn policy_order(policy: AllocationPolicy, a: &Lot, b: &Lot) -> Ordering {
    let by_receipt = a
        .received_at
        .cmp(&b.received_at)
        .then_with(|| a.id.cmp(&b.id));

    match policy {
        AllocationPolicy::Fifo => by_receipt,
        AllocationPolicy::Fefo => match (a.expires_on, b.expires_on) {
            (Some(x), Some(y)) => x.cmp(&y).then(by_receipt),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => by_receipt,
        },
    }
}

/// Lots accepted by `eligible`, in consumption order.
pub fn ordered_lots<'a, I, F>(lots: I, policy: AllocationPolicy, eligible: F) -> Vec<&'a Lot>
where
    I: IntoIterator<Item = &'a Lot>,
    F: Fn(&Lot) -> bool,
{
    let mut candidates: Vec<&Lot> = lots
        .into_iter()
        .filter(|lot| lot.quantity > 0 && eligible(lot))
        .collect();
    candidates.sort_by(|a, b| policy_order(policy, a, b));
    candidates
}

/// Greedy allocation over `ordered` lots, all-or-nothing.
fn take_greedily(ordered: &[&Lot], quantity: i64) -> Result<Vec<Allocation>, Shortfall> {
    let available: i64 = ordered.iter().map(|lot| lot.quantity).sum();
    if quantity <= 0 || available < quantity {
        return Err(Shortfall {
            requested: quantity,
            available,
        });
    }

    let mut remaining = quantity;
    let mut slices = Vec::new();
    for lot in ordered {
        if remaining == 0 {
            break;
        }
        let taken = remaining.min(lot.quantity);
        slices.push(Allocation {
            lot_id: lot.id,
            quantity: taken,
            unit_cost: lot.unit_cost,
        });
        remaining -= taken;
    }
    Ok(slices)
}

/// Allocate `quantity` from AVAILABLE lots under `policy`.
pub fn allocate<'a, I>(lots: I, quantity: i64, policy: AllocationPolicy) -> Result<Vec<Allocation>, Shortfall>
where
    I: IntoIterator<Item = &'a Lot>,
{
    let ordered = ordered_lots(lots, policy, Lot::is_allocatable);
    take_greedily(&ordered, quantity)
}

/// Allocate `quantity` according to an explicit `selection`.
pub fn allocate_from<'a, I>(
    lots: I,
    quantity: i64,
    selection: Selection,
) -> Result<Vec<Allocation>, Shortfall>
where
    I: IntoIterator<Item = &'a Lot>,
{
    match selection {
        Selection::Policy { policy } => allocate(lots, quantity, policy),
        Selection::Lot { lot_id } => {
            let ordered = ordered_lots(lots, AllocationPolicy::Fifo, |lot| {
                lot.id == lot_id && lot.is_allocatable()
            });
            take_greedily(&ordered, quantity)
        }
        Selection::Location {
            location_id,
            policy,
        } => {
            let ordered = ordered_lots(lots, policy, |lot| {
                lot.location_id == location_id && lot.holds_stock()
            });
            take_greedily(&ordered, quantity)
        }
    }
}

/// Relative unit-cost gap between two lots: |a − b| / max(a, b).
pub fn cost_gap(a: Decimal, b: Decimal) -> Decimal {
    let larger = a.max(b);
    if larger.is_zero() {
        return Decimal::ZERO;
    }
    (a - b).abs() / larger
}

/// Whether two lots are close enough in cost to be fused.
pub fn costs_within_tolerance(a: Decimal, b: Decimal, tolerance: Decimal) -> bool {
    cost_gap(a, b) <= tolerance
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, TimeZone, Utc};
    use depotledger_core::{ArticleId, WarehouseId};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    use crate::lot::LotStatus;

    fn lot(day: i64, quantity: i64, expires: Option<u32>) -> Lot {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 8, 0, 0).unwrap();
        Lot {
            id: LotId::new(),
            article_id: ArticleId::new(),
            warehouse_id: WarehouseId::new(),
            location_id: None,
            lot_number: None,
            initial_quantity: quantity,
            quantity,
            unit_cost: Decimal::from(day),
            manufactured_on: None,
            received_at: base + Duration::days(day),
            expires_on: expires.map(|d| NaiveDate::from_ymd_opt(2026, 2, d).unwrap()),
            status: LotStatus::Available,
            origin_lot_id: None,
        }
    }

    #[test]
    fn fifo_takes_oldest_lot_first() {
        let day1 = lot(1, 5, None);
        let day2 = lot(2, 5, None);
        let lots = [day2.clone(), day1.clone()];

        let slices = allocate(&lots, 7, AllocationPolicy::Fifo).unwrap();

        assert_eq!(slices.len(), 2);
        assert_eq!((slices[0].lot_id, slices[0].quantity), (day1.id, 5));
        assert_eq!((slices[1].lot_id, slices[1].quantity), (day2.id, 2));
    }

    #[test]
    fn fefo_takes_earliest_expiry_first() {
        let a = lot(1, 5, Some(10));
        let b = lot(2, 5, Some(5));
        let lots = [a, b.clone()];

        let slices = allocate(&lots, 5, AllocationPolicy::Fefo).unwrap();

        assert_eq!(slices, vec![Allocation { lot_id: b.id, quantity: 5, unit_cost: b.unit_cost }]);
    }

    #[test]
    fn fefo_puts_lots_without_expiry_last() {
        let open = lot(1, 5, None);
        let dated = lot(3, 5, Some(20));
        let lots = [open.clone(), dated.clone()];

        let slices = allocate(&lots, 6, AllocationPolicy::Fefo).unwrap();

        assert_eq!(slices[0].lot_id, dated.id);
        assert_eq!((slices[1].lot_id, slices[1].quantity), (open.id, 1));
    }

    #[test]
    fn fefo_breaks_expiry_ties_by_receipt() {
        let later = lot(4, 5, Some(9));
        let earlier = lot(2, 5, Some(9));
        let lots = [later, earlier.clone()];

        let slices = allocate(&lots, 3, AllocationPolicy::Fefo).unwrap();

        assert_eq!(slices[0].lot_id, earlier.id);
    }

    #[test]
    fn blocked_and_quarantined_lots_are_skipped() {
        let mut blocked = lot(1, 5, None);
        blocked.status = LotStatus::Blocked;
        let mut quarantined = lot(2, 5, None);
        quarantined.status = LotStatus::Quarantine;
        let open = lot(3, 2, None);
        let lots = [blocked, quarantined, open];

        let err = allocate(&lots, 3, AllocationPolicy::Fifo).unwrap_err();

        assert_eq!(err, Shortfall { requested: 3, available: 2 });
    }

    #[test]
    fn location_selection_includes_blocked_stock() {
        let here = LocationId::new();
        let mut blocked = lot(1, 4, None);
        blocked.status = LotStatus::Blocked;
        blocked.location_id = Some(here);
        let mut elsewhere = lot(2, 9, None);
        elsewhere.location_id = Some(LocationId::new());
        let lots = [blocked.clone(), elsewhere];

        let slices = allocate_from(
            &lots,
            4,
            Selection::Location { location_id: Some(here), policy: AllocationPolicy::Fifo },
        )
        .unwrap();

        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].lot_id, blocked.id);
    }

    #[test]
    fn explicit_lot_selection_never_spills_over() {
        let named = lot(2, 3, None);
        let other = lot(1, 10, None);
        let lots = [named.clone(), other];

        let err = allocate_from(&lots, 4, Selection::Lot { lot_id: named.id }).unwrap_err();

        assert_eq!(err.available, 3);
    }

    #[test]
    fn cost_gap_is_relative_to_the_larger_cost() {
        assert_eq!(cost_gap(dec!(10), dec!(8)), dec!(0.2));
        assert!(costs_within_tolerance(dec!(10), dec!(9.95), dec!(0.01)));
        assert!(!costs_within_tolerance(dec!(10), dec!(9), dec!(0.05)));
        assert!(costs_within_tolerance(Decimal::ZERO, Decimal::ZERO, Decimal::ZERO));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: a successful allocation takes exactly the requested
        /// quantity and never more than a lot holds.
        #[test]
        fn allocation_is_exact_and_bounded(
            quantities in prop::collection::vec(1i64..50, 1..8),
            fefo in any::<bool>(),
            request in 1i64..300,
        ) {
            let lots: Vec<Lot> = quantities
                .iter()
                .enumerate()
                .map(|(i, q)| lot(i as i64, *q, Some((i as u32 % 27) + 1)))
                .collect();
            let policy = if fefo { AllocationPolicy::Fefo } else { AllocationPolicy::Fifo };
            let total: i64 = quantities.iter().sum();

            match allocate(&lots, request, policy) {
                Ok(slices) => {
                    prop_assert!(request <= total);
                    prop_assert_eq!(slices.iter().map(|s| s.quantity).sum::<i64>(), request);
                    for slice in &slices {
                        let source = lots.iter().find(|l| l.id == slice.lot_id).unwrap();
                        prop_assert!(slice.quantity > 0 && slice.quantity <= source.quantity);
                    }
                    // Every lot but the last is drained completely.
                    for slice in slices.iter().rev().skip(1) {
                        let source = lots.iter().find(|l| l.id == slice.lot_id).unwrap();
                        prop_assert_eq!(slice.quantity, source.quantity);
                    }
                }
                Err(shortfall) => {
                    prop_assert!(request > total);
                    prop_assert_eq!(shortfall.available, total);
                }
            }
        }
    }
}
