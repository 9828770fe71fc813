//! LMSR (Logarithmic Market Scoring Rule) pricing kernel.
//!
//! Pure functions over a market's `(q_yes, q_no, b)` inventory. Nothing here
//! touches the store; callers apply the returned deltas inside a transaction.

use serde::{Deserialize, Serialize};

/// Number of bisection iterations `quote_buy` runs before giving up.
const BISECTION_ITERATIONS: u32 = 100;
/// Cost-domain tolerance for the bisection search, in the LMSR cost function's units.
const BISECTION_TOLERANCE: f64 = 1e-4;
/// Bound on how many times the bisection's upper bracket may be doubled
/// before a quote is treated as degenerate.
const MAX_HI_DOUBLINGS: u32 = 20;
/// Shares below this size are treated as zero (dust) so rounding residue
/// doesn't leave a permanent phantom position behind.
pub const DUST_THRESHOLD: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yes" => Ok(Side::Yes),
            "no" => Ok(Side::No),
            other => Err(format!("invalid side: '{other}', expected 'yes' or 'no'")),
        }
    }
}

/// A market's current inventory. `b` is the liquidity parameter and is
/// constant for the market's lifetime; `q_yes`/`q_no` are net outstanding
/// shares and may be negative.
#[derive(Debug, Clone, Copy)]
pub struct Inventory {
    pub q_yes: f64,
    pub q_no: f64,
    pub b: f64,
}

/// Numerically stable `ln(exp(a) + exp(b))`.
#[inline]
fn log_sum_exp(a: f64, b: f64) -> f64 {
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

/// `C(q_yes, q_no; b) = b * ln(exp(q_yes/b) + exp(q_no/b))`, computed via the
/// log-sum-exp trick to avoid overflow for large inventories.
pub fn cost(inv: Inventory) -> f64 {
    if inv.b <= 0.0 {
        return 0.0;
    }
    inv.b * log_sum_exp(inv.q_yes / inv.b, inv.q_no / inv.b)
}

/// Spot prices `(p_yes, p_no)`, always in `(0, 1)` and summing to 1.
/// Degenerate `b <= 0` markets (never live) quote a flat 50/50.
pub fn spot_prices(inv: Inventory) -> (f64, f64) {
    if inv.b <= 0.0 {
        return (0.5, 0.5);
    }
    let a = inv.q_yes / inv.b;
    let c = inv.q_no / inv.b;
    let m = a.max(c);
    let ey = (a - m).exp();
    let en = (c - m).exp();
    let p_yes = ey / (ey + en);
    (p_yes, 1.0 - p_yes)
}

pub fn spot_price(inv: Inventory, side: Side) -> f64 {
    let (p_yes, p_no) = spot_prices(inv);
    match side {
        Side::Yes => p_yes,
        Side::No => p_no,
    }
}

fn inventory_with_shares(inv: Inventory, side: Side, shares: f64) -> Inventory {
    match side {
        Side::Yes => Inventory {
            q_yes: inv.q_yes + shares,
            ..inv
        },
        Side::No => Inventory {
            q_no: inv.q_no + shares,
            ..inv
        },
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BuyQuote {
    pub shares: f64,
    pub avg_price: f64,
    pub price_impact: f64,
    pub spot_before: f64,
    pub p_yes_after: f64,
    pub p_no_after: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct SellQuote {
    pub proceeds: f64,
    pub avg_price: f64,
    pub price_impact: f64,
    pub spot_before: f64,
    pub p_yes_after: f64,
    pub p_no_after: f64,
}

/// Solve `C(q + s*e_side) - C(q) = amount` for `s` by bisection.
///
/// `lo = 0`, `hi = amount * 10` initially (one share pays at most $1 on win,
/// so the maker never hands out more than 10 shares per dollar near the
/// degenerate tails). If `hi` doesn't bracket the root the bound is doubled,
/// up to `MAX_HI_DOUBLINGS` times, hardening the open issue noted in the
/// design doc where a fixed `10x` multiplier can fail for extreme inventories.
pub fn quote_buy(inv: Inventory, side: Side, amount: f64) -> Option<BuyQuote> {
    if amount <= 0.0 || inv.b <= 0.0 {
        return None;
    }

    let spot_before = spot_price(inv, side);
    let target = cost(inv) + amount;

    let mut lo = 0.0_f64;
    let mut hi = amount * 10.0;
    let mut doublings = 0;
    while cost(inventory_with_shares(inv, side, hi)) < target {
        hi *= 2.0;
        doublings += 1;
        if doublings > MAX_HI_DOUBLINGS {
            return None;
        }
    }

    let mut shares = (lo + hi) / 2.0;
    for _ in 0..BISECTION_ITERATIONS {
        shares = (lo + hi) / 2.0;
        let c = cost(inventory_with_shares(inv, side, shares));
        if (c - target).abs() < BISECTION_TOLERANCE {
            break;
        }
        if c < target {
            lo = shares;
        } else {
            hi = shares;
        }
    }

    if shares <= 0.0 {
        return None;
    }

    let avg_price = amount / shares;
    let price_impact = (avg_price - spot_before) / spot_before;
    let after = inventory_with_shares(inv, side, shares);
    let (p_yes_after, p_no_after) = spot_prices(after);

    Some(BuyQuote {
        shares,
        avg_price,
        price_impact,
        spot_before,
        p_yes_after,
        p_no_after,
    })
}

/// Direct cost difference for selling `shares` of `side` back to the maker.
pub fn quote_sell(inv: Inventory, side: Side, shares: f64) -> Option<SellQuote> {
    if shares <= 0.0 || inv.b <= 0.0 {
        return None;
    }

    let spot_before = spot_price(inv, side);
    let before_cost = cost(inv);
    let after = inventory_with_shares(inv, side, -shares);
    let after_cost = cost(after);
    let proceeds = (before_cost - after_cost).max(0.0);

    let avg_price = proceeds / shares;
    let price_impact = (spot_before - avg_price) / spot_before;
    let (p_yes_after, p_no_after) = spot_prices(after);

    Some(SellQuote {
        proceeds,
        avg_price,
        price_impact,
        spot_before,
        p_yes_after,
        p_no_after,
    })
}

/// Inventory that seeds a market at target probability `p`, clamped to
/// `[0.01, 0.99]`: `q_no = 0`, `q_yes = b * ln(p / (1 - p))`.
pub fn initial_inventory(b: f64, target_probability: f64) -> Inventory {
    let p = target_probability.clamp(0.01, 0.99);
    Inventory {
        q_yes: b * (p / (1.0 - p)).ln(),
        q_no: 0.0,
        b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fifty_fifty_at_zero_inventory() {
        let inv = Inventory {
            q_yes: 0.0,
            q_no: 0.0,
            b: 100.0,
        };
        let (p_yes, p_no) = spot_prices(inv);
        assert!((p_yes - 0.5).abs() < 1e-12);
        assert!((p_no - 0.5).abs() < 1e-12);
    }

    #[test]
    fn initial_inventory_hits_target_probability() {
        let inv = initial_inventory(100.0, 0.65);
        let (p_yes, _) = spot_prices(inv);
        assert!((p_yes - 0.65).abs() < 1e-6, "p_yes={p_yes}");
        assert!((inv.q_yes - 61.9039).abs() < 1e-3);
        assert_eq!(inv.q_no, 0.0);
    }

    #[test]
    fn scenario_initial_fifty_fifty_buy_ten_yes() {
        let inv = Inventory {
            q_yes: 0.0,
            q_no: 0.0,
            b: 100.0,
        };
        let q = quote_buy(inv, Side::Yes, 10.0).unwrap();
        assert!((q.shares - 20.0025).abs() < 1e-3, "shares={}", q.shares);
        assert!((q.avg_price - 0.499994).abs() < 1e-3, "avg={}", q.avg_price);

        let after = inventory_with_shares(inv, Side::Yes, q.shares);
        assert!((after.q_yes - 20.0025).abs() < 1e-3);
        let (p_yes, _) = spot_prices(after);
        assert!((p_yes - 0.5499).abs() < 1e-3, "p_yes={p_yes}");
    }

    #[test]
    fn sell_after_buy_does_not_exceed_stake() {
        let inv = Inventory {
            q_yes: 0.0,
            q_no: 0.0,
            b: 100.0,
        };
        let buy = quote_buy(inv, Side::Yes, 10.0).unwrap();
        let after_buy = inventory_with_shares(inv, Side::Yes, buy.shares);
        let sell = quote_sell(after_buy, Side::Yes, buy.shares).unwrap();
        assert!(sell.proceeds <= 10.0 + 1e-6, "proceeds={}", sell.proceeds);
    }

    proptest! {
        #[test]
        fn prices_always_sum_to_one(
            q_yes in -5000.0f64..5000.0,
            q_no in -5000.0f64..5000.0,
            b in 1.0f64..10000.0,
        ) {
            let inv = Inventory { q_yes, q_no, b };
            let (p_yes, p_no) = spot_prices(inv);
            prop_assert!((p_yes + p_no - 1.0).abs() < 1e-9);
            prop_assert!(p_yes > 0.0 && p_yes < 1.0);
        }

        #[test]
        fn buying_yes_never_decreases_p_yes(
            q_yes in -1000.0f64..1000.0,
            q_no in -1000.0f64..1000.0,
            b in 10.0f64..2000.0,
            amount in 0.01f64..500.0,
        ) {
            let inv = Inventory { q_yes, q_no, b };
            if let Some(q) = quote_buy(inv, Side::Yes, amount) {
                prop_assert!(q.p_yes_after >= q.spot_before - 1e-9);
            }
        }

        #[test]
        fn buying_no_never_increases_p_yes(
            q_yes in -1000.0f64..1000.0,
            q_no in -1000.0f64..1000.0,
            b in 10.0f64..2000.0,
            amount in 0.01f64..500.0,
        ) {
            let inv = Inventory { q_yes, q_no, b };
            let spot_before = spot_price(inv, Side::Yes);
            if let Some(q) = quote_buy(inv, Side::No, amount) {
                prop_assert!(q.p_yes_after <= spot_before + 1e-9);
            }
        }

        #[test]
        fn round_trip_never_pays_more_than_received(
            q_yes in -500.0f64..500.0,
            q_no in -500.0f64..500.0,
            b in 50.0f64..2000.0,
            amount in 0.01f64..300.0,
            side_is_yes in any::<bool>(),
        ) {
            let inv = Inventory { q_yes, q_no, b };
            let side = if side_is_yes { Side::Yes } else { Side::No };
            if let Some(buy) = quote_buy(inv, side, amount) {
                let after = inventory_with_shares(inv, side, buy.shares);
                if let Some(sell) = quote_sell(after, side, buy.shares) {
                    prop_assert!(sell.proceeds <= amount + 1e-3);
                }
            }
        }
    }
}
