//! Pure exit-pricing math.
//!
//! Everything in this module is referentially transparent: no I/O, no
//! mutable state. The lifecycle engine feeds live fee/spread/slippage
//! inputs through these functions on every tick.

use rust_decimal::Decimal;

const BPS: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

/// Inputs for the required gross exit move.
#[derive(Debug, Clone, Copy)]
pub struct ExitRequirement {
    pub desired_net_bps: Decimal,
    pub entry_fee_bps: Decimal,
    pub exit_fee_bps: Decimal,
    pub slippage_bps: Decimal,
    pub spread_buffer_bps: Decimal,
    pub profit_buffer_bps: Decimal,
    pub cap_bps: Decimal,
    pub min_gross_tp_bps: Decimal,
}

/// Minimum gross move (bps) that nets `desired_net_bps` after both fee
/// legs: solves `(1+net) = (1+gross)(1-feeBuy)(1-feeSell)`.
///
/// Degenerates to 0 when fees eat the whole notional.
pub fn net_after_fees_required_bps(
    entry_fee_bps: Decimal,
    exit_fee_bps: Decimal,
    desired_net_bps: Decimal,
) -> Decimal {
    let keep = (Decimal::ONE - entry_fee_bps / BPS) * (Decimal::ONE - exit_fee_bps / BPS);
    if keep <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let gross = (Decimal::ONE + desired_net_bps / BPS) / keep - Decimal::ONE;
    (gross * BPS).max(Decimal::ZERO)
}

/// Required gross exit move: fee-adjusted net target plus slippage and
/// buffers, capped at `cap_bps` only when the cap still covers the safety
/// floor (fees + slippage + buffers), then floored at the configured
/// minimum gross take-profit.
pub fn required_exit_bps(req: &ExitRequirement) -> Decimal {
    let fee_component =
        net_after_fees_required_bps(req.entry_fee_bps, req.exit_fee_bps, Decimal::ZERO);
    let safety_floor =
        fee_component + req.slippage_bps + req.spread_buffer_bps + req.profit_buffer_bps;

    let base = net_after_fees_required_bps(req.entry_fee_bps, req.exit_fee_bps, req.desired_net_bps)
        + req.slippage_bps
        + req.spread_buffer_bps
        + req.profit_buffer_bps;

    let capped = if req.cap_bps >= safety_floor {
        base.min(req.cap_bps)
    } else {
        // Never cap below the safety floor
        base.min(safety_floor)
    };

    capped.max(req.min_gross_tp_bps)
}

/// Spread-aware requirement: a wide current spread raises the bar.
/// `max(base, clamp(spread, floor, cap) * mult + add)`.
pub fn spread_aware_required_bps(
    base_required_bps: Decimal,
    spread_bps: Decimal,
    clamp_floor_bps: Decimal,
    clamp_cap_bps: Decimal,
    mult: Decimal,
    add_bps: Decimal,
) -> Decimal {
    let clamped = spread_bps.clamp(clamp_floor_bps, clamp_cap_bps);
    base_required_bps.max(clamped * mult + add_bps)
}

/// Concrete limit price for the exit: `entry * (1 + bps/10000)`, rounded
/// **up** to the nearest tick. Sellers never round down below the
/// required move.
pub fn target_sell_price(entry_price: Decimal, required_exit_bps: Decimal, tick: Decimal) -> Decimal {
    let raw = entry_price * (Decimal::ONE + required_exit_bps / BPS);
    round_up_to_tick(raw, tick)
}

/// Price at which the position breaks even after both fee legs, rounded up.
pub fn breakeven_price(
    entry_price: Decimal,
    entry_fee_bps: Decimal,
    exit_fee_bps: Decimal,
    tick: Decimal,
) -> Decimal {
    let bps = net_after_fees_required_bps(entry_fee_bps, exit_fee_bps, Decimal::ZERO);
    target_sell_price(entry_price, bps, tick)
}

fn round_up_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    let ticks = (price / tick).ceil();
    ticks * tick
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn req() -> ExitRequirement {
        ExitRequirement {
            desired_net_bps: dec!(100),
            entry_fee_bps: dec!(15),
            exit_fee_bps: dec!(15),
            slippage_bps: dec!(0),
            spread_buffer_bps: dec!(0),
            profit_buffer_bps: dec!(0),
            cap_bps: dec!(500),
            min_gross_tp_bps: dec!(0),
        }
    }

    #[test]
    fn fee_round_trip_scenario() {
        // entry 100, 15 bps each way, desired net 100 bps:
        // gross = (1.0100)/((1-0.0015)^2) - 1 ~= 130.3 bps
        let bps = net_after_fees_required_bps(dec!(15), dec!(15), dec!(100));
        assert!(bps > dec!(130.2) && bps < dec!(130.5), "got {bps}");

        let target = target_sell_price(dec!(100), bps, dec!(0.01));
        assert_eq!(target, dec!(101.31));
    }

    #[test]
    fn fee_round_trip_inversion() {
        // Feeding the computed gross back through the round-trip formula
        // reproduces the desired net within rounding tolerance.
        for (entry, exit, net) in [
            (dec!(15), dec!(25), dec!(100)),
            (dec!(0), dec!(0), dec!(50)),
            (dec!(30), dec!(30), dec!(0)),
            (dec!(10), dec!(40), dec!(250)),
        ] {
            let gross = net_after_fees_required_bps(entry, exit, net);
            let keep = (Decimal::ONE - entry / dec!(10000)) * (Decimal::ONE - exit / dec!(10000));
            let achieved = ((Decimal::ONE + gross / dec!(10000)) * keep - Decimal::ONE)
                * dec!(10000);
            assert!((achieved - net).abs() < dec!(0.0001), "net {net} -> {achieved}");
        }
    }

    #[test]
    fn degenerate_fees_yield_zero() {
        assert_eq!(
            net_after_fees_required_bps(dec!(10000), dec!(0), dec!(100)),
            Decimal::ZERO
        );
        assert_eq!(
            net_after_fees_required_bps(dec!(6000), dec!(5000), dec!(100)),
            Decimal::ZERO
        );
    }

    #[test]
    fn required_exit_monotonic_in_desired_net() {
        let mut prev = Decimal::MIN;
        for net in [0i64, 25, 50, 100, 200, 400] {
            let mut r = req();
            r.desired_net_bps = Decimal::from(net);
            let got = required_exit_bps(&r);
            assert!(got >= prev, "not monotonic at net={net}");
            prev = got;
        }
    }

    #[test]
    fn spread_aware_monotonic_in_spread() {
        let mut prev = Decimal::MIN;
        for spread in [0i64, 5, 10, 25, 50, 100] {
            let got = spread_aware_required_bps(
                dec!(30),
                Decimal::from(spread),
                dec!(2),
                dec!(50),
                dec!(2),
                dec!(10),
            );
            assert!(got >= prev, "not monotonic at spread={spread}");
            prev = got;
        }
    }

    #[test]
    fn cap_never_cuts_below_safety_floor() {
        let r = ExitRequirement {
            desired_net_bps: dec!(500),
            entry_fee_bps: dec!(50),
            exit_fee_bps: dec!(50),
            slippage_bps: dec!(20),
            spread_buffer_bps: dec!(10),
            profit_buffer_bps: dec!(10),
            cap_bps: dec!(50), // below fees + slippage + buffers
            min_gross_tp_bps: dec!(0),
        };
        let floor = net_after_fees_required_bps(dec!(50), dec!(50), dec!(0))
            + dec!(20)
            + dec!(10)
            + dec!(10);
        assert!(required_exit_bps(&r) >= floor);
    }

    #[test]
    fn min_gross_floor_applies() {
        let r = ExitRequirement {
            desired_net_bps: dec!(0),
            entry_fee_bps: dec!(0),
            exit_fee_bps: dec!(0),
            slippage_bps: dec!(0),
            spread_buffer_bps: dec!(0),
            profit_buffer_bps: dec!(0),
            cap_bps: dec!(500),
            min_gross_tp_bps: dec!(20),
        };
        assert_eq!(required_exit_bps(&r), dec!(20));
    }

    #[test]
    fn target_rounds_up_never_down() {
        for (entry, bps, tick) in [
            (dec!(100), dec!(130.3), dec!(0.01)),
            (dec!(0.4567), dec!(85), dec!(0.0001)),
            (dec!(50000), dec!(12), dec!(0.5)),
        ] {
            let target = target_sell_price(entry, bps, tick);
            let raw = entry * (Decimal::ONE + bps / dec!(10000));
            assert!(target >= raw, "rounded down: {target} < {raw}");
            assert!(target - raw < tick, "over-rounded: {target} vs {raw}");
        }
    }

    #[test]
    fn breakeven_above_entry_when_fees_positive() {
        let be = breakeven_price(dec!(100), dec!(15), dec!(15), dec!(0.01));
        assert!(be > dec!(100));
        assert!(be < dec!(100.35));
    }
}
