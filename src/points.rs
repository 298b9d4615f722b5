//! Integer-point price arithmetic.
//!
//! Wire prices arrive as decimal strings ("0.53"). They are parsed exactly
//! with `rust_decimal` and converted to integer points (1 point = $0.01) at
//! the boundary; no floating arithmetic ever touches a price value.

use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;

/// Upper clamp for trigger prices: one tick below the $1.00 payout.
pub const MAX_TRIGGER_POINTS: i64 = 99;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PointsError {
    #[error("price {0:?} is not a valid decimal")]
    Unparseable(String),

    #[error("price {0:?} is not an exact multiple of $0.01")]
    Inexact(String),

    #[error("price {0:?} is outside [0.00, 1.00]")]
    OutOfRange(String),
}

/// Convert a wire price string to integer points. "0.5300" and "0.53" both
/// yield 53; "0.535" is rejected as inexact.
pub fn price_to_points(raw: &str) -> Result<i64, PointsError> {
    let dec = Decimal::from_str(raw.trim())
        .map_err(|_| PointsError::Unparseable(raw.to_string()))?;

    let scaled = dec * Decimal::from(100);
    if !scaled.fract().is_zero() {
        return Err(PointsError::Inexact(raw.to_string()));
    }

    let points = scaled
        .to_i64()
        .ok_or_else(|| PointsError::OutOfRange(raw.to_string()))?;
    if !(0..=100).contains(&points) {
        return Err(PointsError::OutOfRange(raw.to_string()));
    }
    Ok(points)
}

/// Floor a point value down to the nearest tick increment.
/// `div_euclid` gives true floor semantics for negative inputs
/// (reference − S0 can go below zero near the boundary).
pub fn floor_to_tick(points: i64, tick: i64) -> i64 {
    points.div_euclid(tick) * tick
}

/// Clamp a trigger price to the valid maker range `[tick, 99]`.
pub fn clamp_trigger(points: i64, tick: i64) -> i64 {
    points.clamp(tick, MAX_TRIGGER_POINTS)
}

/// Midpoint of bid and ask in points, integer floor division.
pub fn midpoint_points(bid: i64, ask: i64) -> i64 {
    (bid + ask) / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_wire_prices() {
        assert_eq!(price_to_points("0.53"), Ok(53));
        assert_eq!(price_to_points("0.01"), Ok(1));
        assert_eq!(price_to_points("0.99"), Ok(99));
        assert_eq!(price_to_points("1"), Ok(100));
        assert_eq!(price_to_points("0"), Ok(0));
    }

    #[test]
    fn trailing_zeros_do_not_change_value() {
        // "0.5300" and "0.53" must be the same points value.
        assert_eq!(price_to_points("0.5300"), price_to_points("0.53"));
        assert_eq!(price_to_points("0.5300"), Ok(53));
    }

    #[test]
    fn sub_cent_prices_are_rejected() {
        assert_eq!(
            price_to_points("0.535"),
            Err(PointsError::Inexact("0.535".to_string()))
        );
        assert_eq!(
            price_to_points("0.001"),
            Err(PointsError::Inexact("0.001".to_string()))
        );
    }

    #[test]
    fn garbage_and_out_of_range_rejected() {
        assert!(matches!(
            price_to_points("abc"),
            Err(PointsError::Unparseable(_))
        ));
        assert!(matches!(
            price_to_points("1.01"),
            Err(PointsError::OutOfRange(_))
        ));
        assert!(matches!(
            price_to_points("-0.05"),
            Err(PointsError::OutOfRange(_))
        ));
    }

    #[test]
    fn floor_to_tick_floors() {
        assert_eq!(floor_to_tick(47, 1), 47);
        assert_eq!(floor_to_tick(47, 2), 46);
        assert_eq!(floor_to_tick(47, 5), 45);
        assert_eq!(floor_to_tick(-3, 2), -4);
    }

    #[test]
    fn floor_to_tick_scales_linearly_within_range() {
        // floor_to_tick(x * k) == k * floor_to_tick(x) for tick-aligned scaling,
        // a regression guard against off-by-one tick rounding.
        for tick in [1i64, 2, 5] {
            for x in 0..30 {
                for k in 1..4 {
                    if k * tick <= MAX_TRIGGER_POINTS {
                        assert_eq!(
                            floor_to_tick(x * k, tick * k),
                            k * floor_to_tick(x, tick),
                            "x={x} k={k} tick={tick}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn clamp_trigger_bounds() {
        assert_eq!(clamp_trigger(47, 1), 47);
        assert_eq!(clamp_trigger(0, 1), 1);
        assert_eq!(clamp_trigger(-6, 1), 1);
        assert_eq!(clamp_trigger(150, 1), 99);
        assert_eq!(clamp_trigger(1, 2), 2);
    }

    #[test]
    fn midpoint_floors() {
        assert_eq!(midpoint_points(44, 46), 45);
        assert_eq!(midpoint_points(44, 47), 45);
        assert_eq!(midpoint_points(52, 55), 53);
    }
}
