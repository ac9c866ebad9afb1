//! Amount helpers. The domain works in `Decimal` rupees, storage and the
//! gateway wire format work in integer minor units (paise).

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

/// Converts an amount to minor units, rounding half away from zero at 2dp.
pub fn to_minor(amount: Decimal) -> i64 {
    amount
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        .checked_mul(Decimal::ONE_HUNDRED)
        .and_then(|scaled| scaled.to_i64())
        .unwrap_or(i64::MAX)
}

pub fn from_minor(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

/// Parses a display price such as `"₹1,299.00"`, `"Rs. 500"` or `"42.5"`.
///
/// Everything that is not a digit, a decimal point or a leading minus is
/// dropped before parsing.
pub fn parse_price(raw: &str) -> Option<Decimal> {
    let mut cleaned = String::with_capacity(raw.len());
    for (idx, ch) in raw.trim().char_indices() {
        if ch.is_ascii_digit() || ch == '.' {
            cleaned.push(ch);
        } else if ch == '-' && idx == 0 {
            cleaned.push(ch);
        }
    }
    // "Rs." leaves a stray leading dot behind
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        return None;
    }
    cleaned
        .parse::<Decimal>()
        .ok()
        .map(|d| d.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
}
