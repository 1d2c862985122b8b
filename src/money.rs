//! Fixed-point money helpers.
//!
//! All amounts are `Decimal` in the platform currency with at most two
//! fractional digits. Gateways speak minor units (cents), the ledger speaks
//! decimal units.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Number of fractional digits of the platform currency
pub const CURRENCY_SCALE: u32 = 2;

/// Largest amount or balance the ledger columns (`NUMERIC(12, 2)`) hold:
/// 9 999 999 999.99
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(3_567_587_327, 232, 0, false, CURRENCY_SCALE);

/// Round half-up at `dp` fractional digits.
///
/// For the positive amounts handled here `MidpointAwayFromZero` is exactly
/// commercial half-up rounding (2.345 -> 2.35).
pub fn round_half_up(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

/// True when `amount` has no more fractional digits than the currency allows.
pub fn is_currency_exact(amount: Decimal) -> bool {
    amount.normalize().scale() <= CURRENCY_SCALE
}

/// Commission split of an escrow total
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionSplit {
    pub total: Decimal,
    pub commission: Decimal,
    pub courier_amount: Decimal,
}

/// Split `total` into the platform commission and the courier's share.
///
/// The commission is rounded, the courier amount is the exact remainder, so
/// `commission + courier_amount == total` holds without drift.
pub fn split_commission(total: Decimal, rate: Decimal) -> CommissionSplit {
    let commission = round_half_up(total * rate, CURRENCY_SCALE);
    CommissionSplit {
        total,
        commission,
        courier_amount: total - commission,
    }
}

/// Convert a decimal amount to gateway minor units (cents).
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    if !is_currency_exact(amount) {
        return None;
    }
    (amount * Decimal::from(100)).to_i64()
}

pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, CURRENCY_SCALE)
}

/// Mask an IBAN for display: first 4 and last 4 characters only.
///
/// Values shorter than 8 characters cannot be masked meaningfully and are
/// returned as-is.
pub fn mask_iban(iban: &str) -> String {
    let chars: Vec<char> = iban.chars().collect();
    if chars.len() < 8 {
        return iban.to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", head, tail)
}

/// Last four characters, used in ledger descriptions.
pub fn iban_suffix(iban: &str) -> String {
    let chars: Vec<char> = iban.chars().collect();
    let start = chars.len().saturating_sub(4);
    chars[start..].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_max_amount_matches_column_precision() {
        assert_eq!(MAX_AMOUNT, Decimal::from_str("9999999999.99").unwrap());
        assert!(is_currency_exact(MAX_AMOUNT));
    }

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_split_commission_round_number() {
        let split = split_commission(d("100.00"), d("0.10"));
        assert_eq!(split.commission, d("10.00"));
        assert_eq!(split.courier_amount, d("90.00"));
    }

    #[test]
    fn test_split_commission_rounds_half_up() {
        // 0.10 * 12.35 = 1.235 -> 1.24
        let split = split_commission(d("12.35"), d("0.10"));
        assert_eq!(split.commission, d("1.24"));
        assert_eq!(split.courier_amount, d("11.11"));
        assert_eq!(split.commission + split.courier_amount, split.total);
    }

    #[test]
    fn test_split_commission_never_drifts() {
        let rate = d("0.15");
        let mut cents = 100i64;
        while cents < 100_000 {
            let total = from_minor_units(cents);
            let split = split_commission(total, rate);
            assert_eq!(split.commission + split.courier_amount, total);
            assert_eq!(split.commission, round_half_up(total * rate, 2));
            cents += 137;
        }
    }

    #[test]
    fn test_currency_exactness() {
        assert!(is_currency_exact(d("10")));
        assert!(is_currency_exact(d("10.5")));
        assert!(is_currency_exact(d("10.50")));
        assert!(is_currency_exact(d("10.500")));
        assert!(!is_currency_exact(d("10.505")));
    }

    #[test]
    fn test_minor_units() {
        assert_eq!(to_minor_units(d("12.34")), Some(1234));
        assert_eq!(to_minor_units(d("1")), Some(100));
        assert_eq!(to_minor_units(d("1.001")), None);
        assert_eq!(from_minor_units(9000), d("90.00"));
    }

    #[test]
    fn test_mask_iban() {
        assert_eq!(mask_iban("FR7630006000011234567890189"), "FR76****0189");
        assert_eq!(mask_iban("SHORT"), "SHORT");
        assert_eq!(iban_suffix("FR7630006000011234567890189"), "0189");
        assert_eq!(iban_suffix("AB"), "AB");
    }
}
