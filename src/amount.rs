//! Conversion between human decimal amounts and token atomic units.
//!
//! Storage and matching only ever use the atomic integer. The display form
//! is for humans: it rounds to at most six fractional digits and always
//! shows at least two.

use crate::error::{Error, Result};
use alloy::primitives::U256;

/// Decimal precision of USDC.
pub const USDC_DECIMALS: u8 = 6;

/// Largest precision whose scale factor fits in a `U256`.
pub const MAX_DECIMALS: u8 = 77;

const MIN_DISPLAY_FRACTION: usize = 2;
const MAX_DISPLAY_FRACTION: u8 = 6;

/// Parse a human decimal string (e.g. `"12.34"`) into atomic units.
///
/// Accepts an optional integer part and an optional fractional part, at
/// least one of which must contain a digit. Signs, exponents and grouping
/// separators are rejected.
///
/// # Errors
///
/// Returns [`Error::InvalidAmount`] if the string is not a non-negative
/// decimal number, has more fractional digits than `decimals`, or does not
/// fit in 256 bits.
pub fn to_atomic(amount: &str, decimals: u8) -> Result<U256> {
    let invalid = |reason: String| Error::InvalidAmount(format!("{amount:?}: {reason}"));

    if decimals > MAX_DECIMALS {
        return Err(invalid(format!("precision {decimals} exceeds {MAX_DECIMALS}")));
    }

    let trimmed = amount.trim();
    let (whole, fraction) = trimmed.split_once('.').unwrap_or((trimmed, ""));

    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid("no digits".to_string()));
    }
    if !whole.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(invalid("not a non-negative decimal number".to_string()));
    }
    if fraction.len() > usize::from(decimals) {
        return Err(invalid(format!(
            "more than {decimals} fractional digits"
        )));
    }

    let padding = usize::from(decimals) - fraction.len();
    let digits = whole
        .bytes()
        .chain(fraction.bytes())
        .chain(std::iter::repeat(b'0').take(padding));

    let ten = U256::from(10u8);
    let mut atomic = U256::ZERO;
    for digit in digits {
        atomic = atomic
            .checked_mul(ten)
            .and_then(|v| v.checked_add(U256::from(digit - b'0')))
            .ok_or_else(|| invalid("too large".to_string()))?;
    }
    Ok(atomic)
}

/// Format atomic units for display: comma-grouped integer part, between two
/// and six fractional digits, half-up rounding beyond the sixth.
///
/// Precision above [`MAX_DECIMALS`] is clamped.
#[must_use]
pub fn to_display(atomic: U256, decimals: u8) -> String {
    let decimals = decimals.min(MAX_DECIMALS);
    let scale = pow10(decimals);
    let mut whole = atomic / scale;
    let remainder = atomic % scale;

    let mut fraction = if decimals > MAX_DISPLAY_FRACTION {
        let divisor = pow10(decimals - MAX_DISPLAY_FRACTION);
        let mut kept = remainder / divisor;
        if (remainder % divisor) * U256::from(2u8) >= divisor {
            kept += U256::from(1u8);
            if kept == pow10(MAX_DISPLAY_FRACTION) {
                whole += U256::from(1u8);
                kept = U256::ZERO;
            }
        }
        zero_pad(&kept.to_string(), usize::from(MAX_DISPLAY_FRACTION))
    } else {
        zero_pad(&remainder.to_string(), usize::from(decimals))
    };

    while fraction.len() > MIN_DISPLAY_FRACTION && fraction.ends_with('0') {
        fraction.pop();
    }
    while fraction.len() < MIN_DISPLAY_FRACTION {
        fraction.push('0');
    }

    format!("{}.{fraction}", group_thousands(&whole.to_string()))
}

/// Exact plain decimal form of atomic units, e.g. `"10"` or `"0.000001"`.
///
/// No grouping and no rounding; trailing fractional zeros are dropped, so
/// `to_atomic(&to_decimal(x, d), d) == x`. Precision above [`MAX_DECIMALS`]
/// is clamped.
#[must_use]
pub fn to_decimal(atomic: U256, decimals: u8) -> String {
    let decimals = decimals.min(MAX_DECIMALS);
    let scale = pow10(decimals);
    let whole = atomic / scale;
    let fraction = zero_pad(&(atomic % scale).to_string(), usize::from(decimals));
    let fraction = fraction.trim_end_matches('0');

    if fraction.is_empty() {
        whole.to_string()
    } else {
        format!("{whole}.{fraction}")
    }
}

fn pow10(exp: u8) -> U256 {
    U256::from(10u8).pow(U256::from(exp))
}

fn zero_pad(digits: &str, width: usize) -> String {
    if width == 0 {
        return String::new();
    }
    format!("{digits:0>width$}")
}

fn group_thousands(digits: &str) -> String {
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    grouped
}

/// Serde adapter carrying atomic amounts as decimal strings.
///
/// JSON numbers lose precision above 2^53, so amounts cross the store
/// boundary as strings such as `"10000000"`.
pub mod decimal_string {
    use alloy::primitives::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as a base-10 string.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    /// Deserialize from a base-10 string of digits.
    ///
    /// # Errors
    ///
    /// Fails on empty strings, non-digits, or overflow.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(serde::de::Error::custom(format!(
                "expected a decimal integer string, got {raw:?}"
            )));
        }
        U256::from_str_radix(&raw, 10).map_err(serde::de::Error::custom)
    }
}
