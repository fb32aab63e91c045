//! Resource quantity parsing
//!
//! Kubernetes quantities are strings such as `"2"`, `"500m"`, `"4Gi"` or
//! `"1e3"`. Comparing them as strings is wrong (`"2"` and `"2000m"` are the
//! same amount), so every quantity is parsed into a whole number of
//! nano-units before comparison.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

/// Nano-units per whole unit.
const NANO_EXPONENT: i32 = 9;

/// Longest digit string accepted before the value is considered out of range.
const MAX_DIGITS: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("quantity is empty")]
    Empty,
    #[error("quantity {0:?} is not a number")]
    NotANumber(String),
    #[error("quantity {0:?} has an unknown suffix")]
    UnknownSuffix(String),
    #[error("quantity {0:?} is negative")]
    Negative(String),
    #[error("quantity {0:?} is out of range")]
    OutOfRange(String),
}

/// A parsed, non-negative quantity expressed in nano-units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CanonicalQuantity(i128);

impl TryFrom<&Quantity> for CanonicalQuantity {
    type Error = QuantityError;

    fn try_from(quantity: &Quantity) -> Result<Self, Self::Error> {
        parse_quantity(&quantity.0)
    }
}

/// Parse a quantity string into nano-units.
///
/// Sub-nano remainders round up, matching how the API server canonicalises
/// values such as `"0.1n"`.
pub fn parse_quantity(input: &str) -> Result<CanonicalQuantity, QuantityError> {
    let raw = input.trim();
    if raw.is_empty() {
        return Err(QuantityError::Empty);
    }

    let (negative, unsigned) = match raw.as_bytes()[0] {
        b'-' => (true, &raw[1..]),
        b'+' => (false, &raw[1..]),
        _ => (false, raw),
    };

    let number_len = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(number_len);

    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
        return Err(QuantityError::NotANumber(input.to_string()));
    }

    let digits = format!("{whole}{fraction}");
    let digits = digits.trim_start_matches('0');
    if digits.len() > MAX_DIGITS {
        return Err(QuantityError::OutOfRange(input.to_string()));
    }
    let mantissa: i128 = if digits.is_empty() {
        0
    } else {
        digits
            .parse()
            .map_err(|_| QuantityError::NotANumber(input.to_string()))?
    };

    let (binary_exponent, decimal_exponent) = parse_suffix(suffix)
        .ok_or_else(|| QuantityError::UnknownSuffix(input.to_string()))?;

    if negative && mantissa != 0 {
        return Err(QuantityError::Negative(input.to_string()));
    }

    let out_of_range = || QuantityError::OutOfRange(input.to_string());

    let scaled = mantissa
        .checked_mul(1i128 << binary_exponent)
        .ok_or_else(out_of_range)?;

    let exponent = i64::try_from(fraction.len())
        .ok()
        .and_then(|fraction_digits| {
            (i64::from(decimal_exponent) + i64::from(NANO_EXPONENT)).checked_sub(fraction_digits)
        })
        .ok_or_else(out_of_range)?;
    let power = u32::try_from(exponent.unsigned_abs())
        .ok()
        .and_then(|exp| 10i128.checked_pow(exp));
    let nanos = if scaled == 0 {
        0
    } else if exponent >= 0 {
        power
            .and_then(|factor| scaled.checked_mul(factor))
            .ok_or_else(out_of_range)?
    } else {
        // Partial nano-units round up.
        match power {
            Some(divisor) => scaled / divisor + i128::from(scaled % divisor != 0),
            None => 1,
        }
    };

    Ok(CanonicalQuantity(nanos))
}

/// Returns `(binary exponent, decimal exponent)` for a suffix.
fn parse_suffix(suffix: &str) -> Option<(u32, i32)> {
    let scale = match suffix {
        "" => (0, 0),
        "n" => (0, -9),
        "u" => (0, -6),
        "m" => (0, -3),
        "k" => (0, 3),
        "M" => (0, 6),
        "G" => (0, 9),
        "T" => (0, 12),
        "P" => (0, 15),
        "E" => (0, 18),
        "Ki" => (10, 0),
        "Mi" => (20, 0),
        "Gi" => (30, 0),
        "Ti" => (40, 0),
        "Pi" => (50, 0),
        "Ei" => (60, 0),
        _ => {
            let exponent = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))?;
            if exponent.is_empty() {
                return None;
            }
            (0, exponent.parse::<i32>().ok()?)
        }
    };
    Some(scale)
}
