//! Parsing of Kubernetes resource quantities into comparable values.
//!
//! `k8s-openapi` models a quantity as its serialized string, so `"1"`, `"1000m"`
//! and `"1e3m"` are different values there. Configured and reported values are
//! normalised to a [`MilliValue`] before they are compared.

use crate::Quantity;
use std::{fmt, str::FromStr};
use thiserror::Error;

/// A quantity expressed in thousandths of its base unit, rounded up.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MilliValue(i128);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("quantity is empty")]
    Empty,

    #[error("quantity {0:?} does not start with a valid number")]
    InvalidNumber(String),

    #[error("quantity {0:?} has an unrecognised suffix")]
    UnknownSuffix(String),

    #[error("quantity {0:?} is out of range")]
    OutOfRange(String),
}

const MAX_MANTISSA_DIGITS: usize = 30;
const MAX_EXPONENT: i32 = 30;

// === impl MilliValue ===

impl MilliValue {
    pub const ZERO: Self = Self(0);

    pub fn from_millis(millis: i128) -> Self {
        Self(millis)
    }

    pub fn as_millis(self) -> i128 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for MilliValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}m", self.0)
    }
}

impl FromStr for MilliValue {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_str(s)
    }
}

impl TryFrom<&Quantity> for MilliValue {
    type Error = QuantityError;

    fn try_from(q: &Quantity) -> Result<Self, Self::Error> {
        parse_str(&q.0)
    }
}

pub fn parse(q: &Quantity) -> Result<MilliValue, QuantityError> {
    parse_str(&q.0)
}

/// Parses a quantity string: an optionally signed decimal number followed by a
/// binary SI suffix (`Ki`..`Ei`), a decimal SI suffix (`n`..`E`) or a decimal
/// exponent (`e3`, `E-2`).
pub fn parse_str(s: &str) -> Result<MilliValue, QuantityError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }

    let (negative, unsigned) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };

    let number_len = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(number_len);
    let (int_digits, frac_digits) = number.split_once('.').unwrap_or((number, ""));
    if (int_digits.is_empty() && frac_digits.is_empty()) || frac_digits.contains('.') {
        return Err(QuantityError::InvalidNumber(s.to_string()));
    }
    if int_digits.len() + frac_digits.len() > MAX_MANTISSA_DIGITS {
        return Err(QuantityError::OutOfRange(s.to_string()));
    }

    let mut mantissa: i128 = 0;
    for d in int_digits.bytes().chain(frac_digits.bytes()) {
        mantissa = mantissa * 10 + i128::from(d - b'0');
    }

    let (exp10, exp2) = suffix_exponents(suffix).ok_or_else(|| {
        if suffix.starts_with(['e', 'E']) {
            QuantityError::InvalidNumber(s.to_string())
        } else {
            QuantityError::UnknownSuffix(s.to_string())
        }
    })?;
    if exp10.abs() > MAX_EXPONENT {
        return Err(QuantityError::OutOfRange(s.to_string()));
    }

    let out_of_range = || QuantityError::OutOfRange(s.to_string());

    // Shift by three decimal places to land on milli-units.
    let exp10 = exp10 + 3 - frac_digits.len() as i32;
    let mut value = mantissa
        .checked_mul(1i128 << exp2)
        .ok_or_else(out_of_range)?;
    if exp10 >= 0 {
        let scale = 10i128.checked_pow(exp10 as u32).ok_or_else(out_of_range)?;
        value = value.checked_mul(scale).ok_or_else(out_of_range)?;
    } else {
        let scale = 10i128
            .checked_pow(exp10.unsigned_abs())
            .ok_or_else(out_of_range)?;
        value = value / scale + i128::from(value % scale != 0);
    }

    Ok(MilliValue(if negative { -value } else { value }))
}

fn suffix_exponents(suffix: &str) -> Option<(i32, u32)> {
    let exps = match suffix {
        "" => (0, 0),
        "n" => (-9, 0),
        "u" => (-6, 0),
        "m" => (-3, 0),
        "k" => (3, 0),
        "M" => (6, 0),
        "G" => (9, 0),
        "T" => (12, 0),
        "P" => (15, 0),
        "E" => (18, 0),
        "Ki" => (0, 10),
        "Mi" => (0, 20),
        "Gi" => (0, 30),
        "Ti" => (0, 40),
        "Pi" => (0, 50),
        "Ei" => (0, 60),
        _ => {
            let exp = suffix.strip_prefix(['e', 'E'])?;
            return exp.parse::<i32>().ok().map(|e| (e, 0));
        }
    };
    Some(exps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(s: &str) -> i128 {
        parse_str(s).expect("quantity must parse").as_millis()
    }

    #[test]
    fn cpu_quantities() {
        assert_eq!(millis("3m"), 3);
        assert_eq!(millis("1"), 1000);
        assert_eq!(millis("0.5"), 500);
        assert_eq!(millis(".25"), 250);
        assert_eq!(millis("1000m"), millis("1"));
    }

    #[test]
    fn memory_quantities() {
        assert_eq!(millis("3M"), 3_000_000_000);
        assert_eq!(millis("3Mi"), 3 * 1024 * 1024 * 1000);
        assert_eq!(millis("1Gi"), millis("1024Mi"));
        assert_eq!(millis("1k"), millis("1000"));
    }

    #[test]
    fn exponents() {
        assert_eq!(millis("1e3"), 1_000_000);
        assert_eq!(millis("1E3"), 1_000_000);
        assert_eq!(millis("5e-3"), 5);
        // A bare `E` is the exa suffix, not an exponent.
        assert_eq!(millis("1E"), 1_000_000_000_000_000_000_000);
    }

    #[test]
    fn sub_milli_values_round_up() {
        assert_eq!(millis("100n"), 1);
        assert_eq!(millis("1u"), 1);
        assert_eq!(millis("0"), 0);
        assert!(parse_str("0m").unwrap().is_zero());
    }

    #[test]
    fn signs() {
        assert_eq!(millis("-2"), -2000);
        assert_eq!(millis("+2"), 2000);
    }

    #[test]
    fn invalid() {
        assert_eq!(parse_str(""), Err(QuantityError::Empty));
        assert_eq!(
            parse_str("abc"),
            Err(QuantityError::InvalidNumber("abc".to_string()))
        );
        assert_eq!(
            parse_str("1.2.3"),
            Err(QuantityError::InvalidNumber("1.2.3".to_string()))
        );
        assert_eq!(
            parse_str("3X"),
            Err(QuantityError::UnknownSuffix("3X".to_string()))
        );
        assert_eq!(
            parse_str("1e"),
            Err(QuantityError::InvalidNumber("1e".to_string()))
        );
        assert!(matches!(
            parse_str("1e40"),
            Err(QuantityError::OutOfRange(_))
        ));
    }
}
