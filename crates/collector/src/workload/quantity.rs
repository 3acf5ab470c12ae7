//! Kubernetes resource quantity parsing.
//!
//! Quantities are held as exact fractions so that truncation matches the
//! declared value, e.g. `0.29` cores is 290 millicores and not 289.

use crate::{Error, Result};

const BYTES_PER_MIB: i128 = 1 << 20;
const MAX_DIGITS: usize = 30;
const MAX_EXPONENT: i32 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scale {
    Decimal(i32),
    Binary(u32),
}

/// A non-negative quantity equal to `numer / denom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Amount {
    numer: i128,
    denom: i128,
}

impl Amount {
    fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::Quantity(format!("'{}': {}", raw, reason));

        let trimmed = raw.trim();
        if trimmed.starts_with('-') {
            return Err(invalid("negative quantities are not allowed"));
        }
        let s = trimmed.strip_prefix('+').unwrap_or(trimmed);

        let number_end = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(number_end);

        let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
        if frac_part.contains('.') {
            return Err(invalid("more than one decimal point"));
        }
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid("missing numeric value"));
        }
        if int_part.len() + frac_part.len() > MAX_DIGITS {
            return Err(invalid("too many digits"));
        }

        let numer: i128 = format!("{}{}", int_part, frac_part)
            .parse()
            .map_err(|_| invalid("not a number"))?;
        let denom = 10i128.pow(frac_part.len() as u32);

        let scale = suffix_scale(suffix).ok_or_else(|| invalid("unknown suffix"))?;
        Amount { numer, denom }
            .apply(scale)
            .ok_or_else(|| invalid("value out of range"))
    }

    fn apply(self, scale: Scale) -> Option<Self> {
        match scale {
            Scale::Decimal(exp) if exp >= 0 => Some(Amount {
                numer: self.numer.checked_mul(10i128.checked_pow(exp as u32)?)?,
                denom: self.denom,
            }),
            Scale::Decimal(exp) => Some(Amount {
                numer: self.numer,
                denom: self.denom.checked_mul(10i128.checked_pow(exp.unsigned_abs())?)?,
            }),
            Scale::Binary(bits) => Some(Amount {
                numer: self.numer.checked_mul(1i128 << bits)?,
                denom: self.denom,
            }),
        }
    }

    /// `trunc(self * factor / divisor)` as an `i64`.
    fn truncate(self, factor: i128, divisor: i128) -> Option<i64> {
        let numer = self.numer.checked_mul(factor)?;
        let denom = self.denom.checked_mul(divisor)?;
        i64::try_from(numer / denom).ok()
    }
}

fn suffix_scale(suffix: &str) -> Option<Scale> {
    let scale = match suffix {
        "" => Scale::Decimal(0),
        "n" => Scale::Decimal(-9),
        "u" => Scale::Decimal(-6),
        "m" => Scale::Decimal(-3),
        "k" => Scale::Decimal(3),
        "M" => Scale::Decimal(6),
        "G" => Scale::Decimal(9),
        "T" => Scale::Decimal(12),
        "P" => Scale::Decimal(15),
        "E" => Scale::Decimal(18),
        "Ki" => Scale::Binary(10),
        "Mi" => Scale::Binary(20),
        "Gi" => Scale::Binary(30),
        "Ti" => Scale::Binary(40),
        "Pi" => Scale::Binary(50),
        "Ei" => Scale::Binary(60),
        other => {
            let exp: i32 = other
                .strip_prefix('e')
                .or_else(|| other.strip_prefix('E'))?
                .parse()
                .ok()?;
            if exp.abs() > MAX_EXPONENT {
                return None;
            }
            Scale::Decimal(exp)
        }
    };
    Some(scale)
}

/// Parses a CPU quantity into millicores, truncating any sub-millicore remainder.
pub fn parse_cpu_millicores(raw: &str) -> Result<i64> {
    Amount::parse(raw)?
        .truncate(1000, 1)
        .ok_or_else(|| Error::Quantity(format!("'{}': value out of range", raw)))
}

/// Parses a memory quantity into whole MiB (bytes / 2^20, truncated).
pub fn parse_memory_mib(raw: &str) -> Result<i64> {
    Amount::parse(raw)?
        .truncate(1, BYTES_PER_MIB)
        .ok_or_else(|| Error::Quantity(format!("'{}': value out of range", raw)))
}
