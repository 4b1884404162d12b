//! Kubernetes resource quantities
//!
//! Quantities are compared by value, so `"100m"` equals `"0.1"` and `"1Gi"`
//! equals `"1024Mi"`. Values are held as integer nano-units to keep the
//! comparison exact.

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

const NANOS_PER_UNIT: u128 = 1_000_000_000;

/// Binary and decimal suffixes, longest first so `Ki` is tried before `k`
const SUFFIXES: &[(&str, u128, u128)] = &[
    ("Ki", 1 << 10, 1),
    ("Mi", 1 << 20, 1),
    ("Gi", 1 << 30, 1),
    ("Ti", 1 << 40, 1),
    ("Pi", 1 << 50, 1),
    ("Ei", 1 << 60, 1),
    ("n", 1, 1_000_000_000),
    ("u", 1, 1_000_000),
    ("m", 1, 1_000),
    ("k", 1_000, 1),
    ("M", 1_000_000, 1),
    ("G", 1_000_000_000, 1),
    ("T", 1_000_000_000_000, 1),
    ("P", 1_000_000_000_000_000, 1),
    ("E", 1_000_000_000_000_000_000, 1),
];

/// A parsed resource quantity such as `500m` or `1Gi`
#[derive(Clone, Debug)]
pub struct Quantity {
    raw: String,
    nanos: u128,
}

impl Quantity {
    /// Value in nano-units (1 CPU core = 10^9, 1 byte = 10^9)
    pub fn as_nanos(&self) -> u128 {
        self.nanos
    }

    /// The string the quantity was parsed from
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.nanos == other.nanos
    }
}

impl Eq for Quantity {}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quantity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.nanos.cmp(&other.nanos)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Quantity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_quantity(s)
    }
}

/// Parse a quantity string (numeric value plus optional SI or binary suffix)
pub fn parse_quantity(input: &str) -> Result<Quantity> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::quantity(input, "quantity is empty"));
    }

    let (number, num, den) = SUFFIXES
        .iter()
        .find_map(|(suffix, num, den)| {
            trimmed
                .strip_suffix(suffix)
                .map(|number| (number, *num, *den))
        })
        .unwrap_or((trimmed, 1, 1));

    let number = number.strip_prefix('+').unwrap_or(number);
    let (whole, frac) = match number.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (number, ""),
    };

    if whole.is_empty() && frac.is_empty() {
        return Err(Error::quantity(input, "missing numeric value"));
    }
    if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        return Err(Error::quantity(
            input,
            "expected a non-negative decimal number with an optional suffix (e.g. '100m', '1Gi')",
        ));
    }

    let out_of_range = || Error::quantity(input, "value out of range");

    let digits = format!("{whole}{frac}");
    let mantissa: u128 = digits.parse().map_err(|_| out_of_range())?;
    let frac_scale = 10u128
        .checked_pow(u32::try_from(frac.len()).map_err(|_| out_of_range())?)
        .ok_or_else(out_of_range)?;

    let nanos = mantissa
        .checked_mul(num)
        .and_then(|v| v.checked_mul(NANOS_PER_UNIT))
        .ok_or_else(out_of_range)?
        / (den * frac_scale);

    Ok(Quantity {
        raw: trimmed.to_string(),
        nanos,
    })
}

/// Validate a CPU quantity (e.g. "100m", "1", "0.5")
///
/// Binary suffixes are rejected for CPU.
pub fn validate_cpu_quantity(qty: &str, field: &str) -> Result<()> {
    if ["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"]
        .iter()
        .any(|suffix| qty.ends_with(suffix))
    {
        return Err(Error::validation_for_field(
            field,
            format!("invalid cpu quantity '{qty}' (expected e.g., '100m', '1', '0.5')"),
        ));
    }
    parse_quantity(qty).map(|_| ()).map_err(|e| {
        Error::validation_for_field(field, format!("invalid cpu quantity: {e}"))
    })
}

/// Validate a memory quantity (e.g. "128Mi", "1Gi", "1000000")
///
/// Sub-unit suffixes are rejected for memory.
pub fn validate_memory_quantity(qty: &str, field: &str) -> Result<()> {
    if qty.ends_with('m') || qty.ends_with('u') || qty.ends_with('n') {
        return Err(Error::validation_for_field(
            field,
            format!("invalid memory quantity '{qty}' (expected e.g., '128Mi', '1Gi')"),
        ));
    }
    parse_quantity(qty).map(|_| ()).map_err(|e| {
        Error::validation_for_field(field, format!("invalid memory quantity: {e}"))
    })
}
