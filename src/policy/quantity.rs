//! Bandwidth Quantities
//!
//! Parsing and formatting of suffixed byte quantities such as `10M` or `512Ki`.

use std::fmt;
use std::str::FromStr;

use super::error::ParseError;

/// Unit suffix accepted on a bandwidth quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BandwidthSuffix {
    /// No suffix, plain bytes
    None,
    /// `B`
    Bytes,
    /// `K` / `KB` (10^3)
    Kilo,
    /// `M` / `MB` (10^6)
    Mega,
    /// `G` / `GB` (10^9)
    Giga,
    /// `Ki` / `KiB` (2^10)
    Kibi,
    /// `Mi` / `MiB` (2^20)
    Mebi,
    /// `Gi` / `GiB` (2^30)
    Gibi,
}

impl BandwidthSuffix {
    /// Every suffix, in table order
    pub const ALL: [BandwidthSuffix; 8] = [
        BandwidthSuffix::None,
        BandwidthSuffix::Bytes,
        BandwidthSuffix::Kilo,
        BandwidthSuffix::Mega,
        BandwidthSuffix::Giga,
        BandwidthSuffix::Kibi,
        BandwidthSuffix::Mebi,
        BandwidthSuffix::Gibi,
    ];

    /// Byte multiplier for this suffix
    pub const fn multiplier(self) -> i64 {
        match self {
            BandwidthSuffix::None | BandwidthSuffix::Bytes => 1,
            BandwidthSuffix::Kilo => 1_000,
            BandwidthSuffix::Mega => 1_000_000,
            BandwidthSuffix::Giga => 1_000_000_000,
            BandwidthSuffix::Kibi => 1 << 10,
            BandwidthSuffix::Mebi => 1 << 20,
            BandwidthSuffix::Gibi => 1 << 30,
        }
    }

    /// Canonical spelling
    pub const fn as_str(self) -> &'static str {
        match self {
            BandwidthSuffix::None => "",
            BandwidthSuffix::Bytes => "B",
            BandwidthSuffix::Kilo => "K",
            BandwidthSuffix::Mega => "M",
            BandwidthSuffix::Giga => "G",
            BandwidthSuffix::Kibi => "Ki",
            BandwidthSuffix::Mebi => "Mi",
            BandwidthSuffix::Gibi => "Gi",
        }
    }
}

impl FromStr for BandwidthSuffix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "" => Ok(BandwidthSuffix::None),
            "B" => Ok(BandwidthSuffix::Bytes),
            "K" | "KB" => Ok(BandwidthSuffix::Kilo),
            "M" | "MB" => Ok(BandwidthSuffix::Mega),
            "G" | "GB" => Ok(BandwidthSuffix::Giga),
            "KI" | "KIB" => Ok(BandwidthSuffix::Kibi),
            "MI" | "MIB" => Ok(BandwidthSuffix::Mebi),
            "GI" | "GIB" => Ok(BandwidthSuffix::Gibi),
            _ => Err(ParseError::UnknownSuffix(s.to_string())),
        }
    }
}

impl fmt::Display for BandwidthSuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a bandwidth quantity into bytes
///
/// Leading and trailing whitespace is ignored and an empty string is zero.
/// The numeric part is the run of leading ASCII digits; everything after it
/// must be a suffix from [`BandwidthSuffix`].
///
/// # Errors
///
/// * [`ParseError::InvalidNumber`] when there are no leading digits
/// * [`ParseError::UnknownSuffix`] when the suffix is not in the table
/// * [`ParseError::Overflow`] when the product does not fit in `i64`
pub fn parse_bandwidth(input: &str) -> Result<i64, ParseError> {
    let s = input.trim();
    if s.is_empty() {
        return Ok(0);
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    if digits.is_empty() {
        return Err(ParseError::InvalidNumber(s.to_string()));
    }

    let value: i64 = digits.parse().map_err(|_| {
        // all-digit input can only fail on range
        ParseError::Overflow(s.to_string())
    })?;
    let suffix: BandwidthSuffix = suffix.parse()?;

    value
        .checked_mul(suffix.multiplier())
        .ok_or_else(|| ParseError::Overflow(s.to_string()))
}

/// Format a byte count with the given suffix
///
/// The value is divided by the suffix multiplier, so `format_bandwidth(10_000_000,
/// BandwidthSuffix::Mega)` is `"10M"`. Values that do not divide evenly fall back
/// to plain bytes so the result always parses back to the same count.
pub fn format_bandwidth(bytes: i64, suffix: BandwidthSuffix) -> String {
    let multiplier = suffix.multiplier();
    if bytes % multiplier == 0 {
        format!("{}{}", bytes / multiplier, suffix)
    } else {
        bytes.to_string()
    }
}

/// Human-readable rendering picking the largest binary or decimal suffix that
/// divides the value exactly
pub fn humanize_bandwidth(bytes: i64) -> String {
    const PREFERRED: [BandwidthSuffix; 6] = [
        BandwidthSuffix::Gibi,
        BandwidthSuffix::Giga,
        BandwidthSuffix::Mebi,
        BandwidthSuffix::Mega,
        BandwidthSuffix::Kibi,
        BandwidthSuffix::Kilo,
    ];

    if bytes == 0 {
        return "0".to_string();
    }
    PREFERRED
        .iter()
        .find(|s| bytes % s.multiplier() == 0)
        .map(|s| format_bandwidth(bytes, *s))
        .unwrap_or_else(|| bytes.to_string())
}
