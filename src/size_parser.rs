//! Size string parsing.
//!
//! Single-letter suffixes (`k`, `m`, `g`, `t`) and the `KiB` family are
//! powers of two, so `1M` is 1,048,576 bytes. `KB`, `MB`, `GB`, `TB` are
//! powers of ten.

use serde::{Deserialize, Deserializer};

use crate::error::{BenchError, Result};

/// Parse a size string into bytes.
///
/// - "4096" → 4096
/// - "4K" / "4k" / "4KiB" → 4096
/// - "1M" → 1,048,576
/// - "8MB" → 8,000,000
/// - "1.5G" → 1,610,612,736
pub fn parse_size(input: &str) -> Result<u64> {
    let input = input.trim();

    if let Ok(num) = input.parse::<u64>() {
        return Ok(num);
    }

    let (number_part, suffix) = split_number_suffix(input)?;
    let value: f64 = number_part
        .parse()
        .map_err(|_| BenchError::Config(format!("invalid number in size `{input}`")))?;
    let multiplier = parse_suffix(suffix)?;
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(BenchError::Config(format!("size `{input}` is too large")));
    }
    Ok(bytes.round() as u64)
}

fn split_number_suffix(input: &str) -> Result<(&str, &str)> {
    let suffix_start = input
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| BenchError::Config(format!("invalid size `{input}`")))?;
    let number_part = &input[..suffix_start];
    if number_part.is_empty() {
        return Err(BenchError::Config(format!("no number in size `{input}`")));
    }
    Ok((number_part, input[suffix_start..].trim()))
}

fn parse_suffix(suffix: &str) -> Result<u64> {
    match suffix.to_uppercase().as_str() {
        "B" => Ok(1),
        "K" | "KI" | "KIB" => Ok(1 << 10),
        "M" | "MI" | "MIB" => Ok(1 << 20),
        "G" | "GI" | "GIB" => Ok(1 << 30),
        "T" | "TI" | "TIB" => Ok(1 << 40),
        "KB" => Ok(1_000),
        "MB" => Ok(1_000_000),
        "GB" => Ok(1_000_000_000),
        "TB" => Ok(1_000_000_000_000),
        _ => Err(BenchError::Config(format!(
            "unknown size suffix `{suffix}` (use k/m/g/t, KiB.., or KB..)"
        ))),
    }
}

/// Accepts either a bare number or a size string.
pub fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(u64),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}
