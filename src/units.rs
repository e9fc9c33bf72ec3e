//! Parsing of the endpoint's human readable measurements
//!
//! Rates look like `"94.2 Mbps"`, `"512kbps"` or `"1.2 Gbps"`, latencies like
//! `"35 ms"`, traffic volumes like `"19.6 GB"` or `"734,2 MB"`. Parsing is
//! case-insensitive and ignores whitespace.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static RATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]+(?:\.[0-9]+)?)(k|m|g)?bps$").expect("rate pattern is a valid regex")
});

static LATENCY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]+(?:\.[0-9]+)?)ms$").expect("latency pattern is a valid regex")
});

static BYTES_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]+)(?:[.,]([0-9]{1,9}))?([kmgtp]?b)?$").expect("bytes pattern is a valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitParseError {
    #[error("missing value")]
    Missing,

    #[error("unrecognized rate `{0}`, expected a number followed by bps, kbps, mbps or gbps")]
    Rate(String),

    #[error("unrecognized latency `{0}`, expected a number followed by ms")]
    Latency(String),

    #[error("unrecognized volume `{0}`, expected a number optionally followed by B, KB, MB, GB, TB or PB")]
    Bytes(String),
}

fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

/// Parse a rate into megabits per second.
///
/// A missing prefix is read as mega, `k` divides by 1000, `g` multiplies by 1000.
pub fn parse_rate_mbps(raw: &str) -> Result<f64, UnitParseError> {
    let text = normalize(raw);
    if text.is_empty() {
        return Err(UnitParseError::Missing);
    }

    let captures = RATE_PATTERN
        .captures(&text)
        .ok_or_else(|| UnitParseError::Rate(raw.to_string()))?;
    let number: f64 = captures[1]
        .parse()
        .map_err(|_| UnitParseError::Rate(raw.to_string()))?;

    Ok(match captures.get(2).map(|m| m.as_str()) {
        Some("k") => number / 1000.0,
        Some("g") => number * 1000.0,
        _ => number,
    })
}

/// Parse a latency into milliseconds
pub fn parse_latency_ms(raw: &str) -> Result<f64, UnitParseError> {
    let text = normalize(raw);
    if text.is_empty() {
        return Err(UnitParseError::Missing);
    }

    let captures = LATENCY_PATTERN
        .captures(&text)
        .ok_or_else(|| UnitParseError::Latency(raw.to_string()))?;
    captures[1]
        .parse()
        .map_err(|_| UnitParseError::Latency(raw.to_string()))
}

/// Parse a traffic volume into bytes.
///
/// Units are decimal (`1 KB` = 1000 bytes), a bare number is bytes and a
/// decimal comma is accepted. Fractional bytes are truncated.
pub fn parse_bytes(raw: &str) -> Result<u64, UnitParseError> {
    let text = normalize(raw);
    if text.is_empty() {
        return Err(UnitParseError::Missing);
    }
    let invalid = || UnitParseError::Bytes(raw.to_string());

    let captures = BYTES_PATTERN.captures(&text).ok_or_else(invalid)?;
    let multiplier: u128 = match captures.get(3).map_or("b", |m| m.as_str()) {
        "b" => 1,
        "kb" => 1_000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        "tb" => 1_000_000_000_000,
        _ => 1_000_000_000_000_000,
    };

    let whole: u128 = captures[1].parse().map_err(|_| invalid())?;
    let (fraction, scale) = match captures.get(2) {
        Some(digits) => (
            digits.as_str().parse::<u128>().map_err(|_| invalid())?,
            10u128.pow(digits.len() as u32),
        ),
        None => (0, 1),
    };

    whole
        .checked_mul(multiplier)
        .and_then(|bytes| bytes.checked_add(fraction * multiplier / scale))
        .and_then(|bytes| u64::try_from(bytes).ok())
        .ok_or_else(invalid)
}

/// Textual form of a speedtest field; numbers are rendered, `null` is missing.
pub fn field_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
