use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

static SIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([\d.]+)\s*([a-zA-Z]{0,3})$").expect("size pattern is valid"));

#[derive(Debug, Error, PartialEq)]
pub enum SizeParseError {
    #[error("not a size: '{0}'")]
    Format(String),
    #[error("unknown size unit '{unit}' in '{input}'")]
    Unit { input: String, unit: String },
}

/// Parses human sizes such as `500GB`, `1.5 TiB` or `1024`.
///
/// All units are binary: `KB` and `KiB` both mean 1024 bytes.
pub fn parse_size(input: &str) -> Result<u64, SizeParseError> {
    let trimmed = input.trim();
    let caps = SIZE_RE
        .captures(trimmed)
        .ok_or_else(|| SizeParseError::Format(input.to_string()))?;
    let number: f64 = caps[1]
        .parse()
        .map_err(|_| SizeParseError::Format(input.to_string()))?;
    let unit = caps[2].to_ascii_uppercase();
    let multiplier: u64 = match unit.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        "P" | "PB" | "PIB" => 1 << 50,
        _ => {
            return Err(SizeParseError::Unit {
                input: input.to_string(),
                unit: caps[2].to_string(),
            })
        }
    };
    Ok((number * multiplier as f64) as u64)
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// Byte count that deserializes from either a number or a human string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_size(self.0))
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(ByteSize(n)),
            Raw::Text(s) => parse_size(&s).map(ByteSize).map_err(serde::de::Error::custom),
        }
    }
}
