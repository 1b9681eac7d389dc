//! Candle records and timeframes
//!
//! Candles are what this tool tapes: one OHLCV record per timeframe
//! bucket. On the tape they travel as JSON payloads, so any consumer can
//! read them without this crate's type definitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// One OHLCV candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket start, unix milliseconds.
    pub timestamp: i64,
    /// Opening price.
    pub open: f64,
    /// Highest price.
    pub high: f64,
    /// Lowest price.
    pub low: f64,
    /// Closing price.
    pub close: f64,
    /// Traded volume.
    pub volume: f64,
}

impl Candle {
    /// Encode for appending to a tape.
    pub fn to_payload(&self) -> Result<Vec<u8>, IngestError> {
        serde_json::to_vec(self).map_err(|e| IngestError::Encode(e.to_string()))
    }

    /// Decode a tape payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self, IngestError> {
        serde_json::from_slice(payload).map_err(|e| IngestError::Decode(e.to_string()))
    }
}

/// Candle bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timeframe {
    millis: i64,
}

impl Timeframe {
    pub const fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    pub fn millis(&self) -> i64 {
        self.millis
    }

    /// Round a timestamp down to its bucket start.
    pub fn align(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms - timestamp_ms.rem_euclid(self.millis)
    }
}

impl FromStr for Timeframe {
    type Err = String;

    /// Parse values like `30s`, `5m`, `1h`, `1d`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("Missing unit in timeframe '{}'", s))?;
        let (digits, unit) = s.split_at(split);
        let value: i64 = digits
            .parse()
            .map_err(|_| format!("Invalid timeframe '{}'", s))?;
        if value <= 0 {
            return Err(format!("Timeframe '{}' must be positive", s));
        }
        let unit_ms = match unit {
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            _ => return Err(format!("Unknown timeframe unit '{}'", unit)),
        };
        Ok(Self::from_millis(value * unit_ms))
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.millis;
        if ms % 86_400_000 == 0 {
            write!(f, "{}d", ms / 86_400_000)
        } else if ms % 3_600_000 == 0 {
            write!(f, "{}h", ms / 3_600_000)
        } else if ms % 60_000 == 0 {
            write!(f, "{}m", ms / 60_000)
        } else {
            write!(f, "{}s", ms / 1_000)
        }
    }
}
