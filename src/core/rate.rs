//! Rate readings and the update envelope delivered to observers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// One timestamped BTC/USD price observation.
///
/// Readings are plain values: a newer price is a new `RateReading`, never an
/// edit of an old one. A `value_usd` of zero (or less) means "no rate known".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateReading {
    pub value_usd: f64,
    pub observed_at: DateTime<Utc>,
}

impl RateReading {
    pub fn new(value_usd: f64, observed_at: DateTime<Utc>) -> Self {
        Self {
            value_usd,
            observed_at,
        }
    }

    /// A reading observed right now.
    pub fn now(value_usd: f64) -> Self {
        Self::new(value_usd, Utc::now())
    }

    /// Only strictly positive, finite prices count as an obtained rate.
    pub fn is_valid(&self) -> bool {
        self.value_usd.is_finite() && self.value_usd > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadingOrigin {
    Network,
    Cache,
}

impl Display for ReadingOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ReadingOrigin::Network => "network",
                ReadingOrigin::Cache => "cache",
            }
        )
    }
}

/// What subscribers receive for every change of the authoritative rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateUpdate {
    pub reading: RateReading,
    pub origin: ReadingOrigin,
    /// Delivery number assigned by the broadcaster, starting at 1.
    pub sequence: u64,
}

impl RateUpdate {
    pub fn value_usd(&self) -> f64 {
        self.reading.value_usd
    }
}
