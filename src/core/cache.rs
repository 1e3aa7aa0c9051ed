//! Durable last-known-good rate

use crate::core::rate::RateReading;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// How long a cached reading stays usable as a fallback.
pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache write failed: {0}")]
    WriteFailed(#[source] std::io::Error),

    #[error("Cache read failed: {0}")]
    ReadFailed(String),
}

#[async_trait]
pub trait RateCache: Send + Sync {
    /// Overwrites whatever entry was stored before.
    async fn store(&self, reading: &RateReading) -> Result<(), CacheError>;

    /// Reads the entry, returning `Ok(None)` when absent or stale.
    async fn read(&self) -> Result<Option<RateReading>, CacheError>;

    /// Removes the entry. Clearing an empty cache is not an error.
    async fn clear(&self) -> Result<(), CacheError>;

    /// `read` with failures logged and treated as "no cache".
    async fn load(&self) -> Option<RateReading> {
        match self.read().await {
            Ok(reading) => reading,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable rate cache");
                None
            }
        }
    }
}

/// Staleness is judged when reading, so entries expire without any eviction.
pub(crate) fn is_fresh(observed_at: DateTime<Utc>, window: Duration, now: DateTime<Utc>) -> bool {
    // Future timestamps (clock skew) count as fresh.
    let age = match (now - observed_at).to_std() {
        Ok(age) => age,
        Err(_) => return true,
    };
    if age >= window {
        debug!(?age, ?window, "Cached rate is stale");
        return false;
    }
    true
}
