use crate::core::cache::{CacheError, DEFAULT_STALENESS_WINDOW, RateCache, is_fresh};
use crate::core::rate::RateReading;
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// In-process rate cache, gone with the process
pub struct MemoryRateCache {
    entry: Mutex<Option<RateReading>>,
    staleness_window: Duration,
}

impl MemoryRateCache {
    pub fn new(staleness_window: Duration) -> Self {
        Self {
            entry: Mutex::new(None),
            staleness_window,
        }
    }
}

impl Default for MemoryRateCache {
    fn default() -> Self {
        Self::new(DEFAULT_STALENESS_WINDOW)
    }
}

#[async_trait]
impl RateCache for MemoryRateCache {
    async fn store(&self, reading: &RateReading) -> Result<(), CacheError> {
        *self.entry.lock().await = Some(*reading);
        debug!(value = reading.value_usd, "Cache PUT");
        Ok(())
    }

    async fn read(&self) -> Result<Option<RateReading>, CacheError> {
        let entry = *self.entry.lock().await;
        match entry {
            Some(reading) if is_fresh(reading.observed_at, self.staleness_window, Utc::now()) => {
                debug!("Cache HIT");
                Ok(Some(reading))
            }
            Some(_) => Ok(None),
            None => {
                debug!("Cache MISS");
                Ok(None)
            }
        }
    }

    async fn clear(&self) -> Result<(), CacheError> {
        *self.entry.lock().await = None;
        debug!("Cache CLEAR");
        Ok(())
    }
}
