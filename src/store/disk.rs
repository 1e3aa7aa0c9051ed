use crate::core::cache::{CacheError, RateCache, is_fresh};
use crate::core::rate::RateReading;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// On-disk form of the last good reading.
#[derive(Serialize, Deserialize)]
struct CacheEntry {
    rate: f64,
    timestamp: DateTime<Utc>,
}

/// Keeps the last good reading as a small JSON document.
pub struct DiskRateCache {
    path: PathBuf,
    staleness_window: Duration,
}

impl DiskRateCache {
    pub fn new<P: AsRef<Path>>(path: P, staleness_window: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            staleness_window,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl RateCache for DiskRateCache {
    async fn store(&self, reading: &RateReading) -> Result<(), CacheError> {
        let entry = CacheEntry {
            rate: reading.value_usd,
            timestamp: reading.observed_at,
        };
        let bytes = serde_json::to_vec(&entry)
            .map_err(|e| CacheError::WriteFailed(std::io::Error::other(e)))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(CacheError::WriteFailed)?;
        }

        // Write aside and rename so a crash never leaves half a document
        let temp_path = self.temp_path();
        tokio::fs::write(&temp_path, bytes)
            .await
            .map_err(CacheError::WriteFailed)?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(CacheError::WriteFailed)?;

        debug!(path = %self.path.display(), value = reading.value_usd, "Cache PUT");
        Ok(())
    }

    async fn read(&self) -> Result<Option<RateReading>, CacheError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Cache MISS");
                return Ok(None);
            }
            Err(e) => return Err(CacheError::ReadFailed(e.to_string())),
        };

        let entry: CacheEntry = serde_json::from_slice(&bytes).map_err(|e| {
            CacheError::ReadFailed(format!(
                "could not decode {}: {e}",
                self.path.display()
            ))
        })?;

        let reading = RateReading::new(entry.rate, entry.timestamp);
        if !reading.is_valid() {
            debug!(value = entry.rate, "Cached rate is not a usable price");
            return Ok(None);
        }
        if !is_fresh(reading.observed_at, self.staleness_window, Utc::now()) {
            return Ok(None);
        }

        debug!(path = %self.path.display(), "Cache HIT");
        Ok(Some(reading))
    }

    async fn clear(&self) -> Result<(), CacheError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::WriteFailed(e)),
        }
        debug!(path = %self.path.display(), "Cache CLEAR");
        Ok(())
    }
}
