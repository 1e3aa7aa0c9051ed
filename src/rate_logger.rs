//! Append-only log of every rate change, attached like any other observer.

use crate::broadcast::Subscription;
use crate::core::rate::RateUpdate;
use crate::service::RateService;
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

pub struct RateFileLogger {
    path: PathBuf,
    file: Mutex<File>,
}

impl RateFileLogger {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open rate log: {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Opens the log at `path` and subscribes it to `service`. Logging stops
    /// when the returned subscription is dropped.
    pub fn attach<P: AsRef<Path>>(service: &RateService, path: P) -> Result<Subscription> {
        let logger = Self::open(path)?;
        info!(path = %logger.path.display(), "Logging BTC rate updates");
        Ok(service.subscribe(move |update| logger.record(update)))
    }

    fn record(&self, update: &RateUpdate) {
        info!(
            value = update.value_usd(),
            source = %update.origin,
            sequence = update.sequence,
            observed_at = %update.reading.observed_at,
            "BTC rate"
        );

        let line = format_line(update);
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(file, "{line}").and_then(|_| file.flush()) {
            warn!(path = %self.path.display(), error = %e, "Failed to write rate log");
        }
    }
}

fn format_line(update: &RateUpdate) -> String {
    format!(
        "{} BTC/USD {:.2} source={} seq={}",
        update.reading.observed_at.to_rfc3339(),
        update.value_usd(),
        update.origin,
        update.sequence
    )
}
