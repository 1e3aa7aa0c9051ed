pub mod disk;
pub mod memory;

use crate::core::cache::RateCache;
use crate::core::config::AppConfig;
use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

pub use disk::DiskRateCache;
pub use memory::MemoryRateCache;

/// Builds the cache backend the configuration asks for.
pub fn open_cache(config: &AppConfig) -> Result<Arc<dyn RateCache>> {
    let window = config.cache.staleness_window();
    if config.cache.persist {
        let path = config.cache_file_path()?;
        debug!(path = %path.display(), "Using disk rate cache");
        Ok(Arc::new(DiskRateCache::new(path, window)))
    } else {
        debug!("Using in-memory rate cache");
        Ok(Arc::new(MemoryRateCache::new(window)))
    }
}
