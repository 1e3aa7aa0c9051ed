pub mod broadcast;
pub mod cli;
pub mod core;
pub mod providers;
pub mod rate_logger;
pub mod scheduler;
pub mod service;
pub mod store;

pub use crate::broadcast::{ChangeBroadcaster, RateStream, Subscription, SubscriptionId};
pub use crate::core::{FetchError, RateCache, RateReading, RateSource, RateUpdate, ReadingOrigin};
pub use crate::scheduler::RefreshScheduler;
pub use crate::service::RateService;

use crate::core::config::AppConfig;
use crate::providers::CoinMarketCapSource;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info};

pub enum AppCommand {
    Watch,
    Refresh,
    ClearCache,
}

/// Wires the CoinMarketCap source, the configured cache and a broadcaster
/// into a service.
pub fn build_service(config: &AppConfig) -> Result<Arc<RateService>> {
    let source = CoinMarketCapSource::from_config(&config.source)
        .context("Failed to create rate source")?;
    let cache = store::open_cache(config)?;
    let broadcaster = ChangeBroadcaster::new(config.broadcast.delivery_timeout());
    Ok(Arc::new(RateService::new(
        Arc::new(source),
        cache,
        broadcaster,
    )))
}

pub async fn run_command(command: AppCommand, config_path: Option<&str>) -> Result<()> {
    info!("btcrate starting...");

    let config = match config_path {
        Some(path) => AppConfig::load_from_path(path)?,
        None => AppConfig::load()?,
    };
    debug!(
        base_url = %config.source.base_url,
        api_key_set = config.source.api_key.is_some(),
        interval_secs = config.schedule.interval_secs,
        "Loaded config"
    );

    match command {
        AppCommand::Watch => cli::commands::watch(&config).await,
        AppCommand::Refresh => cli::commands::refresh(&config).await,
        AppCommand::ClearCache => cli::commands::clear_cache(&config).await,
    }
}
