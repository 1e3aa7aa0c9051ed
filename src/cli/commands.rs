use crate::core::config::AppConfig;
use crate::core::rate::{RateUpdate, ReadingOrigin};
use crate::rate_logger::RateFileLogger;
use crate::scheduler::RefreshScheduler;
use crate::{build_service, store};
use anyhow::{Context, Result};
use futures::StreamExt;
use tracing::{info, warn};

fn describe(update: &RateUpdate) -> String {
    let note = match update.origin {
        ReadingOrigin::Network => "",
        ReadingOrigin::Cache => " (cached)",
    };
    format!(
        "BTC/USD {:.2}{} as of {}",
        update.value_usd(),
        note,
        update.reading.observed_at.format("%Y-%m-%d %H:%M:%S UTC")
    )
}

/// Keeps the rate fresh on a schedule and prints every change until Ctrl-C.
pub async fn watch(config: &AppConfig) -> Result<()> {
    let service = build_service(config)?;
    let mut changes = service.changes();

    let log_path = config.log_file_path()?;
    let _logging = match RateFileLogger::attach(&service, &log_path) {
        Ok(subscription) => Some(subscription),
        Err(e) => {
            warn!(error = %e, "Rate log disabled");
            None
        }
    };

    service.warm_from_cache().await;

    let scheduler = RefreshScheduler::new(&service, config.schedule.interval());
    scheduler.start();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            update = changes.next() => match update {
                Some(update) => println!("{}", describe(&update)),
                None => break,
            },
            result = &mut shutdown => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Shutting down");
                break;
            }
        }
    }

    scheduler.stop();
    Ok(())
}

/// Fetches once and prints the authoritative rate.
pub async fn refresh(config: &AppConfig) -> Result<()> {
    let service = build_service(config)?;
    service.warm_from_cache().await;

    match service.refresh_now().await {
        Ok(_) => {}
        Err(e) if service.current_rate() > 0.0 => {
            warn!(error = %e, "Refresh failed, showing last known rate");
        }
        Err(e) => anyhow::bail!("No BTC rate available: {e}"),
    }

    let reading = service
        .current_reading()
        .context("No BTC rate available")?;
    let update = RateUpdate {
        reading,
        origin: service.current_origin().unwrap_or(ReadingOrigin::Network),
        sequence: 0,
    };
    println!("{}", describe(&update));
    Ok(())
}

pub async fn clear_cache(config: &AppConfig) -> Result<()> {
    let cache = store::open_cache(config)?;
    cache.clear().await.context("Failed to clear rate cache")?;
    info!("Rate cache cleared");
    Ok(())
}
