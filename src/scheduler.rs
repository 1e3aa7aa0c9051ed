//! Periodic refresh of the BTC rate.

use crate::service::RateService;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(180);
/// Shortest period the timer will run at.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(1);

/// Triggers `refresh_now` on a fixed interval until stopped.
///
/// The timer only holds a weak reference to the service, so it never keeps
/// a torn-down service alive.
pub struct RefreshScheduler {
    service: Weak<RateService>,
    interval: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshScheduler {
    pub fn new(service: &Arc<RateService>, interval: Duration) -> Self {
        if interval < MIN_REFRESH_INTERVAL {
            warn!(?interval, "Refresh interval too short, using the minimum");
        }
        let interval = interval.max(MIN_REFRESH_INTERVAL);
        Self {
            service: Arc::downgrade(service),
            interval,
            timer: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts ticking; the first refresh fires immediately. Restarting
    /// replaces the running timer rather than adding a second one.
    pub fn start(&self) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = timer.take() {
            debug!("Restarting BTC rate scheduler");
            previous.abort();
        }

        let service = Weak::clone(&self.service);
        let period = self.interval;
        *timer = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(service) = service.upgrade() else {
                    debug!("Rate service dropped, scheduler exiting");
                    break;
                };
                // Detached, so stopping the timer leaves an in-flight fetch alone
                tokio::spawn(async move {
                    if let Err(e) = service.refresh_now().await {
                        warn!(error = %e, "Scheduled BTC rate refresh failed");
                    }
                });
            }
        }));
        info!(interval_secs = period.as_secs_f64(), "BTC rate scheduler started");
    }

    /// Cancels the timer. Does nothing when not running.
    pub fn stop(&self) {
        let previous = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = previous {
            timer.abort();
            info!("BTC rate scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
