//! The authoritative BTC/USD rate.
//!
//! `RateService` decides which reading is current: a fresh network result
//! wins, the cache is consulted only while nothing is known yet, and every
//! change is pushed through the broadcaster. All state changes happen inside
//! one short critical section, so concurrent refreshes are ordered by the
//! ticket each one takes when it starts. A result whose ticket is older than
//! the last applied one is discarded instead of overwriting a newer rate.

use crate::broadcast::{ChangeBroadcaster, RateStream, Subscription};
use crate::core::cache::RateCache;
use crate::core::rate::{RateReading, RateUpdate, ReadingOrigin};
use crate::core::source::{FetchError, RateSource};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct RateState {
    current: Option<RateReading>,
    origin: Option<ReadingOrigin>,
    in_flight: usize,
    last_error: Option<String>,
    /// Ticket of the newest network result applied so far.
    applied_ticket: u64,
}

pub struct RateService {
    source: Arc<dyn RateSource>,
    cache: Arc<dyn RateCache>,
    broadcaster: ChangeBroadcaster,
    state: Mutex<RateState>,
    next_ticket: AtomicU64,
    // Serializes cache writes so an older write cannot land after a newer one
    cache_writes: tokio::sync::Mutex<()>,
}

/// Keeps the in-flight count honest even if a refresh future is dropped.
struct InFlight<'a> {
    state: &'a Mutex<RateState>,
}

impl<'a> InFlight<'a> {
    fn begin(state: &'a Mutex<RateState>) -> Self {
        let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
        guard.in_flight += 1;
        guard.last_error = None;
        drop(guard);
        Self { state }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        guard.in_flight = guard.in_flight.saturating_sub(1);
    }
}

impl RateService {
    pub fn new(
        source: Arc<dyn RateSource>,
        cache: Arc<dyn RateCache>,
        broadcaster: ChangeBroadcaster,
    ) -> Self {
        Self {
            source,
            cache,
            broadcaster,
            state: Mutex::new(RateState::default()),
            next_ticket: AtomicU64::new(1),
            cache_writes: tokio::sync::Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, RateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last authoritative price, or 0.0 while nothing is known.
    pub fn current_rate(&self) -> f64 {
        self.state().current.map_or(0.0, |r| r.value_usd)
    }

    pub fn current_reading(&self) -> Option<RateReading> {
        self.state().current
    }

    pub fn current_origin(&self) -> Option<ReadingOrigin> {
        self.state().origin
    }

    pub fn is_loading(&self) -> bool {
        self.state().in_flight > 0
    }

    /// Message of the most recent failed fetch, cleared when a fetch starts.
    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&RateUpdate) + Send + Sync + 'static,
    {
        self.broadcaster.subscribe(handler)
    }

    pub fn changes(&self) -> RateStream {
        self.broadcaster.changes()
    }

    /// Adopts a fresh cached reading if no rate is known yet.
    pub async fn warm_from_cache(&self) -> Option<RateReading> {
        if self.state().current.is_some() {
            return None;
        }
        let cached = self.cache.load().await?;
        if self.apply_cached(cached) {
            Some(cached)
        } else {
            None
        }
    }

    /// Runs one fetch cycle.
    ///
    /// Resolves with the network reading on success, or with the cached
    /// reading when the fetch failed while no rate was known and the cache
    /// had a fresh one. Any other failure is returned as is.
    pub async fn refresh_now(&self) -> Result<RateReading, FetchError> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::begin(&self.state);
        debug!(ticket, "Fetching BTC rate");

        match self.source.fetch().await {
            Ok(reading) if reading.is_valid() => {
                if self.apply_network(ticket, reading) {
                    self.write_through(ticket, reading).await;
                }
                Ok(reading)
            }
            Ok(reading) => {
                let err =
                    FetchError::MalformedResponse(format!("unusable price: {}", reading.value_usd));
                self.fall_back(ticket, err).await
            }
            Err(err) => self.fall_back(ticket, err).await,
        }
    }

    fn apply_network(&self, ticket: u64, reading: RateReading) -> bool {
        let mut state = self.state();
        if ticket < state.applied_ticket {
            debug!(
                ticket,
                applied = state.applied_ticket,
                "Discarding result of an older fetch"
            );
            return false;
        }
        state.applied_ticket = ticket;
        state.current = Some(reading);
        state.origin = Some(ReadingOrigin::Network);
        // Published under the lock so broadcast order matches apply order
        self.broadcaster.publish(reading, ReadingOrigin::Network);
        info!(value = reading.value_usd, "BTC rate updated from network");
        true
    }

    // Cache readings only fill a gap; they never replace a known rate.
    fn apply_cached(&self, reading: RateReading) -> bool {
        let mut state = self.state();
        if state.current.is_some() {
            debug!("Cached rate superseded before it could be applied");
            return false;
        }
        state.current = Some(reading);
        state.origin = Some(ReadingOrigin::Cache);
        self.broadcaster.publish(reading, ReadingOrigin::Cache);
        info!(
            value = reading.value_usd,
            observed_at = %reading.observed_at,
            "BTC rate restored from cache"
        );
        true
    }

    async fn fall_back(&self, ticket: u64, err: FetchError) -> Result<RateReading, FetchError> {
        warn!(ticket, error = %err, "BTC rate fetch failed");
        let known = {
            let mut state = self.state();
            // A newer success outranks an older failure
            if ticket > state.applied_ticket {
                state.last_error = Some(err.to_string());
            }
            state.current.is_some()
        };
        if known {
            return Err(err);
        }

        match self.cache.load().await {
            Some(cached) if self.apply_cached(cached) => Ok(cached),
            Some(_) => Err(err),
            None => {
                debug!("No usable cached rate to fall back on");
                Err(err)
            }
        }
    }

    async fn write_through(&self, ticket: u64, reading: RateReading) {
        let _writer = self.cache_writes.lock().await;
        if self.state().applied_ticket != ticket {
            debug!(ticket, "Skipping cache write for superseded rate");
            return;
        }
        if let Err(e) = self.cache.store(&reading).await {
            warn!(error = %e, "Failed to persist BTC rate");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::CacheError;
    use crate::store::MemoryRateCache;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};
    use tokio::sync::Notify;

    enum Scripted {
        Price(f64),
        Fail,
    }

    struct MockSource {
        script: Mutex<VecDeque<Scripted>>,
        calls: AtomicUsize,
    }

    impl MockSource {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Self::new(vec![])
        }
    }

    #[async_trait]
    impl RateSource for MockSource {
        async fn fetch(&self) -> Result<RateReading, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop_front() {
                Some(Scripted::Price(value)) => Ok(RateReading::now(value)),
                Some(Scripted::Fail) | None => Err(FetchError::BadStatus(503)),
            }
        }
    }

    /// Returns its price only once released, so tests can order completions.
    struct GatedSource {
        price: f64,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl RateSource for GatedSource {
        async fn fetch(&self) -> Result<RateReading, FetchError> {
            self.gate.notified().await;
            Ok(RateReading::now(self.price))
        }
    }

    /// Hands each call to the next source in line.
    struct Relay {
        sources: Mutex<VecDeque<Arc<dyn RateSource>>>,
    }

    #[async_trait]
    impl RateSource for Relay {
        async fn fetch(&self) -> Result<RateReading, FetchError> {
            let next = self.sources.lock().unwrap().pop_front();
            match next {
                Some(source) => source.fetch().await,
                None => Err(FetchError::BadStatus(500)),
            }
        }
    }

    struct BrokenCache;

    #[async_trait]
    impl RateCache for BrokenCache {
        async fn store(&self, _reading: &RateReading) -> Result<(), CacheError> {
            Err(CacheError::WriteFailed(std::io::Error::other("disk full")))
        }

        async fn read(&self) -> Result<Option<RateReading>, CacheError> {
            Err(CacheError::ReadFailed("unreadable".to_string()))
        }

        async fn clear(&self) -> Result<(), CacheError> {
            Ok(())
        }
    }

    fn build_service(source: Arc<dyn RateSource>, cache: Arc<dyn RateCache>) -> RateService {
        RateService::new(source, cache, ChangeBroadcaster::default())
    }

    fn record(service: &RateService) -> (Subscription, Arc<Mutex<Vec<RateUpdate>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let subscription = service.subscribe(move |u| sink.lock().unwrap().push(*u));
        (subscription, log)
    }

    async fn wait_for(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_successful_refresh_updates_rate_cache_and_subscribers() {
        let cache = Arc::new(MemoryRateCache::default());
        let service = build_service(MockSource::new(vec![Scripted::Price(45000.0)]), cache.clone());
        let (_sub, log) = record(&service);

        assert_eq!(service.current_rate(), 0.0);
        let reading = service.refresh_now().await.unwrap();

        assert_eq!(reading.value_usd, 45000.0);
        assert_eq!(service.current_rate(), 45000.0);
        assert_eq!(service.current_origin(), Some(ReadingOrigin::Network));
        assert_eq!(cache.load().await.map(|r| r.value_usd), Some(45000.0));
        assert!(!service.is_loading());
        assert!(service.last_error().is_none());

        assert!(wait_for(Duration::from_secs(2), || log.lock().unwrap().len() == 1).await);
        let last = *log.lock().unwrap().last().unwrap();
        assert_eq!(last.value_usd(), 45000.0);
        assert_eq!(last.origin, ReadingOrigin::Network);
    }

    #[tokio::test]
    async fn test_failed_refresh_falls_back_to_fresh_cache() {
        let cache = Arc::new(MemoryRateCache::default());
        let cached = RateReading::new(40000.0, Utc::now() - chrono::Duration::minutes(10));
        cache.store(&cached).await.unwrap();

        let service = build_service(MockSource::failing(), cache);
        let (_sub, log) = record(&service);

        let result = service.refresh_now().await.unwrap();
        assert_eq!(result, cached);
        assert_eq!(service.current_rate(), 40000.0);
        assert_eq!(service.current_origin(), Some(ReadingOrigin::Cache));
        assert_eq!(
            service.last_error().as_deref(),
            Some("HTTP error: unexpected status 503")
        );

        assert!(wait_for(Duration::from_secs(2), || log.lock().unwrap().len() == 1).await);
        assert_eq!(log.lock().unwrap()[0].origin, ReadingOrigin::Cache);
    }

    #[tokio::test]
    async fn test_failed_refresh_with_stale_cache_keeps_rate_unknown() {
        let cache = Arc::new(MemoryRateCache::default());
        cache
            .store(&RateReading::new(40000.0, Utc::now() - chrono::Duration::hours(2)))
            .await
            .unwrap();

        let service = build_service(MockSource::failing(), cache);
        let (_sub, log) = record(&service);

        assert!(service.refresh_now().await.is_err());
        assert_eq!(service.current_rate(), 0.0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_refresh_with_empty_cache() {
        let service = build_service(MockSource::failing(), Arc::new(MemoryRateCache::default()));
        let (_sub, log) = record(&service);

        let result = service.refresh_now().await;
        assert!(matches!(result, Err(FetchError::BadStatus(503))));
        assert_eq!(service.current_rate(), 0.0);
        assert!(service.last_error().is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_after_success_keeps_network_rate() {
        let cache = Arc::new(MemoryRateCache::default());
        let service = build_service(
            MockSource::new(vec![Scripted::Price(45000.0), Scripted::Fail]),
            cache.clone(),
        );

        service.refresh_now().await.unwrap();
        cache.store(&RateReading::now(1.0)).await.unwrap();

        assert!(service.refresh_now().await.is_err());
        assert_eq!(service.current_rate(), 45000.0);
        assert_eq!(service.current_origin(), Some(ReadingOrigin::Network));
    }

    #[tokio::test]
    async fn test_error_is_cleared_by_next_fetch() {
        let service = build_service(
            MockSource::new(vec![Scripted::Fail, Scripted::Price(100.0)]),
            Arc::new(MemoryRateCache::default()),
        );

        assert!(service.refresh_now().await.is_err());
        assert!(service.last_error().is_some());
        service.refresh_now().await.unwrap();
        assert!(service.last_error().is_none());
    }

    #[tokio::test]
    async fn test_cache_failures_are_not_fatal() {
        let service = build_service(
            MockSource::new(vec![Scripted::Price(45000.0)]),
            Arc::new(BrokenCache),
        );
        assert_eq!(service.refresh_now().await.unwrap().value_usd, 45000.0);
        assert_eq!(service.current_rate(), 45000.0);

        let service = build_service(MockSource::failing(), Arc::new(BrokenCache));
        assert!(service.refresh_now().await.is_err());
        assert_eq!(service.current_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_warm_from_cache() {
        let cache = Arc::new(MemoryRateCache::default());
        cache.store(&RateReading::now(39000.0)).await.unwrap();
        let source = MockSource::failing();
        let service = build_service(source.clone(), cache);
        let (_sub, log) = record(&service);

        assert_eq!(
            service.warm_from_cache().await.map(|r| r.value_usd),
            Some(39000.0)
        );
        assert_eq!(service.current_rate(), 39000.0);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert!(wait_for(Duration::from_secs(2), || log.lock().unwrap().len() == 1).await);

        // A known rate is never replaced from cache
        assert!(service.warm_from_cache().await.is_none());
    }

    #[tokio::test]
    async fn test_older_fetch_completing_last_is_discarded() {
        let first_gate = Arc::new(Notify::new());
        let second_gate = Arc::new(Notify::new());
        let relay = Arc::new(Relay {
            sources: Mutex::new(VecDeque::from(vec![
                Arc::new(GatedSource {
                    price: 100.0,
                    gate: first_gate.clone(),
                }) as Arc<dyn RateSource>,
                Arc::new(GatedSource {
                    price: 200.0,
                    gate: second_gate.clone(),
                }),
            ])),
        });
        let cache = Arc::new(MemoryRateCache::default());
        let service = Arc::new(build_service(relay, cache.clone()));
        let (_sub, log) = record(&service);

        let older = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.refresh_now().await }
        });
        assert!(wait_for(Duration::from_secs(2), || service.is_loading()).await);
        let newer = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.refresh_now().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        second_gate.notify_one();
        assert_eq!(newer.await.unwrap().unwrap().value_usd, 200.0);
        assert!(service.is_loading());

        first_gate.notify_one();
        // The caller still gets its own reading back
        assert_eq!(older.await.unwrap().unwrap().value_usd, 100.0);

        assert!(!service.is_loading());
        assert_eq!(service.current_rate(), 200.0);
        assert_eq!(cache.load().await.map(|r| r.value_usd), Some(200.0));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let delivered: Vec<f64> = log.lock().unwrap().iter().map(|u| u.value_usd()).collect();
        assert_eq!(delivered, vec![200.0]);
    }

    #[tokio::test]
    async fn test_unusable_source_price_is_treated_as_failure() {
        let service = build_service(
            MockSource::new(vec![Scripted::Price(0.0)]),
            Arc::new(MemoryRateCache::default()),
        );
        let result = service.refresh_now().await;
        assert!(matches!(result, Err(FetchError::MalformedResponse(_))));
        assert_eq!(service.current_rate(), 0.0);
    }
}
