//! Cached crossing directory
//!
//! Owns the only copy of the crossing records. Refreshes are single-flight:
//! callers that arrive while a fetch is outstanding wait for it and share its
//! result instead of issuing their own request. Failures keep the previous
//! records (marked stale) and open a suspension window during which no
//! network call is made:
//! - 429 with a retry-after: suspend for exactly that long (at most a day)
//! - 429 without one, transport or decode failure: exponential backoff
//!   `min(base * 2^(n-1), cap)` for the n-th consecutive failure

use crate::domain::types::{CrossingRecord, DirectorySnapshot};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::crossing_api::{CrossingService, FetchError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Refresh did not produce fresh data; `fallback` is what callers should use
#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub error: FetchError,
    pub fallback: Arc<DirectorySnapshot>,
}

struct DirectoryState {
    snapshot: Arc<DirectorySnapshot>,
    /// Monotonic time of the last successful fetch
    fetched_at: Option<Instant>,
    suspended_until: Option<Instant>,
    consecutive_failures: u32,
    last_error: Option<FetchError>,
}

/// Delay before the next attempt after `failures` consecutive failures
pub fn backoff_delay(failures: u32, base: Duration, cap: Duration) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(cap, |d| d.min(cap))
}

#[cold]
fn log_fetch_failed(error: &FetchError, failures: u32, retry_in: Duration, cached: usize) {
    warn!(
        kind = error.kind(),
        error = %error,
        consecutive_failures = failures,
        retry_in_ms = retry_in.as_millis() as u64,
        cached = cached,
        "directory_fetch_failed"
    );
}

pub struct CrossingDirectory {
    service: Arc<dyn CrossingService>,
    state: parking_lot::Mutex<DirectoryState>,
    /// Held for the duration of a network fetch
    flight: tokio::sync::Mutex<()>,
    /// Completed fetch attempts; lets waiters detect that they were joined
    generation: AtomicU64,
    backoff_base: Duration,
    backoff_cap: Duration,
    metrics: Arc<Metrics>,
}

impl CrossingDirectory {
    pub fn new(service: Arc<dyn CrossingService>, config: &Config, metrics: Arc<Metrics>) -> Self {
        Self {
            service,
            state: parking_lot::Mutex::new(DirectoryState {
                snapshot: Arc::new(DirectorySnapshot::empty_stale()),
                fetched_at: None,
                suspended_until: None,
                consecutive_failures: 0,
                last_error: None,
            }),
            flight: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            backoff_base: config.backoff_base(),
            backoff_cap: config.backoff_cap(),
            metrics,
        }
    }

    /// Current snapshot without touching the network
    pub fn snapshot(&self) -> Arc<DirectorySnapshot> {
        self.state.lock().snapshot.clone()
    }

    /// Remaining time before another fetch is allowed, if suspended
    pub fn suspended_for(&self) -> Option<Duration> {
        let state = self.state.lock();
        state
            .suspended_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }

    /// Reuse the cached snapshot if it is fresh and younger than `max_age`
    pub async fn current_or_refresh(
        &self,
        max_age: Duration,
    ) -> Result<Arc<DirectorySnapshot>, FetchFailure> {
        {
            let state = self.state.lock();
            if state.snapshot.is_fresh()
                && state.fetched_at.is_some_and(|at| at.elapsed() < max_age)
            {
                return Ok(state.snapshot.clone());
            }
        }
        self.refresh().await
    }

    /// Fetch the directory, joining any fetch already in flight
    pub async fn refresh(&self) -> Result<Arc<DirectorySnapshot>, FetchFailure> {
        let observed = self.generation.load(Ordering::Acquire);
        let _flight = self.flight.lock().await;

        if self.generation.load(Ordering::Acquire) != observed {
            debug!("directory_refresh_joined");
            return self.last_result();
        }

        if let Some(failure) = self.check_suspended() {
            return Err(failure);
        }

        self.metrics.record_fetch();
        let result = self.service.fetch_crossings().await;
        let outcome = match result {
            Ok(records) => Ok(self.apply_success(records)),
            Err(error) => Err(self.apply_failure(error)),
        };
        self.generation.fetch_add(1, Ordering::Release);
        outcome
    }

    fn last_result(&self) -> Result<Arc<DirectorySnapshot>, FetchFailure> {
        let state = self.state.lock();
        match &state.last_error {
            Some(error) => {
                Err(FetchFailure { error: error.clone(), fallback: state.snapshot.clone() })
            }
            None => Ok(state.snapshot.clone()),
        }
    }

    fn check_suspended(&self) -> Option<FetchFailure> {
        let state = self.state.lock();
        let until = state.suspended_until?;
        if Instant::now() >= until {
            return None;
        }
        self.metrics.record_fetch_suspended();
        debug!(
            remaining_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
            "directory_refresh_suspended"
        );
        let error = state
            .last_error
            .clone()
            .unwrap_or_else(|| FetchError::Transient("fetch suspended".to_string()));
        Some(FetchFailure { error, fallback: state.snapshot.clone() })
    }

    fn apply_success(&self, records: Vec<CrossingRecord>) -> Arc<DirectorySnapshot> {
        let snapshot = Arc::new(DirectorySnapshot::fresh(records));
        let mut state = self.state.lock();
        state.snapshot = snapshot.clone();
        state.fetched_at = Some(Instant::now());
        state.suspended_until = None;
        state.consecutive_failures = 0;
        state.last_error = None;
        drop(state);

        self.metrics.set_directory_size(snapshot.len());
        info!(count = snapshot.len(), "directory_refreshed");
        snapshot
    }

    fn apply_failure(&self, error: FetchError) -> FetchFailure {
        self.metrics.record_fetch_failed();
        let mut state = self.state.lock();

        let delay = match &error {
            FetchError::RateLimited { retry_after: Some(retry_after) } => {
                self.metrics.record_fetch_rate_limited();
                *retry_after
            }
            FetchError::RateLimited { retry_after: None } => {
                self.metrics.record_fetch_rate_limited();
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                backoff_delay(state.consecutive_failures, self.backoff_base, self.backoff_cap)
            }
            FetchError::Transient(_) | FetchError::Decode(_) => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                backoff_delay(state.consecutive_failures, self.backoff_base, self.backoff_cap)
            }
        };

        let now = Instant::now();
        state.suspended_until = Some(now.checked_add(delay).unwrap_or(now + self.backoff_cap));
        if state.snapshot.is_fresh() {
            state.snapshot = Arc::new(state.snapshot.to_stale());
        }
        state.last_error = Some(error.clone());

        log_fetch_failed(&error, state.consecutive_failures, delay, state.snapshot.len());
        FetchFailure { error, fallback: state.snapshot.clone() }
    }

    #[cfg(test)]
    pub(crate) fn expire_suspension(&self) {
        self.state.lock().suspended_until = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{CrossingId, CrossingKind, CrossingStatus, Freshness, Location};
    use crate::io::crossing_api::{parse_retry_after, MAX_RETRY_AFTER};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    fn record(id: &str) -> CrossingRecord {
        CrossingRecord {
            id: CrossingId::from(id),
            name: id.to_uppercase(),
            kind: CrossingKind::Rail,
            status: CrossingStatus::Open,
            location: Location { latitude: 26.46, longitude: -80.07 },
            last_updated: Utc::now(),
            estimated_delay_minutes: None,
            next_update: None,
        }
    }

    /// Replays scripted results; repeats the last one when the script runs out
    struct ScriptedService {
        script: parking_lot::Mutex<VecDeque<Result<Vec<CrossingRecord>, FetchError>>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedService {
        fn new(script: Vec<Result<Vec<CrossingRecord>, FetchError>>) -> Arc<Self> {
            Self::with_delay(script, Duration::ZERO)
        }

        fn with_delay(
            script: Vec<Result<Vec<CrossingRecord>, FetchError>>,
            delay: Duration,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: parking_lot::Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CrossingService for ScriptedService {
        async fn fetch_crossings(&self) -> Result<Vec<CrossingRecord>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop_front().unwrap_or_else(|| Ok(Vec::new()))
            } else {
                script.front().cloned().unwrap_or_else(|| Ok(Vec::new()))
            }
        }
    }

    fn directory(service: Arc<ScriptedService>) -> CrossingDirectory {
        CrossingDirectory::new(service, &Config::default(), Arc::new(Metrics::new()))
    }

    #[test]
    fn test_backoff_delay_schedule() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(60);
        assert_eq!(backoff_delay(0, base, cap), Duration::ZERO);
        assert_eq!(backoff_delay(1, base, cap), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_secs(4));
        assert_eq!(backoff_delay(5, base, cap), Duration::from_secs(32));
        assert_eq!(backoff_delay(6, base, cap), Duration::from_secs(60));
        assert_eq!(backoff_delay(40, base, cap), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_successful_refresh_is_fresh() {
        let service = ScriptedService::new(vec![Ok(vec![record("a"), record("b")])]);
        let dir = directory(service.clone());

        let snapshot = dir.refresh().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.freshness, Freshness::Fresh);
        assert_eq!(service.calls(), 1);
        assert!(dir.suspended_for().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_fetch() {
        let service =
            ScriptedService::with_delay(vec![Ok(vec![record("a")])], Duration::from_millis(50));
        let dir = directory(service.clone());

        let (r1, r2, r3, r4, r5) =
            tokio::join!(dir.refresh(), dir.refresh(), dir.refresh(), dir.refresh(), dir.refresh());

        assert_eq!(service.calls(), 1);
        let first = r1.unwrap();
        for other in [r2, r3, r4, r5] {
            assert!(Arc::ptr_eq(&first, &other.unwrap()));
        }
    }

    #[tokio::test]
    async fn test_joined_callers_share_failure() {
        let service = ScriptedService::with_delay(
            vec![Err(FetchError::Transient("connection refused".to_string()))],
            Duration::from_millis(50),
        );
        let dir = directory(service.clone());

        let (r1, r2) = tokio::join!(dir.refresh(), dir.refresh());
        assert_eq!(service.calls(), 1);
        assert!(r1.is_err());
        assert!(r2.is_err());
    }

    #[tokio::test]
    async fn test_first_failure_yields_empty_stale() {
        let service =
            ScriptedService::new(vec![Err(FetchError::Transient("timeout".to_string()))]);
        let dir = directory(service);

        let failure = dir.refresh().await.unwrap_err();
        assert!(failure.fallback.is_empty());
        assert_eq!(failure.fallback.freshness, Freshness::Stale);
        assert!(matches!(failure.error, FetchError::Transient(_)));
    }

    #[tokio::test]
    async fn test_rate_limit_keeps_records_and_suspends() {
        let service = ScriptedService::new(vec![
            Ok(vec![record("a"), record("b")]),
            Err(FetchError::RateLimited { retry_after: Some(Duration::from_secs(60)) }),
            Ok(vec![record("c")]),
        ]);
        let dir = directory(service.clone());

        let fresh = dir.refresh().await.unwrap();
        let failure = dir.refresh().await.unwrap_err();
        assert_eq!(service.calls(), 2);
        assert_eq!(failure.fallback.records, fresh.records);
        assert_eq!(failure.fallback.freshness, Freshness::Stale);

        let remaining = dir.suspended_for().unwrap();
        assert!(remaining > Duration::from_secs(59));
        assert!(remaining <= Duration::from_secs(60));

        // No network call while the window is open
        let again = dir.refresh().await.unwrap_err();
        assert_eq!(service.calls(), 2);
        assert!(matches!(again.error, FetchError::RateLimited { .. }));
        assert_eq!(again.fallback.records, fresh.records);

        dir.expire_suspension();
        let next = dir.refresh().await.unwrap();
        assert_eq!(service.calls(), 3);
        assert_eq!(next.records[0].id.as_str(), "c");
    }

    #[tokio::test]
    async fn test_transient_failures_back_off_exponentially() {
        let service =
            ScriptedService::new(vec![Err(FetchError::Transient("HTTP 503".to_string()))]);
        let dir = directory(service.clone());

        for expected in [2u64, 4, 8, 16, 32, 60, 60] {
            assert!(dir.refresh().await.is_err());
            let remaining = dir.suspended_for().unwrap();
            assert!(remaining <= Duration::from_secs(expected));
            assert!(remaining > Duration::from_secs(expected) - Duration::from_millis(500));
            dir.expire_suspension();
        }
        assert_eq!(service.calls(), 7);
    }

    #[tokio::test]
    async fn test_rate_limit_without_header_uses_backoff() {
        let service =
            ScriptedService::new(vec![Err(FetchError::RateLimited { retry_after: None })]);
        let dir = directory(service);

        assert!(dir.refresh().await.is_err());
        let remaining = dir.suspended_for().unwrap();
        assert!(remaining <= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_huge_retry_after_header_is_bounded() {
        let retry_after = parse_retry_after("18446744073709551615", Utc::now());
        let service = ScriptedService::new(vec![Err(FetchError::RateLimited { retry_after })]);
        let dir = directory(service.clone());

        assert!(dir.refresh().await.is_err());
        assert!(dir.suspended_for().unwrap() <= MAX_RETRY_AFTER);

        // Still answered from the fallback, no panic and no fetch
        assert!(dir.refresh().await.is_err());
        assert_eq!(service.calls(), 1);
    }

    #[tokio::test]
    async fn test_unrepresentable_suspension_falls_back_to_cap() {
        let service = ScriptedService::new(vec![Err(FetchError::RateLimited {
            retry_after: Some(Duration::MAX),
        })]);
        let dir = directory(service);

        assert!(dir.refresh().await.is_err());
        assert!(dir.suspended_for().unwrap() <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_decode_failure_keeps_previous_records() {
        let service = ScriptedService::new(vec![
            Ok(vec![record("a")]),
            Err(FetchError::Decode("bad timestamp".to_string())),
        ]);
        let dir = directory(service);

        dir.refresh().await.unwrap();
        let failure = dir.refresh().await.unwrap_err();
        assert_eq!(failure.fallback.len(), 1);
        assert!(!failure.fallback.is_fresh());
        assert!(!dir.snapshot().is_fresh());
    }

    #[tokio::test]
    async fn test_success_resets_backoff() {
        let service = ScriptedService::new(vec![
            Err(FetchError::Transient("reset".to_string())),
            Err(FetchError::Transient("reset".to_string())),
            Ok(vec![record("a")]),
            Err(FetchError::Transient("reset".to_string())),
        ]);
        let dir = directory(service);

        for _ in 0..2 {
            assert!(dir.refresh().await.is_err());
            dir.expire_suspension();
        }
        assert!(dir.refresh().await.is_ok());
        assert!(dir.refresh().await.is_err());
        assert!(dir.suspended_for().unwrap() <= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_current_or_refresh_reuses_fresh_cache() {
        let service = ScriptedService::new(vec![Ok(vec![record("a")])]);
        let dir = directory(service.clone());

        dir.current_or_refresh(Duration::from_secs(30)).await.unwrap();
        dir.current_or_refresh(Duration::from_secs(30)).await.unwrap();
        assert_eq!(service.calls(), 1);

        dir.current_or_refresh(Duration::ZERO).await.unwrap();
        assert_eq!(service.calls(), 2);
    }
}
