//! Shared Market-Data Cache
//!
//! Process-wide singleton fronting the upstream pool API for every bot in
//! the process. Three cache classes with separate TTLs (all-pools list,
//! single pool, active-bin snapshot), request coalescing for concurrent
//! misses, minimum spacing between outbound calls, bounded retry with
//! linear backoff, and stale-on-error fallback.
//!
//! Coalescing protocol: the first caller to miss becomes the leader,
//! parks a watch channel in the slot and performs the fetch; followers
//! await the channel. The per-key lock is never held across the fetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Mutex};

use crate::ports::pool_api::{ActiveBin, PoolApi, PoolApiError, PoolInfo};

/// Cache tuning knobs
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub all_pools_ttl: Duration,
    pub pool_ttl: Duration,
    pub active_bin_ttl: Duration,
    /// Minimum spacing between outbound API calls
    pub min_call_spacing: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            all_pools_ttl: Duration::from_secs(15),
            pool_ttl: Duration::from_secs(10),
            active_bin_ttl: Duration::from_secs(5),
            min_call_spacing: Duration::from_millis(500),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl CacheConfig {
    /// Tight timings for tests
    pub fn fast() -> Self {
        Self {
            all_pools_ttl: Duration::from_millis(200),
            pool_ttl: Duration::from_millis(150),
            active_bin_ttl: Duration::from_millis(100),
            min_call_spacing: Duration::from_millis(1),
            max_retries: 2,
            retry_backoff: Duration::from_millis(5),
        }
    }
}

/// Counter snapshot from `stats()`
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub upstream_calls: u64,
    pub stale_served: u64,
    pub errors: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    upstream_calls: AtomicU64,
    stale_served: AtomicU64,
    errors: AtomicU64,
}

type FetchOutcome<T> = Result<T, String>;

/// One cache slot: optional value with its fetch instant, plus the watch
/// receiver of an in-flight fetch when one is running.
struct Slot<T> {
    value: Option<(T, Instant)>,
    inflight: Option<watch::Receiver<Option<FetchOutcome<T>>>>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            value: None,
            inflight: None,
        }
    }
}

struct RateLimiter {
    next_allowed: Option<Instant>,
    spacing: Duration,
}

impl RateLimiter {
    fn new(spacing: Duration) -> Self {
        Self {
            next_allowed: None,
            spacing,
        }
    }
}

pub struct SharedPoolCache {
    api: Arc<dyn PoolApi>,
    config: CacheConfig,
    all_pools: Mutex<Slot<Vec<PoolInfo>>>,
    pools: Mutex<HashMap<String, Slot<PoolInfo>>>,
    bins: Mutex<HashMap<String, (ActiveBin, Instant)>>,
    limiter: Mutex<RateLimiter>,
    counters: Counters,
}

impl SharedPoolCache {
    pub fn new(api: Arc<dyn PoolApi>, config: CacheConfig) -> Self {
        let limiter = RateLimiter::new(config.min_call_spacing);
        Self {
            api,
            config,
            all_pools: Mutex::new(Slot::default()),
            pools: Mutex::new(HashMap::new()),
            bins: Mutex::new(HashMap::new()),
            limiter: Mutex::new(limiter),
            counters: Counters::default(),
        }
    }

    /// Full pool universe, at most `all_pools_ttl` old. A successful fetch
    /// side-populates the single-pool cache at the same instant.
    pub async fn get_all_pools(&self) -> Result<Vec<PoolInfo>, PoolApiError> {
        enum Role {
            Hit(Vec<PoolInfo>),
            Follower(watch::Receiver<Option<FetchOutcome<Vec<PoolInfo>>>>),
            Leader(watch::Sender<Option<FetchOutcome<Vec<PoolInfo>>>>),
        }

        let role = {
            let mut slot = self.all_pools.lock().await;
            if let Some((value, at)) = &slot.value {
                if at.elapsed() < self.config.all_pools_ttl {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    Role::Hit(value.clone())
                } else if let Some(rx) = &slot.inflight {
                    self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    Role::Follower(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(None);
                    slot.inflight = Some(rx);
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    Role::Leader(tx)
                }
            } else if let Some(rx) = &slot.inflight {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                Role::Follower(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                slot.inflight = Some(rx);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Role::Leader(tx)
            }
        };

        match role {
            Role::Hit(value) => Ok(value),
            Role::Follower(rx) => Self::await_leader(rx).await.map_err(PoolApiError::Http),
            Role::Leader(tx) => {
                let api = Arc::clone(&self.api);
                let outcome = self
                    .fetch_with_retry(|| {
                        let api = Arc::clone(&api);
                        async move { api.fetch_all_pools().await }
                    })
                    .await;

                let now = Instant::now();
                let mut slot = self.all_pools.lock().await;
                slot.inflight = None;

                let result = match outcome {
                    Ok(pools) => {
                        slot.value = Some((pools.clone(), now));
                        drop(slot);
                        self.populate_pools(&pools, now).await;
                        Ok(pools)
                    }
                    Err(e) => {
                        self.counters.errors.fetch_add(1, Ordering::Relaxed);
                        if let Some((stale, _)) = &slot.value {
                            tracing::warn!(error = %e, "Pool list fetch failed, serving stale value");
                            self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
                            Ok(stale.clone())
                        } else {
                            Err(e)
                        }
                    }
                };

                let _ = tx.send(Some(
                    result
                        .as_ref()
                        .map(|v| v.clone())
                        .map_err(|e| e.to_string()),
                ));
                result
            }
        }
    }

    /// One pool record, at most `pool_ttl` old
    pub async fn get_pool(&self, address: &str) -> Result<PoolInfo, PoolApiError> {
        enum Role {
            Hit(PoolInfo),
            Follower(watch::Receiver<Option<FetchOutcome<PoolInfo>>>),
            Leader(watch::Sender<Option<FetchOutcome<PoolInfo>>>),
        }

        let role = {
            let mut pools = self.pools.lock().await;
            let slot = pools.entry(address.to_string()).or_default();
            if let Some((value, at)) = &slot.value {
                if at.elapsed() < self.config.pool_ttl {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    Role::Hit(value.clone())
                } else if let Some(rx) = &slot.inflight {
                    self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    Role::Follower(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(None);
                    slot.inflight = Some(rx);
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    Role::Leader(tx)
                }
            } else if let Some(rx) = &slot.inflight {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                Role::Follower(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                slot.inflight = Some(rx);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Role::Leader(tx)
            }
        };

        match role {
            Role::Hit(value) => Ok(value),
            Role::Follower(rx) => Self::await_leader(rx).await.map_err(PoolApiError::Http),
            Role::Leader(tx) => {
                let api = Arc::clone(&self.api);
                let addr = address.to_string();
                let outcome = self
                    .fetch_with_retry(|| {
                        let api = Arc::clone(&api);
                        let addr = addr.clone();
                        async move { api.fetch_pool(&addr).await }
                    })
                    .await;

                let now = Instant::now();
                let mut pools = self.pools.lock().await;
                let slot = pools.entry(address.to_string()).or_default();
                slot.inflight = None;

                let result = match outcome {
                    Ok(pool) => {
                        slot.value = Some((pool.clone(), now));
                        Ok(pool)
                    }
                    Err(e) => {
                        self.counters.errors.fetch_add(1, Ordering::Relaxed);
                        if let Some((stale, _)) = &slot.value {
                            tracing::warn!(
                                pool = address,
                                error = %e,
                                "Pool fetch failed, serving stale value"
                            );
                            self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
                            Ok(stale.clone())
                        } else {
                            Err(e)
                        }
                    }
                };

                let _ = tx.send(Some(
                    result
                        .as_ref()
                        .map(|v| v.clone())
                        .map_err(|e| e.to_string()),
                ));
                result
            }
        }
    }

    /// Store an active-bin snapshot (real or synthesised)
    pub async fn cache_active_bin(&self, address: &str, bin: ActiveBin) {
        self.bins
            .lock()
            .await
            .insert(address.to_string(), (bin, Instant::now()));
    }

    /// Active-bin snapshot if within TTL
    pub async fn get_cached_active_bin(&self, address: &str) -> Option<ActiveBin> {
        let bins = self.bins.lock().await;
        bins.get(address).and_then(|(bin, at)| {
            if at.elapsed() < self.config.active_bin_ttl {
                Some(*bin)
            } else {
                None
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            upstream_calls: self.counters.upstream_calls.load(Ordering::Relaxed),
            stale_served: self.counters.stale_served.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    /// Drop all cached values and counters. Test hook and process-teardown
    /// path; never called on a hot path.
    pub async fn reset(&self) {
        *self.all_pools.lock().await = Slot::default();
        self.pools.lock().await.clear();
        self.bins.lock().await.clear();
        for counter in [
            &self.counters.hits,
            &self.counters.misses,
            &self.counters.coalesced,
            &self.counters.upstream_calls,
            &self.counters.stale_served,
            &self.counters.errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    async fn await_leader<T: Clone>(
        mut rx: watch::Receiver<Option<FetchOutcome<T>>>,
    ) -> Result<T, String> {
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err("in-flight fetch abandoned".to_string());
            }
        }
    }

    async fn populate_pools(&self, pools: &[PoolInfo], at: Instant) {
        let mut map = self.pools.lock().await;
        for pool in pools {
            let slot = map.entry(pool.address.clone()).or_default();
            slot.value = Some((pool.clone(), at));
        }
    }

    /// Rate-limited, retried upstream call. Backoff grows linearly with the
    /// attempt number.
    async fn fetch_with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, PoolApiError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, PoolApiError>>,
    {
        let mut last_err = PoolApiError::Http("no attempts made".to_string());
        for attempt in 1..=self.config.max_retries {
            self.pace().await;
            self.counters.upstream_calls.fetch_add(1, Ordering::Relaxed);
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "Upstream call failed");
                    last_err = e;
                    if attempt < self.config.max_retries {
                        tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    /// Honour the minimum spacing between outbound calls. Each caller
    /// reserves the next slot under the lock, then sleeps outside it.
    async fn pace(&self) {
        let wait_until = {
            let mut limiter = self.limiter.lock().await;
            let now = Instant::now();
            let slot = match limiter.next_allowed {
                Some(next) if next > now => next,
                _ => now,
            };
            limiter.next_allowed = Some(slot + limiter.spacing);
            slot
        };
        let now = Instant::now();
        if wait_until > now {
            tokio::time::sleep(wait_until - now).await;
        }
    }
}
